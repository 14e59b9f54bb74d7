//! The global state of one fit.

use std::collections::BTreeMap;

use nalgebra::{DMatrix, DVector};
use serde::{Deserialize, Serialize};

use crate::particle::NodeId;

/// State vector and covariance for a whole decay tree.
///
/// Every node owns a contiguous slice of the state vector, addressed through
/// the indices assigned by `DecayTree::update_index`. All reads and writes of
/// one iteration go through the same instance.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FitParams {
    /// Parameters of all nodes, in index order
    pub state_vector: DVector<f64>,

    /// Symmetric covariance of `state_vector`
    pub covariance: DMatrix<f64>,

    /// Chi-square accumulated by the constraints of the current pass
    chi_square: f64,

    /// Number of scalar constraint equations applied in the current pass
    n_constraints: usize,

    /// Chi-square attributed to the node owning each constraint
    node_chi_square: BTreeMap<NodeId, f64>,

    /// Constraint rows attributed to each node
    node_constraints: BTreeMap<NodeId, usize>,
}

impl FitParams {
    /// Zero state and covariance of dimension `dim`.
    pub fn new(dim: usize) -> Self {
        Self {
            state_vector: DVector::zeros(dim),
            covariance: DMatrix::zeros(dim, dim),
            chi_square: 0.0,
            n_constraints: 0,
            node_chi_square: BTreeMap::new(),
            node_constraints: BTreeMap::new(),
        }
    }

    pub fn dim(&self) -> usize {
        self.state_vector.len()
    }

    pub fn chi_square(&self) -> f64 {
        self.chi_square
    }

    pub fn n_constraints(&self) -> usize {
        self.n_constraints
    }

    /// Constraint equations minus free parameters.
    pub fn n_dof(&self) -> i64 {
        self.n_constraints as i64 - self.dim() as i64
    }

    /// Records the outcome of one constraint owned by `node`.
    pub fn add_chi_square(&mut self, node: NodeId, chi_square: f64, n_constraints: usize) {
        self.chi_square += chi_square;
        self.n_constraints += n_constraints;
        *self.node_chi_square.entry(node).or_insert(0.0) += chi_square;
        *self.node_constraints.entry(node).or_insert(0) += n_constraints;
    }

    /// Chi-square of the constraints owned by `node` alone.
    pub fn node_chi_square(&self, node: NodeId) -> f64 {
        self.node_chi_square.get(&node).copied().unwrap_or(0.0)
    }

    /// Constraint rows owned by `node` alone.
    pub fn node_constraints(&self, node: NodeId) -> usize {
        self.node_constraints.get(&node).copied().unwrap_or(0)
    }

    /// Clears covariance and the chi-square ledgers, keeping the state.
    pub fn reset_covariance(&mut self) {
        self.covariance.fill(0.0);
        self.chi_square = 0.0;
        self.n_constraints = 0;
        self.node_chi_square.clear();
        self.node_constraints.clear();
    }

    /// True if every variance is finite and strictly positive.
    pub fn test_covariance(&self) -> bool {
        self.covariance
            .diagonal()
            .iter()
            .all(|v| v.is_finite() && *v > 0.0)
    }

    /// Error of parameter `index` (square root of its variance).
    pub fn error(&self, index: usize) -> f64 {
        self.covariance[(index, index)].max(0.0).sqrt()
    }

    /// Restores exact symmetry after an update.
    pub fn symmetrize(&mut self) {
        let transposed = self.covariance.transpose();
        self.covariance += transposed;
        self.covariance *= 0.5;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ledger() {
        let mut params = FitParams::new(6);
        params.add_chi_square(NodeId(0), 1.5, 3);
        params.add_chi_square(NodeId(1), 0.5, 4);
        params.add_chi_square(NodeId(0), 1.0, 1);

        assert_eq!(params.chi_square(), 3.0);
        assert_eq!(params.n_constraints(), 8);
        assert_eq!(params.n_dof(), 2);
        assert_eq!(params.node_chi_square(NodeId(0)), 2.5);
        assert_eq!(params.node_constraints(NodeId(1)), 4);
        assert_eq!(params.node_chi_square(NodeId(7)), 0.0);
    }

    #[test]
    fn test_reset_keeps_state() {
        let mut params = FitParams::new(3);
        params.state_vector[1] = 4.0;
        params.covariance[(1, 1)] = 2.0;
        params.add_chi_square(NodeId(0), 1.0, 3);

        params.reset_covariance();

        assert_eq!(params.state_vector[1], 4.0);
        assert_eq!(params.covariance[(1, 1)], 0.0);
        assert_eq!(params.chi_square(), 0.0);
        assert_eq!(params.n_constraints(), 0);
    }

    #[test]
    fn test_covariance_check() {
        let mut params = FitParams::new(2);
        assert!(!params.test_covariance());
        params.covariance = DMatrix::identity(2, 2);
        assert!(params.test_covariance());
        params.covariance[(1, 1)] = f64::NAN;
        assert!(!params.test_covariance());
    }
}
