//! Constraints and their application to the global state.

use std::cmp::Reverse;
use std::fmt;

use serde::{Deserialize, Serialize};
use tracing::trace;

use crate::error::TreeFitError;
use crate::fit_params::FitParams;
use crate::kalman::KalmanCalculator;
use crate::particle::NodeId;
use crate::projection::Projection;
use crate::tree::DecayTree;

/// Chi-square change below which the local iteration of one constraint stops.
const LOCAL_PRECISION: f64 = 1e-3;

/// Constraint types, in the order they are applied at equal depth.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConstraintKind {
    Beamspot,
    Track,
    Photon,
    NeutralCluster,
    Composite,
    Geometric,
    Kinematic,
    Mass,
}

impl ConstraintKind {
    pub const ALL: [ConstraintKind; 8] = [
        ConstraintKind::Beamspot,
        ConstraintKind::Track,
        ConstraintKind::Photon,
        ConstraintKind::NeutralCluster,
        ConstraintKind::Composite,
        ConstraintKind::Geometric,
        ConstraintKind::Kinematic,
        ConstraintKind::Mass,
    ];

    /// Kinds whose projection does not depend on the linearisation point.
    pub fn is_linear(self) -> bool {
        matches!(
            self,
            ConstraintKind::Beamspot | ConstraintKind::Track | ConstraintKind::Composite
        )
    }

    pub fn name(self) -> &'static str {
        match self {
            ConstraintKind::Beamspot => "beamspot",
            ConstraintKind::Track => "track",
            ConstraintKind::Photon => "photon",
            ConstraintKind::NeutralCluster => "neutral_cluster",
            ConstraintKind::Composite => "composite",
            ConstraintKind::Geometric => "geometric",
            ConstraintKind::Kinematic => "kinematic",
            ConstraintKind::Mass => "mass",
        }
    }
}

impl fmt::Display for ConstraintKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// One constraint owned by one node.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Constraint {
    pub node: NodeId,
    pub kind: ConstraintKind,
    /// Distance of the owning node from the root
    pub depth: usize,
    /// Number of scalar equations
    pub dim: usize,
    /// Local re-linearisations during the first global pass
    pub max_iterations: usize,
}

impl Constraint {
    pub fn new(node: NodeId, kind: ConstraintKind, depth: usize, dim: usize) -> Self {
        Self {
            node,
            kind,
            depth,
            dim,
            max_iterations: if kind.is_linear() { 1 } else { 3 },
        }
    }

    /// Sort key: deepest first, then by kind.
    pub fn priority(&self) -> (Reverse<usize>, ConstraintKind) {
        (Reverse(self.depth), self.kind)
    }

    /// Applies the constraint with local re-linearisation.
    ///
    /// Each step projects at the latest estimate and re-applies the gain to
    /// the prior state, so the covariance is updated only once. Stops when
    /// the chi-square settles, grows, or `max_iterations` is reached.
    pub fn filter(
        &self,
        tree: &DecayTree,
        fit_params: &mut FitParams,
    ) -> Result<(), TreeFitError> {
        let prior = fit_params.state_vector.clone();
        let mut accepted: Option<(Projection, KalmanCalculator, f64)> = None;

        for iteration in 0..self.max_iterations {
            let projection = tree.project_constraint(self, fit_params)?;
            let residuals = projection.residuals_at(&prior, &fit_params.state_vector);
            let kalman =
                KalmanCalculator::calculate_gain_matrix(&projection, &fit_params.covariance)
                    .ok_or_else(|| TreeFitError::inversion(self.kind, &tree[self.node].name))?;
            let chi_square = kalman.chi_square(&residuals);

            let previous = accepted.as_ref().map(|(_, _, chi2)| *chi2);
            if let Some(previous) = previous {
                if chi_square > previous + LOCAL_PRECISION {
                    trace!(
                        "{} constraint of {} diverging at step {iteration}",
                        self.kind,
                        tree[self.node].name
                    );
                    break;
                }
            }

            let state = kalman.updated_state(&prior, &residuals);
            let before = fit_params.state_vector.clone();
            fit_params.state_vector = state;
            accepted = Some((projection, kalman, chi_square));

            if previous.is_some_and(|p| (chi_square - p).abs() < LOCAL_PRECISION) {
                break;
            }
            // Linear kinds and vanishing updates need no further step
            if (&fit_params.state_vector - before).amax() == 0.0 {
                break;
            }
        }

        match accepted {
            Some((projection, kalman, chi_square)) => {
                kalman.update_covariance(fit_params, &projection);
                fit_params.add_chi_square(self.node, chi_square, self.dim);
                Ok(())
            }
            None => Err(TreeFitError::inversion(self.kind, &tree[self.node].name)),
        }
    }

    /// Applies the constraint linearised around `reference`.
    pub fn filter_with_reference(
        &self,
        tree: &DecayTree,
        fit_params: &mut FitParams,
        reference: &FitParams,
    ) -> Result<(), TreeFitError> {
        let projection = tree.project_constraint(self, reference)?;
        let residuals = projection.residuals_at(&fit_params.state_vector, &reference.state_vector);
        let kalman = KalmanCalculator::calculate_gain_matrix(&projection, &fit_params.covariance)
            .ok_or_else(|| TreeFitError::inversion(self.kind, &tree[self.node].name))?;

        let chi_square = kalman.chi_square(&residuals);
        fit_params.state_vector = kalman.updated_state(&fit_params.state_vector, &residuals);
        kalman.update_covariance(fit_params, &projection);
        fit_params.add_chi_square(self.node, chi_square, self.dim);
        Ok(())
    }
}
