//! Linearisation of one constraint at the current state.

use nalgebra::{DMatrix, DVector};

/// Residuals and Jacobian of one constraint.
///
/// `h` always spans the full state vector; only the columns owned by the
/// participating nodes are non-zero. A projection lives for one constraint
/// application and is dropped afterwards.
#[derive(Debug, Clone)]
pub struct Projection {
    /// One entry per scalar constraint equation
    pub residuals: DVector<f64>,

    /// d(residuals)/d(state), shape (constraint dim × state dim)
    pub h: DMatrix<f64>,

    /// Measurement covariance; None for exact constraints
    pub v: Option<DMatrix<f64>>,
}

impl Projection {
    pub fn new(constraint_dim: usize, state_dim: usize) -> Self {
        Self {
            residuals: DVector::zeros(constraint_dim),
            h: DMatrix::zeros(constraint_dim, state_dim),
            v: None,
        }
    }

    pub fn dim(&self) -> usize {
        self.residuals.len()
    }

    /// Sets the measurement covariance, allocating it if needed.
    pub fn v_mut(&mut self) -> &mut DMatrix<f64> {
        let dim = self.dim();
        self.v.get_or_insert_with(|| DMatrix::zeros(dim, dim))
    }

    /// Residuals linearised around `reference` and evaluated at `state`:
    /// `r(reference) + H (state - reference)`.
    pub fn residuals_at(&self, state: &DVector<f64>, reference: &DVector<f64>) -> DVector<f64> {
        &self.residuals + &self.h * (state - reference)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_linearised_residuals() {
        let mut p = Projection::new(1, 2);
        p.residuals[0] = 1.0;
        p.h[(0, 0)] = 2.0;
        p.h[(0, 1)] = -1.0;

        let reference = DVector::from_vec(vec![1.0, 1.0]);
        let state = DVector::from_vec(vec![1.5, 2.0]);

        // 1 + 2*0.5 - 1*1 = 1
        assert_eq!(p.residuals_at(&state, &reference)[0], 1.0);
    }

    #[test]
    fn test_measurement_covariance_allocated_on_demand() {
        let mut p = Projection::new(2, 3);
        assert!(p.v.is_none());
        p.v_mut()[(0, 0)] = 1.0;
        assert_eq!(p.v.as_ref().map(|v| v.shape()), Some((2, 2)));
    }
}
