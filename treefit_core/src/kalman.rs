//! Kalman update of the global state by one projected constraint.

use nalgebra::{DMatrix, DVector};

use crate::fit_params::FitParams;
use crate::projection::Projection;

/// Gain and inverse innovation covariance for one linearised constraint.
///
/// The calculator is built against the covariance *before* the update; the
/// state and covariance updates can then be applied in either order.
#[derive(Debug, Clone)]
pub struct KalmanCalculator {
    /// K = C Hᵀ R⁻¹
    gain: DMatrix<f64>,
    /// R⁻¹ with R = H C Hᵀ + V
    r_inv: DMatrix<f64>,
}

impl KalmanCalculator {
    /// Builds the gain for `projection` against `covariance`.
    ///
    /// Returns None if the innovation covariance is not positive definite.
    pub fn calculate_gain_matrix(
        projection: &Projection,
        covariance: &DMatrix<f64>,
    ) -> Option<Self> {
        let ch_t = covariance * projection.h.transpose();
        let mut r = &projection.h * &ch_t;
        if let Some(v) = &projection.v {
            r += v;
        }

        let r_chol = r.cholesky()?;
        let r_inv = r_chol.inverse();
        let gain = ch_t * &r_inv;
        Some(Self { gain, r_inv })
    }

    /// r R⁻¹ r for the effective residuals.
    pub fn chi_square(&self, residuals: &DVector<f64>) -> f64 {
        residuals.dot(&(&self.r_inv * residuals))
    }

    /// x ← x − K r
    pub fn updated_state(&self, state: &DVector<f64>, residuals: &DVector<f64>) -> DVector<f64> {
        state - &self.gain * residuals
    }

    /// C ← (I − K H) C (I − K H)ᵀ + K V Kᵀ
    pub fn update_covariance(&self, fit_params: &mut FitParams, projection: &Projection) {
        let dim = fit_params.dim();
        let ikh = DMatrix::identity(dim, dim) - &self.gain * &projection.h;
        let mut covariance = &ikh * &fit_params.covariance * ikh.transpose();
        if let Some(v) = &projection.v {
            covariance += &self.gain * v * self.gain.transpose();
        }
        fit_params.covariance = covariance;
        fit_params.symmetrize();
    }
}
