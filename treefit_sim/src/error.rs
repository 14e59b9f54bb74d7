//! Error types for the simulation harness and CLI.

use thiserror::Error;
use treefit_core::TreeFitError;

/// Errors that can occur while generating events or driving fits.
#[derive(Debug, Error)]
pub enum SimError {
    /// The particle table does not know this code
    #[error("Unknown particle code: {0}")]
    UnknownParticle(i32),

    /// Only two-body decays can be generated
    #[error("Particle {0} must decay into exactly two daughters")]
    UnsupportedDecay(i32),

    /// Decay below threshold
    #[error("Mass {mass} cannot decay into {m1} + {m2}")]
    Kinematics { mass: f64, m1: f64, m2: f64 },

    /// Scenario name not recognised
    #[error("Unknown scenario: {0}")]
    UnknownScenario(String),

    /// Fit construction failed
    #[error("Fit setup failed: {0}")]
    Fit(#[from] TreeFitError),

    /// Reading an input file failed
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Input is not valid JSON for the expected type
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl SimError {
    /// Creates an unknown-scenario error.
    pub fn unknown_scenario(name: impl std::fmt::Display) -> Self {
        Self::UnknownScenario(name.to_string())
    }
}
