//! Error types for the TreeFit engine.

use thiserror::Error;

use crate::constraint::ConstraintKind;

/// Errors raised while building a decay tree or running a fit.
///
/// Setup errors (`BadSetup`, `UnknownParticle`, `UnsupportedConstraint`,
/// `MissingMeasurement`) abort construction. Numerical and convergence
/// errors are recorded by the fit manager next to a non-success status.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum TreeFitError {
    /// The decay description cannot be mapped onto a node variant
    #[error("Bad setup: {0}")]
    BadSetup(String),

    /// The particle-property lookup does not know this code
    #[error("Unknown particle code: {0}")]
    UnknownParticle(i32),

    /// A constraint was requested from a node variant that does not carry it
    #[error("Constraint {kind} is not defined for node {node}")]
    UnsupportedConstraint {
        kind: ConstraintKind,
        node: String,
    },

    /// A resolved variant was selected but its measurement payload is absent
    #[error("Missing {expected} measurement for {name}")]
    MissingMeasurement {
        name: String,
        expected: &'static str,
    },

    /// The innovation covariance of a constraint could not be inverted
    #[error("Singular innovation covariance in {kind} constraint of {node}")]
    Inversion {
        kind: ConstraintKind,
        node: String,
    },

    /// A projection hit a degenerate configuration (zero momentum, ...)
    #[error("Degenerate projection: {0}")]
    Degenerate(String),

    /// Chi-square grew by more than the quit threshold between iterations
    #[error("Fast diverging fit (delta chi2 = {0:.3})")]
    FastDivergingFit(f64),

    /// Chi-square grew in too many consecutive iterations
    #[error("Slow diverging fit after {0} iterations")]
    SlowDivergingFit(usize),

    /// The final covariance has a non-positive or non-finite diagonal
    #[error("Covariance matrix is not positive on its diagonal")]
    BadCovariance,
}

impl TreeFitError {
    /// Creates a setup error.
    pub fn bad_setup(msg: impl Into<String>) -> Self {
        Self::BadSetup(msg.into())
    }

    /// Creates an unsupported-constraint error.
    pub fn unsupported(kind: ConstraintKind, node: impl std::fmt::Display) -> Self {
        Self::UnsupportedConstraint {
            kind,
            node: node.to_string(),
        }
    }

    /// Creates an inversion error.
    pub fn inversion(kind: ConstraintKind, node: impl std::fmt::Display) -> Self {
        Self::Inversion {
            kind,
            node: node.to_string(),
        }
    }

    /// True for errors that abort tree construction.
    pub fn is_setup_error(&self) -> bool {
        matches!(
            self,
            Self::BadSetup(_)
                | Self::UnknownParticle(_)
                | Self::UnsupportedConstraint { .. }
                | Self::MissingMeasurement { .. }
        )
    }
}
