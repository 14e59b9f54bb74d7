//! TreeFit Core - Global Decay-Chain Vertex and Kinematic Fitter
//!
//! Fits every vertex, momentum and flight distance of a particle decay
//! chain simultaneously:
//! 1. **Decay tree**: candidates are mapped onto node variants that own
//!    slices of one global state vector (`tree`, `dispatch`, `particle`)
//! 2. **Constraints**: measurements, vertex geometry, momentum conservation
//!    and mass hypotheses are linearised into projections (`projectors`)
//! 3. **Kalman filter**: constraints are applied as sequential Kalman
//!    updates and iterated to convergence (`constraint`, `kalman`,
//!    `fit_manager`)
//!
//! Units are GeV, cm and ns throughout.

pub mod candidate;
pub mod config;
pub mod constraint;
pub mod decay_chain;
pub mod dispatch;
pub mod error;
pub mod fit_manager;
pub mod fit_params;
pub mod kalman;
pub mod particle;
pub mod pdg;
pub mod projection;
mod projectors;
pub mod tree;

// Re-export key types for convenience
pub use candidate::{Candidate, CandidateId, Measurement};
pub use config::{FitConfig, InitConfig, MassConstraintMode, OriginConfig};
pub use constraint::{Constraint, ConstraintKind};
pub use decay_chain::DecayChain;
pub use error::TreeFitError;
pub use fit_manager::{FitManager, FitStatus, FitSummary, FittedParticle};
pub use fit_params::FitParams;
pub use particle::{NodeId, NodeKind, ParticleNode};
pub use pdg::{ParticleInfo, ParticleProperties, PdgTable, SharedProperties, SPEED_OF_LIGHT};
pub use projection::Projection;
pub use tree::DecayTree;
