//! TreeFit Simulation Harness
//!
//! Generates synthetic particle decays with known truth, runs them through
//! the TreeFit engine and checks the fit statistics:
//! - **Oracle**: two-body decay kinematics, exponential flight, detector smearing
//! - **Scenarios**: fixed decay chains with matching fit configurations
//! - **Runner**: convergence rate, chi2/ndf and vertex pulls per scenario
//!
//! # Usage
//!
//! ```ignore
//! use treefit_sim::{ScenarioRunner, scenarios::ScenarioId};
//!
//! let result = ScenarioRunner::new(42).with_events(500).run(ScenarioId::BKsPi0);
//! assert!(result.passed);
//! ```

pub mod error;
mod oracle;
mod runner;
pub mod scenarios;

pub use error::SimError;
pub use oracle::{
    boost, two_body_momentum, DecayOracle, DecaySpec, DetectorResolution, GeneratedEvent,
    TruthParticle,
};
pub use runner::{Acceptance, ScenarioMetrics, ScenarioResult, ScenarioRunner};
