//! Fit configuration.
//!
//! One immutable [`FitConfig`] is fixed before any fit starts and shared by
//! every node and projector of a session. Nothing here is mutated during a
//! fit.

use serde::{Deserialize, Serialize};

use crate::constraint::ConstraintKind;

/// Selects how a mass constraint is linearised.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MassConstraintMode {
    /// Constrain the node's own 4-momentum state
    #[default]
    Particle,
    /// Constrain the summed 4-momenta of the immediate daughters
    Daughters,
}

/// Beam-spot (or custom origin) used to seed the root of the tree.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OriginConfig {
    /// Origin position [x, y, z] in cm
    pub position: [f64; 3],

    /// 3×3 position covariance in cm²
    pub covariance: [[f64; 3]; 3],
}

impl OriginConfig {
    /// A beam spot with a diagonal covariance.
    pub fn with_sigmas(position: [f64; 3], sigmas: [f64; 3]) -> Self {
        let mut covariance = [[0.0; 3]; 3];
        for (i, sigma) in sigmas.iter().enumerate() {
            covariance[i][i] = sigma * sigma;
        }
        Self {
            position,
            covariance,
        }
    }
}

/// Starting values for the state vector and covariance.
///
/// These are empirical tuning constants: the filter is expected to sharpen
/// the parameters through iteration, not through a good prior.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct InitConfig {
    /// Position variance seed (default: 50 cm²)
    pub position_variance: f64,

    /// Momentum/energy variance seed (default: 0.5 GeV²)
    pub momentum_variance: f64,

    /// Flight-distance variance seed (default: 1000 cm²)
    pub tau_variance: f64,

    /// Multiplier on `lifetime·c/mass` for the flight-distance seed (default: 100)
    pub tau_seed_factor: f64,
}

impl Default for InitConfig {
    fn default() -> Self {
        Self {
            position_variance: 50.0,
            momentum_variance: 0.5,
            tau_variance: 1000.0,
            tau_seed_factor: 100.0,
        }
    }
}

/// Configuration of one fit session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FitConfig {
    /// Mass constraint linearisation (default: Particle)
    pub mass_constraint_mode: MassConstraintMode,

    /// PDG codes (absolute values) that receive a mass constraint
    pub mass_constraint_list: Vec<i32>,

    /// PDG codes with a geometric constraint; empty means every composite
    pub geo_constraint_list: Vec<i32>,

    /// PDG codes whose decay vertex is forced onto the mother's vertex
    pub fixed_to_mother_vertex_list: Vec<i32>,

    /// Constraint kinds removed from every tree
    pub disabled_constraints: Vec<ConstraintKind>,

    /// Beam spot attached as the root of the tree
    pub origin: Option<OriginConfig>,

    /// Convergence threshold on the chi-square change (default: 0.001)
    pub precision: f64,

    /// Maximum number of global iterations (default: 10)
    pub max_iterations: usize,

    /// Consecutive chi-square increases tolerated (default: 3)
    pub max_diverging: usize,

    /// Seeds for the initial state and covariance
    pub init: InitConfig,
}

impl Default for FitConfig {
    fn default() -> Self {
        Self {
            mass_constraint_mode: MassConstraintMode::Particle,
            mass_constraint_list: Vec::new(),
            geo_constraint_list: Vec::new(),
            fixed_to_mother_vertex_list: Vec::new(),
            disabled_constraints: Vec::new(),
            origin: None,
            precision: 0.001,
            max_iterations: 10,
            max_diverging: 3,
            init: InitConfig::default(),
        }
    }
}

impl FitConfig {
    /// Adds a mass constraint for a species.
    pub fn with_mass_constraint(mut self, pdg_code: i32) -> Self {
        self.mass_constraint_list.push(pdg_code.abs());
        self
    }

    /// Attaches a beam spot.
    pub fn with_origin(mut self, origin: OriginConfig) -> Self {
        self.origin = Some(origin);
        self
    }

    /// Selects the mass constraint mode.
    pub fn with_mass_constraint_mode(mut self, mode: MassConstraintMode) -> Self {
        self.mass_constraint_mode = mode;
        self
    }

    pub fn is_mass_constrained(&self, pdg_code: i32) -> bool {
        self.mass_constraint_list.contains(&pdg_code.abs())
    }

    pub fn is_geo_constrained(&self, pdg_code: i32) -> bool {
        self.geo_constraint_list.is_empty() || self.geo_constraint_list.contains(&pdg_code.abs())
    }

    pub fn is_fixed_to_mother_vertex(&self, pdg_code: i32) -> bool {
        self.fixed_to_mother_vertex_list.contains(&pdg_code.abs())
    }

    pub fn is_disabled(&self, kind: ConstraintKind) -> bool {
        self.disabled_constraints.contains(&kind)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = FitConfig::default();
        assert_eq!(config.mass_constraint_mode, MassConstraintMode::Particle);
        assert_eq!(config.max_iterations, 10);
        assert_eq!(config.init.position_variance, 50.0);
        assert_eq!(config.init.tau_seed_factor, 100.0);
        assert!(config.origin.is_none());
    }

    #[test]
    fn test_species_lists_use_absolute_codes() {
        let mut config = FitConfig::default().with_mass_constraint(-421);
        config.geo_constraint_list.push(310);

        assert!(config.is_mass_constrained(421));
        assert!(config.is_mass_constrained(-421));
        assert!(config.is_geo_constrained(-310));
        assert!(!config.is_geo_constrained(421));
    }

    #[test]
    fn test_partial_json_uses_defaults() {
        let json = r#"{"mass_constraint_mode": "daughters", "mass_constraint_list": [111]}"#;
        let config: FitConfig = serde_json::from_str(json).unwrap();
        assert_eq!(config.mass_constraint_mode, MassConstraintMode::Daughters);
        assert!(config.is_mass_constrained(111));
        assert_eq!(config.precision, 0.001);
    }
}
