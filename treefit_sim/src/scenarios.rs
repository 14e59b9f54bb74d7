//! Decay scenarios for simulation runs.

use nalgebra::Vector3;
use treefit_core::{FitConfig, OriginConfig};

use crate::error::SimError;
use crate::oracle::DecaySpec;

/// Scenario identifiers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ScenarioId {
    /// D0 -> K- pi+, single displaced vertex
    TwoBody,

    /// K_S0 -> pi+ pi- with a mass constraint
    KShort,

    /// D*+ -> D0(K- pi+) pi+, slow pion at the D* vertex
    DStar,

    /// B0 -> J/psi(mu+ mu-) K_S0(pi+ pi-) from the beam spot
    BJpsiKs,

    /// B0 -> K_S0(pi+ pi-) pi0(gamma gamma) from the beam spot
    BKsPi0,
}

impl ScenarioId {
    /// Returns a list of all scenarios.
    pub fn all() -> Vec<ScenarioId> {
        vec![
            ScenarioId::TwoBody,
            ScenarioId::KShort,
            ScenarioId::DStar,
            ScenarioId::BJpsiKs,
            ScenarioId::BKsPi0,
        ]
    }

    /// Returns the scenario name.
    pub fn name(&self) -> &'static str {
        match self {
            ScenarioId::TwoBody => "two_body",
            ScenarioId::KShort => "kshort",
            ScenarioId::DStar => "dstar",
            ScenarioId::BJpsiKs => "b_jpsi_ks",
            ScenarioId::BKsPi0 => "b_ks_pi0",
        }
    }

    /// Returns a description of the scenario.
    pub fn description(&self) -> &'static str {
        match self {
            ScenarioId::TwoBody => "D0 -> K- pi+ vertex fit",
            ScenarioId::KShort => "K_S0 -> pi+ pi- with K_S0 mass constraint",
            ScenarioId::DStar => "D*+ -> D0(K- pi+) pi+ with D0 flight",
            ScenarioId::BJpsiKs => "B0 -> J/psi(mu mu) K_S0(pi pi) with beam spot and J/psi mass",
            ScenarioId::BKsPi0 => "B0 -> K_S0(pi pi) pi0(gamma gamma) with beam spot and pi0 mass",
        }
    }

    /// The decay generated for this scenario.
    pub fn decay(&self) -> DecaySpec {
        let k_pi = || DecaySpec::decay(421, DecaySpec::stable(-321), DecaySpec::stable(211));
        let ks = || DecaySpec::decay(310, DecaySpec::stable(211), DecaySpec::stable(-211));
        match self {
            ScenarioId::TwoBody => k_pi(),
            ScenarioId::KShort => ks(),
            ScenarioId::DStar => DecaySpec::decay(413, k_pi(), DecaySpec::stable(211)),
            ScenarioId::BJpsiKs => DecaySpec::decay(
                511,
                DecaySpec::decay(443, DecaySpec::stable(13), DecaySpec::stable(-13)),
                ks(),
            ),
            ScenarioId::BKsPi0 => DecaySpec::decay(
                511,
                ks(),
                DecaySpec::decay(111, DecaySpec::stable(22), DecaySpec::stable(22)),
            ),
        }
    }

    /// Mean lab momentum of the head (GeV).
    pub fn head_momentum(&self) -> Vector3<f64> {
        match self {
            ScenarioId::TwoBody => Vector3::new(0.4, 0.2, 2.5),
            ScenarioId::KShort => Vector3::new(0.3, -0.4, 1.2),
            ScenarioId::DStar => Vector3::new(0.5, 0.3, 2.8),
            ScenarioId::BJpsiKs | ScenarioId::BKsPi0 => Vector3::new(0.1, 0.05, 1.4),
        }
    }

    /// Beam spot for scenarios that fit the head's flight from the origin.
    pub fn beam_spot(&self) -> Option<OriginConfig> {
        match self {
            ScenarioId::BJpsiKs | ScenarioId::BKsPi0 => {
                Some(OriginConfig::with_sigmas([0.0; 3], [0.001, 0.0005, 0.03]))
            }
            _ => None,
        }
    }

    /// Fit configuration matching the generated decay.
    pub fn fit_config(&self) -> FitConfig {
        let config = match self {
            ScenarioId::TwoBody | ScenarioId::DStar => FitConfig::default(),
            ScenarioId::KShort => FitConfig::default().with_mass_constraint(310),
            ScenarioId::BJpsiKs => FitConfig::default().with_mass_constraint(443),
            ScenarioId::BKsPi0 => FitConfig::default().with_mass_constraint(111),
        };
        match self.beam_spot() {
            Some(origin) => config.with_origin(origin),
            None => config,
        }
    }
}

impl std::fmt::Display for ScenarioId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

impl std::str::FromStr for ScenarioId {
    type Err = SimError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "two_body" | "twobody" | "d0" => Ok(ScenarioId::TwoBody),
            "kshort" | "k_short" | "ks" => Ok(ScenarioId::KShort),
            "dstar" | "d_star" => Ok(ScenarioId::DStar),
            "b_jpsi_ks" | "bjpsiks" => Ok(ScenarioId::BJpsiKs),
            "b_ks_pi0" | "bkspi0" => Ok(ScenarioId::BKsPi0),
            _ => Err(SimError::unknown_scenario(s)),
        }
    }
}
