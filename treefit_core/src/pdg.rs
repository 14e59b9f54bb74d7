//! Particle-property lookup.
//!
//! The fitter only needs nominal mass, lifetime and charge per particle
//! code. The lookup is read-only and side-effect free; [`PdgTable`] ships the
//! species used by common decay chains.

use std::collections::HashMap;
use std::sync::Arc;

/// Speed of light in cm/ns.
pub const SPEED_OF_LIGHT: f64 = 29.979_245_8;

/// Reduced Planck constant in GeV·ns, for width → lifetime conversion.
const HBAR_GEV_NS: f64 = 6.582_119_569e-16;

/// Nominal properties of one species.
#[derive(Debug, Clone, PartialEq)]
pub struct ParticleInfo {
    pub name: String,
    /// Mass in GeV
    pub mass: f64,
    /// Mean lifetime in ns (0 for stable species)
    pub lifetime: f64,
    /// Charge in units of e
    pub charge: i32,
}

/// Read-only particle-property service.
pub trait ParticleProperties {
    /// Properties of `pdg_code`; antiparticles carry the opposite charge.
    fn lookup(&self, pdg_code: i32) -> Option<ParticleInfo>;
}

pub type SharedProperties = Arc<dyn ParticleProperties + Send + Sync>;

/// Built-in table keyed by the absolute particle code.
#[derive(Debug, Clone)]
pub struct PdgTable {
    entries: HashMap<i32, ParticleInfo>,
}

impl PdgTable {
    /// An empty table.
    pub fn empty() -> Self {
        Self {
            entries: HashMap::new(),
        }
    }

    /// Registers a species by its particle (positive) code.
    pub fn insert(&mut self, pdg_code: i32, name: &str, mass: f64, lifetime: f64, charge: i32) {
        self.entries.insert(
            pdg_code.abs(),
            ParticleInfo {
                name: name.to_string(),
                mass,
                lifetime,
                charge,
            },
        );
    }

    /// Registers a short-lived species by its total width in GeV.
    pub fn insert_with_width(
        &mut self,
        pdg_code: i32,
        name: &str,
        mass: f64,
        width: f64,
        charge: i32,
    ) {
        self.insert(pdg_code, name, mass, HBAR_GEV_NS / width, charge);
    }

    pub fn shared(self) -> SharedProperties {
        Arc::new(self)
    }
}

impl Default for PdgTable {
    fn default() -> Self {
        let mut table = Self::empty();
        // Leptons (charge of the particle, not the antiparticle)
        table.insert(11, "e-", 0.000_510_999, 0.0, -1);
        table.insert(13, "mu-", 0.105_658_4, 2197.03, -1);
        // Light hadrons
        table.insert(22, "gamma", 0.0, 0.0, 0);
        table.insert(211, "pi+", 0.139_570_39, 26.033, 1);
        table.insert(111, "pi0", 0.134_976_8, 8.52e-8, 0);
        table.insert(321, "K+", 0.493_677, 12.38, 1);
        table.insert(310, "K_S0", 0.497_611, 0.089_54, 0);
        table.insert(130, "K_L0", 0.497_611, 51.16, 0);
        table.insert(2212, "p+", 0.938_272_088, 0.0, 1);
        table.insert(3122, "Lambda0", 1.115_683, 0.2632, 0);
        table.insert_with_width(221, "eta", 0.547_862, 1.31e-6, 0);
        table.insert_with_width(113, "rho0", 0.775_26, 0.1491, 0);
        table.insert_with_width(333, "phi", 1.019_461, 4.249e-3, 0);
        // Charm
        table.insert(421, "D0", 1.864_84, 4.101e-4, 0);
        table.insert(411, "D+", 1.869_66, 1.040e-3, 1);
        table.insert(431, "D_s+", 1.968_35, 5.04e-4, 1);
        table.insert_with_width(413, "D*+", 2.010_26, 8.34e-5, 1);
        table.insert_with_width(423, "D*0", 2.006_85, 2.1e-3, 0);
        table.insert_with_width(443, "J/psi", 3.096_9, 9.26e-5, 0);
        // Beauty
        table.insert(511, "B0", 5.279_65, 1.519e-3, 0);
        table.insert(521, "B+", 5.279_34, 1.638e-3, 1);
        table.insert_with_width(300553, "Upsilon(4S)", 10.579_4, 2.05e-2, 0);
        table
    }
}

impl ParticleProperties for PdgTable {
    fn lookup(&self, pdg_code: i32) -> Option<ParticleInfo> {
        let info = self.entries.get(&pdg_code.abs())?;
        let mut info = info.clone();
        if pdg_code < 0 {
            info.charge = -info.charge;
            info.name = antiparticle_name(&info.name);
        }
        Some(info)
    }
}

fn antiparticle_name(name: &str) -> String {
    if let Some(stem) = name.strip_suffix('+') {
        format!("{stem}-")
    } else if let Some(stem) = name.strip_suffix('-') {
        format!("{stem}+")
    } else {
        format!("anti-{name}")
    }
}
