//! Tree-construction dispatcher.
//!
//! Decides, per input candidate, which node variant represents it. The
//! decision depends only on the candidate's measurement status, its
//! particle code and nominal lifetime, and the species lists of the
//! configuration.

use serde::{Deserialize, Serialize};

use crate::candidate::{Candidate, Measurement};
use crate::config::FitConfig;
use crate::error::TreeFitError;

/// Flight lengths below this lifetime (ns) are treated as prompt decays:
/// c·1e-5 ns is about 3 µm.
pub const RESONANCE_LIFETIME_CUT: f64 = 1e-5;

/// Classification result.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Variant {
    InternalComposite,
    UnfitComposite,
    UnfitResonance,
    ResolvedTrack,
    ResolvedPhoton,
    ResolvedNeutralCluster,
    ResolvedComposite,
}

/// Resonance classification by lifetime with the fixed exceptions:
/// photon conversions never, electrons (bremsstrahlung) always, D*
/// mesons never. Candidates with a detector index are never resonances.
pub fn is_resonance(pdg_code: i32, mdst_index: Option<usize>, lifetime: f64) -> bool {
    if pdg_code == 0 || mdst_index.is_some() {
        return false;
    }
    match pdg_code.abs() {
        22 => false,
        11 => true,
        413 | 423 => false,
        _ => lifetime < RESONANCE_LIFETIME_CUT,
    }
}

/// Picks the node variant for `candidate`.
///
/// `has_mother` is false only for the head of the decay chain, which is
/// always an internal composite whatever its own measurement status.
pub fn classify(
    candidate: &Candidate,
    has_mother: bool,
    lifetime: f64,
    config: &FitConfig,
) -> Result<Variant, TreeFitError> {
    if !has_mother {
        return require_daughters(candidate, Variant::InternalComposite);
    }

    match &candidate.measurement {
        Some(Measurement::Track { .. }) => return Ok(Variant::ResolvedTrack),
        Some(Measurement::Cluster { .. }) => return Ok(Variant::ResolvedPhoton),
        Some(Measurement::NeutralCluster { .. }) => return Ok(Variant::ResolvedNeutralCluster),
        Some(Measurement::Composite { .. }) => return Ok(Variant::ResolvedComposite),
        None => {}
    }

    if candidate.mdst_index.is_some() {
        return Err(TreeFitError::MissingMeasurement {
            name: format!("candidate {} (pdg {})", candidate.id, candidate.pdg_code),
            expected: "composite",
        });
    }

    let variant = if config.is_fixed_to_mother_vertex(candidate.pdg_code)
        || is_resonance(candidate.pdg_code, candidate.mdst_index, lifetime)
    {
        Variant::UnfitResonance
    } else {
        Variant::UnfitComposite
    };
    require_daughters(candidate, variant)
}

fn require_daughters(candidate: &Candidate, variant: Variant) -> Result<Variant, TreeFitError> {
    if candidate.daughters.is_empty() {
        return Err(TreeFitError::bad_setup(format!(
            "candidate {} (pdg {}) has neither a measurement nor daughters",
            candidate.id, candidate.pdg_code
        )));
    }
    Ok(variant)
}
