//! Input decay descriptions.
//!
//! A [`Candidate`] is one reconstructed particle together with its ordered
//! daughters. Leaves carry the detector measurement the fitter consumes
//! read-only; intermediate states usually carry nothing.

use nalgebra::{Matrix3, Matrix4, Matrix6, SMatrix, Vector3, Vector4};
use serde::{Deserialize, Serialize};

/// 7×7 matrix in (x, y, z, px, py, pz, E) order.
pub type Matrix7 = SMatrix<f64, 7, 7>;

/// Stable identifier of a candidate in the external measurement store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct CandidateId(pub u32);

impl std::fmt::Display for CandidateId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// A direct detector measurement.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Measurement {
    /// Charged-track fit: a reference point on the trajectory and the momentum there
    Track {
        position: [f64; 3],
        momentum: [f64; 3],
        /// (x, y, z, px, py, pz)
        covariance: [[f64; 6]; 6],
    },
    /// Calorimeter cluster: impact point and deposited energy
    Cluster {
        position: [f64; 3],
        energy: f64,
        /// (x, y, z, E)
        covariance: [[f64; 4]; 4],
    },
    /// Long-lived neutral hadron cluster: impact point only
    NeutralCluster {
        position: [f64; 3],
        covariance: [[f64; 3]; 3],
    },
    /// Externally pre-fit combination
    Composite {
        vertex: [f64; 3],
        momentum: [f64; 4],
        /// (x, y, z, px, py, pz, E)
        covariance: [[f64; 7]; 7],
    },
}

impl Measurement {
    pub fn kind_name(&self) -> &'static str {
        match self {
            Measurement::Track { .. } => "track",
            Measurement::Cluster { .. } => "cluster",
            Measurement::NeutralCluster { .. } => "neutral cluster",
            Measurement::Composite { .. } => "composite",
        }
    }
}

/// One particle of the decay description.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Candidate {
    pub id: CandidateId,

    /// PDG-style particle code
    pub pdg_code: i32,

    /// Charge in units of e
    #[serde(default)]
    pub charge: f64,

    /// Reconstructed 4-momentum [px, py, pz, E]
    #[serde(default)]
    pub momentum: [f64; 4],

    /// Detector index of a resolved object (None for pure kinematic states)
    #[serde(default)]
    pub mdst_index: Option<usize>,

    #[serde(default)]
    pub measurement: Option<Measurement>,

    #[serde(default)]
    pub daughters: Vec<Candidate>,
}

impl Candidate {
    /// A purely kinematic intermediate state.
    pub fn composite(id: u32, pdg_code: i32, daughters: Vec<Candidate>) -> Self {
        let mut momentum = [0.0; 4];
        for daughter in &daughters {
            for (sum, component) in momentum.iter_mut().zip(daughter.momentum.iter()) {
                *sum += component;
            }
        }
        let charge = daughters.iter().map(|d| d.charge).sum();
        Self {
            id: CandidateId(id),
            pdg_code,
            charge,
            momentum,
            mdst_index: None,
            measurement: None,
            daughters,
        }
    }

    /// A charged track measured at `position` with `momentum`.
    pub fn track(
        id: u32,
        pdg_code: i32,
        charge: f64,
        mass: f64,
        position: Vector3<f64>,
        momentum: Vector3<f64>,
        covariance: Matrix6<f64>,
    ) -> Self {
        Self {
            id: CandidateId(id),
            pdg_code,
            charge,
            momentum: [
                momentum.x,
                momentum.y,
                momentum.z,
                (momentum.norm_squared() + mass * mass).sqrt(),
            ],
            mdst_index: Some(id as usize),
            measurement: Some(Measurement::Track {
                position: position.into(),
                momentum: momentum.into(),
                covariance: to_rows(&covariance),
            }),
            daughters: Vec::new(),
        }
    }

    /// A photon measured as a calorimeter cluster.
    pub fn photon(
        id: u32,
        position: Vector3<f64>,
        energy: f64,
        momentum: Vector3<f64>,
        covariance: Matrix4<f64>,
    ) -> Self {
        Self {
            id: CandidateId(id),
            pdg_code: 22,
            charge: 0.0,
            momentum: [momentum.x, momentum.y, momentum.z, energy],
            mdst_index: Some(id as usize),
            measurement: Some(Measurement::Cluster {
                position: position.into(),
                energy,
                covariance: to_rows(&covariance),
            }),
            daughters: Vec::new(),
        }
    }

    /// A long-lived neutral hadron measured by its cluster position.
    pub fn neutral_cluster(
        id: u32,
        pdg_code: i32,
        position: Vector3<f64>,
        momentum: Vector4<f64>,
        covariance: Matrix3<f64>,
    ) -> Self {
        Self {
            id: CandidateId(id),
            pdg_code,
            charge: 0.0,
            momentum: momentum.into(),
            mdst_index: Some(id as usize),
            measurement: Some(Measurement::NeutralCluster {
                position: position.into(),
                covariance: to_rows(&covariance),
            }),
            daughters: Vec::new(),
        }
    }

    /// An externally pre-fit composite.
    pub fn resolved_composite(
        id: u32,
        pdg_code: i32,
        charge: f64,
        vertex: Vector3<f64>,
        momentum: Vector4<f64>,
        covariance: Matrix7,
    ) -> Self {
        Self {
            id: CandidateId(id),
            pdg_code,
            charge,
            momentum: momentum.into(),
            mdst_index: Some(id as usize),
            measurement: Some(Measurement::Composite {
                vertex: vertex.into(),
                momentum: momentum.into(),
                covariance: to_rows(&covariance),
            }),
            daughters: Vec::new(),
        }
    }

    /// True if the candidate carries a track, cluster or neutral cluster.
    pub fn has_detector_measurement(&self) -> bool {
        matches!(
            self.measurement,
            Some(Measurement::Track { .. })
                | Some(Measurement::Cluster { .. })
                | Some(Measurement::NeutralCluster { .. })
        )
    }

    /// Depth-first search for a candidate by id.
    pub fn find(&self, id: CandidateId) -> Option<&Candidate> {
        if self.id == id {
            return Some(self);
        }
        self.daughters.iter().find_map(|d| d.find(id))
    }

    /// Number of candidates in this subtree.
    pub fn count(&self) -> usize {
        1 + self.daughters.iter().map(Candidate::count).sum::<usize>()
    }
}

/// Row-major array from a fixed-size matrix.
pub fn to_rows<const N: usize>(m: &SMatrix<f64, N, N>) -> [[f64; N]; N] {
    let mut rows = [[0.0; N]; N];
    for (i, row) in rows.iter_mut().enumerate() {
        for (j, value) in row.iter_mut().enumerate() {
            *value = m[(i, j)];
        }
    }
    rows
}

/// Fixed-size matrix from a row-major array.
pub fn from_rows<const N: usize>(rows: &[[f64; N]; N]) -> SMatrix<f64, N, N> {
    SMatrix::<f64, N, N>::from_fn(|i, j| rows[i][j])
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pion(id: u32, px: f64) -> Candidate {
        Candidate::track(
            id,
            211,
            1.0,
            0.139_570_39,
            Vector3::zeros(),
            Vector3::new(px, 0.0, 1.0),
            Matrix6::identity() * 1e-4,
        )
    }

    #[test]
    fn test_composite_sums_daughters() {
        let parent = Candidate::composite(0, 310, vec![pion(1, 0.2), pion(2, -0.2)]);
        assert_eq!(parent.momentum[2], 2.0);
        assert_eq!(parent.charge, 2.0);
        assert_eq!(parent.count(), 3);
        assert_eq!(parent.find(CandidateId(2)).unwrap().momentum[0], -0.2);
    }

    #[test]
    fn test_measurement_json_tag() {
        let track = pion(1, 0.3);
        let json = serde_json::to_string(&track).unwrap();
        assert!(json.contains("\"type\":\"track\""));
        assert_eq!(track.measurement.as_ref().map(Measurement::kind_name), Some("track"));
        let back: Candidate = serde_json::from_str(&json).unwrap();
        assert_eq!(back, track);
    }

    #[test]
    fn test_row_conversion() {
        let m = Matrix3::new(1.0, 2.0, 3.0, 4.0, 5.0, 6.0, 7.0, 8.0, 9.0);
        let rows = to_rows(&m);
        assert_eq!(rows[1][2], 6.0);
        assert_eq!(from_rows(&rows), m);
    }
}
