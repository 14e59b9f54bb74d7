//! Decay-tree nodes.
//!
//! Every position of the vertex tree is a [`ParticleNode`] tagged with one
//! [`NodeKind`]. The variant fixes which parameters the node contributes to
//! the state vector; the capability queries (`has_position`, `has_energy`,
//! `tau_index`, ...) are answered from the variant and never change after
//! construction.

use nalgebra::{Matrix2x3, Matrix3, Matrix4, SMatrix, Vector3, Vector4};
use serde::{Deserialize, Serialize};

use crate::candidate::{from_rows, CandidateId, Matrix7, Measurement};
use crate::error::TreeFitError;

/// 5×5 matrix for the straight-track constraint.
pub type Matrix5 = SMatrix<f64, 5, 5>;

/// Arena handle of a node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct NodeId(pub usize);

impl std::fmt::Display for NodeId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "node{}", self.0)
    }
}

/// Beam spot seeding the root of the tree.
#[derive(Debug, Clone, PartialEq)]
pub struct OriginData {
    pub position: Vector3<f64>,
    pub covariance: Matrix3<f64>,
}

/// Straight-line track measured at a reference point.
///
/// `u` and `v` span the plane perpendicular to the measured direction; the
/// constraint compares the production vertex against the trajectory in that
/// plane and the fitted momentum against the measured one.
#[derive(Debug, Clone, PartialEq)]
pub struct TrackData {
    pub reference: Vector3<f64>,
    pub momentum: Vector3<f64>,
    pub u: Vector3<f64>,
    pub v: Vector3<f64>,
    /// Covariance of (u·x, v·x, px, py, pz)
    pub covariance: Matrix5,
}

impl TrackData {
    pub fn from_measurement(
        position: [f64; 3],
        momentum: [f64; 3],
        covariance: &[[f64; 6]; 6],
    ) -> Result<Self, TreeFitError> {
        let reference = Vector3::from(position);
        let momentum = Vector3::from(momentum);
        let (u, v) = perpendicular_basis(&momentum)
            .ok_or_else(|| TreeFitError::Degenerate("track with zero momentum".into()))?;

        // A maps (x, y, z, px, py, pz) onto the constraint's measurement space
        let mut a = SMatrix::<f64, 5, 6>::zeros();
        a.fixed_view_mut::<1, 3>(0, 0).copy_from(&u.transpose());
        a.fixed_view_mut::<1, 3>(1, 0).copy_from(&v.transpose());
        a.fixed_view_mut::<3, 3>(2, 3).copy_from(&Matrix3::identity());
        let covariance = a * from_rows(covariance) * a.transpose();

        Ok(Self {
            reference,
            momentum,
            u,
            v,
            covariance,
        })
    }
}

/// Calorimeter cluster (photon) or neutral-hadron cluster.
///
/// `axes[0]` is the dominant flight axis; the direction constraint
/// eliminates it against the two remaining axes.
#[derive(Debug, Clone, PartialEq)]
pub struct ClusterData {
    pub position: Vector3<f64>,
    /// Measured energy; None for neutral-hadron clusters
    pub energy: Option<f64>,
    /// (x, y, z[, E]) covariance
    pub covariance: Matrix4<f64>,
    pub axes: [usize; 3],
    /// Momentum magnitude seed for clusters without energy
    pub momentum_seed: f64,
}

impl ClusterData {
    /// Picks the dominant axis from `direction`.
    pub fn new(
        position: Vector3<f64>,
        energy: Option<f64>,
        covariance: Matrix4<f64>,
        direction: &Vector3<f64>,
        momentum_seed: f64,
    ) -> Self {
        let dominant = if direction.norm() > 0.0 { direction } else { &position };
        let i1 = dominant.iamax();
        let axes = [i1, (i1 + 1) % 3, (i1 + 2) % 3];
        Self {
            position,
            energy,
            covariance,
            axes,
            momentum_seed,
        }
    }

    /// Constraint rows: two direction rows, plus one energy row if measured.
    pub fn dim(&self) -> usize {
        if self.energy.is_some() {
            3
        } else {
            2
        }
    }

    /// Jacobian of the direction rows w.r.t. the cluster position.
    pub fn position_jacobian(&self, p: &Vector3<f64>) -> Matrix2x3<f64> {
        let [i1, i2, i3] = self.axes;
        let mut g = Matrix2x3::zeros();
        g[(0, i2)] = 1.0;
        g[(0, i1)] = -p[i2] / p[i1];
        g[(1, i3)] = 1.0;
        g[(1, i1)] = -p[i3] / p[i1];
        g
    }
}

/// Externally pre-fit composite.
#[derive(Debug, Clone, PartialEq)]
pub struct CompositeData {
    pub vertex: Vector3<f64>,
    pub momentum: Vector4<f64>,
    pub covariance: Matrix7,
}

/// The fixed set of node variants.
#[derive(Debug, Clone, PartialEq)]
pub enum NodeKind {
    /// Beam spot: the root when an origin is configured
    Origin(OriginData),
    /// Head of the decay chain without a mother
    InternalComposite,
    /// Unmeasured intermediate state with its own decay vertex
    UnfitComposite,
    /// Unmeasured short-lived state decaying at its production vertex
    UnfitResonance,
    ResolvedTrack(TrackData),
    ResolvedPhoton(ClusterData),
    ResolvedNeutralCluster(ClusterData),
    ResolvedComposite(CompositeData),
}

impl NodeKind {
    pub fn name(&self) -> &'static str {
        match self {
            NodeKind::Origin(_) => "Origin",
            NodeKind::InternalComposite => "InternalComposite",
            NodeKind::UnfitComposite => "UnfitComposite",
            NodeKind::UnfitResonance => "UnfitResonance",
            NodeKind::ResolvedTrack(_) => "ResolvedTrack",
            NodeKind::ResolvedPhoton(_) => "ResolvedPhoton",
            NodeKind::ResolvedNeutralCluster(_) => "ResolvedNeutralCluster",
            NodeKind::ResolvedComposite(_) => "ResolvedComposite",
        }
    }

    /// Variants that own a decay vertex.
    pub fn has_position(&self) -> bool {
        matches!(
            self,
            NodeKind::Origin(_)
                | NodeKind::InternalComposite
                | NodeKind::UnfitComposite
                | NodeKind::ResolvedComposite(_)
        )
    }

    /// Variants that store a 4-momentum rather than a 3-momentum.
    pub fn has_energy(&self) -> bool {
        matches!(
            self,
            NodeKind::InternalComposite
                | NodeKind::UnfitComposite
                | NodeKind::UnfitResonance
                | NodeKind::ResolvedComposite(_)
        )
    }

    pub fn has_momentum(&self) -> bool {
        !matches!(self, NodeKind::Origin(_))
    }

    /// Variants whose daughters are part of the fit tree.
    pub fn has_daughters(&self) -> bool {
        matches!(
            self,
            NodeKind::Origin(_)
                | NodeKind::InternalComposite
                | NodeKind::UnfitComposite
                | NodeKind::UnfitResonance
        )
    }

    /// Variants that may carry a flight-distance parameter.
    pub fn can_have_tau(&self) -> bool {
        matches!(self, NodeKind::UnfitComposite | NodeKind::ResolvedComposite(_))
    }

    pub fn is_final_state(&self) -> bool {
        matches!(
            self,
            NodeKind::ResolvedTrack(_)
                | NodeKind::ResolvedPhoton(_)
                | NodeKind::ResolvedNeutralCluster(_)
        )
    }
}

/// One position of the vertex tree.
#[derive(Debug, Clone)]
pub struct ParticleNode {
    pub kind: NodeKind,
    pub name: String,
    /// Backing candidate in the external store
    pub source: Option<CandidateId>,
    pub pdg_code: i32,
    pub mother: Option<NodeId>,
    pub daughters: Vec<NodeId>,
    /// Nominal mass in GeV
    pub mass: f64,
    /// Nominal lifetime in ns
    pub lifetime: f64,
    pub charge: i32,
    pub is_resonance: bool,
    pub mass_constrained: bool,
    has_tau: bool,
    index: Option<usize>,
}

impl ParticleNode {
    pub fn new(kind: NodeKind, name: impl Into<String>) -> Self {
        Self {
            kind,
            name: name.into(),
            source: None,
            pdg_code: 0,
            mother: None,
            daughters: Vec::new(),
            mass: 0.0,
            lifetime: 0.0,
            charge: 0,
            is_resonance: false,
            mass_constrained: false,
            has_tau: false,
            index: None,
        }
    }

    /// Enables the flight-distance parameter; ignored for massless nodes
    /// and variants without a tau.
    pub fn set_has_tau(&mut self, has_tau: bool) {
        self.has_tau = has_tau && self.kind.can_have_tau() && self.mass > 0.0;
    }

    pub fn has_tau(&self) -> bool {
        self.has_tau
    }

    pub fn has_position(&self) -> bool {
        self.kind.has_position()
    }

    pub fn has_energy(&self) -> bool {
        self.kind.has_energy()
    }

    /// State-vector slots contributed by this node.
    pub fn dim(&self) -> usize {
        let position = if self.has_position() { 3 } else { 0 };
        let tau = if self.has_tau { 1 } else { 0 };
        let momentum = match (self.kind.has_momentum(), self.has_energy()) {
            (false, _) => 0,
            (true, true) => 4,
            (true, false) => 3,
        };
        position + tau + momentum
    }

    /// First state-vector slot of this node, once indexed.
    pub fn index(&self) -> Option<usize> {
        self.index
    }

    pub(crate) fn set_index(&mut self, index: Option<usize>) {
        self.index = index;
    }

    pub fn pos_index(&self) -> Option<usize> {
        if self.has_position() {
            self.index
        } else {
            None
        }
    }

    pub fn tau_index(&self) -> Option<usize> {
        if self.has_tau {
            self.index.map(|i| i + 3)
        } else {
            None
        }
    }

    pub fn mom_index(&self) -> Option<usize> {
        if !self.kind.has_momentum() {
            return None;
        }
        let offset = if self.has_position() { 3 } else { 0 } + if self.has_tau { 1 } else { 0 };
        self.index.map(|i| i + offset)
    }

    /// Number of momentum slots (3 or 4).
    pub fn mom_dim(&self) -> usize {
        if self.has_energy() {
            4
        } else {
            3
        }
    }

    /// Label of the `offset`-th parameter of the node's layout.
    pub fn par_name(&self, offset: usize) -> String {
        let suffix = match offset {
            0 => "x",
            1 => "y",
            2 => "z",
            3 => "tau",
            4 => "px",
            5 => "py",
            6 => "pz",
            7 => "E",
            _ => "?",
        };
        format!("{}_{}", self.name, suffix)
    }
}

/// Orthonormal pair perpendicular to `direction`.
pub fn perpendicular_basis(direction: &Vector3<f64>) -> Option<(Vector3<f64>, Vector3<f64>)> {
    let norm = direction.norm();
    if norm == 0.0 || !norm.is_finite() {
        return None;
    }
    let w = direction / norm;
    // Seed with the axis least aligned to w
    let seed = match w.iamin() {
        0 => Vector3::x(),
        1 => Vector3::y(),
        _ => Vector3::z(),
    };
    let u = (seed - w * w.dot(&seed)).normalize();
    let v = w.cross(&u);
    Some((u, v))
}

/// Builds the measurement payload for a resolved variant.
pub fn resolved_kind(
    measurement: &Measurement,
    momentum: &[f64; 4],
) -> Result<NodeKind, TreeFitError> {
    let direction = Vector3::new(momentum[0], momentum[1], momentum[2]);
    Ok(match measurement {
        Measurement::Track {
            position,
            momentum,
            covariance,
        } => {
            let track = TrackData::from_measurement(*position, *momentum, covariance)?;
            NodeKind::ResolvedTrack(track)
        }
        Measurement::Cluster {
            position,
            energy,
            covariance,
        } => NodeKind::ResolvedPhoton(ClusterData::new(
            Vector3::from(*position),
            Some(*energy),
            from_rows(covariance),
            &direction,
            *energy,
        )),
        Measurement::NeutralCluster { position, covariance } => {
            let mut cov4 = Matrix4::zeros();
            cov4.fixed_view_mut::<3, 3>(0, 0).copy_from(&from_rows(covariance));
            NodeKind::ResolvedNeutralCluster(ClusterData::new(
                Vector3::from(*position),
                None,
                cov4,
                &direction,
                direction.norm(),
            ))
        }
        Measurement::Composite {
            vertex,
            momentum,
            covariance,
        } => NodeKind::ResolvedComposite(CompositeData {
            vertex: Vector3::from(*vertex),
            momentum: Vector4::from(*momentum),
            covariance: from_rows(covariance),
        }),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    fn composite(has_tau: bool) -> ParticleNode {
        let mut node = ParticleNode::new(NodeKind::UnfitComposite, "D0");
        node.mass = 1.86484;
        node.set_has_tau(has_tau);
        node
    }

    #[test]
    fn test_composite_layout() {
        let mut node = composite(true);
        assert_eq!(node.dim(), 8);
        assert_eq!(node.pos_index(), None);

        node.set_index(Some(10));
        assert_eq!(node.pos_index(), Some(10));
        assert_eq!(node.tau_index(), Some(13));
        assert_eq!(node.mom_index(), Some(14));
        assert_eq!(node.par_name(3), "D0_tau");
    }

    #[test]
    fn test_composite_without_tau() {
        let mut node = composite(false);
        node.set_index(Some(0));
        assert_eq!(node.dim(), 7);
        assert_eq!(node.tau_index(), None);
        assert_eq!(node.mom_index(), Some(3));
    }

    #[test]
    fn test_massless_node_has_no_tau() {
        let mut node = ParticleNode::new(NodeKind::UnfitComposite, "X");
        node.set_has_tau(true);
        assert!(!node.has_tau());
        assert_eq!(node.dim(), 7);
    }

    #[test]
    fn test_leaf_and_resonance_layouts() {
        let mut resonance = ParticleNode::new(NodeKind::UnfitResonance, "J/psi");
        resonance.mass = 3.0969;
        resonance.set_has_tau(true);
        resonance.set_index(Some(5));
        assert_eq!(resonance.dim(), 4);
        assert_eq!(resonance.pos_index(), None);
        assert_eq!(resonance.tau_index(), None);
        assert_eq!(resonance.mom_index(), Some(5));

        let origin = ParticleNode::new(
            NodeKind::Origin(OriginData {
                position: Vector3::zeros(),
                covariance: Matrix3::identity(),
            }),
            "beamspot",
        );
        assert_eq!(origin.dim(), 3);
        assert_eq!(origin.mom_index(), None);
    }

    #[test]
    fn test_perpendicular_basis() {
        let p = Vector3::new(0.3, -1.2, 2.5);
        let (u, v) = perpendicular_basis(&p).unwrap();
        assert_relative_eq!(u.norm(), 1.0, epsilon = 1e-12);
        assert_relative_eq!(v.norm(), 1.0, epsilon = 1e-12);
        assert_relative_eq!(u.dot(&p), 0.0, epsilon = 1e-12);
        assert_relative_eq!(v.dot(&p), 0.0, epsilon = 1e-12);
        assert_relative_eq!(u.dot(&v), 0.0, epsilon = 1e-12);
        assert!(perpendicular_basis(&Vector3::zeros()).is_none());
    }

    #[test]
    fn test_track_covariance_projection() {
        let mut cov = [[0.0; 6]; 6];
        for (i, row) in cov.iter_mut().enumerate() {
            row[i] = if i < 3 { 1e-4 } else { 1e-6 };
        }
        let track = TrackData::from_measurement([0.0; 3], [0.0, 0.0, 2.0], &cov).unwrap();
        // Isotropic position errors stay isotropic in the perpendicular plane
        assert_relative_eq!(track.covariance[(0, 0)], 1e-4, epsilon = 1e-15);
        assert_relative_eq!(track.covariance[(1, 1)], 1e-4, epsilon = 1e-15);
        assert_relative_eq!(track.covariance[(4, 4)], 1e-6, epsilon = 1e-15);
    }

    #[test]
    fn test_cluster_axes() {
        let cluster = ClusterData::new(
            Vector3::new(10.0, 150.0, 20.0),
            Some(1.0),
            Matrix4::identity(),
            &Vector3::new(0.1, 0.9, 0.2),
            1.0,
        );
        assert_eq!(cluster.axes, [1, 2, 0]);
        assert_eq!(cluster.dim(), 3);
    }
}
