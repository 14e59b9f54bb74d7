//! The decay tree: arena ownership, index layout and recursive walks.
//!
//! Nodes live in an arena addressed by [`NodeId`]. A node owns its daughter
//! subtree (removing it frees the subtree); the `mother` link is a plain id
//! used for lookups only.

use std::ops::Index;
use std::sync::Arc;

use nalgebra::{DVector, Vector3, Vector4};
use tracing::{debug, error};

use crate::candidate::{from_rows, Candidate, CandidateId, Measurement};
use crate::config::FitConfig;
use crate::constraint::{Constraint, ConstraintKind};
use crate::dispatch::{classify, is_resonance, Variant};
use crate::error::TreeFitError;
use crate::fit_params::FitParams;
use crate::particle::{resolved_kind, NodeId, NodeKind, OriginData, ParticleNode};
use crate::pdg::{SharedProperties, SPEED_OF_LIGHT};

/// Arena-backed decay tree.
pub struct DecayTree {
    nodes: Vec<Option<ParticleNode>>,
    root: Option<NodeId>,
    config: Arc<FitConfig>,
    properties: SharedProperties,
    /// Total state dimension, valid after `update_index`
    dim: Option<usize>,
}

impl Index<NodeId> for DecayTree {
    type Output = ParticleNode;

    fn index(&self, id: NodeId) -> &ParticleNode {
        match self.nodes.get(id.0).and_then(Option::as_ref) {
            Some(node) => node,
            None => panic!("{id} is not part of the tree"),
        }
    }
}

impl DecayTree {
    /// An empty tree bound to one configuration and particle table.
    pub fn new(config: Arc<FitConfig>, properties: SharedProperties) -> Self {
        Self {
            nodes: Vec::new(),
            root: None,
            config,
            properties,
            dim: None,
        }
    }

    /// Builds the full tree for `head` and assigns indices.
    ///
    /// With a configured origin the beam spot becomes the root and the head
    /// its only daughter. Returns the tree and the head's id.
    pub fn build(
        head: &Candidate,
        config: Arc<FitConfig>,
        properties: SharedProperties,
    ) -> Result<(Self, NodeId), TreeFitError> {
        let mut tree = Self::new(config, properties);
        let head_id = match tree.config.origin.clone() {
            Some(origin) => {
                let root = tree.add_origin(OriginData {
                    position: Vector3::from(origin.position),
                    covariance: from_rows(&origin.covariance),
                });
                tree.add_daughter(root, head)?
            }
            None => tree.add_root(head)?,
        };
        tree.update_index();
        Ok((tree, head_id))
    }

    pub fn config(&self) -> &FitConfig {
        &self.config
    }

    pub fn root(&self) -> Option<NodeId> {
        self.root
    }

    pub fn get(&self, id: NodeId) -> Option<&ParticleNode> {
        self.nodes.get(id.0).and_then(Option::as_ref)
    }

    /// Live nodes in arena order.
    pub fn iter(&self) -> impl Iterator<Item = (NodeId, &ParticleNode)> {
        self.nodes
            .iter()
            .enumerate()
            .filter_map(|(i, n)| n.as_ref().map(|n| (NodeId(i), n)))
    }

    pub fn len(&self) -> usize {
        self.iter().count()
    }

    pub fn is_empty(&self) -> bool {
        self.root.is_none()
    }

    /// Total state dimension; None until `update_index` has run.
    pub fn dim(&self) -> Option<usize> {
        self.dim
    }

    fn node_mut(&mut self, id: NodeId) -> &mut ParticleNode {
        match self.nodes.get_mut(id.0).and_then(Option::as_mut) {
            Some(node) => node,
            None => panic!("{id} is not part of the tree"),
        }
    }

    fn insert(&mut self, node: ParticleNode) -> NodeId {
        let id = NodeId(self.nodes.len());
        self.nodes.push(Some(node));
        self.dim = None;
        id
    }

    // ========================================================================
    // CONSTRUCTION
    // ========================================================================

    /// Installs a beam spot as the root.
    pub fn add_origin(&mut self, origin: OriginData) -> NodeId {
        let id = self.insert(ParticleNode::new(NodeKind::Origin(origin), "beamspot"));
        self.root = Some(id);
        id
    }

    /// Installs `candidate` as the motherless head of the tree.
    pub fn add_root(&mut self, candidate: &Candidate) -> Result<NodeId, TreeFitError> {
        let id = self.create_node(candidate, None)?;
        self.root = Some(id);
        Ok(id)
    }

    /// Creates the variant chosen by the dispatcher for `candidate`, appends
    /// it to `mother`'s daughters and returns it.
    pub fn add_daughter(
        &mut self,
        mother: NodeId,
        candidate: &Candidate,
    ) -> Result<NodeId, TreeFitError> {
        let Some(node) = self.get(mother) else {
            return Err(TreeFitError::bad_setup(format!("{mother} is not part of the tree")));
        };
        if !node.kind.has_daughters() {
            return Err(TreeFitError::bad_setup(format!(
                "{} ({}) cannot own daughters",
                node.name,
                node.kind.name()
            )));
        }
        let id = self.create_node(candidate, Some(mother))?;
        self.node_mut(mother).daughters.push(id);
        Ok(id)
    }

    fn create_node(
        &mut self,
        candidate: &Candidate,
        mother: Option<NodeId>,
    ) -> Result<NodeId, TreeFitError> {
        let info = self
            .properties
            .lookup(candidate.pdg_code)
            .ok_or(TreeFitError::UnknownParticle(candidate.pdg_code))?;

        let variant = classify(candidate, mother.is_some(), info.lifetime, &self.config)?;
        let kind = match variant {
            Variant::InternalComposite => NodeKind::InternalComposite,
            Variant::UnfitComposite => NodeKind::UnfitComposite,
            Variant::UnfitResonance => NodeKind::UnfitResonance,
            Variant::ResolvedTrack
            | Variant::ResolvedPhoton
            | Variant::ResolvedNeutralCluster
            | Variant::ResolvedComposite => match &candidate.measurement {
                Some(measurement) => resolved_kind(measurement, &candidate.momentum)?,
                None => {
                    return Err(TreeFitError::MissingMeasurement {
                        name: info.name,
                        expected: "detector",
                    })
                }
            },
        };

        let mut node = ParticleNode::new(kind, info.name.clone());
        node.source = Some(candidate.id);
        node.pdg_code = candidate.pdg_code;
        node.mother = mother;
        node.mass = info.mass;
        node.lifetime = info.lifetime;
        node.charge = round_charge(candidate.charge);
        node.is_resonance = is_resonance(candidate.pdg_code, candidate.mdst_index, info.lifetime);
        node.mass_constrained =
            node.has_energy() && self.config.is_mass_constrained(candidate.pdg_code);
        let geometric = self.config.is_geo_constrained(candidate.pdg_code);
        let mother_has_vertex = mother.is_some_and(|m| self.has_decay_vertex(m));
        node.set_has_tau(geometric && mother_has_vertex);

        debug!(
            "TreeFitter: {} {} as {} ({})",
            candidate.id,
            node.name,
            node.kind.name(),
            candidate.measurement.as_ref().map_or("unmeasured", Measurement::kind_name)
        );

        let has_daughters = node.kind.has_daughters();
        let id = self.insert(node);
        if has_daughters {
            for daughter in &candidate.daughters {
                self.add_daughter(id, daughter)?;
            }
        }
        Ok(id)
    }

    /// Removes and frees `daughter`'s subtree.
    ///
    /// Logs and returns false without touching the tree if `daughter` is
    /// not a daughter of `mother`.
    pub fn remove_daughter(&mut self, mother: NodeId, daughter: NodeId) -> bool {
        let position = self
            .get(mother)
            .and_then(|m| m.daughters.iter().position(|d| *d == daughter));
        let Some(position) = position else {
            error!("Cannot remove {daughter} from {mother}: not a daughter");
            return false;
        };
        self.node_mut(mother).daughters.remove(position);

        let mut doomed = vec![daughter];
        while let Some(id) = doomed.pop() {
            if let Some(node) = self.nodes.get_mut(id.0).and_then(Option::take) {
                doomed.extend(node.daughters);
            }
        }
        self.dim = None;
        true
    }

    // ========================================================================
    // INDEX LAYOUT
    // ========================================================================

    /// Assigns state-vector offsets post-order and returns the total dimension.
    ///
    /// Every subtree receives lower indices than its mother.
    pub fn update_index(&mut self) -> usize {
        let mut offset = 0;
        for node in self.nodes.iter_mut().flatten() {
            node.set_index(None);
        }
        if let Some(root) = self.root {
            self.update_index_from(root, &mut offset);
        }
        self.dim = Some(offset);
        offset
    }

    fn update_index_from(&mut self, id: NodeId, offset: &mut usize) {
        let daughters = self[id].daughters.clone();
        for daughter in daughters {
            self.update_index_from(daughter, offset);
        }
        let node = self.node_mut(id);
        node.set_index(Some(*offset));
        *offset += node.dim();
    }

    /// Pre-order list of (node, first index).
    pub fn retrieve_index_map(&self) -> Vec<(NodeId, usize)> {
        let mut map = Vec::new();
        if let Some(root) = self.root {
            self.retrieve_index_map_from(root, &mut map);
        }
        map
    }

    fn retrieve_index_map_from(&self, id: NodeId, map: &mut Vec<(NodeId, usize)>) {
        if let Some(index) = self[id].index() {
            map.push((id, index));
        }
        for daughter in &self[id].daughters {
            self.retrieve_index_map_from(*daughter, map);
        }
    }

    // ========================================================================
    // VERTICES
    // ========================================================================

    fn has_decay_vertex(&self, id: NodeId) -> bool {
        let node = &self[id];
        node.has_position() || node.mother.is_some_and(|m| self.has_decay_vertex(m))
    }

    /// Position index of the vertex where `id` decays: its own position, or
    /// the vertex it was produced at.
    pub fn decay_vertex_index(&self, id: NodeId) -> Option<usize> {
        let node = &self[id];
        node.pos_index()
            .or_else(|| node.mother.and_then(|m| self.decay_vertex_index(m)))
    }

    /// Position index of the vertex where `id` was produced.
    pub fn production_vertex_index(&self, id: NodeId) -> Option<usize> {
        self[id].mother.and_then(|m| self.decay_vertex_index(m))
    }

    /// Collects every node below `id` (inclusive) produced at `pos_index`.
    pub fn collect_vertex_daughters(&self, id: NodeId, list: &mut Vec<NodeId>, pos_index: usize) {
        if self.production_vertex_index(id) == Some(pos_index) {
            list.push(id);
        }
        for daughter in &self[id].daughters {
            self.collect_vertex_daughters(*daughter, list, pos_index);
        }
    }

    /// Depth-first search for the node backed by `candidate`.
    pub fn locate(&self, candidate: CandidateId) -> Option<NodeId> {
        self.root.and_then(|root| self.locate_from(root, candidate))
    }

    fn locate_from(&self, id: NodeId, candidate: CandidateId) -> Option<NodeId> {
        if self[id].source == Some(candidate) {
            return Some(id);
        }
        self[id]
            .daughters
            .iter()
            .find_map(|d| self.locate_from(*d, candidate))
    }

    // ========================================================================
    // RECURSIVE AGGREGATES
    // ========================================================================

    /// Chi-square of the constraints owned by the subtree of `id`.
    pub fn chi_square(&self, id: NodeId, fit_params: &FitParams) -> f64 {
        fit_params.node_chi_square(id)
            + self[id]
                .daughters
                .iter()
                .map(|d| self.chi_square(*d, fit_params))
                .sum::<f64>()
    }

    /// Number of charged tracks in the subtree of `id`.
    pub fn n_final_charged_candidates(&self, id: NodeId) -> usize {
        let own = usize::from(matches!(self[id].kind, NodeKind::ResolvedTrack(_)));
        own + self[id]
            .daughters
            .iter()
            .map(|d| self.n_final_charged_candidates(*d))
            .sum::<usize>()
    }

    /// Constraint rows minus parameters over the subtree of `id`.
    pub fn n_dof(&self, id: NodeId, fit_params: &FitParams) -> i64 {
        let own = fit_params.node_constraints(id) as i64 - self[id].dim() as i64;
        own + self[id]
            .daughters
            .iter()
            .map(|d| self.n_dof(*d, fit_params))
            .sum::<i64>()
    }

    // ========================================================================
    // CONSTRAINTS
    // ========================================================================

    /// Appends the constraints of the subtree of `id`; daughters sit one
    /// level deeper than their mother.
    pub fn add_to_constraint_list(&self, id: NodeId, list: &mut Vec<Constraint>, depth: usize) {
        for daughter in &self[id].daughters {
            self.add_to_constraint_list(*daughter, list, depth + 1);
        }
        let node = &self[id];
        let mut push =
            |kind: ConstraintKind, dim: usize| list.push(Constraint::new(id, kind, depth, dim));
        match &node.kind {
            NodeKind::Origin(_) => push(ConstraintKind::Beamspot, 3),
            NodeKind::ResolvedTrack(_) => push(ConstraintKind::Track, 5),
            NodeKind::ResolvedPhoton(cluster) => push(ConstraintKind::Photon, cluster.dim()),
            NodeKind::ResolvedNeutralCluster(cluster) => {
                push(ConstraintKind::NeutralCluster, cluster.dim())
            }
            NodeKind::ResolvedComposite(_) => {
                push(ConstraintKind::Composite, 7);
                if node.has_tau() {
                    push(ConstraintKind::Geometric, 3);
                }
            }
            NodeKind::InternalComposite | NodeKind::UnfitComposite => {
                if node.has_tau() {
                    push(ConstraintKind::Geometric, 3);
                }
                push(ConstraintKind::Kinematic, 4);
            }
            NodeKind::UnfitResonance => push(ConstraintKind::Kinematic, 4),
        }
        if node.mass_constrained {
            push(ConstraintKind::Mass, 1);
        }
    }

    // ========================================================================
    // INITIALISATION
    // ========================================================================

    /// 4-momentum of `id` in `state`; nodes without an energy parameter get
    /// `E = sqrt(m² + |p|²)` from their nominal mass.
    pub fn momentum4(&self, id: NodeId, state: &DVector<f64>) -> Option<Vector4<f64>> {
        let node = &self[id];
        let mom = node.mom_index()?;
        let p = state.fixed_rows::<3>(mom).clone_owned();
        let energy = if node.has_energy() {
            state[mom + 3]
        } else {
            (node.mass * node.mass + p.norm_squared()).sqrt()
        };
        Some(Vector4::new(p.x, p.y, p.z, energy))
    }

    /// Seeds the state vector: measured parameters, vertex estimates,
    /// momenta, flight distances.
    pub fn init_state(&self, fit_params: &mut FitParams) -> Result<(), TreeFitError> {
        let Some(root) = self.root else {
            return Err(TreeFitError::bad_setup("empty decay tree"));
        };
        fit_params.state_vector.fill(0.0);
        let mut vertex_set = vec![false; self.nodes.len()];
        self.init_vertices(root, fit_params, &mut vertex_set);
        self.init_vertex_fallback(root, fit_params, &mut vertex_set);
        self.init_momenta(root, fit_params)?;
        self.init_tau(root, fit_params);
        Ok(())
    }

    /// Post-order: measured leaves, beam spot, composite vertices from
    /// their vertex daughters.
    fn init_vertices(&self, id: NodeId, fit_params: &mut FitParams, vertex_set: &mut [bool]) {
        for daughter in &self[id].daughters {
            self.init_vertices(*daughter, fit_params, vertex_set);
        }
        let node = &self[id];
        let state = &mut fit_params.state_vector;
        match &node.kind {
            NodeKind::Origin(origin) => {
                if let Some(pos) = node.pos_index() {
                    state.fixed_rows_mut::<3>(pos).copy_from(&origin.position);
                    vertex_set[id.0] = true;
                }
            }
            NodeKind::ResolvedTrack(track) => {
                if let Some(mom) = node.mom_index() {
                    state.fixed_rows_mut::<3>(mom).copy_from(&track.momentum);
                }
            }
            NodeKind::ResolvedComposite(composite) => {
                if let (Some(pos), Some(mom)) = (node.pos_index(), node.mom_index()) {
                    state.fixed_rows_mut::<3>(pos).copy_from(&composite.vertex);
                    state.fixed_rows_mut::<4>(mom).copy_from(&composite.momentum);
                    vertex_set[id.0] = true;
                }
            }
            NodeKind::InternalComposite | NodeKind::UnfitComposite => {
                if let Some(pos) = node.pos_index() {
                    if let Some(vertex) = self.estimate_vertex(id, pos, fit_params, vertex_set) {
                        fit_params.state_vector.fixed_rows_mut::<3>(pos).copy_from(&vertex);
                        vertex_set[id.0] = true;
                    }
                }
            }
            _ => {}
        }
    }

    /// Vertex seed from the tracks and already-seeded vertices produced at
    /// `pos`: the closest approach of the two highest-pT tracks, else the
    /// mean of all reference points. A single point is only used for the
    /// motherless head.
    fn estimate_vertex(
        &self,
        id: NodeId,
        pos: usize,
        fit_params: &FitParams,
        vertex_set: &[bool],
    ) -> Option<Vector3<f64>> {
        let mut vertex_daughters = Vec::new();
        self.collect_vertex_daughters(id, &mut vertex_daughters, pos);

        let mut tracks = Vec::new();
        let mut points = Vec::new();
        for daughter in vertex_daughters {
            let node = &self[daughter];
            match &node.kind {
                NodeKind::ResolvedTrack(track) => tracks.push(track),
                _ if node.has_position() && vertex_set[daughter.0] => {
                    if let Some(p) = node.pos_index() {
                        points.push(fit_params.state_vector.fixed_rows::<3>(p).clone_owned());
                    }
                }
                _ => {}
            }
        }

        if tracks.len() >= 2 {
            tracks.sort_by(|a, b| {
                let pt_a = a.momentum.xy().norm();
                let pt_b = b.momentum.xy().norm();
                pt_b.partial_cmp(&pt_a).unwrap_or(std::cmp::Ordering::Equal)
            });
            return Some(closest_approach(
                &tracks[0].reference,
                &tracks[0].momentum,
                &tracks[1].reference,
                &tracks[1].momentum,
            ));
        }

        points.extend(tracks.iter().map(|t| t.reference));
        if points.len() >= 2 || (points.len() == 1 && self[id].mother.is_none()) {
            let sum = points.iter().fold(Vector3::zeros(), |acc, p| acc + p);
            return Some(sum / points.len() as f64);
        }
        None
    }

    /// Pre-order: unseeded vertices take their mother's vertex.
    fn init_vertex_fallback(
        &self,
        id: NodeId,
        fit_params: &mut FitParams,
        vertex_set: &mut [bool],
    ) {
        let node = &self[id];
        if let Some(pos) = node.pos_index() {
            if !vertex_set[id.0] {
                if let Some(mother_pos) = self.production_vertex_index(id) {
                    let vertex = fit_params.state_vector.fixed_rows::<3>(mother_pos).clone_owned();
                    fit_params.state_vector.fixed_rows_mut::<3>(pos).copy_from(&vertex);
                }
                vertex_set[id.0] = true;
            }
        }
        for daughter in &self[id].daughters {
            self.init_vertex_fallback(*daughter, fit_params, vertex_set);
        }
    }

    /// Post-order: cluster momenta along the vertex→cluster line, composite
    /// momenta as the sum of their daughters.
    fn init_momenta(&self, id: NodeId, fit_params: &mut FitParams) -> Result<(), TreeFitError> {
        for daughter in &self[id].daughters {
            self.init_momenta(*daughter, fit_params)?;
        }
        let node = &self[id];
        let Some(mom) = node.mom_index() else {
            return Ok(());
        };
        match &node.kind {
            NodeKind::ResolvedPhoton(cluster) | NodeKind::ResolvedNeutralCluster(cluster) => {
                let vertex = self
                    .production_vertex_index(id)
                    .map(|p| fit_params.state_vector.fixed_rows::<3>(p).clone_owned())
                    .unwrap_or_else(Vector3::zeros);
                let direction = cluster.position - vertex;
                let magnitude = cluster.energy.unwrap_or(cluster.momentum_seed);
                if direction.norm() == 0.0 || magnitude <= 0.0 {
                    return Err(TreeFitError::Degenerate(format!(
                        "cannot seed the momentum of {}",
                        node.name
                    )));
                }
                let p = direction.normalize() * magnitude;
                fit_params.state_vector.fixed_rows_mut::<3>(mom).copy_from(&p);
            }
            NodeKind::InternalComposite | NodeKind::UnfitComposite | NodeKind::UnfitResonance => {
                let mut sum = Vector4::zeros();
                for daughter in &node.daughters {
                    if let Some(p4) = self.momentum4(*daughter, &fit_params.state_vector) {
                        sum += p4;
                    }
                }
                fit_params.state_vector.fixed_rows_mut::<4>(mom).copy_from(&sum);
            }
            _ => {}
        }
        Ok(())
    }

    /// Seeds flight distances with `lifetime · c / mass · tau_seed_factor`.
    ///
    /// The factor is a loose exploratory seed, not a unit conversion; the
    /// momentum is unknown at this stage and is left out.
    pub fn init_tau(&self, id: NodeId, fit_params: &mut FitParams) {
        let node = &self[id];
        if let (Some(tau), true) = (node.tau_index(), node.has_position()) {
            // tau_index implies mass > 0
            let value = node.lifetime * SPEED_OF_LIGHT / node.mass;
            fit_params.state_vector[tau] = value * self.config.init.tau_seed_factor;
        }
        for daughter in &node.daughters {
            self.init_tau(*daughter, fit_params);
        }
    }

    /// Writes the loose diagonal starting covariance for the subtree of `id`.
    pub fn init_covariance(&self, id: NodeId, fit_params: &mut FitParams) {
        let node = &self[id];
        let init = &self.config.init;
        let cov = &mut fit_params.covariance;
        if let Some(pos) = node.pos_index() {
            for i in 0..3 {
                cov[(pos + i, pos + i)] = init.position_variance;
            }
        }
        if let Some(mom) = node.mom_index() {
            for i in 0..node.mom_dim() {
                cov[(mom + i, mom + i)] = init.momentum_variance;
            }
        }
        if let Some(tau) = node.tau_index() {
            cov[(tau, tau)] = init.tau_variance;
        }
        for daughter in &node.daughters {
            self.init_covariance(*daughter, fit_params);
        }
    }
}

fn round_charge(charge: f64) -> i32 {
    charge.round() as i32
}

/// Midpoint of the closest approach of two straight lines.
pub fn closest_approach(
    r1: &Vector3<f64>,
    d1: &Vector3<f64>,
    r2: &Vector3<f64>,
    d2: &Vector3<f64>,
) -> Vector3<f64> {
    let w0 = r1 - r2;
    let a = d1.dot(d1);
    let b = d1.dot(d2);
    let c = d2.dot(d2);
    let d = d1.dot(&w0);
    let e = d2.dot(&w0);
    let denom = a * c - b * b;
    if denom <= 1e-12 * a * c {
        return (r1 + r2) * 0.5;
    }
    let s = (b * e - c * d) / denom;
    let t = (a * e - b * d) / denom;
    ((r1 + d1 * s) + (r2 + d2 * t)) * 0.5
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::candidate::Candidate;
    use crate::config::OriginConfig;
    use crate::pdg::PdgTable;
    use approx::assert_relative_eq;
    use nalgebra::Matrix6;

    const PION_MASS: f64 = 0.139_570_39;

    fn pion(id: u32, charge: f64, vertex: Vector3<f64>, p: Vector3<f64>) -> Candidate {
        let pdg = (211.0 * charge) as i32;
        Candidate::track(id, pdg, charge, PION_MASS, vertex, p, Matrix6::identity() * 1e-4)
    }

    /// B0 -> D0(-> K_S0(-> pi+ pi-) pi+ pi-) J/psi(-> mu- mu+)
    fn three_level() -> Candidate {
        let v_ks = Vector3::new(2.0, 1.0, 5.0);
        let v_d = Vector3::new(0.02, 0.01, 0.1);
        let ks = Candidate::composite(
            3,
            310,
            vec![
                pion(4, 1.0, v_ks, Vector3::new(0.3, 0.1, 0.5)),
                pion(5, -1.0, v_ks, Vector3::new(0.1, 0.2, 0.6)),
            ],
        );
        let d0 = Candidate::composite(
            2,
            421,
            vec![
                ks,
                pion(6, 1.0, v_d, Vector3::new(0.4, -0.1, 0.3)),
                pion(7, -1.0, v_d, Vector3::new(-0.2, 0.3, 0.7)),
            ],
        );
        let muon = |id: u32, pdg: i32, charge: f64, p: Vector3<f64>| {
            let cov = Matrix6::identity() * 1e-4;
            Candidate::track(id, pdg, charge, 0.1057, Vector3::zeros(), p, cov)
        };
        let jpsi = Candidate::composite(
            8,
            443,
            vec![
                muon(9, 13, -1.0, Vector3::new(1.0, 0.2, 1.0)),
                muon(10, -13, 1.0, Vector3::new(-0.5, 0.4, 1.2)),
            ],
        );
        Candidate::composite(1, 511, vec![d0, jpsi])
    }

    fn build(candidate: &Candidate, config: FitConfig) -> (DecayTree, NodeId) {
        DecayTree::build(candidate, Arc::new(config), PdgTable::default().shared()).unwrap()
    }

    fn subtree_indices(tree: &DecayTree, id: NodeId, out: &mut Vec<usize>) {
        let node = &tree[id];
        if let Some(index) = node.index() {
            out.extend(index..index + node.dim());
        }
        for d in &node.daughters {
            subtree_indices(tree, *d, out);
        }
    }

    #[test]
    fn test_variants_and_dimension() {
        let (tree, head) = build(&three_level(), FitConfig::default());
        assert_eq!(tree[head].kind, NodeKind::InternalComposite);

        let jpsi = tree.locate(CandidateId(8)).unwrap();
        assert_eq!(tree[jpsi].kind, NodeKind::UnfitResonance);
        let ks = tree.locate(CandidateId(3)).unwrap();
        assert_eq!(tree[ks].kind, NodeKind::UnfitComposite);
        assert!(tree[ks].has_tau());

        // B 7 + D0 8 + KS 8 + 6 pions/muons * 3 + J/psi 4
        let total: usize = tree.iter().map(|(_, n)| n.dim()).sum();
        assert_eq!(total, 7 + 8 + 8 + 18 + 4);
        assert_eq!(tree.dim(), Some(total));
    }

    #[test]
    fn test_post_order_indices() {
        let (tree, _) = build(&three_level(), FitConfig::default());
        for (_, node) in tree.iter() {
            let own = node.index().unwrap();
            for d in &node.daughters {
                let mut below = Vec::new();
                subtree_indices(&tree, *d, &mut below);
                assert!(below.iter().all(|i| *i < own), "{} overlaps its mother", tree[*d].name);
            }
        }
        let mut all = Vec::new();
        subtree_indices(&tree, tree.root().unwrap(), &mut all);
        all.sort_unstable();
        all.dedup();
        assert_eq!(all.len(), tree.dim().unwrap());
    }

    #[test]
    fn test_resonance_daughters_share_vertex() {
        let (tree, head) = build(&three_level(), FitConfig::default());
        let head_pos = tree[head].pos_index().unwrap();

        let mut list = Vec::new();
        tree.collect_vertex_daughters(head, &mut list, head_pos);
        let sources: Vec<u32> = list.iter().map(|id| tree[*id].source.unwrap().0).collect();
        // D0, J/psi and both muons are produced at the B vertex
        assert_eq!(sources.len(), 4);
        for expected in [2, 8, 9, 10] {
            assert!(sources.contains(&expected));
        }
    }

    #[test]
    fn test_origin_root() {
        let origin = OriginConfig::with_sigmas([0.0; 3], [0.01, 0.001, 0.3]);
        let config = FitConfig::default().with_origin(origin);
        let (tree, head) = build(&three_level(), config);
        let root = tree.root().unwrap();
        assert!(matches!(tree[root].kind, NodeKind::Origin(_)));
        assert_eq!(tree[head].mother, Some(root));
        assert_eq!(tree[head].kind, NodeKind::UnfitComposite);
        assert!(tree[head].has_tau());
    }

    #[test]
    fn test_remove_daughter() {
        let (mut tree, head) = build(&three_level(), FitConfig::default());
        let before = tree.len();
        let jpsi = tree.locate(CandidateId(8)).unwrap();
        let ks = tree.locate(CandidateId(3)).unwrap();

        // Not a daughter of the head: no-op
        assert!(!tree.remove_daughter(head, ks));
        assert_eq!(tree.len(), before);

        assert!(tree.remove_daughter(head, jpsi));
        assert_eq!(tree.len(), before - 3);
        assert!(tree.locate(CandidateId(9)).is_none());
        assert_eq!(tree.dim(), None);

        let dim = tree.update_index();
        assert_eq!(dim, 7 + 8 + 8 + 12);
    }

    #[test]
    fn test_add_daughter_to_missing_mother() {
        let (mut tree, head) = build(&three_level(), FitConfig::default());
        let jpsi = tree.locate(CandidateId(8)).unwrap();
        assert!(tree.remove_daughter(head, jpsi));
        let before = tree.len();

        let extra = pion(20, 1.0, Vector3::zeros(), Vector3::new(0.2, 0.1, 0.9));
        let result = tree.add_daughter(jpsi, &extra);
        assert!(matches!(result, Err(TreeFitError::BadSetup(_))));
        let result = tree.add_daughter(NodeId(999), &extra);
        assert!(matches!(result, Err(TreeFitError::BadSetup(_))));
        assert_eq!(tree.len(), before);

        // A live composite still accepts it
        let ks = tree.locate(CandidateId(3)).unwrap();
        let added = tree.add_daughter(ks, &extra).unwrap();
        assert_eq!(tree[added].mother, Some(ks));
    }

    #[test]
    fn test_final_charged_candidates() {
        let (tree, head) = build(&three_level(), FitConfig::default());
        assert_eq!(tree.n_final_charged_candidates(head), 6);
        let ks = tree.locate(CandidateId(3)).unwrap();
        assert_eq!(tree.n_final_charged_candidates(ks), 2);
    }

    #[test]
    fn test_chi_square_aggregation() {
        let (tree, head) = build(&three_level(), FitConfig::default());
        let mut params = FitParams::new(tree.dim().unwrap());
        for (i, (id, _)) in tree.iter().enumerate() {
            params.add_chi_square(id, i as f64 + 0.5, 1);
        }

        fn manual(tree: &DecayTree, id: NodeId, params: &FitParams) -> f64 {
            let mut total = params.node_chi_square(id);
            for d in &tree[id].daughters {
                total += manual(tree, *d, params);
            }
            total
        }

        assert_relative_eq!(tree.chi_square(head, &params), manual(&tree, head, &params));
        assert_relative_eq!(tree.chi_square(head, &params), params.chi_square());
    }

    #[test]
    fn test_index_map_pre_order() {
        let (tree, head) = build(&three_level(), FitConfig::default());
        let map = tree.retrieve_index_map();
        assert_eq!(map.len(), tree.len());
        assert_eq!(map[0].0, head);
    }

    #[test]
    fn test_init_state_and_covariance() {
        let (tree, head) = build(&three_level(), FitConfig::default());
        let mut params = FitParams::new(tree.dim().unwrap());
        tree.init_state(&mut params).unwrap();
        tree.init_covariance(head, &mut params);

        // KS vertex from its two tracks meeting at (2, 1, 5)
        let ks = tree.locate(CandidateId(3)).unwrap();
        let pos = tree[ks].pos_index().unwrap();
        assert_relative_eq!(params.state_vector[pos + 2], 5.0, epsilon = 1e-9);

        // KS momentum is the sum of its pions
        let mom = tree[ks].mom_index().unwrap();
        assert_relative_eq!(params.state_vector[mom + 2], 1.1, epsilon = 1e-12);

        // tau seed = lifetime * c / mass * 100
        let tau = tree[ks].tau_index().unwrap();
        let expected = 0.089_54 * SPEED_OF_LIGHT / 0.497_611 * 100.0;
        assert_relative_eq!(params.state_vector[tau], expected, max_relative = 1e-12);

        assert_eq!(params.covariance[(pos, pos)], 50.0);
        assert_eq!(params.covariance[(mom + 3, mom + 3)], 0.5);
        assert_eq!(params.covariance[(tau, tau)], 1000.0);
        assert!(params.test_covariance());
    }

    #[test]
    fn test_closest_approach() {
        let v = closest_approach(
            &Vector3::new(0.0, 0.0, 0.0),
            &Vector3::new(1.0, 0.0, 0.0),
            &Vector3::new(0.0, 1.0, 2.0),
            &Vector3::new(0.0, 0.0, 1.0),
        );
        assert_relative_eq!(v, Vector3::new(0.0, 0.5, 0.0), epsilon = 1e-12);
    }
}
