//! Residuals and Jacobians of every constraint kind.
//!
//! Each projector reads the state of the nodes it couples, evaluates the
//! residual vector at that state and fills the matching columns of `H`.
//! Measurement constraints also set the covariance `V` of the measurement,
//! expressed in the space of the residuals.

use nalgebra::{DMatrix, Matrix3, Vector3, Vector4};

use crate::config::MassConstraintMode;
use crate::constraint::{Constraint, ConstraintKind};
use crate::error::TreeFitError;
use crate::fit_params::FitParams;
use crate::particle::{ClusterData, CompositeData, NodeId, NodeKind, OriginData, TrackData};
use crate::projection::Projection;
use crate::tree::DecayTree;

impl DecayTree {
    /// Linearises `constraint` at the state held by `fit_params`.
    pub fn project_constraint(
        &self,
        constraint: &Constraint,
        fit_params: &FitParams,
    ) -> Result<Projection, TreeFitError> {
        let id = constraint.node;
        let node = &self[id];
        let unsupported = || {
            let target = format!("{} ({})", node.name, node.kind.name());
            TreeFitError::unsupported(constraint.kind, target)
        };
        let mut projection = Projection::new(constraint.dim, fit_params.dim());

        match (constraint.kind, &node.kind) {
            (ConstraintKind::Beamspot, NodeKind::Origin(origin)) => {
                self.project_beamspot(id, origin, fit_params, &mut projection)
            }
            (ConstraintKind::Track, NodeKind::ResolvedTrack(track)) => {
                self.project_track(id, track, fit_params, &mut projection)?
            }
            (ConstraintKind::Photon, NodeKind::ResolvedPhoton(cluster))
            | (ConstraintKind::NeutralCluster, NodeKind::ResolvedNeutralCluster(cluster)) => {
                self.project_cluster(id, cluster, fit_params, &mut projection)?
            }
            (ConstraintKind::Composite, NodeKind::ResolvedComposite(composite)) => {
                self.project_composite(id, composite, fit_params, &mut projection)
            }
            (ConstraintKind::Geometric, _) if node.has_tau() => {
                self.project_geometric(id, fit_params, &mut projection)?
            }
            (ConstraintKind::Kinematic, _) if node.has_energy() && node.kind.has_daughters() => {
                self.project_kinematic(id, fit_params, &mut projection)
            }
            (ConstraintKind::Mass, _) if node.has_energy() => {
                match self.config().mass_constraint_mode {
                    MassConstraintMode::Daughters if !node.daughters.is_empty() => {
                        self.project_mass_daughters(id, fit_params, &mut projection)
                    }
                    _ => self.project_mass_particle(id, fit_params, &mut projection),
                }
            }
            _ => return Err(unsupported()),
        }
        Ok(projection)
    }

    fn production_vertex_or_err(
        &self,
        id: NodeId,
        kind: ConstraintKind,
    ) -> Result<usize, TreeFitError> {
        self.production_vertex_index(id).ok_or_else(|| {
            TreeFitError::unsupported(kind, format!("{} without production vertex", self[id].name))
        })
    }

    /// r = x − x_beam
    fn project_beamspot(
        &self,
        id: NodeId,
        origin: &OriginData,
        fit_params: &FitParams,
        p: &mut Projection,
    ) {
        let Some(pos) = self[id].pos_index() else { return };
        let x = fit_params.state_vector.fixed_rows::<3>(pos);
        for row in 0..3 {
            p.residuals[row] = x[row] - origin.position[row];
            p.h[(row, pos + row)] = 1.0;
        }
        let v = p.v_mut();
        for i in 0..3 {
            for j in 0..3 {
                v[(i, j)] = origin.covariance[(i, j)];
            }
        }
    }

    /// Straight trajectory through the production vertex: transverse offsets
    /// of the vertex from the measured line, and the momentum difference.
    fn project_track(
        &self,
        id: NodeId,
        track: &TrackData,
        fit_params: &FitParams,
        p: &mut Projection,
    ) -> Result<(), TreeFitError> {
        let vertex = self.production_vertex_or_err(id, ConstraintKind::Track)?;
        let Some(mom) = self[id].mom_index() else {
            return Err(TreeFitError::unsupported(ConstraintKind::Track, &self[id].name));
        };
        let state = &fit_params.state_vector;
        let offset = state.fixed_rows::<3>(vertex) - track.reference;
        let momentum = state.fixed_rows::<3>(mom);

        p.residuals[0] = track.u.dot(&offset);
        p.residuals[1] = track.v.dot(&offset);
        for i in 0..3 {
            p.residuals[2 + i] = momentum[i] - track.momentum[i];
            p.h[(0, vertex + i)] = track.u[i];
            p.h[(1, vertex + i)] = track.v[i];
            p.h[(2 + i, mom + i)] = 1.0;
        }
        let v = p.v_mut();
        for i in 0..5 {
            for j in 0..5 {
                v[(i, j)] = track.covariance[(i, j)];
            }
        }
        Ok(())
    }

    /// Cluster direction seen from the production vertex, plus the energy
    /// for photons. The dominant axis `i1` is eliminated:
    /// `r_a = d_a − p_a d_i1 / p_i1` with `d = x_cluster − x_vertex`.
    fn project_cluster(
        &self,
        id: NodeId,
        cluster: &ClusterData,
        fit_params: &FitParams,
        p: &mut Projection,
    ) -> Result<(), TreeFitError> {
        let kind = if cluster.energy.is_some() {
            ConstraintKind::Photon
        } else {
            ConstraintKind::NeutralCluster
        };
        let vertex = self.production_vertex_or_err(id, kind)?;
        let Some(mom) = self[id].mom_index() else {
            return Err(TreeFitError::unsupported(kind, &self[id].name));
        };
        let state = &fit_params.state_vector;
        let d = cluster.position - state.fixed_rows::<3>(vertex);
        let momentum: Vector3<f64> = state.fixed_rows::<3>(mom).clone_owned();

        let [i1, i2, i3] = cluster.axes;
        if momentum[i1] == 0.0 {
            return Err(TreeFitError::Degenerate(format!(
                "{} has no momentum along its dominant axis",
                self[id].name
            )));
        }
        let p_i1 = momentum[i1];
        for (row, a) in [i2, i3].into_iter().enumerate() {
            p.residuals[row] = d[a] - momentum[a] * d[i1] / p_i1;
            p.h[(row, vertex + a)] = -1.0;
            p.h[(row, vertex + i1)] = momentum[a] / p_i1;
            p.h[(row, mom + a)] = -d[i1] / p_i1;
            p.h[(row, mom + i1)] = momentum[a] * d[i1] / (p_i1 * p_i1);
        }

        let mut g = DMatrix::zeros(cluster.dim(), 4);
        g.view_mut((0, 0), (2, 3)).copy_from(&cluster.position_jacobian(&momentum));
        if let Some(energy) = cluster.energy {
            let norm = momentum.norm();
            p.residuals[2] = norm - energy;
            for k in 0..3 {
                p.h[(2, mom + k)] = momentum[k] / norm;
            }
            g[(2, 3)] = -1.0;
        }
        let v4 = DMatrix::from_column_slice(4, 4, cluster.covariance.as_slice());
        p.v = Some(&g * v4 * g.transpose());
        Ok(())
    }

    /// r = (x, p4) − measured
    fn project_composite(
        &self,
        id: NodeId,
        composite: &CompositeData,
        fit_params: &FitParams,
        p: &mut Projection,
    ) {
        let node = &self[id];
        let (Some(pos), Some(mom)) = (node.pos_index(), node.mom_index()) else {
            return;
        };
        let state = &fit_params.state_vector;
        for row in 0..3 {
            p.residuals[row] = state[pos + row] - composite.vertex[row];
            p.h[(row, pos + row)] = 1.0;
        }
        for row in 0..4 {
            p.residuals[3 + row] = state[mom + row] - composite.momentum[row];
            p.h[(3 + row, mom + row)] = 1.0;
        }
        p.v = Some(DMatrix::from_column_slice(7, 7, composite.covariance.as_slice()));
    }

    /// The decay vertex lies `tau` along the momentum direction from the
    /// production vertex: `r = x_m + tau p/|p| − x`.
    fn project_geometric(
        &self,
        id: NodeId,
        fit_params: &FitParams,
        p: &mut Projection,
    ) -> Result<(), TreeFitError> {
        let node = &self[id];
        let mother_pos = self.production_vertex_or_err(id, ConstraintKind::Geometric)?;
        let indices = (node.pos_index(), node.tau_index(), node.mom_index());
        let (Some(pos), Some(tau), Some(mom)) = indices else {
            return Err(TreeFitError::unsupported(ConstraintKind::Geometric, &node.name));
        };
        let state = &fit_params.state_vector;
        let x_m = state.fixed_rows::<3>(mother_pos);
        let x = state.fixed_rows::<3>(pos);
        let length = state[tau];
        let momentum: Vector3<f64> = state.fixed_rows::<3>(mom).clone_owned();

        let norm = momentum.norm();
        if norm == 0.0 {
            return Err(TreeFitError::Degenerate(format!("{} has zero momentum", node.name)));
        }
        let direction = momentum / norm;
        // d(p/|p|)/dp = (I − n nᵀ) / |p|
        let d_direction = (Matrix3::identity() - direction * direction.transpose()) / norm;

        for row in 0..3 {
            p.residuals[row] = x_m[row] + length * direction[row] - x[row];
            p.h[(row, mother_pos + row)] += 1.0;
            p.h[(row, pos + row)] -= 1.0;
            p.h[(row, tau)] = direction[row];
            for col in 0..3 {
                p.h[(row, mom + col)] = length * d_direction[(row, col)];
            }
        }
        Ok(())
    }

    /// Momentum conservation: `r = p4 − Σ p4_daughters`.
    fn project_kinematic(&self, id: NodeId, fit_params: &FitParams, p: &mut Projection) {
        let node = &self[id];
        let Some(mom) = node.mom_index() else { return };
        let state = &fit_params.state_vector;

        let mut residual: Vector4<f64> = state.fixed_rows::<4>(mom).clone_owned();
        for row in 0..4 {
            p.h[(row, mom + row)] = 1.0;
        }
        for daughter in &node.daughters {
            let d_mom = self[*daughter].mom_index();
            let (Some(d_mom), Some(p4)) = (d_mom, self.momentum4(*daughter, state)) else {
                continue;
            };
            residual -= p4;
            for row in 0..3 {
                p.h[(row, d_mom + row)] = -1.0;
            }
            if self[*daughter].has_energy() {
                p.h[(3, d_mom + 3)] = -1.0;
            } else {
                for k in 0..3 {
                    p.h[(3, d_mom + k)] = -p4[k] / p4[3];
                }
            }
        }
        for row in 0..4 {
            p.residuals[row] = residual[row];
        }
    }

    /// `r = E² − |p|² − m²` on the node's own 4-momentum.
    fn project_mass_particle(&self, id: NodeId, fit_params: &FitParams, p: &mut Projection) {
        let node = &self[id];
        let Some(mom) = node.mom_index() else { return };
        let p4 = fit_params.state_vector.fixed_rows::<4>(mom);
        let mass = node.mass;

        let p_squared = p4[0] * p4[0] + p4[1] * p4[1] + p4[2] * p4[2];
        p.residuals[0] = -mass * mass + p4[3] * p4[3] - p_squared;
        for k in 0..3 {
            p.h[(0, mom + k)] = -2.0 * p4[k];
        }
        p.h[(0, mom + 3)] = 2.0 * p4[3];
    }

    /// `r = m² − E_sum² + |p_sum|²` on the daughters' momenta; daughters
    /// without an energy parameter enter with their nominal mass.
    fn project_mass_daughters(&self, id: NodeId, fit_params: &FitParams, p: &mut Projection) {
        let node = &self[id];
        let state = &fit_params.state_vector;
        let mass = node.mass;

        let mut sum = Vector4::zeros();
        for daughter in &node.daughters {
            if let Some(p4) = self.momentum4(*daughter, state) {
                sum += p4;
            }
        }
        let p_squared = sum[0] * sum[0] + sum[1] * sum[1] + sum[2] * sum[2];
        p.residuals[0] = mass * mass - sum[3] * sum[3] + p_squared;

        for daughter in &node.daughters {
            let d_mom = self[*daughter].mom_index();
            let (Some(d_mom), Some(p4)) = (d_mom, self.momentum4(*daughter, state)) else {
                continue;
            };
            if self[*daughter].has_energy() {
                for k in 0..3 {
                    p.h[(0, d_mom + k)] = 2.0 * sum[k];
                }
                p.h[(0, d_mom + 3)] = -2.0 * sum[3];
            } else {
                for k in 0..3 {
                    p.h[(0, d_mom + k)] = 2.0 * sum[k] - 2.0 * sum[3] * p4[k] / p4[3];
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::candidate::{Candidate, CandidateId};
    use crate::config::{FitConfig, OriginConfig};
    use crate::pdg::PdgTable;
    use approx::assert_relative_eq;
    use nalgebra::{Matrix3, Matrix4, Matrix6};
    use std::sync::Arc;

    fn track(id: u32, pdg: i32, p: Vector3<f64>) -> Candidate {
        let charge = if pdg > 0 { 1.0 } else { -1.0 };
        let vertex = Vector3::new(0.1, 0.0, 0.2);
        Candidate::track(id, pdg, charge, 0.139_570_39, vertex, p, Matrix6::identity() * 1e-4)
    }

    /// D0 -> K_S0(pi+ pi-) pi0(gamma gamma) pi+ K_L0, with a beam spot.
    fn decay() -> Candidate {
        let ks = Candidate::composite(
            2,
            310,
            vec![
                track(3, 211, Vector3::new(0.3, 0.1, 0.9)),
                track(4, -211, Vector3::new(-0.2, 0.4, 0.7)),
            ],
        );
        let cluster_cov = Matrix4::identity() * 0.01;
        let pi0 = Candidate::composite(
            5,
            111,
            vec![
                Candidate::photon(
                    6,
                    Vector3::new(30.0, 20.0, 100.0),
                    0.8,
                    Vector3::new(0.2, 0.15, 0.75),
                    cluster_cov,
                ),
                Candidate::photon(
                    7,
                    Vector3::new(-40.0, 10.0, 90.0),
                    0.6,
                    Vector3::new(-0.25, 0.05, 0.55),
                    cluster_cov,
                ),
            ],
        );
        let klong = Candidate::neutral_cluster(
            9,
            130,
            Vector3::new(50.0, 130.0, 40.0),
            Vector4::new(0.3, 0.8, 0.25, 1.05),
            Matrix3::identity() * 2.0,
        );
        let pion = track(8, 211, Vector3::new(0.5, -0.3, 1.2));
        Candidate::composite(1, 421, vec![ks, pi0, pion, klong])
    }

    fn config() -> FitConfig {
        FitConfig::default()
            .with_origin(OriginConfig::with_sigmas([0.0; 3], [0.01, 0.002, 0.4]))
            .with_mass_constraint(111)
            .with_mass_constraint(310)
            .with_mass_constraint(421)
    }

    fn build(config: FitConfig) -> DecayTree {
        DecayTree::build(&decay(), Arc::new(config), PdgTable::default().shared()).unwrap().0
    }

    /// A state with every component away from zero.
    fn scrambled(dim: usize) -> FitParams {
        let mut params = FitParams::new(dim);
        for i in 0..dim {
            params.state_vector[i] = 1.0 + 0.37 * ((i * 7) % 11) as f64;
        }
        params
    }

    fn constraints(tree: &DecayTree) -> Vec<Constraint> {
        let mut list = Vec::new();
        tree.add_to_constraint_list(tree.root().unwrap(), &mut list, 0);
        list
    }

    fn check_jacobians(tree: &DecayTree) {
        let params = scrambled(tree.dim().unwrap());
        let eps = 1e-6;
        for constraint in constraints(tree) {
            let projection = tree.project_constraint(&constraint, &params).unwrap();
            for col in 0..params.dim() {
                let mut up = params.clone();
                up.state_vector[col] += eps;
                let mut down = params.clone();
                down.state_vector[col] -= eps;
                let r_up = tree.project_constraint(&constraint, &up).unwrap().residuals;
                let r_down = tree.project_constraint(&constraint, &down).unwrap().residuals;
                for row in 0..constraint.dim {
                    let numeric = (r_up[row] - r_down[row]) / (2.0 * eps);
                    let analytic = projection.h[(row, col)];
                    assert_relative_eq!(numeric, analytic, epsilon = 1e-5, max_relative = 1e-6);
                }
            }
        }
    }

    #[test]
    fn test_constraint_inventory() {
        let tree = build(config());
        let kinds: Vec<ConstraintKind> = constraints(&tree).iter().map(|c| c.kind).collect();
        let count = |k| kinds.iter().filter(|x| **x == k).count();
        assert_eq!(count(ConstraintKind::Beamspot), 1);
        assert_eq!(count(ConstraintKind::Track), 3);
        assert_eq!(count(ConstraintKind::Photon), 2);
        assert_eq!(count(ConstraintKind::NeutralCluster), 1);
        // D0 and K_S0 fly, the pi0 decays in place
        assert_eq!(count(ConstraintKind::Geometric), 2);
        assert_eq!(count(ConstraintKind::Kinematic), 3);
        assert_eq!(count(ConstraintKind::Mass), 3);
    }

    #[test]
    fn test_jacobians_match_finite_differences() {
        check_jacobians(&build(config()));
    }

    #[test]
    fn test_daughter_mass_jacobians_match_finite_differences() {
        check_jacobians(&build(config().with_mass_constraint_mode(MassConstraintMode::Daughters)));
    }

    #[test]
    fn test_geometric_residual_vanishes_on_trajectory() {
        let tree = build(config());
        let d0 = tree.locate(CandidateId(1)).unwrap();
        let node = &tree[d0];
        let mut params = FitParams::new(tree.dim().unwrap());

        // Beam spot at 0, D0 flying 5 cm along z
        let pos = node.pos_index().unwrap();
        let tau = node.tau_index().unwrap();
        let mom = node.mom_index().unwrap();
        params.state_vector[pos + 2] = 5.0;
        params.state_vector[tau] = 5.0;
        params.state_vector[mom + 2] = 1.0;

        let constraint = Constraint::new(d0, ConstraintKind::Geometric, 1, 3);
        let projection = tree.project_constraint(&constraint, &params).unwrap();
        assert_relative_eq!(projection.residuals.norm(), 0.0, epsilon = 1e-12);
    }

    #[test]
    fn test_mass_residual_sign() {
        let tree = build(config());
        let d0 = tree.locate(CandidateId(1)).unwrap();
        let mom = tree[d0].mom_index().unwrap();
        let mut params = FitParams::new(tree.dim().unwrap());
        params.state_vector[mom + 2] = 1.0;
        params.state_vector[mom + 3] = 3.0;

        let constraint = Constraint::new(d0, ConstraintKind::Mass, 1, 1);
        let projection = tree.project_constraint(&constraint, &params).unwrap();
        // Heavier than nominal gives a positive residual
        let expected = 9.0 - 1.0 - tree[d0].mass * tree[d0].mass;
        assert_relative_eq!(projection.residuals[0], expected, epsilon = 1e-12);
        assert!(projection.residuals[0] > 0.0);
        assert!(projection.v.is_none());
    }

    #[test]
    fn test_unsupported_pairs() {
        let tree = build(config());
        let pion = tree.locate(CandidateId(8)).unwrap();
        let pi0 = tree.locate(CandidateId(5)).unwrap();
        let params = scrambled(tree.dim().unwrap());

        for (node, kind) in [
            (pion, ConstraintKind::Geometric),
            (pion, ConstraintKind::Mass),
            (pi0, ConstraintKind::Geometric),
            (pi0, ConstraintKind::Track),
        ] {
            let result = tree.project_constraint(&Constraint::new(node, kind, 0, 3), &params);
            assert!(
                matches!(result, Err(TreeFitError::UnsupportedConstraint { .. })),
                "{kind} on {node}"
            );
        }
    }

    #[test]
    fn test_photon_covariance_is_symmetric() {
        let tree = build(config());
        let photon = tree.locate(CandidateId(6)).unwrap();
        let params = scrambled(tree.dim().unwrap());
        let projection = tree
            .project_constraint(&Constraint::new(photon, ConstraintKind::Photon, 3, 3), &params)
            .unwrap();
        let v = projection.v.unwrap();
        assert_eq!(v.shape(), (3, 3));
        assert_relative_eq!(v.clone(), v.transpose(), epsilon = 1e-12);
        assert_relative_eq!(v[(2, 2)], 0.01, epsilon = 1e-12);
    }
}
