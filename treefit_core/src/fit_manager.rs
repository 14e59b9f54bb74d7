//! Fit driver: global iterations, convergence control and result extraction.

use std::sync::Arc;

use nalgebra::{DMatrix, Vector3};
use serde::{Deserialize, Serialize};
use statrs::distribution::{ChiSquared, ContinuousCDF};
use tracing::{debug, warn};

use crate::candidate::{to_rows, Candidate, CandidateId, Matrix7};
use crate::config::FitConfig;
use crate::decay_chain::DecayChain;
use crate::error::TreeFitError;
use crate::fit_params::FitParams;
use crate::particle::NodeId;
use crate::pdg::{SharedProperties, SPEED_OF_LIGHT};
use crate::tree::DecayTree;

/// Outcome of a fit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FitStatus {
    UnFitted,
    Success,
    NonConverged,
    Failed,
    BadInput,
}

/// Decision after one global iteration.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Verdict {
    Continue,
    Converged,
    FastDiverging(f64),
    SlowDiverging,
}

/// Chi-square bookkeeping across global iterations.
#[derive(Debug, Clone)]
pub struct ConvergenceTracker {
    previous: f64,
    n_diverging: usize,
    precision: f64,
    max_diverging: usize,
}

impl ConvergenceTracker {
    pub fn new(config: &FitConfig) -> Self {
        Self {
            previous: -1.0,
            n_diverging: 0,
            precision: config.precision,
            max_diverging: config.max_diverging,
        }
    }

    /// Classifies iteration `iteration` with total `chi_square` over `n_dof`.
    pub fn step(&mut self, iteration: usize, chi_square: f64, n_dof: i64) -> Verdict {
        let delta = chi_square - self.previous;
        let previous = self.previous;
        self.previous = chi_square;

        if iteration == 0 {
            return Verdict::Continue;
        }
        if delta.abs() < self.precision {
            return Verdict::Converged;
        }
        let quit = (3.0 * n_dof as f64).max(3.0 * previous);
        if iteration > 1 && delta > quit {
            return Verdict::FastDiverging(delta);
        }
        if delta > 0.0 {
            self.n_diverging += 1;
            if self.n_diverging >= self.max_diverging {
                return Verdict::SlowDiverging;
            }
        } else {
            self.n_diverging = 0;
        }
        Verdict::Continue
    }
}

/// Fitted parameters of one node, as reported to callers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FittedParticle {
    pub id: CandidateId,
    pub name: String,
    pub pdg_code: i32,
    /// Decay vertex; the production vertex for final-state particles
    pub vertex: [f64; 3],
    pub momentum: [f64; 4],
    /// (x, y, z, px, py, pz, E)
    pub covariance: [[f64; 7]; 7],
    pub mass: f64,
    pub mass_error: f64,
    /// Flight distance and error (cm)
    pub decay_length: Option<(f64, f64)>,
    /// Proper lifetime and error (ns)
    pub lifetime: Option<(f64, f64)>,
    pub chi_square: f64,
    pub n_dof: i64,
}

/// Serializable report of a whole fit.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FitSummary {
    pub status: FitStatus,
    pub error: Option<String>,
    pub chi_square: f64,
    pub n_dof: i64,
    pub p_value: Option<f64>,
    pub n_iterations: usize,
    pub particles: Vec<FittedParticle>,
}

/// Fits one decay chain.
pub struct FitManager {
    chain: DecayChain,
    fit_params: FitParams,
    config: Arc<FitConfig>,
    status: FitStatus,
    error: Option<TreeFitError>,
    chi_square: f64,
    n_dof: i64,
    n_iterations: usize,
}

impl FitManager {
    /// Builds the decay chain for `head`. Setup errors are returned here;
    /// numerical trouble is reported by `fit` through the status.
    pub fn new(
        head: &Candidate,
        config: Arc<FitConfig>,
        properties: SharedProperties,
    ) -> Result<Self, TreeFitError> {
        let chain = DecayChain::new(head, config.clone(), properties)?;
        let fit_params = FitParams::new(chain.dim());
        Ok(Self {
            chain,
            fit_params,
            config,
            status: FitStatus::UnFitted,
            error: None,
            chi_square: -1.0,
            n_dof: 0,
            n_iterations: 0,
        })
    }

    /// Runs the global iterations and returns the final status.
    pub fn fit(&mut self) -> FitStatus {
        self.status = FitStatus::UnFitted;
        self.error = None;
        self.chi_square = -1.0;
        self.n_iterations = 0;

        if let Err(e) = self.chain.initialize(&mut self.fit_params) {
            warn!("TreeFitter: initialisation failed: {e}");
            self.error = Some(e);
            self.status = FitStatus::BadInput;
            return self.status;
        }

        let mut tracker = ConvergenceTracker::new(&self.config);
        let mut finished = false;
        let mut iteration = 0;
        while iteration < self.config.max_iterations && !finished {
            let result = if iteration == 0 {
                self.chain.filter(&mut self.fit_params)
            } else {
                let reference = self.fit_params.clone();
                self.fit_params.reset_covariance();
                self.chain.init_covariance(&mut self.fit_params);
                self.chain.filter_with_reference(&mut self.fit_params, &reference)
            };
            self.n_iterations = iteration + 1;

            if let Err(e) = result {
                warn!("TreeFitter: iteration {iteration} aborted: {e}");
                self.error = Some(e);
                self.status = FitStatus::Failed;
                break;
            }

            let chi_square = self.fit_params.chi_square();
            let n_dof = self.fit_params.n_dof();
            let delta = chi_square - self.chi_square;
            debug!("TreeFitter: iteration {iteration}: chi2 {chi_square:.5}/{n_dof} ({delta:+.5})");

            match tracker.step(iteration, chi_square, n_dof) {
                Verdict::Continue => {}
                Verdict::Converged => {
                    self.status = FitStatus::Success;
                    finished = true;
                }
                Verdict::FastDiverging(delta) => {
                    self.error = Some(TreeFitError::FastDivergingFit(delta));
                    self.status = FitStatus::Failed;
                    finished = true;
                }
                Verdict::SlowDiverging => {
                    self.error = Some(TreeFitError::SlowDivergingFit(iteration + 1));
                    self.status = FitStatus::NonConverged;
                    finished = true;
                }
            }
            self.chi_square = chi_square;
            self.n_dof = n_dof;
            iteration += 1;
        }

        if self.status == FitStatus::UnFitted {
            self.status = FitStatus::NonConverged;
        }
        // Any outcome with an unusable covariance is a failure
        if !self.fit_params.test_covariance() {
            if self.error.is_none() {
                self.error = Some(TreeFitError::BadCovariance);
            }
            self.status = FitStatus::Failed;
        }
        debug!(
            "TreeFitter: {:?} after {} iterations, chi2/ndf {:.3}/{}",
            self.status, self.n_iterations, self.chi_square, self.n_dof
        );
        self.status
    }

    pub fn status(&self) -> FitStatus {
        self.status
    }

    /// Error recorded next to a non-success status.
    pub fn error(&self) -> Option<&TreeFitError> {
        self.error.as_ref()
    }

    pub fn chi_square(&self) -> f64 {
        self.chi_square
    }

    pub fn n_dof(&self) -> i64 {
        self.n_dof
    }

    pub fn n_iterations(&self) -> usize {
        self.n_iterations
    }

    /// Probability of a larger chi-square; None without degrees of freedom.
    pub fn p_value(&self) -> Option<f64> {
        if self.n_dof <= 0 || self.chi_square < 0.0 {
            return None;
        }
        let dist = ChiSquared::new(self.n_dof as f64).ok()?;
        Some(dist.sf(self.chi_square))
    }

    pub fn fit_params(&self) -> &FitParams {
        &self.fit_params
    }

    pub fn chain(&self) -> &DecayChain {
        &self.chain
    }

    fn tree(&self) -> &DecayTree {
        self.chain.tree()
    }

    pub fn pos_index(&self, candidate: CandidateId) -> Option<usize> {
        self.chain.pos_index(candidate)
    }

    pub fn mom_index(&self, candidate: CandidateId) -> Option<usize> {
        self.chain.mom_index(candidate)
    }

    pub fn tau_index(&self, candidate: CandidateId) -> Option<usize> {
        self.chain.tau_index(candidate)
    }

    /// Flight distance of `candidate` from its production vertex, with error.
    pub fn decay_length(&self, candidate: CandidateId) -> Option<(f64, f64)> {
        let tau = self.tau_index(candidate)?;
        Some((self.fit_params.state_vector[tau], self.fit_params.error(tau)))
    }

    /// Proper lifetime `t = L m / (|p| c)` in ns, with error from the
    /// (tau, p) covariance block.
    pub fn lifetime(&self, candidate: CandidateId) -> Option<(f64, f64)> {
        let id = self.chain.locate(candidate)?;
        let node = &self.tree()[id];
        let (tau, mom) = (node.tau_index()?, node.mom_index()?);

        let state = &self.fit_params.state_vector;
        let length = state[tau];
        let momentum: Vector3<f64> = state.fixed_rows::<3>(mom).clone_owned();
        let p = momentum.norm();
        if p == 0.0 {
            return None;
        }
        let scale = node.mass / SPEED_OF_LIGHT;
        let t = length * scale / p;

        // Jacobian over (tau, px, py, pz)
        let indices = [tau, mom, mom + 1, mom + 2];
        let mut jacobian = [0.0; 4];
        jacobian[0] = scale / p;
        for k in 0..3 {
            jacobian[k + 1] = -length * scale * momentum[k] / (p * p * p);
        }
        let mut variance = 0.0;
        for (a, ia) in indices.iter().enumerate() {
            for (b, ib) in indices.iter().enumerate() {
                variance += jacobian[a] * self.fit_params.covariance[(*ia, *ib)] * jacobian[b];
            }
        }
        Some((t, variance.max(0.0).sqrt()))
    }

    /// Jacobian from the state onto (x, y, z, px, py, pz, E) of `id`.
    fn jacobian7(&self, id: NodeId) -> Option<DMatrix<f64>> {
        let tree = self.tree();
        let node = &tree[id];
        let mom = node.mom_index()?;
        let state = &self.fit_params.state_vector;
        let p4 = tree.momentum4(id, state)?;

        let mut jacobian = DMatrix::zeros(7, self.fit_params.dim());
        if let Some(vertex) = tree.decay_vertex_index(id) {
            for i in 0..3 {
                jacobian[(i, vertex + i)] = 1.0;
            }
        }
        for k in 0..3 {
            jacobian[(3 + k, mom + k)] = 1.0;
        }
        if node.has_energy() {
            jacobian[(6, mom + 3)] = 1.0;
        } else if p4[3] > 0.0 {
            for k in 0..3 {
                jacobian[(6, mom + k)] = p4[k] / p4[3];
            }
        }
        Some(jacobian)
    }

    /// 7×7 covariance of `candidate` in (x, y, z, px, py, pz, E) order.
    pub fn cov7(&self, candidate: CandidateId) -> Option<Matrix7> {
        let id = self.chain.locate(candidate)?;
        let jacobian = self.jacobian7(id)?;
        let cov = &jacobian * &self.fit_params.covariance * jacobian.transpose();
        Some(Matrix7::from_fn(|i, j| cov[(i, j)]))
    }

    /// Fitted parameters of `candidate`; None if it is not part of the fit tree.
    pub fn fitted_candidate(&self, candidate: CandidateId) -> Option<FittedParticle> {
        let id = self.chain.locate(candidate)?;
        self.fitted_node(id)
    }

    fn fitted_node(&self, id: NodeId) -> Option<FittedParticle> {
        let tree = self.tree();
        let node = &tree[id];
        let source = node.source?;
        let state = &self.fit_params.state_vector;
        let p4 = tree.momentum4(id, state)?;
        let covariance = self.cov7(source)?;

        let vertex = tree
            .decay_vertex_index(id)
            .map(|v| [state[v], state[v + 1], state[v + 2]])
            .unwrap_or([0.0; 3]);

        let mass2 = p4[3] * p4[3] - p4.xyz().norm_squared();
        let mass = mass2.max(0.0).sqrt();
        let mass_error = if mass > 0.0 {
            // dm/d(p, E) = (-p, E) / m on the (px..E) block
            let mut variance = 0.0;
            let grad = [-p4[0] / mass, -p4[1] / mass, -p4[2] / mass, p4[3] / mass];
            for a in 0..4 {
                for b in 0..4 {
                    variance += grad[a] * covariance[(3 + a, 3 + b)] * grad[b];
                }
            }
            variance.max(0.0).sqrt()
        } else {
            0.0
        };

        Some(FittedParticle {
            id: source,
            name: node.name.clone(),
            pdg_code: node.pdg_code,
            vertex,
            momentum: p4.into(),
            covariance: to_rows(&covariance),
            mass,
            mass_error,
            decay_length: self.decay_length(source),
            lifetime: self.lifetime(source),
            chi_square: tree.chi_square(id, &self.fit_params),
            n_dof: tree.n_dof(id, &self.fit_params),
        })
    }

    /// Fitted parameters of every candidate in the fit tree, pre-order.
    pub fn fitted_tree(&self) -> Vec<FittedParticle> {
        self.tree()
            .retrieve_index_map()
            .into_iter()
            .filter_map(|(id, _)| self.fitted_node(id))
            .collect()
    }

    pub fn summary(&self) -> FitSummary {
        FitSummary {
            status: self.status,
            error: self.error.as_ref().map(ToString::to_string),
            chi_square: self.chi_square,
            n_dof: self.n_dof,
            p_value: self.p_value(),
            n_iterations: self.n_iterations,
            particles: self.fitted_tree(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{InitConfig, OriginConfig};
    use crate::pdg::PdgTable;
    use approx::assert_relative_eq;
    use nalgebra::Matrix6;

    const KAON_MASS: f64 = 0.493_677;
    const PION_MASS: f64 = 0.139_570_39;

    /// D0 -> K- pi+ with both tracks passing exactly through `vertex`.
    fn d0(vertex: Vector3<f64>) -> Candidate {
        let cov = Matrix6::identity() * 1e-4;
        let kaon_p = Vector3::new(0.86, 0.05, 1.5);
        let pion_p = Vector3::new(-0.86, -0.05, 1.5);
        Candidate::composite(
            0,
            421,
            vec![
                Candidate::track(1, -321, -1.0, KAON_MASS, vertex, kaon_p, cov),
                Candidate::track(2, 211, 1.0, PION_MASS, vertex, pion_p, cov),
            ],
        )
    }

    fn manager(candidate: &Candidate, config: FitConfig) -> FitManager {
        FitManager::new(candidate, Arc::new(config), PdgTable::default().shared()).unwrap()
    }

    #[test]
    fn test_consistent_tracks_converge() {
        let vertex = Vector3::new(0.1, -0.05, 0.4);
        let mut fit = manager(&d0(vertex), FitConfig::default());
        assert_eq!(fit.status(), FitStatus::UnFitted);

        assert_eq!(fit.fit(), FitStatus::Success);
        assert!(fit.error().is_none());
        assert_eq!(fit.n_dof(), 1);
        assert!(fit.chi_square() < 1e-6);
        assert!(fit.n_iterations() >= 2);

        let head = fit.fitted_candidate(CandidateId(0)).unwrap();
        assert_relative_eq!(Vector3::from(head.vertex), vertex, epsilon = 1e-6);
        assert_relative_eq!(head.momentum[2], 3.0, epsilon = 1e-6);
        assert!(head.decay_length.is_none());
    }

    #[test]
    fn test_mass_constraint_pins_invariant_mass() {
        let vertex = Vector3::new(0.0, 0.0, 0.3);
        let mut fit = manager(&d0(vertex), FitConfig::default().with_mass_constraint(421));
        assert_eq!(fit.fit(), FitStatus::Success);
        assert_eq!(fit.n_dof(), 2);

        let head = fit.fitted_candidate(CandidateId(0)).unwrap();
        assert_relative_eq!(head.mass, 1.864_84, epsilon = 1e-4);
        assert!(head.mass_error < 1e-4);
        assert!(fit.chi_square() > 0.0);
        let p = fit.p_value().unwrap();
        assert!((0.0..=1.0).contains(&p));
    }

    #[test]
    fn test_flight_length_and_lifetime() {
        // The D0 flies 0.2 cm from the beam spot along its momentum
        let length = 0.2;
        let vertex = Vector3::z() * length;
        let origin = OriginConfig::with_sigmas([0.0; 3], [1e-3, 1e-3, 1e-3]);
        let config = FitConfig::default().with_origin(origin);

        let mut fit = manager(&d0(vertex), config);
        assert_eq!(fit.fit(), FitStatus::Success);
        // 5 + 5 + 3 beam + 3 geometric + 4 kinematic rows over 3 + 3 + 3 + 8 parameters
        assert_eq!(fit.n_dof(), 3);

        let (l, l_err) = fit.decay_length(CandidateId(0)).unwrap();
        assert_relative_eq!(l, length, epsilon = 1e-5);
        assert!(l_err > 0.0 && l_err < 0.1);

        let p = fit.fitted_candidate(CandidateId(0)).unwrap().momentum;
        let p_norm = Vector3::new(p[0], p[1], p[2]).norm();
        let (t, t_err) = fit.lifetime(CandidateId(0)).unwrap();
        assert_relative_eq!(t, length * 1.864_84 / (p_norm * SPEED_OF_LIGHT), max_relative = 1e-4);
        assert!(t_err > 0.0);
    }

    #[test]
    fn test_leaf_reports_production_vertex() {
        let vertex = Vector3::new(0.1, -0.05, 0.4);
        let mut fit = manager(&d0(vertex), FitConfig::default());
        fit.fit();
        let kaon = fit.fitted_candidate(CandidateId(1)).unwrap();
        assert_relative_eq!(Vector3::from(kaon.vertex), vertex, epsilon = 1e-6);
        // Energy from the nominal kaon mass
        let p = Vector3::new(kaon.momentum[0], kaon.momentum[1], kaon.momentum[2]);
        let energy = (p.norm_squared() + KAON_MASS * KAON_MASS).sqrt();
        assert_relative_eq!(kaon.momentum[3], energy, epsilon = 1e-12);
        assert_relative_eq!(kaon.mass, KAON_MASS, epsilon = 1e-9);

        let cov = fit.cov7(CandidateId(1)).unwrap();
        assert_relative_eq!(cov, cov.transpose(), epsilon = 1e-15);
        assert!(cov[(6, 6)] > 0.0);
    }

    #[test]
    fn test_fitted_tree_and_summary() {
        let mut fit = manager(&d0(Vector3::new(0.0, 0.1, 0.2)), FitConfig::default());
        fit.fit();
        let tree = fit.fitted_tree();
        assert_eq!(tree.len(), 3);
        assert_eq!(tree[0].id, CandidateId(0));

        let summary = fit.summary();
        let json = serde_json::to_string(&summary).unwrap();
        assert!(json.contains("\"status\":\"success\""));
    }

    #[test]
    fn test_degenerate_covariance_fails_unconverged_fit() {
        // A zero position seed leaves the vertex variance at zero
        let config = FitConfig {
            max_iterations: 1,
            init: InitConfig {
                position_variance: 0.0,
                ..InitConfig::default()
            },
            ..FitConfig::default()
        };

        let mut fit = manager(&d0(Vector3::new(0.0, 0.0, 0.2)), config);
        assert_eq!(fit.fit(), FitStatus::Failed);
        assert_eq!(fit.error(), Some(&TreeFitError::BadCovariance));
        assert_eq!(fit.n_iterations(), 1);
    }

    #[test]
    fn test_unconverged_fit_with_sound_covariance() {
        let config = FitConfig {
            max_iterations: 1,
            ..FitConfig::default()
        };
        let mut fit = manager(&d0(Vector3::new(0.0, 0.0, 0.2)), config);
        assert_eq!(fit.fit(), FitStatus::NonConverged);
        assert!(fit.error().is_none());
    }

    #[test]
    fn test_unknown_species_is_a_setup_error() {
        let mut candidate = d0(Vector3::zeros());
        candidate.daughters[0].pdg_code = 999_999;
        let config = Arc::new(FitConfig::default());
        let result = FitManager::new(&candidate, config, PdgTable::default().shared());
        assert!(matches!(result, Err(TreeFitError::UnknownParticle(999_999))));
    }

    #[test]
    fn test_tracker_converges_on_small_change() {
        let mut tracker = ConvergenceTracker::new(&FitConfig::default());
        assert_eq!(tracker.step(0, 5.0, 2), Verdict::Continue);
        assert_eq!(tracker.step(1, 4.0, 2), Verdict::Continue);
        assert_eq!(tracker.step(2, 3.9995, 2), Verdict::Converged);
    }

    #[test]
    fn test_tracker_fast_divergence() {
        let mut tracker = ConvergenceTracker::new(&FitConfig::default());
        tracker.step(0, 2.0, 1);
        tracker.step(1, 1.0, 1);
        // Jump beyond max(3 ndf, 3 chi2_prev) = 3
        assert_eq!(tracker.step(2, 5.0, 1), Verdict::FastDiverging(4.0));
    }

    #[test]
    fn test_tracker_slow_divergence() {
        let mut tracker = ConvergenceTracker::new(&FitConfig::default());
        tracker.step(0, 10.0, 5);
        assert_eq!(tracker.step(1, 10.5, 5), Verdict::Continue);
        // A decrease resets the counter
        assert_eq!(tracker.step(2, 10.2, 5), Verdict::Continue);
        assert_eq!(tracker.step(3, 10.4, 5), Verdict::Continue);
        assert_eq!(tracker.step(4, 10.6, 5), Verdict::Continue);
        assert_eq!(tracker.step(5, 10.8, 5), Verdict::SlowDiverging);
    }
}
