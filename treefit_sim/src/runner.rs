//! Scenario runner - fits batches of simulated events.

use std::sync::Arc;

use tracing::{debug, info, warn};
use treefit_core::{CandidateId, FitConfig, FitManager, FitStatus, PdgTable, SharedProperties};

use crate::oracle::{DecayOracle, DetectorResolution};
use crate::scenarios::ScenarioId;

/// Results from running a scenario.
#[derive(Debug, Clone)]
pub struct ScenarioResult {
    /// Scenario that was run
    pub scenario: ScenarioId,

    /// Seed used
    pub seed: u64,

    /// Whether the fit statistics meet the acceptance cuts
    pub passed: bool,

    /// Failure message if any
    pub failure_reason: Option<String>,

    /// Statistics collected during the run
    pub metrics: ScenarioMetrics,
}

/// Fit statistics over all events of a run.
#[derive(Debug, Clone, Default)]
pub struct ScenarioMetrics {
    /// Events generated
    pub events: usize,

    /// Fits ending with `FitStatus::Success`
    pub converged: usize,

    /// Events rejected at tree construction
    pub setup_failures: usize,

    /// Mean chi2/ndf of converged fits
    pub mean_chi2_ndf: f64,

    /// Mean fit probability of converged fits
    pub mean_p_value: f64,

    /// Mean of the head-vertex z pull
    pub pull_mean: f64,

    /// RMS of the head-vertex z pull
    pub pull_rms: f64,

    /// Mean number of global iterations
    pub mean_iterations: f64,
}

impl ScenarioMetrics {
    pub fn convergence_rate(&self) -> f64 {
        if self.events == 0 {
            return 0.0;
        }
        self.converged as f64 / self.events as f64
    }
}

/// Acceptance cuts applied to a run.
#[derive(Debug, Clone)]
pub struct Acceptance {
    /// Minimum fraction of converged fits (default: 0.95)
    pub min_convergence: f64,

    /// Maximum |<chi2/ndf> - 1| (default: 0.35)
    pub chi2_ndf_tolerance: f64,

    /// Maximum |<pull>| (default: 0.3)
    pub pull_bias: f64,

    /// Allowed pull RMS range (default: 0.7 to 1.3)
    pub pull_width: (f64, f64),
}

impl Default for Acceptance {
    fn default() -> Self {
        Self {
            min_convergence: 0.95,
            chi2_ndf_tolerance: 0.35,
            pull_bias: 0.3,
            pull_width: (0.7, 1.3),
        }
    }
}

/// Runs decay scenarios.
pub struct ScenarioRunner {
    /// Configuration seed
    seed: u64,

    /// Events per scenario
    events: usize,

    /// Detector smearing
    resolution: DetectorResolution,

    acceptance: Acceptance,

    properties: SharedProperties,
}

impl ScenarioRunner {
    /// Creates a new scenario runner.
    pub fn new(seed: u64) -> Self {
        Self {
            seed,
            events: 200,
            resolution: DetectorResolution::default(),
            acceptance: Acceptance::default(),
            properties: PdgTable::default().shared(),
        }
    }

    /// Sets the number of events per scenario.
    pub fn with_events(mut self, events: usize) -> Self {
        self.events = events;
        self
    }

    /// Sets the detector resolution.
    pub fn with_resolution(mut self, resolution: DetectorResolution) -> Self {
        self.resolution = resolution;
        self
    }

    /// Sets the acceptance cuts.
    pub fn with_acceptance(mut self, acceptance: Acceptance) -> Self {
        self.acceptance = acceptance;
        self
    }

    /// Runs a scenario and returns the result.
    pub fn run(&self, scenario: ScenarioId) -> ScenarioResult {
        info!(
            "Starting scenario: {} (seed={}, events={})",
            scenario.name(),
            self.seed,
            self.events
        );

        let config = Arc::new(scenario.fit_config());
        let spec = scenario.decay();
        let beam_spot = scenario.beam_spot();
        let mut oracle = DecayOracle::new(self.seed).with_resolution(self.resolution.clone());

        let mut metrics = ScenarioMetrics {
            events: self.events,
            ..ScenarioMetrics::default()
        };
        let mut chi2_ndf_sum = 0.0;
        let mut p_value_sum = 0.0;
        let mut iterations_sum = 0usize;
        let mut pulls = Vec::with_capacity(self.events);

        for event_number in 0..self.events {
            let event = match oracle.generate(&spec, scenario.head_momentum(), beam_spot.as_ref()) {
                Ok(event) => event,
                Err(e) => {
                    warn!("Event {event_number}: generation failed: {e}");
                    metrics.setup_failures += 1;
                    continue;
                }
            };

            let mut manager = match self.build(&event.head, &config) {
                Ok(manager) => manager,
                Err(e) => {
                    warn!("Event {event_number}: {e}");
                    metrics.setup_failures += 1;
                    continue;
                }
            };

            let status = manager.fit();
            iterations_sum += manager.n_iterations();
            if status != FitStatus::Success {
                debug!(
                    "Event {event_number}: {:?} ({})",
                    status,
                    manager.error().map(ToString::to_string).unwrap_or_default()
                );
                continue;
            }
            metrics.converged += 1;

            if manager.n_dof() > 0 {
                chi2_ndf_sum += manager.chi_square() / manager.n_dof() as f64;
            }
            p_value_sum += manager.p_value().unwrap_or(0.0);

            let head_id = event.head.id;
            if let Some(pull) = head_vertex_pull(&manager, head_id, &event) {
                pulls.push(pull);
            }
        }

        if metrics.converged > 0 {
            metrics.mean_chi2_ndf = chi2_ndf_sum / metrics.converged as f64;
            metrics.mean_p_value = p_value_sum / metrics.converged as f64;
        }
        if self.events > 0 {
            metrics.mean_iterations = iterations_sum as f64 / self.events as f64;
        }
        if !pulls.is_empty() {
            let n = pulls.len() as f64;
            metrics.pull_mean = pulls.iter().sum::<f64>() / n;
            let mean = metrics.pull_mean;
            let variance = pulls.iter().map(|p| (p - mean).powi(2)).sum::<f64>() / n;
            metrics.pull_rms = variance.sqrt();
        }

        let failure_reason = self.assess(&metrics);
        ScenarioResult {
            scenario,
            seed: self.seed,
            passed: failure_reason.is_none(),
            failure_reason,
            metrics,
        }
    }

    fn build(
        &self,
        head: &treefit_core::Candidate,
        config: &Arc<FitConfig>,
    ) -> Result<FitManager, treefit_core::TreeFitError> {
        FitManager::new(head, config.clone(), self.properties.clone())
    }

    fn assess(&self, metrics: &ScenarioMetrics) -> Option<String> {
        let cuts = &self.acceptance;
        if metrics.convergence_rate() < cuts.min_convergence {
            return Some(format!(
                "Convergence rate {:.1}% below {:.1}%",
                100.0 * metrics.convergence_rate(),
                100.0 * cuts.min_convergence
            ));
        }
        if (metrics.mean_chi2_ndf - 1.0).abs() > cuts.chi2_ndf_tolerance {
            return Some(format!(
                "Mean chi2/ndf {:.3} outside 1 ± {}",
                metrics.mean_chi2_ndf, cuts.chi2_ndf_tolerance
            ));
        }
        if metrics.pull_mean.abs() > cuts.pull_bias {
            return Some(format!("Vertex pull bias {:.3}", metrics.pull_mean));
        }
        let (low, high) = cuts.pull_width;
        if metrics.pull_rms < low || metrics.pull_rms > high {
            return Some(format!(
                "Vertex pull width {:.3} outside [{low}, {high}]",
                metrics.pull_rms
            ));
        }
        None
    }
}

/// (fitted − true) / error of the head's decay-vertex z coordinate.
fn head_vertex_pull(
    manager: &FitManager,
    head: CandidateId,
    event: &crate::oracle::GeneratedEvent,
) -> Option<f64> {
    let fitted = manager.fitted_candidate(head)?;
    let truth = event.truth_of(head)?.decay_vertex?;
    let sigma = fitted.covariance[2][2].sqrt();
    if sigma > 0.0 {
        Some((fitted.vertex[2] - truth.z) / sigma)
    } else {
        None
    }
}
