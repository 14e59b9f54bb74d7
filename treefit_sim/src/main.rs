//! TreeFit CLI
//!
//! Fit decay candidates from JSON files and run the simulated scenarios.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use clap::{Parser, Subcommand};
use tracing::{error, info, Level};
use tracing_subscriber::FmtSubscriber;
use treefit_core::{Candidate, FitConfig, FitManager, FitStatus, PdgTable};
use treefit_sim::scenarios::ScenarioId;
use treefit_sim::{DecayOracle, ScenarioResult, ScenarioRunner, SimError};

/// TreeFit decay-chain fitter
#[derive(Parser, Debug)]
#[command(name = "treefit")]
#[command(
    about = "Constrained vertex and kinematic fits of particle decay chains",
    long_about = None
)]
struct Args {
    /// Verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    /// JSON output for CI parsing
    #[arg(long, global = true)]
    json: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Fit one candidate tree read from a JSON file
    Fit {
        /// Candidate tree (JSON)
        #[arg(short, long)]
        input: PathBuf,

        /// Fit configuration (JSON); defaults apply when omitted
        #[arg(short, long)]
        config: Option<PathBuf>,
    },

    /// Run simulated scenarios and check the fit statistics
    Simulate {
        /// Scenario to run (two_body, kshort, dstar, b_jpsi_ks, b_ks_pi0, all)
        #[arg(short = 'S', long, default_value = "all")]
        scenario: String,

        /// Master seed for determinism (0 = random from time)
        #[arg(short, long, default_value = "42")]
        seed: u64,

        /// Events per scenario
        #[arg(short, long, default_value = "200")]
        events: usize,
    },

    /// Write one generated event as JSON
    Generate {
        #[arg(short = 'S', long)]
        scenario: String,

        #[arg(short, long, default_value = "42")]
        seed: u64,

        /// Include the true kinematics next to the measured tree
        #[arg(long)]
        with_truth: bool,
    },
}

fn main() {
    let args = Args::parse();

    // Initialize logging
    let level = if args.verbose { Level::DEBUG } else { Level::INFO };
    let subscriber = FmtSubscriber::builder()
        .with_max_level(level)
        .with_writer(std::io::stderr)
        .finish();
    if let Err(e) = tracing::subscriber::set_global_default(subscriber) {
        eprintln!("Failed to set tracing subscriber: {e}");
    }

    let outcome = match &args.command {
        Command::Fit { input, config } => run_fit(input, config.as_deref(), args.json),
        Command::Simulate {
            scenario,
            seed,
            events,
        } => run_simulate(scenario, *seed, *events, args.json),
        Command::Generate {
            scenario,
            seed,
            with_truth,
        } => run_generate(scenario, *seed, *with_truth),
    };

    match outcome {
        Ok(true) => {}
        Ok(false) => std::process::exit(1),
        Err(SimError::Fit(e)) if e.is_setup_error() => {
            error!("Invalid decay tree: {e}");
            std::process::exit(1);
        }
        Err(e) => {
            error!("{e}");
            std::process::exit(1);
        }
    }
}

fn read_json<T: serde::de::DeserializeOwned>(path: &Path) -> Result<T, SimError> {
    let text = std::fs::read_to_string(path)?;
    Ok(serde_json::from_str(&text)?)
}

fn run_fit(input: &Path, config: Option<&Path>, json: bool) -> Result<bool, SimError> {
    let head: Candidate = read_json(input)?;
    let config: FitConfig = match config {
        Some(path) => read_json(path)?,
        None => FitConfig::default(),
    };

    let mut manager = FitManager::new(&head, Arc::new(config), PdgTable::default().shared())?;
    let status = manager.fit();
    let summary = manager.summary();

    if json {
        println!("{}", serde_json::to_string_pretty(&summary)?);
    } else {
        info!(
            "Fit {:?}: chi2 {:.3} / ndf {} after {} iterations",
            status, summary.chi_square, summary.n_dof, summary.n_iterations
        );
        if let Some(reason) = &summary.error {
            error!("  {reason}");
        }
        for particle in &summary.particles {
            let length = particle
                .decay_length
                .map(|(l, e)| format!(" L={l:.4}±{e:.4} cm"))
                .unwrap_or_default();
            info!(
                "  {:>8} m={:.5}±{:.5} vtx=({:.4}, {:.4}, {:.4}){} chi2={:.3}",
                particle.name,
                particle.mass,
                particle.mass_error,
                particle.vertex[0],
                particle.vertex[1],
                particle.vertex[2],
                length,
                particle.chi_square
            );
        }
    }
    Ok(status == FitStatus::Success)
}

fn parse_scenarios(name: &str) -> Result<Vec<ScenarioId>, SimError> {
    if name == "all" {
        Ok(ScenarioId::all())
    } else {
        Ok(vec![name.parse()?])
    }
}

fn run_simulate(scenario: &str, seed: u64, events: usize, json: bool) -> Result<bool, SimError> {
    let scenarios = parse_scenarios(scenario)?;

    // Determine base seed
    let seed = if seed == 0 {
        std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .map(|d| d.as_nanos() as u64)
            .unwrap_or(1)
    } else {
        seed
    };

    if !json {
        info!("TreeFit simulator v{}", env!("CARGO_PKG_VERSION"));
        info!("━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━");
    }

    let runner = ScenarioRunner::new(seed).with_events(events);
    let results: Vec<ScenarioResult> = scenarios.iter().map(|s| runner.run(*s)).collect();
    let failed = results.iter().filter(|r| !r.passed).count();

    if json {
        let summary = serde_json::json!({
            "total": results.len(),
            "passed": results.len() - failed,
            "failed": failed,
            "results": results.iter().map(|r| {
                serde_json::json!({
                    "scenario": r.scenario.name(),
                    "seed": r.seed,
                    "passed": r.passed,
                    "events": r.metrics.events,
                    "convergence_rate": r.metrics.convergence_rate(),
                    "mean_chi2_ndf": r.metrics.mean_chi2_ndf,
                    "mean_p_value": r.metrics.mean_p_value,
                    "pull_mean": r.metrics.pull_mean,
                    "pull_rms": r.metrics.pull_rms,
                    "failure_reason": r.failure_reason,
                })
            }).collect::<Vec<_>>(),
        });
        println!("{}", serde_json::to_string_pretty(&summary)?);
    } else {
        for r in &results {
            let m = &r.metrics;
            if r.passed {
                info!(
                    "✓ {} (seed={}) PASSED: {:.1}% converged, chi2/ndf {:.3}, pull {:.2}±{:.2}",
                    r.scenario.name(),
                    r.seed,
                    100.0 * m.convergence_rate(),
                    m.mean_chi2_ndf,
                    m.pull_mean,
                    m.pull_rms
                );
            } else {
                error!(
                    "✗ {} (seed={}) FAILED: {}",
                    r.scenario.name(),
                    r.seed,
                    r.failure_reason.as_deref().unwrap_or("unknown")
                );
            }
        }
        info!("━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━");
        if failed == 0 {
            info!("All {} scenario runs passed", results.len());
        } else {
            error!("{}/{} scenario runs failed", failed, results.len());
        }
    }
    Ok(failed == 0)
}

fn run_generate(scenario: &str, seed: u64, with_truth: bool) -> Result<bool, SimError> {
    let scenario: ScenarioId = scenario.parse()?;
    let mut oracle = DecayOracle::new(seed);
    let beam_spot = scenario.beam_spot();
    let event = oracle.generate(&scenario.decay(), scenario.head_momentum(), beam_spot.as_ref())?;

    let text = if with_truth {
        serde_json::to_string_pretty(&event)?
    } else {
        serde_json::to_string_pretty(&event.head)?
    };
    println!("{text}");
    Ok(true)
}
