//! Harness smoke-test runner
//!
//! Loads a topology document, builds a test environment over it, and runs one
//! named scenario against a real service installation.

use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::{Context, Result};
use clap::Parser;

use harness::{Collaborators, TestEnvironment};
use tester::{run_scenario, Scenario, ScenarioOutcome};

#[derive(Parser)]
#[command(name = "tester")]
#[command(about = "Run harness scenarios against a live service installation")]
struct Args {
    /// Topology document (falls back to HARNESS_TOPOLOGY)
    #[arg(long, env = "HARNESS_TOPOLOGY")]
    topology: PathBuf,

    /// Service kind to exercise
    #[arg(long, default_value = "classifier")]
    service: String,

    /// Scenario to run
    #[arg(long, value_enum, default_value_t = Scenario::Smoke)]
    scenario: Scenario,

    /// Service configuration to publish (JSON file); empty object when omitted
    #[arg(long)]
    config: Option<PathBuf>,

    /// Reach nodes over ssh/scp instead of running everything locally
    #[arg(long)]
    remote: bool,

    /// Enable verbose tracing output
    #[arg(long)]
    verbose: bool,

    /// Log level (overrides --verbose)
    #[arg(long)]
    log_level: Option<String>,
}

#[tokio::main]
async fn main() -> Result<ExitCode> {
    dotenv::dotenv().ok();
    let args = Args::parse();

    let level = match (&args.log_level, args.verbose) {
        (Some(level), _) => level.as_str(),
        (None, true) => "debug",
        (None, false) => "info",
    };
    shared::logging::init_tracing(Some(level));

    tracing::info!("Starting harness tester");
    tracing::info!("Scenario: {}, service: {}", args.scenario, args.service);

    let config = match &args.config {
        Some(path) => {
            let raw = std::fs::read_to_string(path)
                .with_context(|| format!("failed to read service config {}", path.display()))?;
            serde_json::from_str(&raw).with_context(|| format!("invalid service config {}", path.display()))?
        }
        None => serde_json::json!({}),
    };

    let collaborators = if args.remote {
        Collaborators::ssh()
    } else {
        Collaborators::local()
    };
    let mut env = TestEnvironment::from_config(&args.topology, collaborators)
        .with_context(|| format!("failed to load topology {}", args.topology.display()))?;

    match run_scenario(&mut env, args.scenario, &args.service, config).await {
        Ok(ScenarioOutcome::Passed(report)) => {
            if !report.is_clean() {
                tracing::warn!(
                    "Scenario passed with teardown findings: {} still running, {} node(s) leaking ports",
                    report.still_running.len(),
                    report.leaked_ports.len()
                );
            }
            tracing::info!("Scenario '{}' completed successfully", args.scenario);
            Ok(ExitCode::SUCCESS)
        }
        Ok(ScenarioOutcome::Skipped { reason }) => {
            tracing::warn!("Scenario '{}' skipped: {}", args.scenario, reason);
            Ok(ExitCode::SUCCESS)
        }
        Err(e) => {
            tracing::error!("Scenario '{}' failed ({:?}): {}", args.scenario, e.category(), e);
            Ok(ExitCode::FAILURE)
        }
    }
}
