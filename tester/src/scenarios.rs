//! Test Scenarios
//!
//! Each scenario builds its fixtures through the environment, checks what it
//! came for, and always leaves teardown to [`run_scenario`].

use std::fmt;

use harness::{CliOptions, HarnessError, HarnessResult, Signal, TeardownReport, TestEnvironment};
use shared::{fixture_info, fixture_warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
pub enum Scenario {
    /// One clustered server: start, identify, stop, no leaked ports
    Smoke,
    /// One server per node behind a router, wait for convergence
    Membership,
}

impl fmt::Display for Scenario {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Scenario::Smoke => write!(f, "smoke"),
            Scenario::Membership => write!(f, "membership"),
        }
    }
}

/// How a scenario ended
#[derive(Debug)]
pub enum ScenarioOutcome {
    Passed(TeardownReport),
    /// The environment lacks something the scenario needs
    Skipped { reason: String },
}

/// Run `scenario` for service `kind` and tear the environment down afterwards
///
/// Resource shortages come back as [`ScenarioOutcome::Skipped`]; any other
/// failure is returned after teardown, with the raw logs of used instances
/// written at `warn`.
pub async fn run_scenario(
    env: &mut TestEnvironment,
    scenario: Scenario,
    kind: &str,
    config: serde_json::Value,
) -> HarnessResult<ScenarioOutcome> {
    let class = format!("{scenario}::{kind}");
    env.initialize_test_class(&class);

    let result = match scenario {
        Scenario::Smoke => smoke(env, kind, config).await,
        Scenario::Membership => membership(env, kind, config).await,
    };

    let report = env.finalize_test_case(result.is_err()).await;
    for log in &report.attached_logs {
        fixture_warn!(class, "log of {} on {}:{:?}\n{}", log.kind, log.host, log.last_port, log.raw);
    }
    env.finalize_test_class(&class);

    match result {
        Ok(()) => {
            fixture_info!(class, "PASSED");
            Ok(ScenarioOutcome::Passed(report))
        }
        Err(HarnessError::ResourceSkip { reason }) => {
            fixture_info!(class, "SKIPPED: {}", reason);
            Ok(ScenarioOutcome::Skipped { reason })
        }
        Err(e) => Err(e),
    }
}

async fn smoke(env: &mut TestEnvironment, kind: &str, config: serde_json::Value) -> HarnessResult<()> {
    let node = env.get_node(0)?;
    let mut cluster = env.cluster(kind, config, None).await?;
    let server = env.server(&node, &mut cluster, CliOptions::new())?;

    server.start().await?;
    let identity = server.identity().await?;
    let expected = match server.port().await {
        Some(port) => format!("{}_{}", node.host(), port),
        None => return Err(HarnessError::invariant("ready server without a port")),
    };
    if identity != expected {
        return Err(HarnessError::fixture(format!(
            "server identity {identity} does not match {expected}"
        )));
    }
    server.stop(Signal::SIGTERM).await?;

    if node.ports_in_use() != 0 {
        return Err(HarnessError::fixture(format!(
            "{} port(s) still leased on {} after stop",
            node.ports_in_use(),
            node
        )));
    }
    Ok(())
}

async fn membership(env: &mut TestEnvironment, kind: &str, config: serde_json::Value) -> HarnessResult<()> {
    let mut cluster = env.cluster(kind, config, None).await?;
    let mut servers = Vec::new();
    for index in 0..env.topology().node_count() {
        let node = env.get_node(index)?;
        servers.push(env.server(&node, &mut cluster, CliOptions::new())?);
    }

    let router_node = env.get_node(0)?;
    let router = env.proxy(&router_node, kind, CliOptions::new())?;

    cluster.start().await?;
    router.start().await?;
    env.wait_for_servers(&router, &servers).await?;

    router.stop(Signal::SIGTERM).await?;
    cluster.stop(Signal::SIGTERM).await
}
