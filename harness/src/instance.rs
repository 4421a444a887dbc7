//! Service Instance lifecycle
//!
//! One service program on one node: a clustered server, a standalone server,
//! or a router proxy. All three share this state machine and differ only in
//! the options they emit and whether they have an identity.
//!
//! ```text
//! Idle ──spawn──▶ Starting ──ready──▶ Ready
//!  ▲                 │                  │
//!  │               timeout            stop/kill
//!  │                 ▼                  ▼
//!  └──reset──── Failed, Stopped ◀───────┘
//! ```
//!
//! An instance holds a leased port exactly while it holds a live process.

use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use nix::sys::signal::Signal;
use rmpv::Value;
use shared::{fixture_debug, fixture_warn, Endpoint, ServiceKind};
use tokio::sync::{Mutex, MutexGuard};

use crate::error::{HarnessError, HarnessResult};
use crate::log_filter::{LogFilter, LogSource};
use crate::node::Node;
use crate::options::CliOptions;
use crate::process::{CapturedOutput, ProcessHandle};
use crate::registry::ServiceSpec;
use crate::rpc::{self, RpcFailure, CLIENT_TIMEOUT, PROBE_TIMEOUT};
use crate::traits::RpcTransport;

pub const RPC_PORT_FLAG: &str = "--rpc-port";

/// Default timeout of a merge request
pub const MERGE_TIMEOUT: Duration = Duration::from_secs(120);

/// Geometric backoff of the readiness probe
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReadinessPolicy {
    pub initial_delay: Duration,
    pub multiplier: u32,
    pub attempts: u32,
    pub probe_timeout: Duration,
}

impl Default for ReadinessPolicy {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_millis(20),
            multiplier: 2,
            attempts: 8,
            probe_timeout: PROBE_TIMEOUT,
        }
    }
}

impl ReadinessPolicy {
    /// Sleep before each probe attempt
    pub fn delays(&self) -> Vec<Duration> {
        let mut delay = self.initial_delay;
        (0..self.attempts)
            .map(|_| {
                let current = delay;
                delay = delay.saturating_mul(self.multiplier);
                current
            })
            .collect()
    }

    pub fn total_sleep(&self) -> Duration {
        self.delays().into_iter().sum()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InstanceVariant {
    /// Joins the named cluster through the coordination service
    ClusteredServer { cluster: String },
    /// Runs from a config file already placed on the node
    StandaloneServer { config_path: String },
    /// Fronts the clustered servers and answers membership queries
    RouterProxy,
}

impl InstanceVariant {
    fn options(&self) -> CliOptions {
        match self {
            InstanceVariant::ClusteredServer { cluster } => CliOptions::new().with("--name", cluster),
            InstanceVariant::StandaloneServer { config_path } => CliOptions::new().with("--configpath", config_path),
            InstanceVariant::RouterProxy => CliOptions::new(),
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            InstanceVariant::ClusteredServer { .. } => "server",
            InstanceVariant::StandaloneServer { .. } => "standalone server",
            InstanceVariant::RouterProxy => "proxy",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleState {
    Idle,
    Starting,
    Ready,
    Stopped,
    Failed,
}

impl LifecycleState {
    /// Holding a process and a leased port
    pub fn is_active(self) -> bool {
        matches!(self, LifecycleState::Starting | LifecycleState::Ready)
    }
}

impl fmt::Display for LifecycleState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            LifecycleState::Idle => "idle",
            LifecycleState::Starting => "starting",
            LifecycleState::Ready => "ready",
            LifecycleState::Stopped => "stopped",
            LifecycleState::Failed => "failed",
        };
        f.write_str(name)
    }
}

/// Where an application client should connect
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientTarget {
    pub endpoint: Endpoint,
    pub cluster: String,
    pub timeout: Duration,
}

pub struct ServiceInstance {
    node: Arc<Node>,
    kind: ServiceKind,
    spec: ServiceSpec,
    variant: InstanceVariant,
    options: CliOptions,
    rpc: Arc<dyn RpcTransport>,
    readiness: ReadinessPolicy,
    state: LifecycleState,
    port: Option<u16>,
    last_port: Option<u16>,
    process: Option<ProcessHandle>,
    identity: Option<String>,
    log_filter: Option<LogFilter>,
}

impl ServiceInstance {
    pub fn new(
        node: Arc<Node>,
        kind: ServiceKind,
        spec: ServiceSpec,
        variant: InstanceVariant,
        options: CliOptions,
        rpc: Arc<dyn RpcTransport>,
    ) -> Self {
        Self {
            node,
            kind,
            spec,
            variant,
            options,
            rpc,
            readiness: ReadinessPolicy::default(),
            state: LifecycleState::Idle,
            port: None,
            last_port: None,
            process: None,
            identity: None,
            log_filter: None,
        }
    }

    /// Override the readiness backoff (fluent API)
    pub fn with_readiness(mut self, readiness: ReadinessPolicy) -> Self {
        self.readiness = readiness;
        self
    }

    pub fn node(&self) -> &Arc<Node> {
        &self.node
    }

    pub fn kind(&self) -> &ServiceKind {
        &self.kind
    }

    pub fn variant(&self) -> &InstanceVariant {
        &self.variant
    }

    pub fn options(&self) -> &CliOptions {
        &self.options
    }

    pub fn state(&self) -> LifecycleState {
        self.state
    }

    pub fn port(&self) -> Option<u16> {
        self.port
    }

    /// Port of the most recent start, kept after stop for log attachment
    pub fn last_port(&self) -> Option<u16> {
        self.last_port
    }

    pub fn is_router(&self) -> bool {
        matches!(self.variant, InstanceVariant::RouterProxy)
    }

    /// Started at least once since the last reset
    pub fn is_used(&self) -> bool {
        self.process.is_some()
    }

    pub fn is_running(&mut self) -> bool {
        self.process.as_mut().is_some_and(ProcessHandle::is_running)
    }

    pub fn program(&self) -> &str {
        match self.variant {
            InstanceVariant::RouterProxy => &self.spec.proxy_program,
            _ => &self.spec.server_program,
        }
    }

    /// Logical cluster name; empty for standalone servers
    pub fn cluster_name(&self) -> HarnessResult<&str> {
        match &self.variant {
            InstanceVariant::ClusteredServer { cluster } => Ok(cluster),
            InstanceVariant::StandaloneServer { .. } => Ok(""),
            InstanceVariant::RouterProxy => Err(HarnessError::invariant("cannot assume cluster name for proxies")),
        }
    }

    /// Full command line for a start on `port`
    ///
    /// User options come first, then the variant's cluster selector, then
    /// the leased port. Repeated flags keep their first value; a user-given
    /// `--rpc-port` is dropped in favor of the lease.
    pub fn argv_for(&self, port: u16) -> Vec<String> {
        let flat = self.options.clone().chain(&self.variant.options()).to_args();

        let mut argv = Vec::with_capacity(flat.len() + 3);
        argv.push(self.program().to_string());
        for pair in flat.chunks(2) {
            if pair[0] == RPC_PORT_FLAG {
                fixture_debug!(self, "squashed option {} in favor of leased port {}", pair.join(" "), port);
                continue;
            }
            argv.extend_from_slice(pair);
        }
        argv.push(RPC_PORT_FLAG.to_string());
        argv.push(port.to_string());
        argv
    }

    pub fn endpoint(&self) -> HarnessResult<Endpoint> {
        self.port
            .map(|port| Endpoint::new(self.node.host(), port))
            .ok_or_else(|| {
                HarnessError::invariant(format!(
                    "port for {self} is not available (maybe not started yet?)"
                ))
            })
    }

    /// Lease a port and launch the program without waiting for readiness
    pub fn spawn(&mut self) -> HarnessResult<()> {
        match self.state {
            LifecycleState::Idle | LifecycleState::Stopped => {}
            LifecycleState::Starting | LifecycleState::Ready => {
                return Err(HarnessError::fixture(format!("{self} is already running")));
            }
            LifecycleState::Failed => {
                return Err(HarnessError::fixture(format!(
                    "{self} failed to start before; reset it first"
                )));
            }
        }

        // The previous run's output stays readable until a port is secured
        let port = self.node.lease_port()?;
        self.clear_memos();
        self.process = None;

        let argv = self.argv_for(port);
        fixture_debug!(self, "starting process: {}", argv.join(" "));

        match self.node.spawn_process(argv) {
            Ok(process) => {
                self.port = Some(port);
                self.last_port = Some(port);
                self.process = Some(process);
                self.state = LifecycleState::Starting;
                Ok(())
            }
            Err(e) => {
                self.node.free_port(port)?;
                self.state = LifecycleState::Failed;
                Err(e)
            }
        }
    }

    /// Probe with geometric backoff until the server answers
    ///
    /// # Errors
    /// `FixtureFailed` carrying the captured output once every attempt is
    /// exhausted; the process is killed and the port freed before returning.
    pub async fn wait_ready(&mut self) -> HarnessResult<()> {
        match self.state {
            LifecycleState::Ready => return Ok(()),
            LifecycleState::Starting => {}
            other => {
                return Err(HarnessError::invariant(format!(
                    "cannot wait for {self} to become ready while {other}"
                )));
            }
        }

        let endpoint = self.endpoint()?;
        fixture_debug!(self, "waiting for RPC server to start up");

        for (attempt, delay) in self.readiness.delays().into_iter().enumerate() {
            tokio::time::sleep(delay).await;

            let outcome = rpc::probe(self.rpc.as_ref(), &endpoint, self.readiness.probe_timeout).await;
            if outcome.is_ready() {
                fixture_debug!(self, "RPC server ready after {} retries", attempt);
                self.state = LifecycleState::Ready;
                return Ok(());
            }
            fixture_debug!(self, "not ready yet: {:?}", outcome);
        }

        fixture_warn!(self, "RPC server startup sync timed out, stopping");
        let output = self.force_stop().await;
        self.state = LifecycleState::Failed;
        Err(HarnessError::fixture(format!(
            "failed to start {self}: stdout = {}, stderr = {}",
            output.stdout, output.stderr
        )))
    }

    /// Spawn and wait for readiness
    pub async fn start(&mut self) -> HarnessResult<()> {
        self.spawn()?;
        self.wait_ready().await
    }

    /// Terminate the process with `signal` and free the port
    pub async fn stop(&mut self, signal: Signal) -> HarnessResult<()> {
        if !self.state.is_active() {
            return Err(HarnessError::fixture(format!("{self} is not running ({})", self.state)));
        }
        fixture_debug!(self, "stopping process with {:?}", signal);

        let stopped = match self.process.as_mut() {
            Some(process) => process.stop(signal).await,
            None => Err(HarnessError::invariant("active instance without a process")),
        };
        let freed = match self.port.take() {
            Some(port) => self.node.free_port(port),
            None => Ok(()),
        };
        self.state = LifecycleState::Stopped;

        stopped?;
        freed
    }

    /// SIGKILL a live process to simulate a crash
    pub async fn kill(&mut self) -> HarnessResult<()> {
        if !self.is_running() {
            return Err(HarnessError::fixture(format!("{self} is not running")));
        }
        self.stop(Signal::SIGKILL).await
    }

    /// Return to `Idle` so the instance can be started again
    pub fn reset(&mut self) -> HarnessResult<()> {
        if self.state.is_active() {
            return Err(HarnessError::invariant(format!("cannot reset {self} while {}", self.state)));
        }
        self.clear_memos();
        self.process = None;
        self.state = LifecycleState::Idle;
        Ok(())
    }

    /// Server identifier in `<address>_<port>` form, memoized until the next start
    pub async fn identity(&mut self) -> HarnessResult<String> {
        if self.is_router() {
            return Err(HarnessError::invariant("proxies have no server identity"));
        }
        if self.state != LifecycleState::Ready {
            return Err(HarnessError::invariant(format!(
                "identity of {self} requested while {}",
                self.state
            )));
        }
        if let Some(identity) = &self.identity {
            fixture_debug!(self, "reusing cached server ID = {}", identity);
            return Ok(identity.clone());
        }

        let endpoint = self.endpoint()?;
        let keys = rpc::status_keys(self.rpc.as_ref(), &endpoint, &self.spec.status_method, "", CLIENT_TIMEOUT).await?;
        let identity = keys
            .into_iter()
            .next()
            .ok_or_else(|| HarnessError::fixture(format!("status reply of {self} names no server")))?;

        fixture_debug!(self, "got reply: server ID = {}", identity);
        self.identity = Some(identity.clone());
        Ok(identity)
    }

    pub fn client_target(&self, cluster: Option<&str>, timeout: Option<Duration>) -> HarnessResult<ClientTarget> {
        let cluster = match cluster {
            Some(cluster) => cluster.to_string(),
            None => self.cluster_name()?.to_string(),
        };
        Ok(ClientTarget {
            endpoint: self.endpoint()?,
            cluster,
            timeout: timeout.unwrap_or(CLIENT_TIMEOUT),
        })
    }

    /// Ask the server to merge its model with the cluster
    pub async fn trigger_merge(&self, timeout: Duration) -> HarnessResult<()> {
        let cluster = self.cluster_name()?;
        let endpoint = self.endpoint()?;

        fixture_debug!(self, "sending {} request with timeout of {:?}", self.spec.merge_method, timeout);
        self.rpc
            .call(&endpoint, &self.spec.merge_method, vec![Value::from(cluster)], timeout)
            .await?;
        fixture_debug!(self, "merge done");
        Ok(())
    }

    /// Fetch a model file written by the server's `save`
    pub async fn saved_model(&mut self, model_id: &str) -> HarnessResult<Vec<u8>> {
        let identity = self.identity().await?;
        let path = format!(
            "{}/{}_{}_{}.{}",
            self.node.workdir(),
            identity,
            self.kind,
            model_id,
            self.spec.model_extension
        );
        self.node.get_file(&path).await
    }

    /// Member identifiers a router currently sees in `cluster`
    ///
    /// A cluster nobody has joined yet reads as empty.
    pub async fn cluster_members(&self, cluster: &str) -> HarnessResult<Vec<String>> {
        if !self.is_router() {
            return Err(HarnessError::invariant(format!("{self} is not a proxy")));
        }
        let endpoint = self.endpoint()?;

        let reply = rpc::status_keys(self.rpc.as_ref(), &endpoint, &self.spec.status_method, cluster, CLIENT_TIMEOUT).await;
        match reply {
            Ok(members) => Ok(members),
            Err(RpcFailure::Remote { message }) if message == format!("no server found: {cluster}") => Ok(Vec::new()),
            Err(failure) => Err(failure.into()),
        }
    }

    /// Captured (stdout, stderr) of the last run
    pub fn log_raw(&self) -> HarnessResult<(&str, &str)> {
        self.process
            .as_ref()
            .and_then(ProcessHandle::output)
            .map(|output| (output.stdout.as_str(), output.stderr.as_str()))
            .ok_or_else(|| {
                HarnessError::invariant(format!(
                    "no log data collected for {self} (maybe the server is not stopped yet?)"
                ))
            })
    }

    /// Every parsed record of the last run, built once
    pub fn log_filter(&mut self) -> HarnessResult<&LogFilter> {
        if self.log_filter.is_none() {
            let (stdout, stderr) = self.log_raw()?;
            let filter = LogFilter::parse(stdout, stderr);
            self.log_filter = Some(filter);
        }
        self.log_filter
            .as_ref()
            .ok_or_else(|| HarnessError::invariant("log filter missing after build"))
    }

    pub fn app_log(&mut self) -> HarnessResult<LogFilter> {
        Ok(self.log_filter()?.source(LogSource::Application))
    }

    pub fn coordination_log(&mut self) -> HarnessResult<LogFilter> {
        Ok(self.log_filter()?.source(LogSource::Coordination))
    }

    fn clear_memos(&mut self) {
        self.identity = None;
        self.log_filter = None;
    }

    async fn force_stop(&mut self) -> CapturedOutput {
        if let Some(process) = self.process.as_mut() {
            if let Err(e) = process.kill().await {
                fixture_warn!(self, "failed to kill process: {}", e);
            }
        }
        if let Some(port) = self.port.take() {
            if let Err(e) = self.node.free_port(port) {
                fixture_warn!(self, "failed to free port {}: {}", port, e);
            }
        }
        self.process
            .as_ref()
            .and_then(ProcessHandle::output)
            .cloned()
            .unwrap_or_default()
    }
}

impl fmt::Display for ServiceInstance {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}@{}", self.variant.label(), self.program(), self.node.host())?;
        if let Some(port) = self.port {
            write!(f, ":{port}")?;
        }
        Ok(())
    }
}

/// Shared handle to an instance owned by the test environment
#[derive(Clone)]
pub struct InstanceRef(Arc<Mutex<ServiceInstance>>);

impl InstanceRef {
    pub fn new(instance: ServiceInstance) -> Self {
        Self(Arc::new(Mutex::new(instance)))
    }

    pub async fn lock(&self) -> MutexGuard<'_, ServiceInstance> {
        self.0.lock().await
    }

    pub fn same_instance(&self, other: &InstanceRef) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }

    pub async fn spawn(&self) -> HarnessResult<()> {
        self.lock().await.spawn()
    }

    pub async fn wait_ready(&self) -> HarnessResult<()> {
        self.lock().await.wait_ready().await
    }

    pub async fn start(&self) -> HarnessResult<()> {
        self.lock().await.start().await
    }

    pub async fn stop(&self, signal: Signal) -> HarnessResult<()> {
        self.lock().await.stop(signal).await
    }

    pub async fn kill(&self) -> HarnessResult<()> {
        self.lock().await.kill().await
    }

    pub async fn reset(&self) -> HarnessResult<()> {
        self.lock().await.reset()
    }

    pub async fn identity(&self) -> HarnessResult<String> {
        self.lock().await.identity().await
    }

    pub async fn cluster_name(&self) -> HarnessResult<String> {
        self.lock().await.cluster_name().map(str::to_string)
    }

    pub async fn cluster_members(&self, cluster: &str) -> HarnessResult<Vec<String>> {
        self.lock().await.cluster_members(cluster).await
    }

    pub async fn state(&self) -> LifecycleState {
        self.lock().await.state()
    }

    pub async fn port(&self) -> Option<u16> {
        self.lock().await.port()
    }

    pub async fn is_running(&self) -> bool {
        self.lock().await.is_running()
    }

    /// Start, hand a client target to `body`, and stop on every exit path
    ///
    /// Proxies are rejected: they serve many clusters and have no single
    /// client identity.
    pub async fn run<F, Fut, T>(&self, body: F) -> HarnessResult<T>
    where
        F: FnOnce(ClientTarget) -> Fut,
        Fut: Future<Output = HarnessResult<T>>,
    {
        let target = {
            let mut instance = self.lock().await;
            if instance.is_router() {
                return Err(HarnessError::invariant("cannot use the scoped form with proxies"));
            }
            instance.start().await?;
            instance.client_target(None, None)
        };

        let outcome = match target {
            Ok(target) => body(target).await,
            Err(e) => Err(e),
        };
        let stopped = self.stop(Signal::SIGTERM).await;

        let value = outcome?;
        stopped?;
        Ok(value)
    }
}

impl fmt::Debug for InstanceRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.0.try_lock() {
            Ok(instance) => write!(f, "InstanceRef({instance})"),
            Err(_) => write!(f, "InstanceRef(<busy>)"),
        }
    }
}
