//! Collaborator traits with mockall annotations for testing
//!
//! The harness core never talks to the outside world directly. Command
//! execution, file transfer, cluster config publication, and RPC go through
//! these seams so that local and remote targets, as well as test doubles,
//! plug in without touching the lifecycle code.

use std::collections::BTreeMap;
use std::time::Duration;

use shared::{Endpoint, ServiceKind};
use tokio::process::Command;

use crate::error::HarnessResult;
use crate::rpc::RpcFailure;

/// Environment variables overlaid on a spawned process
pub type EnvOverlay = BTreeMap<String, String>;

/// What to run, where, and for how long
#[derive(Debug, Clone, PartialEq)]
pub struct CommandSpec {
    pub host: String,
    pub argv: Vec<String>,
    pub env: EnvOverlay,
    pub timeout: Option<Duration>,
}

impl CommandSpec {
    pub fn new<S: Into<String>>(host: S, argv: Vec<String>) -> Self {
        Self {
            host: host.into(),
            argv,
            env: EnvOverlay::new(),
            timeout: None,
        }
    }

    pub fn with_env(mut self, env: EnvOverlay) -> Self {
        self.env = env;
        self
    }

    pub fn with_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn program(&self) -> Option<&str> {
        self.argv.first().map(String::as_str)
    }
}

/// Command execution transport
///
/// Turns a [`CommandSpec`] into a ready-to-spawn command. Stdio wiring and
/// supervision are left to [`crate::process::ProcessHandle`].
pub trait CommandChannel: Send + Sync + std::fmt::Debug {
    fn command(&self, spec: &CommandSpec) -> HarnessResult<Command>;
}

/// File transfer to and from test nodes
#[mockall::automock]
#[async_trait::async_trait]
pub trait FileChannel: Send + Sync {
    async fn put_file(&self, host: &str, data: &[u8], path: &str) -> HarnessResult<()>;

    async fn get_file(&self, host: &str, path: &str) -> HarnessResult<Vec<u8>>;

    async fn delete_file(&self, host: &str, path: &str) -> HarnessResult<()>;
}

/// Publishes a cluster's config payload to the coordination store
#[mockall::automock]
#[async_trait::async_trait]
pub trait ConfigPublisher: Send + Sync {
    /// Write `payload` for `cluster` of `kind`
    ///
    /// # Returns
    /// `FixtureFailed` with the tool's diagnostics when publication fails,
    /// `ResourceSkip` when the environment cannot publish at all.
    async fn publish(
        &self,
        kind: &ServiceKind,
        cluster: &str,
        ensemble: &str,
        payload: &serde_json::Value,
    ) -> HarnessResult<()>;
}

/// Request/response RPC to a running server
#[mockall::automock]
#[async_trait::async_trait]
pub trait RpcTransport: Send + Sync {
    async fn call(
        &self,
        endpoint: &Endpoint,
        method: &str,
        params: Vec<rmpv::Value>,
        timeout: Duration,
    ) -> Result<rmpv::Value, RpcFailure>;
}
