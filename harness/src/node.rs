//! Node and port pool
//!
//! A node is one host from the topology with the ports tests may lease on it.
//! Every port is either leased or free, never both; `ports_in_use` is what
//! teardown inspects for leaks.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use shared::{NodeRecord, Topology};
use tracing::debug;
use uuid::Uuid;

use crate::error::{HarnessError, HarnessResult};
use crate::process::{CapturedOutput, ProcessHandle};
use crate::traits::{CommandChannel, CommandSpec, EnvOverlay, FileChannel};

/// Scoping defaults every node inherits from the topology
#[derive(Debug, Clone, Default, PartialEq)]
pub struct NodeScope {
    pub workdir: String,
    pub prefix: Option<String>,
    pub variables: BTreeMap<String, String>,
    pub timeout: Option<Duration>,
}

impl NodeScope {
    pub fn from_topology(topology: &Topology) -> Self {
        Self {
            workdir: topology.workdir().to_string(),
            prefix: topology.prefix().map(str::to_string),
            variables: topology.variables().clone(),
            timeout: topology.remote_process_timeout(),
        }
    }
}

pub struct Node {
    index: usize,
    host: String,
    owned: Vec<u16>,
    free: Mutex<BTreeSet<u16>>,
    scope: NodeScope,
    channel: Arc<dyn CommandChannel>,
    files: Arc<dyn FileChannel>,
}

impl Node {
    pub fn new(
        index: usize,
        record: &NodeRecord,
        scope: NodeScope,
        channel: Arc<dyn CommandChannel>,
        files: Arc<dyn FileChannel>,
    ) -> Self {
        let mut owned = Vec::with_capacity(record.ports.len());
        for port in &record.ports {
            if !owned.contains(port) {
                owned.push(*port);
            }
        }
        let free = owned.iter().copied().collect();

        Self {
            index,
            host: record.host.clone(),
            owned,
            free: Mutex::new(free),
            scope,
            channel,
            files,
        }
    }

    pub fn index(&self) -> usize {
        self.index
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn workdir(&self) -> &str {
        &self.scope.workdir
    }

    pub fn owned_ports(&self) -> &[u16] {
        &self.owned
    }

    pub(crate) fn channel(&self) -> Arc<dyn CommandChannel> {
        self.channel.clone()
    }

    /// Take the lowest free port
    ///
    /// # Errors
    /// `ResourceSkip` when every port is leased; the node is too small for
    /// the test, which is not a defect.
    pub fn lease_port(&self) -> HarnessResult<u16> {
        let port = self
            .free
            .lock()
            .pop_first()
            .ok_or_else(|| HarnessError::skip(format!("insufficient number of ports for node {}", self.host)))?;
        debug!("leased port {} for host {}", port, self.host);
        Ok(port)
    }

    /// Return a leased port to the pool
    ///
    /// # Errors
    /// `InvariantViolation` on a double free or a port this node does not
    /// own; the pool is left unchanged.
    pub fn free_port(&self, port: u16) -> HarnessResult<()> {
        if !self.owned.contains(&port) {
            return Err(HarnessError::invariant(format!(
                "port {port} is not a member port of host {}",
                self.host
            )));
        }
        if !self.free.lock().insert(port) {
            return Err(HarnessError::invariant(format!(
                "double free for port {port} on host {} detected",
                self.host
            )));
        }
        debug!("freed port {} for host {}", port, self.host);
        Ok(())
    }

    pub fn ports_in_use(&self) -> usize {
        self.owned.len() - self.free.lock().len()
    }

    /// Ports currently leased, in ascending order
    pub fn leased_ports(&self) -> Vec<u16> {
        let free = self.free.lock();
        let mut leased: Vec<u16> = self.owned.iter().copied().filter(|p| !free.contains(p)).collect();
        leased.sort_unstable();
        leased
    }

    /// Environment overlay for processes spawned on this node
    ///
    /// With a prefix, its `bin` goes in front of `PATH` and its library
    /// directories become `LD_LIBRARY_PATH`; topology variables win.
    pub fn env_overlay(&self) -> EnvOverlay {
        let mut env = EnvOverlay::new();
        if let Some(prefix) = &self.scope.prefix {
            env.insert("PATH".to_string(), format!("{prefix}/bin:${{PATH}}"));
            env.insert("LD_LIBRARY_PATH".to_string(), format!("{prefix}/lib:{prefix}/lib64"));
        }
        env.extend(self.scope.variables.iter().map(|(k, v)| (k.clone(), v.clone())));
        env
    }

    pub fn command_spec(&self, argv: Vec<String>) -> CommandSpec {
        CommandSpec::new(self.host.clone(), argv)
            .with_env(self.env_overlay())
            .with_timeout(self.scope.timeout)
    }

    /// Start a supervised process on this node
    pub fn spawn_process(&self, argv: Vec<String>) -> HarnessResult<ProcessHandle> {
        let mut process = ProcessHandle::new(self.channel.clone(), self.command_spec(argv));
        process.start()?;
        Ok(process)
    }

    /// Run a process on this node to completion
    pub async fn run_process(&self, argv: Vec<String>, input: Option<&[u8]>) -> HarnessResult<CapturedOutput> {
        ProcessHandle::run(self.channel.clone(), self.command_spec(argv), input).await
    }

    /// Write `data` to `path`, or to a fresh temporary path under the workdir
    ///
    /// # Returns
    /// The path written on the node.
    pub async fn put_file(&self, data: &[u8], path: Option<&str>) -> HarnessResult<String> {
        let path = match path {
            Some(path) => path.to_string(),
            None => format!("{}/harness.tmp.{}", self.scope.workdir, Uuid::new_v4().simple()),
        };
        debug!("sending {} bytes to host {}: {}", data.len(), self.host, path);
        self.files.put_file(&self.host, data, &path).await?;
        Ok(path)
    }

    pub async fn get_file(&self, path: &str) -> HarnessResult<Vec<u8>> {
        debug!("downloading file {} on host {}", path, self.host);
        self.files.get_file(&self.host, path).await
    }

    pub async fn delete_file(&self, path: &str) -> HarnessResult<()> {
        debug!("deleting file {} on host {}", path, self.host);
        self.files.delete_file(&self.host, path).await
    }
}

impl fmt::Debug for Node {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Node")
            .field("index", &self.index)
            .field("host", &self.host)
            .field("owned", &self.owned)
            .field("in_use", &self.ports_in_use())
            .field("scope", &self.scope)
            .finish()
    }
}

impl fmt::Display for Node {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "node {} ({})", self.index, self.host)
    }
}
