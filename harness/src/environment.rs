//! Test Environment Coordinator
//!
//! Composition root of the harness. Owns the topology, materializes nodes on
//! demand, builds every fixture a test case uses, and tears them down between
//! test cases.

use std::collections::BTreeMap;
use std::fmt;
use std::path::Path;
use std::sync::Arc;

use nix::sys::signal::Signal;
use shared::{fixture_debug, fixture_info, fixture_warn, ServiceKind, Topology};

use crate::cluster::ClusterFixture;
use crate::error::{HarnessError, HarnessResult};
use crate::instance::{InstanceRef, InstanceVariant, ReadinessPolicy, ServiceInstance};
use crate::membership::{MembershipPolicy, MembershipSynchronizer};
use crate::node::{Node, NodeScope};
use crate::options::CliOptions;
use crate::services::Collaborators;

/// Raw output of one used instance, kept for a failed test's report
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AttachedLog {
    /// `server`, `standalone server` or `proxy`
    pub kind: String,
    pub host: String,
    pub last_port: Option<u16>,
    pub raw: String,
}

/// Everything teardown noticed about a finished test case
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TeardownReport {
    /// Instances that were still running and had to be stopped
    pub still_running: Vec<String>,
    /// `(node index, host, ports in use)` for every node with leased ports
    pub leaked_ports: Vec<(usize, String, usize)>,
    pub attached_logs: Vec<AttachedLog>,
}

impl TeardownReport {
    pub fn is_clean(&self) -> bool {
        self.still_running.is_empty() && self.leaked_ports.is_empty()
    }
}

pub struct TestEnvironment {
    topology: Topology,
    collaborators: Collaborators,
    readiness: ReadinessPolicy,
    membership: MembershipPolicy,
    nodes: BTreeMap<usize, Arc<Node>>,
    instances: Vec<InstanceRef>,
    generated_clusters: u64,
}

impl TestEnvironment {
    pub fn new(topology: Topology, collaborators: Collaborators) -> Self {
        Self {
            topology,
            collaborators,
            readiness: ReadinessPolicy::default(),
            membership: MembershipPolicy::default(),
            nodes: BTreeMap::new(),
            instances: Vec::new(),
            generated_clusters: 0,
        }
    }

    /// Load a topology document and build an environment over it
    pub fn from_config<P: AsRef<Path>>(path: P, collaborators: Collaborators) -> HarnessResult<Self> {
        let path = path.as_ref();
        fixture_debug!(path.display(), "loading environment configuration");
        let topology = Topology::from_file(path)?;
        fixture_debug!(path.display(), "loaded environment configuration: {} nodes", topology.node_count());
        Ok(Self::new(topology, collaborators))
    }

    /// Override the readiness backoff of instances built from now on (fluent API)
    pub fn with_readiness_policy(mut self, readiness: ReadinessPolicy) -> Self {
        self.readiness = readiness;
        self
    }

    /// Override the membership poll budget (fluent API)
    pub fn with_membership_policy(mut self, membership: MembershipPolicy) -> Self {
        self.membership = membership;
        self
    }

    pub fn topology(&self) -> &Topology {
        &self.topology
    }

    /// Node `index` of the topology, created on first use
    ///
    /// # Errors
    /// `ResourceSkip` when the topology has fewer nodes.
    pub fn get_node(&mut self, index: usize) -> HarnessResult<Arc<Node>> {
        if let Some(node) = self.nodes.get(&index) {
            return Ok(node.clone());
        }
        let record = self
            .topology
            .node_record(index)
            .ok_or_else(|| HarnessError::skip("insufficient number of nodes"))?;

        let node = Arc::new(Node::new(
            index,
            record,
            NodeScope::from_topology(&self.topology),
            self.collaborators.channel.clone(),
            self.collaborators.files.clone(),
        ));
        self.nodes.insert(index, node.clone());
        Ok(node)
    }

    pub fn get_param(&self, key: &str) -> Option<&serde_json::Value> {
        self.topology.param(key)
    }

    /// Every instance built in the current test class
    pub fn instances(&self) -> &[InstanceRef] {
        &self.instances
    }

    /// Publish `config` and return an empty cluster fixture
    ///
    /// Without `name`, a name unique within this environment is generated.
    pub async fn cluster(
        &mut self,
        kind: &str,
        config: serde_json::Value,
        name: Option<&str>,
    ) -> HarnessResult<ClusterFixture> {
        let kind = ServiceKind::from(kind);
        self.collaborators.registry.resolve(&kind)?;

        let name = match name {
            Some(name) if !name.is_empty() => name.to_string(),
            _ => {
                let generated = self.generate_cluster_name();
                fixture_debug!(generated, "generated cluster name");
                generated
            }
        };
        ClusterFixture::create(
            kind,
            config,
            name,
            &self.topology.ensemble_address(),
            self.collaborators.publisher.as_ref(),
        )
        .await
    }

    /// Add a clustered server on `node` to `cluster`
    pub fn server(
        &mut self,
        node: &Arc<Node>,
        cluster: &mut ClusterFixture,
        options: CliOptions,
    ) -> HarnessResult<InstanceRef> {
        let defaults = self.ensemble_options(CliOptions::new().with("--datadir", node.workdir()));
        let variant = InstanceVariant::ClusteredServer {
            cluster: cluster.name().to_string(),
        };
        let server = self.register(node, cluster.kind().clone(), variant, options.chain(&defaults))?;
        cluster.add_member(server.clone());
        Ok(server)
    }

    /// Place `config` on `node` and add a standalone server running from it
    pub async fn server_standalone(
        &mut self,
        node: &Arc<Node>,
        kind: &str,
        config: &serde_json::Value,
        options: CliOptions,
    ) -> HarnessResult<InstanceRef> {
        let kind = ServiceKind::from(kind);
        self.collaborators.registry.resolve(&kind)?;

        let config_path = node.put_file(&serde_json::to_vec(config)?, None).await?;
        fixture_debug!(node, "transferred standalone configuration: {}", config_path);

        let defaults = CliOptions::new().with("--datadir", node.workdir());
        let variant = InstanceVariant::StandaloneServer { config_path };
        self.register(node, kind, variant, options.chain(&defaults))
    }

    /// Add a router proxy on `node`
    pub fn proxy(&mut self, node: &Arc<Node>, kind: &str, options: CliOptions) -> HarnessResult<InstanceRef> {
        let defaults = self.ensemble_options(CliOptions::new());
        self.register(node, ServiceKind::from(kind), InstanceVariant::RouterProxy, options.chain(&defaults))
    }

    /// Wait until `router` reports every one of `members`
    pub async fn wait_for_servers(&self, router: &InstanceRef, members: &[InstanceRef]) -> HarnessResult<()> {
        MembershipSynchronizer::new(self.membership.clone())
            .wait_for_servers(router, members)
            .await
    }

    /// Tear down after one test case
    ///
    /// Stops anything still running, reports leaked ports, snapshots the raw
    /// logs of used instances when `failed`, then resets every instance.
    pub async fn finalize_test_case(&mut self, failed: bool) -> TeardownReport {
        let mut report = TeardownReport::default();

        for instance in &self.instances {
            let mut instance = instance.lock().await;
            if !instance.state().is_active() {
                continue;
            }
            if instance.is_running() {
                fixture_warn!(instance, "still running! stopping anyway...");
                report.still_running.push(instance.to_string());
            }
            if let Err(e) = instance.stop(Signal::SIGTERM).await {
                fixture_warn!(instance, "failed to stop during teardown: {}", e);
            }
        }

        for (index, node) in &self.nodes {
            let in_use = node.ports_in_use();
            if in_use != 0 {
                fixture_warn!(node, "{} leaked port(s) detected", in_use);
                report.leaked_ports.push((*index, node.host().to_string(), in_use));
            }
        }

        if failed {
            for instance in &self.instances {
                let instance = instance.lock().await;
                if !instance.is_used() {
                    continue;
                }
                match instance.log_raw() {
                    Ok((stdout, stderr)) => report.attached_logs.push(AttachedLog {
                        kind: instance.variant().label().to_string(),
                        host: instance.node().host().to_string(),
                        last_port: instance.last_port(),
                        raw: format!("{stdout}\n{stderr}"),
                    }),
                    Err(e) => fixture_debug!(instance, "no log to attach: {}", e),
                }
            }
        }

        for instance in &self.instances {
            let mut instance = instance.lock().await;
            if let Err(e) = instance.reset() {
                fixture_warn!(instance, "failed to reset: {}", e);
            }
        }

        report
    }

    pub fn initialize_test_class(&self, name: &str) {
        fixture_info!(name, "test class started");
    }

    /// Forget every instance of the finished test class
    pub fn finalize_test_class(&mut self, name: &str) {
        fixture_debug!(name, "{} fixtures used", self.instances.len());
        fixture_info!(name, "test class completed");
        self.instances.clear();
    }

    fn generate_cluster_name(&mut self) -> String {
        self.generated_clusters += 1;
        format!(
            "harness-cluster-{}-{}",
            self.topology.cluster_prefix(),
            self.generated_clusters
        )
    }

    fn ensemble_options(&self, options: CliOptions) -> CliOptions {
        let ensemble = self.topology.ensemble_address();
        if ensemble.is_empty() {
            options
        } else {
            options.with("--zookeeper", ensemble)
        }
    }

    fn register(
        &mut self,
        node: &Arc<Node>,
        kind: ServiceKind,
        variant: InstanceVariant,
        options: CliOptions,
    ) -> HarnessResult<InstanceRef> {
        let spec = self.collaborators.registry.resolve(&kind)?.clone();
        let instance = ServiceInstance::new(
            node.clone(),
            kind,
            spec,
            variant,
            options,
            self.collaborators.rpc.clone(),
        )
        .with_readiness(self.readiness.clone());

        fixture_debug!(instance, "registered fixture");
        let instance = InstanceRef::new(instance);
        self.instances.push(instance.clone());
        Ok(instance)
    }
}

impl fmt::Debug for TestEnvironment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TestEnvironment")
            .field("topology", &self.topology)
            .field("readiness", &self.readiness)
            .field("membership", &self.membership)
            .field("nodes", &self.nodes)
            .field("instances", &self.instances)
            .field("generated_clusters", &self.generated_clusters)
            .finish_non_exhaustive()
    }
}
