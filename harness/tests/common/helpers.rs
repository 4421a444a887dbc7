//! Test helpers and builder patterns for harness tests
//!
//! This module provides test doubles for the collaborator traits and a
//! builder that wires them into a `TestEnvironment` with fast policies.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use harness::error::HarnessResult;
use harness::rpc::PROBE_METHOD;
use harness::services::LocalFileChannel;
use harness::traits::{MockConfigPublisher, MockRpcTransport};
use harness::{
    Collaborators, CommandChannel, CommandSpec, MembershipPolicy, ReadinessPolicy, RpcFailure, ServiceRegistry,
    ServiceSpec, TestEnvironment,
};
use parking_lot::Mutex;
use rmpv::Value;
use shared::{Directive, ServiceKind, Topology};
use tokio::process::Command;

use super::fixtures::TestFixtures;

/// Command channel that records what the harness asked for and runs a shell
/// script instead, so real process supervision is exercised
#[derive(Debug)]
pub struct StubChannel {
    script: String,
    launched: Mutex<Vec<CommandSpec>>,
}

impl StubChannel {
    /// Runs a silent long-lived process for every command
    pub fn new() -> Self {
        Self::with_script("exec sleep 30")
    }

    pub fn with_script(script: &str) -> Self {
        Self {
            script: script.to_string(),
            launched: Mutex::new(Vec::new()),
        }
    }

    /// Every command line requested so far
    pub fn launched(&self) -> Vec<Vec<String>> {
        self.launched.lock().iter().map(|spec| spec.argv.clone()).collect()
    }
}

impl CommandChannel for StubChannel {
    fn command(&self, spec: &CommandSpec) -> HarnessResult<Command> {
        self.launched.lock().push(spec.clone());
        let mut command = Command::new("sh");
        command.arg("-c").arg(&self.script);
        Ok(command)
    }
}

/// Scripted RPC behavior of the servers and the router
///
/// Probes answer "no such method" (ready) unless `unreachable` is set.
/// Status queries without a cluster name report the queried server's own
/// identity. Status queries for a cluster are router polls: they report
/// `members` once more than `visible_after` polls have happened, and "no
/// server found" forever when `visible_after` is `None`.
#[derive(Debug, Clone)]
pub struct RpcScript {
    ready: bool,
    members: Vec<String>,
    visible_after: Option<usize>,
    pub probes: Arc<AtomicUsize>,
    pub status_calls: Arc<AtomicUsize>,
    pub router_polls: Arc<AtomicUsize>,
    pub merges: Arc<AtomicUsize>,
}

impl RpcScript {
    pub fn new() -> Self {
        Self {
            ready: true,
            members: Vec::new(),
            visible_after: Some(0),
            probes: Arc::new(AtomicUsize::new(0)),
            status_calls: Arc::new(AtomicUsize::new(0)),
            router_polls: Arc::new(AtomicUsize::new(0)),
            merges: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Probes never get an answer
    pub fn unreachable(mut self) -> Self {
        self.ready = false;
        self
    }

    pub fn with_members(mut self, members: Vec<String>, visible_after: Option<usize>) -> Self {
        self.members = members;
        self.visible_after = visible_after;
        self
    }

    pub fn count(counter: &Arc<AtomicUsize>) -> usize {
        counter.load(Ordering::SeqCst)
    }

    pub fn build(&self) -> MockRpcTransport {
        let script = self.clone();
        let mut rpc = MockRpcTransport::new();
        rpc.expect_call().returning(move |endpoint, method, params, _timeout| match method {
            PROBE_METHOD => {
                script.probes.fetch_add(1, Ordering::SeqCst);
                if script.ready {
                    Err(RpcFailure::NoSuchMethod)
                } else {
                    Err(RpcFailure::Unreachable {
                        endpoint: endpoint.to_string(),
                        message: "connection refused".to_string(),
                    })
                }
            }
            "get_status" => {
                let cluster = params.first().and_then(Value::as_str).unwrap_or_default().to_string();
                if cluster.is_empty() {
                    script.status_calls.fetch_add(1, Ordering::SeqCst);
                    let identity = format!("{}_{}", endpoint.host, endpoint.port);
                    return Ok(Value::Map(vec![(Value::from(identity), Value::Map(vec![]))]));
                }

                let poll = script.router_polls.fetch_add(1, Ordering::SeqCst) + 1;
                match script.visible_after {
                    Some(after) if poll > after => Ok(Value::Map(
                        script
                            .members
                            .iter()
                            .map(|member| (Value::from(member.as_str()), Value::Map(vec![])))
                            .collect(),
                    )),
                    Some(_) => Ok(Value::Map(vec![])),
                    None => Err(RpcFailure::Remote {
                        message: format!("no server found: {cluster}"),
                    }),
                }
            }
            "do_mix" => {
                script.merges.fetch_add(1, Ordering::SeqCst);
                Ok(Value::Boolean(true))
            }
            _ => Err(RpcFailure::NoSuchMethod),
        });
        rpc
    }
}

/// Builder pattern for creating test environments with sensible defaults
pub struct EnvironmentBuilder {
    ports_per_node: Vec<u16>,
    directives: Vec<Directive>,
    channel: Arc<StubChannel>,
    rpc: MockRpcTransport,
    publisher: MockConfigPublisher,
    registry: ServiceRegistry,
    readiness: ReadinessPolicy,
    membership: MembershipPolicy,
}

impl EnvironmentBuilder {
    /// One node with two ports, ready servers, and an accepting publisher
    pub fn new() -> Self {
        let mut publisher = MockConfigPublisher::new();
        publisher.expect_publish().returning(|_, _, _, _| Ok(())).times(0..);

        Self {
            ports_per_node: vec![2],
            directives: Vec::new(),
            channel: Arc::new(StubChannel::new()),
            rpc: RpcScript::new().build(),
            publisher,
            registry: ServiceRegistry::standard(),
            readiness: TestFixtures::fast_readiness(),
            membership: TestFixtures::fast_membership(),
        }
    }

    /// Port counts of each node
    pub fn with_nodes(mut self, ports_per_node: &[u16]) -> Self {
        self.ports_per_node = ports_per_node.to_vec();
        self
    }

    pub fn with_directive(mut self, directive: Directive) -> Self {
        self.directives.push(directive);
        self
    }

    pub fn with_channel(mut self, channel: Arc<StubChannel>) -> Self {
        self.channel = channel;
        self
    }

    pub fn with_rpc(mut self, rpc: MockRpcTransport) -> Self {
        self.rpc = rpc;
        self
    }

    pub fn with_publisher(mut self, publisher: MockConfigPublisher) -> Self {
        self.publisher = publisher;
        self
    }

    /// Register a kind under the conventional program names
    pub fn with_kind(mut self, kind: &str) -> Self {
        let kind = ServiceKind::from(kind);
        let spec = ServiceSpec::conventional(&kind);
        self.registry.register(kind, spec);
        self
    }

    pub fn with_readiness(mut self, readiness: ReadinessPolicy) -> Self {
        self.readiness = readiness;
        self
    }

    pub fn with_membership(mut self, membership: MembershipPolicy) -> Self {
        self.membership = membership;
        self
    }

    pub fn topology(&self) -> Topology {
        let mut topology = TestFixtures::topology(&self.ports_per_node);
        for directive in &self.directives {
            topology.apply(directive.clone()).unwrap();
        }
        topology
    }

    pub fn build(self) -> TestEnvironment {
        let topology = self.topology();
        let collaborators = Collaborators::local()
            .with_channel(self.channel)
            .with_files(Arc::new(LocalFileChannel::new()))
            .with_rpc(Arc::new(self.rpc))
            .with_publisher(Arc::new(self.publisher))
            .with_registry(self.registry);

        TestEnvironment::new(topology, collaborators)
            .with_readiness_policy(self.readiness)
            .with_membership_policy(self.membership)
    }
}

impl Default for EnvironmentBuilder {
    fn default() -> Self {
        Self::new()
    }
}
