//! Harness library for integration tests against clustered services
//!
//! This library provisions, starts, supervises, and tears down the short-lived
//! server and proxy processes that make up a test cluster, and provides the
//! consistency checks (readiness, membership convergence) deterministic tests
//! need against them.

pub mod cluster;
pub mod environment;
pub mod error;
pub mod instance;
pub mod log_filter;
pub mod membership;
pub mod node;
pub mod options;
pub mod process;
pub mod registry;
pub mod rpc;
pub mod services;
pub mod traits;

// Re-export commonly used types
pub use cluster::ClusterFixture;
pub use environment::{AttachedLog, TeardownReport, TestEnvironment};
pub use error::{ErrorCategory, HarnessError, HarnessResult};
pub use instance::{ClientTarget, InstanceRef, InstanceVariant, LifecycleState, ReadinessPolicy, ServiceInstance};
pub use log_filter::{LogFilter, LogLevel, LogRecord, LogSource};
pub use membership::{MembershipPolicy, MembershipSynchronizer};
pub use node::{Node, NodeScope};
pub use options::CliOptions;
pub use process::{CapturedOutput, ProcessHandle};
pub use registry::{ServiceRegistry, ServiceSpec};
pub use rpc::{ProbeOutcome, RpcFailure};
pub use services::Collaborators;
pub use traits::{CommandChannel, CommandSpec, ConfigPublisher, FileChannel, RpcTransport};

pub use nix::sys::signal::Signal;
