//! Service implementations
//!
//! Real implementations of the collaborator traits. These are the
//! production implementations that spawn processes, copy files, and speak
//! MessagePack-RPC over TCP.

pub mod command_channel;
pub mod config_publisher;
pub mod file_channel;
pub mod msgpack_rpc;

use std::sync::Arc;

pub use command_channel::{LocalChannel, SshChannel};
pub use config_publisher::CommandConfigPublisher;
pub use file_channel::{LocalFileChannel, ScpFileChannel};
pub use msgpack_rpc::MsgpackRpcTransport;

use crate::registry::ServiceRegistry;
use crate::traits::{CommandChannel, ConfigPublisher, FileChannel, RpcTransport};

/// Everything a test environment needs from the outside world
#[derive(Clone)]
pub struct Collaborators {
    pub channel: Arc<dyn CommandChannel>,
    pub files: Arc<dyn FileChannel>,
    pub publisher: Arc<dyn ConfigPublisher>,
    pub rpc: Arc<dyn RpcTransport>,
    pub registry: ServiceRegistry,
}

impl Collaborators {
    /// Run everything on this machine
    pub fn local() -> Self {
        Self {
            channel: Arc::new(LocalChannel::new()),
            files: Arc::new(LocalFileChannel::new()),
            publisher: Arc::new(CommandConfigPublisher::new()),
            rpc: Arc::new(MsgpackRpcTransport::new()),
            registry: ServiceRegistry::standard(),
        }
    }

    /// Run processes and file transfers on remote nodes over ssh/scp
    pub fn ssh() -> Self {
        Self {
            channel: Arc::new(SshChannel::new()),
            files: Arc::new(ScpFileChannel::new()),
            ..Self::local()
        }
    }

    /// Replace the command channel (fluent API)
    pub fn with_channel(mut self, channel: Arc<dyn CommandChannel>) -> Self {
        self.channel = channel;
        self
    }

    /// Replace the file channel (fluent API)
    pub fn with_files(mut self, files: Arc<dyn FileChannel>) -> Self {
        self.files = files;
        self
    }

    /// Replace the config publisher (fluent API)
    pub fn with_publisher(mut self, publisher: Arc<dyn ConfigPublisher>) -> Self {
        self.publisher = publisher;
        self
    }

    /// Replace the RPC transport (fluent API)
    pub fn with_rpc(mut self, rpc: Arc<dyn RpcTransport>) -> Self {
        self.rpc = rpc;
        self
    }

    /// Replace the service registry (fluent API)
    pub fn with_registry(mut self, registry: ServiceRegistry) -> Self {
        self.registry = registry;
        self
    }
}
