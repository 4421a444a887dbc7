//! Cluster config publication through the `jubaconfig` command-line tool

use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use shared::ServiceKind;
use tracing::debug;

use crate::error::{HarnessError, HarnessResult};
use crate::process::ProcessHandle;
use crate::services::LocalChannel;
use crate::traits::{CommandChannel, CommandSpec, ConfigPublisher};

#[derive(Debug, Clone)]
pub struct CommandConfigPublisher {
    program: String,
    channel: Arc<dyn CommandChannel>,
}

impl Default for CommandConfigPublisher {
    fn default() -> Self {
        Self {
            program: "jubaconfig".to_string(),
            channel: Arc::new(LocalChannel::new()),
        }
    }
}

impl CommandConfigPublisher {
    pub fn new() -> Self {
        Self::default()
    }

    /// Use a different publishing tool (fluent API)
    pub fn with_program<S: Into<String>>(mut self, program: S) -> Self {
        self.program = program.into();
        self
    }

    /// Run the tool through a different channel (fluent API)
    pub fn with_channel(mut self, channel: Arc<dyn CommandChannel>) -> Self {
        self.channel = channel;
        self
    }

    /// Whether the tool can be found, either as a path or on `PATH`
    pub fn is_available(&self) -> bool {
        if self.program.contains('/') {
            return Path::new(&self.program).exists();
        }
        std::env::var_os("PATH")
            .map(|paths| std::env::split_paths(&paths).any(|dir| dir.join(&self.program).exists()))
            .unwrap_or(false)
    }

    pub fn argv(&self, kind: &ServiceKind, cluster: &str, ensemble: &str) -> Vec<String> {
        [
            self.program.as_str(),
            "--debug",
            "--cmd",
            "write",
            "--file",
            "/dev/stdin",
            "--type",
            kind.as_str(),
            "--name",
            cluster,
            "--zookeeper",
            ensemble,
        ]
        .iter()
        .map(|arg| arg.to_string())
        .collect()
    }
}

#[async_trait]
impl ConfigPublisher for CommandConfigPublisher {
    async fn publish(
        &self,
        kind: &ServiceKind,
        cluster: &str,
        ensemble: &str,
        payload: &serde_json::Value,
    ) -> HarnessResult<()> {
        if !self.is_available() {
            return Err(HarnessError::skip(format!("{} command is not available", self.program)));
        }

        debug!("configuring cluster {} with {}", cluster, self.program);
        let body = serde_json::to_vec(payload)?;
        let spec = CommandSpec::new("localhost", self.argv(kind, cluster, ensemble));
        let output = ProcessHandle::run(self.channel.clone(), spec, Some(&body)).await?;

        if output.exit_code != Some(0) {
            return Err(HarnessError::fixture(format!(
                "{} failed: {}\n{}",
                self.program, output.stdout, output.stderr
            )));
        }
        Ok(())
    }
}
