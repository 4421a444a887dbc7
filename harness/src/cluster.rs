//! Cluster Fixture
//!
//! A named group of clustered servers sharing one config. The config is
//! published once, when the fixture is created; no member can exist before
//! that succeeds.

use std::fmt;
use std::future::Future;

use nix::sys::signal::Signal;
use shared::{fixture_debug, ServiceKind};

use crate::error::{HarnessError, HarnessResult};
use crate::instance::InstanceRef;
use crate::traits::ConfigPublisher;

#[derive(Debug)]
pub struct ClusterFixture {
    name: String,
    kind: ServiceKind,
    config: serde_json::Value,
    members: Vec<InstanceRef>,
}

impl ClusterFixture {
    /// Publish `config` for the cluster and return the empty fixture
    pub async fn create(
        kind: ServiceKind,
        config: serde_json::Value,
        name: String,
        ensemble: &str,
        publisher: &dyn ConfigPublisher,
    ) -> HarnessResult<Self> {
        fixture_debug!(name, "configuring {} cluster", kind);
        publisher.publish(&kind, &name, ensemble, &config).await?;

        Ok(Self {
            name,
            kind,
            config,
            members: Vec::new(),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn kind(&self) -> &ServiceKind {
        &self.kind
    }

    pub fn config(&self) -> &serde_json::Value {
        &self.config
    }

    pub fn members(&self) -> &[InstanceRef] {
        &self.members
    }

    pub(crate) fn add_member(&mut self, member: InstanceRef) {
        self.members.push(member);
    }

    /// Start every member in order, stopping at the first failure
    pub async fn start(&self) -> HarnessResult<()> {
        for member in &self.members {
            member.start().await?;
        }
        Ok(())
    }

    /// Stop every active member; all are attempted, the first error is returned
    pub async fn stop(&self, signal: Signal) -> HarnessResult<()> {
        let mut first_error = None;
        for member in &self.members {
            if !member.state().await.is_active() {
                continue;
            }
            if let Err(e) = member.stop(signal).await {
                first_error.get_or_insert(e);
            }
        }
        first_error.map_or(Ok(()), Err)
    }

    /// Start all members, run `body`, and stop them on every exit path
    pub async fn run<'a, F, Fut, T>(&'a self, body: F) -> HarnessResult<T>
    where
        F: FnOnce(&'a ClusterFixture) -> Fut,
        Fut: Future<Output = HarnessResult<T>> + 'a,
    {
        if self.members.is_empty() {
            return Err(HarnessError::invariant(format!("cluster {} has no members", self.name)));
        }

        let outcome = match self.start().await {
            Ok(()) => body(self).await,
            Err(e) => Err(e),
        };
        let stopped = self.stop(Signal::SIGTERM).await;

        let value = outcome?;
        stopped?;
        Ok(value)
    }
}

impl fmt::Display for ClusterFixture {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} cluster {} ({} members)", self.kind, self.name, self.members.len())
    }
}
