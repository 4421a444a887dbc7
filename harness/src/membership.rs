//! Membership Synchronizer
//!
//! Polls a router until every expected server appears in the member set it
//! reports for that server's cluster.

use std::time::Duration;

use shared::{fixture_debug, fixture_warn};

use crate::error::{HarnessError, HarnessResult};
use crate::instance::InstanceRef;

/// One immediate poll followed by `retries` polls `interval` apart
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MembershipPolicy {
    pub interval: Duration,
    pub retries: u32,
}

impl Default for MembershipPolicy {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(1),
            retries: 16,
        }
    }
}

impl MembershipPolicy {
    pub fn total_polls(&self) -> u32 {
        self.retries + 1
    }

    fn delays(&self) -> impl Iterator<Item = Duration> {
        std::iter::once(Duration::ZERO).chain(std::iter::repeat(self.interval).take(self.retries as usize))
    }
}

#[derive(Debug, Clone, Default)]
pub struct MembershipSynchronizer {
    policy: MembershipPolicy,
}

/// First member found missing in one poll
struct Missing {
    identity: String,
    cluster: String,
    seen: Vec<String>,
}

impl MembershipSynchronizer {
    pub fn new(policy: MembershipPolicy) -> Self {
        Self { policy }
    }

    pub fn policy(&self) -> &MembershipPolicy {
        &self.policy
    }

    /// Block until `router` reports every one of `members`
    ///
    /// # Errors
    /// `FixtureFailed` naming the missing member and the last member set seen
    /// once the poll budget is spent. Members must be ready; their identity is
    /// queried on the first poll.
    pub async fn wait_for_servers(&self, router: &InstanceRef, members: &[InstanceRef]) -> HarnessResult<()> {
        let label = router.lock().await.to_string();
        fixture_debug!(label, "waiting for servers to be registered: {}", members.len());

        let mut last_missing = None;
        for delay in self.policy.delays() {
            tokio::time::sleep(delay).await;

            match Self::first_missing(router, members).await? {
                None => {
                    fixture_debug!(label, "all servers ready");
                    return Ok(());
                }
                Some(missing) => {
                    fixture_debug!(
                        label,
                        "member {} in cluster {} not registered yet",
                        missing.identity,
                        missing.cluster
                    );
                    last_missing = Some(missing);
                }
            }
        }

        let Some(missing) = last_missing else {
            return Err(HarnessError::invariant("membership poll budget is empty"));
        };
        fixture_warn!(
            label,
            "wait timed out for member {}! members: {:?}",
            missing.identity,
            missing.seen
        );
        Err(HarnessError::fixture(format!(
            "wait timed out for member {} in cluster {} (last seen members: {:?})",
            missing.identity, missing.cluster, missing.seen
        )))
    }

    async fn first_missing(router: &InstanceRef, members: &[InstanceRef]) -> HarnessResult<Option<Missing>> {
        for member in members {
            let identity = member.identity().await?;
            let cluster = member.cluster_name().await?;
            let seen = router.cluster_members(&cluster).await?;
            if !seen.contains(&identity) {
                return Ok(Some(Missing { identity, cluster, seen }));
            }
        }
        Ok(None)
    }
}
