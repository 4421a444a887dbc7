//! Test fixtures and data for harness tests
//!
//! This module provides consistent test data and fixtures used across all test suites.

use std::time::Duration;

use harness::{MembershipPolicy, ReadinessPolicy};
use shared::{Directive, PortList, Topology};

/// Standard test data and fixtures
pub struct TestFixtures;

impl TestFixtures {
    pub const HOST: &'static str = "127.0.0.1";
    pub const FIRST_PORT: u16 = 10000;
    pub const ENSEMBLE_HOST: &'static str = "zk1";
    pub const ENSEMBLE_PORT: u16 = 2181;
    pub const KIND: &'static str = "classifier";
    pub const CLUSTER: &'static str = "c1";

    /// `count` consecutive ports starting at [`Self::FIRST_PORT`]
    pub fn ports(count: u16) -> Vec<u16> {
        (0..count).map(|i| Self::FIRST_PORT + i).collect()
    }

    /// One node per entry of `ports_per_node`, all on the loopback host
    pub fn topology(ports_per_node: &[u16]) -> Topology {
        let mut directives: Vec<Directive> = ports_per_node
            .iter()
            .map(|count| Directive::Node {
                host: Self::HOST.to_string(),
                ports: PortList::Many(Self::ports(*count)),
            })
            .collect();
        directives.push(Directive::Ensemble {
            host: Self::ENSEMBLE_HOST.to_string(),
            port: Self::ENSEMBLE_PORT,
        });
        Topology::from_directives(directives).unwrap()
    }

    /// Identity a server on `port` reports
    pub fn identity(port: u16) -> String {
        format!("{}_{}", Self::HOST, port)
    }

    /// Readiness backoff that gives up in about a quarter second
    pub fn fast_readiness() -> ReadinessPolicy {
        ReadinessPolicy {
            initial_delay: Duration::from_millis(1),
            ..ReadinessPolicy::default()
        }
    }

    /// Readiness backoff long enough for a shell to print before being killed
    pub fn patient_readiness() -> ReadinessPolicy {
        ReadinessPolicy {
            initial_delay: Duration::from_millis(5),
            ..ReadinessPolicy::default()
        }
    }

    pub fn fast_membership() -> MembershipPolicy {
        MembershipPolicy {
            interval: Duration::from_millis(10),
            ..MembershipPolicy::default()
        }
    }
}
