//! Shared types for the cluster test harness
//!
//! Contains the pieces used by both the harness library and the tester
//! binary: the topology document and its loader, common identifiers,
//! topology errors, and logging setup.

pub mod errors;
pub mod logging;
pub mod topology;
pub mod types;

pub use errors::*;
pub use topology::{Directive, NodeRecord, PortList, Topology, TopologyDocument};
pub use types::*;
