//! Service-kind registry
//!
//! Maps a service kind to the bundle of names the harness needs to drive it:
//! which programs to launch and which RPC methods answer status and merge
//! requests. Kinds are resolved by lookup; an unknown kind is an error.

use std::collections::HashMap;

use shared::ServiceKind;

use crate::error::{HarnessError, HarnessResult};

/// Kinds registered by [`ServiceRegistry::standard`]
pub const STANDARD_KINDS: &[&str] = &[
    "anomaly",
    "bandit",
    "burst",
    "classifier",
    "clustering",
    "graph",
    "nearest_neighbor",
    "recommender",
    "regression",
    "stat",
    "weight",
];

/// Capability bundle of one service kind
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceSpec {
    pub server_program: String,
    pub proxy_program: String,
    pub status_method: String,
    pub merge_method: String,
    /// Extension of model files written by `save`
    pub model_extension: String,
}

impl ServiceSpec {
    /// `juba<kind>` server, `juba<kind>_proxy` router
    pub fn conventional(kind: &ServiceKind) -> Self {
        Self {
            server_program: format!("juba{kind}"),
            proxy_program: format!("juba{kind}_proxy"),
            status_method: "get_status".to_string(),
            merge_method: "do_mix".to_string(),
            model_extension: "jubatus".to_string(),
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct ServiceRegistry {
    specs: HashMap<ServiceKind, ServiceSpec>,
}

impl ServiceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with the conventional bundle for every standard kind
    pub fn standard() -> Self {
        let mut registry = Self::new();
        for kind in STANDARD_KINDS {
            let kind = ServiceKind::from(*kind);
            let spec = ServiceSpec::conventional(&kind);
            registry.register(kind, spec);
        }
        registry
    }

    /// Register or replace a kind, returning the previous bundle
    pub fn register(&mut self, kind: ServiceKind, spec: ServiceSpec) -> Option<ServiceSpec> {
        self.specs.insert(kind, spec)
    }

    pub fn resolve(&self, kind: &ServiceKind) -> HarnessResult<&ServiceSpec> {
        self.specs.get(kind).ok_or_else(|| HarnessError::UnregisteredKind {
            kind: kind.to_string(),
        })
    }

    pub fn contains(&self, kind: &ServiceKind) -> bool {
        self.specs.contains_key(kind)
    }
}
