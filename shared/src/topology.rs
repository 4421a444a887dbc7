//! Topology document
//!
//! A test environment is described by a JSON document holding an ordered list
//! of directives. Directives are applied in order, so later ones override
//! earlier scalar settings while `node` and `ensemble` accumulate.
//!
//! ```json
//! {
//!   "directives": [
//!     { "node": { "host": "10.0.0.1", "ports": [9199, 9200] } },
//!     { "ensemble": { "host": "10.0.0.9", "port": 2181 } },
//!     { "prefix": "/opt/jubatus" },
//!     { "workdir": "/var/tmp/harness" },
//!     { "variable": { "key": "LANG", "value": "C" } },
//!     { "param": { "key": "iterations", "value": 3 } },
//!     { "cluster_prefix": "nightly" },
//!     { "remote_process_timeout": 600 },
//!     { "include": "extra-nodes.json" }
//!   ]
//! }
//! ```

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::errors::{SharedError, SharedResult};

/// Maximum nesting of `include` directives
pub const MAX_INCLUDE_DEPTH: usize = 8;

const DEFAULT_WORKDIR: &str = "/tmp";

/// Port list accepted either as a single number or as an array
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum PortList {
    One(u16),
    Many(Vec<u16>),
}

impl PortList {
    pub fn into_vec(self) -> Vec<u16> {
        match self {
            PortList::One(port) => vec![port],
            PortList::Many(ports) => ports,
        }
    }
}

/// One entry of the topology document
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Directive {
    /// A physical test node and the ports it may hand out
    Node { host: String, ports: PortList },
    /// One member of the coordination ensemble
    Ensemble { host: String, port: u16 },
    /// Installation prefix used to build PATH/LD_LIBRARY_PATH on nodes
    Prefix(String),
    /// Working directory on nodes (data dirs, temporary files)
    Workdir(String),
    /// Environment variable exported to every spawned process
    Variable { key: String, value: String },
    /// Free-form parameter readable by test cases
    Param { key: String, value: serde_json::Value },
    /// Infix for generated cluster names
    ClusterPrefix(String),
    /// Wall-clock limit for remote commands, in seconds
    RemoteProcessTimeout(u64),
    /// Another topology document, resolved relative to the including one
    Include(String),
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TopologyDocument {
    #[serde(default)]
    pub directives: Vec<Directive>,
}

/// Host and owned ports of one node, in declaration order
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeRecord {
    pub host: String,
    pub ports: Vec<u16>,
}

/// Static topology and scoping defaults of a test environment
#[derive(Debug, Clone)]
pub struct Topology {
    nodes: Vec<NodeRecord>,
    ensemble: Vec<(String, u16)>,
    prefix: Option<String>,
    workdir: String,
    variables: BTreeMap<String, String>,
    params: BTreeMap<String, serde_json::Value>,
    cluster_prefix: String,
    remote_process_timeout: Option<Duration>,
}

impl Default for Topology {
    fn default() -> Self {
        Self {
            nodes: Vec::new(),
            ensemble: Vec::new(),
            prefix: None,
            workdir: DEFAULT_WORKDIR.to_string(),
            variables: BTreeMap::new(),
            params: BTreeMap::new(),
            cluster_prefix: String::new(),
            remote_process_timeout: None,
        }
    }
}

impl Topology {
    /// Load a topology document from disk
    pub fn from_file<P: AsRef<Path>>(path: P) -> SharedResult<Self> {
        let mut topology = Self::default();
        topology.include_file(path.as_ref(), 0)?;
        Ok(topology)
    }

    /// Parse a topology document held in memory; includes resolve against the working directory
    pub fn from_json_str(json: &str, source_name: &str) -> SharedResult<Self> {
        let document = parse_document(json, source_name)?;
        let mut topology = Self::default();
        for directive in document.directives {
            topology.apply_at(directive, Path::new("."), 0)?;
        }
        Ok(topology)
    }

    pub fn from_directives(directives: Vec<Directive>) -> SharedResult<Self> {
        let mut topology = Self::default();
        for directive in directives {
            topology.apply(directive)?;
        }
        Ok(topology)
    }

    /// Apply a single directive
    pub fn apply(&mut self, directive: Directive) -> SharedResult<()> {
        self.apply_at(directive, Path::new("."), 0)
    }

    fn include_file(&mut self, path: &Path, depth: usize) -> SharedResult<()> {
        if depth > MAX_INCLUDE_DEPTH {
            return Err(SharedError::IncludeTooDeep {
                path: path.display().to_string(),
                limit: MAX_INCLUDE_DEPTH,
            });
        }

        let json = std::fs::read_to_string(path).map_err(|e| SharedError::TopologyIo {
            path: path.display().to_string(),
            message: e.to_string(),
        })?;
        let document = parse_document(&json, &path.display().to_string())?;

        tracing::debug!("loaded topology document {} ({} directives)", path.display(), document.directives.len());

        let base_dir = path.parent().map(Path::to_path_buf).unwrap_or_else(|| PathBuf::from("."));
        for directive in document.directives {
            self.apply_at(directive, &base_dir, depth)?;
        }
        Ok(())
    }

    fn apply_at(&mut self, directive: Directive, base_dir: &Path, depth: usize) -> SharedResult<()> {
        match directive {
            Directive::Node { host, ports } => {
                let ports = ports.into_vec();
                if ports.is_empty() {
                    return Err(SharedError::InvalidConfig {
                        field: format!("node.{host}.ports"),
                        value: "[]".to_string(),
                    });
                }
                self.nodes.push(NodeRecord { host, ports });
            }
            Directive::Ensemble { host, port } => self.ensemble.push((host, port)),
            Directive::Prefix(prefix) => self.prefix = Some(prefix),
            Directive::Workdir(workdir) => {
                if workdir.is_empty() {
                    return Err(SharedError::InvalidConfig {
                        field: "workdir".to_string(),
                        value: workdir,
                    });
                }
                self.workdir = workdir;
            }
            Directive::Variable { key, value } => {
                self.variables.insert(key, value);
            }
            Directive::Param { key, value } => {
                self.params.insert(key, value);
            }
            Directive::ClusterPrefix(prefix) => self.cluster_prefix = prefix,
            Directive::RemoteProcessTimeout(secs) => self.remote_process_timeout = Some(Duration::from_secs(secs)),
            Directive::Include(target) => {
                let target = Path::new(&target);
                let resolved = if target.is_absolute() {
                    target.to_path_buf()
                } else {
                    base_dir.join(target)
                };
                self.include_file(&resolved, depth + 1)?;
            }
        }
        Ok(())
    }

    pub fn nodes(&self) -> &[NodeRecord] {
        &self.nodes
    }

    pub fn node_record(&self, index: usize) -> Option<&NodeRecord> {
        self.nodes.get(index)
    }

    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }

    /// Ensemble members joined as `host:port,host:port`
    pub fn ensemble_address(&self) -> String {
        self.ensemble
            .iter()
            .map(|(host, port)| format!("{host}:{port}"))
            .collect::<Vec<_>>()
            .join(",")
    }

    pub fn prefix(&self) -> Option<&str> {
        self.prefix.as_deref()
    }

    pub fn workdir(&self) -> &str {
        &self.workdir
    }

    pub fn variables(&self) -> &BTreeMap<String, String> {
        &self.variables
    }

    pub fn param(&self, key: &str) -> Option<&serde_json::Value> {
        self.params.get(key)
    }

    pub fn cluster_prefix(&self) -> &str {
        &self.cluster_prefix
    }

    pub fn remote_process_timeout(&self) -> Option<Duration> {
        self.remote_process_timeout
    }
}

fn parse_document(json: &str, source_name: &str) -> SharedResult<TopologyDocument> {
    serde_json::from_str(json).map_err(|e| SharedError::TopologyParse {
        source_name: source_name.to_string(),
        message: e.to_string(),
    })
}
