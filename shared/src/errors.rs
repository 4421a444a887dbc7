//! Shared error types for topology loading

use thiserror::Error;

#[derive(Error, Debug)]
pub enum SharedError {
    #[error("Failed to read topology {path}: {message}")]
    TopologyIo { path: String, message: String },

    #[error("Failed to parse topology {source_name}: {message}")]
    TopologyParse { source_name: String, message: String },

    #[error("Invalid configuration: {field} = {value}")]
    InvalidConfig { field: String, value: String },

    #[error("Topology include nesting exceeds {limit} levels at {path}")]
    IncludeTooDeep { path: String, limit: usize },
}

pub type SharedResult<T> = Result<T, SharedError>;
