//! Harness error taxonomy
//!
//! Every failure maps onto one of three categories: the environment is too
//! small for the test (skip), a fixture did not reach a required state (fatal
//! to the test), or the harness was used incorrectly (fatal, a bug).

use shared::SharedError;
use thiserror::Error;

use crate::rpc::RpcFailure;

#[derive(Error, Debug)]
pub enum HarnessError {
    #[error("Insufficient resources, skipping: {reason}")]
    ResourceSkip { reason: String },

    #[error("Fixture failed: {message}")]
    FixtureFailed { message: String },

    #[error("Invariant violated: {message}")]
    InvariantViolation { message: String },

    #[error("Unregistered service kind: {kind}")]
    UnregisteredKind { kind: String },

    #[error("RPC failure: {0}")]
    Rpc(#[from] RpcFailure),

    #[error("Topology error: {0}")]
    Shared(#[from] SharedError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON serialization error: {0}")]
    Json(#[from] serde_json::Error),
}

/// How a test runner should treat an error
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCategory {
    /// Environment too small; skip the test
    Skip,
    /// A fixture failed to reach a required state; fail the test
    Fixture,
    /// Harness or test bug; fail the test
    Invariant,
}

impl HarnessError {
    pub fn skip<S: Into<String>>(reason: S) -> Self {
        Self::ResourceSkip { reason: reason.into() }
    }

    pub fn fixture<S: Into<String>>(message: S) -> Self {
        Self::FixtureFailed {
            message: message.into(),
        }
    }

    pub fn invariant<S: Into<String>>(message: S) -> Self {
        Self::InvariantViolation {
            message: message.into(),
        }
    }

    pub fn category(&self) -> ErrorCategory {
        match self {
            HarnessError::ResourceSkip { .. } => ErrorCategory::Skip,
            HarnessError::InvariantViolation { .. } | HarnessError::UnregisteredKind { .. } => ErrorCategory::Invariant,
            HarnessError::FixtureFailed { .. }
            | HarnessError::Rpc(_)
            | HarnessError::Shared(_)
            | HarnessError::Io(_)
            | HarnessError::Json(_) => ErrorCategory::Fixture,
        }
    }

    pub fn is_skip(&self) -> bool {
        self.category() == ErrorCategory::Skip
    }
}

pub type HarnessResult<T> = Result<T, HarnessError>;
