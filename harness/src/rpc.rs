//! RPC outcome classification
//!
//! The transport only moves MessagePack-RPC calls; this module decides what a
//! reply means for the lifecycle: whether a server is up, which members a
//! status reply names.

use std::time::Duration;

use rmpv::Value;
use shared::Endpoint;
use thiserror::Error;

use crate::traits::RpcTransport;

/// Method name used by the readiness probe; no server implements it
pub const PROBE_METHOD: &str = "__dummy_method__";

/// Per-call timeout of the readiness probe
pub const PROBE_TIMEOUT: Duration = Duration::from_secs(1);

/// Default timeout for application calls
pub const CLIENT_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Error, Debug, Clone, PartialEq)]
pub enum RpcFailure {
    #[error("{endpoint} unreachable: {message}")]
    Unreachable { endpoint: String, message: String },

    #[error("call timed out after {0:?}")]
    Timeout(Duration),

    #[error("no such method")]
    NoSuchMethod,

    #[error("remote error: {message}")]
    Remote { message: String },

    #[error("malformed response: {message}")]
    Protocol { message: String },
}

/// Result of a readiness probe
#[derive(Debug, Clone, PartialEq)]
pub enum ProbeOutcome {
    /// The probe call succeeded
    Responding,
    /// The server answered "no such method"; its listener is up
    UnknownMethod,
    /// The server answered with some other protocol error
    ProtocolError(String),
    /// Connection refused, reset, or timed out
    Unreachable(String),
}

impl ProbeOutcome {
    /// Only a successful reply or "no such method" counts as ready
    pub fn is_ready(&self) -> bool {
        matches!(self, ProbeOutcome::Responding | ProbeOutcome::UnknownMethod)
    }

    pub fn from_reply(reply: Result<Value, RpcFailure>) -> Self {
        match reply {
            Ok(_) => ProbeOutcome::Responding,
            Err(RpcFailure::NoSuchMethod) => ProbeOutcome::UnknownMethod,
            Err(RpcFailure::Remote { message }) | Err(RpcFailure::Protocol { message }) => {
                ProbeOutcome::ProtocolError(message)
            }
            Err(failure @ RpcFailure::Unreachable { .. }) | Err(failure @ RpcFailure::Timeout(_)) => {
                ProbeOutcome::Unreachable(failure.to_string())
            }
        }
    }
}

/// Ping a server once
pub async fn probe(transport: &dyn RpcTransport, endpoint: &Endpoint, timeout: Duration) -> ProbeOutcome {
    let reply = transport.call(endpoint, PROBE_METHOD, Vec::new(), timeout).await;
    ProbeOutcome::from_reply(reply)
}

/// Call a status method and return the member identifiers keying its reply
pub async fn status_keys(
    transport: &dyn RpcTransport,
    endpoint: &Endpoint,
    method: &str,
    cluster: &str,
    timeout: Duration,
) -> Result<Vec<String>, RpcFailure> {
    let reply = transport
        .call(endpoint, method, vec![Value::from(cluster)], timeout)
        .await?;
    map_keys(&reply)
}

/// Keys of a MessagePack map, in reply order
pub fn map_keys(reply: &Value) -> Result<Vec<String>, RpcFailure> {
    let entries = reply.as_map().ok_or_else(|| RpcFailure::Protocol {
        message: format!("expected a map, got {reply}"),
    })?;

    entries
        .iter()
        .map(|(key, _)| {
            key.as_str().map(str::to_string).ok_or_else(|| RpcFailure::Protocol {
                message: format!("non-string map key {key}"),
            })
        })
        .collect()
}

/// Render an RPC error value as text
pub fn error_text(value: &Value) -> String {
    match value.as_str() {
        Some(text) => text.to_string(),
        None => value.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unknown_method_counts_as_ready() {
        assert!(ProbeOutcome::from_reply(Err(RpcFailure::NoSuchMethod)).is_ready());
        assert!(ProbeOutcome::from_reply(Ok(Value::Nil)).is_ready());
    }

    #[test]
    fn test_unreachable_and_other_errors_are_not_ready() {
        let refused = RpcFailure::Unreachable {
            endpoint: "h:1".to_string(),
            message: "connection refused".to_string(),
        };
        assert!(matches!(ProbeOutcome::from_reply(Err(refused)), ProbeOutcome::Unreachable(_)));
        assert!(!ProbeOutcome::from_reply(Err(RpcFailure::Timeout(PROBE_TIMEOUT))).is_ready());

        let argument_error = ProbeOutcome::from_reply(Err(RpcFailure::Remote {
            message: "argument error".to_string(),
        }));
        assert_eq!(argument_error, ProbeOutcome::ProtocolError("argument error".to_string()));
        assert!(!argument_error.is_ready());
    }

    #[test]
    fn test_map_keys_in_reply_order() {
        let reply = Value::Map(vec![
            (Value::from("10.0.0.1_9199"), Value::Map(vec![])),
            (Value::from("10.0.0.2_9199"), Value::Map(vec![])),
        ]);
        assert_eq!(map_keys(&reply).unwrap(), vec!["10.0.0.1_9199", "10.0.0.2_9199"]);
    }

    #[test]
    fn test_map_keys_rejects_non_map() {
        assert!(matches!(map_keys(&Value::from(3)), Err(RpcFailure::Protocol { .. })));
    }

    #[test]
    fn test_error_text() {
        assert_eq!(error_text(&Value::from("no server found: c1")), "no server found: c1");
        assert_eq!(error_text(&Value::from(2)), "2");
    }
}
