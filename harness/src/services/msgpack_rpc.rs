//! MessagePack-RPC over TCP
//!
//! One connection per call. Requests are `[0, msgid, method, params]`,
//! responses `[1, msgid, error, result]`.

use std::io::{Cursor, ErrorKind};
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use rmpv::Value;
use shared::Endpoint;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tracing::debug;

use crate::rpc::{error_text, RpcFailure};
use crate::traits::RpcTransport;

const REQUEST: u8 = 0;
const RESPONSE: u64 = 1;

/// Error code servers return for an unknown method
const NO_METHOD_ERROR: u64 = 1;

#[derive(Debug, Default)]
pub struct MsgpackRpcTransport {
    next_msgid: AtomicU32,
}

impl MsgpackRpcTransport {
    pub fn new() -> Self {
        Self::default()
    }

    async fn exchange(&self, endpoint: &Endpoint, method: &str, params: Vec<Value>) -> Result<Value, RpcFailure> {
        let msgid = self.next_msgid.fetch_add(1, Ordering::Relaxed);
        let request = rmp_serde::to_vec(&(REQUEST, msgid, method, params)).map_err(|e| RpcFailure::Protocol {
            message: format!("cannot encode request: {e}"),
        })?;

        let unreachable = |e: std::io::Error| RpcFailure::Unreachable {
            endpoint: endpoint.to_string(),
            message: e.to_string(),
        };

        let mut stream = TcpStream::connect((endpoint.host.as_str(), endpoint.port))
            .await
            .map_err(unreachable)?;
        stream.write_all(&request).await.map_err(unreachable)?;

        let mut buffer = Vec::with_capacity(256);
        let mut chunk = [0u8; 4096];
        loop {
            if let Some(response) = decode_partial(&buffer)? {
                return interpret(response, msgid);
            }
            let read = stream.read(&mut chunk).await.map_err(unreachable)?;
            if read == 0 {
                return Err(RpcFailure::Unreachable {
                    endpoint: endpoint.to_string(),
                    message: "connection closed before a complete response".to_string(),
                });
            }
            buffer.extend_from_slice(&chunk[..read]);
        }
    }
}

#[async_trait]
impl RpcTransport for MsgpackRpcTransport {
    async fn call(
        &self,
        endpoint: &Endpoint,
        method: &str,
        params: Vec<Value>,
        timeout: Duration,
    ) -> Result<Value, RpcFailure> {
        debug!("rpc {} -> {}", method, endpoint);
        match tokio::time::timeout(timeout, self.exchange(endpoint, method, params)).await {
            Ok(reply) => reply,
            Err(_) => Err(RpcFailure::Timeout(timeout)),
        }
    }
}

/// Decode one value from the front of `buffer`, or `None` if more bytes are needed
fn decode_partial(buffer: &[u8]) -> Result<Option<Value>, RpcFailure> {
    if buffer.is_empty() {
        return Ok(None);
    }
    let mut cursor = Cursor::new(buffer);
    match rmpv::decode::read_value(&mut cursor) {
        Ok(value) => Ok(Some(value)),
        Err(rmpv::decode::Error::InvalidMarkerRead(e)) | Err(rmpv::decode::Error::InvalidDataRead(e))
            if e.kind() == ErrorKind::UnexpectedEof =>
        {
            Ok(None)
        }
        Err(e) => Err(RpcFailure::Protocol {
            message: format!("cannot decode response: {e}"),
        }),
    }
}

fn interpret(response: Value, msgid: u32) -> Result<Value, RpcFailure> {
    let protocol = |message: String| RpcFailure::Protocol { message };

    let Value::Array(fields) = response else {
        return Err(protocol(format!("response is not an array: {response}")));
    };
    let [kind, id, error, result]: [Value; 4] = fields
        .try_into()
        .map_err(|fields: Vec<Value>| protocol(format!("response has {} fields, expected 4", fields.len())))?;

    if kind.as_u64() != Some(RESPONSE) {
        return Err(protocol(format!("unexpected message type {kind}")));
    }
    if id.as_u64() != Some(u64::from(msgid)) {
        return Err(protocol(format!("response id {id} does not match request id {msgid}")));
    }

    match error {
        Value::Nil => Ok(result),
        code if code.as_u64() == Some(NO_METHOD_ERROR) => Err(RpcFailure::NoSuchMethod),
        other => Err(RpcFailure::Remote {
            message: error_text(&other),
        }),
    }
}
