//! Wire messages and framing.
//!
//! Every message is a JSON-RPC 2.0 object. Requests carry positional
//! `params`; a request without an `id` is a notification and never gets a
//! response.
//!
//! Stream transports wrap each encoded message in a length-prefixed frame:
//!
//! ```text
//! [u32 BE: len][payload bytes of len]
//! ```

use crate::config::RpcConfig;
use crate::{Result, RpcError};
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;
use tokio::io::{AsyncReadExt, AsyncWriteExt};

/// One unit exchanged between Endpoints.
#[derive(Debug, Clone, PartialEq)]
pub enum Message {
    /// `id == None` marks a notification.
    Request {
        id: Option<u64>,
        method: String,
        args: Vec<Value>,
    },
    Response {
        id: u64,
        outcome: std::result::Result<Value, ErrorObject>,
    },
}

impl Message {
    pub fn request(id: u64, method: impl Into<String>, args: Vec<Value>) -> Self {
        Message::Request {
            id: Some(id),
            method: method.into(),
            args,
        }
    }

    pub fn notification(method: impl Into<String>, args: Vec<Value>) -> Self {
        Message::Request {
            id: None,
            method: method.into(),
            args,
        }
    }

    pub fn success(id: u64, result: Value) -> Self {
        Message::Response {
            id,
            outcome: Ok(result),
        }
    }

    pub fn error(id: u64, error: ErrorObject) -> Self {
        Message::Response {
            id,
            outcome: Err(error),
        }
    }
}

/// JSON-RPC 2.0 error object.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorObject {
    pub code: i32,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

/// JSON-RPC 2.0 request as it appears on the wire.
///
/// `params` may be an array (spread as positional args), absent or `null`
/// (no args), or any other value (passed as the single arg).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RpcRequest {
    pub jsonrpc: String,
    pub method: String,
    #[serde(default, deserialize_with = "positional_params")]
    pub params: Vec<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<u64>,
}

/// JSON-RPC 2.0 response as it appears on the wire.
///
/// Exactly one of `result` and `error` is present. A `null` result is
/// `Some(Value::Null)`, distinct from an absent one.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RpcResponse {
    pub jsonrpc: String,
    #[serde(
        default,
        deserialize_with = "present_value",
        skip_serializing_if = "Option::is_none"
    )]
    pub result: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorObject>,
    pub id: u64,
}

fn positional_params<'de, D>(deserializer: D) -> std::result::Result<Vec<Value>, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(match Value::deserialize(deserializer)? {
        Value::Array(items) => items,
        Value::Null => Vec::new(),
        other => vec![other],
    })
}

fn present_value<'de, D>(deserializer: D) -> std::result::Result<Option<Value>, D::Error>
where
    D: Deserializer<'de>,
{
    Value::deserialize(deserializer).map(Some)
}

#[derive(Debug, Serialize)]
#[serde(untagged)]
enum WireMessage {
    Request(RpcRequest),
    Response(RpcResponse),
}

impl From<&Message> for WireMessage {
    fn from(message: &Message) -> Self {
        let jsonrpc = RpcConfig::JSONRPC_VERSION.to_string();
        match message {
            Message::Request { id, method, args } => WireMessage::Request(RpcRequest {
                jsonrpc,
                method: method.clone(),
                params: args.clone(),
                id: *id,
            }),
            Message::Response { id, outcome } => {
                let (result, error) = match outcome {
                    Ok(value) => (Some(value.clone()), None),
                    Err(err) => (None, Some(err.clone())),
                };
                WireMessage::Response(RpcResponse {
                    jsonrpc,
                    result,
                    error,
                    id: *id,
                })
            }
        }
    }
}

/// Serialize a message for a channel.
pub fn encode(message: &Message) -> Result<Vec<u8>> {
    Ok(serde_json::to_vec(&WireMessage::from(message))?)
}

/// Parse a message received from a channel.
///
/// Anything carrying a `method` is a request; everything else must be a
/// well-formed response with exactly one of `result` and `error`.
pub fn decode(bytes: &[u8]) -> Result<Message> {
    let value: Value = serde_json::from_slice(bytes)?;
    if value.get("method").is_some() {
        let req: RpcRequest = serde_json::from_value(value)?;
        check_version(&req.jsonrpc)?;
        return Ok(Message::Request {
            id: req.id,
            method: req.method,
            args: req.params,
        });
    }

    let resp: RpcResponse = serde_json::from_value(value)?;
    check_version(&resp.jsonrpc)?;
    let outcome = match (resp.result, resp.error) {
        (Some(result), None) => Ok(result),
        (None, Some(error)) => Err(error),
        (Some(_), Some(_)) => {
            return Err(RpcError::InvalidFrame {
                message: format!("response #{} has both result and error", resp.id),
            })
        }
        (None, None) => {
            return Err(RpcError::InvalidFrame {
                message: format!("response #{} has neither result nor error", resp.id),
            })
        }
    };
    Ok(Message::Response {
        id: resp.id,
        outcome,
    })
}

/// The id of a frame that names a `method` but failed to decode, so the
/// sender can be told its request was invalid.
pub fn rejected_request_id(bytes: &[u8]) -> Option<u64> {
    let value: Value = serde_json::from_slice(bytes).ok()?;
    value.get("method")?;
    value.get("id")?.as_u64()
}

fn check_version(version: &str) -> Result<()> {
    if version != RpcConfig::JSONRPC_VERSION {
        return Err(RpcError::InvalidFrame {
            message: format!("expected jsonrpc {}, got {}", RpcConfig::JSONRPC_VERSION, version),
        });
    }
    Ok(())
}

/// Read a length-prefixed frame from an async reader.
///
/// Frame format: `[4-byte BE u32 length][payload bytes]`
///
/// Returns `None` on clean EOF (peer closed connection).
pub async fn read_frame<R: AsyncReadExt + Unpin>(reader: &mut R) -> Result<Option<Vec<u8>>> {
    let mut len_buf = [0u8; 4];
    match reader.read_exact(&mut len_buf).await {
        Ok(_) => {}
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e.into()),
    }

    let len = u32::from_be_bytes(len_buf) as usize;
    if len > RpcConfig::MAX_FRAME_SIZE {
        return Err(RpcError::InvalidFrame {
            message: format!(
                "frame of {} bytes exceeds maximum {}",
                len,
                RpcConfig::MAX_FRAME_SIZE
            ),
        });
    }
    let mut payload = vec![0u8; len];
    reader.read_exact(&mut payload).await?;

    Ok(Some(payload))
}

/// Write a length-prefixed frame to an async writer.
///
/// Frame format: `[4-byte BE u32 length][payload bytes]`
pub async fn write_frame<W: AsyncWriteExt + Unpin>(writer: &mut W, payload: &[u8]) -> Result<()> {
    let len = u32::try_from(payload.len()).map_err(|_| RpcError::InvalidFrame {
        message: format!("payload of {} bytes does not fit a frame", payload.len()),
    })?;
    writer.write_all(&len.to_be_bytes()).await?;
    writer.write_all(payload).await?;
    writer.flush().await?;
    Ok(())
}
