//! Event-tagged frames.
//!
//! Frame payload format: `[2-byte BE u16 event length][event UTF-8][payload bytes]`,
//! carried inside a regular length-prefixed stream frame.

use super::RESERVED_PREFIX;
use crate::{Result, RpcError};

/// One event-tagged message on a hot channel connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HotFrame {
    pub event: String,
    pub payload: Vec<u8>,
}

impl HotFrame {
    pub fn new(event: impl Into<String>, payload: Vec<u8>) -> Self {
        Self {
            event: event.into(),
            payload,
        }
    }

    pub fn encode(&self) -> Result<Vec<u8>> {
        encode_parts(&self.event, &self.payload)
    }

    pub fn decode(bytes: &[u8]) -> Result<Self> {
        if bytes.len() < 2 {
            return Err(RpcError::InvalidFrame {
                message: format!("hot frame of {} bytes has no event header", bytes.len()),
            });
        }
        let len = u16::from_be_bytes([bytes[0], bytes[1]]) as usize;
        let rest = &bytes[2..];
        if rest.len() < len {
            return Err(RpcError::InvalidFrame {
                message: format!("event name needs {} bytes, {} available", len, rest.len()),
            });
        }
        let event = std::str::from_utf8(&rest[..len]).map_err(|_| RpcError::InvalidFrame {
            message: "event name is not valid UTF-8".to_string(),
        })?;

        Ok(Self {
            event: event.to_string(),
            payload: rest[len..].to_vec(),
        })
    }

    pub fn is_reserved(&self) -> bool {
        self.event.starts_with(RESERVED_PREFIX)
    }
}

/// Encode without building a `HotFrame` first.
pub(crate) fn encode_parts(event: &str, payload: &[u8]) -> Result<Vec<u8>> {
    let len = u16::try_from(event.len()).map_err(|_| RpcError::InvalidFrame {
        message: format!("event name of {} bytes is too long", event.len()),
    })?;
    let mut bytes = Vec::with_capacity(2 + event.len() + payload.len());
    bytes.extend_from_slice(&len.to_be_bytes());
    bytes.extend_from_slice(event.as_bytes());
    bytes.extend_from_slice(payload);
    Ok(bytes)
}
