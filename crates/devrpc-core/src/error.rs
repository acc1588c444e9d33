//! Error types for the RPC layer.
//!
//! Every failure a caller can observe is an [`RpcError`]. None of them tear
//! down the Endpoint or Group that produced them; a failed call never prevents
//! later calls.

use crate::protocol::ErrorObject;
use serde_json::json;
use std::time::Duration;
use thiserror::Error;

/// Main error type for RPC operations.
#[derive(Debug, Error)]
pub enum RpcError {
    /// Sending on a closed channel, or the transport itself failed.
    #[error("Transport error: {message}")]
    Transport { message: String },

    /// The remote registry has no function under this name.
    #[error("Method not found: {method}")]
    MethodNotFound { method: String },

    /// The remote function failed; `message` is its description, verbatim.
    #[error("Remote error in {method}: {message}")]
    Remote {
        method: String,
        code: i32,
        message: String,
    },

    #[error("Call to {method} timed out after {timeout:?}")]
    Timeout { method: String, timeout: Duration },

    /// The channel closed (or the Endpoint was discarded) while the call was
    /// outstanding.
    #[error("Peer disconnected before {method} completed")]
    PeerDisconnected { method: String },

    #[error("Peer not found: {peer}")]
    PeerNotFound { peer: String },

    // Serialization errors
    #[error("JSON error: {message}")]
    Json {
        message: String,
        #[source]
        source: Option<serde_json::Error>,
    },

    #[error("IO error: {message}")]
    Io {
        message: String,
        #[source]
        source: Option<std::io::Error>,
    },

    #[error("Invalid frame: {message}")]
    InvalidFrame { message: String },
}

/// Payload-free view of [`RpcError`], for matching on the taxonomy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RpcErrorKind {
    Transport,
    MethodNotFound,
    Remote,
    Timeout,
    PeerDisconnected,
    PeerNotFound,
    Json,
    Io,
    InvalidFrame,
}

/// Result type alias for RPC operations.
pub type Result<T> = std::result::Result<T, RpcError>;

impl From<std::io::Error> for RpcError {
    fn from(err: std::io::Error) -> Self {
        RpcError::Io {
            message: err.to_string(),
            source: Some(err),
        }
    }
}

impl From<serde_json::Error> for RpcError {
    fn from(err: serde_json::Error) -> Self {
        RpcError::Json {
            message: err.to_string(),
            source: Some(err),
        }
    }
}

impl RpcError {
    /// Error for a send on a channel that is already closed.
    pub fn channel_closed() -> Self {
        RpcError::Transport {
            message: "channel is closed".to_string(),
        }
    }

    pub fn kind(&self) -> RpcErrorKind {
        match self {
            RpcError::Transport { .. } => RpcErrorKind::Transport,
            RpcError::MethodNotFound { .. } => RpcErrorKind::MethodNotFound,
            RpcError::Remote { .. } => RpcErrorKind::Remote,
            RpcError::Timeout { .. } => RpcErrorKind::Timeout,
            RpcError::PeerDisconnected { .. } => RpcErrorKind::PeerDisconnected,
            RpcError::PeerNotFound { .. } => RpcErrorKind::PeerNotFound,
            RpcError::Json { .. } => RpcErrorKind::Json,
            RpcError::Io { .. } => RpcErrorKind::Io,
            RpcError::InvalidFrame { .. } => RpcErrorKind::InvalidFrame,
        }
    }

    /// Convert to a JSON-RPC error code.
    ///
    /// Standard JSON-RPC error codes:
    /// - -32700: Parse error
    /// - -32601: Method not found
    /// - -32603: Internal error (remote function failed)
    ///
    /// Custom error codes (application-defined, -32000 to -32099):
    /// - -32000: Transport/connectivity error
    /// - -32001: Timeout
    /// - -32002: Peer disconnected
    /// - -32003: Peer not found
    pub fn to_rpc_error_code(&self) -> i32 {
        match self {
            RpcError::Transport { .. } | RpcError::Io { .. } => -32000,
            RpcError::Timeout { .. } => -32001,
            RpcError::PeerDisconnected { .. } => -32002,
            RpcError::PeerNotFound { .. } => -32003,
            RpcError::MethodNotFound { .. } => -32601,
            RpcError::Json { .. } | RpcError::InvalidFrame { .. } => -32700,
            RpcError::Remote { code, .. } => *code,
        }
    }

    /// Serialize into the error object carried by a Response-Error.
    pub fn to_wire(&self) -> ErrorObject {
        let message = match self {
            RpcError::Remote { message, .. } => message.clone(),
            other => other.to_string(),
        };
        ErrorObject {
            code: self.to_rpc_error_code(),
            message,
            data: Some(json!({ "kind": format!("{:?}", self.kind()) })),
        }
    }

    /// Rebuild the caller-side error from a Response-Error for `method`.
    pub fn from_wire(method: &str, error: &ErrorObject) -> Self {
        if error.code == -32601 {
            return RpcError::MethodNotFound {
                method: method.to_string(),
            };
        }
        RpcError::Remote {
            method: method.to_string(),
            code: error.code,
            message: error.message.clone(),
        }
    }

    /// Check if a later attempt of the same call could succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            RpcError::Transport { .. }
                | RpcError::Timeout { .. }
                | RpcError::PeerDisconnected { .. }
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = RpcError::MethodNotFound {
            method: "getPackages".into(),
        };
        assert_eq!(err.to_string(), "Method not found: getPackages");
    }

    #[test]
    fn test_rpc_error_codes() {
        assert_eq!(
            RpcError::MethodNotFound {
                method: "x".into()
            }
            .to_rpc_error_code(),
            -32601
        );
        assert_eq!(RpcError::channel_closed().to_rpc_error_code(), -32000);
        assert_eq!(
            RpcError::Remote {
                method: "x".into(),
                code: -32603,
                message: "boom".into()
            }
            .to_rpc_error_code(),
            -32603
        );
    }

    #[test]
    fn test_wire_keeps_method_not_found_distinct() {
        let wire = RpcError::MethodNotFound {
            method: "missing".into(),
        }
        .to_wire();
        let back = RpcError::from_wire("missing", &wire);
        assert_eq!(back.kind(), RpcErrorKind::MethodNotFound);

        let wire = ErrorObject {
            code: -32603,
            message: "disk on fire".into(),
            data: None,
        };
        match RpcError::from_wire("readFile", &wire) {
            RpcError::Remote { method, message, .. } => {
                assert_eq!(method, "readFile");
                assert_eq!(message, "disk on fire");
            }
            other => panic!("Expected Remote, got: {:?}", other),
        }
    }

    #[test]
    fn test_retryable_errors() {
        assert!(RpcError::Timeout {
            method: "slowOp".into(),
            timeout: Duration::from_secs(5)
        }
        .is_retryable());
        assert!(!RpcError::MethodNotFound {
            method: "x".into()
        }
        .is_retryable());
    }
}
