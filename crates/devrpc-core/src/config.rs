//! Centralized configuration for the RPC layer.
//!
//! Constants live on unit structs, per-instance knobs on [`RpcOptions`].

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::time::Duration;

/// Protocol-level constants.
pub struct RpcConfig;

impl RpcConfig {
    pub const JSONRPC_VERSION: &'static str = "2.0";
    /// Suffix appended to a namespace to form its hot-channel event name.
    pub const DEFAULT_EVENT_SUFFIX: &'static str = "rpc";
    /// Largest frame accepted from a stream (16 MiB).
    pub const MAX_FRAME_SIZE: usize = 16 * 1024 * 1024;
}

/// Hot channel transport constants.
pub struct HubConfig;

impl HubConfig {
    pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);
    pub const MAX_HUB_CONNECTIONS: usize = 256;
    /// Capacity of the connect/disconnect notification channel.
    pub const EVENT_CAPACITY: usize = 64;
}

/// How long an outgoing call may wait for its response.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TimeoutPolicy {
    /// Wait until a response arrives or the channel closes.
    #[default]
    Never,
    After(Duration),
}

impl TimeoutPolicy {
    /// Build from milliseconds; any negative value means [`TimeoutPolicy::Never`].
    pub fn from_millis(millis: i64) -> Self {
        if millis < 0 {
            TimeoutPolicy::Never
        } else {
            TimeoutPolicy::After(Duration::from_millis(millis as u64))
        }
    }

    /// Inverse of [`TimeoutPolicy::from_millis`]; `Never` is `-1`.
    pub fn as_millis(&self) -> i64 {
        match self {
            TimeoutPolicy::Never => -1,
            TimeoutPolicy::After(d) => i64::try_from(d.as_millis()).unwrap_or(i64::MAX),
        }
    }

    pub fn duration(&self) -> Option<Duration> {
        match self {
            TimeoutPolicy::Never => None,
            TimeoutPolicy::After(d) => Some(*d),
        }
    }
}

impl Serialize for TimeoutPolicy {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.serialize_i64(self.as_millis())
    }
}

impl<'de> Deserialize<'de> for TimeoutPolicy {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let millis = i64::deserialize(deserializer)?;
        Ok(TimeoutPolicy::from_millis(millis))
    }
}

/// Options shared by Endpoints and Groups.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RpcOptions {
    /// Milliseconds on the wire, `-1` for no timeout.
    #[serde(default)]
    pub timeout: TimeoutPolicy,
}

impl RpcOptions {
    pub fn with_timeout(timeout: TimeoutPolicy) -> Self {
        Self { timeout }
    }
}
