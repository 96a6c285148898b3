//! Node and supervisor configuration.
//!
//! [`NodeConfig`] is the payload handed to the worker inside the start
//! command; the supervisor itself only inspects the RPC ports (to decide
//! whether to probe for readiness), `data_dir` and `persist_data` (to decide
//! what to clean up after a graceful stop). Everything else, including
//! arbitrary extra keys, passes through to the worker untouched.

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Overall deadline for `start()`: launch, handshake and readiness together.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_millis(20_000);

/// Pause between readiness probe attempts.
pub const DEFAULT_RETRY_INTERVAL: Duration = Duration::from_millis(300);

/// How long a graceful stop may take before the worker is killed.
pub const DEFAULT_STOP_GRACE: Duration = Duration::from_millis(5_000);

/// Configuration forwarded to the node worker.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct NodeConfig {
    /// HTTP JSON-RPC port. When set, `start()` polls it for readiness.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub http_port: Option<u16>,
    /// WebSocket RPC port. Probed with a plain TCP connect when no HTTP
    /// port is available.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ws_port: Option<u16>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data_dir: Option<PathBuf>,
    /// Keep chain data across stops. Off by default: a stopped node wipes
    /// its working directories.
    pub persist_data: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub chain_id: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub block_interval_ms: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub log_file: Option<PathBuf>,
    /// Worker-specific keys the supervisor does not interpret.
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

impl NodeConfig {
    /// True when at least one RPC port is configured, i.e. there is
    /// something to probe before declaring the node ready.
    pub fn rpc_configured(&self) -> bool {
        self.http_port.is_some() || self.ws_port.is_some()
    }
}

/// Timing knobs for the supervisor itself.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SupervisorSettings {
    /// Deadline for the whole of `start()`.
    #[serde(rename = "timeout_ms", with = "duration_ms")]
    pub timeout: Duration,
    /// Pause between readiness probe attempts.
    #[serde(rename = "retry_interval_ms", with = "duration_ms")]
    pub retry_interval: Duration,
    /// Grace period for `stop()` before the worker is forcibly killed.
    #[serde(rename = "stop_grace_ms", with = "duration_ms")]
    pub stop_grace: Duration,
}

impl Default for SupervisorSettings {
    fn default() -> Self {
        Self {
            timeout: DEFAULT_TIMEOUT,
            retry_interval: DEFAULT_RETRY_INTERVAL,
            stop_grace: DEFAULT_STOP_GRACE,
        }
    }
}

/// Serialize a `Duration` as integer milliseconds.
mod duration_ms {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_millis(u64::deserialize(deserializer)?))
    }
}
