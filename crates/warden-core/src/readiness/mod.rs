//! Readiness probing for freshly started nodes.
//!
//! A worker saying `started` only means the node process is up; whether its
//! RPC surface answers is a separate question. [`wait_until_ready`] polls a
//! [`StatusProbe`] until it reports ready or an overall deadline passes.
//! Individual probe attempts are capped so one hung connection cannot eat
//! the whole budget, and attempt errors are expected traffic (the node is
//! still coming up), not failures.

use std::time::Duration;

use anyhow::bail;
use async_trait::async_trait;
use serde::Deserialize;
use tokio::time::Instant;
use tracing::debug;

use crate::config::NodeConfig;
use crate::error::SupervisorError;

/// Upper bound on a single probe attempt.
pub const PROBE_ATTEMPT_CAP: Duration = Duration::from_secs(2);

/// Default JSON-RPC method asked for the sync phase.
pub const DEFAULT_SYNC_METHOD: &str = "cfx_getCurrentSyncPhase";

/// Sync phase answer that counts as ready.
pub const READY_PHASE: &str = "NormalSyncPhase";

/// One yes/no readiness check against a node.
///
/// Errors are treated the same as "not ready": while a node boots, refused
/// connections and half-open sockets are the normal state of the world.
#[async_trait]
pub trait StatusProbe: Send + Sync {
    async fn ready(&self) -> anyhow::Result<bool>;

    /// Human-readable probe target for logs.
    fn target(&self) -> String;
}

const _: () = {
    fn _assert_object_safe(_: &dyn StatusProbe) {}
};

/// Poll `probe` until it reports ready.
///
/// Attempts run back to back, `retry_interval` apart, each capped at
/// [`PROBE_ATTEMPT_CAP`] (or the time left, whichever is smaller). When
/// `timeout` elapses first the node is declared not ready and the caller
/// decides what to do with the worker.
pub async fn wait_until_ready(
    probe: &dyn StatusProbe,
    timeout: Duration,
    retry_interval: Duration,
) -> Result<(), SupervisorError> {
    let started = Instant::now();
    let deadline = started + timeout;

    loop {
        let now = Instant::now();
        if now >= deadline {
            break;
        }

        let attempt_cap = PROBE_ATTEMPT_CAP.min(deadline - now);
        match tokio::time::timeout(attempt_cap, probe.ready()).await {
            Ok(Ok(true)) => {
                debug!(target = probe.target(), elapsed = ?started.elapsed(), "node is ready");
                return Ok(());
            }
            Ok(Ok(false)) => debug!(target = probe.target(), "node not ready yet"),
            Ok(Err(e)) => debug!(target = probe.target(), error = %e, "readiness probe failed"),
            Err(_) => debug!(target = probe.target(), "readiness probe attempt timed out"),
        }

        let now = Instant::now();
        if now >= deadline {
            break;
        }
        tokio::time::sleep(retry_interval.min(deadline - now)).await;
    }

    Err(SupervisorError::ReadinessTimeout {
        elapsed: started.elapsed(),
    })
}

/// Pick the right probe for a node, if it exposes anything probeable.
/// HTTP is preferred: it can ask for the sync phase rather than just a
/// listening socket.
pub fn probe_for(config: &NodeConfig) -> Option<Box<dyn StatusProbe>> {
    if let Some(port) = config.http_port {
        return Some(Box::new(RpcStatusProbe::new(port)));
    }
    if let Some(port) = config.ws_port {
        return Some(Box::new(SocketProbe::new(port)));
    }
    None
}

/// Asks a node's HTTP JSON-RPC endpoint for its sync phase.
#[derive(Debug, Clone)]
pub struct RpcStatusProbe {
    client: reqwest::Client,
    url: String,
    method: String,
    ready_phase: String,
}

#[derive(Debug, Deserialize)]
struct RpcResponse {
    #[serde(default)]
    result: Option<serde_json::Value>,
    #[serde(default)]
    error: Option<RpcErrorBody>,
}

#[derive(Debug, Deserialize)]
struct RpcErrorBody {
    code: i64,
    message: String,
}

impl RpcStatusProbe {
    pub fn new(port: u16) -> Self {
        Self::with_url(format!("http://127.0.0.1:{port}"))
    }

    pub fn with_url(url: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            url: url.into(),
            method: DEFAULT_SYNC_METHOD.to_string(),
            ready_phase: READY_PHASE.to_string(),
        }
    }

    /// Override the RPC method asked for the phase.
    pub fn method(mut self, method: impl Into<String>) -> Self {
        self.method = method.into();
        self
    }

    /// Override the answer that counts as ready.
    pub fn ready_phase(mut self, phase: impl Into<String>) -> Self {
        self.ready_phase = phase.into();
        self
    }
}

#[async_trait]
impl StatusProbe for RpcStatusProbe {
    async fn ready(&self) -> anyhow::Result<bool> {
        let body = serde_json::json!({
            "jsonrpc": "2.0",
            "id": 1,
            "method": self.method,
            "params": [],
        });

        let response = self
            .client
            .post(&self.url)
            .json(&body)
            .send()
            .await?
            .error_for_status()?;
        let parsed: RpcResponse = response.json().await?;

        if let Some(err) = parsed.error {
            bail!("rpc error {}: {}", err.code, err.message);
        }
        Ok(parsed.result.as_ref().and_then(|v| v.as_str()) == Some(self.ready_phase.as_str()))
    }

    fn target(&self) -> String {
        format!("{} ({})", self.url, self.method)
    }
}

/// Fallback probe for nodes that only expose a WebSocket port: a successful
/// TCP connect counts as ready.
#[derive(Debug, Clone)]
pub struct SocketProbe {
    addr: String,
}

impl SocketProbe {
    pub fn new(port: u16) -> Self {
        Self {
            addr: format!("127.0.0.1:{port}"),
        }
    }
}

#[async_trait]
impl StatusProbe for SocketProbe {
    async fn ready(&self) -> anyhow::Result<bool> {
        match tokio::net::TcpStream::connect(&self.addr).await {
            Ok(_) => Ok(true),
            Err(_) => Ok(false),
        }
    }

    fn target(&self) -> String {
        format!("tcp://{}", self.addr)
    }
}
