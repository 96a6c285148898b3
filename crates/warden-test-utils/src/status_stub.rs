//! JSON-RPC stub standing in for a node's HTTP status endpoint.
//!
//! Answers every POST with a sync-phase result, walking through a scripted
//! list of phases one request at a time and then repeating the last one.
//! Readiness tests point an `RpcStatusProbe` at it and count the hits.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use axum::extract::State;
use axum::routing::post;
use axum::{Json, Router};
use tokio::task::JoinHandle;

struct StubState {
    phases: Vec<String>,
    hits: AtomicUsize,
}

/// A live stub server on a random local port. Shuts down on drop.
pub struct StatusStub {
    port: u16,
    state: Arc<StubState>,
    server: JoinHandle<()>,
}

impl StatusStub {
    /// Serve the given phase sequence on `127.0.0.1:0`. The first request
    /// sees `phases[0]`, the second `phases[1]`, and so on; once the list is
    /// exhausted the last phase repeats forever.
    pub async fn start(phases: &[&str]) -> Self {
        let state = Arc::new(StubState {
            phases: phases.iter().map(|p| p.to_string()).collect(),
            hits: AtomicUsize::new(0),
        });

        let app = Router::new()
            .route("/", post(phase_response))
            .with_state(Arc::clone(&state));
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
            .await
            .expect("bind status stub");
        let port = listener
            .local_addr()
            .expect("status stub has a local address")
            .port();

        let server = tokio::spawn(async move {
            let _ = axum::serve(listener, app).await;
        });

        Self {
            port,
            state,
            server,
        }
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn url(&self) -> String {
        format!("http://127.0.0.1:{}", self.port)
    }

    /// How many requests the stub has answered so far.
    pub fn hits(&self) -> usize {
        self.state.hits.load(Ordering::SeqCst)
    }
}

impl Drop for StatusStub {
    fn drop(&mut self) {
        self.server.abort();
    }
}

async fn phase_response(
    State(state): State<Arc<StubState>>,
    Json(request): Json<serde_json::Value>,
) -> Json<serde_json::Value> {
    let n = state.hits.fetch_add(1, Ordering::SeqCst);
    let phase = state
        .phases
        .get(n)
        .or_else(|| state.phases.last())
        .cloned()
        .unwrap_or_else(|| "NormalSyncPhase".to_string());
    let id = request
        .get("id")
        .cloned()
        .unwrap_or_else(|| serde_json::json!(1));

    Json(serde_json::json!({
        "jsonrpc": "2.0",
        "id": id,
        "result": phase,
    }))
}
