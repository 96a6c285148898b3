//! The `warden wait` command: block until an already-running node answers
//! its status RPC with the ready phase.

use std::time::Duration;

use anyhow::{Result, bail};
use clap::Args;
use tracing::info;

use warden_core::config::{DEFAULT_RETRY_INTERVAL, DEFAULT_TIMEOUT};
use warden_core::readiness::{DEFAULT_SYNC_METHOD, READY_PHASE};
use warden_core::{RpcStatusProbe, StatusProbe, wait_until_ready};

#[derive(Args, Debug)]
pub struct WaitArgs {
    /// HTTP JSON-RPC port of the node (assumes 127.0.0.1)
    #[arg(long, conflicts_with = "url")]
    http_port: Option<u16>,

    /// Full JSON-RPC endpoint URL
    #[arg(long)]
    url: Option<String>,

    /// RPC method to poll
    #[arg(long, default_value = DEFAULT_SYNC_METHOD)]
    method: String,

    /// Result that counts as ready
    #[arg(long, default_value = READY_PHASE)]
    phase: String,

    /// Overall deadline in milliseconds
    #[arg(long, default_value_t = DEFAULT_TIMEOUT.as_millis() as u64)]
    timeout_ms: u64,

    /// Pause between attempts in milliseconds
    #[arg(long, default_value_t = DEFAULT_RETRY_INTERVAL.as_millis() as u64)]
    retry_interval_ms: u64,
}

pub async fn wait_for_node(args: WaitArgs) -> Result<()> {
    let probe = match (args.url, args.http_port) {
        (Some(url), _) => RpcStatusProbe::with_url(url),
        (None, Some(port)) => RpcStatusProbe::new(port),
        (None, None) => bail!("nothing to wait for; pass --http-port or --url"),
    }
    .method(args.method)
    .ready_phase(args.phase);

    info!(target = probe.target(), "waiting for node readiness");
    wait_until_ready(
        &probe,
        Duration::from_millis(args.timeout_ms),
        Duration::from_millis(args.retry_interval_ms),
    )
    .await?;

    println!("ready");
    Ok(())
}
