//! The `warden run` command: start a node and supervise it until a shutdown
//! signal arrives or the node dies.

use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use clap::Args;
use tracing::{error, info};

use warden_core::{NodeConfig, Supervisor, SupervisorSettings, WorkerCommand};

use crate::config::{self, ConfigFile, WorkerMode};

#[derive(Args, Debug)]
pub struct RunArgs {
    /// Worker program to launch (falls back to WARDEN_WORKER, then the
    /// config file)
    program: Option<std::path::PathBuf>,

    /// Arguments passed through to the worker program
    #[arg(last = true)]
    args: Vec<String>,

    /// Working directory for the worker
    #[arg(long)]
    working_dir: Option<std::path::PathBuf>,

    /// Extra environment for the worker (repeatable)
    #[arg(long = "env", value_name = "KEY=VALUE")]
    env: Vec<String>,

    /// How the worker is driven
    #[arg(long, value_enum)]
    mode: Option<WorkerMode>,

    /// Stdout line marking readiness (raw mode)
    #[arg(long)]
    ready_marker: Option<String>,

    /// HTTP JSON-RPC port the node will expose
    #[arg(long)]
    http_port: Option<u16>,

    /// WebSocket RPC port the node will expose
    #[arg(long)]
    ws_port: Option<u16>,

    /// Node data directory
    #[arg(long)]
    data_dir: Option<std::path::PathBuf>,

    /// Node log file
    #[arg(long)]
    log_file: Option<std::path::PathBuf>,

    /// Keep node data across stops
    #[arg(long)]
    persist_data: bool,

    /// Chain id passed to the node
    #[arg(long)]
    chain_id: Option<u32>,

    /// Dev-mode block interval in milliseconds
    #[arg(long)]
    block_interval_ms: Option<u64>,

    /// Extra node config entries; values parse as JSON where possible
    /// (repeatable)
    #[arg(long = "set", value_name = "KEY=VALUE")]
    set: Vec<String>,

    /// Overall start deadline in milliseconds
    #[arg(long)]
    timeout_ms: Option<u64>,

    /// Pause between readiness probe attempts in milliseconds
    #[arg(long)]
    retry_interval_ms: Option<u64>,

    /// Graceful stop window before the worker is killed, in milliseconds
    #[arg(long)]
    stop_grace_ms: Option<u64>,
}

/// Everything `run` needs, after flags, env vars and the config file have
/// been folded together.
#[derive(Debug)]
struct ResolvedRun {
    command: WorkerCommand,
    mode: WorkerMode,
    ready_marker: Option<String>,
    node: NodeConfig,
    settings: SupervisorSettings,
}

/// Fold CLI flags over the config file: flag > env var > file > default.
fn resolve(file: ConfigFile, args: &RunArgs) -> Result<ResolvedRun> {
    let ConfigFile {
        worker,
        node: mut node_config,
        supervisor: mut settings,
    } = file;

    let program = args
        .program
        .clone()
        .or_else(|| std::env::var_os("WARDEN_WORKER").map(std::path::PathBuf::from))
        .or(worker.program)
        .context(
            "no worker program given; pass one, set WARDEN_WORKER, or add worker.program to the config file",
        )?;

    let mut command = WorkerCommand::new(program);
    // CLI args replace the file's rather than appending; mixing the two
    // would interleave flags in surprising ways.
    command = if args.args.is_empty() {
        command.args(worker.args)
    } else {
        command.args(args.args.clone())
    };
    if let Some(dir) = args.working_dir.clone().or(worker.working_dir) {
        command = command.working_dir(dir);
    }
    for (key, value) in worker.env {
        command = command.env(key, value);
    }
    for pair in &args.env {
        let (key, value) = split_pair(pair)?;
        command = command.env(key, value);
    }

    let mode = args.mode.unwrap_or(worker.mode);
    let ready_marker = args.ready_marker.clone().or(worker.ready_marker);
    if mode == WorkerMode::Raw && ready_marker.is_none() {
        bail!("raw mode needs a ready marker; pass --ready-marker or set worker.ready_marker");
    }

    if let Some(port) = args.http_port {
        node_config.http_port = Some(port);
    }
    if let Some(port) = args.ws_port {
        node_config.ws_port = Some(port);
    }
    if let Some(dir) = args.data_dir.clone() {
        node_config.data_dir = Some(dir);
    }
    if let Some(log) = args.log_file.clone() {
        node_config.log_file = Some(log);
    }
    if args.persist_data {
        node_config.persist_data = true;
    }
    if let Some(id) = args.chain_id {
        node_config.chain_id = Some(id);
    }
    if let Some(ms) = args.block_interval_ms {
        node_config.block_interval_ms = Some(ms);
    }
    for pair in &args.set {
        let (key, value) = split_pair(pair)?;
        node_config
            .extra
            .insert(key.to_string(), parse_extra_value(value));
    }

    if let Some(ms) = args.timeout_ms {
        settings.timeout = Duration::from_millis(ms);
    }
    if let Some(ms) = args.retry_interval_ms {
        settings.retry_interval = Duration::from_millis(ms);
    }
    if let Some(ms) = args.stop_grace_ms {
        settings.stop_grace = Duration::from_millis(ms);
    }

    Ok(ResolvedRun {
        command,
        mode,
        ready_marker,
        node: node_config,
        settings,
    })
}

fn split_pair(pair: &str) -> Result<(&str, &str)> {
    pair.split_once('=')
        .with_context(|| format!("expected KEY=VALUE, got {pair:?}"))
}

/// `--set` values parse as JSON when they can and fall back to strings, so
/// `--set dev_pack_tx_immediately=true` and `--set mining_author=0xabc` both
/// do what they look like.
fn parse_extra_value(raw: &str) -> serde_json::Value {
    serde_json::from_str(raw).unwrap_or_else(|_| serde_json::Value::String(raw.to_string()))
}

/// Execute the run command. Returns the process exit code: 0 after a clean
/// signal-driven shutdown, 1 when the node died on its own.
pub async fn run_node(config_flag: Option<&Path>, args: RunArgs) -> Result<i32> {
    let file = config::load_or_default(config_flag)?;
    let resolved = resolve(file, &args)?;

    let supervisor = match resolved.mode {
        WorkerMode::Ipc => {
            Supervisor::process(resolved.command, resolved.node, resolved.settings)
        }
        WorkerMode::Raw => {
            // resolve() guarantees the marker for raw mode.
            let marker = resolved.ready_marker.unwrap_or_default();
            Supervisor::raw_process(resolved.command, marker, resolved.node, resolved.settings)
        }
    };

    let (failure_tx, mut failure_rx) = tokio::sync::mpsc::channel::<String>(1);
    supervisor.on_failure(move |err| {
        let _ = failure_tx.try_send(err.to_string());
    });

    supervisor.start().await?;
    info!("node is up; send SIGINT or SIGTERM to stop it");

    tokio::select! {
        signal = wait_for_shutdown_signal() => {
            signal.context("failed to listen for shutdown signals")?;
            info!("shutdown signal received");
            let outcome = supervisor.stop().await?;
            info!(?outcome, "node shut down");
            Ok(0)
        }
        died = failure_rx.recv() => {
            let reason = died.unwrap_or_else(|| "failure channel closed".to_string());
            error!(reason = reason.as_str(), "node died");
            Ok(1)
        }
    }
}

#[cfg(unix)]
async fn wait_for_shutdown_signal() -> std::io::Result<()> {
    use tokio::signal::unix::{SignalKind, signal};

    let mut sigint = signal(SignalKind::interrupt())?;
    let mut sigterm = signal(SignalKind::terminate())?;

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {}
        _ = sigint.recv() => {}
        _ = sigterm.recv() => {}
    }
    Ok(())
}

#[cfg(not(unix))]
async fn wait_for_shutdown_signal() -> std::io::Result<()> {
    tokio::signal::ctrl_c().await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::WorkerSection;
    use std::path::PathBuf;

    fn lock_env() -> std::sync::MutexGuard<'static, ()> {
        crate::test_util::lock_env()
    }

    fn bare_args() -> RunArgs {
        RunArgs {
            program: None,
            args: vec![],
            working_dir: None,
            env: vec![],
            mode: None,
            ready_marker: None,
            http_port: None,
            ws_port: None,
            data_dir: None,
            log_file: None,
            persist_data: false,
            chain_id: None,
            block_interval_ms: None,
            set: vec![],
            timeout_ms: None,
            retry_interval_ms: None,
            stop_grace_ms: None,
        }
    }

    fn file_with_program(program: &str) -> ConfigFile {
        ConfigFile {
            worker: WorkerSection {
                program: Some(PathBuf::from(program)),
                ..Default::default()
            },
            ..Default::default()
        }
    }

    #[test]
    fn cli_program_beats_env_and_file() {
        let _lock = lock_env();
        unsafe { std::env::set_var("WARDEN_WORKER", "/from/env") };

        let mut args = bare_args();
        args.program = Some(PathBuf::from("/from/cli"));
        let resolved = resolve(file_with_program("/from/file"), &args).unwrap();

        unsafe { std::env::remove_var("WARDEN_WORKER") };
        assert_eq!(resolved.command.program, PathBuf::from("/from/cli"));
    }

    #[test]
    fn env_program_beats_file() {
        let _lock = lock_env();
        unsafe { std::env::set_var("WARDEN_WORKER", "/from/env") };

        let resolved = resolve(file_with_program("/from/file"), &bare_args());

        unsafe { std::env::remove_var("WARDEN_WORKER") };
        assert_eq!(
            resolved.unwrap().command.program,
            PathBuf::from("/from/env")
        );
    }

    #[test]
    fn missing_program_is_an_error() {
        let _lock = lock_env();
        unsafe { std::env::remove_var("WARDEN_WORKER") };

        let err = resolve(ConfigFile::default(), &bare_args()).unwrap_err();
        assert!(err.to_string().contains("no worker program"));
    }

    #[test]
    fn cli_args_replace_file_args() {
        let _lock = lock_env();
        let mut file = file_with_program("node");
        file.worker.args = vec!["--old".to_string()];

        let mut args = bare_args();
        args.args = vec!["--new".to_string(), "--flags".to_string()];
        let resolved = resolve(file, &args).unwrap();

        assert_eq!(resolved.command.args, vec!["--new", "--flags"]);
    }

    #[test]
    fn cli_env_pairs_override_file_env() {
        let _lock = lock_env();
        let mut file = file_with_program("node");
        file.worker
            .env
            .insert("RUST_LOG".to_string(), "warn".to_string());
        file.worker
            .env
            .insert("KEEP".to_string(), "yes".to_string());

        let mut args = bare_args();
        args.env = vec!["RUST_LOG=debug".to_string()];
        let resolved = resolve(file, &args).unwrap();

        assert_eq!(resolved.command.envs["RUST_LOG"], "debug");
        assert_eq!(resolved.command.envs["KEEP"], "yes");
    }

    #[test]
    fn malformed_env_pair_is_an_error() {
        let _lock = lock_env();
        let mut args = bare_args();
        args.env = vec!["NO_EQUALS_SIGN".to_string()];

        let err = resolve(file_with_program("node"), &args).unwrap_err();
        assert!(err.to_string().contains("KEY=VALUE"));
    }

    #[test]
    fn raw_mode_requires_a_marker() {
        let _lock = lock_env();
        let mut args = bare_args();
        args.mode = Some(WorkerMode::Raw);

        let err = resolve(file_with_program("conflux"), &args).unwrap_err();
        assert!(err.to_string().contains("ready marker"));
    }

    #[test]
    fn raw_mode_takes_marker_from_file() {
        let _lock = lock_env();
        let mut file = file_with_program("conflux");
        file.worker.mode = WorkerMode::Raw;
        file.worker.ready_marker = Some("RPC server started".to_string());

        let resolved = resolve(file, &bare_args()).unwrap();
        assert_eq!(resolved.mode, WorkerMode::Raw);
        assert_eq!(resolved.ready_marker.as_deref(), Some("RPC server started"));
    }

    #[test]
    fn node_flags_overlay_the_file() {
        let _lock = lock_env();
        let mut file = file_with_program("node");
        file.node.http_port = Some(1111);
        file.node.chain_id = Some(1);

        let mut args = bare_args();
        args.http_port = Some(2222);
        args.set = vec![
            "dev_pack_tx_immediately=true".to_string(),
            "mining_author=0xabc".to_string(),
        ];
        let resolved = resolve(file, &args).unwrap();

        assert_eq!(resolved.node.http_port, Some(2222));
        assert_eq!(resolved.node.chain_id, Some(1));
        assert_eq!(resolved.node.extra["dev_pack_tx_immediately"], true);
        assert_eq!(resolved.node.extra["mining_author"], "0xabc");
    }

    #[test]
    fn timing_flags_overlay_settings() {
        let _lock = lock_env();
        let mut args = bare_args();
        args.timeout_ms = Some(2_000);
        args.stop_grace_ms = Some(750);

        let resolved = resolve(file_with_program("node"), &args).unwrap();
        assert_eq!(resolved.settings.timeout, Duration::from_millis(2_000));
        assert_eq!(resolved.settings.stop_grace, Duration::from_millis(750));
        assert_eq!(
            resolved.settings.retry_interval,
            warden_core::config::DEFAULT_RETRY_INTERVAL
        );
    }
}
