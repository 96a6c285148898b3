//! End-to-end supervision of real subprocess workers.
//!
//! Every test spawns an actual `/bin/sh` fake worker speaking the JSON line
//! protocol, so the full stack is exercised: spawn, handshake, readiness
//! polling over HTTP, crash monitoring, kill escalation, and data cleanup.

#![cfg(unix)]

use std::time::Duration;

use tempfile::TempDir;

use warden_core::bridge::StopOutcome;
use warden_core::{
    LifecycleState, NodeConfig, Supervisor, SupervisorError, SupervisorSettings,
};
use warden_test_utils::{StatusStub, fake_worker, pid_alive, read_pid, wait_pid_gone};

fn settings(timeout_ms: u64, retry_ms: u64, grace_ms: u64) -> SupervisorSettings {
    SupervisorSettings {
        timeout: Duration::from_millis(timeout_ms),
        retry_interval: Duration::from_millis(retry_ms),
        stop_grace: Duration::from_millis(grace_ms),
    }
}

#[tokio::test]
async fn full_lifecycle_against_a_real_worker() {
    let dir = TempDir::new().unwrap();
    let supervisor = Supervisor::process(
        fake_worker::well_behaved(dir.path()),
        NodeConfig::default(),
        SupervisorSettings::default(),
    );
    assert_eq!(supervisor.state(), LifecycleState::Idle);

    supervisor.start().await.unwrap();
    assert!(supervisor.is_running());
    let pid = read_pid(dir.path());
    assert!(pid_alive(pid), "worker should be alive while running");

    let outcome = supervisor.stop().await.unwrap();
    assert_eq!(outcome, StopOutcome::Graceful);
    assert_eq!(supervisor.state(), LifecycleState::Stopped);
    assert!(
        wait_pid_gone(pid, Duration::from_secs(5)).await,
        "worker should be gone after stop"
    );
}

#[tokio::test]
async fn a_stopped_node_can_be_started_again() {
    let dir = TempDir::new().unwrap();
    let supervisor = Supervisor::process(
        fake_worker::well_behaved(dir.path()),
        NodeConfig::default(),
        SupervisorSettings::default(),
    );

    for _ in 0..2 {
        supervisor.start().await.unwrap();
        assert!(supervisor.is_running());
        supervisor.stop().await.unwrap();
        assert_eq!(supervisor.state(), LifecycleState::Stopped);
    }
}

#[tokio::test]
async fn starting_twice_is_rejected() {
    let dir = TempDir::new().unwrap();
    let supervisor = Supervisor::process(
        fake_worker::well_behaved(dir.path()),
        NodeConfig::default(),
        SupervisorSettings::default(),
    );

    supervisor.start().await.unwrap();
    match supervisor.start().await {
        Err(SupervisorError::AlreadyStarted { state }) => {
            assert_eq!(state, LifecycleState::Running)
        }
        other => panic!("expected already started, got {other:?}"),
    }
    supervisor.stop().await.unwrap();
}

#[tokio::test]
async fn concurrent_starts_race_to_one_winner() {
    let dir = TempDir::new().unwrap();
    let supervisor = Supervisor::process(
        fake_worker::well_behaved(dir.path()),
        NodeConfig::default(),
        SupervisorSettings::default(),
    );
    let clone = supervisor.clone();

    let (a, b) = tokio::join!(supervisor.start(), clone.start());
    let winners = [a.is_ok(), b.is_ok()].iter().filter(|ok| **ok).count();
    assert_eq!(winners, 1, "exactly one start may win: {a:?} / {b:?}");

    let loser = if a.is_err() { a } else { b };
    assert!(matches!(
        loser,
        Err(SupervisorError::AlreadyStarted { .. })
    ));

    supervisor.stop().await.unwrap();
}

#[tokio::test]
async fn worker_error_fails_the_start_and_reaps_the_worker() {
    let dir = TempDir::new().unwrap();
    let supervisor = Supervisor::process(
        fake_worker::error_then_linger(dir.path(), "db corrupted"),
        NodeConfig::default(),
        SupervisorSettings::default(),
    );

    match supervisor.start().await {
        Err(SupervisorError::Worker { message, .. }) => {
            assert!(message.contains("db corrupted"), "message: {message}")
        }
        other => panic!("expected worker error, got {other:?}"),
    }
    assert_eq!(supervisor.state(), LifecycleState::Failed);

    // The lingering process must not survive the failed start.
    let pid = read_pid(dir.path());
    assert!(
        wait_pid_gone(pid, Duration::from_secs(5)).await,
        "worker should be killed after a failed start"
    );
}

#[tokio::test]
async fn garbled_worker_output_fails_the_start() {
    let dir = TempDir::new().unwrap();
    let supervisor = Supervisor::process(
        fake_worker::garbled(dir.path()),
        NodeConfig::default(),
        SupervisorSettings::default(),
    );

    match supervisor.start().await {
        Err(SupervisorError::Protocol { .. }) => {}
        other => panic!("expected protocol error, got {other:?}"),
    }
    assert_eq!(supervisor.state(), LifecycleState::Failed);

    let pid = read_pid(dir.path());
    assert!(wait_pid_gone(pid, Duration::from_secs(5)).await);
}

#[tokio::test]
async fn early_exit_fails_the_start_as_a_crash() {
    let dir = TempDir::new().unwrap();
    let supervisor = Supervisor::process(
        fake_worker::crash_on_start(dir.path(), 7),
        NodeConfig::default(),
        SupervisorSettings::default(),
    );

    match supervisor.start().await {
        Err(SupervisorError::Crash { code, phase, .. }) => {
            assert_eq!(code, Some(7));
            assert_eq!(phase, LifecycleState::Starting);
        }
        other => panic!("expected crash, got {other:?}"),
    }
    assert_eq!(supervisor.state(), LifecycleState::Failed);
}

#[tokio::test]
async fn crash_while_running_fires_the_failure_callback() {
    let dir = TempDir::new().unwrap();
    let supervisor = Supervisor::process(
        fake_worker::crash_after_start(dir.path(), 3, 200),
        NodeConfig::default(),
        SupervisorSettings::default(),
    );

    let (tx, mut rx) = tokio::sync::mpsc::channel::<String>(1);
    supervisor.on_failure(move |err| {
        let _ = tx.try_send(err.kind().to_string());
    });

    supervisor.start().await.unwrap();
    assert!(supervisor.is_running());

    let kind = tokio::time::timeout(Duration::from_secs(5), rx.recv())
        .await
        .expect("crash callback within 5s")
        .expect("failure channel open");
    assert_eq!(kind, "crash");
    assert_eq!(supervisor.state(), LifecycleState::Failed);

    // The node is dead, not running: stop() has nothing to do.
    match supervisor.stop().await {
        Err(SupervisorError::NotRunning { state }) => {
            assert_eq!(state, LifecycleState::Failed)
        }
        other => panic!("expected not running, got {other:?}"),
    }
}

#[tokio::test]
async fn stop_forces_a_kill_when_the_worker_ignores_it() {
    let dir = TempDir::new().unwrap();
    let supervisor = Supervisor::process(
        fake_worker::ignore_stop(dir.path()),
        NodeConfig::default(),
        settings(10_000, 300, 500),
    );

    supervisor.start().await.unwrap();
    let pid = read_pid(dir.path());

    let t0 = std::time::Instant::now();
    let outcome = supervisor.stop().await.unwrap();
    let elapsed = t0.elapsed();

    assert_eq!(outcome, StopOutcome::Forced);
    assert!(
        elapsed >= Duration::from_millis(450),
        "stop returned before the grace expired: {elapsed:?}"
    );
    assert!(
        elapsed < Duration::from_secs(3),
        "forced stop took too long: {elapsed:?}"
    );
    assert_eq!(supervisor.state(), LifecycleState::Stopped);
    assert!(wait_pid_gone(pid, Duration::from_secs(5)).await);
}

#[tokio::test]
async fn an_acknowledged_stop_that_never_exits_is_forced() {
    let dir = TempDir::new().unwrap();
    let supervisor = Supervisor::process(
        fake_worker::stop_ack_then_linger(dir.path()),
        NodeConfig::default(),
        settings(10_000, 300, 500),
    );

    supervisor.start().await.unwrap();
    let pid = read_pid(dir.path());

    // The ack alone settles nothing; the process has to actually go.
    let t0 = std::time::Instant::now();
    let outcome = supervisor.stop().await.unwrap();
    let elapsed = t0.elapsed();

    assert_eq!(outcome, StopOutcome::Forced);
    assert!(
        elapsed >= Duration::from_millis(450),
        "stop returned before the grace expired: {elapsed:?}"
    );
    assert!(
        elapsed < Duration::from_secs(3),
        "forced stop took too long: {elapsed:?}"
    );
    assert_eq!(supervisor.state(), LifecycleState::Stopped);
    assert!(wait_pid_gone(pid, Duration::from_secs(5)).await);
}

#[tokio::test]
async fn dropping_a_running_supervisor_reaps_the_worker() {
    let dir = TempDir::new().unwrap();
    let supervisor = Supervisor::process(
        fake_worker::well_behaved(dir.path()),
        NodeConfig::default(),
        SupervisorSettings::default(),
    );

    supervisor.start().await.unwrap();
    let pid = read_pid(dir.path());
    assert!(pid_alive(pid));

    drop(supervisor);
    assert!(
        wait_pid_gone(pid, Duration::from_secs(5)).await,
        "worker must not outlive its supervisor"
    );
}

#[tokio::test]
async fn readiness_gates_start_on_the_status_endpoint() {
    let dir = TempDir::new().unwrap();
    let stub = StatusStub::start(&[
        "CatchUpRecoverBlockHeaderFromDbPhase",
        "CatchUpSyncBlockPhase",
        "NormalSyncPhase",
    ])
    .await;

    let config = NodeConfig {
        http_port: Some(stub.port()),
        ..Default::default()
    };
    let supervisor = Supervisor::process(
        fake_worker::well_behaved(dir.path()),
        config,
        settings(10_000, 50, 5_000),
    );

    supervisor.start().await.unwrap();
    assert!(
        stub.hits() >= 3,
        "start should have polled through the sync phases, saw {} hits",
        stub.hits()
    );
    supervisor.stop().await.unwrap();
}

#[tokio::test]
async fn readiness_timeout_fails_the_start_and_kills_the_worker() {
    let dir = TempDir::new().unwrap();
    // Permanently syncing: readiness can never be reached.
    let stub = StatusStub::start(&["CatchUpSyncBlockPhase"]).await;

    let config = NodeConfig {
        http_port: Some(stub.port()),
        ..Default::default()
    };
    let supervisor = Supervisor::process(
        fake_worker::well_behaved(dir.path()),
        config,
        settings(2_000, 100, 5_000),
    );

    let t0 = std::time::Instant::now();
    let err = supervisor.start().await.unwrap_err();
    let elapsed = t0.elapsed();

    match err {
        SupervisorError::ReadinessTimeout { elapsed: reported } => {
            assert!(
                reported >= Duration::from_millis(1_500),
                "reported poll budget too small: {reported:?}"
            );
        }
        other => panic!("expected readiness timeout, got {other:?}"),
    }
    assert!(
        elapsed >= Duration::from_millis(1_900) && elapsed < Duration::from_millis(4_000),
        "start should give up at the 2s deadline, took {elapsed:?}"
    );
    assert_eq!(supervisor.state(), LifecycleState::Failed);

    let pid = read_pid(dir.path());
    assert!(
        wait_pid_gone(pid, Duration::from_secs(5)).await,
        "worker must not survive a readiness timeout"
    );
}

#[tokio::test]
async fn a_stopped_node_wipes_its_disposable_data() {
    let dir = TempDir::new().unwrap();
    let data = TempDir::new().unwrap();
    for sub in ["db", "log"] {
        std::fs::create_dir_all(data.path().join(sub)).unwrap();
        std::fs::write(data.path().join(sub).join("CURRENT"), "x").unwrap();
    }
    std::fs::create_dir_all(data.path().join("keys")).unwrap();

    let config = NodeConfig {
        data_dir: Some(data.path().to_path_buf()),
        ..Default::default()
    };
    let supervisor = Supervisor::process(
        fake_worker::well_behaved(dir.path()),
        config,
        SupervisorSettings::default(),
    );

    supervisor.start().await.unwrap();
    supervisor.stop().await.unwrap();

    assert!(!data.path().join("db").exists());
    assert!(!data.path().join("log").exists());
    assert!(data.path().join("keys").exists(), "keys are not disposable");
    assert!(data.path().exists(), "the data dir itself stays");
}

#[tokio::test]
async fn persist_data_keeps_chain_state_across_a_stop() {
    let dir = TempDir::new().unwrap();
    let data = TempDir::new().unwrap();
    std::fs::create_dir_all(data.path().join("db")).unwrap();

    let config = NodeConfig {
        data_dir: Some(data.path().to_path_buf()),
        persist_data: true,
        ..Default::default()
    };
    let supervisor = Supervisor::process(
        fake_worker::well_behaved(dir.path()),
        config,
        SupervisorSettings::default(),
    );

    supervisor.start().await.unwrap();
    supervisor.stop().await.unwrap();

    assert!(data.path().join("db").exists());
}

#[tokio::test]
async fn raw_worker_start_keys_off_the_stdout_marker() {
    let dir = TempDir::new().unwrap();
    let (command, marker) = fake_worker::raw_with_marker(dir.path());
    let supervisor = Supervisor::raw_process(
        command,
        marker,
        NodeConfig::default(),
        SupervisorSettings::default(),
    );

    supervisor.start().await.unwrap();
    assert!(supervisor.is_running());

    let outcome = supervisor.stop().await.unwrap();
    // Raw stop is a SIGTERM the script traps into a clean exit.
    assert_eq!(outcome, StopOutcome::Graceful);
    assert_eq!(supervisor.state(), LifecycleState::Stopped);
}
