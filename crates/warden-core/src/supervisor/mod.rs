//! Node lifecycle supervision.
//!
//! A [`Supervisor`] drives one node through `start()` and `stop()` with a
//! strict state machine in between. Both calls settle the node into a
//! definite state before they return: a failed start never leaves a stray
//! worker behind, and a stop always ends with the worker gone, by grace or
//! by force.
//!
//! While the node runs, a background monitor owns the worker's event stream
//! and turns an unexpected exit into the `Failed` state plus an out-of-band
//! failure callback. `stop()` reclaims the stream from the monitor, so every
//! event has exactly one consumer at any moment.

use std::fmt;
use std::path::Path;
use std::sync::{Arc, Mutex as StdMutex, Weak};

use futures::StreamExt;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio::time::{Instant, timeout_at};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::bridge::{StopOutcome, WorkerBridge};
use crate::config::{NodeConfig, SupervisorSettings};
use crate::error::SupervisorError;
use crate::readiness;
use crate::worker::{
    EventStream, NativeWorker, NodeHandle, ProcessWorker, Worker, WorkerCommand, WorkerEvent,
};

/// Where a supervised node is in its life.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleState {
    /// Fresh supervisor, never started.
    Idle,
    /// `start()` in flight.
    Starting,
    /// Worker up, node ready, crash monitor watching.
    Running,
    /// `stop()` in flight.
    Stopping,
    /// Stopped cleanly; may be started again.
    Stopped,
    /// Start failed or the worker died. Terminal.
    Failed,
}

impl LifecycleState {
    /// The legal transition table. Everything not listed is a bug.
    pub fn can_transition(self, to: LifecycleState) -> bool {
        use LifecycleState::*;
        matches!(
            (self, to),
            (Idle, Starting)
                | (Stopped, Starting)
                | (Starting, Running)
                | (Starting, Failed)
                | (Running, Stopping)
                | (Running, Failed)
                | (Stopping, Stopped)
        )
    }
}

impl fmt::Display for LifecycleState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            LifecycleState::Idle => "idle",
            LifecycleState::Starting => "starting",
            LifecycleState::Running => "running",
            LifecycleState::Stopping => "stopping",
            LifecycleState::Stopped => "stopped",
            LifecycleState::Failed => "failed",
        };
        f.write_str(name)
    }
}

type FailureCallback = Arc<dyn Fn(&SupervisorError) + Send + Sync>;

struct MonitorHandle {
    cancel: CancellationToken,
    task: JoinHandle<EventStream>,
}

struct Session {
    bridge: WorkerBridge,
    /// Present while the node is running.
    monitor: Option<MonitorHandle>,
}

struct Inner {
    worker: Arc<dyn Worker>,
    config: NodeConfig,
    settings: SupervisorSettings,
    /// Guarded check-and-transition happens under this lock, which is never
    /// held across an await.
    state: StdMutex<LifecycleState>,
    session: Mutex<Option<Session>>,
    on_failure: StdMutex<Option<FailureCallback>>,
}

impl Drop for Inner {
    fn drop(&mut self) {
        // Dropped while running: wake the monitor so it lets go of the
        // event stream, whose teardown reaps the worker (subprocess workers
        // are spawned kill-on-drop).
        if let Some(session) = self.session.get_mut().take() {
            if let Some(monitor) = session.monitor {
                monitor.cancel.cancel();
            }
        }
    }
}

/// Supervises one node. Cheap to clone; clones share the node.
#[derive(Clone)]
pub struct Supervisor {
    inner: Arc<Inner>,
}

impl fmt::Debug for Supervisor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Supervisor")
            .field("worker", &self.inner.worker.kind())
            .field("state", &self.state())
            .finish()
    }
}

impl Supervisor {
    /// Supervise a subprocess worker speaking the JSON line protocol.
    pub fn process(command: WorkerCommand, config: NodeConfig, settings: SupervisorSettings) -> Self {
        Self::with_worker(Arc::new(ProcessWorker::ipc(command)), config, settings)
    }

    /// Supervise a plain node binary with no protocol support; readiness is
    /// inferred from `ready_marker` appearing on its stdout.
    pub fn raw_process(
        command: WorkerCommand,
        ready_marker: impl Into<String>,
        config: NodeConfig,
        settings: SupervisorSettings,
    ) -> Self {
        Self::with_worker(
            Arc::new(ProcessWorker::raw(command, ready_marker)),
            config,
            settings,
        )
    }

    /// Supervise an in-process node binding.
    pub fn native(handle: impl NodeHandle, config: NodeConfig, settings: SupervisorSettings) -> Self {
        Self::with_worker(Arc::new(NativeWorker::new(handle)), config, settings)
    }

    /// Supervise an arbitrary worker backend.
    pub fn with_worker(
        worker: Arc<dyn Worker>,
        config: NodeConfig,
        settings: SupervisorSettings,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                worker,
                config,
                settings,
                state: StdMutex::new(LifecycleState::Idle),
                session: Mutex::new(None),
                on_failure: StdMutex::new(None),
            }),
        }
    }

    /// Register a callback for failures the caller did not trigger: worker
    /// crashes while running. Failures of `start()`/`stop()` themselves are
    /// reported through their return values, not here.
    pub fn on_failure(&self, callback: impl Fn(&SupervisorError) + Send + Sync + 'static) {
        *self.inner.on_failure.lock().unwrap() = Some(Arc::new(callback));
    }

    pub fn state(&self) -> LifecycleState {
        *self.inner.state.lock().unwrap()
    }

    pub fn is_running(&self) -> bool {
        self.state() == LifecycleState::Running
    }

    /// Start the node and wait until it is usable.
    ///
    /// Resolves once the worker reported `started` and, for nodes with RPC
    /// ports configured, a readiness probe succeeded, all within the
    /// configured timeout. On any failure the worker is gone by the time
    /// the error is returned.
    pub async fn start(&self) -> Result<(), SupervisorError> {
        // 1. Guard and claim in one critical section, so two concurrent
        //    starts cannot both pass.
        {
            let mut state = self.inner.state.lock().unwrap();
            if !matches!(*state, LifecycleState::Idle | LifecycleState::Stopped) {
                return Err(SupervisorError::AlreadyStarted { state: *state });
            }
            *state = LifecycleState::Starting;
        }
        info!(worker = self.inner.worker.kind(), "starting node");

        match self.run_start().await {
            Ok(session) => {
                // Session first, then the state flip: anyone who observes
                // `Running` must find a session to stop.
                {
                    let mut slot = self.inner.session.lock().await;
                    *slot = Some(session);
                }
                self.set_state(LifecycleState::Running);
                info!("node is running");
                Ok(())
            }
            Err(err) => {
                self.set_state(LifecycleState::Failed);
                error!(kind = err.kind(), error = %err, "start failed");
                Err(err)
            }
        }
    }

    async fn run_start(&self) -> Result<Session, SupervisorError> {
        let settings = &self.inner.settings;
        let config = &self.inner.config;
        let deadline = Instant::now() + settings.timeout;

        // 2. Bring the worker unit up.
        let mut bridge = WorkerBridge::new(Arc::clone(&self.inner.worker));
        bridge.launch().await?;

        // 3. Drive the start handshake under the overall deadline.
        match timeout_at(deadline, bridge.start(config)).await {
            Ok(result) => result?,
            Err(_) => {
                warn!(timeout = ?settings.timeout, "worker did not report started in time");
                bridge.kill_and_drain().await;
                return Err(SupervisorError::ReadinessTimeout {
                    elapsed: settings.timeout,
                });
            }
        }

        // 4. Poll RPC readiness with whatever budget is left.
        if let Some(probe) = readiness::probe_for(config) {
            let remaining = deadline.saturating_duration_since(Instant::now());
            debug!(target = probe.target(), budget = ?remaining, "waiting for node readiness");
            if let Err(err) =
                readiness::wait_until_ready(probe.as_ref(), remaining, settings.retry_interval)
                    .await
            {
                // The node is up but not usable; do not leave it running.
                bridge.kill_and_drain().await;
                return Err(err);
            }
        }

        // 5. Hand the event stream to the crash monitor.
        let events = bridge.take_events().ok_or(SupervisorError::ChannelClosed)?;
        let cancel = CancellationToken::new();
        let task = tokio::spawn(monitor_worker(
            events,
            cancel.clone(),
            Arc::downgrade(&self.inner),
        ));

        Ok(Session {
            bridge,
            monitor: Some(MonitorHandle { cancel, task }),
        })
    }

    /// Stop a running node gracefully, killing it if the stop grace runs
    /// out. Only valid while `Running`; a node that already died reports
    /// [`SupervisorError::NotRunning`] here and its crash through
    /// [`Supervisor::on_failure`].
    pub async fn stop(&self) -> Result<StopOutcome, SupervisorError> {
        // 1. Guard: only a running node can be stopped.
        {
            let mut state = self.inner.state.lock().unwrap();
            if *state != LifecycleState::Running {
                return Err(SupervisorError::NotRunning { state: *state });
            }
            *state = LifecycleState::Stopping;
        }
        info!("stopping node");

        let session = {
            let mut slot = self.inner.session.lock().await;
            slot.take()
        };
        let Some(mut session) = session else {
            // Bookkeeping said running but there is nothing to stop; report
            // stopped rather than wedging the caller.
            warn!("no active session for a running node");
            self.set_state(LifecycleState::Stopped);
            return Ok(StopOutcome::Graceful);
        };

        // 2. Call the crash monitor off the stream and reclaim it: from
        //    here the stop path is the stream's only consumer.
        if let Some(monitor) = session.monitor.take() {
            monitor.cancel.cancel();
            match monitor.task.await {
                Ok(events) => session.bridge.restore_events(events),
                Err(e) => warn!(error = %e, "crash monitor did not shut down cleanly"),
            }
        }

        // 3. Graceful stop, forced if the grace expires.
        let outcome = session.bridge.stop(self.inner.settings.stop_grace).await;

        // 4. A stopped node wipes its disposable data unless asked not to.
        if !self.inner.config.persist_data {
            if let Some(dir) = &self.inner.config.data_dir {
                cleanup_data_dir(dir).await;
            }
        }

        self.set_state(LifecycleState::Stopped);
        info!(?outcome, "node stopped");
        Ok(outcome)
    }

    fn set_state(&self, to: LifecycleState) {
        let mut state = self.inner.state.lock().unwrap();
        debug_assert!(
            state.can_transition(to),
            "illegal lifecycle transition {state} -> {to}"
        );
        debug!(from = %*state, to = %to, "lifecycle transition");
        *state = to;
    }
}

/// Watches the event stream while the node runs. Returns the stream on
/// cancellation (a stop reclaiming it) and after a crash (so the stop path
/// can still drain it).
async fn monitor_worker(
    mut events: EventStream,
    cancel: CancellationToken,
    inner: Weak<Inner>,
) -> EventStream {
    loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                debug!("crash monitor handing the event stream back");
                return events;
            }
            event = events.next() => match event {
                Some(WorkerEvent::Message(msg)) => {
                    warn!(kind = msg.kind(), "unexpected message from a running worker");
                }
                Some(WorkerEvent::Garbled { reason, .. }) => {
                    warn!(reason = reason.as_str(), "garbled output from a running worker");
                }
                Some(WorkerEvent::Exited(exit)) => {
                    report_crash(
                        &inner,
                        SupervisorError::Crash {
                            code: exit.code,
                            signal: exit.signal,
                            phase: LifecycleState::Running,
                        },
                    );
                    return events;
                }
                None => {
                    // Stream over without a terminal event: the worker is
                    // unobservable, which is as good as dead.
                    report_crash(
                        &inner,
                        SupervisorError::Crash {
                            code: None,
                            signal: None,
                            phase: LifecycleState::Running,
                        },
                    );
                    return events;
                }
            }
        }
    }
}

/// Flip a running node to `Failed` and fire the failure callback. A node
/// already being stopped keeps its stop-path state instead.
fn report_crash(inner: &Weak<Inner>, err: SupervisorError) {
    let Some(inner) = inner.upgrade() else {
        return;
    };

    {
        let mut state = inner.state.lock().unwrap();
        if *state != LifecycleState::Running {
            debug!(state = %*state, "worker exit observed outside running");
            return;
        }
        *state = LifecycleState::Failed;
    }
    error!(kind = err.kind(), error = %err, "worker died while running");

    let callback = inner.on_failure.lock().unwrap().clone();
    if let Some(callback) = callback {
        callback(&err);
    }
}

/// Remove the node's disposable state under `data_dir`. The directory
/// itself, and anything not created by the node (keys, configs), stays.
async fn cleanup_data_dir(dir: &Path) {
    const DISPOSABLE: [&str; 4] = ["blockchain_data", "db", "log", "pos_db"];
    for sub in DISPOSABLE {
        let path = dir.join(sub);
        match tokio::fs::remove_dir_all(&path).await {
            Ok(()) => debug!(path = %path.display(), "removed node data"),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => warn!(path = %path.display(), error = %e, "failed to remove node data"),
        }
    }
}
