//! Bridge between a supervisor and one live worker unit.
//!
//! The bridge owns the worker handle and the single event stream for the
//! current unit, and turns stream traffic into lifecycle outcomes: a start
//! that settles exactly once on `started`/`error`/exit/garbage, and a stop
//! that always ends with the worker gone, forcibly if it misbehaves or the
//! grace runs out.
//!
//! Timeouts live with the caller: `start` runs until it settles, and the
//! supervisor wraps it in its own deadline. The stream stays inside the
//! bridge while `start` awaits, so cancelling that future loses nothing.

use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use tokio::time::{Instant, timeout_at};
use tracing::{debug, warn};

use crate::config::NodeConfig;
use crate::error::SupervisorError;
use crate::protocol::Message;
use crate::supervisor::LifecycleState;
use crate::worker::{EventStream, Worker, WorkerEvent, WorkerExit, WorkerHandle};

/// Bound on post-kill stream draining. `Worker::kill` has already confirmed
/// the unit is gone by the time this is used, so the terminal event is due
/// promptly.
const EXIT_DRAIN: Duration = Duration::from_secs(5);

/// How a stop concluded.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopOutcome {
    /// The worker exited on its own within the grace period.
    Graceful,
    /// The worker had to be killed.
    Forced,
}

/// Owns a spawned worker unit on behalf of the supervisor.
pub struct WorkerBridge {
    worker: Arc<dyn Worker>,
    handle: Option<WorkerHandle>,
    /// The unit's one event stream. `None` while loaned out to the crash
    /// monitor or after `stop` retired it.
    events: Option<EventStream>,
}

impl WorkerBridge {
    pub fn new(worker: Arc<dyn Worker>) -> Self {
        Self {
            worker,
            handle: None,
            events: None,
        }
    }

    /// Bring the worker unit into existence and claim its event stream.
    pub async fn launch(&mut self) -> Result<(), SupervisorError> {
        let handle = self.worker.spawn().await?;
        self.events = Some(self.worker.events(&handle));
        debug!(id = handle.id, kind = handle.kind.as_str(), "worker launched");
        self.handle = Some(handle);
        Ok(())
    }

    /// Send the start command and wait for the worker to settle it, one way
    /// or another. A worker that reports an error, emits garbage, or exits
    /// (cleanly or not) before `started` has failed to start; whatever is
    /// left of it is killed before this returns.
    pub async fn start(&mut self, config: &NodeConfig) -> Result<(), SupervisorError> {
        let start = Message::Start {
            config: config.clone(),
        };
        if let Err(e) = self.send(start).await {
            self.kill_and_drain().await;
            return Err(e);
        }

        let verdict = {
            let events = self.events.as_mut().ok_or(SupervisorError::ChannelClosed)?;
            loop {
                match events.next().await {
                    Some(WorkerEvent::Message(Message::Started)) => break Ok(()),
                    Some(WorkerEvent::Message(Message::Error { message, stack })) => {
                        break Err((SupervisorError::Worker { message, stack }, true));
                    }
                    Some(WorkerEvent::Message(msg)) => {
                        debug!(kind = msg.kind(), "ignoring message while starting");
                    }
                    Some(WorkerEvent::Garbled { reason, .. }) => {
                        break Err((SupervisorError::Protocol { detail: reason }, true));
                    }
                    Some(WorkerEvent::Exited(exit)) => {
                        break Err((
                            SupervisorError::Crash {
                                code: exit.code,
                                signal: exit.signal,
                                phase: LifecycleState::Starting,
                            },
                            false,
                        ));
                    }
                    None => break Err((SupervisorError::ChannelClosed, false)),
                }
            }
        };

        match verdict {
            Ok(()) => Ok(()),
            Err((err, needs_kill)) => {
                if needs_kill {
                    self.kill_and_drain().await;
                }
                Err(err)
            }
        }
    }

    /// Graceful stop: send the stop command, give the worker `grace` to be
    /// gone, kill it otherwise. Never fails; the unit is gone either way.
    /// This retires the event stream.
    pub async fn stop(&mut self, grace: Duration) -> StopOutcome {
        let deadline = Instant::now() + grace;

        if let Err(e) = self.send(Message::Stop).await {
            debug!(error = %e, "stop not deliverable (worker already gone?)");
        }

        let Some(mut events) = self.events.take() else {
            self.force_kill().await;
            return StopOutcome::Forced;
        };

        loop {
            match timeout_at(deadline, events.next()).await {
                Err(_) => {
                    warn!("stop grace expired, killing worker");
                    self.force_kill().await;
                    drain_exit(&mut events, EXIT_DRAIN).await;
                    return StopOutcome::Forced;
                }
                Ok(None) => {
                    // Stream already over. Trust it only if the unit really
                    // is gone.
                    if self.is_alive().await {
                        self.force_kill().await;
                        return StopOutcome::Forced;
                    }
                    return StopOutcome::Graceful;
                }
                Ok(Some(WorkerEvent::Exited(exit))) => {
                    debug!(code = ?exit.code, signal = ?exit.signal, "worker exited during stop");
                    return StopOutcome::Graceful;
                }
                Ok(Some(WorkerEvent::Message(Message::Stopped))) => {
                    debug!("worker acknowledged stop");
                    // Now wait for the exit itself, still under the grace.
                }
                Ok(Some(WorkerEvent::Message(Message::Error { message, .. }))) => {
                    warn!(message = message.as_str(), "worker errored while stopping");
                    self.force_kill().await;
                    drain_exit(&mut events, EXIT_DRAIN).await;
                    return StopOutcome::Forced;
                }
                Ok(Some(WorkerEvent::Message(msg))) => {
                    debug!(kind = msg.kind(), "ignoring message while stopping");
                }
                Ok(Some(WorkerEvent::Garbled { reason, .. })) => {
                    warn!(reason = reason.as_str(), "garbled output while stopping");
                    self.force_kill().await;
                    drain_exit(&mut events, EXIT_DRAIN).await;
                    return StopOutcome::Forced;
                }
            }
        }
    }

    /// Kill the unit without ceremony. Resolves once it is gone.
    pub async fn force_kill(&mut self) {
        if let Some(handle) = &self.handle {
            if let Err(e) = self.worker.kill(handle).await {
                warn!(id = handle.id, error = %e, "failed to kill worker");
            }
        }
    }

    /// Kill, then consume the stream up to its terminal event so the unit's
    /// resources are fully reaped before the caller reports failure.
    pub async fn kill_and_drain(&mut self) {
        self.force_kill().await;
        self.wait_for_exit(EXIT_DRAIN).await;
    }

    /// Drain the stream until the terminal exit event (or `limit`).
    pub async fn wait_for_exit(&mut self, limit: Duration) -> Option<WorkerExit> {
        match self.events.as_mut() {
            Some(events) => drain_exit(events, limit).await,
            None => None,
        }
    }

    pub async fn send(&self, message: Message) -> Result<(), SupervisorError> {
        let handle = self.handle.as_ref().ok_or(SupervisorError::ChannelClosed)?;
        self.worker.send(handle, message).await
    }

    pub async fn is_alive(&self) -> bool {
        match &self.handle {
            Some(handle) => self.worker.is_alive(handle).await,
            None => false,
        }
    }

    pub fn handle(&self) -> Option<&WorkerHandle> {
        self.handle.as_ref()
    }

    /// Loan the event stream out (to the crash monitor). The bridge keeps
    /// working without it; `stop` on a loaned-out bridge goes straight to
    /// the grace/kill path unless the stream is restored first.
    pub fn take_events(&mut self) -> Option<EventStream> {
        self.events.take()
    }

    pub fn restore_events(&mut self, events: EventStream) {
        self.events = Some(events);
    }
}

impl std::fmt::Debug for WorkerBridge {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkerBridge")
            .field("handle", &self.handle)
            .field("events_held", &self.events.is_some())
            .finish()
    }
}

/// Consume events until the terminal exit (or until `limit` runs out, for
/// workers too wedged to die observably).
async fn drain_exit(events: &mut EventStream, limit: Duration) -> Option<WorkerExit> {
    let deadline = Instant::now() + limit;
    loop {
        match timeout_at(deadline, events.next()).await {
            Err(_) => {
                warn!("gave up waiting for the worker's terminal event");
                return None;
            }
            Ok(None) => return None,
            Ok(Some(WorkerEvent::Exited(exit))) => return Some(exit),
            Ok(Some(event)) => {
                debug!(?event, "discarding event while draining");
            }
        }
    }
}
