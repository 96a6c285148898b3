//! In-process worker backend.
//!
//! Wraps a blocking node binding (FFI or embedded library) in a control task
//! so it presents the same [`Worker`] surface as a subprocess. The binding's
//! calls run on the blocking thread pool; the control task translates them
//! into the usual started/stopped/error events.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{Mutex, mpsc};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::{EventStream, Worker, WorkerEvent, WorkerExit, WorkerHandle};
use crate::config::NodeConfig;
use crate::error::SupervisorError;
use crate::protocol::Message;

/// How long `kill()` waits for the control loop to wind down.
const KILL_GRACE: Duration = Duration::from_secs(5);

/// Blocking interface to an in-process node.
///
/// Implementations are typically thin wrappers over an embedded node
/// library. Calls may block for seconds; the worker runs them on the
/// blocking thread pool and never on the async runtime itself.
pub trait NodeHandle: Send + 'static {
    fn start(&mut self, config: &NodeConfig) -> anyhow::Result<()>;
    fn stop(&mut self) -> anyhow::Result<()>;
}

struct NativeState {
    ctrl: mpsc::Sender<Message>,
    /// Event receiver; `Option` so it can be `.take()`-en once for streaming.
    events: Option<mpsc::Receiver<WorkerEvent>>,
    cancel: CancellationToken,
}

/// Worker backend driving a [`NodeHandle`] in-process.
///
/// The handle is loaned to the control loop while a unit is live and comes
/// back when the unit stops cleanly, so a supervisor can start the same node
/// again. After a kill the handle is considered spent (the node may be half
/// up on its internal threads) and further spawns fail.
pub struct NativeWorker {
    handle_slot: Arc<StdMutex<Option<Box<dyn NodeHandle>>>>,
    states: Arc<Mutex<HashMap<u32, NativeState>>>,
    next_id: AtomicU32,
}

impl std::fmt::Debug for NativeWorker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NativeWorker").finish_non_exhaustive()
    }
}

impl NativeWorker {
    pub fn new(handle: impl NodeHandle) -> Self {
        Self {
            handle_slot: Arc::new(StdMutex::new(Some(Box::new(handle)))),
            states: Arc::new(Mutex::new(HashMap::new())),
            next_id: AtomicU32::new(1),
        }
    }
}

#[async_trait]
impl Worker for NativeWorker {
    fn kind(&self) -> &str {
        "native"
    }

    async fn spawn(&self) -> Result<WorkerHandle, SupervisorError> {
        let handle = {
            let mut slot = self.handle_slot.lock().unwrap();
            slot.take()
        };
        let Some(handle) = handle else {
            return Err(SupervisorError::Launch {
                message: "native node handle is already in use or spent".to_string(),
                source: std::io::Error::other("node handle unavailable"),
            });
        };

        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (ctrl_tx, ctrl_rx) = mpsc::channel(16);
        let (event_tx, event_rx) = mpsc::channel(64);
        let cancel = CancellationToken::new();

        tokio::spawn(control_loop(
            id,
            handle,
            ctrl_rx,
            event_tx,
            cancel.clone(),
            Arc::clone(&self.handle_slot),
        ));

        let mut states = self.states.lock().await;
        states.insert(
            id,
            NativeState {
                ctrl: ctrl_tx,
                events: Some(event_rx),
                cancel,
            },
        );

        debug!(id, "spawned native worker control loop");
        Ok(WorkerHandle {
            id,
            kind: self.kind().to_string(),
        })
    }

    fn events(&self, handle: &WorkerHandle) -> EventStream {
        let id = handle.id;
        let states = Arc::clone(&self.states);

        let stream = async_stream::stream! {
            let rx = {
                let mut states = states.lock().await;
                states.get_mut(&id).and_then(|state| state.events.take())
            };

            let Some(mut rx) = rx else {
                warn!(id, "event stream requested twice, or worker unknown");
                yield WorkerEvent::Garbled {
                    line: String::new(),
                    reason: "event stream already taken or worker unknown".to_string(),
                };
                return;
            };

            while let Some(event) = rx.recv().await {
                yield event;
            }
        };

        Box::pin(stream)
    }

    async fn send(&self, handle: &WorkerHandle, message: Message) -> Result<(), SupervisorError> {
        let ctrl = {
            let states = self.states.lock().await;
            states
                .get(&handle.id)
                .map(|state| state.ctrl.clone())
                .ok_or(SupervisorError::ChannelClosed)?
        };
        ctrl.send(message)
            .await
            .map_err(|_| SupervisorError::ChannelClosed)
    }

    async fn kill(&self, handle: &WorkerHandle) -> Result<(), SupervisorError> {
        let id = handle.id;
        let ctrl = {
            let states = self.states.lock().await;
            let Some(state) = states.get(&id) else {
                debug!(id, "kill called but worker not in map (already gone?)");
                return Ok(());
            };
            // The entry stays: its event receiver may not have been taken
            // yet, and it still carries the terminal event.
            state.cancel.cancel();
            state.ctrl.clone()
        };

        // The loop drops its control receiver on the way out; that is the
        // confirmation the unit is gone.
        if tokio::time::timeout(KILL_GRACE, ctrl.closed()).await.is_err() {
            warn!(id, "native control loop did not stop within the kill grace");
        }
        Ok(())
    }

    async fn is_alive(&self, handle: &WorkerHandle) -> bool {
        let states = self.states.lock().await;
        states
            .get(&handle.id)
            .map(|state| !state.ctrl.is_closed())
            .unwrap_or(false)
    }
}

/// Drives one live unit: waits for control messages, runs the blocking
/// binding calls off-runtime, reports events. Ends on stop, on failure, on
/// cancellation, or when the control channel is dropped.
async fn control_loop(
    id: u32,
    mut handle: Box<dyn NodeHandle>,
    mut ctrl: mpsc::Receiver<Message>,
    events: mpsc::Sender<WorkerEvent>,
    cancel: CancellationToken,
    slot: Arc<StdMutex<Option<Box<dyn NodeHandle>>>>,
) {
    loop {
        let msg = tokio::select! {
            _ = cancel.cancelled() => {
                debug!(id, "native worker killed while idle");
                let _ = events.send(WorkerEvent::Exited(WorkerExit::killed())).await;
                return;
            }
            msg = ctrl.recv() => msg,
        };

        let Some(msg) = msg else {
            // Control side dropped without a stop; treat like a kill.
            let _ = events.send(WorkerEvent::Exited(WorkerExit::killed())).await;
            return;
        };

        match msg {
            Message::Start { config } => {
                let mut node = handle;
                let mut join =
                    tokio::task::spawn_blocking(move || {
                        let result = node.start(&config);
                        (node, result)
                    });

                let (node, result) = tokio::select! {
                    _ = cancel.cancelled() => {
                        // The blocking call keeps running detached; the unit
                        // is dead as far as anyone upstairs is concerned.
                        warn!(id, "native worker killed during a blocking start call");
                        let _ = events.send(WorkerEvent::Exited(WorkerExit::killed())).await;
                        return;
                    }
                    joined = &mut join => match joined {
                        Ok(pair) => pair,
                        Err(e) => {
                            let _ = events
                                .send(WorkerEvent::Message(Message::Error {
                                    message: format!("node start panicked: {e}"),
                                    stack: None,
                                }))
                                .await;
                            let _ = events
                                .send(WorkerEvent::Exited(WorkerExit {
                                    code: Some(1),
                                    signal: None,
                                }))
                                .await;
                            return;
                        }
                    },
                };
                handle = node;

                match result {
                    Ok(()) => {
                        let _ = events.send(WorkerEvent::Message(Message::Started)).await;
                    }
                    Err(e) => {
                        let _ = events
                            .send(WorkerEvent::Message(Message::Error {
                                message: format!("{e:#}"),
                                stack: None,
                            }))
                            .await;
                        let _ = events
                            .send(WorkerEvent::Exited(WorkerExit {
                                code: Some(1),
                                signal: None,
                            }))
                            .await;
                        return;
                    }
                }
            }

            Message::Stop => {
                let mut node = handle;
                let mut join = tokio::task::spawn_blocking(move || {
                    let result = node.stop();
                    (node, result)
                });

                let (node, result) = tokio::select! {
                    _ = cancel.cancelled() => {
                        warn!(id, "native worker killed during a blocking stop call");
                        let _ = events.send(WorkerEvent::Exited(WorkerExit::killed())).await;
                        return;
                    }
                    joined = &mut join => match joined {
                        Ok(pair) => pair,
                        Err(e) => {
                            let _ = events
                                .send(WorkerEvent::Message(Message::Error {
                                    message: format!("node stop panicked: {e}"),
                                    stack: None,
                                }))
                                .await;
                            let _ = events
                                .send(WorkerEvent::Exited(WorkerExit {
                                    code: Some(1),
                                    signal: None,
                                }))
                                .await;
                            return;
                        }
                    },
                };

                match result {
                    Ok(()) => {
                        let _ = events.send(WorkerEvent::Message(Message::Stopped)).await;
                        let _ = events
                            .send(WorkerEvent::Exited(WorkerExit {
                                code: Some(0),
                                signal: None,
                            }))
                            .await;
                        // Clean shutdown: the handle can serve another start.
                        slot.lock().unwrap().replace(node);
                        return;
                    }
                    Err(e) => {
                        let _ = events
                            .send(WorkerEvent::Message(Message::Error {
                                message: format!("{e:#}"),
                                stack: None,
                            }))
                            .await;
                        let _ = events
                            .send(WorkerEvent::Exited(WorkerExit {
                                code: Some(1),
                                signal: None,
                            }))
                            .await;
                        return;
                    }
                }
            }

            other => {
                let _ = events
                    .send(WorkerEvent::Message(Message::Error {
                        message: format!("unknown message type: {}", other.kind()),
                        stack: None,
                    }))
                    .await;
            }
        }
    }
}
