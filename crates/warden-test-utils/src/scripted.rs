//! In-memory worker driven by a script of timed events.
//!
//! Lets bridge and supervisor tests play out exact event sequences (and
//! exact timings, under paused test time) without any real processes. The
//! worker records what was sent to it and how often it was killed, so tests
//! can also assert on what the supervisor did to the worker.

use std::sync::atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{Mutex, mpsc};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use warden_core::{
    EventStream, Message, SupervisorError, Worker, WorkerEvent, WorkerExit, WorkerHandle,
};

/// An event and the delay before it is emitted.
pub type TimedEvent = (Duration, WorkerEvent);

struct Live {
    tx: mpsc::Sender<WorkerEvent>,
    /// Event receiver; `Option` so it can be `.take()`-en once for streaming.
    events: Option<mpsc::Receiver<WorkerEvent>>,
    cancel: CancellationToken,
    alive: Arc<AtomicBool>,
}

/// Worker whose replies are scripted ahead of time.
pub struct ScriptedWorker {
    on_start: Vec<TimedEvent>,
    on_stop: Vec<TimedEvent>,
    live: Arc<Mutex<Option<Live>>>,
    next_id: AtomicU32,
    sent: StdMutex<Vec<Message>>,
    kills: AtomicUsize,
}

impl ScriptedWorker {
    /// A worker that answers nothing at all, to anything.
    pub fn new() -> Self {
        Self {
            on_start: Vec::new(),
            on_stop: Vec::new(),
            live: Arc::new(Mutex::new(None)),
            next_id: AtomicU32::new(1),
            sent: StdMutex::new(Vec::new()),
            kills: AtomicUsize::new(0),
        }
    }

    /// Events played (in order, after their delays) once a start command
    /// arrives.
    pub fn on_start(mut self, events: Vec<TimedEvent>) -> Self {
        self.on_start = events;
        self
    }

    /// Events played once a stop command arrives.
    pub fn on_stop(mut self, events: Vec<TimedEvent>) -> Self {
        self.on_stop = events;
        self
    }

    /// The happy path: instant `started`, instant `stopped` plus clean exit.
    pub fn well_behaved() -> Self {
        Self::new()
            .on_start(vec![(
                Duration::ZERO,
                WorkerEvent::Message(Message::Started),
            )])
            .on_stop(vec![
                (Duration::ZERO, WorkerEvent::Message(Message::Stopped)),
                (
                    Duration::ZERO,
                    WorkerEvent::Exited(WorkerExit {
                        code: Some(0),
                        signal: None,
                    }),
                ),
            ])
    }

    /// Every message the supervisor side has sent, in order.
    pub fn sent(&self) -> Vec<Message> {
        self.sent.lock().unwrap().clone()
    }

    /// How many times `kill` was called.
    pub fn kill_count(&self) -> usize {
        self.kills.load(Ordering::SeqCst)
    }
}

impl Default for ScriptedWorker {
    fn default() -> Self {
        Self::new()
    }
}

/// Emit a scripted sequence on its own task, bailing out if the unit is
/// killed mid-script. A terminal exit event marks the unit dead and ends
/// the script early.
fn play(
    seq: Vec<TimedEvent>,
    tx: mpsc::Sender<WorkerEvent>,
    cancel: CancellationToken,
    alive: Arc<AtomicBool>,
) {
    tokio::spawn(async move {
        for (after, event) in seq {
            if after.is_zero() {
                if cancel.is_cancelled() {
                    return;
                }
            } else {
                tokio::select! {
                    _ = cancel.cancelled() => return,
                    _ = tokio::time::sleep(after) => {}
                }
            }

            let terminal = matches!(event, WorkerEvent::Exited(_));
            if terminal {
                alive.store(false, Ordering::SeqCst);
            }
            if tx.send(event).await.is_err() || terminal {
                return;
            }
        }
    });
}

#[async_trait]
impl Worker for ScriptedWorker {
    fn kind(&self) -> &str {
        "scripted"
    }

    async fn spawn(&self) -> Result<WorkerHandle, SupervisorError> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = mpsc::channel(64);

        let mut live = self.live.lock().await;
        *live = Some(Live {
            tx,
            events: Some(rx),
            cancel: CancellationToken::new(),
            alive: Arc::new(AtomicBool::new(true)),
        });

        debug!(id, "scripted worker spawned");
        Ok(WorkerHandle {
            id,
            kind: self.kind().to_string(),
        })
    }

    fn events(&self, handle: &WorkerHandle) -> EventStream {
        let id = handle.id;
        let live = Arc::clone(&self.live);

        let stream = async_stream::stream! {
            let rx = {
                let mut live = live.lock().await;
                live.as_mut().and_then(|l| l.events.take())
            };

            let Some(mut rx) = rx else {
                warn!(id, "event stream requested twice, or worker unknown");
                yield WorkerEvent::Garbled {
                    line: String::new(),
                    reason: "event stream already taken or worker unknown".to_string(),
                };
                return;
            };

            // The sender half lives in the worker state, so the channel never
            // closes on its own; a terminal exit event ends the stream.
            while let Some(event) = rx.recv().await {
                let done = matches!(event, WorkerEvent::Exited(_));
                yield event;
                if done {
                    return;
                }
            }
        };

        Box::pin(stream)
    }

    async fn send(&self, _handle: &WorkerHandle, message: Message) -> Result<(), SupervisorError> {
        self.sent.lock().unwrap().push(message.clone());

        let seq = match &message {
            Message::Start { .. } => self.on_start.clone(),
            Message::Stop => self.on_stop.clone(),
            _ => Vec::new(),
        };

        let live = self.live.lock().await;
        let Some(live) = live.as_ref() else {
            return Err(SupervisorError::ChannelClosed);
        };
        if !live.alive.load(Ordering::SeqCst) {
            return Err(SupervisorError::ChannelClosed);
        }

        play(
            seq,
            live.tx.clone(),
            live.cancel.clone(),
            Arc::clone(&live.alive),
        );
        Ok(())
    }

    async fn kill(&self, _handle: &WorkerHandle) -> Result<(), SupervisorError> {
        self.kills.fetch_add(1, Ordering::SeqCst);

        let live = self.live.lock().await;
        if let Some(live) = live.as_ref() {
            if live.alive.swap(false, Ordering::SeqCst) {
                live.cancel.cancel();
                let _ = live
                    .tx
                    .send(WorkerEvent::Exited(WorkerExit::killed()))
                    .await;
            }
        }
        Ok(())
    }

    async fn is_alive(&self, _handle: &WorkerHandle) -> bool {
        let live = self.live.lock().await;
        live.as_ref()
            .map(|l| l.alive.load(Ordering::SeqCst))
            .unwrap_or(false)
    }
}
