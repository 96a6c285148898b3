//! Worker abstraction: one node, one unit of execution.
//!
//! A [`Worker`] knows how to bring a node's unit of execution into existence
//! (a subprocess, or a control task around an in-process binding), push
//! protocol messages into it, watch what comes back out and kill it. The
//! bridge and supervisor above never care which flavor they are driving.

pub mod native;
pub mod process;
pub mod runner;

use std::pin::Pin;

use async_trait::async_trait;
use futures::Stream;

use crate::error::SupervisorError;
use crate::protocol::Message;

pub use native::{NativeWorker, NodeHandle};
pub use process::{ProcessWorker, WorkerCommand};

/// Stream of events observed from a live worker. Ends after the terminal
/// [`WorkerEvent::Exited`].
pub type EventStream = Pin<Box<dyn Stream<Item = WorkerEvent> + Send>>;

/// Identifies one live worker unit. For subprocess workers `id` is the OS
/// pid; for native workers it is a per-instance counter.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerHandle {
    pub id: u32,
    pub kind: String,
}

/// Something a live worker did.
#[derive(Debug, Clone, PartialEq)]
pub enum WorkerEvent {
    /// A decoded control-channel message.
    Message(Message),
    /// A control-channel line that did not decode as a message.
    Garbled { line: String, reason: String },
    /// The worker unit is gone. Always the last event on the stream.
    Exited(WorkerExit),
}

/// How a worker unit ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WorkerExit {
    pub code: Option<i32>,
    pub signal: Option<i32>,
}

impl WorkerExit {
    /// Exit descriptor for a unit that was killed rather than reaped with a
    /// real status, e.g. a native control loop torn down by `kill()`.
    pub fn killed() -> Self {
        Self {
            code: None,
            signal: Some(SIGKILL),
        }
    }

    /// True only for a clean zero exit.
    pub fn clean(&self) -> bool {
        self.code == Some(0)
    }

    pub fn from_status(status: std::process::ExitStatus) -> Self {
        #[cfg(unix)]
        let signal = std::os::unix::process::ExitStatusExt::signal(&status);
        #[cfg(not(unix))]
        let signal = None;
        Self {
            code: status.code(),
            signal,
        }
    }
}

#[cfg(unix)]
const SIGKILL: i32 = libc::SIGKILL;
#[cfg(not(unix))]
const SIGKILL: i32 = 9;

/// A backend that runs one node worker at a time.
///
/// Implementations hold their own bookkeeping internally; handles stay plain
/// data so they can be logged and cloned freely. `events` may be called once
/// per spawned unit: the stream is the single place exit status is reported,
/// so handing it out twice would split that signal.
#[async_trait]
pub trait Worker: Send + Sync {
    /// Short backend name for logs ("process", "native", ...).
    fn kind(&self) -> &str;

    /// Bring a new worker unit into existence. No protocol traffic yet.
    async fn spawn(&self) -> Result<WorkerHandle, SupervisorError>;

    /// The event stream for a spawned unit. First call takes it; later calls
    /// yield a stream that reports the misuse and ends.
    fn events(&self, handle: &WorkerHandle) -> EventStream;

    /// Push a control message into the worker.
    async fn send(&self, handle: &WorkerHandle, message: Message) -> Result<(), SupervisorError>;

    /// Tear the unit down, escalating as needed. Resolves once it is gone.
    /// Killing an already-dead unit is not an error.
    async fn kill(&self, handle: &WorkerHandle) -> Result<(), SupervisorError>;

    /// Whether the unit is still alive right now.
    async fn is_alive(&self, handle: &WorkerHandle) -> bool;
}

// Worker must stay object safe: the bridge holds `Arc<dyn Worker>`.
const _: () = {
    fn _assert_object_safe(_: &dyn Worker) {}
};

#[cfg(test)]
mod tests {
    use super::*;
    use futures::StreamExt;

    /// Minimal in-memory backend proving the trait is implementable and
    /// object safe without any process machinery.
    struct NoopWorker;

    #[async_trait]
    impl Worker for NoopWorker {
        fn kind(&self) -> &str {
            "noop"
        }

        async fn spawn(&self) -> Result<WorkerHandle, SupervisorError> {
            Ok(WorkerHandle {
                id: 1,
                kind: "noop".into(),
            })
        }

        fn events(&self, _handle: &WorkerHandle) -> EventStream {
            Box::pin(futures::stream::iter(vec![
                WorkerEvent::Message(Message::Started),
                WorkerEvent::Exited(WorkerExit {
                    code: Some(0),
                    signal: None,
                }),
            ]))
        }

        async fn send(
            &self,
            _handle: &WorkerHandle,
            _message: Message,
        ) -> Result<(), SupervisorError> {
            Ok(())
        }

        async fn kill(&self, _handle: &WorkerHandle) -> Result<(), SupervisorError> {
            Ok(())
        }

        async fn is_alive(&self, _handle: &WorkerHandle) -> bool {
            false
        }
    }

    #[tokio::test]
    async fn trait_is_usable_through_dyn() {
        let worker: Box<dyn Worker> = Box::new(NoopWorker);
        let handle = worker.spawn().await.unwrap();
        assert_eq!(handle.kind, "noop");

        let events: Vec<_> = worker.events(&handle).collect().await;
        assert_eq!(events.len(), 2);
        assert!(matches!(events.last(), Some(WorkerEvent::Exited(e)) if e.clean()));
    }

    #[test]
    fn clean_requires_zero_exit() {
        assert!(
            WorkerExit {
                code: Some(0),
                signal: None
            }
            .clean()
        );
        assert!(
            !WorkerExit {
                code: Some(1),
                signal: None
            }
            .clean()
        );
        assert!(!WorkerExit::killed().clean());
    }
}
