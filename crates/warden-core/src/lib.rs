//! Core engine for warden.
//!
//! A [`supervisor::Supervisor`] owns at most one worker at a time and walks it
//! through a strict lifecycle: launch the worker, hand it a start command,
//! wait for it to report back (and, when RPC ports are configured, for the
//! node behind it to answer status probes), then hold it under observation
//! until a graceful stop is requested or the worker dies on its own.
//!
//! Workers come in two flavors behind the same [`worker::Worker`] trait:
//! subprocesses speaking a line-oriented JSON protocol ([`worker::ProcessWorker`])
//! and in-process node bindings driven on a blocking thread
//! ([`worker::NativeWorker`]).

pub mod bridge;
pub mod config;
pub mod error;
pub mod protocol;
pub mod readiness;
pub mod supervisor;
pub mod worker;

pub use bridge::{StopOutcome, WorkerBridge};
pub use config::{NodeConfig, SupervisorSettings};
pub use error::SupervisorError;
pub use protocol::Message;
pub use readiness::{RpcStatusProbe, SocketProbe, StatusProbe, wait_until_ready};
pub use supervisor::{LifecycleState, Supervisor};
pub use worker::{
    EventStream, NativeWorker, NodeHandle, ProcessWorker, Worker, WorkerCommand, WorkerEvent,
    WorkerExit, WorkerHandle,
};
