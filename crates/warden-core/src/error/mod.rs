//! Error taxonomy for supervision.
//!
//! Every failure a caller can observe maps onto exactly one variant of
//! [`SupervisorError`], so tests and embedders can match on the variant
//! instead of scraping message strings.

use std::time::Duration;

use thiserror::Error;

use crate::supervisor::LifecycleState;

/// Unified error type for the supervisor and everything under it.
#[derive(Debug, Error)]
pub enum SupervisorError {
    /// `start()` was called while a worker is already active, or on an
    /// instance that has already failed.
    #[error("node already started (state: {state})")]
    AlreadyStarted { state: LifecycleState },

    /// `stop()` was called with no running worker to stop.
    #[error("node is not running (state: {state})")]
    NotRunning { state: LifecycleState },

    /// The worker unit could not be brought into existence at all.
    #[error("failed to launch worker: {message}")]
    Launch {
        message: String,
        #[source]
        source: std::io::Error,
    },

    /// The worker terminated when nothing asked it to.
    #[error("worker exited during {phase} (code: {code:?}, signal: {signal:?})")]
    Crash {
        code: Option<i32>,
        signal: Option<i32>,
        phase: LifecycleState,
    },

    /// The worker itself reported a failure over the control channel.
    #[error("worker reported an error: {message}")]
    Worker {
        message: String,
        stack: Option<String>,
    },

    /// The worker sent something that does not decode as a protocol message.
    #[error("protocol violation: {detail}")]
    Protocol { detail: String },

    /// The node did not become ready before the startup deadline.
    #[error("node did not become ready within {elapsed:?}")]
    ReadinessTimeout { elapsed: Duration },

    /// The control channel to the worker is gone.
    #[error("worker control channel closed")]
    ChannelClosed,
}

impl SupervisorError {
    /// Stable machine-readable tag for the variant. Used in logs and by the
    /// CLI to pick exit codes; the display string may change, this must not.
    pub fn kind(&self) -> &'static str {
        match self {
            SupervisorError::AlreadyStarted { .. } => "already_started",
            SupervisorError::NotRunning { .. } => "not_running",
            SupervisorError::Launch { .. } => "launch",
            SupervisorError::Crash { .. } => "crash",
            SupervisorError::Worker { .. } => "worker",
            SupervisorError::Protocol { .. } => "protocol",
            SupervisorError::ReadinessTimeout { .. } => "readiness_timeout",
            SupervisorError::ChannelClosed => "channel_closed",
        }
    }
}
