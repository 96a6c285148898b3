//! Control-channel message protocol.
//!
//! Supervisor and worker exchange single-line JSON objects tagged by a
//! `type` field. The supervisor sends `start` and `stop`; the worker answers
//! with `started`, `stopped` or `error`. Anything that does not decode is a
//! protocol violation and is surfaced to the caller, never silently dropped.

use serde::{Deserialize, Serialize};

use crate::config::NodeConfig;
use crate::error::SupervisorError;

/// A message on the supervisor/worker control channel.
///
/// Wire form is one JSON object per line, e.g.
/// `{"type":"start","config":{"http_port":12537}}` or `{"type":"started"}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Message {
    /// Supervisor asks the worker to bring the node up.
    Start { config: NodeConfig },
    /// Worker reports the node is up (not necessarily synced).
    Started,
    /// Supervisor asks the worker to shut the node down.
    Stop,
    /// Worker reports the node shut down cleanly.
    Stopped,
    /// Worker reports a failure. `stack` is optional diagnostic detail.
    Error {
        message: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        stack: Option<String>,
    },
}

impl Message {
    /// The wire tag of this message, for logging.
    pub fn kind(&self) -> &'static str {
        match self {
            Message::Start { .. } => "start",
            Message::Started => "started",
            Message::Stop => "stop",
            Message::Stopped => "stopped",
            Message::Error { .. } => "error",
        }
    }

    /// Encode as a single JSON line (no trailing newline).
    pub fn to_line(&self) -> Result<String, SupervisorError> {
        serde_json::to_string(self).map_err(|e| SupervisorError::Protocol {
            detail: format!("failed to encode {} message: {e}", self.kind()),
        })
    }

    /// Decode one line from the control channel. An unknown `type` tag or
    /// malformed JSON is a [`SupervisorError::Protocol`].
    pub fn from_line(line: &str) -> Result<Self, SupervisorError> {
        serde_json::from_str(line.trim()).map_err(|e| SupervisorError::Protocol {
            detail: format!("{e} (line: {})", snippet(line)),
        })
    }
}

/// First chunk of a line for error messages, so a megabyte of garbage on
/// stdout does not end up inside an error string.
fn snippet(line: &str) -> &str {
    let line = line.trim();
    match line.char_indices().nth(120) {
        Some((idx, _)) => &line[..idx],
        None => line,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decodes_started() {
        let msg = Message::from_line(r#"{"type":"started"}"#).unwrap();
        assert_eq!(msg, Message::Started);
    }

    #[test]
    fn decodes_start_with_config() {
        let msg =
            Message::from_line(r#"{"type":"start","config":{"http_port":12537,"persist_data":true}}"#)
                .unwrap();
        match msg {
            Message::Start { config } => {
                assert_eq!(config.http_port, Some(12537));
                assert!(config.persist_data);
            }
            other => panic!("expected start, got {other:?}"),
        }
    }

    #[test]
    fn decodes_error_with_and_without_stack() {
        let msg = Message::from_line(r#"{"type":"error","message":"boom"}"#).unwrap();
        assert_eq!(
            msg,
            Message::Error {
                message: "boom".into(),
                stack: None
            }
        );

        let msg =
            Message::from_line(r#"{"type":"error","message":"boom","stack":"at node_start"}"#)
                .unwrap();
        match msg {
            Message::Error { stack, .. } => assert_eq!(stack.as_deref(), Some("at node_start")),
            other => panic!("expected error, got {other:?}"),
        }
    }

    #[test]
    fn unknown_tag_is_a_protocol_error() {
        let err = Message::from_line(r#"{"type":"reboot"}"#).unwrap_err();
        match err {
            SupervisorError::Protocol { detail } => {
                assert!(detail.contains("reboot"), "unexpected detail: {detail}")
            }
            other => panic!("expected protocol error, got {other:?}"),
        }
    }

    #[test]
    fn garbage_is_a_protocol_error_with_snippet() {
        let long = "x".repeat(4096);
        let err = Message::from_line(&long).unwrap_err();
        match err {
            SupervisorError::Protocol { detail } => {
                assert!(detail.len() < 400, "snippet not truncated: {}", detail.len())
            }
            other => panic!("expected protocol error, got {other:?}"),
        }
    }

    #[test]
    fn encodes_stop_and_error_on_one_line() {
        assert_eq!(Message::Stop.to_line().unwrap(), r#"{"type":"stop"}"#);

        let line = Message::Error {
            message: "db locked".into(),
            stack: None,
        }
        .to_line()
        .unwrap();
        assert_eq!(line, r#"{"type":"error","message":"db locked"}"#);
        assert!(!line.contains('\n'));
    }

    #[test]
    fn start_roundtrips_extra_config_keys() {
        let mut config = NodeConfig {
            http_port: Some(12537),
            ..Default::default()
        };
        config
            .extra
            .insert("mining_author".into(), serde_json::json!("0xabc"));

        let line = Message::Start { config }.to_line().unwrap();
        let back = Message::from_line(&line).unwrap();
        match back {
            Message::Start { config } => assert_eq!(config.extra["mining_author"], "0xabc"),
            other => panic!("expected start, got {other:?}"),
        }
    }
}
