//! Worker-side protocol loop.
//!
//! [`run_worker`] is what a worker binary's `main` calls: it serves the
//! line protocol on stdin/stdout, driving a [`NodeHandle`] in response to
//! `start` and `stop`. The exit code mirrors the protocol outcome, so the
//! supervisor can tell a clean shutdown from a failed one even if the final
//! message got lost.

use anyhow::Context;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWrite, AsyncWriteExt, BufReader};
use tracing::debug;

use super::native::NodeHandle;
use crate::protocol::Message;

/// Serve the control protocol on stdin/stdout until a stop or EOF.
/// Returns the process exit code to use.
pub async fn run_worker(handle: impl NodeHandle) -> anyhow::Result<i32> {
    let stdin = BufReader::new(tokio::io::stdin());
    let stdout = tokio::io::stdout();
    serve(handle, stdin, stdout).await
}

/// Protocol loop over arbitrary streams. Split out of [`run_worker`] so
/// tests can drive it over an in-memory duplex pipe.
pub async fn serve<H, R, W>(handle: H, reader: R, mut writer: W) -> anyhow::Result<i32>
where
    H: NodeHandle,
    R: AsyncBufRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut lines = reader.lines();
    let mut node = handle;
    let mut started = false;

    while let Some(line) = lines
        .next_line()
        .await
        .context("failed to read control channel")?
    {
        let trimmed = line.trim();
        if trimmed.is_empty() {
            continue;
        }

        let msg = match Message::from_line(trimmed) {
            Ok(msg) => msg,
            Err(e) => {
                reply(
                    &mut writer,
                    &Message::Error {
                        message: format!("invalid message: {e}"),
                        stack: None,
                    },
                )
                .await?;
                continue;
            }
        };
        debug!(kind = msg.kind(), "worker received control message");

        match msg {
            Message::Start { config } => {
                let mut n = node;
                let (n, result) = tokio::task::spawn_blocking(move || {
                    let result = n.start(&config);
                    (n, result)
                })
                .await
                .context("node start panicked")?;
                node = n;

                match result {
                    Ok(()) => {
                        started = true;
                        reply(&mut writer, &Message::Started).await?;
                    }
                    Err(e) => {
                        reply(&mut writer, &error_message(&e)).await?;
                        return Ok(1);
                    }
                }
            }

            Message::Stop => {
                let mut n = node;
                let (_n, result) = tokio::task::spawn_blocking(move || {
                    let result = n.stop();
                    (n, result)
                })
                .await
                .context("node stop panicked")?;

                return match result {
                    Ok(()) => {
                        reply(&mut writer, &Message::Stopped).await?;
                        Ok(0)
                    }
                    Err(e) => {
                        reply(&mut writer, &error_message(&e)).await?;
                        Ok(1)
                    }
                };
            }

            other => {
                reply(
                    &mut writer,
                    &Message::Error {
                        message: format!("unknown message type: {}", other.kind()),
                        stack: None,
                    },
                )
                .await?;
            }
        }
    }

    // Control channel closed without a stop. Shut the node down rather than
    // leave it running with nobody supervising it.
    if started {
        debug!("control channel closed, stopping node");
        let mut n = node;
        let _ = tokio::task::spawn_blocking(move || n.stop()).await;
    }
    Ok(0)
}

fn error_message(e: &anyhow::Error) -> Message {
    Message::Error {
        message: e.to_string(),
        stack: Some(format!("{e:?}")),
    }
}

async fn reply<W: AsyncWrite + Unpin>(writer: &mut W, message: &Message) -> anyhow::Result<()> {
    let line = message.to_line()?;
    writer.write_all(line.as_bytes()).await?;
    writer.write_all(b"\n").await?;
    writer
        .flush()
        .await
        .context("failed to write control channel reply")
}
