//! Subprocess worker backend.
//!
//! Spawns the node worker as a child process and talks to it over pipes. In
//! IPC mode the child speaks the line-oriented JSON protocol on
//! stdin/stdout; in raw mode the child is an ordinary node binary that logs
//! to stdout, and readiness is inferred from a marker line.

use std::collections::HashMap;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStdin, ChildStdout, Command};
use tokio::sync::Mutex;
use tracing::{debug, warn};

use super::{EventStream, Worker, WorkerEvent, WorkerExit, WorkerHandle};
use crate::error::SupervisorError;
use crate::protocol::Message;

/// How long a kill waits after SIGTERM before escalating to SIGKILL.
const KILL_GRACE: Duration = Duration::from_secs(5);

/// Poll interval while waiting to reap an exit status after stdout closes.
const REAP_POLL: Duration = Duration::from_millis(50);

/// What to launch and how.
#[derive(Debug, Clone)]
pub struct WorkerCommand {
    pub program: PathBuf,
    pub args: Vec<String>,
    pub working_dir: Option<PathBuf>,
    pub envs: HashMap<String, String>,
}

impl WorkerCommand {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            working_dir: None,
            envs: HashMap::new(),
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn working_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.working_dir = Some(dir.into());
        self
    }

    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.envs.insert(key.into(), value.into());
        self
    }
}

/// Control-channel style of a spawned process.
#[derive(Debug, Clone)]
enum LaunchMode {
    /// Child speaks the JSON line protocol on stdin/stdout.
    Ipc,
    /// Child is a plain node binary. A line containing `ready_marker` on
    /// stdout stands in for the `started` message; `stop` becomes SIGTERM.
    Raw { ready_marker: String },
}

/// Internal state kept per spawned child, keyed by pid.
struct ProcessState {
    child: Child,
    /// Control channel into the child; `None` once the pipe broke.
    stdin: Option<ChildStdin>,
    /// Stdout reader; `Option` so it can be `.take()`-en once for streaming.
    stdout: Option<ChildStdout>,
}

/// Worker backend that runs the node worker as a subprocess.
#[derive(Clone)]
pub struct ProcessWorker {
    command: WorkerCommand,
    mode: LaunchMode,
    /// Per-child bookkeeping. Entries are cleared by the event stream once
    /// the exit status has been reaped and reported.
    processes: Arc<Mutex<HashMap<u32, ProcessState>>>,
}

impl std::fmt::Debug for ProcessWorker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProcessWorker")
            .field("command", &self.command)
            .field("mode", &self.mode)
            .finish()
    }
}

impl ProcessWorker {
    /// A worker that speaks the JSON line protocol over stdin/stdout.
    pub fn ipc(command: WorkerCommand) -> Self {
        Self {
            command,
            mode: LaunchMode::Ipc,
            processes: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// A plain node binary with no protocol support. `started` is
    /// synthesized when a stdout line contains `ready_marker`, and `stop`
    /// is delivered as SIGTERM.
    pub fn raw(command: WorkerCommand, ready_marker: impl Into<String>) -> Self {
        Self {
            command,
            mode: LaunchMode::Raw {
                ready_marker: ready_marker.into(),
            },
            processes: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// SIGTERM on unix; best-effort process kill elsewhere. Callers hold the
    /// map lock, so the non-unix path can reach the child directly.
    fn terminate(pid: u32, state: &mut ProcessState) {
        #[cfg(unix)]
        {
            let _ = state;
            // SAFETY: pid belongs to a child this worker spawned.
            let ret = unsafe { libc::kill(pid as i32, libc::SIGTERM) };
            if ret != 0 {
                debug!(pid, "SIGTERM failed (process already gone?)");
            }
        }
        #[cfg(not(unix))]
        {
            if let Err(e) = state.child.start_kill() {
                debug!(pid, error = %e, "kill failed (process already gone?)");
            }
        }
    }
}

#[async_trait]
impl Worker for ProcessWorker {
    fn kind(&self) -> &str {
        "process"
    }

    async fn spawn(&self) -> Result<WorkerHandle, SupervisorError> {
        let mut cmd = Command::new(&self.command.program);
        cmd.args(&self.command.args);
        if let Some(dir) = &self.command.working_dir {
            cmd.current_dir(dir);
        }
        // Merge, don't replace, the inherited environment.
        for (key, value) in &self.command.envs {
            cmd.env(key, value);
        }

        cmd.stdin(Stdio::piped());
        cmd.stdout(Stdio::piped());
        cmd.stderr(Stdio::piped());
        // The OS reaps the child if the supervisor is dropped mid-flight.
        cmd.kill_on_drop(true);

        let mut child = cmd.spawn().map_err(|source| SupervisorError::Launch {
            message: format!(
                "failed to spawn worker '{}' -- is it installed and executable?",
                self.command.program.display()
            ),
            source,
        })?;

        let pid = child.id().ok_or_else(|| SupervisorError::Launch {
            message: format!(
                "worker '{}' exited before a pid could be read",
                self.command.program.display()
            ),
            source: std::io::Error::other("child has no pid"),
        })?;

        let stdin = child.stdin.take();
        let stdout = child.stdout.take();

        // Drain stderr in the background so the child never blocks on a full
        // pipe, surfacing whatever it prints.
        if let Some(stderr) = child.stderr.take() {
            let mut lines = BufReader::new(stderr).lines();
            tokio::spawn(async move {
                while let Ok(Some(line)) = lines.next_line().await {
                    if !line.trim().is_empty() {
                        warn!(pid, line = line.as_str(), "worker stderr");
                    }
                }
            });
        }

        {
            let mut processes = self.processes.lock().await;
            processes.insert(
                pid,
                ProcessState {
                    child,
                    stdin,
                    stdout,
                },
            );
        }

        debug!(pid, program = %self.command.program.display(), "spawned worker process");

        Ok(WorkerHandle {
            id: pid,
            kind: self.kind().to_string(),
        })
    }

    fn events(&self, handle: &WorkerHandle) -> EventStream {
        let pid = handle.id;
        let mode = self.mode.clone();
        let processes = Arc::clone(&self.processes);

        // 1. Take stdout from the process state (once).
        // 2. Translate lines into events until EOF.
        // 3. Reap the exit status and yield the terminal Exited event.
        let stream = async_stream::stream! {
            let stdout = {
                let mut procs = processes.lock().await;
                procs.get_mut(&pid).and_then(|state| state.stdout.take())
            };

            let Some(stdout) = stdout else {
                warn!(pid, "event stream requested twice, or process unknown");
                yield WorkerEvent::Garbled {
                    line: String::new(),
                    reason: "event stream already taken or process unknown".to_string(),
                };
                return;
            };

            let mut lines = BufReader::new(stdout).lines();
            let mut started_seen = false;

            loop {
                match lines.next_line().await {
                    Ok(Some(line)) => {
                        let trimmed = line.trim();
                        if trimmed.is_empty() {
                            continue;
                        }
                        match &mode {
                            LaunchMode::Ipc => match Message::from_line(trimmed) {
                                Ok(msg) => yield WorkerEvent::Message(msg),
                                Err(e) => {
                                    yield WorkerEvent::Garbled {
                                        line: trimmed.to_string(),
                                        reason: e.to_string(),
                                    };
                                }
                            },
                            LaunchMode::Raw { ready_marker } => {
                                debug!(pid, line = trimmed, "worker stdout");
                                if !started_seen && trimmed.contains(ready_marker.as_str()) {
                                    started_seen = true;
                                    yield WorkerEvent::Message(Message::Started);
                                }
                            }
                        }
                    }
                    Ok(None) => break,
                    Err(e) => {
                        warn!(pid, error = %e, "error reading worker stdout");
                        yield WorkerEvent::Garbled {
                            line: String::new(),
                            reason: format!("stdout read error: {e}"),
                        };
                        break;
                    }
                }
            }

            // Stdout is closed; wait for the process to go away so the
            // terminal event carries the real status. kill() may be holding
            // the child in the same slot, so poll instead of waiting inline.
            let exit = loop {
                let polled = {
                    let mut procs = processes.lock().await;
                    match procs.get_mut(&pid) {
                        Some(state) => state.child.try_wait(),
                        None => break None,
                    }
                };
                match polled {
                    Ok(Some(status)) => {
                        processes.lock().await.remove(&pid);
                        break Some(WorkerExit::from_status(status));
                    }
                    Ok(None) => tokio::time::sleep(REAP_POLL).await,
                    Err(e) => {
                        warn!(pid, error = %e, "failed to reap worker");
                        processes.lock().await.remove(&pid);
                        break None;
                    }
                }
            };

            let exit = exit.unwrap_or(WorkerExit {
                code: None,
                signal: None,
            });
            debug!(pid, code = ?exit.code, signal = ?exit.signal, "worker process exited");
            yield WorkerEvent::Exited(exit);
        };

        Box::pin(stream)
    }

    async fn send(&self, handle: &WorkerHandle, message: Message) -> Result<(), SupervisorError> {
        let pid = handle.id;

        if let LaunchMode::Raw { .. } = self.mode {
            return match message {
                // Raw binaries boot on their own; there is nothing to send.
                Message::Start { .. } => Ok(()),
                Message::Stop => {
                    let mut procs = self.processes.lock().await;
                    if let Some(state) = procs.get_mut(&pid) {
                        debug!(pid, "translating stop to SIGTERM for raw worker");
                        Self::terminate(pid, state);
                    }
                    Ok(())
                }
                other => {
                    debug!(pid, kind = other.kind(), "dropping message for raw worker");
                    Ok(())
                }
            };
        }

        let line = message.to_line()?;
        let mut procs = self.processes.lock().await;
        let state = procs
            .get_mut(&pid)
            .ok_or(SupervisorError::ChannelClosed)?;
        let stdin = state.stdin.as_mut().ok_or(SupervisorError::ChannelClosed)?;

        let write = async {
            stdin.write_all(line.as_bytes()).await?;
            stdin.write_all(b"\n").await?;
            stdin.flush().await
        };
        if let Err(e) = write.await {
            debug!(pid, error = %e, "control channel write failed");
            state.stdin = None;
            return Err(SupervisorError::ChannelClosed);
        }

        debug!(pid, kind = message.kind(), "sent control message");
        Ok(())
    }

    async fn kill(&self, handle: &WorkerHandle) -> Result<(), SupervisorError> {
        let pid = handle.id;
        let mut processes = self.processes.lock().await;

        let Some(state) = processes.get_mut(&pid) else {
            debug!(pid, "kill called but process not in map (already reaped?)");
            return Ok(());
        };

        Self::terminate(pid, state);

        match tokio::time::timeout(KILL_GRACE, state.child.wait()).await {
            Ok(Ok(status)) => {
                debug!(pid, ?status, "worker exited after SIGTERM");
            }
            _ => {
                debug!(pid, "worker survived SIGTERM, sending SIGKILL");
                let _ = state.child.kill().await;
            }
        }

        // The slot stays in the map: the event stream reaps the cached
        // status from it and clears it.
        Ok(())
    }

    async fn is_alive(&self, handle: &WorkerHandle) -> bool {
        let pid = handle.id;
        let mut processes = self.processes.lock().await;

        match processes.get_mut(&pid) {
            Some(state) => match state.child.try_wait() {
                Ok(Some(_status)) => false,
                Ok(None) => true,
                Err(e) => {
                    warn!(pid, error = %e, "error checking worker status");
                    false
                }
            },
            None => false,
        }
    }
}
