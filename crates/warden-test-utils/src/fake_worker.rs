//! Fake worker executables.
//!
//! Each builder writes a small shell script into the given directory and
//! returns a [`WorkerCommand`] for it. Every script records its pid in
//! `<dir>/pid` first (see [`crate::read_pid`]), then plays one misbehavior
//! or another. One worker per directory; they share the pid file name.

use std::fs;
use std::path::Path;

use warden_core::WorkerCommand;

/// Write an executable `#!/bin/sh` script and return a command for it.
pub fn script(dir: &Path, name: &str, body: &str) -> WorkerCommand {
    let path = dir.join(name);
    let contents = format!(
        "#!/bin/sh\necho $$ > '{pid}'\n{body}\n",
        pid = dir.join("pid").display()
    );
    fs::write(&path, contents).expect("write fake worker script");
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        fs::set_permissions(&path, fs::Permissions::from_mode(0o755))
            .expect("mark fake worker script executable");
    }
    WorkerCommand::new(path)
}

/// Full protocol citizen: start -> started, stop -> stopped, exit 0.
pub fn well_behaved(dir: &Path) -> WorkerCommand {
    script(
        dir,
        "well-behaved.sh",
        r#"read _start
echo '{"type":"started"}'
read _stop
echo '{"type":"stopped"}'
exit 0"#,
    )
}

/// Reports an error in response to start, then hangs around until killed.
pub fn error_then_linger(dir: &Path, message: &str) -> WorkerCommand {
    script(
        dir,
        "error-then-linger.sh",
        &format!(
            r#"read _start
echo '{{"type":"error","message":"{message}"}}'
while true; do sleep 0.2; done"#
        ),
    )
}

/// Accepts the start command and then never says anything.
pub fn never_ready(dir: &Path) -> WorkerCommand {
    script(
        dir,
        "never-ready.sh",
        r#"read _start
while true; do sleep 0.2; done"#,
    )
}

/// Exits with `code` immediately, before any protocol traffic.
pub fn exit_early(dir: &Path, code: i32) -> WorkerCommand {
    script(dir, "exit-early.sh", &format!("exit {code}"))
}

/// Reads the start command, then dies with `code` instead of answering.
pub fn crash_on_start(dir: &Path, code: i32) -> WorkerCommand {
    script(
        dir,
        "crash-on-start.sh",
        &format!("read _start\nexit {code}"),
    )
}

/// Starts properly, then crashes with `code` after `after_ms` milliseconds.
pub fn crash_after_start(dir: &Path, code: i32, after_ms: u64) -> WorkerCommand {
    script(
        dir,
        "crash-after-start.sh",
        &format!(
            r#"read _start
echo '{{"type":"started"}}'
sleep {secs}
exit {code}"#,
            secs = after_ms as f64 / 1000.0
        ),
    )
}

/// Prints a line that is not a protocol message, then lingers.
pub fn garbled(dir: &Path) -> WorkerCommand {
    script(
        dir,
        "garbled.sh",
        r#"read _start
echo 'this is not json at all'
while true; do sleep 0.2; done"#,
    )
}

/// Starts properly but never reacts to stop. Dies to SIGTERM like anything
/// else, so a forced stop ends it quickly.
pub fn ignore_stop(dir: &Path) -> WorkerCommand {
    script(
        dir,
        "ignore-stop.sh",
        r#"read _start
echo '{"type":"started"}'
while true; do sleep 0.2; done"#,
    )
}

/// Acknowledges stop with `stopped` but never actually exits.
pub fn stop_ack_then_linger(dir: &Path) -> WorkerCommand {
    script(
        dir,
        "stop-ack-then-linger.sh",
        r#"read _start
echo '{"type":"started"}'
read _stop
echo '{"type":"stopped"}'
while true; do sleep 0.2; done"#,
    )
}

/// A raw node binary: no protocol, readiness signalled by a marker line.
/// Prints the marker twice to prove `started` is only synthesized once, and
/// exits cleanly on SIGTERM. Returns the command and the marker.
pub fn raw_with_marker(dir: &Path) -> (WorkerCommand, String) {
    let marker = "RPC server started";
    let command = script(
        dir,
        "raw-node.sh",
        &format!(
            r#"trap 'exit 0' TERM
echo 'node booting'
echo '{marker}'
echo '{marker}'
while true; do sleep 0.2; done"#
        ),
    );
    (command, marker.to_string())
}

/// Prints the value of `var` (as a bare, non-protocol line) and parks.
pub fn echo_env(dir: &Path, var: &str) -> WorkerCommand {
    script(
        dir,
        "echo-env.sh",
        &format!("echo \"${var}\"\nread _hold"),
    )
}
