//! Shared helpers for warden tests: fake worker executables, an in-memory
//! scripted worker, and a JSON-RPC status stub.

pub mod fake_worker;
pub mod scripted;
pub mod status_stub;

pub use scripted::{ScriptedWorker, TimedEvent};
pub use status_stub::StatusStub;

use std::path::Path;
use std::time::Duration;

/// A TCP port that was free at bind time.
pub fn free_port() -> u16 {
    let listener = std::net::TcpListener::bind("127.0.0.1:0").expect("bind an ephemeral port");
    listener
        .local_addr()
        .expect("listener has a local address")
        .port()
}

/// Read the pid a fake worker script wrote next to itself.
pub fn read_pid(dir: &Path) -> u32 {
    let text = std::fs::read_to_string(dir.join("pid")).expect("fake worker wrote no pid file");
    text.trim().parse().expect("pid file holds a pid")
}

/// Whether a process with this pid currently exists.
#[cfg(unix)]
pub fn pid_alive(pid: u32) -> bool {
    // SAFETY: signal 0 performs existence checking only; nothing is sent.
    unsafe { libc::kill(pid as i32, 0) == 0 }
}

/// Poll until the pid is gone, up to `within`. True if it disappeared.
#[cfg(unix)]
pub async fn wait_pid_gone(pid: u32, within: Duration) -> bool {
    let deadline = tokio::time::Instant::now() + within;
    while tokio::time::Instant::now() < deadline {
        if !pid_alive(pid) {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    !pid_alive(pid)
}
