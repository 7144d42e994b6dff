//! Guest process lifecycle helpers
//!
//! Spawning a unit binary, waiting for its `register` handshake, and
//! escalating from a polite signal to a kill.

use std::path::Path;
use std::process::Stdio;
use std::sync::atomic::{AtomicU16, Ordering};
use std::time::{Duration, Instant};

use tokio::process::{Child, Command};

/// Launch `binary <host_port>` with stderr captured
///
/// The host port is the only positional argument; the guest dials back and
/// sends `register` with its own listening port.
pub fn spawn_guest(binary: &Path, host_port: u16) -> std::io::Result<Child> {
    Command::new(binary)
        .arg(host_port.to_string())
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .spawn()
}

/// Poll `port` until it is non-zero or `timeout` elapses
///
/// Returns `None` on timeout; the caller decides whether that is fatal.
pub async fn wait_for_registration(port: &AtomicU16, poll: Duration, timeout: Duration) -> Option<u16> {
    let start = Instant::now();
    loop {
        let current = port.load(Ordering::Acquire);
        if current != 0 {
            return Some(current);
        }
        if start.elapsed() >= timeout {
            return None;
        }
        tokio::time::sleep(poll.min(timeout.saturating_sub(start.elapsed()))).await;
    }
}

/// Ask a process to terminate with SIGTERM
pub fn terminate(pid: u32) -> nix::Result<()> {
    use nix::sys::signal::{kill, Signal};
    use nix::unistd::Pid;

    let raw = i32::try_from(pid).map_err(|_| nix::errno::Errno::ESRCH)?;
    kill(Pid::from_raw(raw), Signal::SIGTERM)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[tokio::test]
    async fn test_registration_observed() {
        let port = Arc::new(AtomicU16::new(0));
        let setter = port.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(30)).await;
            setter.store(4242, Ordering::Release);
        });
        let got = wait_for_registration(&port, Duration::from_millis(5), Duration::from_secs(2)).await;
        assert_eq!(got, Some(4242));
    }

    #[tokio::test]
    async fn test_registration_times_out() {
        let port = AtomicU16::new(0);
        let start = Instant::now();
        let got = wait_for_registration(&port, Duration::from_millis(10), Duration::from_millis(100)).await;
        assert_eq!(got, None);
        assert!(start.elapsed() >= Duration::from_millis(100));
        assert!(start.elapsed() < Duration::from_secs(2));
    }
}
