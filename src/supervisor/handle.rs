//! Process handle - one running guest and everything observed about it
//!
//! A watcher task owns the OS child: it drains stderr, waits for exit and
//! kills on request. The handle only sees the shared [`ExitSlot`].
//!
//! Stopped -> Starting -> Registered -> Running -> Exited -> Stopped | Starting

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tokio::io::AsyncReadExt;
use tokio::sync::{oneshot, Notify};

use super::lifecycle;

/// Captured stderr is capped at this many bytes (the tail is kept)
const STDERR_LIMIT: usize = 64 * 1024;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProcessStatus {
    Stopped,
    Starting,
    Registered,
    Running,
    Exited,
}

/// How a guest process ended
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExitInfo {
    /// `None` when killed by a signal
    pub code: Option<i32>,
    pub stderr: String,
}

impl ExitInfo {
    pub fn is_failure(&self) -> bool {
        self.code != Some(0)
    }

    pub fn summary(&self) -> String {
        let code = self
            .code
            .map_or_else(|| "signal".to_string(), |c| c.to_string());
        let tail = self.stderr.trim();
        if tail.is_empty() {
            format!("exit status {code}")
        } else {
            format!("exit status {code}: {tail}")
        }
    }
}

#[derive(Default)]
struct ExitSlot {
    info: Mutex<Option<ExitInfo>>,
    notify: Notify,
}

pub struct ProcessHandle {
    pub unit: String,
    pub binary: PathBuf,
    pub pid: Option<u32>,
    status: ProcessStatus,
    started_at: Instant,
    exit: Arc<ExitSlot>,
    kill: Option<oneshot::Sender<()>>,
}

impl ProcessHandle {
    /// Spawn the binary and hand the child to a watcher task
    pub fn spawn(unit: &str, binary: &Path, host_port: u16) -> std::io::Result<Self> {
        let mut child = lifecycle::spawn_guest(binary, host_port)?;
        let pid = child.id();
        let exit = Arc::new(ExitSlot::default());
        let (kill_tx, kill_rx) = oneshot::channel();

        let stderr_task = child.stderr.take().map(|mut stderr| {
            tokio::spawn(async move {
                let mut captured = Vec::new();
                let mut buf = [0u8; 4096];
                loop {
                    match stderr.read(&mut buf).await {
                        Ok(0) | Err(_) => break,
                        Ok(n) => {
                            captured.extend_from_slice(&buf[..n]);
                            if captured.len() > STDERR_LIMIT {
                                let excess = captured.len() - STDERR_LIMIT;
                                captured.drain(..excess);
                            }
                        }
                    }
                }
                String::from_utf8_lossy(&captured).into_owned()
            })
        });

        let slot = exit.clone();
        let unit_name = unit.to_string();
        tokio::spawn(async move {
            let status = tokio::select! {
                status = child.wait() => status,
                _ = kill_rx => {
                    if let Err(e) = child.start_kill() {
                        tracing::debug!(unit = %unit_name, error = %e, "Kill failed");
                    }
                    child.wait().await
                }
            };
            let stderr = match stderr_task {
                Some(task) => task.await.unwrap_or_default(),
                None => String::new(),
            };
            let code = match status {
                Ok(s) => s.code(),
                Err(e) => {
                    tracing::warn!(unit = %unit_name, error = %e, "Waiting on guest failed");
                    None
                }
            };
            let info = ExitInfo { code, stderr };
            if info.is_failure() {
                tracing::warn!(unit = %unit_name, status = %info.summary(), "Guest exited");
            } else {
                tracing::info!(unit = %unit_name, "Guest exited cleanly");
            }
            *slot.info.lock() = Some(info);
            slot.notify.notify_waiters();
        });

        Ok(Self {
            unit: unit.to_string(),
            binary: binary.to_path_buf(),
            pid,
            status: ProcessStatus::Starting,
            started_at: Instant::now(),
            exit,
            kill: Some(kill_tx),
        })
    }

    pub fn status(&self) -> ProcessStatus {
        if self.exit.info.lock().is_some() && self.status != ProcessStatus::Stopped {
            return ProcessStatus::Exited;
        }
        self.status.clone()
    }

    pub fn mark_registered(&mut self) {
        self.status = ProcessStatus::Registered;
    }

    pub fn mark_running(&mut self) {
        self.status = ProcessStatus::Running;
    }

    pub fn mark_stopped(&mut self) {
        self.status = ProcessStatus::Stopped;
    }

    pub fn is_alive(&self) -> bool {
        self.exit.info.lock().is_none()
    }

    pub fn exit_info(&self) -> Option<ExitInfo> {
        self.exit.info.lock().clone()
    }

    pub fn uptime(&self) -> Duration {
        self.started_at.elapsed()
    }

    /// Wait up to `timeout` for the process to exit; true if it did
    pub async fn wait_exit(&self, timeout: Duration) -> bool {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let notified = self.exit.notify.notified();
            if !self.is_alive() {
                return true;
            }
            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return !self.is_alive();
            }
        }
    }

    /// SIGTERM; the watcher still reaps the child
    pub fn terminate(&self) {
        if let Some(pid) = self.pid {
            if let Err(e) = lifecycle::terminate(pid) {
                tracing::debug!(unit = %self.unit, pid, error = %e, "SIGTERM failed");
            }
        }
    }

    /// Ask the watcher to kill the child
    pub fn kill(&mut self) {
        if let Some(tx) = self.kill.take() {
            let _ = tx.send(());
        }
    }
}

impl std::fmt::Debug for ProcessHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProcessHandle")
            .field("unit", &self.unit)
            .field("binary", &self.binary)
            .field("pid", &self.pid)
            .field("status", &self.status())
            .field("uptime", &self.uptime())
            .finish()
    }
}
