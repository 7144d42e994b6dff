//! Job record and the values it hands out

use std::fmt;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

/// Monotonic job identity, unique for the registry's lifetime
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobId(pub u64);

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "job-{}", self.0)
    }
}

/// What kind of call a stack frame represents
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionKind {
    Build,
    Change,
    Update,
    Compile,
    Agent,
}

impl ActionKind {
    pub fn as_str(self) -> &'static str {
        match self {
            ActionKind::Build => "build",
            ActionKind::Change => "change",
            ActionKind::Update => "update",
            ActionKind::Compile => "compile",
            ActionKind::Agent => "agent",
        }
    }
}

/// One entry of a job's call stack
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CallFrame {
    pub owner: String,
    pub tool: String,
    pub action: ActionKind,
}

impl CallFrame {
    pub fn new(owner: impl Into<String>, tool: impl Into<String>, action: ActionKind) -> Self {
        Self {
            owner: owner.into(),
            tool: tool.into(),
            action,
        }
    }
}

/// A policy violation reported by a guest against a job
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SandboxViolation {
    pub kind: String,
    pub detail: String,
}

/// Final result of a job as delivered to its completion callback
#[derive(Debug, Clone, Default, PartialEq)]
pub struct JobOutcome {
    pub data: Vec<u8>,
    pub ui: Vec<u8>,
    /// Empty on success
    pub error: String,
}

impl JobOutcome {
    pub fn failed(error: impl Into<String>) -> Self {
        Self {
            error: error.into(),
            ..Self::default()
        }
    }

    pub fn is_ok(&self) -> bool {
        self.error.is_empty()
    }
}

/// Everything known about a job once it has been drained from the registry
#[derive(Debug, Clone)]
pub struct JobReport {
    pub id: JobId,
    pub label: String,
    pub outcome: JobOutcome,
    /// Command batches that were never picked up by a progress callback
    pub cmds: Vec<Vec<u8>>,
    pub violations: Vec<SandboxViolation>,
    pub cancelled: bool,
    pub elapsed: Duration,
}

impl JobReport {
    pub fn status(&self) -> &'static str {
        if self.cancelled {
            "cancelled"
        } else if self.outcome.is_ok() {
            "ok"
        } else {
            "error"
        }
    }
}

/// Serializable view of an in-flight job, returned by `get_msgs`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobSnapshot {
    pub id: JobId,
    pub label: String,
    pub stack: Vec<CallFrame>,
    pub progress: f64,
    pub progress_label: String,
    pub elapsed_ms: u64,
    pub cancelled: bool,
    pub shown: bool,
    pub done: bool,
}

pub type CompletionCallback = Box<dyn FnOnce(JobReport) + Send>;
pub type ProgressCallback = Box<dyn FnMut(JobId, Vec<Vec<u8>>) + Send>;

/// A tracked asynchronous call, owned by the registry
pub(crate) struct Job {
    pub id: JobId,
    pub label: String,
    pub stack: Vec<CallFrame>,
    pub started: Instant,
    pub cancel: CancellationToken,
    pub done: bool,
    pub shown: bool,
    pub progress: f64,
    pub progress_label: String,
    pub outcome: JobOutcome,
    pub pending_cmds: Vec<Vec<u8>>,
    pub violations: Vec<SandboxViolation>,
    pub on_complete: Option<CompletionCallback>,
    pub on_progress: Option<ProgressCallback>,
}

impl Job {
    pub fn new(id: JobId, label: String, frame: CallFrame, cancel: CancellationToken) -> Self {
        Self {
            id,
            label,
            stack: vec![frame],
            started: Instant::now(),
            cancel,
            done: false,
            shown: false,
            progress: 0.0,
            progress_label: String::new(),
            outcome: JobOutcome::default(),
            pending_cmds: Vec::new(),
            violations: Vec::new(),
            on_complete: None,
            on_progress: None,
        }
    }

    pub fn snapshot(&self) -> JobSnapshot {
        JobSnapshot {
            id: self.id,
            label: self.label.clone(),
            stack: self.stack.clone(),
            progress: self.progress,
            progress_label: self.progress_label.clone(),
            elapsed_ms: self.started.elapsed().as_millis() as u64,
            cancelled: self.cancel.is_cancelled(),
            shown: self.shown,
            done: self.done,
        }
    }

    /// Split into the completion callback and the report it receives
    pub fn into_report(self) -> (Option<CompletionCallback>, JobReport) {
        let report = JobReport {
            id: self.id,
            label: self.label,
            outcome: self.outcome,
            cmds: self.pending_cmds,
            violations: self.violations,
            cancelled: self.cancel.is_cancelled(),
            elapsed: self.started.elapsed(),
        };
        (self.on_complete, report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_report_status_precedence() {
        let frame = CallFrame::new("Notes", "Add", ActionKind::Build);
        let job = Job::new(JobId(1), "add".into(), frame, CancellationToken::new());
        job.cancel.cancel();
        let (_, report) = job.into_report();
        assert_eq!(report.status(), "cancelled");
    }

    #[test]
    fn test_snapshot_serializes_frames() {
        let frame = CallFrame::new("Notes", "Add", ActionKind::Build);
        let job = Job::new(JobId(3), "add".into(), frame, CancellationToken::new());
        let json = serde_json::to_value(job.snapshot()).unwrap();
        assert_eq!(json["id"], 3);
        assert_eq!(json["stack"][0]["action"], "build");
    }
}
