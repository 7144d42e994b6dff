//! Message Registry - every in-flight call, its progress and its call stack
//!
//! Jobs are created when a call is dispatched, mutated by RPC handlers as the
//! guest streams progress and commands, and removed by [`MessageRegistry::flush`]
//! once finished. Callbacks never run while the registry lock is held.
//!
//! ```text
//! create ──► progress / add_cmds / push_frame ... ──► complete
//!                                                       │
//!            flush: promote slow ─► deliver cmds ─► drain + on_complete
//! ```

mod job;

pub use job::{
    ActionKind, CallFrame, CompletionCallback, JobId, JobOutcome, JobReport, JobSnapshot,
    ProgressCallback, SandboxViolation,
};

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::metrics::Metrics;
use job::Job;

/// Counts from one maintenance pass
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FlushReport {
    pub promoted: usize,
    pub delivered: usize,
    pub completed: usize,
}

pub struct MessageRegistry {
    jobs: Mutex<BTreeMap<JobId, Job>>,
    next_id: AtomicU64,
    slow_threshold: Duration,
    metrics: Option<Arc<Metrics>>,
}

impl MessageRegistry {
    pub fn new(slow_threshold: Duration) -> Arc<Self> {
        Arc::new(Self::build(slow_threshold, None))
    }

    pub fn with_metrics(slow_threshold: Duration, metrics: Arc<Metrics>) -> Arc<Self> {
        Arc::new(Self::build(slow_threshold, Some(metrics)))
    }

    fn build(slow_threshold: Duration, metrics: Option<Arc<Metrics>>) -> Self {
        Self {
            jobs: Mutex::new(BTreeMap::new()),
            next_id: AtomicU64::new(1),
            slow_threshold,
            metrics,
        }
    }

    /// Start tracking a new top-level job
    pub fn create(&self, label: impl Into<String>, frame: CallFrame) -> JobId {
        self.insert(label.into(), frame, CancellationToken::new())
    }

    /// Start a job nested under `parent`; stopping the parent stops it too
    ///
    /// An unknown parent yields an independent job.
    pub fn create_child(&self, parent: JobId, label: impl Into<String>, frame: CallFrame) -> JobId {
        let cancel = self
            .jobs
            .lock()
            .get(&parent)
            .map(|p| p.cancel.child_token())
            .unwrap_or_else(CancellationToken::new);
        self.insert(label.into(), frame, cancel)
    }

    fn insert(&self, label: String, frame: CallFrame, cancel: CancellationToken) -> JobId {
        let id = JobId(self.next_id.fetch_add(1, Ordering::Relaxed));
        tracing::debug!(job = %id, label = %label, owner = %frame.owner, tool = %frame.tool, "Job created");
        let active = {
            let mut jobs = self.jobs.lock();
            jobs.insert(id, Job::new(id, label, frame, cancel));
            jobs.len()
        };
        self.set_active(active);
        id
    }

    pub fn contains(&self, id: JobId) -> bool {
        self.jobs.lock().contains_key(&id)
    }

    pub fn len(&self) -> usize {
        self.jobs.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.jobs.lock().is_empty()
    }

    /// The job's cancellation token, for passing into long-running calls
    pub fn cancel_token(&self, id: JobId) -> Option<CancellationToken> {
        self.jobs.lock().get(&id).map(|j| j.cancel.clone())
    }

    /// Request cancellation; returns false for unknown ids
    ///
    /// Cooperative only: a call already blocked on I/O completes normally and
    /// observes the flag at its next `progress` check.
    pub fn stop(&self, id: JobId) -> bool {
        let token = match self.jobs.lock().get(&id) {
            Some(job) => job.cancel.clone(),
            None => return false,
        };
        if !token.is_cancelled() {
            token.cancel();
            tracing::info!(job = %id, "Job stopped");
            if let Some(m) = &self.metrics {
                m.jobs_cancelled.inc();
            }
        }
        true
    }

    pub fn is_cancelled(&self, id: JobId) -> bool {
        self.jobs
            .lock()
            .get(&id)
            .map_or(true, |j| j.cancel.is_cancelled())
    }

    /// Record progress; returns whether the caller should continue
    ///
    /// Unknown ids answer "do not continue".
    pub fn progress(&self, id: JobId, done: f64, label: impl Into<String>) -> bool {
        let mut jobs = self.jobs.lock();
        let Some(job) = jobs.get_mut(&id) else {
            return false;
        };
        job.progress = if done.is_finite() { done.clamp(0.0, 1.0) } else { 0.0 };
        job.progress_label = label.into();
        !job.cancel.is_cancelled()
    }

    /// Buffer a side-effect command batch for the next flush
    pub fn add_cmds(&self, id: JobId, batch: Vec<u8>) -> bool {
        if batch.is_empty() {
            return self.contains(id);
        }
        match self.jobs.lock().get_mut(&id) {
            Some(job) => {
                job.pending_cmds.push(batch);
                true
            }
            None => false,
        }
    }

    /// Mark finished; the completion callback fires on the next flush
    pub fn complete(&self, id: JobId, outcome: JobOutcome) -> bool {
        let mut jobs = self.jobs.lock();
        let Some(job) = jobs.get_mut(&id) else {
            return false;
        };
        if job.stack.len() > 1 {
            tracing::warn!(job = %id, depth = job.stack.len(), "Job completed with nested frames still pushed");
        }
        job.outcome = outcome;
        job.progress = 1.0;
        job.done = true;
        true
    }

    pub fn on_complete(&self, id: JobId, callback: CompletionCallback) -> bool {
        match self.jobs.lock().get_mut(&id) {
            Some(job) => {
                job.on_complete = Some(callback);
                true
            }
            None => false,
        }
    }

    pub fn on_progress(&self, id: JobId, callback: ProgressCallback) -> bool {
        match self.jobs.lock().get_mut(&id) {
            Some(job) => {
                job.on_progress = Some(callback);
                true
            }
            None => false,
        }
    }

    /// Enter a nested call; the frame is popped when the guard drops
    pub fn push_frame(self: &Arc<Self>, id: JobId, frame: CallFrame) -> Option<StackGuard> {
        let depth = {
            let mut jobs = self.jobs.lock();
            let job = jobs.get_mut(&id)?;
            job.stack.push(frame);
            job.stack.len()
        };
        Some(StackGuard {
            registry: self.clone(),
            job: id,
            depth,
        })
    }

    /// Pop the innermost nested frame; the job's root frame is never popped
    pub fn pop_frame(&self, id: JobId) -> Option<CallFrame> {
        let mut jobs = self.jobs.lock();
        let job = jobs.get_mut(&id)?;
        if job.stack.len() > 1 {
            job.stack.pop()
        } else {
            None
        }
    }

    pub fn stack(&self, id: JobId) -> Vec<CallFrame> {
        self.jobs
            .lock()
            .get(&id)
            .map(|j| j.stack.clone())
            .unwrap_or_default()
    }

    pub fn record_violation(&self, id: JobId, violation: SandboxViolation) -> bool {
        if let Some(m) = &self.metrics {
            m.sandbox_violations.with_label_values(&[violation.kind.as_str()]).inc();
        }
        tracing::warn!(job = %id, kind = %violation.kind, detail = %violation.detail, "Sandbox violation");
        match self.jobs.lock().get_mut(&id) {
            Some(job) => {
                job.violations.push(violation);
                true
            }
            None => false,
        }
    }

    pub fn snapshot(&self) -> Vec<JobSnapshot> {
        self.jobs.lock().values().map(Job::snapshot).collect()
    }

    /// One maintenance pass
    ///
    /// 1. promote jobs running longer than the slow threshold
    /// 2. hand pending command batches to each job's progress callback
    /// 3. drain finished jobs and run their completion callbacks
    pub fn flush(&self) -> FlushReport {
        let mut report = FlushReport::default();
        let mut deliveries: Vec<(JobId, ProgressCallback, Vec<Vec<u8>>)> = Vec::new();
        let mut finished = Vec::new();

        let active = {
            let mut jobs = self.jobs.lock();
            let now = Instant::now();

            for job in jobs.values_mut() {
                if !job.shown && !job.done && now.duration_since(job.started) >= self.slow_threshold {
                    job.shown = true;
                    report.promoted += 1;
                    tracing::info!(job = %job.id, label = %job.label, "Job is slow, reporting status");
                }
                if !job.pending_cmds.is_empty() {
                    if let Some(callback) = job.on_progress.take() {
                        deliveries.push((job.id, callback, std::mem::take(&mut job.pending_cmds)));
                    }
                }
            }

            let done: Vec<JobId> = jobs.values().filter(|j| j.done).map(|j| j.id).collect();
            for id in done {
                if let Some(job) = jobs.remove(&id) {
                    finished.push(job.into_report());
                }
            }
            jobs.len()
        };
        self.set_active(active);

        for (id, callback, batches) in deliveries.iter_mut() {
            report.delivered += batches.len();
            callback(*id, std::mem::take(batches));
        }

        if !deliveries.is_empty() {
            let mut jobs = self.jobs.lock();
            for (id, callback, _) in deliveries {
                if let Some(job) = jobs.get_mut(&id) {
                    job.on_progress.get_or_insert(callback);
                }
            }
        }

        for (callback, job_report) in finished {
            report.completed += 1;
            if let Some(m) = &self.metrics {
                m.jobs_completed.with_label_values(&[job_report.status()]).inc();
            }
            tracing::debug!(job = %job_report.id, status = job_report.status(), "Job drained");
            if let Some(callback) = callback {
                callback(job_report);
            }
        }

        report
    }

    /// Run [`MessageRegistry::flush`] on a single maintenance task
    pub fn spawn_flusher(self: &Arc<Self>, interval: Duration, shutdown: CancellationToken) -> JoinHandle<()> {
        let registry = self.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = ticker.tick() => {
                        registry.flush();
                    }
                }
            }
            // Drain whatever finished before shutdown
            registry.flush();
        })
    }

    fn set_active(&self, active: usize) {
        if let Some(m) = &self.metrics {
            m.jobs_active.set(active as i64);
        }
    }
}

/// Pops its call-stack frame when dropped
#[must_use = "dropping the guard pops the frame immediately"]
pub struct StackGuard {
    registry: Arc<MessageRegistry>,
    job: JobId,
    depth: usize,
}

impl StackGuard {
    pub fn job(&self) -> JobId {
        self.job
    }

    pub fn depth(&self) -> usize {
        self.depth
    }
}

impl Drop for StackGuard {
    fn drop(&mut self) {
        if self.registry.pop_frame(self.job).is_none() {
            tracing::debug!(job = %self.job, "Stack frame already gone");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn frame(tool: &str) -> CallFrame {
        CallFrame::new("Notes", tool, ActionKind::Build)
    }

    #[test]
    fn test_ids_are_unique_and_increasing() {
        let registry = MessageRegistry::new(Duration::from_secs(1));
        let a = registry.create("a", frame("A"));
        let b = registry.create("b", frame("B"));
        assert!(b > a);
        assert_eq!(registry.len(), 2);
    }

    #[test]
    fn test_cancellation_is_monotonic() {
        let registry = MessageRegistry::new(Duration::from_secs(1));
        let id = registry.create("job", frame("Add"));
        assert!(registry.progress(id, 0.1, "start"));

        assert!(registry.stop(id));
        for i in 0..5 {
            assert!(!registry.progress(id, 0.2 * i as f64, "after stop"));
        }
        // A second stop changes nothing
        assert!(registry.stop(id));
        assert!(!registry.progress(id, 0.9, "still stopped"));
    }

    #[test]
    fn test_unknown_ids() {
        let registry = MessageRegistry::new(Duration::from_secs(1));
        assert!(!registry.progress(JobId(42), 0.5, "x"));
        assert!(!registry.stop(JobId(42)));
        assert!(!registry.add_cmds(JobId(42), vec![1]));
        assert!(registry.is_cancelled(JobId(42)));
    }

    #[test]
    fn test_stopping_parent_cancels_child() {
        let registry = MessageRegistry::new(Duration::from_secs(1));
        let parent = registry.create("parent", frame("Agent"));
        let child = registry.create_child(parent, "child", frame("Add"));
        registry.stop(parent);
        assert!(!registry.progress(child, 0.5, "nested"));
    }

    #[test]
    fn test_stack_guard_pops_on_drop() {
        let registry = MessageRegistry::new(Duration::from_secs(1));
        let id = registry.create("job", frame("Outer"));
        {
            let _outer = registry.push_frame(id, frame("Middle")).unwrap();
            {
                let inner = registry.push_frame(id, frame("Inner")).unwrap();
                assert_eq!(inner.depth(), 3);
                assert_eq!(registry.stack(id).last(), Some(&frame("Inner")));
            }
            assert_eq!(registry.stack(id).len(), 2);
        }
        assert_eq!(registry.stack(id), vec![frame("Outer")]);
        // The root frame stays put
        assert_eq!(registry.pop_frame(id), None);
    }

    #[test]
    fn test_flush_delivers_cmds_before_completion() {
        let registry = MessageRegistry::new(Duration::from_secs(60));
        let id = registry.create("job", frame("Add"));
        let events = Arc::new(Mutex::new(Vec::new()));

        let seen = events.clone();
        registry.on_progress(
            id,
            Box::new(move |_, batches| seen.lock().push(format!("cmds {}", batches.len()))),
        );
        let seen = events.clone();
        registry.on_complete(
            id,
            Box::new(move |report| seen.lock().push(format!("done {}", report.status()))),
        );

        registry.add_cmds(id, b"[1]".to_vec());
        registry.add_cmds(id, b"[2]".to_vec());
        registry.complete(id, JobOutcome::default());

        let report = registry.flush();
        assert_eq!(report.delivered, 2);
        assert_eq!(report.completed, 1);
        assert_eq!(*events.lock(), vec!["cmds 2".to_string(), "done ok".to_string()]);
        assert!(registry.is_empty());
    }

    #[test]
    fn test_progress_callback_is_reused_across_flushes() {
        let registry = MessageRegistry::new(Duration::from_secs(60));
        let id = registry.create("job", frame("Add"));
        let count = Arc::new(AtomicU64::new(0));
        let c = count.clone();
        registry.on_progress(
            id,
            Box::new(move |_, batches| {
                c.fetch_add(batches.len() as u64, Ordering::Relaxed);
            }),
        );

        registry.add_cmds(id, vec![1]);
        registry.flush();
        registry.add_cmds(id, vec![2]);
        registry.flush();
        assert_eq!(count.load(Ordering::Relaxed), 2);
    }

    #[test]
    fn test_completion_callback_may_create_jobs() {
        let registry = MessageRegistry::new(Duration::from_secs(60));
        let id = registry.create("job", frame("Add"));
        let r = registry.clone();
        registry.on_complete(
            id,
            Box::new(move |_| {
                r.create("follow-up", frame("Next"));
            }),
        );
        registry.complete(id, JobOutcome::default());
        registry.flush();
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_slow_jobs_promoted_once() {
        let registry = MessageRegistry::new(Duration::ZERO);
        registry.create("slow", frame("Add"));
        assert_eq!(registry.flush().promoted, 1);
        assert_eq!(registry.flush().promoted, 0);
        assert!(registry.snapshot()[0].shown);
    }

    #[test]
    fn test_violations_reach_the_report() {
        let registry = MessageRegistry::new(Duration::from_secs(60));
        let id = registry.create("job", frame("Add"));
        let got = Arc::new(Mutex::new(None));
        let g = got.clone();
        registry.on_complete(id, Box::new(move |report| *g.lock() = Some(report)));

        registry.record_violation(
            id,
            SandboxViolation {
                kind: "network".into(),
                detail: "dial example.com:80".into(),
            },
        );
        registry.complete(id, JobOutcome::failed("blocked"));
        registry.flush();

        let report = got.lock().take().unwrap();
        assert_eq!(report.violations.len(), 1);
        assert_eq!(report.status(), "error");
    }
}
