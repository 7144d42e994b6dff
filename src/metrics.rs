//! Prometheus metrics for the supervisor, registry and LLM loops
//!
//! Metrics live in an explicit [`Metrics`] value with its own registry,
//! created once at startup and handed to every component that records.

use prometheus::{
    Encoder, Histogram, HistogramOpts, HistogramVec, IntCounter, IntCounterVec, IntGauge, Opts,
    Registry, TextEncoder,
};

/// Every counter, gauge and histogram toolsmith records
pub struct Metrics {
    registry: Registry,

    // Wire
    pub wire_bytes_read: IntCounter,
    pub wire_bytes_written: IntCounter,
    pub rpc_requests: IntCounterVec,

    // Message registry
    pub jobs_active: IntGauge,
    pub jobs_completed: IntCounterVec,
    pub jobs_cancelled: IntCounter,
    pub sandbox_violations: IntCounterVec,

    // Supervisor
    pub compiles: IntCounterVec,
    pub compile_duration: Histogram,
    pub process_starts: IntCounterVec,

    // LLM loops
    pub generation_attempts: IntCounter,
    pub agent_iterations: Histogram,
    pub agent_tool_calls: IntCounterVec,
    pub llm_call_duration: HistogramVec,
}

impl Metrics {
    pub fn new() -> Result<Self, prometheus::Error> {
        let registry = Registry::new_custom(Some("toolsmith".to_string()), None)?;

        let wire_bytes_read = IntCounter::new("wire_bytes_read_total", "Bytes read by RPC servers")?;
        let wire_bytes_written =
            IntCounter::new("wire_bytes_written_total", "Bytes written by RPC servers")?;
        let rpc_requests = IntCounterVec::new(
            Opts::new("rpc_requests_total", "RPC requests handled, by verb"),
            &["verb"],
        )?;

        let jobs_active = IntGauge::new("jobs_active", "Jobs tracked by the message registry")?;
        let jobs_completed = IntCounterVec::new(
            Opts::new("jobs_completed_total", "Jobs whose completion was delivered"),
            &["status"],
        )?;
        let jobs_cancelled = IntCounter::new("jobs_cancelled_total", "Jobs stopped by request")?;
        let sandbox_violations = IntCounterVec::new(
            Opts::new("sandbox_violations_total", "Policy violations reported by guests"),
            &["kind"],
        )?;

        let compiles = IntCounterVec::new(
            Opts::new("compiles_total", "Unit compilations, by result"),
            &["result"],
        )?;
        let compile_duration = Histogram::with_opts(
            HistogramOpts::new("compile_duration_seconds", "Wall time of unit builds")
                .buckets(vec![0.5, 1.0, 2.5, 5.0, 10.0, 30.0, 60.0, 120.0]),
        )?;
        let process_starts = IntCounterVec::new(
            Opts::new("process_starts_total", "Guest process launches, by handshake outcome"),
            &["handshake"],
        )?;

        let generation_attempts =
            IntCounter::new("generation_attempts_total", "Code generation attempts")?;
        let agent_iterations = Histogram::with_opts(
            HistogramOpts::new("agent_iterations", "Iterations per agent run")
                .buckets(vec![1.0, 2.0, 3.0, 5.0, 8.0, 13.0, 21.0]),
        )?;
        let agent_tool_calls = IntCounterVec::new(
            Opts::new("agent_tool_calls_total", "Tool calls made by the agent loop"),
            &["tool"],
        )?;
        let llm_call_duration = HistogramVec::new(
            HistogramOpts::new("llm_call_duration_seconds", "Completion Service latency"),
            &["model"],
        )?;

        registry.register(Box::new(wire_bytes_read.clone()))?;
        registry.register(Box::new(wire_bytes_written.clone()))?;
        registry.register(Box::new(rpc_requests.clone()))?;
        registry.register(Box::new(jobs_active.clone()))?;
        registry.register(Box::new(jobs_completed.clone()))?;
        registry.register(Box::new(jobs_cancelled.clone()))?;
        registry.register(Box::new(sandbox_violations.clone()))?;
        registry.register(Box::new(compiles.clone()))?;
        registry.register(Box::new(compile_duration.clone()))?;
        registry.register(Box::new(process_starts.clone()))?;
        registry.register(Box::new(generation_attempts.clone()))?;
        registry.register(Box::new(agent_iterations.clone()))?;
        registry.register(Box::new(agent_tool_calls.clone()))?;
        registry.register(Box::new(llm_call_duration.clone()))?;

        Ok(Self {
            registry,
            wire_bytes_read,
            wire_bytes_written,
            rpc_requests,
            jobs_active,
            jobs_completed,
            jobs_cancelled,
            sandbox_violations,
            compiles,
            compile_duration,
            process_starts,
            generation_attempts,
            agent_iterations,
            agent_tool_calls,
            llm_call_duration,
        })
    }

    /// Prometheus text exposition of everything recorded so far
    pub fn render(&self) -> String {
        let mut buf = Vec::new();
        let encoder = TextEncoder::new();
        if let Err(e) = encoder.encode(&self.registry.gather(), &mut buf) {
            tracing::warn!(error = %e, "Failed to encode metrics");
        }
        String::from_utf8_lossy(&buf).into_owned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_render_includes_prefixed_names() {
        let metrics = Metrics::new().unwrap();
        metrics.rpc_requests.with_label_values(&["register"]).inc();
        metrics.wire_bytes_read.inc_by(16);

        let text = metrics.render();
        assert!(text.contains("toolsmith_rpc_requests_total{verb=\"register\"} 1"));
        assert!(text.contains("toolsmith_wire_bytes_read_total 16"));
    }

    #[test]
    fn test_independent_instances_do_not_collide() {
        let a = Metrics::new().unwrap();
        let b = Metrics::new().unwrap();
        a.jobs_cancelled.inc();
        assert_eq!(b.jobs_cancelled.get(), 0);
    }
}
