use tracing::info;

use crate::result::ExecutionResult;

pub const EXECUTION_SECONDS: &str = "sandbox.execution.seconds";
pub const CLEANUP_FAILURES: &str = "sandbox.cleanup.failures";

/// Fire-and-forget metric sink.
///
/// Implementations must not block for long and must swallow their own
/// failures: nothing a sink does may change an execution outcome.
pub trait MetricsSink: Send + Sync {
    fn record_metric(&self, name: &str, value: f64, tags: &[(&str, &str)]);
}

/// Default sink: one `tracing` event per metric.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingMetrics;

impl MetricsSink for TracingMetrics {
    fn record_metric(&self, name: &str, value: f64, tags: &[(&str, &str)]) {
        let tags = tags
            .iter()
            .map(|(k, v)| format!("{k}={v}"))
            .collect::<Vec<_>>()
            .join(",");
        info!(metric = name, value, tags = %tags, "metric");
    }
}

/// Record the per-call metrics every backend emits.
pub fn record_execution(sink: &dyn MetricsSink, backend: &str, result: &ExecutionResult) {
    sink.record_metric(
        EXECUTION_SECONDS,
        result.execution_time(),
        &[("backend", backend), ("outcome", result.outcome())],
    );
}

pub fn record_cleanup_failure(sink: &dyn MetricsSink, backend: &str) {
    sink.record_metric(CLEANUP_FAILURES, 1.0, &[("backend", backend)]);
}
