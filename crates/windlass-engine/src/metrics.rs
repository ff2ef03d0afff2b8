//! Observability metrics for the workflow engine.
//!
//! Metrics are exposed via the `metrics` crate facade and are designed to
//! support:
//!
//! - **Alerting**: SLO-based alerts on orchestration latency and failure rates
//! - **Dashboards**: Real-time visibility into queue depth and timer backlog
//! - **Debugging**: Correlating metrics with traces for root cause analysis
//!
//! ## Metrics Exported
//!
//! | Metric | Type | Labels | Description |
//! |--------|------|--------|-------------|
//! | `windlass_engine_workflow_runs_total` | Counter | `result` | Workflow runs by outcome |
//! | `windlass_engine_run_duration_seconds` | Histogram | - | Orchestration time per execution |
//! | `windlass_engine_commands_total` | Counter | `command` | Commands executed by kind |
//! | `windlass_engine_task_claims_total` | Counter | `result` | Task claim attempts |
//! | `windlass_engine_task_duration_seconds` | Histogram | `result` | Task handler duration |
//! | `windlass_engine_timer_fires_total` | Counter | `tier` | Timer deliveries by tier |
//! | `windlass_engine_router_deliveries_total` | Counter | `result` | Subscriber deliveries |
//! | `windlass_engine_transaction_attempts_total` | Counter | `result` | Transaction commit attempts |
//!
//! ## Integration
//!
//! ```rust,ignore
//! use metrics_exporter_prometheus::PrometheusBuilder;
//!
//! PrometheusBuilder::new()
//!     .with_http_listener(([0, 0, 0, 0], 9090))
//!     .install()
//!     .expect("failed to install Prometheus recorder");
//! ```

use std::time::{Duration, Instant};

/// Metric names as constants for consistency.
pub mod names {
    /// Counter: Workflow runs by outcome.
    pub const WORKFLOW_RUNS_TOTAL: &str = "windlass_engine_workflow_runs_total";
    /// Histogram: Orchestration time per execution in seconds.
    pub const RUN_DURATION_SECONDS: &str = "windlass_engine_run_duration_seconds";
    /// Counter: Commands executed by kind.
    pub const COMMANDS_TOTAL: &str = "windlass_engine_commands_total";
    /// Counter: Task claim attempts by result.
    pub const TASK_CLAIMS_TOTAL: &str = "windlass_engine_task_claims_total";
    /// Histogram: Task handler duration in seconds.
    pub const TASK_DURATION_SECONDS: &str = "windlass_engine_task_duration_seconds";
    /// Counter: Timer deliveries by tier.
    pub const TIMER_FIRES_TOTAL: &str = "windlass_engine_timer_fires_total";
    /// Counter: Event router deliveries by result.
    pub const ROUTER_DELIVERIES_TOTAL: &str = "windlass_engine_router_deliveries_total";
    /// Counter: Transaction commit attempts by result.
    pub const TRANSACTION_ATTEMPTS_TOTAL: &str = "windlass_engine_transaction_attempts_total";
    /// Counter: Executions started by source.
    pub const EXECUTIONS_STARTED_TOTAL: &str = "windlass_engine_executions_started_total";
}

/// Label keys used across metrics.
pub mod labels {
    /// Outcome of an operation (succeeded, failed, pending, rejected...).
    pub const RESULT: &str = "result";
    /// Command kind (start_task, start_timer, ...).
    pub const COMMAND: &str = "command";
    /// Timer tier (short, long).
    pub const TIER: &str = "tier";
    /// Start source (caller, child).
    pub const SOURCE: &str = "source";
}

/// RAII guard that reports elapsed time on drop.
///
/// ## Example
///
/// ```rust
/// use windlass_engine::metrics::TimingGuard;
///
/// let _guard = TimingGuard::new(|elapsed| {
///     metrics::histogram!("windlass_engine_run_duration_seconds")
///         .record(elapsed.as_secs_f64());
/// });
/// // ... timed work ...
/// ```
pub struct TimingGuard<F: FnMut(Duration)> {
    started_at: Instant,
    record: F,
}

impl<F: FnMut(Duration)> TimingGuard<F> {
    /// Creates a guard that invokes `record` with the elapsed time on drop.
    pub fn new(record: F) -> Self {
        Self {
            started_at: Instant::now(),
            record,
        }
    }
}

impl<F: FnMut(Duration)> Drop for TimingGuard<F> {
    fn drop(&mut self) {
        let elapsed = self.started_at.elapsed();
        (self.record)(elapsed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};

    #[test]
    fn timing_guard_records_on_drop() {
        let recorded = AtomicBool::new(false);
        {
            let _guard = TimingGuard::new(|_| {
                recorded.store(true, Ordering::SeqCst);
            });
        }
        assert!(recorded.load(Ordering::SeqCst));
    }
}
