// Private module declaration
mod server;

use prometheus::{
    HistogramOpts, HistogramVec, IntCounter, IntCounterVec,
    IntGauge, Opts, Registry,
};

// Re-export for public API
pub use server::start_metrics_server;

// ============================================================================
// Metrics Module - Prometheus metrics for the delivery pipeline
// ============================================================================
//
// Provides metrics for:
// - Event publication (throughput by event type)
// - Handler invocations (outcome, latency)
// - Retry attempts and outcomes
// - Dead letter statistics
// - Sequence check classifications
//
// Every dispatcher owns its own registry; nothing is registered globally.
// ============================================================================

pub struct Metrics {
    registry: Registry,

    // Publication Metrics
    pub events_published: IntCounterVec,

    // Handler Metrics
    pub handler_invocations: IntCounterVec,
    pub handler_duration: HistogramVec,

    // Retry Metrics
    pub retry_attempts_total: IntCounterVec,
    pub retry_success: IntCounterVec,
    pub retry_failure: IntCounterVec,
    pub active_retries: IntGauge,

    // DLQ Metrics
    pub dlq_messages_total: IntCounter,
    pub dlq_messages_by_event_type: IntCounterVec,

    // Sequence Metrics
    pub sequence_checks: IntCounterVec,
}

impl Metrics {
    pub fn new() -> anyhow::Result<Self> {
        let registry = Registry::new();

        let events_published = IntCounterVec::new(
            Opts::new("events_published_total", "Total events accepted by the dispatcher"),
            &["event_type"],
        )?;
        registry.register(Box::new(events_published.clone()))?;

        let handler_invocations = IntCounterVec::new(
            Opts::new("handler_invocations_total", "Total handler invocations by outcome"),
            &["handler", "outcome"],
        )?;
        registry.register(Box::new(handler_invocations.clone()))?;

        let handler_duration = HistogramVec::new(
            HistogramOpts::new("handler_duration_seconds", "Handler invocation duration")
                .buckets(vec![0.001, 0.005, 0.01, 0.05, 0.1, 0.5, 1.0, 5.0]),
            &["handler"],
        )?;
        registry.register(Box::new(handler_duration.clone()))?;

        let retry_attempts_total = IntCounterVec::new(
            Opts::new("retry_attempts_total", "Total scheduled retry attempts"),
            &["handler", "attempt"],
        )?;
        registry.register(Box::new(retry_attempts_total.clone()))?;

        let retry_success = IntCounterVec::new(
            Opts::new("retry_success_total", "Deliveries that succeeded after at least one retry"),
            &["handler"],
        )?;
        registry.register(Box::new(retry_success.clone()))?;

        let retry_failure = IntCounterVec::new(
            Opts::new("retry_failure_total", "Retry chains that ended without delivery"),
            &["handler"],
        )?;
        registry.register(Box::new(retry_failure.clone()))?;

        let active_retries = IntGauge::new(
            "active_retries",
            "Retry contexts currently tracked",
        )?;
        registry.register(Box::new(active_retries.clone()))?;

        let dlq_messages_total = IntCounter::new(
            "dlq_messages_total",
            "Total messages routed to the dead letter sink",
        )?;
        registry.register(Box::new(dlq_messages_total.clone()))?;

        let dlq_messages_by_event_type = IntCounterVec::new(
            Opts::new("dlq_messages_by_event_type", "DLQ messages by event type"),
            &["event_type"],
        )?;
        registry.register(Box::new(dlq_messages_by_event_type.clone()))?;

        let sequence_checks = IntCounterVec::new(
            Opts::new("sequence_checks_total", "Sequence classifications"),
            &["status"],
        )?;
        registry.register(Box::new(sequence_checks.clone()))?;

        Ok(Self {
            registry,
            events_published,
            handler_invocations,
            handler_duration,
            retry_attempts_total,
            retry_success,
            retry_failure,
            active_retries,
            dlq_messages_total,
            dlq_messages_by_event_type,
            sequence_checks,
        })
    }

    /// Get the Prometheus registry for exposing metrics via HTTP
    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    pub fn record_publish(&self, event_type: &str) {
        self.events_published.with_label_values(&[event_type]).inc();
    }

    /// Helper to record one handler invocation
    pub fn record_invocation(&self, handler: &str, duration_secs: f64, success: bool) {
        let outcome = if success { "success" } else { "failure" };
        self.handler_invocations.with_label_values(&[handler, outcome]).inc();
        self.handler_duration.with_label_values(&[handler]).observe(duration_secs);
    }

    /// Helper to record retry attempt
    pub fn record_retry_attempt(&self, handler: &str, attempt: u32) {
        let attempt = attempt.to_string();
        self.retry_attempts_total.with_label_values(&[handler, attempt.as_str()]).inc();
    }

    /// Helper to record retry outcome
    pub fn record_retry_outcome(&self, handler: &str, success: bool) {
        if success {
            self.retry_success.with_label_values(&[handler]).inc();
        } else {
            self.retry_failure.with_label_values(&[handler]).inc();
        }
    }

    pub fn set_active_retries(&self, count: usize) {
        self.active_retries.set(count as i64);
    }

    /// Helper to record DLQ message
    pub fn record_dlq_message(&self, event_type: &str) {
        self.dlq_messages_total.inc();
        self.dlq_messages_by_event_type.with_label_values(&[event_type]).inc();
    }

    pub fn record_sequence_check(&self, status: &str) {
        self.sequence_checks.with_label_values(&[status]).inc();
    }
}
