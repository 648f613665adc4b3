//! Observability infrastructure for the beat
//!
//! Provides:
//! - Prometheus metrics (collection latency, publish/drop counters, retry queue, agent state)
//! - Structured lifecycle logging with tracing

use crate::state::AgentState;
use prometheus::{
    register_histogram, register_int_counter, register_int_counter_vec, register_int_gauge,
    Histogram, IntCounter, IntCounterVec, IntGauge,
};
use std::sync::OnceLock;
use tracing::{error, info, warn};

/// Default histogram buckets for latency measurements (in seconds)
const LATENCY_BUCKETS: &[f64] = &[
    0.0001, 0.0005, 0.001, 0.0025, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0,
];

/// Reasons an event can be dropped, used as the `reason` label
pub mod drop_reasons {
    pub const INVALID: &str = "invalid";
    pub const BACKPRESSURE: &str = "backpressure";
    pub const RETRIES_EXHAUSTED: &str = "retries_exhausted";
    pub const DRAIN: &str = "drain";
    pub const FATAL: &str = "fatal";
}

/// Global metrics instance (registered once)
static GLOBAL_METRICS: OnceLock<BeatMetricsInner> = OnceLock::new();

struct BeatMetricsInner {
    collection_latency_seconds: Histogram,
    collection_errors: IntCounterVec,
    events_published: IntCounter,
    events_dropped: IntCounterVec,
    batches_sent: IntCounter,
    send_errors: IntCounterVec,
    retry_queue_batches: IntGauge,
    retry_queue_bytes: IntGauge,
    agent_state: IntGauge,
}

impl BeatMetricsInner {
    fn new() -> Self {
        Self {
            collection_latency_seconds: register_histogram!(
                "hwbeat_collection_latency_seconds",
                "Time spent polling a single data source",
                LATENCY_BUCKETS.to_vec()
            )
            .expect("Failed to register collection_latency_seconds"),

            collection_errors: register_int_counter_vec!(
                "hwbeat_collection_errors_total",
                "Total number of failed polls",
                &["collector", "kind"]
            )
            .expect("Failed to register collection_errors"),

            events_published: register_int_counter!(
                "hwbeat_events_published_total",
                "Total number of events acknowledged by the output"
            )
            .expect("Failed to register events_published"),

            events_dropped: register_int_counter_vec!(
                "hwbeat_events_dropped_total",
                "Total number of events discarded before delivery",
                &["reason"]
            )
            .expect("Failed to register events_dropped"),

            batches_sent: register_int_counter!(
                "hwbeat_batches_sent_total",
                "Total number of batches delivered"
            )
            .expect("Failed to register batches_sent"),

            send_errors: register_int_counter_vec!(
                "hwbeat_send_errors_total",
                "Total number of failed batch sends",
                &["kind"]
            )
            .expect("Failed to register send_errors"),

            retry_queue_batches: register_int_gauge!(
                "hwbeat_retry_queue_batches",
                "Number of batches waiting for a retry"
            )
            .expect("Failed to register retry_queue_batches"),

            retry_queue_bytes: register_int_gauge!(
                "hwbeat_retry_queue_bytes",
                "Approximate size of the retry queue in bytes"
            )
            .expect("Failed to register retry_queue_bytes"),

            agent_state: register_int_gauge!(
                "hwbeat_agent_state",
                "Lifecycle state (0 starting, 1 running, 2 draining, 3 stopped)"
            )
            .expect("Failed to register agent_state"),
        }
    }
}

/// Beat metrics for Prometheus exposition
///
/// This is a lightweight handle to the global metrics instance.
/// Multiple clones share the same underlying metrics.
#[derive(Clone)]
pub struct BeatMetrics {
    _private: (),
}

impl Default for BeatMetrics {
    fn default() -> Self {
        Self::new()
    }
}

impl BeatMetrics {
    /// Create a new metrics handle (initializes global metrics if needed)
    pub fn new() -> Self {
        GLOBAL_METRICS.get_or_init(BeatMetricsInner::new);
        Self { _private: () }
    }

    fn inner(&self) -> &BeatMetricsInner {
        GLOBAL_METRICS.get_or_init(BeatMetricsInner::new)
    }

    pub fn observe_collection_latency(&self, duration_secs: f64) {
        self.inner().collection_latency_seconds.observe(duration_secs);
    }

    pub fn inc_collection_errors(&self, collector: &str, kind: &str) {
        self.inner()
            .collection_errors
            .with_label_values(&[collector, kind])
            .inc();
    }

    pub fn add_events_published(&self, count: u64) {
        self.inner().events_published.inc_by(count);
    }

    pub fn add_events_dropped(&self, reason: &str, count: u64) {
        self.inner()
            .events_dropped
            .with_label_values(&[reason])
            .inc_by(count);
    }

    pub fn inc_batches_sent(&self) {
        self.inner().batches_sent.inc();
    }

    pub fn inc_send_errors(&self, kind: &str) {
        self.inner().send_errors.with_label_values(&[kind]).inc();
    }

    pub fn set_retry_queue(&self, batches: usize, bytes: usize) {
        self.inner().retry_queue_batches.set(batches as i64);
        self.inner().retry_queue_bytes.set(bytes as i64);
    }

    pub fn set_agent_state(&self, state: AgentState) {
        self.inner().agent_state.set(state.as_code());
    }
}

/// Structured logger for lifecycle events
#[derive(Clone)]
pub struct StructuredLogger {
    beat: String,
    host: String,
}

impl StructuredLogger {
    pub fn new(beat: impl Into<String>, host: impl Into<String>) -> Self {
        Self {
            beat: beat.into(),
            host: host.into(),
        }
    }

    pub fn log_startup(&self, version: &str, output: &str) {
        info!(
            event = "agent_started",
            host = %self.host,
            agent_version = %version,
            output = %output,
            "Starting {}",
            self.beat
        );
    }

    /// The readiness line external harnesses wait for
    pub fn log_ready(&self, collectors: &[String]) {
        info!(
            event = "agent_ready",
            host = %self.host,
            collectors = ?collectors,
            "{} is running! Hit CTRL-C to stop it.",
            self.beat
        );
    }

    pub fn log_shutdown(&self, reason: &str) {
        info!(
            event = "agent_shutdown",
            host = %self.host,
            reason = %reason,
            "{} shutting down",
            self.beat
        );
    }

    pub fn log_fatal(&self, error: &str) {
        error!(
            event = "agent_fatal",
            host = %self.host,
            error = %error,
            "{} hit a fatal error, stopping",
            self.beat
        );
    }

    pub fn log_batch_dropped(&self, sequence: u64, events: usize, reason: &str) {
        warn!(
            event = "batch_dropped",
            host = %self.host,
            sequence = sequence,
            events = events,
            reason = %reason,
            "Dropped batch"
        );
    }

    pub fn log_drain_complete(&self, published: u64, dropped: u64, timed_out: bool) {
        if timed_out {
            warn!(
                event = "drain_complete",
                host = %self.host,
                published = published,
                dropped = dropped,
                timed_out = true,
                "Drain timed out, pending events discarded"
            );
        } else {
            info!(
                event = "drain_complete",
                host = %self.host,
                published = published,
                dropped = dropped,
                timed_out = false,
                "Drain complete"
            );
        }
    }

    pub fn log_stopped(&self, exit_code: i32) {
        info!(
            event = "agent_stopped",
            host = %self.host,
            exit_code = exit_code,
            "{} stopped",
            self.beat
        );
    }
}
