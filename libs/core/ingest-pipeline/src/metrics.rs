//! Prometheus metrics and aggregate counters for the pipeline
//!
//! Per-message outcomes go to the `metrics` facade (exported by the Prometheus
//! recorder when installed); the same events also update [`PipelineStats`],
//! an in-process snapshot served by the admin router.

use crate::error::ErrorKind;
use crate::message::ProcessingState;
use metrics::{counter, gauge, histogram};
use metrics_exporter_prometheus::{BuildError, PrometheusBuilder, PrometheusHandle};
use once_cell::sync::OnceCell;
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

static PROMETHEUS_HANDLE: OnceCell<PrometheusHandle> = OnceCell::new();

/// Initialize Prometheus metrics
///
/// Call this once at startup. Subsequent calls return the same handle.
pub fn init_metrics() -> Result<&'static PrometheusHandle, BuildError> {
    PROMETHEUS_HANDLE.get_or_try_init(|| {
        let handle = PrometheusBuilder::new().install_recorder()?;
        describe_metrics();
        info!("Prometheus metrics initialized");
        Ok(handle)
    })
}

/// Get the Prometheus handle for rendering metrics
pub fn prometheus_handle() -> Option<&'static PrometheusHandle> {
    PROMETHEUS_HANDLE.get()
}

/// Render metrics in Prometheus format
pub fn render_metrics() -> String {
    prometheus_handle()
        .map(|h| h.render())
        .unwrap_or_else(|| "# Metrics not initialized\n".to_string())
}

fn describe_metrics() {
    use metrics::{describe_counter, describe_gauge, describe_histogram};

    describe_counter!("ingest_messages_total", "Messages by outcome");
    describe_counter!("ingest_failures_total", "Failed messages by step and error kind");
    describe_counter!("ingest_retries_total", "Retried capability calls by operation");
    describe_counter!("ingest_receive_errors_total", "Failed queue receive calls");
    describe_counter!("ingest_abandoned_total", "In-flight messages abandoned at shutdown");
    describe_counter!("ingest_visibility_extension_failures_total", "Failed visibility extensions");
    describe_gauge!("ingest_in_flight", "Messages currently being processed");
    describe_histogram!("ingest_message_duration_seconds", "Receive-to-terminal latency");
}

/// Atomic aggregate counters.
#[derive(Debug, Default)]
pub struct PipelineStats {
    received: AtomicU64,
    stored: AtomicU64,
    notified: AtomicU64,
    acknowledged: AtomicU64,
    failed: AtomicU64,
    abandoned: AtomicU64,
    receive_errors: AtomicU64,
    in_flight: AtomicU64,
    peak_in_flight: AtomicU64,
}

/// Point-in-time copy of [`PipelineStats`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct StatsSnapshot {
    pub received: u64,
    pub stored: u64,
    pub notified: u64,
    pub acknowledged: u64,
    pub failed: u64,
    pub abandoned: u64,
    pub receive_errors: u64,
    pub in_flight: u64,
    pub peak_in_flight: u64,
}

impl PipelineStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            received: self.received.load(Ordering::SeqCst),
            stored: self.stored.load(Ordering::SeqCst),
            notified: self.notified.load(Ordering::SeqCst),
            acknowledged: self.acknowledged.load(Ordering::SeqCst),
            failed: self.failed.load(Ordering::SeqCst),
            abandoned: self.abandoned.load(Ordering::SeqCst),
            receive_errors: self.receive_errors.load(Ordering::SeqCst),
            in_flight: self.in_flight.load(Ordering::SeqCst),
            peak_in_flight: self.peak_in_flight.load(Ordering::SeqCst),
        }
    }

    pub fn in_flight(&self) -> u64 {
        self.in_flight.load(Ordering::SeqCst)
    }

    /// Returns the new in-flight count.
    fn enter(&self) -> u64 {
        let current = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak_in_flight.fetch_max(current, Ordering::SeqCst);
        current
    }

    /// Returns the new in-flight count.
    fn leave(&self) -> u64 {
        let previous = self
            .in_flight
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| Some(n.saturating_sub(1)))
            .unwrap_or(0);
        previous.saturating_sub(1)
    }
}

/// Pipeline metrics helper
///
/// Cheap to clone; every clone shares the same [`PipelineStats`].
#[derive(Debug, Clone)]
pub struct PipelineMetrics {
    /// Queue identifier for labeling
    queue: String,
    stats: Arc<PipelineStats>,
}

impl PipelineMetrics {
    /// Create new PipelineMetrics
    pub fn new(queue: impl Into<String>) -> Self {
        Self {
            queue: queue.into(),
            stats: Arc::new(PipelineStats::new()),
        }
    }

    /// Metrics labelled with the queue name taken from `queue_url`.
    pub fn for_queue_url(queue_url: &str) -> Self {
        Self::new(queue_label(queue_url))
    }

    pub fn queue(&self) -> &str {
        &self.queue
    }

    /// Shared aggregate counters
    pub fn stats(&self) -> Arc<PipelineStats> {
        Arc::clone(&self.stats)
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        self.stats.snapshot()
    }

    /// Record a batch of messages being received
    pub fn messages_received(&self, count: usize) {
        self.stats
            .received
            .fetch_add(count as u64, Ordering::SeqCst);
        self.outcome("received", count as u64);
    }

    /// Record a state transition
    pub fn transition(&self, state: ProcessingState) {
        match state {
            ProcessingState::Stored => {
                self.stats.stored.fetch_add(1, Ordering::SeqCst);
            }
            ProcessingState::Notified => {
                self.stats.notified.fetch_add(1, Ordering::SeqCst);
            }
            ProcessingState::Acknowledged => {
                self.stats.acknowledged.fetch_add(1, Ordering::SeqCst);
            }
            ProcessingState::Received | ProcessingState::Failed => return,
        }
        self.outcome(state.as_ref(), 1);
    }

    /// Record a message ending in `Failed` during `step`
    pub fn failed(&self, step: &'static str, kind: ErrorKind) {
        self.stats.failed.fetch_add(1, Ordering::SeqCst);
        self.outcome(&kind.failure_label(), 1);
        counter!(
            "ingest_failures_total",
            "queue" => self.queue.clone(),
            "step" => step,
            "kind" => kind.as_ref().to_string()
        )
        .increment(1);
    }

    /// Record a retried capability call
    pub fn retried(&self, operation: &'static str) {
        counter!(
            "ingest_retries_total",
            "queue" => self.queue.clone(),
            "operation" => operation
        )
        .increment(1);
    }

    /// Record a failed receive call
    pub fn receive_error(&self) {
        self.stats.receive_errors.fetch_add(1, Ordering::SeqCst);
        counter!("ingest_receive_errors_total", "queue" => self.queue.clone()).increment(1);
    }

    /// Record a failed visibility extension
    pub fn visibility_extension_failed(&self) {
        counter!(
            "ingest_visibility_extension_failures_total",
            "queue" => self.queue.clone()
        )
        .increment(1);
    }

    /// Record in-flight messages abandoned at the shutdown deadline
    pub fn abandoned(&self, count: usize) {
        self.stats
            .abandoned
            .fetch_add(count as u64, Ordering::SeqCst);
        counter!("ingest_abandoned_total", "queue" => self.queue.clone())
            .increment(count as u64);
    }

    /// Record the receive-to-terminal latency of one message
    pub fn message_duration(&self, duration: Duration) {
        histogram!(
            "ingest_message_duration_seconds",
            "queue" => self.queue.clone()
        )
        .record(duration.as_secs_f64());
    }

    /// A message was dispatched onto the worker pool
    pub fn dispatched(&self) {
        let current = self.stats.enter();
        self.in_flight_gauge(current);
    }

    /// A dispatched message reached a terminal state or was dropped
    pub fn completed(&self) {
        let current = self.stats.leave();
        self.in_flight_gauge(current);
    }

    fn in_flight_gauge(&self, current: u64) {
        gauge!("ingest_in_flight", "queue" => self.queue.clone()).set(current as f64);
    }

    fn outcome(&self, outcome: &str, count: u64) {
        counter!(
            "ingest_messages_total",
            "queue" => self.queue.clone(),
            "outcome" => outcome.to_string()
        )
        .increment(count);
    }
}

/// Last path segment of a queue URL, so account ids stay out of labels.
///
/// `https://sqs.us-east-1.amazonaws.com/123456789012/ingest` becomes `ingest`.
pub fn queue_label(queue_url: &str) -> &str {
    let trimmed = queue_url.trim_end_matches('/');
    match trimmed.rsplit_once('/') {
        Some((_, name)) if !name.is_empty() => name,
        _ => trimmed,
    }
}
