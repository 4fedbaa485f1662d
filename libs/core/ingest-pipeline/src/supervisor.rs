//! Pipeline supervisor
//!
//! Wires the capabilities into consumers, a processor and a shared worker
//! pool, runs N receive loops until shutdown and reports what happened.

use crate::config::PipelineConfig;
use crate::consumer::{shutdown_requested, ConsumerReport, QueueConsumer};
use crate::error::PipelineResult;
use crate::metrics::{PipelineMetrics, StatsSnapshot};
use crate::notification::{NotificationPublisher, Publisher};
use crate::pool::WorkerPool;
use crate::processor::MessageProcessor;
use crate::queue::QueueClient;
use crate::storage::{ObjectStore, StorageWriter};
use serde::Serialize;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Duration;
use strum::{AsRefStr, Display};
use tokio::sync::watch;
use tokio::task::JoinSet;
use tracing::{error, info};

/// Lifecycle phase, exposed through the readiness probe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Display, AsRefStr)]
#[strum(serialize_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    Starting,
    Running,
    Draining,
    Stopped,
}

impl Phase {
    fn from_u8(value: u8) -> Self {
        match value {
            1 => Phase::Running,
            2 => Phase::Draining,
            3 => Phase::Stopped,
            _ => Phase::Starting,
        }
    }

    fn as_u8(self) -> u8 {
        match self {
            Phase::Starting => 0,
            Phase::Running => 1,
            Phase::Draining => 2,
            Phase::Stopped => 3,
        }
    }
}

/// Shared, lock-free view of the supervisor's phase.
#[derive(Debug, Default)]
pub struct SupervisorState {
    phase: AtomicU8,
}

impl SupervisorState {
    pub fn phase(&self) -> Phase {
        Phase::from_u8(self.phase.load(Ordering::SeqCst))
    }

    pub fn set(&self, phase: Phase) {
        self.phase.store(phase.as_u8(), Ordering::SeqCst);
    }

    /// Receiving and processing normally
    pub fn is_ready(&self) -> bool {
        self.phase() == Phase::Running
    }
}

/// Totals over all consumers of one supervisor run.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SupervisorReport {
    pub received: u64,
    pub acknowledged: u64,
    pub failed: u64,
    pub receive_errors: u64,
    pub abandoned: Vec<String>,
}

impl SupervisorReport {
    fn merge(&mut self, report: ConsumerReport) {
        self.received += report.received;
        self.acknowledged += report.acknowledged;
        self.failed += report.failed;
        self.receive_errors += report.receive_errors;
        self.abandoned.extend(report.abandoned);
    }
}

/// Owns the consumer lifecycle and the shared worker pool.
pub struct Supervisor {
    consumers: usize,
    shutdown_grace: Duration,
    consumer: Arc<QueueConsumer>,
    processor: Arc<MessageProcessor>,
    pool: Arc<WorkerPool>,
    metrics: PipelineMetrics,
    state: Arc<SupervisorState>,
}

impl Supervisor {
    /// Build the pipeline from explicit capabilities.
    pub fn new(
        config: &PipelineConfig,
        queue: Arc<dyn QueueClient>,
        store: Arc<dyn ObjectStore>,
        publisher: Arc<dyn Publisher>,
    ) -> Self {
        let metrics = PipelineMetrics::for_queue_url(&config.queue_url);
        let retry = config.retry_policy();

        let consumer = Arc::new(
            QueueConsumer::new(queue, metrics.clone())
                .with_batch_size(config.batch_size)
                .with_poll_timeout(config.poll_timeout)
                .with_delete_retry(config.delete_retry_policy()),
        );
        let processor = MessageProcessor::new(
            StorageWriter::new(store, retry.clone(), metrics.clone()),
            NotificationPublisher::new(
                publisher,
                config.notification_topic.clone(),
                retry,
                metrics.clone(),
            ),
            Arc::clone(&consumer),
            metrics.clone(),
        )
        .with_visibility_heartbeat(config.visibility_timeout);

        Self {
            consumers: config.consumers.max(1),
            shutdown_grace: config.shutdown_grace,
            consumer,
            processor: Arc::new(processor),
            pool: Arc::new(WorkerPool::new(config.max_in_flight, metrics.clone())),
            metrics,
            state: Arc::new(SupervisorState::default()),
        }
    }

    pub fn metrics(&self) -> &PipelineMetrics {
        &self.metrics
    }

    pub fn stats(&self) -> StatsSnapshot {
        self.metrics.snapshot()
    }

    pub fn state(&self) -> Arc<SupervisorState> {
        Arc::clone(&self.state)
    }

    pub fn pool(&self) -> &WorkerPool {
        &self.pool
    }

    /// Run all consumers until `shutdown` flips to `true`, then drain.
    pub async fn run(&self, shutdown: watch::Receiver<bool>) -> PipelineResult<SupervisorReport> {
        info!(
            consumers = self.consumers,
            max_in_flight = self.pool.capacity(),
            batch_size = self.consumer.batch_size(),
            shutdown_grace_secs = self.shutdown_grace.as_secs(),
            "Starting supervisor"
        );

        let mut workers = JoinSet::new();
        for index in 0..self.consumers {
            workers.spawn(Arc::clone(&self.consumer).run(
                index,
                Arc::clone(&self.processor),
                Arc::clone(&self.pool),
                shutdown.clone(),
                self.shutdown_grace,
            ));
        }
        self.state.set(Phase::Running);

        let mut report = SupervisorReport::default();
        let mut signal = shutdown.clone();
        let mut draining = false;

        loop {
            tokio::select! {
                _ = shutdown_requested(&mut signal), if !draining => {
                    draining = true;
                    self.state.set(Phase::Draining);
                    info!("Supervisor draining");
                }
                joined = workers.join_next() => match joined {
                    Some(Ok(consumer_report)) => report.merge(consumer_report),
                    Some(Err(e)) => error!(error = %e, "Consumer task failed"),
                    None => break,
                },
            }
        }

        self.state.set(Phase::Stopped);
        info!(
            received = report.received,
            acknowledged = report.acknowledged,
            failed = report.failed,
            abandoned = report.abandoned.len(),
            "Supervisor stopped"
        );
        Ok(report)
    }

    /// Receive one batch, process it on the pool and wait for completion.
    pub async fn run_once(&self) -> PipelineResult<SupervisorReport> {
        self.state.set(Phase::Running);
        let result = self
            .consumer
            .run_once(Arc::clone(&self.processor), Arc::clone(&self.pool))
            .await;
        self.state.set(Phase::Stopped);

        let mut report = SupervisorReport::default();
        report.merge(result?);
        info!(
            received = report.received,
            acknowledged = report.acknowledged,
            failed = report.failed,
            "Single batch processed"
        );
        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::{InMemoryObjectStore, InMemoryPublisher, InMemoryQueue};

    fn supervisor(config: &PipelineConfig) -> Supervisor {
        Supervisor::new(
            config,
            Arc::new(InMemoryQueue::default()),
            Arc::new(InMemoryObjectStore::new()),
            Arc::new(InMemoryPublisher::new()),
        )
    }

    #[test]
    fn test_phase_roundtrip() {
        let state = SupervisorState::default();
        assert_eq!(state.phase(), Phase::Starting);
        assert!(!state.is_ready());

        for phase in [Phase::Running, Phase::Draining, Phase::Stopped, Phase::Starting] {
            state.set(phase);
            assert_eq!(state.phase(), phase);
        }

        state.set(Phase::Running);
        assert!(state.is_ready());
    }

    #[test]
    fn test_phase_labels() {
        assert_eq!(Phase::Draining.to_string(), "draining");
        assert_eq!(serde_json::to_value(Phase::Running).unwrap(), "running");
    }

    #[test]
    fn test_report_merge_sums_consumers() {
        let mut report = SupervisorReport::default();
        report.merge(ConsumerReport {
            received: 3,
            acknowledged: 2,
            failed: 1,
            receive_errors: 0,
            abandoned: vec![],
        });
        report.merge(ConsumerReport {
            received: 2,
            acknowledged: 1,
            failed: 0,
            receive_errors: 4,
            abandoned: vec!["x".to_string()],
        });

        assert_eq!(report.received, 5);
        assert_eq!(report.acknowledged, 3);
        assert_eq!(report.failed, 1);
        assert_eq!(report.receive_errors, 4);
        assert_eq!(report.abandoned, vec!["x".to_string()]);
    }

    #[test]
    fn test_new_applies_config() {
        let config = PipelineConfig::new("q", "b", "t")
            .with_consumers(0)
            .with_max_in_flight(4);
        let supervisor = supervisor(&config);

        assert_eq!(supervisor.consumers, 1);
        assert_eq!(supervisor.pool().capacity(), 4);
        assert_eq!(supervisor.state().phase(), Phase::Starting);
    }

    #[test]
    fn test_metrics_labelled_by_queue_name() {
        let config = PipelineConfig::new(
            "https://sqs.us-east-1.amazonaws.com/123456789012/ingest-queue",
            "b",
            "t",
        );
        assert_eq!(supervisor(&config).metrics().queue(), "ingest-queue");
    }

    #[tokio::test(start_paused = true)]
    async fn test_run_stops_on_dropped_sender() {
        let supervisor = supervisor(&PipelineConfig::new("q", "b", "t").with_consumers(3));
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        drop(shutdown_tx);

        let report = supervisor.run(shutdown_rx).await.unwrap();

        assert_eq!(report, SupervisorReport::default());
        assert_eq!(supervisor.state().phase(), Phase::Stopped);
    }
}
