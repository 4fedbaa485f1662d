//! Queue-to-storage ingestion pipeline
//!
//! Consumes messages from a durable at-least-once queue, writes each payload
//! to object storage under a key derived from the message ID, publishes a
//! notification event and deletes the message from the queue.
//!
//! ## Features
//!
//! - **Idempotent writes**: redeliveries overwrite the same `message-<id>.txt` object
//! - **Bounded concurrency**: one worker pool shared by all consumers caps in-flight messages
//! - **Classified retries**: transient failures back off exponentially, permanent ones fail fast
//! - **Graceful shutdown**: stop receiving, drain in-flight work up to a deadline
//! - **Visibility heartbeat**: long writes keep their receipt alive
//! - **Prometheus metrics** and K8s-ready health endpoints
//!
//! ## Example
//!
//! ```ignore
//! use ingest_pipeline::{PipelineConfig, Supervisor};
//! use ingest_pipeline::memory::{InMemoryObjectStore, InMemoryPublisher, InMemoryQueue};
//!
//! let config = PipelineConfig::new("queue", "bucket", "topic").with_max_in_flight(4);
//! let queue = Arc::new(InMemoryQueue::default());
//! queue.send_with_id("42", "hello");
//!
//! let supervisor = Supervisor::new(
//!     &config,
//!     queue,
//!     Arc::new(InMemoryObjectStore::new()),
//!     Arc::new(InMemoryPublisher::new()),
//! );
//! let report = supervisor.run(shutdown_rx).await?;
//! ```

#[cfg(feature = "aws")]
pub mod aws;
mod config;
mod consumer;
mod error;
mod health;
pub mod memory;
mod message;
pub mod metrics;
mod notification;
mod pool;
mod processor;
mod queue;
mod retry;
mod storage;
mod supervisor;

// Re-export main types
pub use config::PipelineConfig;
pub use consumer::{ConsumerReport, QueueConsumer};
pub use error::{ErrorKind, PipelineError, PipelineResult};
pub use health::{health_router, HealthResponse, HealthState};
pub use message::{
    DeliveryStatus, Message, NotificationEvent, ProcessingOutcome, ProcessingState, ReceiptToken,
    StorageKey, MAX_KEY_LEN,
};
pub use metrics::{init_metrics, PipelineMetrics, PipelineStats, StatsSnapshot};
pub use notification::{NotificationPublisher, Publisher};
pub use pool::{DrainReport, InFlightGuard, InFlightTasks, Reservation, WorkerPool};
pub use processor::MessageProcessor;
pub use queue::QueueClient;
pub use retry::RetryPolicy;
pub use storage::{ObjectStore, StorageWriter};
pub use supervisor::{Phase, Supervisor, SupervisorReport, SupervisorState};
