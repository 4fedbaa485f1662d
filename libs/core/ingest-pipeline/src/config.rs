//! Pipeline configuration
//!
//! `PipelineConfig` is read once at startup and immutable afterwards. The
//! three destinations have no defaults; every tuning knob does.

use crate::retry::RetryPolicy;
use core_config::{env_parse, env_required, ConfigError, FromEnv};
use std::time::Duration;

/// Configuration for the ingestion pipeline
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PipelineConfig {
    /// Source queue URL
    pub queue_url: String,

    /// Storage bucket for message payloads
    pub storage_bucket: String,

    /// Topic that receives delivery notifications
    pub notification_topic: String,

    /// Number of concurrent receive loops
    pub consumers: usize,

    /// Global cap on messages being processed at once
    pub max_in_flight: usize,

    /// Maximum messages per receive call
    pub batch_size: usize,

    /// Long-poll wait per receive call
    pub poll_timeout: Duration,

    /// Visibility window kept alive by the heartbeat (zero disables it)
    pub visibility_timeout: Duration,

    /// How long shutdown waits for in-flight messages
    pub shutdown_grace: Duration,

    /// Attempt ceiling for storage writes and notifications
    pub retry_max_attempts: u32,

    /// Backoff before the first retry
    pub retry_base_delay: Duration,

    /// Upper bound for any single backoff
    pub retry_max_delay: Duration,

    /// Attempt ceiling for local delete retries
    pub delete_attempts: u32,
}

impl PipelineConfig {
    /// Create a config with default tuning for the given destinations
    pub fn new(
        queue_url: impl Into<String>,
        storage_bucket: impl Into<String>,
        notification_topic: impl Into<String>,
    ) -> Self {
        Self {
            queue_url: queue_url.into(),
            storage_bucket: storage_bucket.into(),
            notification_topic: notification_topic.into(),
            consumers: 1,
            max_in_flight: 10,
            batch_size: 10,
            poll_timeout: Duration::from_secs(20),
            visibility_timeout: Duration::from_secs(30),
            shutdown_grace: Duration::from_secs(30),
            retry_max_attempts: 3,
            retry_base_delay: Duration::from_millis(200),
            retry_max_delay: Duration::from_millis(5000),
            delete_attempts: 3,
        }
    }

    /// Set the number of receive loops
    pub fn with_consumers(mut self, consumers: usize) -> Self {
        self.consumers = consumers;
        self
    }

    /// Set the global in-flight cap
    pub fn with_max_in_flight(mut self, max_in_flight: usize) -> Self {
        self.max_in_flight = max_in_flight;
        self
    }

    /// Set the batch size
    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size;
        self
    }

    /// Set the long-poll wait
    pub fn with_poll_timeout(mut self, poll_timeout: Duration) -> Self {
        self.poll_timeout = poll_timeout;
        self
    }

    /// Set the heartbeat visibility window
    pub fn with_visibility_timeout(mut self, visibility_timeout: Duration) -> Self {
        self.visibility_timeout = visibility_timeout;
        self
    }

    /// Set the shutdown drain deadline
    pub fn with_shutdown_grace(mut self, shutdown_grace: Duration) -> Self {
        self.shutdown_grace = shutdown_grace;
        self
    }

    /// Set the retry policy for storage and notification calls
    pub fn with_retry(mut self, max_attempts: u32, base_delay: Duration, max_delay: Duration) -> Self {
        self.retry_max_attempts = max_attempts;
        self.retry_base_delay = base_delay;
        self.retry_max_delay = max_delay;
        self
    }

    /// Set the local delete attempt ceiling
    pub fn with_delete_attempts(mut self, delete_attempts: u32) -> Self {
        self.delete_attempts = delete_attempts;
        self
    }

    /// Retry policy shared by the storage writer and notification publisher
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::new(
            self.retry_max_attempts,
            self.retry_base_delay,
            self.retry_max_delay,
        )
    }

    /// Retry policy for queue deletes
    pub fn delete_retry_policy(&self) -> RetryPolicy {
        self.retry_policy().with_max_attempts(self.delete_attempts)
    }

    /// Reject blank destinations and zero-sized limits
    pub fn validate(&self) -> Result<(), ConfigError> {
        for (key, value) in [
            ("INGEST_QUEUE_URL", &self.queue_url),
            ("INGEST_STORAGE_BUCKET", &self.storage_bucket),
            ("INGEST_NOTIFICATION_TOPIC", &self.notification_topic),
        ] {
            if value.trim().is_empty() {
                return Err(ConfigError::MissingEnvVar(key.to_string()));
            }
        }

        for (key, value) in [
            ("INGEST_CONSUMERS", self.consumers),
            ("INGEST_MAX_IN_FLIGHT", self.max_in_flight),
            ("INGEST_BATCH_SIZE", self.batch_size),
            ("INGEST_RETRY_MAX_ATTEMPTS", self.retry_max_attempts as usize),
            ("INGEST_DELETE_ATTEMPTS", self.delete_attempts as usize),
        ] {
            if value == 0 {
                return Err(invalid(key, "must be at least 1"));
            }
        }

        if self.retry_base_delay > self.retry_max_delay {
            return Err(invalid(
                "INGEST_RETRY_BASE_DELAY_MS",
                "must not exceed INGEST_RETRY_MAX_DELAY_MS",
            ));
        }

        Ok(())
    }
}

fn invalid(key: &str, details: &str) -> ConfigError {
    ConfigError::Invalid {
        key: key.to_string(),
        details: details.to_string(),
    }
}

impl FromEnv for PipelineConfig {
    /// Requires INGEST_QUEUE_URL, INGEST_STORAGE_BUCKET and
    /// INGEST_NOTIFICATION_TOPIC; everything else has a default.
    fn from_env() -> Result<Self, ConfigError> {
        let defaults = Self::new(
            env_required("INGEST_QUEUE_URL")?,
            env_required("INGEST_STORAGE_BUCKET")?,
            env_required("INGEST_NOTIFICATION_TOPIC")?,
        );

        let secs = |key: &str, default: Duration| -> Result<Duration, ConfigError> {
            env_parse(key, default.as_secs()).map(Duration::from_secs)
        };
        let millis = |key: &str, default: Duration| -> Result<Duration, ConfigError> {
            env_parse(key, default.as_millis() as u64).map(Duration::from_millis)
        };

        let config = Self {
            consumers: env_parse("INGEST_CONSUMERS", defaults.consumers)?,
            max_in_flight: env_parse("INGEST_MAX_IN_FLIGHT", defaults.max_in_flight)?,
            batch_size: env_parse("INGEST_BATCH_SIZE", defaults.batch_size)?,
            poll_timeout: secs("INGEST_POLL_TIMEOUT_SECS", defaults.poll_timeout)?,
            visibility_timeout: secs(
                "INGEST_VISIBILITY_TIMEOUT_SECS",
                defaults.visibility_timeout,
            )?,
            shutdown_grace: secs("INGEST_SHUTDOWN_GRACE_SECS", defaults.shutdown_grace)?,
            retry_max_attempts: env_parse(
                "INGEST_RETRY_MAX_ATTEMPTS",
                defaults.retry_max_attempts,
            )?,
            retry_base_delay: millis("INGEST_RETRY_BASE_DELAY_MS", defaults.retry_base_delay)?,
            retry_max_delay: millis("INGEST_RETRY_MAX_DELAY_MS", defaults.retry_max_delay)?,
            delete_attempts: env_parse("INGEST_DELETE_ATTEMPTS", defaults.delete_attempts)?,
            ..defaults
        };

        config.validate()?;
        Ok(config)
    }
}
