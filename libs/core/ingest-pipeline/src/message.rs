//! Pipeline data model
//!
//! A received [`Message`], the deterministic [`StorageKey`] derived from it,
//! the [`NotificationEvent`] published after a successful write and the
//! transient [`ProcessingOutcome`] of one delivery attempt.

use crate::error::{ErrorKind, PipelineError, PipelineResult};
use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use strum::{AsRefStr, Display};

/// Longest key accepted by the storage writer, in bytes.
pub const MAX_KEY_LEN: usize = 1024;

/// Opaque handle identifying one delivery attempt of a message.
///
/// Only the holder of the token may delete the message or extend its
/// visibility.
#[derive(Clone, PartialEq, Eq, Hash)]
pub struct ReceiptToken(String);

impl ReceiptToken {
    pub fn new(token: impl Into<String>) -> Self {
        Self(token.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

// Receipt handles are credentials for a delivery attempt; keep them out of logs.
impl fmt::Debug for ReceiptToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let prefix: String = self.0.chars().take(8).collect();
        write!(f, "ReceiptToken({}…)", prefix)
    }
}

/// A message received from the source queue.
#[derive(Debug, Clone)]
pub struct Message {
    /// Queue-assigned message ID, stable across redeliveries
    pub id: String,

    /// Raw payload
    pub body: Bytes,

    /// Receipt for this delivery attempt
    pub receipt: ReceiptToken,

    /// Number of times the queue has delivered this message
    pub receive_count: u32,

    /// When the message was originally enqueued
    pub enqueued_at: DateTime<Utc>,
}

impl Message {
    /// Create a first-delivery message enqueued now
    pub fn new(id: impl Into<String>, body: impl Into<Bytes>, receipt: ReceiptToken) -> Self {
        Self {
            id: id.into(),
            body: body.into(),
            receipt,
            receive_count: 1,
            enqueued_at: Utc::now(),
        }
    }

    /// Set the receive count
    pub fn with_receive_count(mut self, receive_count: u32) -> Self {
        self.receive_count = receive_count;
        self
    }

    /// Set the enqueue time
    pub fn with_enqueued_at(mut self, enqueued_at: DateTime<Utc>) -> Self {
        self.enqueued_at = enqueued_at;
        self
    }

    /// Storage key for this message
    pub fn storage_key(&self) -> StorageKey {
        StorageKey::for_message(&self.id)
    }

    /// Check if this is a redelivery
    pub fn is_redelivery(&self) -> bool {
        self.receive_count > 1
    }

    /// How long ago the message was enqueued
    pub fn age(&self) -> chrono::Duration {
        Utc::now() - self.enqueued_at
    }
}

/// Deterministic object key derived from a message ID.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct StorageKey(String);

impl StorageKey {
    /// `message-<id>.txt`
    pub fn for_message(message_id: &str) -> Self {
        Self(format!("message-{}.txt", message_id))
    }

    /// Wrap an arbitrary key. Use [`StorageKey::validate`] before writing.
    pub fn from_raw(key: impl Into<String>) -> Self {
        Self(key.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Reject keys no object store would accept.
    pub fn validate(&self) -> PipelineResult<()> {
        if self.0.is_empty() {
            return Err(PipelineError::permanent("storage key is empty"));
        }
        if self.0.len() > MAX_KEY_LEN {
            return Err(PipelineError::permanent(format!(
                "storage key is {} bytes, limit is {}",
                self.0.len(),
                MAX_KEY_LEN
            )));
        }
        if self.0.chars().any(char::is_control) {
            return Err(PipelineError::permanent(
                "storage key contains control characters",
            ));
        }
        Ok(())
    }
}

impl fmt::Display for StorageKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Status carried by a notification event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DeliveryStatus {
    Success,
}

/// Event published to the fan-out topic after a successful write.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NotificationEvent {
    pub source_message_id: String,
    pub storage_key: StorageKey,
    pub status: DeliveryStatus,
    pub timestamp: DateTime<Utc>,
}

impl NotificationEvent {
    /// Build the success event for a stored message.
    pub fn stored(message_id: impl Into<String>, storage_key: StorageKey) -> Self {
        Self {
            source_message_id: message_id.into(),
            storage_key,
            status: DeliveryStatus::Success,
            timestamp: Utc::now(),
        }
    }
}

/// Per-message state machine.
///
/// ```text
/// Received ──▶ Stored ──▶ Notified ──▶ Acknowledged
///    │           │           │
///    └───────────┴───────────┴──────▶ Failed
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[derive(Display, AsRefStr)]
#[strum(serialize_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum ProcessingState {
    Received,
    Stored,
    Notified,
    Acknowledged,
    Failed,
}

impl ProcessingState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, ProcessingState::Acknowledged | ProcessingState::Failed)
    }
}

/// Result of processing one delivery attempt. Not persisted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessingOutcome {
    pub message_id: String,
    /// Terminal state: `Acknowledged` or `Failed`
    pub state: ProcessingState,
    /// Furthest successful state reached before the terminal one
    pub reached: ProcessingState,
    pub error: Option<ErrorKind>,
}

impl ProcessingOutcome {
    pub fn acknowledged(message_id: impl Into<String>) -> Self {
        Self {
            message_id: message_id.into(),
            state: ProcessingState::Acknowledged,
            reached: ProcessingState::Acknowledged,
            error: None,
        }
    }

    pub fn failed(message_id: impl Into<String>, reached: ProcessingState, kind: ErrorKind) -> Self {
        Self {
            message_id: message_id.into(),
            state: ProcessingState::Failed,
            reached,
            error: Some(kind),
        }
    }

    pub fn success(&self) -> bool {
        self.state == ProcessingState::Acknowledged
    }

    /// `acknowledged` or `failed:<kind>`
    pub fn label(&self) -> String {
        match self.error {
            Some(kind) => kind.failure_label(),
            None => self.state.to_string(),
        }
    }
}
