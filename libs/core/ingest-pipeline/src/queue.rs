//! Source queue capability

use crate::error::PipelineResult;
use crate::message::{Message, ReceiptToken};
use async_trait::async_trait;
use std::time::Duration;

/// Durable at-least-once queue.
///
/// A received message stays invisible to other receivers until its
/// visibility timeout lapses, after which the queue redelivers it with a
/// new receipt and an incremented receive count.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait QueueClient: Send + Sync {
    /// Long-poll for up to `max_messages`, waiting at most `wait_timeout`.
    ///
    /// Returns an empty batch on timeout.
    async fn receive(
        &self,
        max_messages: usize,
        wait_timeout: Duration,
    ) -> PipelineResult<Vec<Message>>;

    /// Delete the message identified by `receipt`.
    async fn delete(&self, receipt: &ReceiptToken) -> PipelineResult<()>;

    /// Keep the message invisible for another `duration`, counted from now.
    async fn extend_visibility(
        &self,
        receipt: &ReceiptToken,
        duration: Duration,
    ) -> PipelineResult<()>;

    /// Backend name for logging
    fn name(&self) -> &'static str;
}
