//! Amazon SQS source queue

use super::classify;
use crate::error::PipelineResult;
use crate::message::{Message, ReceiptToken};
use crate::queue::QueueClient;
use async_trait::async_trait;
use aws_sdk_sqs::types::MessageSystemAttributeName;
use aws_sdk_sqs::Client;
use chrono::{DateTime, Utc};
use std::time::Duration;
use tracing::{debug, warn};

/// SQS caps a single receive at 10 messages.
const MAX_RECEIVE_BATCH: usize = 10;

/// SQS caps long polling at 20 seconds.
const MAX_WAIT_SECS: u64 = 20;

/// SQS caps the visibility timeout at 12 hours.
const MAX_VISIBILITY_SECS: u64 = 43_200;

/// Queue backed by an SQS standard or FIFO queue.
pub struct SqsQueue {
    client: Client,
    queue_url: String,
}

impl SqsQueue {
    /// Create a new SqsQueue with an existing SQS client
    pub fn new(client: Client, queue_url: impl Into<String>) -> Self {
        Self {
            client,
            queue_url: queue_url.into(),
        }
    }

    /// Create from shared SDK configuration
    pub fn from_sdk_config(config: &aws_config::SdkConfig, queue_url: impl Into<String>) -> Self {
        Self::new(Client::new(config), queue_url)
    }

    pub fn queue_url(&self) -> &str {
        &self.queue_url
    }

    fn convert(message: &aws_sdk_sqs::types::Message) -> Option<Message> {
        let (Some(id), Some(receipt)) = (message.message_id(), message.receipt_handle()) else {
            warn!("Skipping SQS message without id or receipt handle");
            return None;
        };

        let attribute = |name: MessageSystemAttributeName| {
            message
                .attributes()
                .and_then(|attributes| attributes.get(&name))
        };

        let receive_count = attribute(MessageSystemAttributeName::ApproximateReceiveCount)
            .and_then(|value| value.parse::<u32>().ok())
            .unwrap_or(1);

        let enqueued_at = attribute(MessageSystemAttributeName::SentTimestamp)
            .and_then(|value| value.parse::<i64>().ok())
            .and_then(DateTime::<Utc>::from_timestamp_millis)
            .unwrap_or_else(Utc::now);

        let body = message.body().unwrap_or_default().to_owned();

        Some(
            Message::new(id, body, ReceiptToken::new(receipt))
                .with_receive_count(receive_count)
                .with_enqueued_at(enqueued_at),
        )
    }
}

#[async_trait]
impl QueueClient for SqsQueue {
    async fn receive(
        &self,
        max_messages: usize,
        wait_timeout: Duration,
    ) -> PipelineResult<Vec<Message>> {
        let max_messages = max_messages.clamp(1, MAX_RECEIVE_BATCH);
        let wait_secs = wait_timeout.as_secs().min(MAX_WAIT_SECS);

        let output = self
            .client
            .receive_message()
            .queue_url(&self.queue_url)
            .max_number_of_messages(max_messages as i32)
            .wait_time_seconds(wait_secs as i32)
            .message_system_attribute_names(MessageSystemAttributeName::All)
            .send()
            .await
            .map_err(|e| classify("sqs.receive_message", e))?;

        let messages: Vec<Message> = output.messages().iter().filter_map(Self::convert).collect();

        debug!(
            queue_url = %self.queue_url,
            count = messages.len(),
            "Received SQS batch"
        );

        Ok(messages)
    }

    async fn delete(&self, receipt: &ReceiptToken) -> PipelineResult<()> {
        self.client
            .delete_message()
            .queue_url(&self.queue_url)
            .receipt_handle(receipt.as_str())
            .send()
            .await
            .map_err(|e| classify("sqs.delete_message", e))?;

        Ok(())
    }

    async fn extend_visibility(
        &self,
        receipt: &ReceiptToken,
        duration: Duration,
    ) -> PipelineResult<()> {
        let seconds = duration.as_secs().min(MAX_VISIBILITY_SECS);

        self.client
            .change_message_visibility()
            .queue_url(&self.queue_url)
            .receipt_handle(receipt.as_str())
            .visibility_timeout(seconds as i32)
            .send()
            .await
            .map_err(|e| classify("sqs.change_message_visibility", e))?;

        Ok(())
    }

    fn name(&self) -> &'static str {
        "aws-sqs"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use aws_sdk_sqs::types::Message as SqsMessage;

    #[test]
    fn test_convert_reads_system_attributes() {
        let sqs = SqsMessage::builder()
            .message_id("42")
            .receipt_handle("receipt-abc")
            .body("hello")
            .attributes(MessageSystemAttributeName::ApproximateReceiveCount, "3")
            .attributes(MessageSystemAttributeName::SentTimestamp, "1700000000000")
            .build();

        let message = SqsQueue::convert(&sqs).unwrap();
        assert_eq!(message.id, "42");
        assert_eq!(&message.body[..], b"hello");
        assert_eq!(message.receipt.as_str(), "receipt-abc");
        assert_eq!(message.receive_count, 3);
        assert!(message.is_redelivery());
        assert_eq!(message.enqueued_at.timestamp_millis(), 1_700_000_000_000);
    }

    #[test]
    fn test_convert_defaults_missing_attributes() {
        let sqs = SqsMessage::builder()
            .message_id("7")
            .receipt_handle("r")
            .build();

        let message = SqsQueue::convert(&sqs).unwrap();
        assert_eq!(message.receive_count, 1);
        assert!(message.body.is_empty());
    }

    #[test]
    fn test_convert_skips_message_without_receipt() {
        let sqs = SqsMessage::builder().message_id("7").body("x").build();
        assert!(SqsQueue::convert(&sqs).is_none());
    }
}
