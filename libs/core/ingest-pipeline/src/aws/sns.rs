//! Amazon SNS notification publisher

use super::classify;
use crate::error::PipelineResult;
use crate::notification::Publisher;
use async_trait::async_trait;
use aws_sdk_sns::Client;
use tracing::debug;

/// Publishes JSON events to SNS topics.
pub struct SnsPublisher {
    client: Client,
}

impl SnsPublisher {
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    /// Create from shared SDK configuration
    pub fn from_sdk_config(config: &aws_config::SdkConfig) -> Self {
        Self::new(Client::new(config))
    }
}

#[async_trait]
impl Publisher for SnsPublisher {
    async fn publish(&self, topic: &str, payload: &serde_json::Value) -> PipelineResult<()> {
        let response = self
            .client
            .publish()
            .topic_arn(topic)
            .message(payload.to_string())
            .send()
            .await
            .map_err(|e| classify("sns.publish", e))?;

        debug!(
            topic,
            sns_message_id = response.message_id().unwrap_or_default(),
            "Notification published to SNS"
        );
        Ok(())
    }

    fn name(&self) -> &'static str {
        "aws-sns"
    }
}
