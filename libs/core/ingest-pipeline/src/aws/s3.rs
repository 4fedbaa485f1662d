//! Amazon S3 object store

use super::classify;
use crate::error::PipelineResult;
use crate::message::StorageKey;
use crate::storage::ObjectStore;
use async_trait::async_trait;
use aws_sdk_s3::primitives::ByteStream;
use aws_sdk_s3::Client;
use bytes::Bytes;
use tracing::debug;

const CONTENT_TYPE: &str = "text/plain";

/// Object store writing into a single S3 bucket.
pub struct S3ObjectStore {
    client: Client,
    bucket: String,
}

impl S3ObjectStore {
    pub fn new(client: Client, bucket: impl Into<String>) -> Self {
        Self {
            client,
            bucket: bucket.into(),
        }
    }

    /// Create from shared SDK configuration
    pub fn from_sdk_config(config: &aws_config::SdkConfig, bucket: impl Into<String>) -> Self {
        Self::new(Client::new(config), bucket)
    }

    pub fn bucket(&self) -> &str {
        &self.bucket
    }
}

#[async_trait]
impl ObjectStore for S3ObjectStore {
    async fn put(&self, key: &StorageKey, payload: Bytes) -> PipelineResult<()> {
        let size = payload.len();

        self.client
            .put_object()
            .bucket(&self.bucket)
            .key(key.as_str())
            .content_type(CONTENT_TYPE)
            .body(ByteStream::from(payload))
            .send()
            .await
            .map_err(|e| classify("s3.put_object", e))?;

        debug!(bucket = %self.bucket, key = %key, size, "Object written to S3");
        Ok(())
    }

    fn name(&self) -> &'static str {
        "aws-s3"
    }
}
