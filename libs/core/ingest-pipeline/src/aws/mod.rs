//! AWS backends for the capability traits
//!
//! - [`SqsQueue`]: source queue
//! - [`S3ObjectStore`]: object storage
//! - [`SnsPublisher`]: notification fan-out
//!
//! ## Configuration
//!
//! Clients use the standard AWS SDK credential resolution:
//! - Environment variables: `AWS_ACCESS_KEY_ID`, `AWS_SECRET_ACCESS_KEY`, `AWS_REGION`
//! - IAM roles (EKS IRSA, EC2 instance profile)
//! - Shared credentials file
//!
//! `INGEST_AWS_REGION` overrides `AWS_REGION` for all three clients.

mod s3;
mod sns;
mod sqs;

pub use s3::S3ObjectStore;
pub use sns::SnsPublisher;
pub use sqs::SqsQueue;

use crate::error::{ErrorKind, PipelineError};
use aws_sdk_sqs::error::{DisplayErrorContext, ProvideErrorMetadata, SdkError};
use tracing::{debug, error, warn};

/// Error codes that mean the request will not succeed on retry.
const PERMANENT_CODES: &[&str] = &[
    "AccessDenied",
    "AccessDeniedException",
    "AuthorizationError",
    "InvalidAccessKeyId",
    "SignatureDoesNotMatch",
    "ValidationError",
    "InvalidParameter",
    "InvalidParameterValue",
    "InvalidParameterException",
    "InvalidAttributeName",
    "InvalidAddress",
    "NoSuchBucket",
    "NotFound",
    "NotFoundException",
    "AWS.SimpleQueueService.NonExistentQueue",
    "QueueDoesNotExist",
    "KMSAccessDenied",
    "KMSDisabled",
];

/// Error codes that mean the receipt handle no longer identifies a delivery.
const RECEIPT_CODES: &[&str] = &[
    "ReceiptHandleIsInvalid",
    "InvalidReceiptHandle",
    "MessageNotInflight",
    "AWS.SimpleQueueService.MessageNotInflight",
];

/// Map a service error code to a pipeline error kind.
///
/// Throttling, 5xx-style and unrecognized codes are treated as transient.
pub fn classify_code(code: Option<&str>) -> ErrorKind {
    match code {
        Some(code) if RECEIPT_CODES.contains(&code) => ErrorKind::ReceiptExpired,
        Some(code) if PERMANENT_CODES.contains(&code) => ErrorKind::Permanent,
        _ => ErrorKind::Transient,
    }
}

/// Convert an SDK error into a classified pipeline error.
pub(crate) fn classify<E, R>(operation: &'static str, err: SdkError<E, R>) -> PipelineError
where
    E: ProvideErrorMetadata + std::error::Error + Send + Sync + 'static,
    R: std::fmt::Debug,
{
    let code = err
        .as_service_error()
        .and_then(|e| e.code())
        .map(str::to_owned);
    let kind = match &err {
        SdkError::TimeoutError(_) | SdkError::DispatchFailure(_) => ErrorKind::Transient,
        SdkError::ConstructionFailure(_) => ErrorKind::Permanent,
        _ => classify_code(code.as_deref()),
    };
    let details = DisplayErrorContext(&err).to_string();

    match kind {
        ErrorKind::Transient => warn!(operation, code = ?code, "AWS request failed: {}", details),
        ErrorKind::ReceiptExpired => debug!(operation, code = ?code, "Receipt rejected: {}", details),
        ErrorKind::Permanent => error!(operation, code = ?code, "AWS request failed: {}", details),
    }

    PipelineError::of_kind(kind, format!("{}: {}", operation, details))
}

/// Load the shared SDK configuration from the default credential chain.
pub async fn load_sdk_config() -> aws_config::SdkConfig {
    let region = std::env::var("INGEST_AWS_REGION")
        .or_else(|_| std::env::var("AWS_REGION"))
        .ok();

    let mut config_loader = aws_config::from_env();

    if let Some(region_str) = region {
        config_loader = config_loader.region(aws_config::Region::new(region_str));
    }

    config_loader.load().await
}
