//! Error taxonomy for the scheduling and state-aggregation engine.

use thiserror::Error;

/// A telemetry message or advisor payload that does not match its schema.
#[derive(Debug, Error)]
pub enum DecodeError {
    #[error("malformed telemetry payload: {0}")]
    Json(#[from] serde_json::Error),

    #[error("telemetry carries no gpu identifier (subject: {subject})")]
    MissingGpuId { subject: String },
}

/// Failures of a single placement decision request.
#[derive(Debug, Error)]
pub enum AdvisorError {
    #[error("placement advisor unreachable: {0}")]
    Unreachable(String),

    #[error("placement advisor protocol error: {0}")]
    Protocol(String),

    #[error("advisor chose gpu {gpu_id:?} which was not offered as a candidate")]
    UnverifiedPlacement { gpu_id: String },
}

/// Rejection of a caller-provided job descriptor.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ValidationError {
    #[error("job id must not be empty")]
    EmptyId,

    #[error("unknown job type {0:?} (expected one of: {1})")]
    UnknownType(String, String),

    #[error("job {0:?} is already pending")]
    DuplicateId(String),
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("telemetry store unavailable: {0}")]
    Unavailable(String),

    #[error("failed to append telemetry sample: {0}")]
    Write(#[from] sqlx::Error),
}

#[derive(Debug, Error)]
pub enum CommandError {
    #[error("failed to encode command: {0}")]
    Encode(#[from] serde_json::Error),

    #[error("failed to publish command on {subject}: {reason}")]
    Publish { subject: String, reason: String },
}
