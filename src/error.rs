use serde::Serialize;
use thiserror::Error;

/// Batch-level validation failure. The whole request is rejected and no
/// samples are forwarded.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum BatchError {
    #[error("missing field `{0}`")]
    MissingField(&'static str),
    #[error("`host` must be a non-empty string of at most {max} bytes")]
    InvalidHost { max: usize },
    #[error("timestamp {timestamp} is outside the accepted window")]
    TimestampOutOfRange { timestamp: i64 },
    #[error("`timestamp` must be a finite number of epoch seconds")]
    InvalidTimestamp,
}

/// Why a single sample inside an otherwise acceptable batch was rejected.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum ItemErrorKind {
    MissingParameter,
    InvalidParameter,
    InvalidValue,
    UnknownParameter,
    UnknownHost,
}

/// Per-parameter SNMP poll failure. Never aborts the remaining parameters
/// of a target or the surrounding tick.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum PollError {
    #[error("request timed out")]
    Timeout,
    #[error("no response for requested object")]
    NoResponse,
    #[error("malformed reply: {0}")]
    MalformedReply(String),
    #[error("tick deadline elapsed before poll completed")]
    DeadlineExceeded,
}

impl PollError {
    pub fn kind(&self) -> &'static str {
        match self {
            PollError::Timeout => "timeout",
            PollError::NoResponse => "no-response",
            PollError::MalformedReply(_) => "malformed-reply",
            PollError::DeadlineExceeded => "deadline-exceeded",
        }
    }
}

/// Sink-side failure as seen by producers.
#[derive(Debug, Error)]
pub enum SinkError {
    #[error("sink queue is full")]
    QueueFull,
    #[error("sink worker stopped")]
    Closed,
}

/// Backend write failure as seen by the flush worker. Transient failures
/// are retried with backoff; rejected writes are dropped immediately.
#[derive(Debug, Error)]
pub enum WriteError {
    #[error("transient backend failure: {0}")]
    Transient(String),
    #[error("backend rejected write: {0}")]
    Rejected(String),
}
