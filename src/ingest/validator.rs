use super::types::{BatchOutcome, ItemError, RawBatch, RawItem};
use crate::config::Config;
use crate::error::{BatchError, ItemErrorKind};
use crate::sample::Sample;
use std::collections::HashSet;

/// Host and parameter names share one length cap.
pub const NAME_MAX_LENGTH: usize = 32;

/// Accepted window for batch timestamps relative to now.
#[derive(Debug, Clone, Copy)]
pub struct TimestampBounds {
    pub max_age_secs: i64,
    pub max_ahead_secs: i64,
}

impl TimestampBounds {
    pub fn from_config(config: &Config) -> Self {
        Self {
            max_age_secs: config.timestamp_max_age_secs,
            max_ahead_secs: config.timestamp_max_ahead_secs,
        }
    }

    fn contains(&self, timestamp: i64, now: i64) -> bool {
        timestamp >= now - self.max_age_secs && timestamp <= now + self.max_ahead_secs
    }
}

/// Validates the batch-level fields. Returns the host name and the
/// timestamp normalized to epoch seconds, or the error that rejects the
/// whole request.
pub fn check_batch_fields(
    batch: &RawBatch,
    now: i64,
    bounds: &TimestampBounds,
) -> Result<(String, i64), BatchError> {
    let host = match batch.host.as_deref() {
        None => return Err(BatchError::MissingField("host")),
        Some(raw) => {
            let trimmed = raw.trim();
            if trimmed.is_empty() || trimmed.len() > NAME_MAX_LENGTH {
                return Err(BatchError::InvalidHost {
                    max: NAME_MAX_LENGTH,
                });
            }
            trimmed.to_string()
        }
    };

    let raw_timestamp = batch
        .timestamp
        .as_ref()
        .ok_or(BatchError::MissingField("timestamp"))?;
    let seconds = raw_timestamp
        .as_f64()
        .filter(|v| v.is_finite() && *v >= 0.0)
        .ok_or(BatchError::InvalidTimestamp)?;
    let timestamp = seconds as i64;
    if !bounds.contains(timestamp, now) {
        return Err(BatchError::TimestampOutOfRange { timestamp });
    }

    Ok((host, timestamp))
}

/// Explodes batch items into samples. Invalid items are collected by index
/// while the remaining items proceed; the batch itself never fails here.
///
/// `known_parameters` is the registry's parameter set for the batch host;
/// `None` means the host is not configured at all, which rejects every
/// item rather than the request.
pub fn validate_items(
    items: &[RawItem],
    host: &str,
    timestamp: i64,
    known_parameters: Option<&HashSet<String>>,
) -> BatchOutcome {
    let mut outcome = BatchOutcome::default();

    for (index, item) in items.iter().enumerate() {
        let parameter = match item.parameter.as_deref() {
            None => {
                outcome.rejected.push(ItemError {
                    index,
                    parameter: None,
                    kind: ItemErrorKind::MissingParameter,
                });
                continue;
            }
            Some(raw) => raw.trim(),
        };
        if parameter.is_empty() || parameter.len() > NAME_MAX_LENGTH {
            outcome.rejected.push(ItemError {
                index,
                parameter: Some(parameter.to_string()),
                kind: ItemErrorKind::InvalidParameter,
            });
            continue;
        }

        let value = item
            .value
            .as_ref()
            .and_then(|raw| raw.as_f64())
            .filter(|v| v.is_finite());
        let Some(value) = value else {
            outcome.rejected.push(ItemError {
                index,
                parameter: Some(parameter.to_string()),
                kind: ItemErrorKind::InvalidValue,
            });
            continue;
        };

        match known_parameters {
            None => {
                outcome.rejected.push(ItemError {
                    index,
                    parameter: Some(parameter.to_string()),
                    kind: ItemErrorKind::UnknownHost,
                });
                continue;
            }
            Some(known) if !known.contains(parameter) => {
                outcome.rejected.push(ItemError {
                    index,
                    parameter: Some(parameter.to_string()),
                    kind: ItemErrorKind::UnknownParameter,
                });
                continue;
            }
            Some(_) => {}
        }

        outcome.samples.push(Sample {
            host: host.to_string(),
            parameter: parameter.to_string(),
            value,
            timestamp,
        });
    }

    outcome
}
