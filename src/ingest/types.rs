use crate::error::ItemErrorKind;
use crate::sample::Sample;
use serde::{Deserialize, Serialize};

/// Wire-level ingestion batch as posted to `/collector/`. Fields are kept
/// optional so that missing batch-level fields surface as validation
/// errors with detail instead of a bare deserialization failure.
#[derive(Debug, Deserialize)]
pub struct RawBatch {
    #[serde(default)]
    pub host: Option<String>,
    #[serde(default)]
    pub timestamp: Option<serde_json::Value>,
    #[serde(default)]
    pub samples: Vec<RawItem>,
}

#[derive(Debug, Deserialize)]
pub struct RawItem {
    #[serde(default)]
    pub parameter: Option<String>,
    #[serde(default)]
    pub value: Option<serde_json::Value>,
}

/// One rejected batch item, identified by its position in the request.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ItemError {
    pub index: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub parameter: Option<String>,
    pub kind: ItemErrorKind,
}

/// Result of validating one batch: the samples to forward to the sink
/// plus the per-item rejections.
#[derive(Debug, Default)]
pub struct BatchOutcome {
    pub samples: Vec<Sample>,
    pub rejected: Vec<ItemError>,
}
