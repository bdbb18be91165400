mod types;
mod validator;


pub use types::{BatchOutcome, ItemError, RawBatch, RawItem};
pub use validator::{check_batch_fields, validate_items, TimestampBounds, NAME_MAX_LENGTH};
