/// Numeric id the backend uses for a listened target.
pub type TargetId = i32;

/// Monotonically increasing id of a mutation batch.
pub type BatchId = i32;

/// Counter stamped onto targets and documents each time they are used; drives LRU collection.
pub type ListenSequenceNumber = i64;

pub const BATCH_ID_UNKNOWN: BatchId = -1;

pub const INVALID_LISTEN_SEQUENCE_NUMBER: ListenSequenceNumber = -1;
