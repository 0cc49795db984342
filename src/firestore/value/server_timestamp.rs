use serde::{Deserialize, Serialize};

use crate::firestore::model::Timestamp;
use crate::firestore::value::{FirestoreValue, ValueKind};

/// Local stand-in for a server timestamp the backend has not assigned yet.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct PendingServerTimestamp {
    local_write_time: Timestamp,
    previous_value: Option<Box<FirestoreValue>>,
}

impl PendingServerTimestamp {
    /// Chained pending timestamps keep the value from before the first one.
    pub fn new(local_write_time: Timestamp, previous: Option<&FirestoreValue>) -> Self {
        let previous_value = match previous.map(FirestoreValue::kind) {
            Some(ValueKind::ServerTimestamp(pending)) => pending.previous_value.clone(),
            _ => previous.cloned().map(Box::new),
        };
        Self {
            local_write_time,
            previous_value,
        }
    }

    /// Client time of the write; the usual estimate for the final value.
    pub fn local_write_time(&self) -> Timestamp {
        self.local_write_time
    }

    /// Field value before the write, if there was one.
    pub fn previous_value(&self) -> Option<&FirestoreValue> {
        self.previous_value.as_deref()
    }
}
