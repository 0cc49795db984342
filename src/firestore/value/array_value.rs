use serde::{Deserialize, Serialize};

use crate::firestore::value::{value_util, FirestoreValue};

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ArrayValue {
    values: Vec<FirestoreValue>,
}

impl ArrayValue {
    pub fn new(values: Vec<FirestoreValue>) -> Self {
        Self { values }
    }

    pub fn values(&self) -> &[FirestoreValue] {
        &self.values
    }

    /// Membership using Firestore value equality (so `1` matches `1.0`).
    pub fn contains(&self, needle: &FirestoreValue) -> bool {
        self.values
            .iter()
            .any(|candidate| value_util::values_equal(candidate, needle))
    }
}
