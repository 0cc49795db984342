use std::fmt::{Display, Formatter};

use serde::{Deserialize, Serialize};

use crate::firestore::model::Timestamp;

/// Logical "as of" point of a snapshot of the backend.
///
/// [`SnapshotVersion::none`] is the minimum and stands for "no snapshot received yet".
#[derive(
    Clone, Copy, Debug, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
pub struct SnapshotVersion(Timestamp);

impl SnapshotVersion {
    pub fn new(timestamp: Timestamp) -> Self {
        Self(timestamp)
    }

    pub fn none() -> Self {
        Self(Timestamp::new(0, 0))
    }

    pub fn is_none(&self) -> bool {
        *self == Self::none()
    }

    pub fn timestamp(&self) -> Timestamp {
        self.0
    }
}

impl From<Timestamp> for SnapshotVersion {
    fn from(value: Timestamp) -> Self {
        Self(value)
    }
}

impl Display for SnapshotVersion {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "SnapshotVersion({})", self.0)
    }
}
