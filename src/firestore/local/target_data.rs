use serde::{Deserialize, Serialize};

use crate::firestore::core::Query;
use crate::firestore::model::{ListenSequenceNumber, SnapshotVersion, TargetId};

/// Why a target is being listened to.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum QueryPurpose {
    /// A regular application listener.
    Listen,
    /// Re-listen after an existence filter mismatch without a usable bloom filter.
    ExistenceFilterMismatch,
    /// Re-listen after a bloom filter produced a false positive.
    ExistenceFilterMismatchBloom,
    /// Single-document target opened to resolve a limbo document.
    LimboResolution,
}

/// Cached metadata about a listened target.
#[derive(Clone, Debug, PartialEq)]
pub struct TargetData {
    target: Query,
    target_id: TargetId,
    purpose: QueryPurpose,
    sequence_number: ListenSequenceNumber,
    snapshot_version: SnapshotVersion,
    last_limbo_free_snapshot_version: SnapshotVersion,
    resume_token: Vec<u8>,
    expected_count: Option<i32>,
}

impl TargetData {
    pub fn new(
        target: Query,
        target_id: TargetId,
        purpose: QueryPurpose,
        sequence_number: ListenSequenceNumber,
    ) -> Self {
        Self {
            target,
            target_id,
            purpose,
            sequence_number,
            snapshot_version: SnapshotVersion::none(),
            last_limbo_free_snapshot_version: SnapshotVersion::none(),
            resume_token: Vec::new(),
            expected_count: None,
        }
    }

    pub(crate) fn restore(
        target: Query,
        target_id: TargetId,
        purpose: QueryPurpose,
        sequence_number: ListenSequenceNumber,
        snapshot_version: SnapshotVersion,
        last_limbo_free_snapshot_version: SnapshotVersion,
        resume_token: Vec<u8>,
    ) -> Self {
        Self {
            target,
            target_id,
            purpose,
            sequence_number,
            snapshot_version,
            last_limbo_free_snapshot_version,
            resume_token,
            expected_count: None,
        }
    }

    pub fn target(&self) -> &Query {
        &self.target
    }

    pub fn target_id(&self) -> TargetId {
        self.target_id
    }

    pub fn purpose(&self) -> QueryPurpose {
        self.purpose
    }

    pub fn sequence_number(&self) -> ListenSequenceNumber {
        self.sequence_number
    }

    pub fn snapshot_version(&self) -> SnapshotVersion {
        self.snapshot_version
    }

    pub fn last_limbo_free_snapshot_version(&self) -> SnapshotVersion {
        self.last_limbo_free_snapshot_version
    }

    pub fn resume_token(&self) -> &[u8] {
        &self.resume_token
    }

    /// Result count the client expects when resuming; set after existence filter mismatches.
    pub fn expected_count(&self) -> Option<i32> {
        self.expected_count
    }

    pub fn with_sequence_number(&self, sequence_number: ListenSequenceNumber) -> Self {
        Self {
            sequence_number,
            ..self.clone()
        }
    }

    /// New resume token valid as of `snapshot_version`; clears any expected count.
    pub fn with_resume_token(&self, resume_token: Vec<u8>, snapshot_version: SnapshotVersion) -> Self {
        Self {
            resume_token,
            snapshot_version,
            expected_count: None,
            ..self.clone()
        }
    }

    pub fn with_last_limbo_free_snapshot_version(&self, version: SnapshotVersion) -> Self {
        Self {
            last_limbo_free_snapshot_version: version,
            ..self.clone()
        }
    }

    pub fn with_expected_count(&self, expected_count: Option<i32>) -> Self {
        Self {
            expected_count,
            ..self.clone()
        }
    }

    pub fn with_purpose(&self, purpose: QueryPurpose) -> Self {
        Self {
            purpose,
            ..self.clone()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::firestore::model::{ResourcePath, Timestamp};

    #[test]
    fn builders_replace_single_fields() {
        let query = Query::new(ResourcePath::from_string("rooms").unwrap());
        let data = TargetData::new(query.clone(), 2, QueryPurpose::Listen, 10)
            .with_expected_count(Some(3));
        let version = SnapshotVersion::new(Timestamp::new(5, 0));

        let resumed = data.with_resume_token(b"tok".to_vec(), version);
        assert_eq!(resumed.resume_token(), b"tok");
        assert_eq!(resumed.snapshot_version(), version);
        assert_eq!(resumed.expected_count(), None);
        assert_eq!(resumed.target(), &query);
        assert_eq!(resumed.sequence_number(), 10);

        let reset = resumed
            .with_resume_token(Vec::new(), SnapshotVersion::none())
            .with_purpose(QueryPurpose::ExistenceFilterMismatch);
        assert!(reset.resume_token().is_empty());
        assert_eq!(reset.purpose(), QueryPurpose::ExistenceFilterMismatch);
    }
}
