use std::collections::{BTreeMap, BTreeSet};

use crate::firestore::local::QueryPurpose;
use crate::firestore::model::{DocumentKey, MutableDocument, SnapshotVersion, TargetId};

/// Aggregated result of a consistent batch of watch changes.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RemoteEvent {
    /// Version the whole event is consistent at.
    pub snapshot_version: SnapshotVersion,
    pub target_changes: BTreeMap<TargetId, TargetChange>,
    /// Targets whose cached results were invalidated, with the purpose of the re-listen.
    pub target_mismatches: BTreeMap<TargetId, QueryPurpose>,
    pub document_updates: BTreeMap<DocumentKey, MutableDocument>,
    /// Documents that only limbo resolution targets referenced.
    pub resolved_limbo_documents: BTreeSet<DocumentKey>,
}

impl RemoteEvent {
    pub fn is_empty(&self) -> bool {
        self.target_changes.is_empty()
            && self.document_updates.is_empty()
            && self.target_mismatches.is_empty()
            && self.resolved_limbo_documents.is_empty()
    }
}

/// Per-target change contained in a [`RemoteEvent`].
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TargetChange {
    pub resume_token: Vec<u8>,
    pub current: bool,
    pub added_documents: BTreeSet<DocumentKey>,
    pub modified_documents: BTreeSet<DocumentKey>,
    pub removed_documents: BTreeSet<DocumentKey>,
}

impl TargetChange {
    /// Change carrying only a new `current` flag, used when a target is synthesized locally.
    pub fn create_synthesized(current: bool, resume_token: Vec<u8>) -> Self {
        Self {
            resume_token,
            current,
            ..Self::default()
        }
    }

    pub fn has_document_changes(&self) -> bool {
        !self.added_documents.is_empty()
            || !self.modified_documents.is_empty()
            || !self.removed_documents.is_empty()
    }
}
