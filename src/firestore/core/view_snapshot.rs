use std::collections::{BTreeMap, BTreeSet};

use crate::firestore::core::document_set::DocumentSet;
use crate::firestore::core::query::Query;
use crate::firestore::model::{DocumentKey, MutableDocument};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ChangeKind {
    Added,
    Removed,
    Modified,
    /// Only the document's metadata (pending-write state) changed.
    Metadata,
}

#[derive(Clone, Debug, PartialEq)]
pub struct DocumentViewChange {
    pub kind: ChangeKind,
    pub document: MutableDocument,
}

impl DocumentViewChange {
    pub fn new(kind: ChangeKind, document: MutableDocument) -> Self {
        Self { kind, document }
    }
}

/// Accumulates document changes, folding successive changes to one key into
/// the single change a listener should observe.
#[derive(Clone, Debug, Default)]
pub struct DocumentViewChangeSet {
    changes: BTreeMap<DocumentKey, DocumentViewChange>,
}

impl DocumentViewChangeSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_change(&mut self, change: DocumentViewChange) {
        let key = change.document.key().clone();
        let Some(old) = self.changes.get(&key) else {
            self.changes.insert(key, change);
            return;
        };

        let merged = match (old.kind, change.kind) {
            (ChangeKind::Metadata, kind) if kind != ChangeKind::Added => Some(change),
            (old_kind, ChangeKind::Metadata) if old_kind != ChangeKind::Removed => {
                Some(DocumentViewChange::new(old_kind, change.document))
            }
            (ChangeKind::Modified, ChangeKind::Modified) => {
                Some(DocumentViewChange::new(ChangeKind::Modified, change.document))
            }
            (ChangeKind::Added, ChangeKind::Modified) => {
                Some(DocumentViewChange::new(ChangeKind::Added, change.document))
            }
            (ChangeKind::Added, ChangeKind::Removed) => None,
            (ChangeKind::Modified, ChangeKind::Removed) => Some(DocumentViewChange::new(
                ChangeKind::Removed,
                old.document.clone(),
            )),
            (ChangeKind::Removed, ChangeKind::Added) => {
                Some(DocumentViewChange::new(ChangeKind::Modified, change.document))
            }
            // Remaining combinations cannot be produced by a view; keep the latest.
            _ => Some(change),
        };

        match merged {
            Some(merged) => {
                self.changes.insert(key, merged);
            }
            None => {
                self.changes.remove(&key);
            }
        }
    }

    pub fn changes(&self) -> Vec<DocumentViewChange> {
        self.changes.values().cloned().collect()
    }

    pub fn is_empty(&self) -> bool {
        self.changes.is_empty()
    }
}

/// Immutable result of a query at one point in time, with the changes since
/// the previous snapshot delivered to the same listener.
#[derive(Clone, Debug, PartialEq)]
pub struct ViewSnapshot {
    query: Query,
    documents: DocumentSet,
    old_documents: DocumentSet,
    document_changes: Vec<DocumentViewChange>,
    from_cache: bool,
    mutated_keys: BTreeSet<DocumentKey>,
    sync_state_changed: bool,
    excludes_metadata_changes: bool,
}

impl ViewSnapshot {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        query: Query,
        documents: DocumentSet,
        old_documents: DocumentSet,
        document_changes: Vec<DocumentViewChange>,
        from_cache: bool,
        mutated_keys: BTreeSet<DocumentKey>,
        sync_state_changed: bool,
        excludes_metadata_changes: bool,
    ) -> Self {
        Self {
            query,
            documents,
            old_documents,
            document_changes,
            from_cache,
            mutated_keys,
            sync_state_changed,
            excludes_metadata_changes,
        }
    }

    /// Snapshot reporting every document as added to an empty result.
    pub fn from_initial_documents(
        query: Query,
        documents: DocumentSet,
        mutated_keys: BTreeSet<DocumentKey>,
        from_cache: bool,
        excludes_metadata_changes: bool,
    ) -> Self {
        let document_changes = documents
            .iter()
            .map(|document| DocumentViewChange::new(ChangeKind::Added, document.clone()))
            .collect();
        let old_documents = DocumentSet::new(query.comparator());
        Self::new(
            query,
            documents,
            old_documents,
            document_changes,
            from_cache,
            mutated_keys,
            true,
            excludes_metadata_changes,
        )
    }

    pub fn query(&self) -> &Query {
        &self.query
    }

    pub fn documents(&self) -> &DocumentSet {
        &self.documents
    }

    pub fn old_documents(&self) -> &DocumentSet {
        &self.old_documents
    }

    pub fn document_changes(&self) -> &[DocumentViewChange] {
        &self.document_changes
    }

    /// Whether the result may be stale because the backend has not confirmed it.
    pub fn from_cache(&self) -> bool {
        self.from_cache
    }

    /// Keys of documents in the result that carry unacknowledged local writes.
    pub fn mutated_keys(&self) -> &BTreeSet<DocumentKey> {
        &self.mutated_keys
    }

    pub fn sync_state_changed(&self) -> bool {
        self.sync_state_changed
    }

    pub fn excludes_metadata_changes(&self) -> bool {
        self.excludes_metadata_changes
    }

    pub fn has_pending_writes(&self) -> bool {
        !self.mutated_keys.is_empty()
    }

    /// Same snapshot without metadata-only document changes.
    pub(crate) fn without_metadata_changes(&self) -> Self {
        Self {
            document_changes: self
                .document_changes
                .iter()
                .filter(|change| change.kind != ChangeKind::Metadata)
                .cloned()
                .collect(),
            excludes_metadata_changes: true,
            ..self.clone()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::firestore::model::{ObjectValue, SnapshotVersion, Timestamp};

    fn doc(path: &str, seconds: i64) -> MutableDocument {
        MutableDocument::found_document(
            DocumentKey::from_string(path).unwrap(),
            SnapshotVersion::new(Timestamp::new(seconds, 0)),
            ObjectValue::empty(),
        )
    }

    fn kinds(set: &DocumentViewChangeSet) -> Vec<ChangeKind> {
        set.changes().into_iter().map(|c| c.kind).collect()
    }

    #[test]
    fn added_then_modified_stays_added_with_latest_document() {
        let mut set = DocumentViewChangeSet::new();
        set.add_change(DocumentViewChange::new(ChangeKind::Added, doc("a/1", 1)));
        set.add_change(DocumentViewChange::new(ChangeKind::Modified, doc("a/1", 2)));
        let changes = set.changes();
        assert_eq!(changes.len(), 1);
        assert_eq!(changes[0].kind, ChangeKind::Added);
        assert_eq!(changes[0].document.version(), SnapshotVersion::new(Timestamp::new(2, 0)));
    }

    #[test]
    fn added_then_removed_cancels_out() {
        let mut set = DocumentViewChangeSet::new();
        set.add_change(DocumentViewChange::new(ChangeKind::Added, doc("a/1", 1)));
        set.add_change(DocumentViewChange::new(ChangeKind::Removed, doc("a/1", 1)));
        assert!(set.is_empty());
    }

    #[test]
    fn merge_rules() {
        let mut set = DocumentViewChangeSet::new();
        set.add_change(DocumentViewChange::new(ChangeKind::Removed, doc("a/1", 1)));
        set.add_change(DocumentViewChange::new(ChangeKind::Added, doc("a/1", 2)));
        set.add_change(DocumentViewChange::new(ChangeKind::Metadata, doc("a/2", 1)));
        set.add_change(DocumentViewChange::new(ChangeKind::Modified, doc("a/2", 2)));
        set.add_change(DocumentViewChange::new(ChangeKind::Modified, doc("a/3", 1)));
        set.add_change(DocumentViewChange::new(ChangeKind::Removed, doc("a/3", 2)));
        set.add_change(DocumentViewChange::new(ChangeKind::Modified, doc("a/4", 1)));
        set.add_change(DocumentViewChange::new(ChangeKind::Metadata, doc("a/4", 2)));
        assert_eq!(
            kinds(&set),
            vec![
                ChangeKind::Modified,
                ChangeKind::Modified,
                ChangeKind::Removed,
                ChangeKind::Modified
            ]
        );
        // A removal keeps the last document the listener saw.
        assert_eq!(
            set.changes()[2].document.version(),
            SnapshotVersion::new(Timestamp::new(1, 0))
        );
    }
}
