use std::cmp::Ordering;
use std::collections::BTreeSet;

use crate::firestore::core::document_set::DocumentSet;
use crate::firestore::core::query::{LimitType, Query};
use crate::firestore::core::view_snapshot::{
    ChangeKind, DocumentViewChange, DocumentViewChangeSet, ViewSnapshot,
};
use crate::firestore::local::DocumentMap;
use crate::firestore::model::{DocumentKey, MutableDocument};
use crate::firestore::remote::TargetChange;

/// Whether the view currently reflects the backend's confirmed state.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SyncState {
    Local,
    Synced,
}

/// Connectivity of the watch stream as reported by the remote store.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum OnlineState {
    #[default]
    Unknown,
    Online,
    Offline,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LimboChangeKind {
    Added,
    Removed,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct LimboDocumentChange {
    pub kind: LimboChangeKind,
    pub key: DocumentKey,
}

/// Document changes computed against a view but not yet applied to it.
#[derive(Clone, Debug)]
pub struct ViewDocumentChanges {
    document_set: DocumentSet,
    change_set: DocumentViewChangeSet,
    mutated_keys: BTreeSet<DocumentKey>,
    needs_refill: bool,
}

impl ViewDocumentChanges {
    pub fn document_set(&self) -> &DocumentSet {
        &self.document_set
    }

    pub fn mutated_keys(&self) -> &BTreeSet<DocumentKey> {
        &self.mutated_keys
    }

    /// The limit window lost documents that the changes alone cannot replace;
    /// the caller must rerun the query locally and recompute.
    pub fn needs_refill(&self) -> bool {
        self.needs_refill
    }
}

#[derive(Clone, Debug, Default)]
pub struct ViewChange {
    pub snapshot: Option<ViewSnapshot>,
    pub limbo_changes: Vec<LimboDocumentChange>,
}

/// Incrementally maintained result of one query, merging local and remote state.
#[derive(Debug)]
pub struct View {
    query: Query,
    sync_state: Option<SyncState>,
    current: bool,
    document_set: DocumentSet,
    /// Keys the backend has confirmed for the target.
    synced_documents: BTreeSet<DocumentKey>,
    limbo_documents: BTreeSet<DocumentKey>,
    mutated_keys: BTreeSet<DocumentKey>,
}

impl View {
    pub fn new(query: Query, remote_documents: BTreeSet<DocumentKey>) -> Self {
        let document_set = DocumentSet::new(query.comparator());
        Self {
            query,
            sync_state: None,
            current: false,
            document_set,
            synced_documents: remote_documents,
            limbo_documents: BTreeSet::new(),
            mutated_keys: BTreeSet::new(),
        }
    }

    pub fn query(&self) -> &Query {
        &self.query
    }

    pub fn synced_documents(&self) -> &BTreeSet<DocumentKey> {
        &self.synced_documents
    }

    pub fn limbo_documents(&self) -> &BTreeSet<DocumentKey> {
        &self.limbo_documents
    }

    pub fn document_set(&self) -> &DocumentSet {
        &self.document_set
    }

    /// Computes how `doc_changes` alter the view without applying them.
    ///
    /// `previous` carries the result of an earlier pass over the same event,
    /// used after a refill.
    pub fn compute_document_changes(
        &self,
        doc_changes: &DocumentMap,
        previous: Option<ViewDocumentChanges>,
    ) -> ViewDocumentChanges {
        let (old_document_set, mut change_set, mut mutated_keys) = match previous {
            Some(previous) => (
                previous.document_set,
                previous.change_set,
                previous.mutated_keys,
            ),
            None => (
                self.document_set.clone(),
                DocumentViewChangeSet::new(),
                self.mutated_keys.clone(),
            ),
        };
        let mut document_set = old_document_set.clone();
        let mut needs_refill = false;

        let window_full = self
            .query
            .limit()
            .is_some_and(|limit| old_document_set.len() == limit as usize);
        let last_doc_in_limit = match self.query.limit_type() {
            LimitType::First if window_full => old_document_set.last().cloned(),
            _ => None,
        };
        let first_doc_in_limit = match self.query.limit_type() {
            LimitType::Last if window_full => old_document_set.first().cloned(),
            _ => None,
        };
        let comparator = self.query.comparator();

        for (key, entry) in doc_changes {
            let old_doc = old_document_set.get(key);
            let new_doc = self.query.matches(entry).then_some(entry);

            let old_had_pending = old_doc.is_some_and(|doc| self.mutated_keys.contains(doc.key()));
            let new_has_pending = new_doc.is_some_and(|doc| {
                doc.has_local_mutations()
                    || (self.mutated_keys.contains(doc.key()) && doc.has_committed_mutations())
            });

            let mut change_applied = false;
            match (old_doc, new_doc) {
                (Some(old), Some(new)) => {
                    if old.data() != new.data() {
                        if !should_wait_for_synced_document(old, new) {
                            change_set.add_change(DocumentViewChange::new(
                                ChangeKind::Modified,
                                new.clone(),
                            ));
                            change_applied = true;

                            let past_last = last_doc_in_limit
                                .as_ref()
                                .is_some_and(|last| comparator.compare(new, last) == Ordering::Greater);
                            let before_first = first_doc_in_limit
                                .as_ref()
                                .is_some_and(|first| comparator.compare(new, first) == Ordering::Less);
                            if past_last || before_first {
                                // The document moved out of the window; something else may belong there.
                                needs_refill = true;
                            }
                        }
                    } else if old_had_pending != new_has_pending {
                        change_set.add_change(DocumentViewChange::new(
                            ChangeKind::Metadata,
                            new.clone(),
                        ));
                        change_applied = true;
                    }
                }
                (None, Some(new)) => {
                    change_set.add_change(DocumentViewChange::new(ChangeKind::Added, new.clone()));
                    change_applied = true;
                }
                (Some(old), None) => {
                    change_set.add_change(DocumentViewChange::new(
                        ChangeKind::Removed,
                        old.clone(),
                    ));
                    change_applied = true;
                    if last_doc_in_limit.is_some() || first_doc_in_limit.is_some() {
                        needs_refill = true;
                    }
                }
                (None, None) => {}
            }

            if change_applied {
                match new_doc {
                    Some(new) => {
                        if new_has_pending {
                            mutated_keys.insert(key.clone());
                        } else {
                            mutated_keys.remove(key);
                        }
                        document_set.insert(new.clone());
                    }
                    None => {
                        document_set.remove(key);
                        mutated_keys.remove(key);
                    }
                }
            }
        }

        if let Some(limit) = self.query.limit() {
            while document_set.len() > limit as usize {
                let evicted = match self.query.limit_type() {
                    LimitType::First => document_set.last().cloned(),
                    LimitType::Last => document_set.first().cloned(),
                };
                let Some(evicted) = evicted else { break };
                document_set.remove(evicted.key());
                mutated_keys.remove(evicted.key());
                change_set.add_change(DocumentViewChange::new(ChangeKind::Removed, evicted));
            }
        }

        ViewDocumentChanges {
            document_set,
            change_set,
            mutated_keys,
            needs_refill,
        }
    }

    /// Applies computed changes plus the target's new sync state, producing
    /// a snapshot when anything observable changed.
    pub fn apply_changes(
        &mut self,
        doc_changes: ViewDocumentChanges,
        target_change: Option<&TargetChange>,
    ) -> ViewChange {
        let old_documents = std::mem::replace(&mut self.document_set, doc_changes.document_set);
        self.mutated_keys = doc_changes.mutated_keys;

        let comparator = self.query.comparator();
        let mut changes = doc_changes.change_set.changes();
        changes.sort_by(|left, right| {
            change_kind_order(left.kind)
                .cmp(&change_kind_order(right.kind))
                .then_with(|| comparator.compare(&left.document, &right.document))
        });

        self.apply_target_change(target_change);
        let limbo_changes = self.update_limbo_documents();
        let synced = self.limbo_documents.is_empty() && self.current;
        let new_sync_state = if synced {
            SyncState::Synced
        } else {
            SyncState::Local
        };
        let sync_state_changed = self.sync_state != Some(new_sync_state);
        self.sync_state = Some(new_sync_state);

        if changes.is_empty() && !sync_state_changed {
            return ViewChange {
                snapshot: None,
                limbo_changes,
            };
        }

        let snapshot = ViewSnapshot::new(
            self.query.clone(),
            self.document_set.clone(),
            old_documents,
            changes,
            new_sync_state == SyncState::Local,
            self.mutated_keys.clone(),
            sync_state_changed,
            false,
        );
        ViewChange {
            snapshot: Some(snapshot),
            limbo_changes,
        }
    }

    /// Going offline means the view can no longer claim to be current.
    pub fn apply_online_state_change(&mut self, online_state: OnlineState) -> ViewChange {
        if self.current && online_state == OnlineState::Offline {
            self.current = false;
            let unchanged = ViewDocumentChanges {
                document_set: self.document_set.clone(),
                change_set: DocumentViewChangeSet::new(),
                mutated_keys: self.mutated_keys.clone(),
                needs_refill: false,
            };
            self.apply_changes(unchanged, None)
        } else {
            ViewChange::default()
        }
    }

    fn apply_target_change(&mut self, target_change: Option<&TargetChange>) {
        let Some(change) = target_change else {
            return;
        };
        self.synced_documents
            .extend(change.added_documents.iter().cloned());
        for key in &change.removed_documents {
            self.synced_documents.remove(key);
        }
        self.current = change.current;
    }

    fn update_limbo_documents(&mut self) -> Vec<LimboDocumentChange> {
        if !self.current {
            return Vec::new();
        }

        let old_limbo = std::mem::take(&mut self.limbo_documents);
        let new_limbo: BTreeSet<DocumentKey> = self
            .document_set
            .iter()
            .filter(|doc| self.should_be_in_limbo(doc))
            .map(|doc| doc.key().clone())
            .collect();

        let mut changes = Vec::new();
        for key in old_limbo.difference(&new_limbo) {
            changes.push(LimboDocumentChange {
                kind: LimboChangeKind::Removed,
                key: key.clone(),
            });
        }
        for key in new_limbo.difference(&old_limbo) {
            changes.push(LimboDocumentChange {
                kind: LimboChangeKind::Added,
                key: key.clone(),
            });
        }
        self.limbo_documents = new_limbo;
        changes
    }

    fn should_be_in_limbo(&self, document: &MutableDocument) -> bool {
        !self.synced_documents.contains(document.key()) && !document.has_local_mutations()
    }
}

fn should_wait_for_synced_document(old: &MutableDocument, new: &MutableDocument) -> bool {
    // An acknowledged write is only shown once the backend delivers the synced version.
    old.has_local_mutations() && new.has_committed_mutations() && !new.has_local_mutations()
}

fn change_kind_order(kind: ChangeKind) -> u8 {
    match kind {
        ChangeKind::Removed => 0,
        ChangeKind::Added => 1,
        ChangeKind::Modified | ChangeKind::Metadata => 2,
    }
}
