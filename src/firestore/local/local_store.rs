use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Arc, LazyLock};

use crate::firestore::core::{ChangeKind, Query, TargetIdGenerator, ViewSnapshot};
use crate::firestore::error::{internal_error, not_found, FirestoreResult};
use crate::firestore::local::local_documents_view::LocalDocumentsView;
use crate::firestore::local::lru_garbage_collector::{LruGarbageCollector, LruParams, LruResults};
use crate::firestore::local::persistence::{Persistence, Transaction};
use crate::firestore::local::query_engine::QueryEngine;
use crate::firestore::local::reference_set::ReferenceSet;
use crate::firestore::local::target_data::{QueryPurpose, TargetData};
use crate::firestore::model::{
    BatchId, DocumentKey, MutableDocument, Mutation, MutationBatch, MutationBatchResult,
    Precondition, SnapshotVersion, TargetId, Timestamp,
};
use crate::firestore::remote::{RemoteEvent, TargetChange};
use crate::logger::Logger;

static LOGGER: LazyLock<Logger> = LazyLock::new(|| Logger::new("@firebase/firestore/local_store"));

/// Resume tokens older than this are persisted even when nothing else changed.
pub const RESUME_TOKEN_MAX_AGE_SECONDS: i64 = 5 * 60;

/// Documents keyed by document key.
pub type DocumentMap = BTreeMap<DocumentKey, MutableDocument>;

/// Outcome of [`LocalStore::write_locally`].
#[derive(Clone, Debug, PartialEq)]
pub struct LocalWriteResult {
    pub batch_id: BatchId,
    /// Local view of every document the batch touched.
    pub changes: DocumentMap,
}

/// Outcome of [`LocalStore::execute_query`].
#[derive(Clone, Debug, Default, PartialEq)]
pub struct QueryResult {
    pub documents: DocumentMap,
    /// Keys the backend last reported as matching the query's target.
    pub remote_keys: BTreeSet<DocumentKey>,
}

/// Keys a view started or stopped showing, reported back so they stay pinned
/// in the cache while visible.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct LocalViewChanges {
    pub target_id: TargetId,
    pub from_cache: bool,
    pub added_keys: BTreeSet<DocumentKey>,
    pub removed_keys: BTreeSet<DocumentKey>,
}

impl LocalViewChanges {
    pub fn from_snapshot(target_id: TargetId, snapshot: &ViewSnapshot) -> Self {
        let mut changes = Self {
            target_id,
            from_cache: snapshot.from_cache(),
            ..Self::default()
        };
        for change in snapshot.document_changes() {
            match change.kind {
                ChangeKind::Added => {
                    changes.added_keys.insert(change.document.key().clone());
                }
                ChangeKind::Removed => {
                    changes.removed_keys.insert(change.document.key().clone());
                }
                ChangeKind::Modified | ChangeKind::Metadata => {}
            }
        }
        changes
    }
}

/// Local view of the data: the remote document cache with queued mutations
/// applied, plus the targets currently listened to.
///
/// Every operation runs as a single persistence transaction. Callers
/// serialize access; the store itself is `&mut self` throughout.
pub struct LocalStore {
    persistence: Arc<Persistence>,
    query_engine: QueryEngine,
    garbage_collector: LruGarbageCollector,
    target_id_generator: TargetIdGenerator,
    /// Active targets; these may carry newer resume state than the cache.
    target_data_by_target: BTreeMap<TargetId, TargetData>,
    target_id_by_query: BTreeMap<String, TargetId>,
    local_view_references: ReferenceSet,
}

impl LocalStore {
    pub fn new(persistence: Arc<Persistence>, lru_params: LruParams) -> FirestoreResult<Self> {
        let highest_target_id = persistence.run_transaction("Start LocalStore", |txn| {
            Ok(txn.target_cache().highest_target_id())
        })?;
        Ok(Self {
            persistence,
            query_engine: QueryEngine,
            garbage_collector: LruGarbageCollector::new(lru_params),
            target_id_generator: TargetIdGenerator::for_target_cache(highest_target_id),
            target_data_by_target: BTreeMap::new(),
            target_id_by_query: BTreeMap::new(),
            local_view_references: ReferenceSet::new(),
        })
    }

    pub fn persistence(&self) -> &Arc<Persistence> {
        &self.persistence
    }

    /// Queues `mutations` as a new batch and returns the resulting local view.
    pub fn write_locally(&mut self, mutations: Vec<Mutation>) -> FirestoreResult<LocalWriteResult> {
        let local_write_time = Timestamp::now();
        let keys: BTreeSet<DocumentKey> = mutations.iter().map(|m| m.key().clone()).collect();

        self.persistence.run_transaction("Locally write mutations", |txn| {
            let existing =
                LocalDocumentsView::new(txn.remote_documents, txn.mutation_queue).get_documents(&keys);

            // Increments are replayed against the value seen at write time,
            // so later remote changes to the base do not shift the result.
            let base_mutations: Vec<Mutation> = mutations
                .iter()
                .filter_map(|mutation| {
                    let document = existing.get(mutation.key())?;
                    let (base_value, mask) = mutation.extract_transform_base_value(document)?;
                    Some(
                        Mutation::patch(mutation.key().clone(), base_value, mask)
                            .with_precondition(Precondition::Exists(true)),
                    )
                })
                .collect();

            let batch = txn
                .mutation_queue()
                .add_mutation_batch(local_write_time, base_mutations, mutations)?;
            let mut changes = existing;
            for document in changes.values_mut() {
                batch.apply_to_local_view(document);
            }
            Ok(LocalWriteResult {
                batch_id: batch.batch_id,
                changes,
            })
        })
    }

    /// Applies the backend's acknowledgement of the oldest batch.
    pub fn acknowledge_batch(&mut self, batch_result: &MutationBatchResult) -> FirestoreResult<DocumentMap> {
        self.persistence.run_transaction("Acknowledge batch", |txn| {
            let batch = &batch_result.batch;
            txn.mutation_queue()
                .acknowledge_batch(batch, batch_result.stream_token.clone())?;
            apply_write_to_remote_documents(txn, batch_result)?;
            txn.mutation_queue().remove_mutation_batch(batch)?;
            release_batch_keys(txn, batch);
            let keys = batch.keys();
            Ok(LocalDocumentsView::new(txn.remote_documents, txn.mutation_queue).get_documents(&keys))
        })
    }

    /// Drops a batch the backend refused; its documents fall back to the
    /// remaining batches replayed over the remote state.
    pub fn reject_batch(&mut self, batch_id: BatchId) -> FirestoreResult<DocumentMap> {
        self.persistence.run_transaction("Reject batch", |txn| {
            let batch = txn
                .mutation_queue()
                .lookup_mutation_batch(batch_id)
                .cloned()
                .ok_or_else(|| not_found(format!("Attempt to reject nonexistent batch {batch_id}")))?;
            txn.mutation_queue().remove_mutation_batch(&batch)?;
            release_batch_keys(txn, &batch);
            let keys = batch.keys();
            Ok(LocalDocumentsView::new(txn.remote_documents, txn.mutation_queue).get_documents(&keys))
        })
    }

    pub fn next_mutation_batch(&self, after_batch_id: BatchId) -> FirestoreResult<Option<MutationBatch>> {
        self.persistence.run_transaction("Get next mutation batch", |txn| {
            Ok(txn
                .mutation_queue()
                .next_mutation_batch_after_batch_id(after_batch_id)
                .cloned())
        })
    }

    pub fn highest_unacknowledged_batch_id(&self) -> FirestoreResult<BatchId> {
        self.persistence.run_transaction("Get highest unacknowledged batch id", |txn| {
            Ok(txn.mutation_queue().highest_unacknowledged_batch_id())
        })
    }

    pub fn last_stream_token(&self) -> FirestoreResult<Vec<u8>> {
        self.persistence.run_transaction("Get last stream token", |txn| {
            Ok(txn.mutation_queue().last_stream_token().to_vec())
        })
    }

    pub fn set_last_stream_token(&mut self, stream_token: Vec<u8>) -> FirestoreResult<()> {
        self.persistence.run_transaction("Set last stream token", |txn| {
            txn.mutation_queue().set_last_stream_token(stream_token);
            Ok(())
        })
    }

    pub fn session_token(&self) -> FirestoreResult<Vec<u8>> {
        self.persistence
            .run_transaction("Get session token", |txn| Ok(txn.globals().session_token().to_vec()))
    }

    pub fn set_session_token(&mut self, session_token: Vec<u8>) -> FirestoreResult<()> {
        self.persistence.run_transaction("Set session token", |txn| {
            txn.globals().set_session_token(session_token);
            Ok(())
        })
    }

    pub fn last_remote_snapshot_version(&self) -> FirestoreResult<SnapshotVersion> {
        self.persistence.run_transaction("Get last remote snapshot version", |txn| {
            Ok(txn.target_cache().last_remote_snapshot_version())
        })
    }

    /// Local view of a single document.
    pub fn read_document(&self, key: &DocumentKey) -> FirestoreResult<MutableDocument> {
        self.persistence.run_transaction("Read document", |txn| {
            Ok(LocalDocumentsView::new(txn.remote_documents, txn.mutation_queue).get_document(key))
        })
    }

    /// Merges a remote event into the caches and returns the local view of
    /// every document it changed.
    pub fn apply_remote_event(&mut self, event: &RemoteEvent) -> FirestoreResult<DocumentMap> {
        let active = &self.target_data_by_target;
        let outcome = self.persistence.run_transaction("Apply remote event", |txn| {
            let sequence_number = txn.sequence_number();
            let mut updated_targets = Vec::new();

            for (target_id, change) in &event.target_changes {
                let Some(old_target_data) = active.get(target_id) else {
                    continue;
                };
                txn.target_cache()
                    .remove_matching_keys(&change.removed_documents, *target_id, sequence_number);
                txn.target_cache()
                    .add_matching_keys(&change.added_documents, *target_id, sequence_number);

                let mut new_target_data = old_target_data.with_sequence_number(sequence_number);
                if event.target_mismatches.contains_key(target_id) {
                    new_target_data = new_target_data
                        .with_resume_token(Vec::new(), SnapshotVersion::none())
                        .with_last_limbo_free_snapshot_version(SnapshotVersion::none());
                } else if !change.resume_token.is_empty() {
                    new_target_data = new_target_data
                        .with_resume_token(change.resume_token.clone(), event.snapshot_version);
                }

                if should_persist_target_data(old_target_data, &new_target_data, change) {
                    txn.target_cache().update_target(&new_target_data)?;
                }
                updated_targets.push(new_target_data);
            }

            for key in &event.resolved_limbo_documents {
                txn.target_cache().touch_document(key, sequence_number);
            }

            let changed = populate_document_changes(txn, event);

            if !event.snapshot_version.is_none() {
                txn.target_cache()
                    .set_last_remote_snapshot_version(event.snapshot_version)?;
            }

            let local_view = LocalDocumentsView::new(txn.remote_documents, txn.mutation_queue)
                .get_local_view_of_documents(changed);
            Ok((updated_targets, local_view))
        });

        let (updated_targets, local_view) = outcome?;
        for target_data in updated_targets {
            self.target_data_by_target
                .insert(target_data.target_id(), target_data);
        }
        Ok(local_view)
    }

    /// Records which documents the views of each target currently show.
    pub fn notify_local_view_changes(&mut self, view_changes: &[LocalViewChanges]) -> FirestoreResult<()> {
        self.persistence.run_transaction("Notify local view changes", |txn| {
            let sequence_number = txn.sequence_number();
            for change in view_changes {
                for key in &change.removed_keys {
                    txn.target_cache().touch_document(key, sequence_number);
                }
            }
            Ok(())
        })?;

        for change in view_changes {
            self.local_view_references
                .add_references(&change.added_keys, change.target_id);
            self.local_view_references
                .remove_references(&change.removed_keys, change.target_id);

            if !change.from_cache {
                if let Some(target_data) = self.target_data_by_target.get(&change.target_id) {
                    // The view is consistent with the backend as of this snapshot.
                    let updated = target_data
                        .with_last_limbo_free_snapshot_version(target_data.snapshot_version());
                    self.target_data_by_target.insert(change.target_id, updated);
                }
            }
        }
        Ok(())
    }

    /// Returns the cached target for `query`, creating and persisting one if needed.
    pub fn allocate_target(&mut self, query: Query) -> FirestoreResult<TargetData> {
        let generator = &mut self.target_id_generator;
        let target_data = self.persistence.run_transaction("Allocate target", |txn| {
            if let Some(cached) = txn.target_cache().get_target(&query) {
                return Ok(cached.clone());
            }
            let target_data = TargetData::new(
                query.clone(),
                generator.next(),
                QueryPurpose::Listen,
                txn.sequence_number(),
            );
            txn.target_cache().add_target(&target_data)?;
            Ok(target_data)
        })?;

        let target_id = target_data.target_id();
        let target_data = self
            .target_data_by_target
            .entry(target_id)
            .or_insert(target_data)
            .clone();
        self.target_id_by_query
            .insert(target_data.target().canonical_id(), target_id);
        Ok(target_data)
    }

    /// Stops tracking `target_id` as active. The target stays cached until
    /// garbage collection removes it.
    pub fn release_target(&mut self, target_id: TargetId) -> FirestoreResult<()> {
        let target_data = self
            .target_data_by_target
            .get(&target_id)
            .cloned()
            .ok_or_else(|| not_found(format!("Tried to release nonexistent target {target_id}")))?;

        self.persistence.run_transaction("Release target", |txn| {
            let sequence_number = txn.sequence_number();
            let updated = target_data.with_sequence_number(sequence_number);
            if txn.target_cache().get_target_by_id(target_id).is_some() {
                txn.target_cache().update_target(&updated)?;
            }
            for key in self.local_view_references.references_for_id(target_id) {
                txn.target_cache().touch_document(&key, sequence_number);
            }
            Ok(())
        })?;

        self.local_view_references.remove_references_for_id(target_id);
        self.target_data_by_target.remove(&target_id);
        self.target_id_by_query
            .remove(&target_data.target().canonical_id());
        LOGGER.debug(format!("Released target {target_id}"));
        Ok(())
    }

    /// Active target data for `query`, falling back to the persisted target.
    pub fn get_target_data(&self, query: &Query) -> FirestoreResult<Option<TargetData>> {
        if let Some(target_data) = self.active_target_for_query(query) {
            return Ok(Some(target_data.clone()));
        }
        self.persistence.run_transaction("Get target data", |txn| {
            Ok(txn.target_cache().get_target(query).cloned())
        })
    }

    /// Target data of an active target.
    pub fn active_target_data(&self, target_id: TargetId) -> Option<&TargetData> {
        self.target_data_by_target.get(&target_id)
    }

    fn active_target_for_query(&self, query: &Query) -> Option<&TargetData> {
        let target_id = self.target_id_by_query.get(&query.canonical_id())?;
        self.target_data_by_target.get(target_id)
    }

    /// Runs `query` against the local cache.
    ///
    /// With `use_previous_results`, documents are read from the target's
    /// remote keys plus anything updated since the target was last free of
    /// limbo documents; otherwise the whole collection is scanned.
    pub fn execute_query(&self, query: &Query, use_previous_results: bool) -> FirestoreResult<QueryResult> {
        let active = self.active_target_for_query(query).cloned();
        self.persistence.run_transaction("Execute query", |txn| {
            let target_data = match active {
                Some(target_data) => Some(target_data),
                None => txn.target_cache().get_target(query).cloned(),
            };
            let (last_limbo_free, remote_keys) = match &target_data {
                Some(target_data) => (
                    target_data.last_limbo_free_snapshot_version(),
                    txn.target_cache().get_matching_keys(target_data.target_id()),
                ),
                None => (SnapshotVersion::none(), BTreeSet::new()),
            };

            let view = LocalDocumentsView::new(txn.remote_documents, txn.mutation_queue);
            let documents = if use_previous_results {
                self.query_engine
                    .get_documents_matching_query(&view, query, last_limbo_free, &remote_keys)
            } else {
                self.query_engine.get_documents_matching_query(
                    &view,
                    query,
                    SnapshotVersion::none(),
                    &BTreeSet::new(),
                )
            };
            Ok(QueryResult {
                documents,
                remote_keys,
            })
        })
    }

    pub fn remote_document_keys(&self, target_id: TargetId) -> FirestoreResult<BTreeSet<DocumentKey>> {
        self.persistence.run_transaction("Remote document keys", |txn| {
            Ok(txn.target_cache().get_matching_keys(target_id))
        })
    }

    /// Runs one LRU collection pass.
    pub fn collect_garbage(&mut self) -> FirestoreResult<LruResults> {
        let active: BTreeSet<TargetId> = self.target_data_by_target.keys().copied().collect();
        let collector = &self.garbage_collector;
        let pinned = &self.local_view_references;
        self.persistence
            .run_transaction("Collect garbage", |txn| collector.collect(txn, &active, pinned))
    }
}

fn apply_write_to_remote_documents(
    txn: &mut Transaction<'_>,
    batch_result: &MutationBatchResult,
) -> FirestoreResult<()> {
    let batch = &batch_result.batch;
    for key in batch.keys() {
        let mut document = txn.remote_documents().get(&key);
        let ack_version = batch_result
            .doc_versions
            .get(&key)
            .copied()
            .ok_or_else(|| internal_error(format!("Acknowledgement is missing a version for {key}")))?;
        if document.version() < ack_version {
            batch.apply_to_remote_document(&mut document, batch_result)?;
            if document.is_valid_document() {
                txn.remote_documents()
                    .add(&document, batch_result.commit_version);
            }
        }
    }
    Ok(())
}

/// Documents of a finished batch become candidates for collection again.
fn release_batch_keys(txn: &mut Transaction<'_>, batch: &MutationBatch) {
    let sequence_number = txn.sequence_number();
    for key in batch.keys() {
        txn.target_cache().touch_document(&key, sequence_number);
    }
}

/// Writes the event's document updates that are not older than the cache.
fn populate_document_changes(txn: &mut Transaction<'_>, event: &RemoteEvent) -> DocumentMap {
    let mut changed = DocumentMap::new();
    for (key, document) in &event.document_updates {
        let existing = txn.remote_documents().get(key);

        // A deletion at the minimum version means access to the document was
        // lost rather than the document being deleted.
        if document.is_no_document() && document.version().is_none() {
            txn.remote_documents().remove(key);
            changed.insert(key.clone(), document.clone());
        } else if !existing.is_valid_document()
            || document.version() > existing.version()
            || (document.version() == existing.version() && existing.has_pending_writes())
        {
            txn.remote_documents().add(document, event.snapshot_version);
            changed.insert(key.clone(), document.clone());
        } else {
            LOGGER.debug(format!(
                "Ignoring outdated watch update for {key}. Current version: {}  Watch version: {}",
                existing.version(),
                document.version()
            ));
        }
    }
    changed
}

fn should_persist_target_data(old: &TargetData, new: &TargetData, change: &TargetChange) -> bool {
    if old.resume_token().is_empty() {
        return true;
    }
    let elapsed = new.snapshot_version().timestamp().to_micros()
        - old.snapshot_version().timestamp().to_micros();
    if elapsed >= RESUME_TOKEN_MAX_AGE_SECONDS * 1_000_000 {
        return true;
    }
    change.has_document_changes()
}
