use std::collections::{BTreeMap, BTreeSet};
use std::sync::LazyLock;

use crate::firestore::error::{internal_error, FirestoreResult};
use crate::firestore::local::{QueryPurpose, TargetData};
use crate::firestore::model::{DatabaseId, DocumentKey, MutableDocument, SnapshotVersion, TargetId};
use crate::firestore::remote::bloom_filter::BloomFilter;
use crate::firestore::remote::existence_filter::ExistenceFilter;
use crate::firestore::remote::remote_event::{RemoteEvent, TargetChange};
use crate::firestore::remote::watch_change::{
    DocumentWatchChange, ExistenceFilterWatchChange, WatchChange, WatchTargetChange,
    WatchTargetChangeState,
};
use crate::logger::Logger;

static LOGGER: LazyLock<Logger> =
    LazyLock::new(|| Logger::new("@firebase/firestore/watch_change_aggregator"));

/// Provides metadata about active targets so the aggregator can reason about
/// documents it has already delivered.
pub trait TargetMetadataProvider {
    /// Keys the client currently believes match `target_id` on the backend.
    fn remote_keys_for_target(&self, target_id: TargetId) -> BTreeSet<DocumentKey>;

    /// Target data for a listened target; `None` once the target is no longer listened to.
    fn target_data_for_target(&self, target_id: TargetId) -> Option<TargetData>;

    fn database_id(&self) -> &DatabaseId;
}

/// Outcome of testing cached keys against an existence filter's bloom filter.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BloomFilterApplicationStatus {
    Success,
    Skipped,
    FalsePositive,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum DocumentChangeKind {
    Added,
    Modified,
    Removed,
}

#[derive(Debug)]
struct TargetState {
    outstanding_responses: usize,
    resume_token: Vec<u8>,
    current: bool,
    // New states are raised in the next event.
    has_pending_changes: bool,
    document_changes: BTreeMap<DocumentKey, DocumentChangeKind>,
}

impl Default for TargetState {
    fn default() -> Self {
        Self {
            outstanding_responses: 0,
            resume_token: Vec::new(),
            current: false,
            has_pending_changes: true,
            document_changes: BTreeMap::new(),
        }
    }
}

impl TargetState {
    fn is_pending(&self) -> bool {
        self.outstanding_responses != 0
    }

    fn update_resume_token(&mut self, resume_token: &[u8]) {
        if !resume_token.is_empty() {
            self.has_pending_changes = true;
            self.resume_token = resume_token.to_vec();
        }
    }

    fn mark_current(&mut self) {
        self.has_pending_changes = true;
        self.current = true;
    }

    fn add_document_change(&mut self, key: DocumentKey, kind: DocumentChangeKind) {
        self.has_pending_changes = true;
        self.document_changes.insert(key, kind);
    }

    fn remove_document_change(&mut self, key: &DocumentKey) {
        self.has_pending_changes = true;
        self.document_changes.remove(key);
    }

    fn clear_pending_changes(&mut self) {
        self.has_pending_changes = false;
        self.document_changes.clear();
    }

    fn record_pending_target_request(&mut self) {
        self.outstanding_responses += 1;
    }

    fn record_target_response(&mut self) {
        self.outstanding_responses = self.outstanding_responses.saturating_sub(1);
    }

    fn count(&self, kind: DocumentChangeKind) -> usize {
        self.document_changes.values().filter(|k| **k == kind).count()
    }

    fn to_target_change(&self) -> TargetChange {
        let mut change = TargetChange::create_synthesized(self.current, self.resume_token.clone());
        for (key, kind) in &self.document_changes {
            let bucket = match kind {
                DocumentChangeKind::Added => &mut change.added_documents,
                DocumentChangeKind::Modified => &mut change.modified_documents,
                DocumentChangeKind::Removed => &mut change.removed_documents,
            };
            bucket.insert(key.clone());
        }
        change
    }
}

/// Folds individual watch changes into consistent [`RemoteEvent`]s.
///
/// Changes for targets that still await listen/unlisten acknowledgements are
/// dropped: the watch stream may still be delivering data for an earlier
/// incarnation of the target.
#[derive(Debug, Default)]
pub struct WatchChangeAggregator {
    target_states: BTreeMap<TargetId, TargetState>,
    pending_document_updates: BTreeMap<DocumentKey, MutableDocument>,
    pending_document_target_mappings: BTreeMap<DocumentKey, BTreeSet<TargetId>>,
    pending_target_resets: BTreeMap<TargetId, QueryPurpose>,
}

impl WatchChangeAggregator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn handle_watch_change(
        &mut self,
        change: &WatchChange,
        provider: &dyn TargetMetadataProvider,
    ) -> FirestoreResult<()> {
        match change {
            WatchChange::TargetChange(target_change) => {
                self.handle_target_change(target_change, provider)
            }
            WatchChange::DocumentChange(document_change) => {
                self.handle_document_change(document_change, provider);
                Ok(())
            }
            WatchChange::ExistenceFilter(filter_change) => {
                self.handle_existence_filter(filter_change, provider);
                Ok(())
            }
        }
    }

    pub fn handle_target_change(
        &mut self,
        change: &WatchTargetChange,
        provider: &dyn TargetMetadataProvider,
    ) -> FirestoreResult<()> {
        for target_id in self.target_ids(change, provider) {
            match change.state {
                WatchTargetChangeState::NoChange => {
                    if self.is_active_target(target_id, provider) {
                        self.ensure_target_state(target_id)
                            .update_resume_token(&change.resume_token);
                    }
                }
                WatchTargetChangeState::Added => {
                    let state = self.ensure_target_state(target_id);
                    state.record_target_response();
                    if !state.is_pending() {
                        // Freshly added target; drop anything buffered for an earlier incarnation.
                        state.clear_pending_changes();
                    }
                    state.update_resume_token(&change.resume_token);
                }
                WatchTargetChangeState::Removed => {
                    if let Some(cause) = &change.cause {
                        return Err(internal_error(format!(
                            "Target {target_id} was removed with an error ({cause}); it must be rejected instead"
                        )));
                    }
                    let state = self.ensure_target_state(target_id);
                    state.record_target_response();
                    if !state.is_pending() {
                        self.remove_target(target_id);
                    }
                }
                WatchTargetChangeState::Current => {
                    if self.is_active_target(target_id, provider) {
                        let state = self.ensure_target_state(target_id);
                        state.mark_current();
                        state.update_resume_token(&change.resume_token);
                    }
                }
                WatchTargetChangeState::Reset => {
                    if self.is_active_target(target_id, provider) {
                        // Reset the target and wait for the backend to resend the result set.
                        self.reset_target(target_id, provider);
                        self.ensure_target_state(target_id)
                            .update_resume_token(&change.resume_token);
                    }
                }
            }
        }
        Ok(())
    }

    pub fn handle_document_change(
        &mut self,
        change: &DocumentWatchChange,
        provider: &dyn TargetMetadataProvider,
    ) {
        let key = &change.key;
        for target_id in &change.updated_target_ids {
            match &change.new_document {
                Some(document) if document.is_found_document() => {
                    self.add_document_to_target(*target_id, document, provider);
                }
                Some(document) => {
                    self.remove_document_from_target(
                        *target_id,
                        key,
                        Some(document.clone()),
                        provider,
                    );
                }
                None => {}
            }
        }

        for target_id in &change.removed_target_ids {
            self.remove_document_from_target(
                *target_id,
                key,
                change.new_document.clone(),
                provider,
            );
        }
    }

    /// Compares the backend's document count with the local one and schedules
    /// a target reset when they cannot be reconciled.
    pub fn handle_existence_filter(
        &mut self,
        change: &ExistenceFilterWatchChange,
        provider: &dyn TargetMetadataProvider,
    ) -> Option<BloomFilterApplicationStatus> {
        let target_id = change.target_id;
        let expected_count = change.filter.count;
        let target_data = self.target_data_for_active_target(target_id, provider)?;
        let target = target_data.target();

        if target.is_document_query() {
            if expected_count == 0 {
                // The single document this target watches has been deleted.
                let key = DocumentKey::from_path(target.path().clone()).ok()?;
                let deleted = MutableDocument::no_document(key.clone(), SnapshotVersion::none());
                self.remove_document_from_target(target_id, &key, Some(deleted), provider);
            } else if expected_count != 1 {
                LOGGER.warn(format!(
                    "Single document target {target_id} reported {expected_count} documents"
                ));
            }
            return None;
        }

        let current_count = self.current_document_count_for_target(target_id, provider);
        if current_count == i64::from(expected_count) {
            return None;
        }

        let status = match parse_bloom_filter(&change.filter) {
            Some(bloom_filter) => {
                self.apply_bloom_filter(&bloom_filter, change, current_count, provider)
            }
            None => BloomFilterApplicationStatus::Skipped,
        };
        LOGGER.debug(format!(
            "Existence filter mismatch for target {target_id}: expected {expected_count}, \
             have {current_count}; bloom filter {status:?}"
        ));

        if status != BloomFilterApplicationStatus::Success {
            self.reset_target(target_id, provider);
            let purpose = if status == BloomFilterApplicationStatus::FalsePositive {
                QueryPurpose::ExistenceFilterMismatchBloom
            } else {
                QueryPurpose::ExistenceFilterMismatch
            };
            self.pending_target_resets.insert(target_id, purpose);
        }
        Some(status)
    }

    /// Converts everything accumulated so far into a [`RemoteEvent`] and resets
    /// the pending document state.
    pub fn create_remote_event(
        &mut self,
        snapshot_version: SnapshotVersion,
        provider: &dyn TargetMetadataProvider,
    ) -> RemoteEvent {
        let mut target_changes = BTreeMap::new();
        let target_ids: Vec<TargetId> = self.target_states.keys().copied().collect();

        for target_id in target_ids {
            let Some(target_data) = self.target_data_for_active_target(target_id, provider) else {
                continue;
            };
            let current = self
                .target_states
                .get(&target_id)
                .is_some_and(|state| state.current);

            if current && target_data.target().is_document_query() {
                // A current document target without the document means it does not exist.
                if let Ok(key) = DocumentKey::from_path(target_data.target().path().clone()) {
                    if !self.pending_document_updates.contains_key(&key)
                        && !target_contains_document(target_id, &key, provider)
                    {
                        let deleted = MutableDocument::no_document(key.clone(), snapshot_version);
                        self.remove_document_from_target(target_id, &key, Some(deleted), provider);
                    }
                }
            }

            if let Some(state) = self.target_states.get_mut(&target_id) {
                if state.has_pending_changes {
                    target_changes.insert(target_id, state.to_target_change());
                    state.clear_pending_changes();
                }
            }
        }

        let resolved_limbo_documents = self
            .pending_document_target_mappings
            .iter()
            .filter(|(_, target_ids)| {
                target_ids.iter().all(|target_id| {
                    self.target_data_for_active_target(*target_id, provider)
                        .map_or(true, |data| data.purpose() == QueryPurpose::LimboResolution)
                })
            })
            .map(|(key, _)| key.clone())
            .collect();

        self.pending_document_target_mappings.clear();
        RemoteEvent {
            snapshot_version,
            target_changes,
            target_mismatches: std::mem::take(&mut self.pending_target_resets),
            document_updates: std::mem::take(&mut self.pending_document_updates),
            resolved_limbo_documents,
        }
    }

    /// Notes that a listen or unlisten request was sent for `target_id`.
    pub fn record_pending_target_request(&mut self, target_id: TargetId) {
        self.ensure_target_state(target_id)
            .record_pending_target_request();
    }

    pub fn remove_target(&mut self, target_id: TargetId) {
        self.target_states.remove(&target_id);
    }

    fn target_ids(
        &self,
        change: &WatchTargetChange,
        provider: &dyn TargetMetadataProvider,
    ) -> Vec<TargetId> {
        if !change.target_ids.is_empty() {
            return change.target_ids.clone();
        }
        self.target_states
            .keys()
            .copied()
            .filter(|target_id| self.is_active_target(*target_id, provider))
            .collect()
    }

    fn ensure_target_state(&mut self, target_id: TargetId) -> &mut TargetState {
        self.target_states.entry(target_id).or_default()
    }

    fn is_active_target(&self, target_id: TargetId, provider: &dyn TargetMetadataProvider) -> bool {
        self.target_data_for_active_target(target_id, provider)
            .is_some()
    }

    fn target_data_for_active_target(
        &self,
        target_id: TargetId,
        provider: &dyn TargetMetadataProvider,
    ) -> Option<TargetData> {
        match self.target_states.get(&target_id) {
            Some(state) if state.is_pending() => None,
            _ => provider.target_data_for_target(target_id),
        }
    }

    fn add_document_to_target(
        &mut self,
        target_id: TargetId,
        document: &MutableDocument,
        provider: &dyn TargetMetadataProvider,
    ) {
        if !self.is_active_target(target_id, provider) {
            return;
        }
        let key = document.key().clone();
        let kind = if target_contains_document(target_id, &key, provider) {
            DocumentChangeKind::Modified
        } else {
            DocumentChangeKind::Added
        };
        self.ensure_target_state(target_id)
            .add_document_change(key.clone(), kind);
        self.pending_document_updates
            .insert(key.clone(), document.clone());
        self.pending_document_target_mappings
            .entry(key)
            .or_default()
            .insert(target_id);
    }

    fn remove_document_from_target(
        &mut self,
        target_id: TargetId,
        key: &DocumentKey,
        updated_document: Option<MutableDocument>,
        provider: &dyn TargetMetadataProvider,
    ) {
        if !self.is_active_target(target_id, provider) {
            return;
        }
        let contained = target_contains_document(target_id, key, provider);
        let state = self.ensure_target_state(target_id);
        if contained {
            state.add_document_change(key.clone(), DocumentChangeKind::Removed);
        } else {
            // Entered and left before an event was raised.
            state.remove_document_change(key);
        }
        self.pending_document_target_mappings
            .entry(key.clone())
            .or_default()
            .insert(target_id);
        if let Some(document) = updated_document {
            self.pending_document_updates.insert(key.clone(), document);
        }
    }

    fn reset_target(&mut self, target_id: TargetId, provider: &dyn TargetMetadataProvider) {
        self.target_states.insert(target_id, TargetState::default());
        for key in provider.remote_keys_for_target(target_id) {
            self.remove_document_from_target(target_id, &key, None, provider);
        }
    }

    fn current_document_count_for_target(
        &self,
        target_id: TargetId,
        provider: &dyn TargetMetadataProvider,
    ) -> i64 {
        let remote = provider.remote_keys_for_target(target_id).len() as i64;
        let (added, removed) = self
            .target_states
            .get(&target_id)
            .map(|state| {
                (
                    state.count(DocumentChangeKind::Added) as i64,
                    state.count(DocumentChangeKind::Removed) as i64,
                )
            })
            .unwrap_or((0, 0));
        remote + added - removed
    }

    fn apply_bloom_filter(
        &mut self,
        bloom_filter: &BloomFilter,
        change: &ExistenceFilterWatchChange,
        current_count: i64,
        provider: &dyn TargetMetadataProvider,
    ) -> BloomFilterApplicationStatus {
        let removed = self.filter_removed_documents(bloom_filter, change.target_id, provider);
        if i64::from(change.filter.count) == current_count - removed {
            BloomFilterApplicationStatus::Success
        } else {
            BloomFilterApplicationStatus::FalsePositive
        }
    }

    /// Removes every cached key the bloom filter does not report as unchanged.
    fn filter_removed_documents(
        &mut self,
        bloom_filter: &BloomFilter,
        target_id: TargetId,
        provider: &dyn TargetMetadataProvider,
    ) -> i64 {
        let mut removed = 0;
        for key in provider.remote_keys_for_target(target_id) {
            let name = provider.database_id().document_resource_name(&key);
            if !bloom_filter.might_contain(&name) {
                self.remove_document_from_target(target_id, &key, None, provider);
                removed += 1;
            }
        }
        removed
    }
}

fn target_contains_document(
    target_id: TargetId,
    key: &DocumentKey,
    provider: &dyn TargetMetadataProvider,
) -> bool {
    provider.remote_keys_for_target(target_id).contains(key)
}

fn parse_bloom_filter(filter: &ExistenceFilter) -> Option<BloomFilter> {
    let parameters = filter.unchanged_names.as_ref()?;
    match parameters.to_bloom_filter() {
        Ok(bloom_filter) if bloom_filter.bit_count() > 0 => Some(bloom_filter),
        Ok(_) => None,
        Err(err) => {
            LOGGER.warn(format!(
                "Applying bloom filter failed: ({}) {}",
                err.code_str(),
                err.message()
            ));
            None
        }
    }
}
