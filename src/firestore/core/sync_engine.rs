use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, LazyLock};

use async_channel::{Receiver, Sender};
use async_lock::Mutex;

use crate::firestore::core::drain_queue::DrainQueue;
use crate::firestore::core::query::Query;
use crate::firestore::core::target_id_generator::TargetIdGenerator;
use crate::firestore::core::view::{LimboChangeKind, LimboDocumentChange, OnlineState, View};
use crate::firestore::core::view_snapshot::ViewSnapshot;
use crate::firestore::error::{aborted, internal_error, FirestoreError, FirestoreResult};
use crate::firestore::local::{
    DocumentMap, LocalStore, LocalViewChanges, LruParams, LruResults, Persistence, QueryPurpose,
    ReferenceSet, TargetData,
};
use crate::firestore::model::{
    BatchId, DatabaseId, DocumentKey, MutableDocument, Mutation, MutationBatch,
    MutationBatchResult, SnapshotVersion, TargetId, BATCH_ID_UNKNOWN,
    INVALID_LISTEN_SEQUENCE_NUMBER,
};
use crate::firestore::remote::{
    box_remote_store_future, BloomFilterApplicationStatus, ExistenceFilterWatchChange,
    RemoteEvent, RemoteStore, RemoteStoreFuture, RemoteSyncer, TargetChange,
    TargetMetadataProvider, WatchChange, WatchChangeAggregator, WatchTargetChange,
    WatchTargetChangeState,
};
use crate::logger::Logger;
use crate::platform::runtime::spawn_detached;

static LOGGER: LazyLock<Logger> = LazyLock::new(|| Logger::new("@firebase/firestore/sync_engine"));

pub const DEFAULT_MAX_CONCURRENT_LIMBO_RESOLUTIONS: usize = 100;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SyncEngineSettings {
    /// Limbo documents resolved at the same time; the rest wait in a queue.
    pub max_concurrent_limbo_resolutions: usize,
    pub lru_params: LruParams,
}

impl Default for SyncEngineSettings {
    fn default() -> Self {
        Self {
            max_concurrent_limbo_resolutions: DEFAULT_MAX_CONCURRENT_LIMBO_RESOLUTIONS,
            lru_params: LruParams::default(),
        }
    }
}

/// Per-listener delivery options.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ListenOptions {
    /// Also raise snapshots whose only change is metadata: pending-write
    /// state or the from-cache flag.
    pub include_metadata_changes: bool,
    /// Hold back a from-cache first snapshot until the backend answers,
    /// unless the client is known to be offline.
    pub wait_for_sync_when_online: bool,
}

type SnapshotCallback = Arc<dyn Fn(FirestoreResult<ViewSnapshot>) + Send + Sync + 'static>;

type Delivery = (SnapshotCallback, FirestoreResult<ViewSnapshot>);

enum RemoteRequest {
    Listen(TargetData),
    Unlisten(TargetId),
    Write(MutationBatch),
}

/// Decides which view snapshots one listener gets to see.
struct QueryListener {
    id: u64,
    options: ListenOptions,
    callback: SnapshotCallback,
    raised_initial_event: bool,
    snapshot: Option<ViewSnapshot>,
}

impl QueryListener {
    fn new(id: u64, options: ListenOptions, callback: SnapshotCallback) -> Self {
        Self {
            id,
            options,
            callback,
            raised_initial_event: false,
            snapshot: None,
        }
    }

    fn on_view_snapshot(
        &mut self,
        snapshot: &ViewSnapshot,
        online_state: OnlineState,
    ) -> Option<ViewSnapshot> {
        let snapshot = if self.options.include_metadata_changes {
            snapshot.clone()
        } else {
            snapshot.without_metadata_changes()
        };

        let raised = if !self.raised_initial_event {
            if self.should_raise_initial_event(&snapshot, online_state) {
                Some(self.raise_initial_event(&snapshot))
            } else {
                None
            }
        } else if self.should_raise_event(&snapshot) {
            Some(snapshot.clone())
        } else {
            None
        };
        self.snapshot = Some(snapshot);
        raised
    }

    fn on_online_state_change(&mut self, online_state: OnlineState) -> Option<ViewSnapshot> {
        if self.raised_initial_event {
            return None;
        }
        let snapshot = self.snapshot.clone()?;
        if self.should_raise_initial_event(&snapshot, online_state) {
            Some(self.raise_initial_event(&snapshot))
        } else {
            None
        }
    }

    fn should_raise_initial_event(&self, snapshot: &ViewSnapshot, online_state: OnlineState) -> bool {
        if !snapshot.from_cache() {
            return true;
        }
        let maybe_online = online_state != OnlineState::Offline;
        if self.options.wait_for_sync_when_online && maybe_online {
            return false;
        }
        // An empty cached result is only worth showing when the backend cannot answer.
        !snapshot.documents().is_empty() || online_state == OnlineState::Offline
    }

    fn should_raise_event(&self, snapshot: &ViewSnapshot) -> bool {
        if !snapshot.document_changes().is_empty() {
            return true;
        }
        let pending_writes_changed = self
            .snapshot
            .as_ref()
            .is_some_and(|previous| previous.has_pending_writes() != snapshot.has_pending_writes());
        if snapshot.sync_state_changed() || pending_writes_changed {
            return self.options.include_metadata_changes;
        }
        false
    }

    fn raise_initial_event(&mut self, snapshot: &ViewSnapshot) -> ViewSnapshot {
        self.raised_initial_event = true;
        ViewSnapshot::from_initial_documents(
            snapshot.query().clone(),
            snapshot.documents().clone(),
            snapshot.mutated_keys().clone(),
            snapshot.from_cache(),
            snapshot.excludes_metadata_changes(),
        )
    }
}

/// A listened query: its view, target and the listeners sharing it.
struct QueryView {
    query: Query,
    target_id: TargetId,
    view: View,
    snapshot: Option<ViewSnapshot>,
    listeners: Vec<QueryListener>,
}

impl QueryView {
    fn notify(&mut self, snapshot: ViewSnapshot, online_state: OnlineState, deliveries: &mut Vec<Delivery>) {
        for listener in &mut self.listeners {
            if let Some(raised) = listener.on_view_snapshot(&snapshot, online_state) {
                deliveries.push((listener.callback.clone(), Ok(raised)));
            }
        }
        self.snapshot = Some(snapshot);
    }
}

#[derive(Debug)]
struct LimboResolution {
    key: DocumentKey,
    /// Set once the limbo target delivered the document; a later removal clears it.
    document_received: bool,
}

/// Keys a target is believed to contain on the backend.
fn remote_keys_for_target(
    target_id: TargetId,
    query_views: &BTreeMap<String, QueryView>,
    queries_by_target: &BTreeMap<TargetId, String>,
    limbo_resolutions: &BTreeMap<TargetId, LimboResolution>,
) -> BTreeSet<DocumentKey> {
    if let Some(resolution) = limbo_resolutions.get(&target_id) {
        return if resolution.document_received {
            BTreeSet::from([resolution.key.clone()])
        } else {
            BTreeSet::new()
        };
    }
    queries_by_target
        .get(&target_id)
        .and_then(|query_id| query_views.get(query_id))
        .map(|query_view| query_view.view.synced_documents().clone())
        .unwrap_or_default()
}

struct TargetMetadata<'a> {
    database_id: &'a DatabaseId,
    listen_targets: &'a BTreeMap<TargetId, TargetData>,
    query_views: &'a BTreeMap<String, QueryView>,
    queries_by_target: &'a BTreeMap<TargetId, String>,
    limbo_resolutions: &'a BTreeMap<TargetId, LimboResolution>,
}

impl TargetMetadataProvider for TargetMetadata<'_> {
    fn remote_keys_for_target(&self, target_id: TargetId) -> BTreeSet<DocumentKey> {
        remote_keys_for_target(
            target_id,
            self.query_views,
            self.queries_by_target,
            self.limbo_resolutions,
        )
    }

    fn target_data_for_target(&self, target_id: TargetId) -> Option<TargetData> {
        self.listen_targets.get(&target_id).cloned()
    }

    fn database_id(&self) -> &DatabaseId {
        self.database_id
    }
}

/// Everything guarded by the engine's serial lock.
struct SyncEngineState {
    local_store: LocalStore,
    settings: SyncEngineSettings,
    database_id: DatabaseId,
    aggregator: WatchChangeAggregator,
    online_state: OnlineState,
    /// Targets the remote store is asked to watch, including limbo targets.
    listen_targets: BTreeMap<TargetId, TargetData>,
    query_views: BTreeMap<String, QueryView>,
    queries_by_target: BTreeMap<TargetId, String>,
    limbo_target_ids: TargetIdGenerator,
    enqueued_limbo_resolutions: VecDeque<DocumentKey>,
    active_limbo_targets_by_key: BTreeMap<DocumentKey, TargetId>,
    active_limbo_resolutions_by_target: BTreeMap<TargetId, LimboResolution>,
    /// Which views keep each limbo document alive.
    limbo_document_refs: ReferenceSet,
    pending_writes: BTreeMap<BatchId, Sender<FirestoreResult<()>>>,
    outbox: Vec<RemoteRequest>,
    deliveries: Vec<Delivery>,
}

impl SyncEngineState {
    fn new(local_store: LocalStore, database_id: DatabaseId, settings: SyncEngineSettings) -> Self {
        Self {
            local_store,
            settings,
            database_id,
            aggregator: WatchChangeAggregator::new(),
            online_state: OnlineState::Unknown,
            listen_targets: BTreeMap::new(),
            query_views: BTreeMap::new(),
            queries_by_target: BTreeMap::new(),
            limbo_target_ids: TargetIdGenerator::for_sync_engine(),
            enqueued_limbo_resolutions: VecDeque::new(),
            active_limbo_targets_by_key: BTreeMap::new(),
            active_limbo_resolutions_by_target: BTreeMap::new(),
            limbo_document_refs: ReferenceSet::new(),
            pending_writes: BTreeMap::new(),
            outbox: Vec::new(),
            deliveries: Vec::new(),
        }
    }

    fn aggregator_with_metadata(&mut self) -> (&mut WatchChangeAggregator, TargetMetadata<'_>) {
        (
            &mut self.aggregator,
            TargetMetadata {
                database_id: &self.database_id,
                listen_targets: &self.listen_targets,
                query_views: &self.query_views,
                queries_by_target: &self.queries_by_target,
                limbo_resolutions: &self.active_limbo_resolutions_by_target,
            },
        )
    }

    fn remote_keys(&self, target_id: TargetId) -> BTreeSet<DocumentKey> {
        remote_keys_for_target(
            target_id,
            &self.query_views,
            &self.queries_by_target,
            &self.active_limbo_resolutions_by_target,
        )
    }

    fn stream_open(&self) -> bool {
        self.online_state != OnlineState::Offline
    }

    // Listen / unlisten

    fn listen(&mut self, query: Query, mut listener: QueryListener) -> FirestoreResult<()> {
        let query_id = query.canonical_id();
        let online_state = self.online_state;
        if let Some(query_view) = self.query_views.get_mut(&query_id) {
            if let Some(snapshot) = &query_view.snapshot {
                if let Some(raised) = listener.on_view_snapshot(snapshot, online_state) {
                    self.deliveries.push((listener.callback.clone(), Ok(raised)));
                }
            }
            query_view.listeners.push(listener);
            return Ok(());
        }

        let target_data = self.local_store.allocate_target(query.clone())?;
        let target_id = target_data.target_id();
        let query_result = match self.local_store.execute_query(&query, true) {
            Ok(result) => result,
            Err(err) => {
                if let Err(release_err) = self.local_store.release_target(target_id) {
                    LOGGER.warn(format!("Failed to release target {target_id}: {release_err}"));
                }
                return Err(err);
            }
        };

        let mut view = View::new(query.clone(), query_result.remote_keys);
        let doc_changes = view.compute_document_changes(&query_result.documents, None);
        let synthesized = TargetChange::create_synthesized(false, Vec::new());
        let view_change = view.apply_changes(doc_changes, Some(&synthesized));

        LOGGER.debug(format!("Listening to {query_id} as target {target_id}"));
        self.queries_by_target.insert(target_id, query_id.clone());
        self.query_views.insert(
            query_id.clone(),
            QueryView {
                query,
                target_id,
                view,
                snapshot: None,
                listeners: vec![listener],
            },
        );
        self.update_tracked_limbos(target_id, view_change.limbo_changes);
        if let Some(snapshot) = view_change.snapshot {
            let view_changes = LocalViewChanges::from_snapshot(target_id, &snapshot);
            self.deliver_snapshot(&query_id, snapshot);
            self.local_store.notify_local_view_changes(&[view_changes])?;
        }
        self.remote_listen(target_data);
        Ok(())
    }

    fn stop_listening(&mut self, query_id: &str, listener_id: u64) -> FirestoreResult<()> {
        let Some(query_view) = self.query_views.get_mut(query_id) else {
            return Ok(());
        };
        query_view.listeners.retain(|listener| listener.id != listener_id);
        if !query_view.listeners.is_empty() {
            return Ok(());
        }

        let target_id = query_view.target_id;
        LOGGER.debug(format!("Last listener of {query_id} removed; releasing target {target_id}"));
        self.query_views.remove(query_id);
        self.queries_by_target.remove(&target_id);
        self.remote_unlisten(target_id);
        self.remove_and_cleanup_target(target_id);
        self.local_store.release_target(target_id)
    }

    fn remove_and_cleanup_target(&mut self, target_id: TargetId) {
        for key in self.limbo_document_refs.remove_references_for_id(target_id) {
            if !self.limbo_document_refs.contains_key(&key) {
                self.remove_limbo_target(&key);
            }
        }
    }

    fn deliver_snapshot(&mut self, query_id: &str, snapshot: ViewSnapshot) {
        if let Some(query_view) = self.query_views.get_mut(query_id) {
            query_view.notify(snapshot, self.online_state, &mut self.deliveries);
        }
    }

    // Outbound requests

    fn remote_listen(&mut self, target_data: TargetData) {
        let target_id = target_data.target_id();
        if self.listen_targets.contains_key(&target_id) {
            return;
        }
        self.listen_targets.insert(target_id, target_data.clone());
        self.send_watch_request(target_data);
    }

    fn remote_unlisten(&mut self, target_id: TargetId) {
        if self.listen_targets.remove(&target_id).is_none() {
            return;
        }
        if self.stream_open() {
            self.send_unwatch_request(target_id);
        } else {
            self.aggregator.remove_target(target_id);
        }
    }

    fn send_watch_request(&mut self, target_data: TargetData) {
        if !self.stream_open() {
            return;
        }
        let target_id = target_data.target_id();
        self.aggregator.record_pending_target_request(target_id);
        let target_data =
            if !target_data.resume_token().is_empty() || !target_data.snapshot_version().is_none() {
                // Lets the backend tell whether documents were deleted while not listening.
                let expected_count = self.remote_keys(target_id).len() as i32;
                target_data.with_expected_count(Some(expected_count))
            } else {
                target_data
            };
        self.outbox.push(RemoteRequest::Listen(target_data));
    }

    fn send_unwatch_request(&mut self, target_id: TargetId) {
        if !self.stream_open() {
            return;
        }
        self.aggregator.record_pending_target_request(target_id);
        self.outbox.push(RemoteRequest::Unlisten(target_id));
    }

    // Limbo resolution

    fn update_tracked_limbos(&mut self, target_id: TargetId, changes: Vec<LimboDocumentChange>) {
        for change in changes {
            match change.kind {
                LimboChangeKind::Added => {
                    self.limbo_document_refs.add_reference(&change.key, target_id);
                    self.track_limbo_change(change.key);
                }
                LimboChangeKind::Removed => {
                    LOGGER.debug(format!("Document no longer in limbo: {}", change.key));
                    self.limbo_document_refs.remove_reference(&change.key, target_id);
                    if !self.limbo_document_refs.contains_key(&change.key) {
                        self.remove_limbo_target(&change.key);
                    }
                }
            }
        }
    }

    fn track_limbo_change(&mut self, key: DocumentKey) {
        if self.active_limbo_targets_by_key.contains_key(&key)
            || self.enqueued_limbo_resolutions.contains(&key)
        {
            return;
        }
        LOGGER.debug(format!("New document in limbo: {key}"));
        self.enqueued_limbo_resolutions.push_back(key);
        self.pump_enqueued_limbo_resolutions();
    }

    fn pump_enqueued_limbo_resolutions(&mut self) {
        while self.active_limbo_targets_by_key.len() < self.settings.max_concurrent_limbo_resolutions {
            let Some(key) = self.enqueued_limbo_resolutions.pop_front() else {
                break;
            };
            let target_id = self.limbo_target_ids.next();
            self.active_limbo_targets_by_key.insert(key.clone(), target_id);
            self.active_limbo_resolutions_by_target.insert(
                target_id,
                LimboResolution {
                    key: key.clone(),
                    document_received: false,
                },
            );
            self.remote_listen(TargetData::new(
                Query::for_document(&key),
                target_id,
                QueryPurpose::LimboResolution,
                INVALID_LISTEN_SEQUENCE_NUMBER,
            ));
        }
    }

    fn remove_limbo_target(&mut self, key: &DocumentKey) {
        self.enqueued_limbo_resolutions.retain(|queued| queued != key);
        if let Some(target_id) = self.active_limbo_targets_by_key.remove(key) {
            self.active_limbo_resolutions_by_target.remove(&target_id);
            self.remote_unlisten(target_id);
            self.pump_enqueued_limbo_resolutions();
        }
    }

    // Watch stream

    fn handle_watch_changes(
        &mut self,
        changes: Vec<WatchChange>,
        snapshot_version: SnapshotVersion,
    ) -> FirestoreResult<()> {
        for change in &changes {
            if let WatchChange::TargetChange(target_change) = change {
                if target_change.state == WatchTargetChangeState::Removed && target_change.cause.is_some() {
                    self.handle_target_error(target_change)?;
                    continue;
                }
            }
            let (aggregator, metadata) = self.aggregator_with_metadata();
            aggregator.handle_watch_change(change, &metadata)?;
        }

        if !snapshot_version.is_none() {
            let last_remote_version = self.local_store.last_remote_snapshot_version()?;
            if snapshot_version >= last_remote_version {
                self.raise_watch_snapshot(snapshot_version)?;
            }
        }
        Ok(())
    }

    fn handle_target_error(&mut self, change: &WatchTargetChange) -> FirestoreResult<()> {
        let cause = change
            .cause
            .clone()
            .unwrap_or_else(|| internal_error("Target removed without a cause"));
        for target_id in &change.target_ids {
            if self.listen_targets.remove(target_id).is_some() {
                self.aggregator.remove_target(*target_id);
                self.reject_listen(*target_id, cause.clone())?;
            }
        }
        Ok(())
    }

    fn handle_existence_filter(
        &mut self,
        change: &ExistenceFilterWatchChange,
    ) -> Option<BloomFilterApplicationStatus> {
        let (aggregator, metadata) = self.aggregator_with_metadata();
        aggregator.handle_existence_filter(change, &metadata)
    }

    fn raise_watch_snapshot(&mut self, snapshot_version: SnapshotVersion) -> FirestoreResult<()> {
        let (aggregator, metadata) = self.aggregator_with_metadata();
        let event = aggregator.create_remote_event(snapshot_version, &metadata);

        for (target_id, change) in &event.target_changes {
            if change.resume_token.is_empty() {
                continue;
            }
            if let Some(target_data) = self.listen_targets.get_mut(target_id) {
                *target_data = target_data.with_resume_token(change.resume_token.clone(), snapshot_version);
            }
        }

        for (target_id, purpose) in &event.target_mismatches {
            let Some(target_data) = self.listen_targets.get(target_id).cloned() else {
                continue;
            };
            // Without the resume token the backend resends the full result set.
            self.listen_targets.insert(
                *target_id,
                target_data.with_resume_token(Vec::new(), target_data.snapshot_version()),
            );
            self.send_unwatch_request(*target_id);
            let request = target_data
                .with_resume_token(Vec::new(), SnapshotVersion::none())
                .with_purpose(*purpose);
            self.send_watch_request(request);
        }

        self.apply_remote_event(event)
    }

    fn apply_remote_event(&mut self, event: RemoteEvent) -> FirestoreResult<()> {
        for (target_id, change) in &event.target_changes {
            let Some(resolution) = self.active_limbo_resolutions_by_target.get_mut(target_id) else {
                continue;
            };
            let change_count = change.added_documents.len()
                + change.modified_documents.len()
                + change.removed_documents.len();
            if change_count > 1 {
                return Err(internal_error(
                    "Limbo resolution for a single document contains multiple changes",
                ));
            }
            if !change.added_documents.is_empty() {
                resolution.document_received = true;
            } else if !change.modified_documents.is_empty() {
                if !resolution.document_received {
                    return Err(internal_error("Received change for limbo target document without add"));
                }
            } else if !change.removed_documents.is_empty() {
                if !resolution.document_received {
                    return Err(internal_error("Received remove for limbo target document without add"));
                }
                resolution.document_received = false;
            }
        }

        let changes = self.local_store.apply_remote_event(&event)?;
        self.emit_new_snapshots(&changes, Some(&event))
    }

    fn reject_listen(&mut self, target_id: TargetId, error: FirestoreError) -> FirestoreResult<()> {
        self.listen_targets.remove(&target_id);
        self.aggregator.remove_target(target_id);

        if let Some(resolution) = self.active_limbo_resolutions_by_target.remove(&target_id) {
            // The document cannot be read; treat it as deleted so the views drop it.
            let key = resolution.key;
            LOGGER.debug(format!("Limbo resolution for {key} failed: {error}"));
            self.active_limbo_targets_by_key.remove(&key);
            self.pump_enqueued_limbo_resolutions();

            let mut event = RemoteEvent {
                snapshot_version: SnapshotVersion::none(),
                ..RemoteEvent::default()
            };
            event.document_updates.insert(
                key.clone(),
                MutableDocument::no_document(key.clone(), SnapshotVersion::none()),
            );
            event.resolved_limbo_documents.insert(key);
            return self.apply_remote_event(event);
        }

        let Some(query_id) = self.queries_by_target.remove(&target_id) else {
            return Ok(());
        };
        LOGGER.warn(format!("Listen for {query_id} failed: {error}"));
        if let Some(query_view) = self.query_views.remove(&query_id) {
            for listener in query_view.listeners {
                self.deliveries.push((listener.callback, Err(error.clone())));
            }
        }
        self.remove_and_cleanup_target(target_id);
        self.local_store.release_target(target_id)
    }

    fn handle_stream_error(&mut self, error: FirestoreError) -> FirestoreResult<()> {
        LOGGER.warn(format!("Watch stream failed: {error}"));
        self.aggregator = WatchChangeAggregator::new();
        self.apply_online_state_change(OnlineState::Offline)
    }

    fn apply_online_state_change(&mut self, online_state: OnlineState) -> FirestoreResult<()> {
        if self.online_state == online_state {
            return Ok(());
        }
        let was_offline = self.online_state == OnlineState::Offline;
        self.online_state = online_state;
        LOGGER.debug(format!("Online state changed to {online_state:?}"));
        if online_state == OnlineState::Offline {
            // Responses owed by the closed stream never arrive.
            self.aggregator = WatchChangeAggregator::new();
        }

        let mut view_changes = Vec::new();
        for query_view in self.query_views.values_mut() {
            for listener in &mut query_view.listeners {
                if let Some(raised) = listener.on_online_state_change(online_state) {
                    self.deliveries.push((listener.callback.clone(), Ok(raised)));
                }
            }
            let view_change = query_view.view.apply_online_state_change(online_state);
            if let Some(snapshot) = view_change.snapshot {
                view_changes.push(LocalViewChanges::from_snapshot(query_view.target_id, &snapshot));
                query_view.notify(snapshot, online_state, &mut self.deliveries);
            }
        }
        self.local_store.notify_local_view_changes(&view_changes)?;

        if was_offline && self.stream_open() {
            let targets: Vec<TargetData> = self.listen_targets.values().cloned().collect();
            for target_data in targets {
                self.send_watch_request(target_data);
            }
            self.pump_writes()?;
        }
        Ok(())
    }

    // Writes

    fn write(&mut self, mutations: Vec<Mutation>) -> FirestoreResult<PendingWrite> {
        let result = self.local_store.write_locally(mutations)?;
        let batch_id = result.batch_id;
        let (sender, receiver) = async_channel::bounded(1);
        self.pending_writes.insert(batch_id, sender);
        self.emit_new_snapshots(&result.changes, None)?;

        if self.stream_open() {
            if let Some(batch) = self.local_store.next_mutation_batch(batch_id - 1)? {
                self.outbox.push(RemoteRequest::Write(batch));
            }
        }
        Ok(PendingWrite { batch_id, receiver })
    }

    fn pump_writes(&mut self) -> FirestoreResult<usize> {
        if !self.stream_open() {
            return Ok(0);
        }
        let mut last_batch_id = BATCH_ID_UNKNOWN;
        let mut sent = 0;
        while let Some(batch) = self.local_store.next_mutation_batch(last_batch_id)? {
            last_batch_id = batch.batch_id;
            self.outbox.push(RemoteRequest::Write(batch));
            sent += 1;
        }
        Ok(sent)
    }

    fn apply_successful_write(&mut self, result: MutationBatchResult) -> FirestoreResult<()> {
        let batch_id = result.batch.batch_id;
        let changes = self.local_store.acknowledge_batch(&result)?;
        self.resolve_pending_write(batch_id, Ok(()));
        self.emit_new_snapshots(&changes, None)
    }

    fn reject_failed_write(&mut self, batch_id: BatchId, error: FirestoreError) -> FirestoreResult<()> {
        let changes = self.local_store.reject_batch(batch_id)?;
        LOGGER.warn(format!("Write batch {batch_id} rejected: {error}"));
        self.resolve_pending_write(batch_id, Err(error));
        self.emit_new_snapshots(&changes, None)
    }

    fn resolve_pending_write(&mut self, batch_id: BatchId, result: FirestoreResult<()>) {
        if let Some(sender) = self.pending_writes.remove(&batch_id) {
            // The caller may have dropped its handle.
            let _ = sender.try_send(result);
        }
    }

    // Views

    fn emit_new_snapshots(
        &mut self,
        changes: &DocumentMap,
        remote_event: Option<&RemoteEvent>,
    ) -> FirestoreResult<()> {
        let mut view_changes = Vec::new();
        let query_ids: Vec<String> = self.query_views.keys().cloned().collect();
        for query_id in query_ids {
            let Some(query_view) = self.query_views.get_mut(&query_id) else {
                continue;
            };
            let target_id = query_view.target_id;
            let target_change = remote_event.and_then(|event| event.target_changes.get(&target_id));

            let mut doc_changes = query_view.view.compute_document_changes(changes, None);
            if doc_changes.needs_refill() {
                // The limit window shrank; rerun the query to find replacements.
                let result = self.local_store.execute_query(&query_view.query, false)?;
                doc_changes = query_view
                    .view
                    .compute_document_changes(&result.documents, Some(doc_changes));
            }
            let view_change = query_view.view.apply_changes(doc_changes, target_change);

            self.update_tracked_limbos(target_id, view_change.limbo_changes);
            if let Some(snapshot) = view_change.snapshot {
                view_changes.push(LocalViewChanges::from_snapshot(target_id, &snapshot));
                self.deliver_snapshot(&query_id, snapshot);
            }
        }
        self.local_store.notify_local_view_changes(&view_changes)
    }
}

struct SyncEngineInner {
    state: Mutex<SyncEngineState>,
    /// Remote requests in the order the state produced them.
    requests: DrainQueue<RemoteRequest>,
    /// Listener callbacks in the order the state produced them.
    deliveries: DrainQueue<Delivery>,
    remote: Arc<dyn RemoteStore>,
    database_id: DatabaseId,
    next_listener_id: AtomicU64,
}

/// Coordinates the local store, the remote store and the views of every
/// listened query.
///
/// All operations are serialized behind one lock. Requests for the remote
/// store and listener callbacks are queued in order under that lock and run
/// after it is released, so both may call back into the engine. A call made
/// while another caller is draining returns once its work is queued.
#[derive(Clone)]
pub struct SyncEngine {
    inner: Arc<SyncEngineInner>,
}

impl SyncEngine {
    /// Opens the local store over `persistence` and returns an engine that
    /// talks to the backend through `remote`.
    pub fn start(
        persistence: Arc<Persistence>,
        remote: Arc<dyn RemoteStore>,
        database_id: DatabaseId,
        settings: SyncEngineSettings,
    ) -> FirestoreResult<Self> {
        let local_store = LocalStore::new(persistence, settings.lru_params)?;
        LOGGER.info(format!(
            "Starting sync engine for {}/{}",
            database_id.project_id(),
            database_id.database()
        ));
        let state = SyncEngineState::new(local_store, database_id.clone(), settings);
        Ok(Self {
            inner: Arc::new(SyncEngineInner {
                state: Mutex::new(state),
                requests: DrainQueue::new(),
                deliveries: DrainQueue::new(),
                remote,
                database_id,
                next_listener_id: AtomicU64::new(1),
            }),
        })
    }

    pub fn database_id(&self) -> &DatabaseId {
        &self.inner.database_id
    }

    /// Listens to `query` with default options.
    pub async fn listen<F>(&self, query: Query, callback: F) -> FirestoreResult<ListenerRegistration>
    where
        F: Fn(FirestoreResult<ViewSnapshot>) + Send + Sync + 'static,
    {
        self.listen_with_options(query, ListenOptions::default(), callback)
            .await
    }

    /// Registers `callback` for snapshots of `query`.
    ///
    /// Identical queries share one target. An error is delivered at most once
    /// and ends the listener.
    pub async fn listen_with_options<F>(
        &self,
        query: Query,
        options: ListenOptions,
        callback: F,
    ) -> FirestoreResult<ListenerRegistration>
    where
        F: Fn(FirestoreResult<ViewSnapshot>) + Send + Sync + 'static,
    {
        let listener_id = self.inner.next_listener_id.fetch_add(1, Ordering::SeqCst);
        let query_id = query.canonical_id();
        let listener = QueryListener::new(listener_id, options, Arc::new(callback));
        self.run(move |state| state.listen(query, listener)).await?;
        Ok(ListenerRegistration {
            engine: self.clone(),
            query_id,
            listener_id,
            detached: false,
        })
    }

    /// Snapshots of `query` as an async stream; the stream ends after an error.
    pub async fn listen_stream(&self, query: Query) -> FirestoreResult<SnapshotStream> {
        self.listen_stream_with_options(query, ListenOptions::default())
            .await
    }

    pub async fn listen_stream_with_options(
        &self,
        query: Query,
        options: ListenOptions,
    ) -> FirestoreResult<SnapshotStream> {
        let (sender, receiver) = async_channel::unbounded();
        let registration = self
            .listen_with_options(query, options, move |result| {
                let _ = sender.try_send(result);
            })
            .await?;
        Ok(SnapshotStream {
            receiver,
            _registration: registration,
        })
    }

    async fn stop_listening(&self, query_id: &str, listener_id: u64) -> FirestoreResult<()> {
        let query_id = query_id.to_string();
        self.run(move |state| state.stop_listening(&query_id, listener_id))
            .await
    }

    /// Applies `mutations` locally as one batch and queues it for the backend.
    pub async fn write(&self, mutations: Vec<Mutation>) -> FirestoreResult<PendingWrite> {
        self.run(move |state| state.write(mutations)).await
    }

    /// Re-sends every outstanding batch in batch id order, e.g. after the
    /// write stream reconnected. Returns the number of batches sent.
    pub async fn pump_writes(&self) -> FirestoreResult<usize> {
        self.run(|state| state.pump_writes()).await
    }

    /// Feeds watch stream traffic to the engine.
    ///
    /// A `snapshot_version` other than [`SnapshotVersion::none`] marks a
    /// consistent point: everything aggregated so far is applied as one
    /// remote event, unless the version is older than the last one applied.
    pub async fn handle_watch_changes(
        &self,
        changes: Vec<WatchChange>,
        snapshot_version: SnapshotVersion,
    ) -> FirestoreResult<()> {
        self.run(move |state| state.handle_watch_changes(changes, snapshot_version))
            .await
    }

    /// Checks an existence filter against the cached result of its target.
    /// The outcome is applied with the next consistent snapshot.
    pub async fn handle_existence_filter(
        &self,
        change: ExistenceFilterWatchChange,
    ) -> FirestoreResult<Option<BloomFilterApplicationStatus>> {
        self.run(move |state| Ok(state.handle_existence_filter(&change)))
            .await
    }

    /// Reports the remote store's connectivity. Coming back from offline
    /// re-sends every watch request and outstanding write.
    pub async fn handle_online_state_change(&self, online_state: OnlineState) -> FirestoreResult<()> {
        self.run(move |state| state.apply_online_state_change(online_state))
            .await
    }

    pub async fn online_state(&self) -> OnlineState {
        self.inner.state.lock().await.online_state
    }

    /// Runs one LRU garbage collection pass over the cache.
    pub async fn collect_garbage(&self) -> FirestoreResult<LruResults> {
        self.run(|state| state.local_store.collect_garbage()).await
    }

    pub async fn highest_unacknowledged_batch_id(&self) -> FirestoreResult<BatchId> {
        self.run(|state| state.local_store.highest_unacknowledged_batch_id())
            .await
    }

    /// Local view of one document, pending writes included.
    pub async fn read_document(&self, key: &DocumentKey) -> FirestoreResult<MutableDocument> {
        let key = key.clone();
        self.run(move |state| state.local_store.read_document(&key))
            .await
    }

    /// Limbo documents with an open resolution target.
    pub async fn active_limbo_documents(&self) -> BTreeMap<DocumentKey, TargetId> {
        self.inner
            .state
            .lock()
            .await
            .active_limbo_targets_by_key
            .clone()
    }

    /// Limbo documents waiting for a free resolution slot, oldest first.
    pub async fn enqueued_limbo_documents(&self) -> Vec<DocumentKey> {
        self.inner
            .state
            .lock()
            .await
            .enqueued_limbo_resolutions
            .iter()
            .cloned()
            .collect()
    }

    pub async fn target_id_for_query(&self, query: &Query) -> Option<TargetId> {
        self.inner
            .state
            .lock()
            .await
            .query_views
            .get(&query.canonical_id())
            .map(|query_view| query_view.target_id)
    }

    /// Runs `op` under the serial lock, then sends the remote requests and
    /// delivers the snapshots it produced.
    async fn run<T, F>(&self, op: F) -> FirestoreResult<T>
    where
        F: FnOnce(&mut SyncEngineState) -> FirestoreResult<T> + Send,
        T: Send,
    {
        let mut state = self.inner.state.lock().await;
        let result = op(&mut *state);
        let drain_requests = self
            .inner
            .requests
            .push_all(std::mem::take(&mut state.outbox));
        let drain_deliveries = self
            .inner
            .deliveries
            .push_all(std::mem::take(&mut state.deliveries));
        drop(state);

        if drain_requests {
            while let Some(request) = self.inner.requests.next() {
                self.send(request).await;
            }
        }
        if drain_deliveries {
            while let Some((callback, snapshot)) = self.inner.deliveries.next() {
                callback(snapshot);
            }
        }
        result
    }

    async fn send(&self, request: RemoteRequest) {
        let remote = &self.inner.remote;
        let (description, result) = match request {
            RemoteRequest::Listen(target_data) => {
                let target_id = target_data.target_id();
                (format!("listen to target {target_id}"), remote.listen(target_data).await)
            }
            RemoteRequest::Unlisten(target_id) => (
                format!("unlisten from target {target_id}"),
                remote.unlisten(target_id).await,
            ),
            RemoteRequest::Write(batch) => {
                let batch_id = batch.batch_id;
                (format!("send batch {batch_id}"), remote.write_mutations(batch).await)
            }
        };
        if let Err(err) = result {
            LOGGER.warn(format!("Failed to {description}: {err}"));
        }
    }
}

impl RemoteSyncer for SyncEngine {
    fn apply_remote_event(&self, event: RemoteEvent) -> RemoteStoreFuture<'_, FirestoreResult<()>> {
        box_remote_store_future(async move { self.run(move |state| state.apply_remote_event(event)).await })
    }

    fn reject_listen(
        &self,
        target_id: TargetId,
        error: FirestoreError,
    ) -> RemoteStoreFuture<'_, FirestoreResult<()>> {
        box_remote_store_future(async move {
            self.run(move |state| state.reject_listen(target_id, error))
                .await
        })
    }

    fn apply_successful_write(
        &self,
        result: MutationBatchResult,
    ) -> RemoteStoreFuture<'_, FirestoreResult<()>> {
        box_remote_store_future(async move {
            self.run(move |state| state.apply_successful_write(result))
                .await
        })
    }

    fn reject_failed_write(
        &self,
        batch_id: BatchId,
        error: FirestoreError,
    ) -> RemoteStoreFuture<'_, FirestoreResult<()>> {
        box_remote_store_future(async move {
            self.run(move |state| state.reject_failed_write(batch_id, error))
                .await
        })
    }

    fn handle_stream_error(&self, error: FirestoreError) -> RemoteStoreFuture<'_, FirestoreResult<()>> {
        box_remote_store_future(async move { self.run(move |state| state.handle_stream_error(error)).await })
    }

    fn remote_keys_for_target(&self, target_id: TargetId) -> RemoteStoreFuture<'_, BTreeSet<DocumentKey>> {
        box_remote_store_future(async move { self.inner.state.lock().await.remote_keys(target_id) })
    }
}

/// Handle returned by [`SyncEngine::listen`]; dropping it also removes the
/// listener, in the background.
pub struct ListenerRegistration {
    engine: SyncEngine,
    query_id: String,
    listener_id: u64,
    detached: bool,
}

impl ListenerRegistration {
    /// Removes the listener and waits until its target is released.
    pub async fn detach(mut self) {
        self.detached = true;
        if let Err(err) = self
            .engine
            .stop_listening(&self.query_id, self.listener_id)
            .await
        {
            LOGGER.warn(format!("Failed to stop listening to {}: {err}", self.query_id));
        }
    }
}

impl Drop for ListenerRegistration {
    fn drop(&mut self) {
        if self.detached {
            return;
        }
        let engine = self.engine.clone();
        let query_id = std::mem::take(&mut self.query_id);
        let listener_id = self.listener_id;
        spawn_detached(async move {
            if let Err(err) = engine.stop_listening(&query_id, listener_id).await {
                LOGGER.warn(format!("Failed to stop listening to {query_id}: {err}"));
            }
        });
    }
}

/// Snapshots of one query, as produced by [`SyncEngine::listen_stream`].
pub struct SnapshotStream {
    receiver: Receiver<FirestoreResult<ViewSnapshot>>,
    _registration: ListenerRegistration,
}

impl SnapshotStream {
    /// Waits for the next snapshot; `None` once the listener has ended.
    pub async fn next(&mut self) -> Option<FirestoreResult<ViewSnapshot>> {
        self.receiver.recv().await.ok()
    }

    /// Next snapshot if one is already queued.
    pub fn try_next(&mut self) -> Option<FirestoreResult<ViewSnapshot>> {
        self.receiver.try_recv().ok()
    }
}

/// Completion handle of a local write.
#[derive(Debug)]
pub struct PendingWrite {
    batch_id: BatchId,
    receiver: Receiver<FirestoreResult<()>>,
}

impl PendingWrite {
    pub fn batch_id(&self) -> BatchId {
        self.batch_id
    }

    /// Resolves once the backend acknowledged or rejected the batch.
    pub async fn wait(self) -> FirestoreResult<()> {
        let batch_id = self.batch_id;
        self.receiver
            .recv()
            .await
            .map_err(|_| aborted(format!("Write batch {batch_id} was abandoned")))?
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex as StdMutex;

    use crate::firestore::error::permission_denied;
    use crate::firestore::remote::{DocumentWatchChange, ExistenceFilter};
    use crate::firestore::test_support::{
        ack, deleted_doc, doc, key, query, set_mutation, version, RecordingRemoteStore,
        RemoteCall,
    };
    use crate::firestore::value::FirestoreValue;

    type Events = Arc<StdMutex<Vec<FirestoreResult<ViewSnapshot>>>>;

    fn engine_with(settings: SyncEngineSettings) -> (SyncEngine, Arc<RecordingRemoteStore>) {
        let remote = Arc::new(RecordingRemoteStore::new());
        let engine = SyncEngine::start(
            Arc::new(Persistence::new_in_memory()),
            remote.clone(),
            DatabaseId::default("test-project"),
            settings,
        )
        .unwrap();
        (engine, remote)
    }

    fn engine() -> (SyncEngine, Arc<RecordingRemoteStore>) {
        engine_with(SyncEngineSettings::default())
    }

    async fn listen(engine: &SyncEngine, path: &str, options: ListenOptions) -> (ListenerRegistration, Events) {
        let events: Events = Arc::new(StdMutex::new(Vec::new()));
        let sink = events.clone();
        let registration = engine
            .listen_with_options(query(path), options, move |result| {
                sink.lock().unwrap().push(result);
            })
            .await
            .unwrap();
        (registration, events)
    }

    fn take(events: &Events) -> Vec<FirestoreResult<ViewSnapshot>> {
        std::mem::take(&mut *events.lock().unwrap())
    }

    fn metadata_options() -> ListenOptions {
        ListenOptions {
            include_metadata_changes: true,
            ..ListenOptions::default()
        }
    }

    fn target_change(state: WatchTargetChangeState, target_ids: Vec<TargetId>) -> WatchChange {
        WatchChange::TargetChange(WatchTargetChange::new(state, target_ids))
    }

    fn document_added(document: MutableDocument, target_ids: Vec<TargetId>) -> WatchChange {
        WatchChange::DocumentChange(DocumentWatchChange::updated(document, target_ids))
    }

    fn name(value: &str) -> Vec<(&'static str, FirestoreValue)> {
        vec![("name", FirestoreValue::from_string(value))]
    }

    fn snapshot_keys(snapshot: &ViewSnapshot) -> Vec<String> {
        snapshot
            .documents()
            .keys()
            .map(|key| key.path().canonical_string())
            .collect()
    }

    #[tokio::test]
    async fn first_listen_sends_target_and_raises_nothing_for_empty_cache() {
        let (engine, remote) = engine();
        let (_registration, events) = listen(&engine, "rooms", ListenOptions::default()).await;

        let calls = remote.take_calls();
        assert_eq!(calls.len(), 1);
        let RemoteCall::Listen(target_data) = &calls[0] else {
            panic!("expected a listen request, got {calls:?}");
        };
        assert_eq!(target_data.target_id(), 2);
        assert_eq!(target_data.expected_count(), None);
        assert!(take(&events).is_empty());
        assert_eq!(engine.target_id_for_query(&query("rooms")).await, Some(2));
    }

    #[tokio::test]
    async fn remote_event_raises_synced_snapshot() {
        let (engine, _remote) = engine();
        let (_registration, events) = listen(&engine, "rooms", ListenOptions::default()).await;

        engine
            .handle_watch_changes(
                vec![
                    target_change(WatchTargetChangeState::Added, vec![2]),
                    document_added(doc("rooms/a", 1, &name("a")), vec![2]),
                    target_change(WatchTargetChangeState::Current, vec![2]),
                ],
                version(1),
            )
            .await
            .unwrap();

        let events = take(&events);
        assert_eq!(events.len(), 1);
        let snapshot = events[0].as_ref().unwrap();
        assert!(!snapshot.from_cache());
        assert_eq!(snapshot_keys(snapshot), vec!["rooms/a"]);
    }

    #[tokio::test]
    async fn shared_query_uses_one_target() {
        let (engine, remote) = engine();
        let (first, _) = listen(&engine, "rooms", ListenOptions::default()).await;
        let (second, _) = listen(&engine, "rooms", ListenOptions::default()).await;
        assert_eq!(remote.take_calls().len(), 1);

        first.detach().await;
        assert!(remote.take_calls().is_empty());
        second.detach().await;
        assert_eq!(remote.take_calls(), vec![RemoteCall::Unlisten(2)]);
        assert_eq!(engine.target_id_for_query(&query("rooms")).await, None);
    }

    #[tokio::test]
    async fn local_write_is_visible_then_acknowledged() {
        let (engine, remote) = engine();
        let (_registration, events) = listen(&engine, "rooms", metadata_options()).await;
        remote.take_calls();

        let pending = engine
            .write(vec![set_mutation("rooms/a", &name("local"))])
            .await
            .unwrap();
        let events_after_write = take(&events);
        assert_eq!(events_after_write.len(), 1);
        let snapshot = events_after_write[0].as_ref().unwrap();
        assert!(snapshot.has_pending_writes());
        assert!(snapshot.from_cache());

        let batches = remote.written_batches();
        assert_eq!(batches.len(), 1);
        assert_eq!(batches[0].batch_id, pending.batch_id());

        engine
            .apply_successful_write(ack(batches[0].clone(), 5))
            .await
            .unwrap();
        pending.wait().await.unwrap();
        assert_eq!(engine.highest_unacknowledged_batch_id().await.unwrap(), BATCH_ID_UNKNOWN);
        let document = engine.read_document(&key("rooms/a")).await.unwrap();
        assert_eq!(document.version(), version(5));
        assert!(document.has_committed_mutations());
    }

    #[tokio::test]
    async fn rejected_write_reports_error_and_reverts() {
        let (engine, remote) = engine();
        let pending = engine
            .write(vec![set_mutation("rooms/a", &name("local"))])
            .await
            .unwrap();
        let batch_id = pending.batch_id();
        remote.take_calls();

        engine
            .reject_failed_write(batch_id, permission_denied("no access"))
            .await
            .unwrap();
        let err = pending.wait().await.unwrap_err();
        assert_eq!(err.code_str(), "firestore/permission-denied");
        assert!(!engine.read_document(&key("rooms/a")).await.unwrap().is_found_document());
    }

    #[tokio::test]
    async fn deleted_document_outside_target_goes_to_limbo_and_resolves() {
        let (engine, remote) = engine();
        let (_registration, events) = listen(&engine, "rooms", ListenOptions::default()).await;
        engine
            .handle_watch_changes(
                vec![
                    target_change(WatchTargetChangeState::Added, vec![2]),
                    document_added(doc("rooms/a", 1, &name("a")), vec![2]),
                    document_added(doc("rooms/b", 1, &name("b")), vec![2]),
                    target_change(WatchTargetChangeState::Current, vec![2]),
                ],
                version(1),
            )
            .await
            .unwrap();
        take(&events);
        remote.take_calls();

        // Reset drops the synced keys; the backend only resends `a`.
        engine
            .handle_watch_changes(
                vec![
                    target_change(WatchTargetChangeState::Reset, vec![2]),
                    document_added(doc("rooms/a", 2, &name("a")), vec![2]),
                    target_change(WatchTargetChangeState::Current, vec![2]),
                ],
                version(2),
            )
            .await
            .unwrap();

        let limbo = engine.active_limbo_documents().await;
        assert_eq!(limbo.len(), 1);
        let limbo_target = limbo[&key("rooms/b")];
        assert_eq!(limbo_target % 2, 1);
        let calls = remote.take_calls();
        let RemoteCall::Listen(limbo_request) = &calls[0] else {
            panic!("expected a limbo listen, got {calls:?}");
        };
        assert_eq!(limbo_request.purpose(), QueryPurpose::LimboResolution);
        assert!(limbo_request.target().is_document_query());

        // The limbo target comes back current without the document.
        engine
            .handle_watch_changes(
                vec![
                    target_change(WatchTargetChangeState::Added, vec![limbo_target]),
                    target_change(WatchTargetChangeState::Current, vec![limbo_target]),
                ],
                version(3),
            )
            .await
            .unwrap();

        assert!(engine.active_limbo_documents().await.is_empty());
        assert_eq!(remote.take_calls(), vec![RemoteCall::Unlisten(limbo_target)]);
        let last = take(&events).pop().unwrap().unwrap();
        assert_eq!(snapshot_keys(&last), vec!["rooms/a"]);
        assert!(!last.from_cache());
    }

    #[tokio::test]
    async fn limbo_resolutions_beyond_the_cap_are_queued() {
        let (engine, _remote) = engine_with(SyncEngineSettings {
            max_concurrent_limbo_resolutions: 1,
            ..SyncEngineSettings::default()
        });
        let (_registration, _events) = listen(&engine, "rooms", ListenOptions::default()).await;
        engine
            .handle_watch_changes(
                vec![
                    target_change(WatchTargetChangeState::Added, vec![2]),
                    document_added(doc("rooms/a", 1, &[]), vec![2]),
                    document_added(doc("rooms/b", 1, &[]), vec![2]),
                    target_change(WatchTargetChangeState::Current, vec![2]),
                ],
                version(1),
            )
            .await
            .unwrap();
        engine
            .handle_watch_changes(
                vec![
                    target_change(WatchTargetChangeState::Reset, vec![2]),
                    target_change(WatchTargetChangeState::Current, vec![2]),
                ],
                version(2),
            )
            .await
            .unwrap();

        assert_eq!(engine.active_limbo_documents().await.len(), 1);
        assert_eq!(engine.enqueued_limbo_documents().await, vec![key("rooms/b")]);
    }

    #[tokio::test]
    async fn rejected_limbo_listen_removes_the_document() {
        let (engine, _remote) = engine();
        let (_registration, events) = listen(&engine, "rooms", ListenOptions::default()).await;
        engine
            .handle_watch_changes(
                vec![
                    target_change(WatchTargetChangeState::Added, vec![2]),
                    document_added(doc("rooms/a", 1, &[]), vec![2]),
                    target_change(WatchTargetChangeState::Current, vec![2]),
                ],
                version(1),
            )
            .await
            .unwrap();
        engine
            .handle_watch_changes(
                vec![
                    target_change(WatchTargetChangeState::Reset, vec![2]),
                    target_change(WatchTargetChangeState::Current, vec![2]),
                ],
                version(2),
            )
            .await
            .unwrap();
        take(&events);
        let limbo_target = engine.active_limbo_documents().await[&key("rooms/a")];

        engine
            .reject_listen(limbo_target, permission_denied("denied"))
            .await
            .unwrap();

        assert!(engine.active_limbo_documents().await.is_empty());
        let last = take(&events).pop().unwrap().unwrap();
        assert!(last.documents().is_empty());
        assert!(!engine.read_document(&key("rooms/a")).await.unwrap().is_found_document());
    }

    #[tokio::test]
    async fn rejected_listen_errors_once_and_ends_listener() {
        let (engine, _remote) = engine();
        let (_registration, events) = listen(&engine, "rooms", ListenOptions::default()).await;

        engine
            .handle_watch_changes(
                vec![WatchChange::TargetChange(
                    WatchTargetChange::new(WatchTargetChangeState::Removed, vec![2])
                        .with_cause(permission_denied("missing index")),
                )],
                SnapshotVersion::none(),
            )
            .await
            .unwrap();

        let events = take(&events);
        assert_eq!(events.len(), 1);
        assert_eq!(
            events[0].as_ref().unwrap_err().code_str(),
            "firestore/permission-denied"
        );
        assert_eq!(engine.target_id_for_query(&query("rooms")).await, None);
    }

    #[tokio::test]
    async fn stale_snapshot_version_is_not_applied() {
        let (engine, _remote) = engine();
        let (_registration, events) = listen(&engine, "rooms", ListenOptions::default()).await;
        engine
            .handle_watch_changes(
                vec![
                    target_change(WatchTargetChangeState::Added, vec![2]),
                    document_added(doc("rooms/a", 5, &[]), vec![2]),
                    target_change(WatchTargetChangeState::Current, vec![2]),
                ],
                version(5),
            )
            .await
            .unwrap();
        take(&events);

        engine
            .handle_watch_changes(vec![document_added(doc("rooms/b", 3, &[]), vec![2])], version(3))
            .await
            .unwrap();
        assert!(take(&events).is_empty());
    }

    #[tokio::test]
    async fn stream_error_marks_views_from_cache_and_reconnect_relistens() {
        let (engine, remote) = engine();
        let (_registration, events) = listen(&engine, "rooms", metadata_options()).await;
        engine
            .handle_watch_changes(
                vec![
                    target_change(WatchTargetChangeState::Added, vec![2]),
                    document_added(doc("rooms/a", 1, &[]), vec![2]),
                    WatchChange::TargetChange(
                        WatchTargetChange::new(WatchTargetChangeState::Current, vec![2])
                            .with_resume_token(b"token-1".to_vec()),
                    ),
                ],
                version(1),
            )
            .await
            .unwrap();
        take(&events);
        remote.take_calls();

        engine
            .handle_stream_error(internal_error("connection reset"))
            .await
            .unwrap();
        assert_eq!(engine.online_state().await, OnlineState::Offline);
        let offline = take(&events).pop().unwrap().unwrap();
        assert!(offline.from_cache());

        // Writes made while offline wait for the reconnect.
        engine
            .write(vec![set_mutation("rooms/b", &[])])
            .await
            .unwrap();
        assert!(remote.written_batches().is_empty());

        engine
            .handle_online_state_change(OnlineState::Online)
            .await
            .unwrap();
        let calls = remote.take_calls();
        let relisten = calls
            .iter()
            .find_map(|call| match call {
                RemoteCall::Listen(target_data) => Some(target_data.clone()),
                _ => None,
            })
            .unwrap();
        assert_eq!(relisten.resume_token(), b"token-1");
        assert_eq!(relisten.expected_count(), Some(1));
        assert!(calls.iter().any(|call| matches!(call, RemoteCall::Write(_))));
    }

    #[tokio::test]
    async fn existence_filter_mismatch_relistens_without_resume_token() {
        let (engine, remote) = engine();
        let (_registration, _events) = listen(&engine, "rooms", ListenOptions::default()).await;
        engine
            .handle_watch_changes(
                vec![
                    target_change(WatchTargetChangeState::Added, vec![2]),
                    document_added(doc("rooms/a", 1, &[]), vec![2]),
                    document_added(doc("rooms/b", 1, &[]), vec![2]),
                    WatchChange::TargetChange(
                        WatchTargetChange::new(WatchTargetChangeState::Current, vec![2])
                            .with_resume_token(b"token-1".to_vec()),
                    ),
                ],
                version(1),
            )
            .await
            .unwrap();
        remote.take_calls();

        let status = engine
            .handle_existence_filter(ExistenceFilterWatchChange {
                filter: ExistenceFilter::new(1),
                target_id: 2,
            })
            .await
            .unwrap();
        assert_eq!(status, Some(BloomFilterApplicationStatus::Skipped));

        engine
            .handle_watch_changes(vec![], version(2))
            .await
            .unwrap();
        let calls = remote.take_calls();
        assert_eq!(calls[0], RemoteCall::Unlisten(2));
        let RemoteCall::Listen(relisten) = &calls[1] else {
            panic!("expected a re-listen, got {calls:?}");
        };
        assert!(relisten.resume_token().is_empty());
        assert_eq!(relisten.purpose(), QueryPurpose::ExistenceFilterMismatch);
    }

    #[tokio::test]
    async fn wait_for_sync_holds_back_cached_first_snapshot() {
        let (engine, _remote) = engine();
        engine
            .write(vec![set_mutation("rooms/a", &[])])
            .await
            .unwrap();
        let (_registration, events) = listen(
            &engine,
            "rooms",
            ListenOptions {
                wait_for_sync_when_online: true,
                ..ListenOptions::default()
            },
        )
        .await;
        assert!(take(&events).is_empty());

        engine
            .handle_online_state_change(OnlineState::Offline)
            .await
            .unwrap();
        let events = take(&events);
        assert_eq!(events.len(), 1);
        assert!(events[0].as_ref().unwrap().from_cache());
    }

    #[tokio::test]
    async fn snapshot_stream_yields_snapshots() {
        let (engine, _remote) = engine();
        engine
            .write(vec![set_mutation("rooms/a", &[])])
            .await
            .unwrap();
        let mut stream = engine.listen_stream(query("rooms")).await.unwrap();
        let snapshot = stream.next().await.unwrap().unwrap();
        assert_eq!(snapshot_keys(&snapshot), vec!["rooms/a"]);
        assert!(stream.try_next().is_none());
    }

    #[tokio::test]
    async fn deleted_document_event_removes_it_from_view() {
        let (engine, _remote) = engine();
        let (_registration, events) = listen(&engine, "rooms", ListenOptions::default()).await;
        engine
            .handle_watch_changes(
                vec![
                    target_change(WatchTargetChangeState::Added, vec![2]),
                    document_added(doc("rooms/a", 1, &[]), vec![2]),
                    target_change(WatchTargetChangeState::Current, vec![2]),
                ],
                version(1),
            )
            .await
            .unwrap();
        take(&events);

        engine
            .handle_watch_changes(
                vec![WatchChange::DocumentChange(DocumentWatchChange::deleted(
                    deleted_doc("rooms/a", 2),
                    vec![2],
                ))],
                version(2),
            )
            .await
            .unwrap();
        let last = take(&events).pop().unwrap().unwrap();
        assert!(last.documents().is_empty());
        assert!(engine.active_limbo_documents().await.is_empty());
    }

    #[tokio::test]
    async fn unacknowledged_listen_syncs_after_offline_round_trip() {
        let (engine, remote) = engine();
        let (_registration, events) = listen(&engine, "rooms", ListenOptions::default()).await;
        engine
            .handle_online_state_change(OnlineState::Offline)
            .await
            .unwrap();
        engine
            .handle_online_state_change(OnlineState::Online)
            .await
            .unwrap();
        let relistened: Vec<TargetId> = remote
            .listened_targets()
            .iter()
            .map(TargetData::target_id)
            .collect();
        assert_eq!(relistened, vec![2, 2]);

        engine
            .handle_watch_changes(
                vec![
                    target_change(WatchTargetChangeState::Added, vec![2]),
                    document_added(doc("rooms/a", 1, &name("a")), vec![2]),
                    target_change(WatchTargetChangeState::Current, vec![2]),
                ],
                version(1),
            )
            .await
            .unwrap();

        let last = take(&events).pop().unwrap().unwrap();
        assert!(!last.from_cache());
        assert_eq!(snapshot_keys(&last), vec!["rooms/a"]);
    }

    #[tokio::test]
    async fn callbacks_can_wait_on_engine_calls() {
        let (engine, _remote) = engine();
        let seen = Arc::new(StdMutex::new(Vec::new()));
        let sink = seen.clone();
        let inner = engine.clone();
        let _registration = engine
            .listen(query("rooms"), move |_| {
                let batch_id =
                    futures::executor::block_on(inner.highest_unacknowledged_batch_id()).unwrap();
                sink.lock().unwrap().push(batch_id);
            })
            .await
            .unwrap();

        tokio::time::timeout(
            std::time::Duration::from_secs(5),
            engine.write(vec![set_mutation("rooms/a", &name("a"))]),
        )
        .await
        .expect("write finished")
        .unwrap();

        assert_eq!(*seen.lock().unwrap(), vec![1]);
    }

    /// Remote store that asks the engine for the target's keys while listening.
    #[derive(Default)]
    struct ReentrantRemoteStore {
        engine: std::sync::OnceLock<SyncEngine>,
        keys_seen: StdMutex<Vec<(TargetId, usize)>>,
    }

    #[async_trait::async_trait]
    impl RemoteStore for ReentrantRemoteStore {
        async fn listen(&self, target_data: TargetData) -> FirestoreResult<()> {
            if let Some(engine) = self.engine.get() {
                let target_id = target_data.target_id();
                let keys = engine.remote_keys_for_target(target_id).await;
                self.keys_seen.lock().unwrap().push((target_id, keys.len()));
            }
            Ok(())
        }

        async fn unlisten(&self, _target_id: TargetId) -> FirestoreResult<()> {
            Ok(())
        }

        async fn write_mutations(&self, _batch: MutationBatch) -> FirestoreResult<()> {
            Ok(())
        }
    }

    #[tokio::test]
    async fn remote_store_can_query_engine_while_listening() {
        let remote = Arc::new(ReentrantRemoteStore::default());
        let engine = SyncEngine::start(
            Arc::new(Persistence::new_in_memory()),
            remote.clone(),
            DatabaseId::default("test-project"),
            SyncEngineSettings::default(),
        )
        .unwrap();
        assert!(remote.engine.set(engine.clone()).is_ok());

        let registration = tokio::time::timeout(
            std::time::Duration::from_secs(5),
            engine.listen(query("rooms"), |_| {}),
        )
        .await
        .expect("listen finished")
        .unwrap();

        assert_eq!(*remote.keys_seen.lock().unwrap(), vec![(2, 0)]);
        registration.detach().await;
    }
}
