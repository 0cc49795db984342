use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use firestore_sync_core::firestore::core::{
    ListenOptions, ListenerRegistration, OnlineState, Query, SyncEngine, SyncEngineSettings,
    ViewSnapshot,
};
use firestore_sync_core::firestore::error::{failed_precondition, unavailable};
use firestore_sync_core::firestore::local::{
    DurableStorage, MemoryStorage, Persistence, StorageRow, StorageWrite, TargetData,
};
use firestore_sync_core::firestore::model::{
    DatabaseId, DocumentKey, FieldPath, MutableDocument, Mutation, MutationBatch,
    MutationBatchResult, MutationResult, ObjectValue, Precondition, ResourcePath,
    SnapshotVersion, TargetId, Timestamp, BATCH_ID_UNKNOWN,
};
use firestore_sync_core::firestore::remote::{
    BloomFilterApplicationStatus, BloomFilterParameters, DocumentWatchChange, ExistenceFilter,
    ExistenceFilterWatchChange, RemoteStore, RemoteSyncer, WatchChange, WatchTargetChange,
    WatchTargetChangeState,
};
use firestore_sync_core::firestore::value::FirestoreValue;
use firestore_sync_core::firestore::FirestoreResult;

#[derive(Default)]
struct RecordingRemote {
    listens: Mutex<Vec<TargetData>>,
    unlistens: Mutex<Vec<TargetId>>,
    writes: Mutex<Vec<MutationBatch>>,
}

impl RecordingRemote {
    fn written_batches(&self) -> Vec<MutationBatch> {
        self.writes.lock().unwrap().clone()
    }

    fn take_written_batches(&self) -> Vec<MutationBatch> {
        std::mem::take(&mut *self.writes.lock().unwrap())
    }

    fn unlistened(&self) -> Vec<TargetId> {
        self.unlistens.lock().unwrap().clone()
    }

    fn listens_for(&self, target_id: TargetId) -> usize {
        self.listens
            .lock()
            .unwrap()
            .iter()
            .filter(|target_data| target_data.target_id() == target_id)
            .count()
    }
}

#[async_trait]
impl RemoteStore for RecordingRemote {
    async fn listen(&self, target_data: TargetData) -> FirestoreResult<()> {
        self.listens.lock().unwrap().push(target_data);
        Ok(())
    }

    async fn unlisten(&self, target_id: TargetId) -> FirestoreResult<()> {
        self.unlistens.lock().unwrap().push(target_id);
        Ok(())
    }

    async fn write_mutations(&self, batch: MutationBatch) -> FirestoreResult<()> {
        self.writes.lock().unwrap().push(batch);
        Ok(())
    }
}

/// Storage whose commits can be made to fail.
#[derive(Default)]
struct FlakyStorage {
    inner: MemoryStorage,
    failing: AtomicBool,
}

impl DurableStorage for FlakyStorage {
    fn load(&self) -> FirestoreResult<Vec<StorageRow>> {
        self.inner.load()
    }

    fn commit(&self, writes: &[StorageWrite]) -> FirestoreResult<()> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(unavailable("disk unavailable"));
        }
        self.inner.commit(writes)
    }
}

type Events = Arc<Mutex<Vec<FirestoreResult<ViewSnapshot>>>>;

fn start(persistence: Persistence) -> (SyncEngine, Arc<RecordingRemote>) {
    let remote = Arc::new(RecordingRemote::default());
    let engine = SyncEngine::start(
        Arc::new(persistence),
        remote.clone(),
        DatabaseId::default("scenario-project"),
        SyncEngineSettings::default(),
    )
    .expect("start engine");
    (engine, remote)
}

fn key(path: &str) -> DocumentKey {
    DocumentKey::from_string(path).unwrap()
}

fn version(seconds: i64) -> SnapshotVersion {
    SnapshotVersion::new(Timestamp::new(seconds, 0))
}

fn rooms() -> Query {
    Query::new(ResourcePath::from_string("rooms").unwrap())
}

fn field(name: &str) -> FieldPath {
    FieldPath::from_dot_separated(name).unwrap()
}

fn object(fields: &[(&str, FirestoreValue)]) -> ObjectValue {
    let mut value = ObjectValue::empty();
    for (name, field_value) in fields {
        value.set(&field(name), field_value.clone());
    }
    value
}

fn doc(path: &str, seconds: i64, fields: &[(&str, FirestoreValue)]) -> MutableDocument {
    MutableDocument::found_document(key(path), version(seconds), object(fields))
}

fn ack(batch: MutationBatch, seconds: i64) -> MutationBatchResult {
    let results = batch
        .mutations
        .iter()
        .map(|_| MutationResult::new(version(seconds)))
        .collect();
    MutationBatchResult::create(batch, version(seconds), results, b"stream".to_vec()).unwrap()
}

async fn listen(engine: &SyncEngine, query: Query) -> (ListenerRegistration, Events) {
    let events: Events = Arc::new(Mutex::new(Vec::new()));
    let captured = events.clone();
    let registration = engine
        .listen_with_options(
            query,
            ListenOptions {
                include_metadata_changes: true,
                ..ListenOptions::default()
            },
            move |result| captured.lock().unwrap().push(result),
        )
        .await
        .expect("listen");
    (registration, events)
}

fn last_snapshot(events: &Events) -> ViewSnapshot {
    events
        .lock()
        .unwrap()
        .last()
        .cloned()
        .expect("a snapshot")
        .expect("no listen error")
}

fn added(target_id: TargetId) -> WatchChange {
    WatchChange::TargetChange(WatchTargetChange::new(
        WatchTargetChangeState::Added,
        vec![target_id],
    ))
}

fn current(target_id: TargetId) -> WatchChange {
    WatchChange::TargetChange(
        WatchTargetChange::new(WatchTargetChangeState::Current, vec![target_id])
            .with_resume_token(format!("resume-{target_id}").into_bytes()),
    )
}

fn document(document: MutableDocument, target_id: TargetId) -> WatchChange {
    WatchChange::DocumentChange(DocumentWatchChange::updated(document, vec![target_id]))
}

/// Bloom filter over `names`, built the way the backend builds it.
fn bloom_filter_of(names: &[String]) -> BloomFilterParameters {
    const BIT_COUNT: u64 = 1024;
    const HASH_COUNT: i32 = 7;
    let mut bitmap = vec![0u8; (BIT_COUNT / 8) as usize];
    for name in names {
        let digest = md5::compute(name.as_bytes()).0;
        let mut low = [0u8; 8];
        let mut high = [0u8; 8];
        low.copy_from_slice(&digest[..8]);
        high.copy_from_slice(&digest[8..]);
        let (hash1, hash2) = (u64::from_le_bytes(low), u64::from_le_bytes(high));
        for round in 0..HASH_COUNT as u64 {
            let index = hash1.wrapping_add(hash2.wrapping_mul(round)) % BIT_COUNT;
            bitmap[(index / 8) as usize] |= 1 << (index % 8);
        }
    }
    BloomFilterParameters {
        bitmap,
        padding: 0,
        hash_count: HASH_COUNT,
    }
}

#[tokio::test(flavor = "multi_thread")]
async fn offline_write_is_shown_from_cache_then_synced_after_ack() {
    let (engine, remote) = start(Persistence::new_in_memory());
    engine
        .handle_online_state_change(OnlineState::Offline)
        .await
        .unwrap();
    let (_registration, events) = listen(&engine, rooms()).await;
    let target_id = engine.target_id_for_query(&rooms()).await.unwrap();

    let pending = engine
        .write(vec![Mutation::set(
            key("rooms/x"),
            object(&[("name", FirestoreValue::from_string("A"))]),
        )])
        .await
        .unwrap();
    let offline = last_snapshot(&events);
    assert!(offline.from_cache());
    assert!(offline.has_pending_writes());
    let local = offline.documents().get(&key("rooms/x")).unwrap();
    assert_eq!(local.field(&field("name")), Some(&FirestoreValue::from_string("A")));
    assert!(remote.written_batches().is_empty());

    engine
        .handle_online_state_change(OnlineState::Online)
        .await
        .unwrap();
    let batches = remote.take_written_batches();
    assert_eq!(batches.len(), 1);
    assert_eq!(remote.listens_for(target_id), 1);

    engine
        .apply_successful_write(ack(batches[0].clone(), 10))
        .await
        .unwrap();
    pending.wait().await.unwrap();

    engine
        .handle_watch_changes(
            vec![
                added(target_id),
                document(
                    doc("rooms/x", 10, &[("name", FirestoreValue::from_string("A"))]),
                    target_id,
                ),
                current(target_id),
            ],
            version(10),
        )
        .await
        .unwrap();

    let synced = last_snapshot(&events);
    assert!(!synced.from_cache());
    assert!(!synced.has_pending_writes());
    let document = synced.documents().get(&key("rooms/x")).unwrap();
    assert_eq!(document.version(), version(10));
    assert_eq!(document.field(&field("name")), Some(&FirestoreValue::from_string("A")));
}

#[tokio::test(flavor = "multi_thread")]
async fn rejected_create_leaves_later_patch_over_server_state() {
    let (engine, _remote) = start(Persistence::new_in_memory());
    let (_registration, _events) = listen(&engine, rooms()).await;
    let target_id = engine.target_id_for_query(&rooms()).await.unwrap();
    engine
        .handle_watch_changes(
            vec![
                added(target_id),
                document(
                    doc(
                        "rooms/x",
                        1,
                        &[
                            ("name", FirestoreValue::from_string("server")),
                            ("age", FirestoreValue::from_integer(1)),
                        ],
                    ),
                    target_id,
                ),
                current(target_id),
            ],
            version(1),
        )
        .await
        .unwrap();

    let create = engine
        .write(vec![Mutation::set(
            key("rooms/x"),
            object(&[("name", FirestoreValue::from_string("A"))]),
        )
        .with_precondition(Precondition::Exists(false))])
        .await
        .unwrap();
    let _patch = engine
        .write(vec![Mutation::patch(
            key("rooms/x"),
            object(&[("age", FirestoreValue::from_integer(5))]),
            vec![field("age")],
        )])
        .await
        .unwrap();

    engine
        .reject_failed_write(create.batch_id(), failed_precondition("document already exists"))
        .await
        .unwrap();
    assert_eq!(
        create.wait().await.unwrap_err().code_str(),
        "firestore/failed-precondition"
    );

    let document = engine.read_document(&key("rooms/x")).await.unwrap();
    assert_eq!(
        document.field(&field("name")),
        Some(&FirestoreValue::from_string("server"))
    );
    assert_eq!(document.field(&field("age")), Some(&FirestoreValue::from_integer(5)));
    assert!(document.has_local_mutations());
}

#[tokio::test(flavor = "multi_thread")]
async fn rejecting_a_write_restores_the_previous_document() {
    let (engine, _remote) = start(Persistence::new_in_memory());
    let base = engine
        .write(vec![Mutation::set(
            key("rooms/x"),
            object(&[("count", FirestoreValue::from_integer(1))]),
        )])
        .await
        .unwrap();
    let before = engine.read_document(&key("rooms/x")).await.unwrap();

    let update = engine
        .write(vec![Mutation::patch(
            key("rooms/x"),
            object(&[("count", FirestoreValue::from_integer(2))]),
            vec![field("count")],
        )])
        .await
        .unwrap();
    engine
        .reject_failed_write(update.batch_id(), failed_precondition("rejected"))
        .await
        .unwrap();

    assert_eq!(engine.read_document(&key("rooms/x")).await.unwrap(), before);
    assert_eq!(
        engine.highest_unacknowledged_batch_id().await.unwrap(),
        base.batch_id()
    );
}

#[tokio::test(flavor = "multi_thread")]
async fn acknowledged_batches_leave_the_queue_in_order() {
    let (engine, remote) = start(Persistence::new_in_memory());
    let mut batch_ids = Vec::new();
    for n in 0..3 {
        let pending = engine
            .write(vec![Mutation::set(
                key(&format!("rooms/{n}")),
                object(&[("n", FirestoreValue::from_integer(n))]),
            )])
            .await
            .unwrap();
        batch_ids.push(pending.batch_id());
    }
    assert!(batch_ids.windows(2).all(|pair| pair[0] < pair[1]));

    let sent: Vec<_> = remote
        .take_written_batches()
        .into_iter()
        .map(|batch| batch.batch_id)
        .collect();
    assert_eq!(sent, batch_ids);

    // A reconnect re-sends everything still outstanding, oldest first.
    assert_eq!(engine.pump_writes().await.unwrap(), 3);
    let batches = remote.take_written_batches();
    let resent: Vec<_> = batches.iter().map(|batch| batch.batch_id).collect();
    assert_eq!(resent, batch_ids);

    engine
        .apply_successful_write(ack(batches[0].clone(), 4))
        .await
        .unwrap();
    assert_eq!(engine.pump_writes().await.unwrap(), 2);
    let remaining: Vec<_> = remote
        .take_written_batches()
        .into_iter()
        .map(|batch| batch.batch_id)
        .collect();
    assert_eq!(remaining, batch_ids[1..].to_vec());
}

#[tokio::test(flavor = "multi_thread")]
async fn existence_filter_with_bloom_filter_prunes_stale_keys() {
    let (engine, remote) = start(Persistence::new_in_memory());
    let (_registration, _events) = listen(&engine, rooms()).await;
    let target_id = engine.target_id_for_query(&rooms()).await.unwrap();

    let mut changes = vec![added(target_id)];
    for id in ["a", "b", "c", "d", "e"] {
        changes.push(document(doc(&format!("rooms/{id}"), 1, &[]), target_id));
    }
    changes.push(current(target_id));
    engine.handle_watch_changes(changes, version(1)).await.unwrap();
    assert_eq!(engine.remote_keys_for_target(target_id).await.len(), 5);

    let database_id = engine.database_id().clone();
    let unchanged: Vec<String> = ["a", "c", "e"]
        .iter()
        .map(|id| database_id.document_resource_name(&key(&format!("rooms/{id}"))))
        .collect();
    let status = engine
        .handle_existence_filter(ExistenceFilterWatchChange {
            filter: ExistenceFilter::with_bloom_filter(3, bloom_filter_of(&unchanged)),
            target_id,
        })
        .await
        .unwrap();
    assert_eq!(status, Some(BloomFilterApplicationStatus::Success));

    engine.handle_watch_changes(vec![], version(2)).await.unwrap();

    let remaining = engine.remote_keys_for_target(target_id).await;
    assert_eq!(
        remaining,
        [key("rooms/a"), key("rooms/c"), key("rooms/e")].into_iter().collect()
    );
    // No full requery: the target was never torn down.
    assert!(!remote.unlistened().contains(&target_id));
    let limbo = engine.active_limbo_documents().await;
    assert_eq!(
        limbo.keys().cloned().collect::<Vec<_>>(),
        vec![key("rooms/b"), key("rooms/d")]
    );
}

#[tokio::test(flavor = "multi_thread")]
async fn new_query_is_provisional_until_the_backend_catches_up() {
    let (engine, _remote) = start(Persistence::new_in_memory());
    let (_all, _events) = listen(&engine, rooms()).await;
    let all_target = engine.target_id_for_query(&rooms()).await.unwrap();
    engine
        .handle_watch_changes(
            vec![
                added(all_target),
                document(doc("rooms/a", 1, &[]), all_target),
                current(all_target),
            ],
            version(1),
        )
        .await
        .unwrap();

    let limited = rooms().with_limit_to_first(10);
    let (_registration, events) = listen(&engine, limited.clone()).await;
    let provisional = last_snapshot(&events);
    assert!(provisional.from_cache());
    assert_eq!(provisional.documents().len(), 1);

    let target_id = engine.target_id_for_query(&limited).await.unwrap();
    assert_ne!(target_id, all_target);
    engine
        .handle_watch_changes(
            vec![
                added(target_id),
                document(doc("rooms/a", 1, &[]), target_id),
                current(target_id),
            ],
            version(2),
        )
        .await
        .unwrap();
    let synced = last_snapshot(&events);
    assert!(!synced.from_cache());
    assert_eq!(synced.documents().len(), 1);
}

#[tokio::test(flavor = "multi_thread")]
async fn duplicate_document_delivery_is_idempotent() {
    let (engine, _remote) = start(Persistence::new_in_memory());
    let (_registration, events) = listen(&engine, rooms()).await;
    let target_id = engine.target_id_for_query(&rooms()).await.unwrap();
    let update = doc("rooms/a", 1, &[("v", FirestoreValue::from_integer(1))]);
    engine
        .handle_watch_changes(
            vec![added(target_id), document(update.clone(), target_id), current(target_id)],
            version(1),
        )
        .await
        .unwrap();
    let first = engine.read_document(&key("rooms/a")).await.unwrap();
    let delivered = events.lock().unwrap().len();

    engine
        .handle_watch_changes(vec![document(update, target_id)], version(2))
        .await
        .unwrap();
    assert_eq!(engine.read_document(&key("rooms/a")).await.unwrap(), first);
    assert_eq!(events.lock().unwrap().len(), delivered);
}

#[tokio::test(flavor = "multi_thread")]
async fn failed_commit_rolls_back_the_write() {
    let storage = Arc::new(FlakyStorage::default());
    let persistence = Persistence::open(storage.clone()).unwrap();
    let (engine, remote) = start(persistence);

    storage.failing.store(true, Ordering::SeqCst);
    let result = engine
        .write(vec![Mutation::set(key("rooms/x"), object(&[]))])
        .await;
    assert_eq!(result.unwrap_err().code_str(), "firestore/unavailable");
    assert!(remote.written_batches().is_empty());

    storage.failing.store(false, Ordering::SeqCst);
    assert_eq!(
        engine.highest_unacknowledged_batch_id().await.unwrap(),
        BATCH_ID_UNKNOWN
    );
    assert!(!engine
        .read_document(&key("rooms/x"))
        .await
        .unwrap()
        .is_found_document());
}

#[tokio::test(flavor = "multi_thread")]
async fn restart_restores_outstanding_writes() {
    let storage = Arc::new(MemoryStorage::new());
    let batch_id = {
        let (engine, _remote) = start(Persistence::open(storage.clone()).unwrap());
        engine
            .write(vec![Mutation::set(
                key("rooms/x"),
                object(&[("name", FirestoreValue::from_string("kept"))]),
            )])
            .await
            .unwrap()
            .batch_id()
    };

    let (engine, remote) = start(Persistence::open(storage).unwrap());
    assert_eq!(engine.highest_unacknowledged_batch_id().await.unwrap(), batch_id);
    let document = engine.read_document(&key("rooms/x")).await.unwrap();
    assert_eq!(
        document.field(&field("name")),
        Some(&FirestoreValue::from_string("kept"))
    );

    assert_eq!(engine.pump_writes().await.unwrap(), 1);
    assert_eq!(remote.written_batches()[0].batch_id, batch_id);

    let next = engine
        .write(vec![Mutation::delete(key("rooms/y"))])
        .await
        .unwrap();
    assert!(next.batch_id() > batch_id);
}
