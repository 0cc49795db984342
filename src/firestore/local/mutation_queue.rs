use std::collections::{BTreeMap, BTreeSet};
use std::sync::LazyLock;

use crate::firestore::core::Query;
use crate::firestore::error::{failed_precondition, invalid_argument, not_found, FirestoreResult};
use crate::firestore::local::journal::{JournaledCell, JournaledMap};
use crate::firestore::local::local_serializer::{
    decode_json, decode_mutation_batch, encode_json, encode_mutation_batch, MutationQueueMetadata,
    MUTATION_QUEUE_KEY,
};
use crate::firestore::local::storage::{StorageRow, StorageTable, StorageWrite};
use crate::firestore::model::{
    BatchId, DocumentKey, Mutation, MutationBatch, Timestamp, BATCH_ID_UNKNOWN,
};
use crate::logger::Logger;

static LOGGER: LazyLock<Logger> =
    LazyLock::new(|| Logger::new("@firebase/firestore/mutation_queue"));

/// Ordered queue of locally issued mutation batches awaiting acknowledgement.
#[derive(Debug, Default)]
pub struct MutationQueue {
    batches: JournaledMap<BatchId, MutationBatch>,
    key_index: JournaledMap<DocumentKey, BTreeSet<BatchId>>,
    metadata: JournaledCell<MutationQueueMetadata>,
}

impl MutationQueue {
    pub fn is_empty(&self) -> bool {
        self.batches.is_empty()
    }

    /// Appends a batch with the next batch id.
    pub fn add_mutation_batch(
        &mut self,
        local_write_time: Timestamp,
        base_mutations: Vec<Mutation>,
        mutations: Vec<Mutation>,
    ) -> FirestoreResult<MutationBatch> {
        if mutations.is_empty() {
            return Err(invalid_argument("Mutation batches must not be empty"));
        }
        let mut metadata = self.metadata.get().clone();
        let batch_id = metadata.highest_batch_id.max(0) + 1;
        metadata.highest_batch_id = batch_id;
        self.metadata.set(metadata);

        let batch = MutationBatch::new(batch_id, local_write_time, base_mutations, mutations);
        for key in batch.keys() {
            self.key_index.update(key, |ids| {
                let mut ids = ids.unwrap_or_default();
                ids.insert(batch_id);
                Some(ids)
            });
        }
        self.batches.insert(batch_id, batch.clone());
        LOGGER.debug(format!("Queued mutation batch {batch_id}"));
        Ok(batch)
    }

    pub fn lookup_mutation_batch(&self, batch_id: BatchId) -> Option<&MutationBatch> {
        self.batches.get(&batch_id)
    }

    /// First batch whose id is strictly greater than `batch_id`.
    pub fn next_mutation_batch_after_batch_id(&self, batch_id: BatchId) -> Option<&MutationBatch> {
        self.batches
            .range(batch_id.saturating_add(1)..)
            .next()
            .map(|(_, batch)| batch)
    }

    pub fn all_mutation_batches(&self) -> Vec<MutationBatch> {
        self.batches.values().cloned().collect()
    }

    pub fn all_mutation_batches_affecting_document_key(&self, key: &DocumentKey) -> Vec<MutationBatch> {
        self.all_mutation_batches_affecting_document_keys(std::iter::once(key))
    }

    /// Batches touching any of `keys`, in batch id order.
    pub fn all_mutation_batches_affecting_document_keys<'a, I>(&self, keys: I) -> Vec<MutationBatch>
    where
        I: IntoIterator<Item = &'a DocumentKey>,
    {
        let ids: BTreeSet<BatchId> = keys
            .into_iter()
            .filter_map(|key| self.key_index.get(key))
            .flat_map(|ids| ids.iter().copied())
            .collect();
        ids.into_iter()
            .filter_map(|id| self.batches.get(&id).cloned())
            .collect()
    }

    /// Batches touching a document whose path falls under `query`.
    pub fn all_mutation_batches_affecting_query(&self, query: &Query) -> Vec<MutationBatch> {
        let ids: BTreeSet<BatchId> = self
            .key_index
            .iter()
            .filter(|(key, _)| query.matches_path(key))
            .flat_map(|(_, ids)| ids.iter().copied())
            .collect();
        ids.into_iter()
            .filter_map(|id| self.batches.get(&id).cloned())
            .collect()
    }

    /// Whether any queued batch touches `key`.
    pub fn contains_key(&self, key: &DocumentKey) -> bool {
        self.key_index
            .get(key)
            .is_some_and(|ids| !ids.is_empty())
    }

    pub fn document_keys(&self) -> BTreeSet<DocumentKey> {
        self.key_index.keys().cloned().collect()
    }

    /// Removes `batch` and its index entries.
    ///
    /// Acknowledged batches leave from the head of the queue; rejected ones may
    /// leave from anywhere.
    pub fn remove_mutation_batch(&mut self, batch: &MutationBatch) -> FirestoreResult<()> {
        if self.batches.remove(&batch.batch_id).is_none() {
            return Err(not_found(format!(
                "Mutation batch {} is not in the queue",
                batch.batch_id
            )));
        }
        for key in batch.keys() {
            let batch_id = batch.batch_id;
            self.key_index.update(key, |ids| {
                let mut ids = ids?;
                ids.remove(&batch_id);
                (!ids.is_empty()).then_some(ids)
            });
        }
        Ok(())
    }

    /// Records the acknowledgement of `batch` and the stream token that came with it.
    pub fn acknowledge_batch(&mut self, batch: &MutationBatch, stream_token: Vec<u8>) -> FirestoreResult<()> {
        let metadata = self.metadata.get();
        if batch.batch_id <= metadata.last_acknowledged_batch_id {
            return Err(failed_precondition(format!(
                "Mutation batch {} was already acknowledged",
                batch.batch_id
            )));
        }
        let oldest = self.batches.keys().next().copied();
        if oldest != Some(batch.batch_id) {
            return Err(failed_precondition(format!(
                "Acknowledged batch {} is not the oldest queued batch ({oldest:?})",
                batch.batch_id
            )));
        }
        let mut metadata = metadata.clone();
        metadata.last_acknowledged_batch_id = batch.batch_id;
        metadata.last_stream_token = stream_token;
        self.metadata.set(metadata);
        Ok(())
    }

    /// Highest batch id not yet acknowledged, or [`BATCH_ID_UNKNOWN`] when the queue is empty.
    pub fn highest_unacknowledged_batch_id(&self) -> BatchId {
        self.batches
            .keys()
            .next_back()
            .copied()
            .unwrap_or(BATCH_ID_UNKNOWN)
    }

    pub fn last_stream_token(&self) -> &[u8] {
        &self.metadata.get().last_stream_token
    }

    pub fn set_last_stream_token(&mut self, stream_token: Vec<u8>) {
        let mut metadata = self.metadata.get().clone();
        metadata.last_stream_token = stream_token;
        self.metadata.set(metadata);
    }

    pub(crate) fn load(rows: &[StorageRow]) -> FirestoreResult<Self> {
        let mut batches = BTreeMap::new();
        let mut key_index: BTreeMap<DocumentKey, BTreeSet<BatchId>> = BTreeMap::new();
        let mut metadata = MutationQueueMetadata::default();
        for row in rows {
            match row.table {
                StorageTable::Mutations => {
                    let batch = decode_mutation_batch(&row.value)?;
                    for key in batch.keys() {
                        key_index.entry(key).or_default().insert(batch.batch_id);
                    }
                    batches.insert(batch.batch_id, batch);
                }
                StorageTable::Globals if row.key == MUTATION_QUEUE_KEY => {
                    metadata = decode_json("mutation queue metadata", &row.value)?;
                }
                _ => {}
            }
        }
        if let Some(highest) = batches.keys().next_back() {
            metadata.highest_batch_id = metadata.highest_batch_id.max(*highest);
        }
        Ok(Self {
            batches: JournaledMap::from_entries(batches),
            key_index: JournaledMap::from_entries(key_index),
            metadata: JournaledCell::new(metadata),
        })
    }

    pub(crate) fn pending_writes(&self, writes: &mut Vec<StorageWrite>) -> FirestoreResult<()> {
        for (batch_id, _, after) in self.batches.changes() {
            let key = batch_id.to_string();
            writes.push(match after {
                Some(batch) => StorageWrite::Put(StorageRow {
                    table: StorageTable::Mutations,
                    key,
                    value: encode_mutation_batch(batch)?,
                }),
                None => StorageWrite::Delete {
                    table: StorageTable::Mutations,
                    key,
                },
            });
        }
        if self.metadata.is_dirty() {
            writes.push(StorageWrite::Put(StorageRow {
                table: StorageTable::Globals,
                key: MUTATION_QUEUE_KEY.to_string(),
                value: encode_json("mutation queue metadata", self.metadata.get())?,
            }));
        }
        Ok(())
    }

    pub(crate) fn commit(&mut self) {
        self.batches.commit();
        self.key_index.commit();
        self.metadata.commit();
    }

    pub(crate) fn rollback(&mut self) {
        self.batches.rollback();
        self.key_index.rollback();
        self.metadata.rollback();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::firestore::model::{ObjectValue, ResourcePath};

    fn key(path: &str) -> DocumentKey {
        DocumentKey::from_string(path).unwrap()
    }

    fn add(queue: &mut MutationQueue, paths: &[&str]) -> MutationBatch {
        let mutations = paths
            .iter()
            .map(|path| Mutation::set(key(path), ObjectValue::empty()))
            .collect();
        queue
            .add_mutation_batch(Timestamp::new(1, 0), Vec::new(), mutations)
            .unwrap()
    }

    #[test]
    fn batch_ids_increase() {
        let mut queue = MutationQueue::default();
        let first = add(&mut queue, &["a/1"]);
        let second = add(&mut queue, &["a/2"]);
        assert_eq!(first.batch_id, 1);
        assert_eq!(second.batch_id, 2);
        assert_eq!(queue.highest_unacknowledged_batch_id(), 2);
        assert_eq!(
            queue.next_mutation_batch_after_batch_id(BATCH_ID_UNKNOWN).map(|b| b.batch_id),
            Some(1)
        );
        assert_eq!(queue.next_mutation_batch_after_batch_id(1).map(|b| b.batch_id), Some(2));
        assert!(queue.next_mutation_batch_after_batch_id(2).is_none());
    }

    #[test]
    fn ids_are_not_reused_after_removal() {
        let mut queue = MutationQueue::default();
        let first = add(&mut queue, &["a/1"]);
        queue.remove_mutation_batch(&first).unwrap();
        assert!(queue.is_empty());
        assert_eq!(queue.highest_unacknowledged_batch_id(), BATCH_ID_UNKNOWN);
        assert_eq!(add(&mut queue, &["a/1"]).batch_id, 2);
    }

    #[test]
    fn lookups_by_key_and_query() {
        let mut queue = MutationQueue::default();
        add(&mut queue, &["a/1", "b/1"]);
        add(&mut queue, &["a/2"]);
        add(&mut queue, &["b/2"]);

        let ids = |batches: Vec<MutationBatch>| batches.iter().map(|b| b.batch_id).collect::<Vec<_>>();
        assert_eq!(ids(queue.all_mutation_batches_affecting_document_key(&key("b/1"))), vec![1]);
        assert_eq!(
            ids(queue.all_mutation_batches_affecting_document_keys([&key("b/2"), &key("a/1")])),
            vec![1, 3]
        );
        let query = Query::new(ResourcePath::from_string("a").unwrap());
        assert_eq!(ids(queue.all_mutation_batches_affecting_query(&query)), vec![1, 2]);
        assert!(queue.contains_key(&key("a/2")));
        assert!(!queue.contains_key(&key("c/1")));
    }

    #[test]
    fn only_the_oldest_batch_can_be_acknowledged() {
        let mut queue = MutationQueue::default();
        let first = add(&mut queue, &["a/1"]);
        let second = add(&mut queue, &["a/1"]);

        let err = queue.acknowledge_batch(&second, Vec::new()).unwrap_err();
        assert_eq!(err.code_str(), "firestore/failed-precondition");

        queue.acknowledge_batch(&first, b"token".to_vec()).unwrap();
        assert_eq!(queue.last_stream_token(), b"token");
        queue.remove_mutation_batch(&first).unwrap();
        assert!(queue.contains_key(&key("a/1")));
        queue.remove_mutation_batch(&second).unwrap();
        assert!(!queue.contains_key(&key("a/1")));
    }

    #[test]
    fn rejected_batches_leave_from_anywhere() {
        let mut queue = MutationQueue::default();
        add(&mut queue, &["a/1"]);
        let second = add(&mut queue, &["a/2"]);
        add(&mut queue, &["a/3"]);

        queue.remove_mutation_batch(&second).unwrap();
        let ids: Vec<_> = queue.all_mutation_batches().iter().map(|b| b.batch_id).collect();
        assert_eq!(ids, vec![1, 3]);
        assert!(!queue.contains_key(&key("a/2")));
        let err = queue.remove_mutation_batch(&second).unwrap_err();
        assert_eq!(err.code_str(), "firestore/not-found");
    }

    #[test]
    fn empty_batches_are_rejected() {
        let mut queue = MutationQueue::default();
        let err = queue
            .add_mutation_batch(Timestamp::new(1, 0), Vec::new(), Vec::new())
            .unwrap_err();
        assert_eq!(err.code_str(), "firestore/invalid-argument");
    }

    #[test]
    fn reload_restores_batches_and_metadata() {
        let mut queue = MutationQueue::default();
        add(&mut queue, &["a/1"]);
        queue.set_last_stream_token(b"abc".to_vec());

        let mut writes = Vec::new();
        queue.pending_writes(&mut writes).unwrap();
        let rows: Vec<StorageRow> = writes
            .into_iter()
            .filter_map(|write| match write {
                StorageWrite::Put(row) => Some(row),
                StorageWrite::Delete { .. } => None,
            })
            .collect();

        let restored = MutationQueue::load(&rows).unwrap();
        assert_eq!(restored.all_mutation_batches(), queue.all_mutation_batches());
        assert_eq!(restored.last_stream_token(), b"abc");
        assert!(restored.contains_key(&key("a/1")));
    }

    #[test]
    fn rollback_forgets_uncommitted_batches() {
        let mut queue = MutationQueue::default();
        add(&mut queue, &["a/1"]);
        queue.commit();
        add(&mut queue, &["a/2"]);
        queue.rollback();
        assert_eq!(queue.all_mutation_batches().len(), 1);
        assert!(!queue.contains_key(&key("a/2")));
        assert_eq!(add(&mut queue, &["a/3"]).batch_id, 2);
    }
}
