use std::collections::{BTreeMap, BTreeSet};

use crate::firestore::core::Query;
use crate::firestore::error::FirestoreResult;
use crate::firestore::local::journal::JournaledMap;
use crate::firestore::local::local_serializer::{decode_document, encode_document};
use crate::firestore::local::storage::{StorageRow, StorageTable, StorageWrite};
use crate::firestore::model::{DocumentKey, MutableDocument, ResourcePath, SnapshotVersion};

/// Latest remote state of every cached document.
///
/// The cache does no locking of its own; callers reach it through a
/// persistence transaction.
#[derive(Debug, Default)]
pub struct RemoteDocumentCache {
    documents: JournaledMap<DocumentKey, MutableDocument>,
}

impl RemoteDocumentCache {
    /// Stores `document` as read at `read_time`.
    pub fn add(&mut self, document: &MutableDocument, read_time: SnapshotVersion) {
        let mut stored = document.clone();
        stored.set_read_time(read_time);
        self.documents.insert(stored.key().clone(), stored);
    }

    pub fn remove(&mut self, key: &DocumentKey) {
        self.documents.remove(key);
    }

    /// Returns the cached document, or an invalid document when nothing is cached.
    pub fn get(&self, key: &DocumentKey) -> MutableDocument {
        self.documents
            .get(key)
            .cloned()
            .unwrap_or_else(|| MutableDocument::invalid_document(key.clone()))
    }

    pub fn get_all<'a, I>(&self, keys: I) -> BTreeMap<DocumentKey, MutableDocument>
    where
        I: IntoIterator<Item = &'a DocumentKey>,
    {
        keys.into_iter()
            .map(|key| (key.clone(), self.get(key)))
            .collect()
    }

    /// Documents directly inside `collection`, in key order.
    pub fn get_all_in_collection(&self, collection: &ResourcePath) -> BTreeMap<DocumentKey, MutableDocument> {
        self.documents
            .iter()
            .filter(|(key, _)| collection.is_immediate_parent_of(key.path()))
            .map(|(key, doc)| (key.clone(), doc.clone()))
            .collect()
    }

    /// Documents whose path falls under `query` and that were read after `since_read_time`.
    ///
    /// Only the path is checked; filters are evaluated once pending mutations are applied.
    pub fn get_documents_matching_query(
        &self,
        query: &Query,
        since_read_time: SnapshotVersion,
    ) -> BTreeMap<DocumentKey, MutableDocument> {
        self.documents
            .iter()
            .filter(|(key, _)| query.matches_path(key))
            .filter(|(_, doc)| since_read_time.is_none() || doc.read_time() > since_read_time)
            .map(|(key, doc)| (key.clone(), doc.clone()))
            .collect()
    }

    pub fn contains(&self, key: &DocumentKey) -> bool {
        self.documents.contains_key(key)
    }

    pub fn document_count(&self) -> usize {
        self.documents.len()
    }

    pub fn keys(&self) -> BTreeSet<DocumentKey> {
        self.documents.keys().cloned().collect()
    }

    /// Size of the cached documents in their serialized form.
    pub fn byte_size(&self) -> FirestoreResult<usize> {
        let mut total = 0;
        for document in self.documents.values() {
            total += encode_document(document)?.len();
        }
        Ok(total)
    }

    pub(crate) fn load(rows: &[StorageRow]) -> FirestoreResult<Self> {
        let mut documents = BTreeMap::new();
        for row in rows.iter().filter(|row| row.table == StorageTable::Documents) {
            let document = decode_document(&row.value)?;
            documents.insert(document.key().clone(), document);
        }
        Ok(Self {
            documents: JournaledMap::from_entries(documents),
        })
    }

    pub(crate) fn pending_writes(&self, writes: &mut Vec<StorageWrite>) -> FirestoreResult<()> {
        for (key, _, after) in self.documents.changes() {
            let row_key = key.path().canonical_string();
            writes.push(match after {
                Some(document) => StorageWrite::Put(StorageRow {
                    table: StorageTable::Documents,
                    key: row_key,
                    value: encode_document(document)?,
                }),
                None => StorageWrite::Delete {
                    table: StorageTable::Documents,
                    key: row_key,
                },
            });
        }
        Ok(())
    }

    pub(crate) fn commit(&mut self) {
        self.documents.commit();
    }

    pub(crate) fn rollback(&mut self) {
        self.documents.rollback();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::firestore::model::{ObjectValue, Timestamp};

    fn key(path: &str) -> DocumentKey {
        DocumentKey::from_string(path).unwrap()
    }

    fn version(seconds: i64) -> SnapshotVersion {
        SnapshotVersion::new(Timestamp::new(seconds, 0))
    }

    fn found(path: &str, seconds: i64) -> MutableDocument {
        MutableDocument::found_document(key(path), version(seconds), ObjectValue::empty())
    }

    #[test]
    fn missing_documents_are_invalid() {
        let cache = RemoteDocumentCache::default();
        assert!(!cache.get(&key("a/1")).is_valid_document());
    }

    #[test]
    fn stores_read_time() {
        let mut cache = RemoteDocumentCache::default();
        cache.add(&found("a/1", 1), version(3));
        assert_eq!(cache.get(&key("a/1")).read_time(), version(3));
        assert_eq!(cache.get_all([&key("a/1"), &key("a/2")]).len(), 2);
    }

    #[test]
    fn collection_scan_skips_nested_documents() {
        let mut cache = RemoteDocumentCache::default();
        cache.add(&found("a/1", 1), version(1));
        cache.add(&found("a/1/b/1", 1), version(1));
        cache.add(&found("c/1", 1), version(1));
        let path = ResourcePath::from_string("a").unwrap();
        let docs = cache.get_all_in_collection(&path);
        assert_eq!(docs.keys().cloned().collect::<Vec<_>>(), vec![key("a/1")]);
    }

    #[test]
    fn query_scan_respects_read_time() {
        let mut cache = RemoteDocumentCache::default();
        cache.add(&found("a/1", 1), version(1));
        cache.add(&found("a/2", 1), version(5));
        let query = Query::new(ResourcePath::from_string("a").unwrap());
        assert_eq!(cache.get_documents_matching_query(&query, SnapshotVersion::none()).len(), 2);
        let recent = cache.get_documents_matching_query(&query, version(2));
        assert_eq!(recent.keys().cloned().collect::<Vec<_>>(), vec![key("a/2")]);
    }

    #[test]
    fn pending_writes_cover_puts_and_deletes() {
        let mut cache = RemoteDocumentCache::default();
        cache.add(&found("a/1", 1), version(1));
        cache.commit();
        cache.remove(&key("a/1"));
        cache.add(&found("a/2", 1), version(1));

        let mut writes = Vec::new();
        cache.pending_writes(&mut writes).unwrap();
        assert_eq!(writes.len(), 2);
        assert!(matches!(&writes[0], StorageWrite::Delete { key, .. } if key == "a/1"));

        cache.rollback();
        assert!(cache.contains(&key("a/1")));
        assert!(!cache.contains(&key("a/2")));
    }
}
