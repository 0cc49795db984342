use std::collections::BTreeMap;

use crate::firestore::core::Query;
use crate::firestore::local::mutation_queue::MutationQueue;
use crate::firestore::local::remote_document_cache::RemoteDocumentCache;
use crate::firestore::model::{DocumentKey, MutableDocument, SnapshotVersion};

/// Read-only view of documents with every queued mutation batch replayed on
/// top of the cached remote state, in batch id order.
pub struct LocalDocumentsView<'a> {
    remote_documents: &'a RemoteDocumentCache,
    mutation_queue: &'a MutationQueue,
}

impl<'a> LocalDocumentsView<'a> {
    pub fn new(remote_documents: &'a RemoteDocumentCache, mutation_queue: &'a MutationQueue) -> Self {
        Self {
            remote_documents,
            mutation_queue,
        }
    }

    /// Local view of `key`; invalid when neither the cache nor a batch knows it.
    pub fn get_document(&self, key: &DocumentKey) -> MutableDocument {
        let mut document = self.remote_documents.get(key);
        for batch in self.mutation_queue.all_mutation_batches_affecting_document_key(key) {
            batch.apply_to_local_view(&mut document);
        }
        document
    }

    pub fn get_documents<'k, I>(&self, keys: I) -> BTreeMap<DocumentKey, MutableDocument>
    where
        I: IntoIterator<Item = &'k DocumentKey>,
    {
        let base = self.remote_documents.get_all(keys);
        self.get_local_view_of_documents(base)
    }

    /// Replays queued batches over already loaded remote documents.
    pub fn get_local_view_of_documents(
        &self,
        mut documents: BTreeMap<DocumentKey, MutableDocument>,
    ) -> BTreeMap<DocumentKey, MutableDocument> {
        let batches = self
            .mutation_queue
            .all_mutation_batches_affecting_document_keys(documents.keys());
        for batch in &batches {
            for document in documents.values_mut() {
                batch.apply_to_local_view(document);
            }
        }
        documents
    }

    /// Documents matching `query` in the local view.
    ///
    /// Remote documents read at or before `since_read_time` are skipped unless
    /// a queued batch touches them; pass [`SnapshotVersion::none`] for a full scan.
    pub fn get_documents_matching_query(
        &self,
        query: &Query,
        since_read_time: SnapshotVersion,
    ) -> BTreeMap<DocumentKey, MutableDocument> {
        if query.is_document_query() {
            let key = DocumentKey::from_path(query.path().clone());
            return match key {
                Ok(key) => {
                    let document = self.get_document(&key);
                    if query.matches(&document) {
                        BTreeMap::from([(key, document)])
                    } else {
                        BTreeMap::new()
                    }
                }
                Err(_) => BTreeMap::new(),
            };
        }

        let mut results = self
            .remote_documents
            .get_documents_matching_query(query, since_read_time);
        let batches = self.mutation_queue.all_mutation_batches_affecting_query(query);
        for batch in &batches {
            for mutation in &batch.mutations {
                let key = mutation.key();
                if !query.matches_path(key) || results.contains_key(key) {
                    continue;
                }
                results.insert(key.clone(), self.remote_documents.get(key));
            }
        }
        for batch in &batches {
            for document in results.values_mut() {
                batch.apply_to_local_view(document);
            }
        }

        results.retain(|_, document| query.matches(document));
        results
    }
}
