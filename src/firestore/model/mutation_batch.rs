use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};

use crate::firestore::error::{internal_error, FirestoreResult};
use crate::firestore::model::{
    BatchId, DocumentKey, MutableDocument, Mutation, MutationResult, SnapshotVersion, Timestamp,
};

/// Ordered group of mutations written together by one local write.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct MutationBatch {
    pub batch_id: BatchId,
    pub local_write_time: Timestamp,
    /// Mutations that reproduce the pre-write state for fields touched by transforms.
    pub base_mutations: Vec<Mutation>,
    pub mutations: Vec<Mutation>,
}

impl MutationBatch {
    pub fn new(
        batch_id: BatchId,
        local_write_time: Timestamp,
        base_mutations: Vec<Mutation>,
        mutations: Vec<Mutation>,
    ) -> Self {
        Self {
            batch_id,
            local_write_time,
            base_mutations,
            mutations,
        }
    }

    pub fn keys(&self) -> BTreeSet<DocumentKey> {
        self.mutations
            .iter()
            .map(|mutation| mutation.key().clone())
            .collect()
    }

    pub fn affects(&self, key: &DocumentKey) -> bool {
        self.mutations.iter().any(|mutation| mutation.key() == key)
    }

    /// Replays the batch over the local view of `document`.
    pub fn apply_to_local_view(&self, document: &mut MutableDocument) {
        for mutation in self.base_mutations.iter().chain(&self.mutations) {
            if mutation.key() == document.key() {
                mutation.apply_to_local_view(document, self.local_write_time);
            }
        }
    }

    /// Replays the batch over every document of `documents` it touches.
    pub fn apply_to_local_documents(&self, documents: &mut BTreeMap<DocumentKey, MutableDocument>) {
        for key in self.keys() {
            let document = documents
                .entry(key.clone())
                .or_insert_with(|| MutableDocument::invalid_document(key));
            self.apply_to_local_view(document);
        }
    }

    /// Applies the acknowledged results of the batch to `document`.
    pub fn apply_to_remote_document(
        &self,
        document: &mut MutableDocument,
        batch_result: &MutationBatchResult,
    ) -> FirestoreResult<()> {
        for (mutation, result) in self.mutations.iter().zip(&batch_result.mutation_results) {
            if mutation.key() == document.key() {
                mutation.apply_to_remote_document(document, result)?;
            }
        }
        Ok(())
    }
}

/// Acknowledgement of a batch by the backend.
#[derive(Clone, Debug, PartialEq)]
pub struct MutationBatchResult {
    pub batch: MutationBatch,
    pub commit_version: SnapshotVersion,
    pub mutation_results: Vec<MutationResult>,
    pub stream_token: Vec<u8>,
    /// Per-document version the backend assigned to each written key.
    pub doc_versions: BTreeMap<DocumentKey, SnapshotVersion>,
}

impl MutationBatchResult {
    pub fn create(
        batch: MutationBatch,
        commit_version: SnapshotVersion,
        mutation_results: Vec<MutationResult>,
        stream_token: Vec<u8>,
    ) -> FirestoreResult<Self> {
        if batch.mutations.len() != mutation_results.len() {
            return Err(internal_error(format!(
                "Mutations sent {} must equal results received {}",
                batch.mutations.len(),
                mutation_results.len()
            )));
        }

        let doc_versions = batch
            .mutations
            .iter()
            .zip(&mutation_results)
            .map(|(mutation, result)| (mutation.key().clone(), result.version))
            .collect();

        Ok(Self {
            batch,
            commit_version,
            mutation_results,
            stream_token,
            doc_versions,
        })
    }
}
