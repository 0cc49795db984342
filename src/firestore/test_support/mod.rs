//! Test utilities shared across the engine's unit tests.

use std::sync::Mutex;

use async_trait::async_trait;

use crate::firestore::core::Query;
use crate::firestore::error::FirestoreResult;
use crate::firestore::local::TargetData;
use crate::firestore::model::{
    DocumentKey, FieldPath, MutableDocument, Mutation, MutationBatch, MutationBatchResult,
    MutationResult, ObjectValue, ResourcePath, SnapshotVersion, TargetId, Timestamp,
};
use crate::firestore::remote::RemoteStore;
use crate::firestore::value::FirestoreValue;

pub fn key(path: &str) -> DocumentKey {
    DocumentKey::from_string(path).expect("valid document path")
}

pub fn version(seconds: i64) -> SnapshotVersion {
    SnapshotVersion::new(Timestamp::new(seconds, 0))
}

pub fn query(path: &str) -> Query {
    Query::new(ResourcePath::from_string(path).expect("valid collection path"))
}

pub fn object(fields: &[(&str, FirestoreValue)]) -> ObjectValue {
    let mut value = ObjectValue::empty();
    for (path, field) in fields {
        let path = FieldPath::from_dot_separated(path).expect("valid field path");
        value.set(&path, field.clone());
    }
    value
}

pub fn doc(path: &str, seconds: i64, fields: &[(&str, FirestoreValue)]) -> MutableDocument {
    MutableDocument::found_document(key(path), version(seconds), object(fields))
}

pub fn deleted_doc(path: &str, seconds: i64) -> MutableDocument {
    MutableDocument::no_document(key(path), version(seconds))
}

pub fn set_mutation(path: &str, fields: &[(&str, FirestoreValue)]) -> Mutation {
    Mutation::set(key(path), object(fields))
}

/// Patch whose mask is exactly the given fields.
pub fn patch_mutation(path: &str, fields: &[(&str, FirestoreValue)]) -> Mutation {
    let mask = fields
        .iter()
        .map(|(field, _)| FieldPath::from_dot_separated(field).expect("valid field path"))
        .collect();
    Mutation::patch(key(path), object(fields), mask)
}

pub fn delete_mutation(path: &str) -> Mutation {
    Mutation::delete(key(path))
}

/// Acknowledgement committing every mutation of `batch` at `seconds`.
pub fn ack(batch: MutationBatch, seconds: i64) -> MutationBatchResult {
    let results = batch
        .mutations
        .iter()
        .map(|_| MutationResult::new(version(seconds)))
        .collect();
    MutationBatchResult::create(batch, version(seconds), results, Vec::new())
        .expect("one result per mutation")
}

#[derive(Clone, Debug, PartialEq)]
pub enum RemoteCall {
    Listen(TargetData),
    Unlisten(TargetId),
    Write(MutationBatch),
}

/// Remote store that records every outbound call.
#[derive(Debug, Default)]
pub struct RecordingRemoteStore {
    calls: Mutex<Vec<RemoteCall>>,
}

impl RecordingRemoteStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns and forgets the calls recorded so far.
    pub fn take_calls(&self) -> Vec<RemoteCall> {
        std::mem::take(&mut *self.calls.lock().unwrap())
    }

    pub fn listened_targets(&self) -> Vec<TargetData> {
        self.calls
            .lock()
            .unwrap()
            .iter()
            .filter_map(|call| match call {
                RemoteCall::Listen(target_data) => Some(target_data.clone()),
                _ => None,
            })
            .collect()
    }

    pub fn written_batches(&self) -> Vec<MutationBatch> {
        self.calls
            .lock()
            .unwrap()
            .iter()
            .filter_map(|call| match call {
                RemoteCall::Write(batch) => Some(batch.clone()),
                _ => None,
            })
            .collect()
    }

    fn record(&self, call: RemoteCall) {
        self.calls.lock().unwrap().push(call);
    }
}

#[async_trait]
impl RemoteStore for RecordingRemoteStore {
    async fn listen(&self, target_data: TargetData) -> FirestoreResult<()> {
        self.record(RemoteCall::Listen(target_data));
        Ok(())
    }

    async fn unlisten(&self, target_id: TargetId) -> FirestoreResult<()> {
        self.record(RemoteCall::Unlisten(target_id));
        Ok(())
    }

    async fn write_mutations(&self, batch: MutationBatch) -> FirestoreResult<()> {
        self.record(RemoteCall::Write(batch));
        Ok(())
    }
}
