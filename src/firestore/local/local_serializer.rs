use base64::{engine::general_purpose::STANDARD, Engine as _};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::firestore::core::Query;
use crate::firestore::error::{data_loss, FirestoreResult};
use crate::firestore::local::target_data::{QueryPurpose, TargetData};
use crate::firestore::model::{
    BatchId, DocumentKey, DocumentState, DocumentType, ListenSequenceNumber, MutableDocument,
    MutationBatch, ObjectValue, SnapshotVersion, TargetId, BATCH_ID_UNKNOWN,
};

pub(crate) const SESSION_TOKEN_KEY: &str = "sessionToken";
pub(crate) const MUTATION_QUEUE_KEY: &str = "mutationQueue";
pub(crate) const TARGET_GLOBAL_KEY: &str = "targetGlobal";

/// Target id used for per-document sequence number rows in the membership table.
pub(crate) const DOCUMENT_SENTINEL_TARGET_ID: TargetId = 0;

mod base64_bytes {
    use base64::{engine::general_purpose::STANDARD, Engine as _};
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let encoded = String::deserialize(deserializer)?;
        STANDARD.decode(encoded).map_err(serde::de::Error::custom)
    }
}

#[derive(Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct DocumentRecord {
    key: DocumentKey,
    #[serde(rename = "type")]
    document_type: DocumentType,
    version: SnapshotVersion,
    read_time: SnapshotVersion,
    #[serde(default)]
    value: ObjectValue,
    state: DocumentState,
}

#[derive(Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct TargetRecord {
    target_id: TargetId,
    query: Query,
    purpose: QueryPurpose,
    sequence_number: ListenSequenceNumber,
    snapshot_version: SnapshotVersion,
    last_limbo_free_snapshot_version: SnapshotVersion,
    #[serde(with = "base64_bytes")]
    resume_token: Vec<u8>,
}

/// Write-stream bookkeeping of the mutation queue.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct MutationQueueMetadata {
    pub(crate) last_acknowledged_batch_id: BatchId,
    pub(crate) highest_batch_id: BatchId,
    #[serde(with = "base64_bytes")]
    pub(crate) last_stream_token: Vec<u8>,
}

impl Default for MutationQueueMetadata {
    fn default() -> Self {
        Self {
            last_acknowledged_batch_id: BATCH_ID_UNKNOWN,
            highest_batch_id: BATCH_ID_UNKNOWN,
            last_stream_token: Vec::new(),
        }
    }
}

/// Cache-wide target bookkeeping.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct TargetGlobals {
    pub(crate) highest_target_id: TargetId,
    pub(crate) highest_listen_sequence_number: ListenSequenceNumber,
    pub(crate) last_remote_snapshot_version: SnapshotVersion,
}

pub(crate) fn encode_json<T: Serialize>(label: &str, value: &T) -> FirestoreResult<String> {
    serde_json::to_string(value)
        .map_err(|err| data_loss(format!("Failed to encode {label}: {err}")))
}

pub(crate) fn decode_json<T: DeserializeOwned>(label: &str, raw: &str) -> FirestoreResult<T> {
    serde_json::from_str(raw).map_err(|err| data_loss(format!("Failed to decode {label}: {err}")))
}

pub(crate) fn encode_document(document: &MutableDocument) -> FirestoreResult<String> {
    let record = DocumentRecord {
        key: document.key().clone(),
        document_type: document.document_type(),
        version: document.version(),
        read_time: document.read_time(),
        value: document.data().clone(),
        state: document.document_state(),
    };
    encode_json("document", &record)
}

pub(crate) fn decode_document(raw: &str) -> FirestoreResult<MutableDocument> {
    let record: DocumentRecord = decode_json("document", raw)?;
    Ok(MutableDocument::restore(
        record.key,
        record.document_type,
        record.version,
        record.read_time,
        record.value,
        record.state,
    ))
}

pub(crate) fn encode_mutation_batch(batch: &MutationBatch) -> FirestoreResult<String> {
    encode_json("mutation batch", batch)
}

pub(crate) fn decode_mutation_batch(raw: &str) -> FirestoreResult<MutationBatch> {
    decode_json("mutation batch", raw)
}

pub(crate) fn encode_target(target_data: &TargetData) -> FirestoreResult<String> {
    let record = TargetRecord {
        target_id: target_data.target_id(),
        query: target_data.target().clone(),
        purpose: target_data.purpose(),
        sequence_number: target_data.sequence_number(),
        snapshot_version: target_data.snapshot_version(),
        last_limbo_free_snapshot_version: target_data.last_limbo_free_snapshot_version(),
        resume_token: target_data.resume_token().to_vec(),
    };
    encode_json("target", &record)
}

pub(crate) fn decode_target(raw: &str) -> FirestoreResult<TargetData> {
    let record: TargetRecord = decode_json("target", raw)?;
    Ok(TargetData::restore(
        record.query,
        record.target_id,
        record.purpose,
        record.sequence_number,
        record.snapshot_version,
        record.last_limbo_free_snapshot_version,
        record.resume_token,
    ))
}

pub(crate) fn encode_bytes(bytes: &[u8]) -> String {
    STANDARD.encode(bytes)
}

pub(crate) fn decode_bytes(label: &str, raw: &str) -> FirestoreResult<Vec<u8>> {
    STANDARD
        .decode(raw)
        .map_err(|err| data_loss(format!("Failed to decode {label}: {err}")))
}

pub(crate) fn target_document_row_key(target_id: TargetId, key: &DocumentKey) -> String {
    format!("{target_id}|{}", key.path().canonical_string())
}

pub(crate) fn parse_target_document_row_key(raw: &str) -> FirestoreResult<(TargetId, DocumentKey)> {
    let (target, path) = raw
        .split_once('|')
        .ok_or_else(|| data_loss(format!("Malformed target document row: {raw}")))?;
    let target_id = target
        .parse::<TargetId>()
        .map_err(|err| data_loss(format!("Malformed target id in {raw}: {err}")))?;
    let key = DocumentKey::from_string(path)
        .map_err(|err| data_loss(format!("Malformed document key in {raw}: {err}")))?;
    Ok((target_id, key))
}

pub(crate) fn parse_numeric_key<T: std::str::FromStr>(label: &str, raw: &str) -> FirestoreResult<T> {
    raw.parse::<T>()
        .map_err(|_| data_loss(format!("Malformed {label} row key: {raw}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::firestore::model::{FieldPath, Mutation, ResourcePath, Timestamp};
    use crate::firestore::value::FirestoreValue;

    fn key() -> DocumentKey {
        DocumentKey::from_string("rooms/eros").unwrap()
    }

    #[test]
    fn document_records_keep_state_and_read_time() {
        let mut value = ObjectValue::empty();
        value.set(
            &FieldPath::from_dot_separated("title").unwrap(),
            FirestoreValue::from_string("hello"),
        );
        let mut doc = MutableDocument::found_document(
            key(),
            SnapshotVersion::new(Timestamp::new(4, 0)),
            value,
        );
        doc.set_has_committed_mutations()
            .set_read_time(SnapshotVersion::new(Timestamp::new(5, 0)));

        let decoded = decode_document(&encode_document(&doc).unwrap()).unwrap();
        assert_eq!(decoded, doc);
    }

    #[test]
    fn target_records_encode_resume_token_as_base64() {
        let query = Query::new(ResourcePath::from_string("rooms").unwrap());
        let data = TargetData::new(query, 4, QueryPurpose::Listen, 9)
            .with_resume_token(vec![0xff, 0x00], SnapshotVersion::new(Timestamp::new(1, 0)));
        let raw = encode_target(&data).unwrap();
        assert!(raw.contains("\"resumeToken\":\"/wA=\""));
        assert_eq!(decode_target(&raw).unwrap(), data);
    }

    #[test]
    fn batches_round_trip_with_preconditions() {
        let batch = MutationBatch::new(
            3,
            Timestamp::new(8, 0),
            Vec::new(),
            vec![Mutation::patch(key(), ObjectValue::empty(), Vec::new())],
        );
        let decoded = decode_mutation_batch(&encode_mutation_batch(&batch).unwrap()).unwrap();
        assert_eq!(decoded, batch);
    }

    #[test]
    fn malformed_rows_surface_data_loss() {
        let err = decode_document("{not json").unwrap_err();
        assert_eq!(err.code_str(), "firestore/data-loss");
        let err = parse_target_document_row_key("nope").unwrap_err();
        assert_eq!(err.code_str(), "firestore/data-loss");
    }

    #[test]
    fn membership_row_keys() {
        let raw = target_document_row_key(12, &key());
        assert_eq!(raw, "12|rooms/eros");
        assert_eq!(parse_target_document_row_key(&raw).unwrap(), (12, key()));
    }
}
