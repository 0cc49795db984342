use serde::{Deserialize, Serialize};

use crate::firestore::model::{DocumentKey, FieldPath, ObjectValue, SnapshotVersion};
use crate::firestore::value::FirestoreValue;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DocumentType {
    /// Nothing is known locally; must be converted before use.
    Invalid,
    FoundDocument,
    NoDocument,
    /// Exists on the backend but its contents are not known (e.g. after a failed patch).
    UnknownDocument,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DocumentState {
    Synced,
    HasLocalMutations,
    HasCommittedMutations,
}

/// What is locally known about one document.
///
/// Documents are mutated in place by remote updates and by mutation replay.
/// Deleted documents are kept as `NoDocument` tombstones so that later
/// updates can be ordered against their version.
#[derive(Clone, Debug, PartialEq)]
pub struct MutableDocument {
    key: DocumentKey,
    document_type: DocumentType,
    version: SnapshotVersion,
    read_time: SnapshotVersion,
    value: ObjectValue,
    document_state: DocumentState,
}

impl MutableDocument {
    fn with_type(
        key: DocumentKey,
        document_type: DocumentType,
        version: SnapshotVersion,
        value: ObjectValue,
    ) -> Self {
        Self {
            key,
            document_type,
            version,
            read_time: SnapshotVersion::none(),
            value,
            document_state: DocumentState::Synced,
        }
    }

    pub fn invalid_document(key: DocumentKey) -> Self {
        Self::with_type(key, DocumentType::Invalid, SnapshotVersion::none(), ObjectValue::empty())
    }

    pub fn found_document(key: DocumentKey, version: SnapshotVersion, value: ObjectValue) -> Self {
        Self::with_type(key, DocumentType::FoundDocument, version, value)
    }

    pub fn no_document(key: DocumentKey, version: SnapshotVersion) -> Self {
        Self::with_type(key, DocumentType::NoDocument, version, ObjectValue::empty())
    }

    pub fn unknown_document(key: DocumentKey, version: SnapshotVersion) -> Self {
        Self::with_type(key, DocumentType::UnknownDocument, version, ObjectValue::empty())
    }

    pub(crate) fn restore(
        key: DocumentKey,
        document_type: DocumentType,
        version: SnapshotVersion,
        read_time: SnapshotVersion,
        value: ObjectValue,
        document_state: DocumentState,
    ) -> Self {
        Self {
            key,
            document_type,
            version,
            read_time,
            value,
            document_state,
        }
    }

    pub fn convert_to_found_document(
        &mut self,
        version: SnapshotVersion,
        value: ObjectValue,
    ) -> &mut Self {
        self.version = version;
        self.document_type = DocumentType::FoundDocument;
        self.value = value;
        self.document_state = DocumentState::Synced;
        self
    }

    pub fn convert_to_no_document(&mut self, version: SnapshotVersion) -> &mut Self {
        self.version = version;
        self.document_type = DocumentType::NoDocument;
        self.value = ObjectValue::empty();
        self.document_state = DocumentState::Synced;
        self
    }

    pub fn convert_to_unknown_document(&mut self, version: SnapshotVersion) -> &mut Self {
        self.version = version;
        self.document_type = DocumentType::UnknownDocument;
        self.value = ObjectValue::empty();
        self.document_state = DocumentState::HasCommittedMutations;
        self
    }

    pub fn set_has_committed_mutations(&mut self) -> &mut Self {
        self.document_state = DocumentState::HasCommittedMutations;
        self
    }

    pub fn set_has_local_mutations(&mut self) -> &mut Self {
        self.document_state = DocumentState::HasLocalMutations;
        self
    }

    pub fn set_read_time(&mut self, read_time: SnapshotVersion) -> &mut Self {
        self.read_time = read_time;
        self
    }

    pub fn key(&self) -> &DocumentKey {
        &self.key
    }

    pub fn document_type(&self) -> DocumentType {
        self.document_type
    }

    pub fn document_state(&self) -> DocumentState {
        self.document_state
    }

    pub fn version(&self) -> SnapshotVersion {
        self.version
    }

    pub fn read_time(&self) -> SnapshotVersion {
        self.read_time
    }

    pub fn data(&self) -> &ObjectValue {
        &self.value
    }

    pub(crate) fn data_mut(&mut self) -> &mut ObjectValue {
        &mut self.value
    }

    pub fn field(&self, path: &FieldPath) -> Option<&FirestoreValue> {
        self.value.field(path)
    }

    pub fn is_valid_document(&self) -> bool {
        self.document_type != DocumentType::Invalid
    }

    pub fn is_found_document(&self) -> bool {
        self.document_type == DocumentType::FoundDocument
    }

    pub fn is_no_document(&self) -> bool {
        self.document_type == DocumentType::NoDocument
    }

    pub fn is_unknown_document(&self) -> bool {
        self.document_type == DocumentType::UnknownDocument
    }

    pub fn has_local_mutations(&self) -> bool {
        self.document_state == DocumentState::HasLocalMutations
    }

    pub fn has_committed_mutations(&self) -> bool {
        self.document_state == DocumentState::HasCommittedMutations
    }

    pub fn has_pending_writes(&self) -> bool {
        self.has_local_mutations() || self.has_committed_mutations()
    }
}
