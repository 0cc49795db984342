mod database_id;
mod document;
mod document_key;
mod field_path;
mod geo_point;
mod mutation;
mod mutation_batch;
mod object_value;
mod resource_path;
mod snapshot_version;
mod timestamp;
mod types;

pub use database_id::{DatabaseId, DEFAULT_DATABASE_ID};
pub use document::{DocumentState, DocumentType, MutableDocument};
pub use document_key::DocumentKey;
pub use field_path::FieldPath;
pub use geo_point::GeoPoint;
pub use mutation::{
    FieldTransform, Mutation, MutationKind, MutationResult, Precondition, TransformOperation,
};
pub use mutation_batch::{MutationBatch, MutationBatchResult};
pub use object_value::ObjectValue;
pub use resource_path::ResourcePath;
pub use snapshot_version::SnapshotVersion;
pub use timestamp::Timestamp;
pub use types::{
    BatchId, ListenSequenceNumber, TargetId, BATCH_ID_UNKNOWN, INVALID_LISTEN_SEQUENCE_NUMBER,
};
