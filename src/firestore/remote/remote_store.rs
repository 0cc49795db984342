use async_trait::async_trait;

use crate::firestore::error::FirestoreResult;
use crate::firestore::local::TargetData;
use crate::firestore::model::{MutationBatch, TargetId};

/// Outbound half of the network boundary.
///
/// Implementations own the watch and write streams, reconnect with backoff,
/// and report everything they receive back through a
/// [`RemoteSyncer`](crate::firestore::remote::RemoteSyncer). Calls must not
/// block on the engine: the engine holds its serial lock while issuing them.
#[async_trait]
pub trait RemoteStore: Send + Sync {
    /// Starts watching a target, resuming from its resume token when present.
    async fn listen(&self, target_data: TargetData) -> FirestoreResult<()>;

    async fn unlisten(&self, target_id: TargetId) -> FirestoreResult<()>;

    /// Queues a batch on the write stream; batches arrive in batch id order.
    async fn write_mutations(&self, batch: MutationBatch) -> FirestoreResult<()>;
}
