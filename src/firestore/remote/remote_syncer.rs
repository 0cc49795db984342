use std::collections::BTreeSet;

use futures::FutureExt;

use crate::firestore::error::{FirestoreError, FirestoreResult};
use crate::firestore::model::{BatchId, DocumentKey, MutationBatchResult, TargetId};
use crate::firestore::remote::remote_event::RemoteEvent;

pub type RemoteStoreFuture<'a, T> = futures::future::BoxFuture<'a, T>;

pub fn box_remote_store_future<'a, F, T>(future: F) -> RemoteStoreFuture<'a, T>
where
    F: std::future::Future<Output = T> + Send + 'a,
{
    future.boxed()
}

/// Inbound half of the network boundary: callbacks the remote store invokes
/// as watch and write stream traffic arrives.
pub trait RemoteSyncer: Send + Sync + 'static {
    /// Applies a `RemoteEvent` that was already aggregated from watch changes.
    fn apply_remote_event(&self, event: RemoteEvent) -> RemoteStoreFuture<'_, FirestoreResult<()>>;

    /// Signals that the backend rejected a watch target.
    fn reject_listen(
        &self,
        target_id: TargetId,
        error: FirestoreError,
    ) -> RemoteStoreFuture<'_, FirestoreResult<()>>;

    /// Applies the acknowledgement for a committed mutation batch.
    fn apply_successful_write(
        &self,
        result: MutationBatchResult,
    ) -> RemoteStoreFuture<'_, FirestoreResult<()>>;

    /// Rejects a mutation batch the backend refused.
    fn reject_failed_write(
        &self,
        batch_id: BatchId,
        error: FirestoreError,
    ) -> RemoteStoreFuture<'_, FirestoreResult<()>>;

    /// The watch stream broke; every target must resync after reconnecting.
    fn handle_stream_error(&self, error: FirestoreError) -> RemoteStoreFuture<'_, FirestoreResult<()>>;

    /// Keys the backend last confirmed for a target.
    fn remote_keys_for_target(&self, target_id: TargetId) -> RemoteStoreFuture<'_, BTreeSet<DocumentKey>>;
}
