use std::collections::BTreeSet;
use std::sync::LazyLock;

use crate::firestore::error::FirestoreResult;
use crate::firestore::local::persistence::Transaction;
use crate::firestore::local::reference_set::ReferenceSet;
use crate::firestore::model::{ListenSequenceNumber, TargetId, INVALID_LISTEN_SEQUENCE_NUMBER};
use crate::logger::Logger;

static LOGGER: LazyLock<Logger> = LazyLock::new(|| Logger::new("@firebase/firestore/lru_garbage_collector"));

/// Cache size that disables garbage collection.
pub const CACHE_SIZE_UNLIMITED: i64 = -1;

const DEFAULT_CACHE_SIZE_BYTES: i64 = 100 * 1024 * 1024;
const DEFAULT_COLLECTION_PERCENTILE: u32 = 10;
const DEFAULT_MAX_SEQUENCE_NUMBERS_TO_COLLECT: usize = 1_000;

/// Tuning knobs of the least-recently-used collector.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct LruParams {
    /// Collection starts once the serialized documents exceed this many bytes.
    pub cache_size_bytes: i64,
    /// Share of sequence numbers considered per run.
    pub percentile_to_collect: u32,
    pub maximum_sequence_numbers_to_collect: usize,
}

impl Default for LruParams {
    fn default() -> Self {
        Self {
            cache_size_bytes: DEFAULT_CACHE_SIZE_BYTES,
            percentile_to_collect: DEFAULT_COLLECTION_PERCENTILE,
            maximum_sequence_numbers_to_collect: DEFAULT_MAX_SEQUENCE_NUMBERS_TO_COLLECT,
        }
    }
}

impl LruParams {
    pub fn with_cache_size(cache_size_bytes: i64) -> Self {
        Self {
            cache_size_bytes,
            ..Self::default()
        }
    }

    pub fn disabled() -> Self {
        Self::with_cache_size(CACHE_SIZE_UNLIMITED)
    }
}

/// Outcome of one collection attempt.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct LruResults {
    pub did_run: bool,
    pub sequence_numbers_collected: usize,
    pub targets_removed: usize,
    pub documents_removed: usize,
}

#[derive(Clone, Debug)]
pub struct LruGarbageCollector {
    params: LruParams,
}

impl LruGarbageCollector {
    pub fn new(params: LruParams) -> Self {
        Self { params }
    }

    pub fn params(&self) -> &LruParams {
        &self.params
    }

    /// Removes least recently used targets and orphaned documents once the
    /// cache outgrows its configured size.
    ///
    /// Targets in `active_target_ids`, documents pinned by `pinned` and
    /// documents with queued mutations are never removed.
    pub fn collect(
        &self,
        transaction: &mut Transaction<'_>,
        active_target_ids: &BTreeSet<TargetId>,
        pinned: &ReferenceSet,
    ) -> FirestoreResult<LruResults> {
        if self.params.cache_size_bytes == CACHE_SIZE_UNLIMITED {
            LOGGER.debug("Garbage collection skipped; disabled");
            return Ok(LruResults::default());
        }

        let cache_size = transaction.remote_documents.byte_size()?;
        if (cache_size as i64) < self.params.cache_size_bytes {
            LOGGER.debug(format!(
                "Garbage collection skipped; cache size {cache_size} is lower than threshold {}",
                self.params.cache_size_bytes
            ));
            return Ok(LruResults::default());
        }

        let candidates = self.sequence_numbers(transaction);
        let percentile = self.params.percentile_to_collect.min(100) as usize;
        let to_collect = (candidates.len() * percentile / 100)
            .min(self.params.maximum_sequence_numbers_to_collect);
        let upper_bound = nth_sequence_number(candidates, to_collect);

        let targets_removed = transaction
            .target_cache
            .remove_targets(upper_bound, active_target_ids);
        let documents_removed = remove_orphaned_documents(transaction, upper_bound, pinned);

        LOGGER.info(format!(
            "LRU garbage collection: counted {to_collect} sequence numbers, removed {targets_removed} targets and {documents_removed} documents"
        ));
        Ok(LruResults {
            did_run: true,
            sequence_numbers_collected: to_collect,
            targets_removed,
            documents_removed,
        })
    }

    fn sequence_numbers(&self, transaction: &Transaction<'_>) -> Vec<ListenSequenceNumber> {
        let mut numbers: Vec<ListenSequenceNumber> = transaction
            .target_cache
            .targets()
            .map(|target| target.sequence_number())
            .collect();
        numbers.extend(
            transaction
                .target_cache
                .orphaned_documents()
                .into_iter()
                .map(|(_, sequence_number)| sequence_number),
        );
        numbers
    }
}

/// The `n`th smallest sequence number, or an invalid one when `n` is zero.
fn nth_sequence_number(mut numbers: Vec<ListenSequenceNumber>, n: usize) -> ListenSequenceNumber {
    if n == 0 || numbers.is_empty() {
        return INVALID_LISTEN_SEQUENCE_NUMBER;
    }
    numbers.sort_unstable();
    numbers[(n - 1).min(numbers.len() - 1)]
}

fn remove_orphaned_documents(
    transaction: &mut Transaction<'_>,
    upper_bound: ListenSequenceNumber,
    pinned: &ReferenceSet,
) -> usize {
    let doomed: Vec<_> = transaction
        .target_cache
        .orphaned_documents()
        .into_iter()
        .filter(|(_, sequence_number)| *sequence_number <= upper_bound)
        .filter(|(key, _)| !pinned.contains_key(key) && !transaction.mutation_queue.contains_key(key))
        .map(|(key, _)| key)
        .collect();
    for key in &doomed {
        transaction.remote_documents.remove(key);
        transaction.target_cache.remove_document_sequence_number(key);
    }
    doomed.len()
}
