use std::fmt::{self, Debug, Formatter};
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Arc, LazyLock, Mutex};
use std::thread::{self, ThreadId};

use crate::firestore::error::{failed_precondition, lock_poisoned, FirestoreResult};
use crate::firestore::local::globals_cache::GlobalsCache;
use crate::firestore::local::mutation_queue::MutationQueue;
use crate::firestore::local::remote_document_cache::RemoteDocumentCache;
use crate::firestore::local::storage::{DurableStorage, MemoryStorage, StorageRow, StorageWrite};
use crate::firestore::local::target_cache::TargetCache;
use crate::firestore::model::ListenSequenceNumber;
use crate::logger::Logger;

static LOGGER: LazyLock<Logger> = LazyLock::new(|| Logger::new("@firebase/firestore/persistence"));

#[derive(Debug, Default)]
struct PersistedCaches {
    globals: GlobalsCache,
    remote_documents: RemoteDocumentCache,
    mutation_queue: MutationQueue,
    target_cache: TargetCache,
}

impl PersistedCaches {
    fn load(rows: &[StorageRow]) -> FirestoreResult<Self> {
        Ok(Self {
            globals: GlobalsCache::load(rows)?,
            remote_documents: RemoteDocumentCache::load(rows)?,
            mutation_queue: MutationQueue::load(rows)?,
            target_cache: TargetCache::load(rows)?,
        })
    }

    fn pending_writes(&self) -> FirestoreResult<Vec<StorageWrite>> {
        let mut writes = Vec::new();
        self.globals.pending_writes(&mut writes);
        self.remote_documents.pending_writes(&mut writes)?;
        self.mutation_queue.pending_writes(&mut writes)?;
        self.target_cache.pending_writes(&mut writes)?;
        Ok(writes)
    }

    fn commit(&mut self) {
        self.globals.commit();
        self.remote_documents.commit();
        self.mutation_queue.commit();
        self.target_cache.commit();
    }

    fn rollback(&mut self) {
        self.globals.rollback();
        self.remote_documents.rollback();
        self.mutation_queue.rollback();
        self.target_cache.rollback();
    }
}

/// Exclusive view of the caches handed to a transaction block.
pub struct Transaction<'a> {
    label: &'a str,
    sequence_number: ListenSequenceNumber,
    pub(crate) globals: &'a mut GlobalsCache,
    pub(crate) remote_documents: &'a mut RemoteDocumentCache,
    pub(crate) mutation_queue: &'a mut MutationQueue,
    pub(crate) target_cache: &'a mut TargetCache,
}

impl<'a> Transaction<'a> {
    pub fn label(&self) -> &str {
        self.label
    }

    /// Listen sequence number stamped on everything this transaction touches.
    pub fn sequence_number(&self) -> ListenSequenceNumber {
        self.sequence_number
    }

    pub fn globals(&mut self) -> &mut GlobalsCache {
        &mut *self.globals
    }

    pub fn remote_documents(&mut self) -> &mut RemoteDocumentCache {
        &mut *self.remote_documents
    }

    pub fn mutation_queue(&mut self) -> &mut MutationQueue {
        &mut *self.mutation_queue
    }

    pub fn target_cache(&mut self) -> &mut TargetCache {
        &mut *self.target_cache
    }
}

/// Transactional owner of the persisted caches.
///
/// Every change made inside [`run_transaction`](Self::run_transaction) is
/// written through to the [`DurableStorage`] in one commit, or undone in
/// memory when the block or the commit fails.
pub struct Persistence {
    caches: Mutex<PersistedCaches>,
    storage: Arc<dyn DurableStorage>,
    owner: Mutex<Option<ThreadId>>,
    sequence_number: AtomicI64,
}

impl Persistence {
    /// Persistence backed by a fresh [`MemoryStorage`].
    pub fn new_in_memory() -> Self {
        Self {
            caches: Mutex::new(PersistedCaches::default()),
            storage: Arc::new(MemoryStorage::new()),
            owner: Mutex::new(None),
            sequence_number: AtomicI64::new(0),
        }
    }

    /// Opens persistence over `storage`, restoring every cache from its rows.
    pub fn open(storage: Arc<dyn DurableStorage>) -> FirestoreResult<Self> {
        let rows = storage.load()?;
        let caches = PersistedCaches::load(&rows)?;
        let highest = caches.target_cache.highest_listen_sequence_number();
        LOGGER.debug(format!(
            "Restored {} documents, {} targets from {} rows",
            caches.remote_documents.document_count(),
            caches.target_cache.target_count(),
            rows.len()
        ));
        Ok(Self {
            caches: Mutex::new(caches),
            storage,
            owner: Mutex::new(None),
            sequence_number: AtomicI64::new(highest.max(0)),
        })
    }

    /// Runs `block` with exclusive access to the caches.
    ///
    /// Calling this again from inside `block` fails with `failed-precondition`.
    pub fn run_transaction<T, F>(&self, label: &str, block: F) -> FirestoreResult<T>
    where
        F: FnOnce(&mut Transaction<'_>) -> FirestoreResult<T>,
    {
        let current = thread::current().id();
        if *self.owner.lock().map_err(lock_poisoned)? == Some(current) {
            return Err(failed_precondition(format!(
                "Cannot start transaction '{label}' inside another transaction"
            )));
        }

        let mut caches = self.caches.lock().map_err(lock_poisoned)?;
        let _owner = OwnerGuard::claim(&self.owner, current)?;
        let sequence_number = self.sequence_number.fetch_add(1, Ordering::SeqCst) + 1;
        LOGGER.debug(format!("Starting transaction: {label}"));

        let result = {
            let PersistedCaches {
                globals,
                remote_documents,
                mutation_queue,
                target_cache,
            } = &mut *caches;
            let mut transaction = Transaction {
                label,
                sequence_number,
                globals,
                remote_documents,
                mutation_queue,
                target_cache,
            };
            block(&mut transaction)
        };

        let value = match result {
            Ok(value) => value,
            Err(err) => {
                caches.rollback();
                LOGGER.debug(format!("Transaction '{label}' rolled back: {err}"));
                return Err(err);
            }
        };

        let committed = caches
            .pending_writes()
            .and_then(|writes| self.storage.commit(&writes));
        match committed {
            Ok(()) => {
                caches.commit();
                Ok(value)
            }
            Err(err) => {
                caches.rollback();
                LOGGER.warn(format!("Failed to persist transaction '{label}': {err}"));
                Err(err)
            }
        }
    }
}

impl Debug for Persistence {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_struct("Persistence")
            .field("sequence_number", &self.sequence_number.load(Ordering::SeqCst))
            .finish_non_exhaustive()
    }
}

struct OwnerGuard<'a> {
    owner: &'a Mutex<Option<ThreadId>>,
}

impl<'a> OwnerGuard<'a> {
    fn claim(owner: &'a Mutex<Option<ThreadId>>, thread: ThreadId) -> FirestoreResult<Self> {
        *owner.lock().map_err(lock_poisoned)? = Some(thread);
        Ok(Self { owner })
    }
}

impl Drop for OwnerGuard<'_> {
    fn drop(&mut self) {
        if let Ok(mut owner) = self.owner.lock() {
            *owner = None;
        }
    }
}
