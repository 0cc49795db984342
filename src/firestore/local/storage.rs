use std::collections::BTreeMap;
use std::fmt::{self, Debug, Formatter};
use std::sync::Mutex;

use crate::firestore::error::{lock_poisoned, FirestoreResult};

/// Logical tables of the persisted cache.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum StorageTable {
    /// Single-row values such as the session token and cache-wide metadata.
    Globals,
    Documents,
    Mutations,
    Targets,
    /// Target membership rows; target id 0 holds per-document sequence numbers.
    TargetDocuments,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct StorageRow {
    pub table: StorageTable,
    pub key: String,
    pub value: String,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum StorageWrite {
    Put(StorageRow),
    Delete { table: StorageTable, key: String },
}

/// Durable key-value engine the cache is written through to.
///
/// Implementations must apply each `commit` atomically: either every write of
/// the slice becomes visible to later `load` calls or none does.
pub trait DurableStorage: Send + Sync {
    fn load(&self) -> FirestoreResult<Vec<StorageRow>>;

    fn commit(&self, writes: &[StorageWrite]) -> FirestoreResult<()>;
}

/// Process-local [`DurableStorage`]; survives reopening `Persistence` within one process.
#[derive(Default)]
pub struct MemoryStorage {
    rows: Mutex<BTreeMap<(StorageTable, String), String>>,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn row_count(&self, table: StorageTable) -> FirestoreResult<usize> {
        let rows = self.rows.lock().map_err(lock_poisoned)?;
        Ok(rows.keys().filter(|(t, _)| *t == table).count())
    }
}

impl Debug for MemoryStorage {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_struct("MemoryStorage").finish()
    }
}

impl DurableStorage for MemoryStorage {
    fn load(&self) -> FirestoreResult<Vec<StorageRow>> {
        let rows = self.rows.lock().map_err(lock_poisoned)?;
        Ok(rows
            .iter()
            .map(|((table, key), value)| StorageRow {
                table: *table,
                key: key.clone(),
                value: value.clone(),
            })
            .collect())
    }

    fn commit(&self, writes: &[StorageWrite]) -> FirestoreResult<()> {
        let mut rows = self.rows.lock().map_err(lock_poisoned)?;
        for write in writes {
            match write {
                StorageWrite::Put(row) => {
                    rows.insert((row.table, row.key.clone()), row.value.clone());
                }
                StorageWrite::Delete { table, key } => {
                    rows.remove(&(*table, key.clone()));
                }
            }
        }
        Ok(())
    }
}
