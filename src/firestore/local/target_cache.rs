use std::collections::{BTreeMap, BTreeSet};

use crate::firestore::core::Query;
use crate::firestore::error::{already_exists, failed_precondition, not_found, FirestoreResult};
use crate::firestore::local::journal::{JournaledCell, JournaledMap};
use crate::firestore::local::local_serializer::{
    decode_json, decode_target, encode_json, encode_target, parse_numeric_key,
    parse_target_document_row_key, target_document_row_key, TargetGlobals,
    DOCUMENT_SENTINEL_TARGET_ID, TARGET_GLOBAL_KEY,
};
use crate::firestore::local::storage::{StorageRow, StorageTable, StorageWrite};
use crate::firestore::local::target_data::TargetData;
use crate::firestore::model::{DocumentKey, ListenSequenceNumber, SnapshotVersion, TargetId};

/// Cached targets, their matching document keys and LRU bookkeeping.
///
/// Membership is indexed both ways (target to keys and key to targets) and
/// maintained incrementally as remote events arrive.
#[derive(Debug, Default)]
pub struct TargetCache {
    targets: JournaledMap<TargetId, TargetData>,
    query_index: JournaledMap<String, TargetId>,
    target_keys: JournaledMap<TargetId, BTreeSet<DocumentKey>>,
    key_targets: JournaledMap<DocumentKey, BTreeSet<TargetId>>,
    document_sequence_numbers: JournaledMap<DocumentKey, ListenSequenceNumber>,
    globals: JournaledCell<TargetGlobals>,
}

impl TargetCache {
    pub fn add_target(&mut self, target_data: &TargetData) -> FirestoreResult<()> {
        let target_id = target_data.target_id();
        if self.targets.contains_key(&target_id) {
            return Err(already_exists(format!("Target {target_id} is already cached")));
        }
        self.query_index
            .insert(target_data.target().canonical_id(), target_id);
        self.targets.insert(target_id, target_data.clone());
        self.update_globals(target_data);
        Ok(())
    }

    pub fn update_target(&mut self, target_data: &TargetData) -> FirestoreResult<()> {
        let target_id = target_data.target_id();
        if !self.targets.contains_key(&target_id) {
            return Err(not_found(format!("Target {target_id} is not cached")));
        }
        self.targets.insert(target_id, target_data.clone());
        self.update_globals(target_data);
        Ok(())
    }

    /// Drops the target together with its matching keys.
    pub fn remove_target(&mut self, target_data: &TargetData) {
        let target_id = target_data.target_id();
        if let Some(removed) = self.targets.remove(&target_id) {
            self.query_index.remove(&removed.target().canonical_id());
        }
        self.remove_matching_keys_for_target(target_id);
    }

    fn update_globals(&mut self, target_data: &TargetData) {
        let current = self.globals.get();
        if target_data.target_id() > current.highest_target_id
            || target_data.sequence_number() > current.highest_listen_sequence_number
        {
            let mut next = current.clone();
            next.highest_target_id = next.highest_target_id.max(target_data.target_id());
            next.highest_listen_sequence_number = next
                .highest_listen_sequence_number
                .max(target_data.sequence_number());
            self.globals.set(next);
        }
    }

    pub fn get_target(&self, query: &Query) -> Option<&TargetData> {
        let target_id = self.query_index.get(&query.canonical_id())?;
        self.targets
            .get(target_id)
            .filter(|data| data.target() == query)
    }

    pub fn get_target_by_id(&self, target_id: TargetId) -> Option<&TargetData> {
        self.targets.get(&target_id)
    }

    pub fn targets(&self) -> impl Iterator<Item = &TargetData> {
        self.targets.values()
    }

    pub fn target_count(&self) -> usize {
        self.targets.len()
    }

    pub fn add_matching_keys<'a, I>(
        &mut self,
        keys: I,
        target_id: TargetId,
        sequence_number: ListenSequenceNumber,
    ) where
        I: IntoIterator<Item = &'a DocumentKey>,
    {
        for key in keys {
            self.target_keys.update(target_id, |set| {
                let mut set = set.unwrap_or_default();
                set.insert(key.clone());
                Some(set)
            });
            self.key_targets.update(key.clone(), |set| {
                let mut set = set.unwrap_or_default();
                set.insert(target_id);
                Some(set)
            });
            self.touch_document(key, sequence_number);
        }
    }

    pub fn remove_matching_keys<'a, I>(
        &mut self,
        keys: I,
        target_id: TargetId,
        sequence_number: ListenSequenceNumber,
    ) where
        I: IntoIterator<Item = &'a DocumentKey>,
    {
        for key in keys {
            self.unlink(target_id, key);
            self.touch_document(key, sequence_number);
        }
    }

    pub fn remove_matching_keys_for_target(&mut self, target_id: TargetId) {
        let keys = self.get_matching_keys(target_id);
        for key in &keys {
            self.unlink(target_id, key);
        }
    }

    fn unlink(&mut self, target_id: TargetId, key: &DocumentKey) {
        if self.target_keys.get(&target_id).is_some_and(|set| set.contains(key)) {
            self.target_keys.update(target_id, |set| {
                let mut set = set?;
                set.remove(key);
                (!set.is_empty()).then_some(set)
            });
        }
        if self.key_targets.get(key).is_some_and(|set| set.contains(&target_id)) {
            self.key_targets.update(key.clone(), |set| {
                let mut set = set?;
                set.remove(&target_id);
                (!set.is_empty()).then_some(set)
            });
        }
    }

    pub fn get_matching_keys(&self, target_id: TargetId) -> BTreeSet<DocumentKey> {
        self.target_keys
            .get(&target_id)
            .cloned()
            .unwrap_or_default()
    }

    /// Whether any cached target references `key`.
    pub fn contains_key(&self, key: &DocumentKey) -> bool {
        self.key_targets.contains_key(key)
    }

    pub fn highest_target_id(&self) -> TargetId {
        self.globals.get().highest_target_id
    }

    pub fn highest_listen_sequence_number(&self) -> ListenSequenceNumber {
        self.globals.get().highest_listen_sequence_number
    }

    pub fn last_remote_snapshot_version(&self) -> SnapshotVersion {
        self.globals.get().last_remote_snapshot_version
    }

    /// Advances the global remote snapshot version; moving it backwards is an error.
    pub fn set_last_remote_snapshot_version(&mut self, version: SnapshotVersion) -> FirestoreResult<()> {
        let current = self.globals.get();
        if version < current.last_remote_snapshot_version {
            return Err(failed_precondition(format!(
                "Watch stream reverted to snapshot {version} after {}",
                current.last_remote_snapshot_version
            )));
        }
        if version != current.last_remote_snapshot_version {
            let mut next = current.clone();
            next.last_remote_snapshot_version = version;
            self.globals.set(next);
        }
        Ok(())
    }

    /// Records that `key` was used at `sequence_number`.
    pub fn touch_document(&mut self, key: &DocumentKey, sequence_number: ListenSequenceNumber) {
        if self.document_sequence_numbers.get(key) != Some(&sequence_number) {
            self.document_sequence_numbers
                .insert(key.clone(), sequence_number);
        }
    }

    pub fn document_sequence_number(&self, key: &DocumentKey) -> Option<ListenSequenceNumber> {
        self.document_sequence_numbers.get(key).copied()
    }

    pub fn remove_document_sequence_number(&mut self, key: &DocumentKey) {
        self.document_sequence_numbers.remove(key);
    }

    /// Tracked documents that no target references, with their last-used sequence number.
    pub fn orphaned_documents(&self) -> Vec<(DocumentKey, ListenSequenceNumber)> {
        self.document_sequence_numbers
            .iter()
            .filter(|(key, _)| !self.key_targets.contains_key(key))
            .map(|(key, sequence_number)| (key.clone(), *sequence_number))
            .collect()
    }

    /// Removes targets last used at or before `upper_bound` that are not in `active_target_ids`.
    pub fn remove_targets(
        &mut self,
        upper_bound: ListenSequenceNumber,
        active_target_ids: &BTreeSet<TargetId>,
    ) -> usize {
        let doomed: Vec<TargetData> = self
            .targets
            .values()
            .filter(|data| data.sequence_number() <= upper_bound)
            .filter(|data| !active_target_ids.contains(&data.target_id()))
            .cloned()
            .collect();
        for target_data in &doomed {
            self.remove_target(target_data);
        }
        doomed.len()
    }

    pub(crate) fn load(rows: &[StorageRow]) -> FirestoreResult<Self> {
        let mut targets = BTreeMap::new();
        let mut query_index = BTreeMap::new();
        let mut target_keys: BTreeMap<TargetId, BTreeSet<DocumentKey>> = BTreeMap::new();
        let mut key_targets: BTreeMap<DocumentKey, BTreeSet<TargetId>> = BTreeMap::new();
        let mut document_sequence_numbers: BTreeMap<DocumentKey, ListenSequenceNumber> = BTreeMap::new();
        let mut globals = TargetGlobals::default();

        for row in rows {
            match row.table {
                StorageTable::Targets => {
                    let target_data = decode_target(&row.value)?;
                    query_index.insert(target_data.target().canonical_id(), target_data.target_id());
                    targets.insert(target_data.target_id(), target_data);
                }
                StorageTable::TargetDocuments => {
                    let (target_id, key) = parse_target_document_row_key(&row.key)?;
                    if target_id == DOCUMENT_SENTINEL_TARGET_ID {
                        let sequence_number = parse_numeric_key("document sequence number", &row.value)?;
                        document_sequence_numbers.insert(key, sequence_number);
                    } else {
                        target_keys.entry(target_id).or_default().insert(key.clone());
                        key_targets.entry(key).or_default().insert(target_id);
                    }
                }
                StorageTable::Globals if row.key == TARGET_GLOBAL_KEY => {
                    globals = decode_json("target globals", &row.value)?;
                }
                _ => {}
            }
        }

        if let Some(highest) = document_sequence_numbers.values().max() {
            globals.highest_listen_sequence_number = globals.highest_listen_sequence_number.max(*highest);
        }

        Ok(Self {
            targets: JournaledMap::from_entries(targets),
            query_index: JournaledMap::from_entries(query_index),
            target_keys: JournaledMap::from_entries(target_keys),
            key_targets: JournaledMap::from_entries(key_targets),
            document_sequence_numbers: JournaledMap::from_entries(document_sequence_numbers),
            globals: JournaledCell::new(globals),
        })
    }

    pub(crate) fn pending_writes(&self, writes: &mut Vec<StorageWrite>) -> FirestoreResult<()> {
        for (target_id, _, after) in self.targets.changes() {
            let key = target_id.to_string();
            writes.push(match after {
                Some(target_data) => StorageWrite::Put(StorageRow {
                    table: StorageTable::Targets,
                    key,
                    value: encode_target(target_data)?,
                }),
                None => StorageWrite::Delete {
                    table: StorageTable::Targets,
                    key,
                },
            });
        }

        let empty = BTreeSet::new();
        for (target_id, before, after) in self.target_keys.changes() {
            let before = before.unwrap_or(&empty);
            let after = after.unwrap_or(&empty);
            for key in before.difference(after) {
                writes.push(StorageWrite::Delete {
                    table: StorageTable::TargetDocuments,
                    key: target_document_row_key(*target_id, key),
                });
            }
            for key in after.difference(before) {
                writes.push(StorageWrite::Put(StorageRow {
                    table: StorageTable::TargetDocuments,
                    key: target_document_row_key(*target_id, key),
                    value: String::new(),
                }));
            }
        }

        for (key, _, after) in self.document_sequence_numbers.changes() {
            let row_key = target_document_row_key(DOCUMENT_SENTINEL_TARGET_ID, key);
            writes.push(match after {
                Some(sequence_number) => StorageWrite::Put(StorageRow {
                    table: StorageTable::TargetDocuments,
                    key: row_key,
                    value: sequence_number.to_string(),
                }),
                None => StorageWrite::Delete {
                    table: StorageTable::TargetDocuments,
                    key: row_key,
                },
            });
        }

        if self.globals.is_dirty() {
            writes.push(StorageWrite::Put(StorageRow {
                table: StorageTable::Globals,
                key: TARGET_GLOBAL_KEY.to_string(),
                value: encode_json("target globals", self.globals.get())?,
            }));
        }
        Ok(())
    }

    pub(crate) fn commit(&mut self) {
        self.targets.commit();
        self.query_index.commit();
        self.target_keys.commit();
        self.key_targets.commit();
        self.document_sequence_numbers.commit();
        self.globals.commit();
    }

    pub(crate) fn rollback(&mut self) {
        self.targets.rollback();
        self.query_index.rollback();
        self.target_keys.rollback();
        self.key_targets.rollback();
        self.document_sequence_numbers.rollback();
        self.globals.rollback();
    }
}
