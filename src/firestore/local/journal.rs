use std::collections::BTreeMap;
use std::collections::btree_map::{Iter, Range};
use std::ops::RangeBounds;

/// Ordered map that remembers the before-image of every entry touched since the
/// last [`commit`](Self::commit) so a failed transaction can be undone.
#[derive(Clone, Debug)]
pub(crate) struct JournaledMap<K, V> {
    entries: BTreeMap<K, V>,
    journal: BTreeMap<K, Option<V>>,
}

impl<K, V> Default for JournaledMap<K, V> {
    fn default() -> Self {
        Self {
            entries: BTreeMap::new(),
            journal: BTreeMap::new(),
        }
    }
}

impl<K: Ord + Clone, V: Clone> JournaledMap<K, V> {
    pub(crate) fn from_entries(entries: BTreeMap<K, V>) -> Self {
        Self {
            entries,
            journal: BTreeMap::new(),
        }
    }

    pub(crate) fn get(&self, key: &K) -> Option<&V> {
        self.entries.get(key)
    }

    pub(crate) fn contains_key(&self, key: &K) -> bool {
        self.entries.contains_key(key)
    }

    pub(crate) fn len(&self) -> usize {
        self.entries.len()
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub(crate) fn iter(&self) -> Iter<'_, K, V> {
        self.entries.iter()
    }

    pub(crate) fn range<R: RangeBounds<K>>(&self, range: R) -> Range<'_, K, V> {
        self.entries.range(range)
    }

    pub(crate) fn keys(&self) -> impl DoubleEndedIterator<Item = &K> {
        self.entries.keys()
    }

    pub(crate) fn values(&self) -> impl Iterator<Item = &V> {
        self.entries.values()
    }

    pub(crate) fn insert(&mut self, key: K, value: V) -> Option<V> {
        self.record(&key);
        self.entries.insert(key, value)
    }

    pub(crate) fn remove(&mut self, key: &K) -> Option<V> {
        if !self.entries.contains_key(key) {
            return None;
        }
        self.record(key);
        self.entries.remove(key)
    }

    /// Read-modify-write of one entry; `None` results remove it.
    pub(crate) fn update<F>(&mut self, key: K, f: F)
    where
        F: FnOnce(Option<V>) -> Option<V>,
    {
        self.record(&key);
        let current = self.entries.remove(&key);
        if let Some(next) = f(current) {
            self.entries.insert(key, next);
        }
    }

    fn record(&mut self, key: &K) {
        if !self.journal.contains_key(key) {
            self.journal.insert(key.clone(), self.entries.get(key).cloned());
        }
    }

    /// Entries touched since the last commit, with their before and after images.
    pub(crate) fn changes(&self) -> impl Iterator<Item = (&K, Option<&V>, Option<&V>)> {
        self.journal
            .iter()
            .map(|(key, before)| (key, before.as_ref(), self.entries.get(key)))
    }

    pub(crate) fn commit(&mut self) {
        self.journal.clear();
    }

    pub(crate) fn rollback(&mut self) {
        for (key, before) in std::mem::take(&mut self.journal) {
            match before {
                Some(value) => {
                    self.entries.insert(key, value);
                }
                None => {
                    self.entries.remove(&key);
                }
            }
        }
    }
}

/// Single journaled value.
#[derive(Clone, Debug, Default)]
pub(crate) struct JournaledCell<T> {
    value: T,
    before: Option<T>,
}

impl<T: Clone> JournaledCell<T> {
    pub(crate) fn new(value: T) -> Self {
        Self {
            value,
            before: None,
        }
    }

    pub(crate) fn get(&self) -> &T {
        &self.value
    }

    pub(crate) fn set(&mut self, value: T) {
        if self.before.is_none() {
            self.before = Some(self.value.clone());
        }
        self.value = value;
    }

    pub(crate) fn is_dirty(&self) -> bool {
        self.before.is_some()
    }

    pub(crate) fn commit(&mut self) {
        self.before = None;
    }

    pub(crate) fn rollback(&mut self) {
        if let Some(before) = self.before.take() {
            self.value = before;
        }
    }
}
