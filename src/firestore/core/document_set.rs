use std::cmp::Ordering;
use std::collections::BTreeMap;

use crate::firestore::core::query::DocumentComparator;
use crate::firestore::model::{DocumentKey, MutableDocument};

/// Documents kept in query order, with lookup by key.
#[derive(Clone, Debug)]
pub struct DocumentSet {
    comparator: DocumentComparator,
    by_key: BTreeMap<DocumentKey, MutableDocument>,
    sorted: Vec<MutableDocument>,
}

impl DocumentSet {
    pub fn new(comparator: DocumentComparator) -> Self {
        Self {
            comparator,
            by_key: BTreeMap::new(),
            sorted: Vec::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.sorted.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sorted.is_empty()
    }

    pub fn contains(&self, key: &DocumentKey) -> bool {
        self.by_key.contains_key(key)
    }

    pub fn get(&self, key: &DocumentKey) -> Option<&MutableDocument> {
        self.by_key.get(key)
    }

    pub fn first(&self) -> Option<&MutableDocument> {
        self.sorted.first()
    }

    pub fn last(&self) -> Option<&MutableDocument> {
        self.sorted.last()
    }

    /// Position of the document in query order.
    pub fn index_of(&self, key: &DocumentKey) -> Option<usize> {
        let document = self.by_key.get(key)?;
        self.sorted
            .binary_search_by(|probe| self.order(probe, document))
            .ok()
    }

    pub fn iter(&self) -> impl DoubleEndedIterator<Item = &MutableDocument> + ExactSizeIterator {
        self.sorted.iter()
    }

    pub fn keys(&self) -> impl Iterator<Item = &DocumentKey> {
        self.sorted.iter().map(MutableDocument::key)
    }

    /// Inserts or replaces the document with the same key.
    pub fn insert(&mut self, document: MutableDocument) {
        self.remove(document.key());
        let position = self
            .sorted
            .partition_point(|probe| self.order(probe, &document) == Ordering::Less);
        self.sorted.insert(position, document.clone());
        self.by_key.insert(document.key().clone(), document);
    }

    pub fn remove(&mut self, key: &DocumentKey) -> Option<MutableDocument> {
        let index = self.index_of(key)?;
        self.by_key.remove(key);
        Some(self.sorted.remove(index))
    }

    fn order(&self, left: &MutableDocument, right: &MutableDocument) -> Ordering {
        self.comparator
            .compare(left, right)
            .then_with(|| left.key().cmp(right.key()))
    }
}

impl PartialEq for DocumentSet {
    fn eq(&self, other: &Self) -> bool {
        self.sorted == other.sorted
    }
}

impl<'a> IntoIterator for &'a DocumentSet {
    type Item = &'a MutableDocument;
    type IntoIter = std::slice::Iter<'a, MutableDocument>;

    fn into_iter(self) -> Self::IntoIter {
        self.sorted.iter()
    }
}
