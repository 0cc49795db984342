use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::firestore::model::FieldPath;
use crate::firestore::value::FirestoreValue;

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MapValue {
    fields: BTreeMap<String, FirestoreValue>,
}

impl MapValue {
    pub fn new(fields: BTreeMap<String, FirestoreValue>) -> Self {
        Self { fields }
    }

    pub fn fields(&self) -> &BTreeMap<String, FirestoreValue> {
        &self.fields
    }

    pub fn into_fields(self) -> BTreeMap<String, FirestoreValue> {
        self.fields
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    /// Resolves a nested field, descending through map values.
    pub fn get(&self, path: &FieldPath) -> Option<&FirestoreValue> {
        let (first, rest) = path.segments().split_first()?;
        let mut current = self.fields.get(first)?;
        for segment in rest {
            current = current.as_map()?.fields.get(segment)?;
        }
        Some(current)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resolves_nested_fields() {
        let mut inner = BTreeMap::new();
        inner.insert("city".to_string(), FirestoreValue::from_string("SF"));
        let mut outer = BTreeMap::new();
        outer.insert("address".to_string(), FirestoreValue::from_map(inner));
        let map = MapValue::new(outer);

        let path = FieldPath::from_dot_separated("address.city").unwrap();
        assert_eq!(map.get(&path), Some(&FirestoreValue::from_string("SF")));
        let missing = FieldPath::from_dot_separated("address.zip").unwrap();
        assert!(map.get(&missing).is_none());
    }
}
