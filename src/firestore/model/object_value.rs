use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::firestore::model::FieldPath;
use crate::firestore::value::{FirestoreValue, MapValue};

/// Mutable structured contents of a document.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ObjectValue {
    fields: BTreeMap<String, FirestoreValue>,
}

impl ObjectValue {
    pub fn empty() -> Self {
        Self::default()
    }

    pub fn from_fields(fields: BTreeMap<String, FirestoreValue>) -> Self {
        Self { fields }
    }

    pub fn from_map(map: MapValue) -> Self {
        Self::from_fields(map.into_fields())
    }

    pub fn fields(&self) -> &BTreeMap<String, FirestoreValue> {
        &self.fields
    }

    pub fn to_map_value(&self) -> MapValue {
        MapValue::new(self.fields.clone())
    }

    pub fn field(&self, path: &FieldPath) -> Option<&FirestoreValue> {
        let (first, rest) = path.segments().split_first()?;
        let mut current = self.fields.get(first)?;
        for segment in rest {
            current = current.as_map()?.fields().get(segment)?;
        }
        Some(current)
    }

    /// Writes `value` at `path`, creating (or replacing non-map) parents as needed.
    pub fn set(&mut self, path: &FieldPath, value: FirestoreValue) {
        set_at_segments(&mut self.fields, path.segments(), value);
    }

    /// Removes the field at `path`; missing parents are left alone.
    pub fn delete(&mut self, path: &FieldPath) {
        delete_at_segments(&mut self.fields, path.segments());
    }

    /// Applies a batch of writes where `None` deletes the field.
    pub fn set_all(&mut self, updates: BTreeMap<FieldPath, Option<FirestoreValue>>) {
        for (path, value) in updates {
            match value {
                Some(value) => self.set(&path, value),
                None => self.delete(&path),
            }
        }
    }
}

fn set_at_segments(
    fields: &mut BTreeMap<String, FirestoreValue>,
    segments: &[String],
    value: FirestoreValue,
) {
    let Some((first, rest)) = segments.split_first() else {
        return;
    };
    if rest.is_empty() {
        fields.insert(first.clone(), value);
        return;
    }

    let mut child = fields
        .get(first)
        .and_then(FirestoreValue::as_map)
        .map(|map| map.fields().clone())
        .unwrap_or_default();
    set_at_segments(&mut child, rest, value);
    fields.insert(first.clone(), FirestoreValue::from_map(child));
}

fn delete_at_segments(fields: &mut BTreeMap<String, FirestoreValue>, segments: &[String]) {
    let Some((first, rest)) = segments.split_first() else {
        return;
    };
    if rest.is_empty() {
        fields.remove(first);
        return;
    }

    let Some(mut child) = fields
        .get(first)
        .and_then(FirestoreValue::as_map)
        .map(|map| map.fields().clone())
    else {
        return;
    };
    delete_at_segments(&mut child, rest);
    fields.insert(first.clone(), FirestoreValue::from_map(child));
}
