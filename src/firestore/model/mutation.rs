use serde::{Deserialize, Serialize};

use crate::firestore::error::{internal_error, FirestoreResult};
use crate::firestore::model::{
    DocumentKey, FieldPath, MutableDocument, ObjectValue, SnapshotVersion, Timestamp,
};
use crate::firestore::value::{FirestoreValue, ValueKind};

/// Condition the stored document must satisfy for a mutation to apply.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum Precondition {
    None,
    Exists(bool),
    UpdateTime(SnapshotVersion),
}

impl Precondition {
    pub fn is_none(&self) -> bool {
        matches!(self, Precondition::None)
    }

    pub fn is_valid_for(&self, document: &MutableDocument) -> bool {
        match self {
            Precondition::None => true,
            Precondition::Exists(exists) => *exists == document.is_found_document(),
            Precondition::UpdateTime(version) => {
                document.is_found_document() && document.version() == *version
            }
        }
    }
}

/// Write-time operations evaluated against the field's previous value.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum TransformOperation {
    ServerTimestamp,
    ArrayUnion(Vec<FirestoreValue>),
    ArrayRemove(Vec<FirestoreValue>),
    NumericIncrement(FirestoreValue),
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct FieldTransform {
    field_path: FieldPath,
    operation: TransformOperation,
}

impl FieldTransform {
    pub fn new(field_path: FieldPath, operation: TransformOperation) -> Self {
        Self {
            field_path,
            operation,
        }
    }

    pub fn field_path(&self) -> &FieldPath {
        &self.field_path
    }

    pub fn operation(&self) -> &TransformOperation {
        &self.operation
    }

    /// Latency-compensated result computed on the client before the backend answers.
    fn apply_to_local_view(
        &self,
        previous: Option<&FirestoreValue>,
        local_write_time: Timestamp,
    ) -> FirestoreValue {
        match &self.operation {
            TransformOperation::ServerTimestamp => {
                FirestoreValue::server_timestamp(local_write_time, previous)
            }
            TransformOperation::ArrayUnion(elements) => array_union(previous, elements),
            TransformOperation::ArrayRemove(elements) => array_remove(previous, elements),
            TransformOperation::NumericIncrement(operand) => numeric_increment(previous, operand),
        }
    }
}

fn existing_elements(previous: Option<&FirestoreValue>) -> Vec<FirestoreValue> {
    previous
        .and_then(FirestoreValue::as_array)
        .map(|array| array.values().to_vec())
        .unwrap_or_default()
}

fn array_union(previous: Option<&FirestoreValue>, additions: &[FirestoreValue]) -> FirestoreValue {
    let mut values = existing_elements(previous);
    for element in additions {
        if !values.iter().any(|candidate| candidate == element) {
            values.push(element.clone());
        }
    }
    FirestoreValue::from_array(values)
}

fn array_remove(previous: Option<&FirestoreValue>, removals: &[FirestoreValue]) -> FirestoreValue {
    let values = existing_elements(previous)
        .into_iter()
        .filter(|candidate| !removals.contains(candidate))
        .collect();
    FirestoreValue::from_array(values)
}

/// Non-numeric previous values count as zero; integer overflow falls back to a double.
fn numeric_increment(previous: Option<&FirestoreValue>, operand: &FirestoreValue) -> FirestoreValue {
    let base = previous.filter(|value| value.is_number());
    match (base.map(FirestoreValue::kind), operand.kind()) {
        (Some(ValueKind::Integer(current)), ValueKind::Integer(delta)) => {
            match current.checked_add(*delta) {
                Some(sum) => FirestoreValue::from_integer(sum),
                None => FirestoreValue::from_double(*current as f64 + *delta as f64),
            }
        }
        (Some(ValueKind::Integer(current)), ValueKind::Double(delta)) => {
            FirestoreValue::from_double(*current as f64 + delta)
        }
        (Some(ValueKind::Double(current)), ValueKind::Integer(delta)) => {
            FirestoreValue::from_double(current + *delta as f64)
        }
        (Some(ValueKind::Double(current)), ValueKind::Double(delta)) => {
            FirestoreValue::from_double(current + delta)
        }
        _ => operand.clone(),
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum MutationKind {
    /// Replaces the whole document.
    Set { value: ObjectValue },
    /// Updates only the fields named in `mask`; masked fields absent from `value` are deleted.
    Patch {
        value: ObjectValue,
        mask: Vec<FieldPath>,
    },
    Delete,
    /// Asserts the precondition without writing.
    Verify,
}

/// A single change to one document.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Mutation {
    key: DocumentKey,
    precondition: Precondition,
    field_transforms: Vec<FieldTransform>,
    kind: MutationKind,
}

/// Backend answer for one mutation of an acknowledged batch.
#[derive(Clone, Debug, PartialEq)]
pub struct MutationResult {
    pub version: SnapshotVersion,
    pub transform_results: Option<Vec<FirestoreValue>>,
}

impl MutationResult {
    pub fn new(version: SnapshotVersion) -> Self {
        Self {
            version,
            transform_results: None,
        }
    }

    pub fn with_transform_results(mut self, results: Vec<FirestoreValue>) -> Self {
        self.transform_results = Some(results);
        self
    }
}

impl Mutation {
    pub fn set(key: DocumentKey, value: ObjectValue) -> Self {
        Self {
            key,
            precondition: Precondition::None,
            field_transforms: Vec::new(),
            kind: MutationKind::Set { value },
        }
    }

    /// Patch with the default `exists: true` precondition.
    pub fn patch(key: DocumentKey, value: ObjectValue, mask: Vec<FieldPath>) -> Self {
        Self {
            key,
            precondition: Precondition::Exists(true),
            field_transforms: Vec::new(),
            kind: MutationKind::Patch { value, mask },
        }
    }

    pub fn delete(key: DocumentKey) -> Self {
        Self {
            key,
            precondition: Precondition::None,
            field_transforms: Vec::new(),
            kind: MutationKind::Delete,
        }
    }

    pub fn verify(key: DocumentKey, precondition: Precondition) -> Self {
        Self {
            key,
            precondition,
            field_transforms: Vec::new(),
            kind: MutationKind::Verify,
        }
    }

    pub fn with_precondition(mut self, precondition: Precondition) -> Self {
        self.precondition = precondition;
        self
    }

    pub fn with_transform(mut self, transform: FieldTransform) -> Self {
        self.field_transforms.push(transform);
        self
    }

    pub fn key(&self) -> &DocumentKey {
        &self.key
    }

    pub fn precondition(&self) -> &Precondition {
        &self.precondition
    }

    pub fn field_transforms(&self) -> &[FieldTransform] {
        &self.field_transforms
    }

    pub fn kind(&self) -> &MutationKind {
        &self.kind
    }

    /// Applies this mutation on top of the local view of `document`.
    ///
    /// A failed precondition leaves the document untouched; sibling mutations
    /// in the same batch are unaffected.
    pub fn apply_to_local_view(&self, document: &mut MutableDocument, local_write_time: Timestamp) {
        debug_assert_eq!(document.key(), &self.key);
        if !self.precondition.is_valid_for(document) {
            return;
        }

        match &self.kind {
            MutationKind::Set { value } => {
                let transform_results = self.local_transform_results(document, local_write_time);
                let mut new_data = value.clone();
                self.write_transform_results(&mut new_data, transform_results);
                let version = document.version();
                document
                    .convert_to_found_document(version, new_data)
                    .set_has_local_mutations();
            }
            MutationKind::Patch { value, mask } => {
                let transform_results = self.local_transform_results(document, local_write_time);
                let mut new_data = document.data().clone();
                apply_patch(&mut new_data, value, mask);
                self.write_transform_results(&mut new_data, transform_results);
                let version = document.version();
                document
                    .convert_to_found_document(version, new_data)
                    .set_has_local_mutations();
            }
            MutationKind::Delete => {
                let version = document.version();
                document.convert_to_no_document(version).set_has_local_mutations();
            }
            MutationKind::Verify => {}
        }
    }

    /// Applies the backend-acknowledged result of this mutation to `document`.
    pub fn apply_to_remote_document(
        &self,
        document: &mut MutableDocument,
        result: &MutationResult,
    ) -> FirestoreResult<()> {
        debug_assert_eq!(document.key(), &self.key);
        match &self.kind {
            MutationKind::Set { value } => {
                let transform_results = self.server_transform_results(result)?;
                let mut new_data = value.clone();
                self.write_transform_results(&mut new_data, transform_results);
                document
                    .convert_to_found_document(result.version, new_data)
                    .set_has_committed_mutations();
            }
            MutationKind::Patch { value, mask } => {
                if !self.precondition.is_valid_for(document) {
                    // The backend applied the patch to a version we never saw.
                    document.convert_to_unknown_document(result.version);
                    return Ok(());
                }
                let transform_results = self.server_transform_results(result)?;
                let mut new_data = document.data().clone();
                apply_patch(&mut new_data, value, mask);
                self.write_transform_results(&mut new_data, transform_results);
                document
                    .convert_to_found_document(result.version, new_data)
                    .set_has_committed_mutations();
            }
            MutationKind::Delete => {
                document
                    .convert_to_no_document(result.version)
                    .set_has_committed_mutations();
            }
            MutationKind::Verify => {}
        }
        Ok(())
    }

    /// Base values that pin the operands of numeric increments.
    ///
    /// Returns the values together with their field mask, or `None` when the
    /// mutation has no transform that depends on the previous value.
    pub fn extract_transform_base_value(
        &self,
        document: &MutableDocument,
    ) -> Option<(ObjectValue, Vec<FieldPath>)> {
        let mut base = ObjectValue::empty();
        let mut mask = Vec::new();
        for transform in &self.field_transforms {
            if let TransformOperation::NumericIncrement(_) = transform.operation() {
                let existing = document
                    .field(transform.field_path())
                    .filter(|value| value.is_number())
                    .cloned()
                    .unwrap_or_else(|| FirestoreValue::from_integer(0));
                base.set(transform.field_path(), existing);
                mask.push(transform.field_path().clone());
            }
        }
        if mask.is_empty() {
            None
        } else {
            Some((base, mask))
        }
    }

    fn local_transform_results(
        &self,
        document: &MutableDocument,
        local_write_time: Timestamp,
    ) -> Vec<FirestoreValue> {
        self.field_transforms
            .iter()
            .map(|transform| {
                transform.apply_to_local_view(document.field(transform.field_path()), local_write_time)
            })
            .collect()
    }

    fn server_transform_results(&self, result: &MutationResult) -> FirestoreResult<Vec<FirestoreValue>> {
        match &result.transform_results {
            None if self.field_transforms.is_empty() => Ok(Vec::new()),
            Some(results) if results.len() == self.field_transforms.len() => Ok(results.clone()),
            Some(results) => Err(internal_error(format!(
                "Server transform result count ({}) should match field transform count ({})",
                results.len(),
                self.field_transforms.len()
            ))),
            None => Err(internal_error(format!(
                "Missing transform results for {}",
                self.key
            ))),
        }
    }

    fn write_transform_results(&self, data: &mut ObjectValue, results: Vec<FirestoreValue>) {
        for (transform, value) in self.field_transforms.iter().zip(results) {
            data.set(transform.field_path(), value);
        }
    }
}

fn apply_patch(data: &mut ObjectValue, value: &ObjectValue, mask: &[FieldPath]) {
    for path in mask {
        match value.field(path) {
            Some(field) => data.set(path, field.clone()),
            None => data.delete(path),
        }
    }
}
