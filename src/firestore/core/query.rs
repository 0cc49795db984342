use std::cmp::Ordering;
use std::fmt::Write as _;

use serde::{Deserialize, Serialize};

use crate::firestore::model::{DocumentKey, FieldPath, MutableDocument, ResourcePath};
use crate::firestore::value::{value_util, FirestoreValue, ValueKind};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum FilterOperator {
    LessThan,
    LessThanOrEqual,
    Equal,
    NotEqual,
    GreaterThan,
    GreaterThanOrEqual,
    ArrayContains,
    ArrayContainsAny,
    In,
    NotIn,
}

impl FilterOperator {
    pub fn as_str(&self) -> &'static str {
        match self {
            FilterOperator::LessThan => "<",
            FilterOperator::LessThanOrEqual => "<=",
            FilterOperator::Equal => "==",
            FilterOperator::NotEqual => "!=",
            FilterOperator::GreaterThan => ">",
            FilterOperator::GreaterThanOrEqual => ">=",
            FilterOperator::ArrayContains => "array-contains",
            FilterOperator::ArrayContainsAny => "array-contains-any",
            FilterOperator::In => "in",
            FilterOperator::NotIn => "not-in",
        }
    }

    pub fn is_inequality(&self) -> bool {
        matches!(
            self,
            FilterOperator::LessThan
                | FilterOperator::LessThanOrEqual
                | FilterOperator::GreaterThan
                | FilterOperator::GreaterThanOrEqual
                | FilterOperator::NotEqual
                | FilterOperator::NotIn
        )
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct FieldFilter {
    field: FieldPath,
    operator: FilterOperator,
    value: FirestoreValue,
}

impl FieldFilter {
    pub fn new(field: FieldPath, operator: FilterOperator, value: FirestoreValue) -> Self {
        Self {
            field,
            operator,
            value,
        }
    }

    pub fn field(&self) -> &FieldPath {
        &self.field
    }

    pub fn operator(&self) -> FilterOperator {
        self.operator
    }

    pub fn value(&self) -> &FirestoreValue {
        &self.value
    }

    pub fn matches(&self, document: &MutableDocument) -> bool {
        let Some(value) = field_value(document, &self.field) else {
            return false;
        };
        evaluate(self.operator, &value, &self.value)
    }
}

fn evaluate(operator: FilterOperator, value: &FirestoreValue, operand: &FirestoreValue) -> bool {
    let same_type = value_util::type_order(value) == value_util::type_order(operand);
    let ordering = || value_util::compare(value, operand);
    match operator {
        FilterOperator::Equal => value_util::values_equal(value, operand),
        FilterOperator::NotEqual => {
            !matches!(value.kind(), ValueKind::Null) && !value_util::values_equal(value, operand)
        }
        FilterOperator::LessThan => same_type && ordering() == Ordering::Less,
        FilterOperator::LessThanOrEqual => same_type && ordering() != Ordering::Greater,
        FilterOperator::GreaterThan => same_type && ordering() == Ordering::Greater,
        FilterOperator::GreaterThanOrEqual => same_type && ordering() != Ordering::Less,
        FilterOperator::ArrayContains => value
            .as_array()
            .is_some_and(|array| array.contains(operand)),
        FilterOperator::ArrayContainsAny => match (value.as_array(), operand.as_array()) {
            (Some(array), Some(needles)) => needles.values().iter().any(|n| array.contains(n)),
            _ => false,
        },
        FilterOperator::In => operand.as_array().is_some_and(|values| values.contains(value)),
        FilterOperator::NotIn => {
            !matches!(value.kind(), ValueKind::Null)
                && operand.as_array().is_some_and(|values| !values.contains(value))
        }
    }
}

fn field_value(document: &MutableDocument, field: &FieldPath) -> Option<FirestoreValue> {
    if field.is_document_id() {
        return Some(key_value(document.key()));
    }
    document.field(field).cloned()
}

fn key_value(key: &DocumentKey) -> FirestoreValue {
    FirestoreValue::from_reference(key.path().canonical_string())
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum OrderDirection {
    Ascending,
    Descending,
}

#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct OrderBy {
    field: FieldPath,
    direction: OrderDirection,
}

impl OrderBy {
    pub fn new(field: FieldPath, direction: OrderDirection) -> Self {
        Self { field, direction }
    }

    pub fn field(&self) -> &FieldPath {
        &self.field
    }

    pub fn direction(&self) -> OrderDirection {
        self.direction
    }

    fn compare(&self, left: &MutableDocument, right: &MutableDocument) -> Ordering {
        let ordering = if self.field.is_document_id() {
            left.key().cmp(right.key())
        } else {
            match (left.field(&self.field), right.field(&self.field)) {
                (Some(l), Some(r)) => value_util::compare(l, r),
                (None, Some(_)) => Ordering::Less,
                (Some(_), None) => Ordering::Greater,
                (None, None) => Ordering::Equal,
            }
        };
        match self.direction {
            OrderDirection::Ascending => ordering,
            OrderDirection::Descending => ordering.reverse(),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum LimitType {
    First,
    Last,
}

/// Orders documents by a query's full (explicit plus implicit) ordering.
#[derive(Clone, Debug, PartialEq)]
pub struct DocumentComparator {
    order_by: Vec<OrderBy>,
}

impl DocumentComparator {
    pub fn by_key() -> Self {
        Self {
            order_by: vec![OrderBy::new(FieldPath::document_id(), OrderDirection::Ascending)],
        }
    }

    pub fn compare(&self, left: &MutableDocument, right: &MutableDocument) -> Ordering {
        for order in &self.order_by {
            let ordering = order.compare(left, right);
            if ordering != Ordering::Equal {
                return ordering;
            }
        }
        Ordering::Equal
    }
}

/// A listened query. Its canonical form also identifies the backend target.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Query {
    path: ResourcePath,
    collection_group: Option<String>,
    filters: Vec<FieldFilter>,
    explicit_order_by: Vec<OrderBy>,
    limit: Option<u32>,
    limit_type: LimitType,
}

impl Query {
    /// Query over a collection, or over a single document when `path` names one.
    pub fn new(path: ResourcePath) -> Self {
        Self {
            path,
            collection_group: None,
            filters: Vec::new(),
            explicit_order_by: Vec::new(),
            limit: None,
            limit_type: LimitType::First,
        }
    }

    pub fn at_path(path: ResourcePath) -> Self {
        Self::new(path)
    }

    pub fn for_document(key: &DocumentKey) -> Self {
        Self::new(key.path().clone())
    }

    pub fn collection_group(parent: ResourcePath, collection_id: impl Into<String>) -> Self {
        Self {
            collection_group: Some(collection_id.into()),
            ..Self::new(parent)
        }
    }

    pub fn with_filter(mut self, filter: FieldFilter) -> Self {
        self.filters.push(filter);
        self
    }

    pub fn with_order_by(mut self, order_by: OrderBy) -> Self {
        self.explicit_order_by.push(order_by);
        self
    }

    pub fn with_limit_to_first(mut self, limit: u32) -> Self {
        self.limit = Some(limit);
        self.limit_type = LimitType::First;
        self
    }

    pub fn with_limit_to_last(mut self, limit: u32) -> Self {
        self.limit = Some(limit);
        self.limit_type = LimitType::Last;
        self
    }

    pub fn path(&self) -> &ResourcePath {
        &self.path
    }

    pub fn collection_group_id(&self) -> Option<&str> {
        self.collection_group.as_deref()
    }

    pub fn filters(&self) -> &[FieldFilter] {
        &self.filters
    }

    pub fn explicit_order_by(&self) -> &[OrderBy] {
        &self.explicit_order_by
    }

    pub fn limit(&self) -> Option<u32> {
        self.limit
    }

    pub fn limit_type(&self) -> LimitType {
        self.limit_type
    }

    pub fn has_limit(&self) -> bool {
        self.limit.is_some()
    }

    pub fn is_document_query(&self) -> bool {
        DocumentKey::is_document_key(&self.path)
            && self.collection_group.is_none()
            && self.filters.is_empty()
    }

    pub fn is_collection_group_query(&self) -> bool {
        self.collection_group.is_some()
    }

    /// Explicit ordering, then the first inequality field, then the document key.
    pub fn order_by(&self) -> Vec<OrderBy> {
        let mut order_by = self.explicit_order_by.clone();
        if order_by.is_empty() {
            if let Some(filter) = self.filters.iter().find(|f| f.operator().is_inequality()) {
                if !filter.field().is_document_id() {
                    order_by.push(OrderBy::new(filter.field().clone(), OrderDirection::Ascending));
                }
            }
        }

        if !order_by.iter().any(|order| order.field().is_document_id()) {
            let direction = order_by
                .last()
                .map(OrderBy::direction)
                .unwrap_or(OrderDirection::Ascending);
            order_by.push(OrderBy::new(FieldPath::document_id(), direction));
        }
        order_by
    }

    pub fn comparator(&self) -> DocumentComparator {
        DocumentComparator {
            order_by: self.order_by(),
        }
    }

    pub fn compare_documents(&self, left: &MutableDocument, right: &MutableDocument) -> Ordering {
        self.comparator().compare(left, right)
    }

    pub fn matches(&self, document: &MutableDocument) -> bool {
        document.is_found_document()
            && self.matches_path(document.key())
            && self.matches_order_by(document)
            && self.filters.iter().all(|filter| filter.matches(document))
    }

    pub fn matches_path(&self, key: &DocumentKey) -> bool {
        let path = key.path();
        if let Some(group) = &self.collection_group {
            let collection = key.collection_path();
            collection.last_segment() == Some(group.as_str()) && self.path.is_prefix_of(path)
        } else if DocumentKey::is_document_key(&self.path) {
            &self.path == path
        } else {
            self.path.is_immediate_parent_of(path)
        }
    }

    fn matches_order_by(&self, document: &MutableDocument) -> bool {
        self.explicit_order_by
            .iter()
            .all(|order| order.field().is_document_id() || document.field(order.field()).is_some())
    }

    /// Stable identifier shared by equivalent queries.
    pub fn canonical_id(&self) -> String {
        let mut id = self.path.canonical_string();
        if let Some(group) = &self.collection_group {
            let _ = write!(id, "|cg:{group}");
        }
        id.push_str("|f:");
        for filter in &self.filters {
            let _ = write!(
                id,
                "{}{}{}",
                filter.field().canonical_string(),
                filter.operator().as_str(),
                value_util::canonical_id(filter.value())
            );
        }
        id.push_str("|ob:");
        for order in self.order_by() {
            let direction = match order.direction() {
                OrderDirection::Ascending => "asc",
                OrderDirection::Descending => "desc",
            };
            let _ = write!(id, "{}{}", order.field().canonical_string(), direction);
        }
        if let Some(limit) = self.limit {
            let kind = match self.limit_type {
                LimitType::First => 'f',
                LimitType::Last => 'l',
            };
            let _ = write!(id, "|l:{limit}|lt:{kind}");
        }
        id
    }
}
