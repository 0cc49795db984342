use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::firestore::model::{GeoPoint, Timestamp};
use crate::firestore::value::{ArrayValue, BytesValue, MapValue, PendingServerTimestamp};

/// A single typed field value stored in a document.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct FirestoreValue {
    kind: ValueKind,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ValueKind {
    Null,
    Boolean(bool),
    Integer(i64),
    Double(#[serde(with = "double_text")] f64),
    Timestamp(Timestamp),
    /// Written locally by a server-timestamp transform, not yet committed.
    ServerTimestamp(PendingServerTimestamp),
    String(String),
    Bytes(BytesValue),
    Reference(String),
    GeoPoint(GeoPoint),
    Array(ArrayValue),
    Map(MapValue),
}

impl FirestoreValue {
    pub fn null() -> Self {
        ValueKind::Null.into()
    }

    pub fn from_bool(value: bool) -> Self {
        ValueKind::Boolean(value).into()
    }

    pub fn from_integer(value: i64) -> Self {
        ValueKind::Integer(value).into()
    }

    pub fn from_double(value: f64) -> Self {
        ValueKind::Double(value).into()
    }

    pub fn from_timestamp(value: Timestamp) -> Self {
        ValueKind::Timestamp(value).into()
    }

    pub fn server_timestamp(local_write_time: Timestamp, previous: Option<&FirestoreValue>) -> Self {
        ValueKind::ServerTimestamp(PendingServerTimestamp::new(local_write_time, previous)).into()
    }

    pub fn is_server_timestamp(&self) -> bool {
        matches!(self.kind, ValueKind::ServerTimestamp(_))
    }

    pub fn from_string(value: impl Into<String>) -> Self {
        ValueKind::String(value.into()).into()
    }

    pub fn from_bytes(value: BytesValue) -> Self {
        ValueKind::Bytes(value).into()
    }

    pub fn from_reference(path: impl Into<String>) -> Self {
        ValueKind::Reference(path.into()).into()
    }

    pub fn from_geo_point(value: GeoPoint) -> Self {
        ValueKind::GeoPoint(value).into()
    }

    pub fn from_array(values: Vec<FirestoreValue>) -> Self {
        ValueKind::Array(ArrayValue::new(values)).into()
    }

    pub fn from_map(map: BTreeMap<String, FirestoreValue>) -> Self {
        ValueKind::Map(MapValue::new(map)).into()
    }

    pub fn kind(&self) -> &ValueKind {
        &self.kind
    }

    pub fn is_number(&self) -> bool {
        matches!(self.kind, ValueKind::Integer(_) | ValueKind::Double(_))
    }

    pub fn as_map(&self) -> Option<&MapValue> {
        match &self.kind {
            ValueKind::Map(map) => Some(map),
            _ => None,
        }
    }

    pub fn as_array(&self) -> Option<&ArrayValue> {
        match &self.kind {
            ValueKind::Array(array) => Some(array),
            _ => None,
        }
    }
}

impl From<ValueKind> for FirestoreValue {
    fn from(kind: ValueKind) -> Self {
        Self { kind }
    }
}

/// Non-finite doubles are stored as the proto3 JSON strings
/// `"NaN"`, `"Infinity"` and `"-Infinity"`.
mod double_text {
    use serde::de::Error;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &f64, serializer: S) -> Result<S::Ok, S::Error> {
        if value.is_nan() {
            serializer.serialize_str("NaN")
        } else if value.is_infinite() && *value > 0.0 {
            serializer.serialize_str("Infinity")
        } else if value.is_infinite() {
            serializer.serialize_str("-Infinity")
        } else {
            serializer.serialize_f64(*value)
        }
    }

    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Encoded {
        Number(f64),
        Text(String),
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<f64, D::Error> {
        match Encoded::deserialize(deserializer)? {
            Encoded::Number(value) => Ok(value),
            Encoded::Text(text) => match text.as_str() {
                "NaN" => Ok(f64::NAN),
                "Infinity" => Ok(f64::INFINITY),
                "-Infinity" => Ok(f64::NEG_INFINITY),
                other => Err(D::Error::custom(format!("invalid double `{other}`"))),
            },
        }
    }
}
