use std::cmp::Ordering;

use crate::firestore::value::{FirestoreValue, MapValue, ValueKind};

/// Position of a value's type in the cross-type sort order used by queries.
pub fn type_order(value: &FirestoreValue) -> u8 {
    match value.kind() {
        ValueKind::Null => 0,
        ValueKind::Boolean(_) => 1,
        ValueKind::Integer(_) | ValueKind::Double(_) => 2,
        ValueKind::Timestamp(_) => 3,
        ValueKind::ServerTimestamp(_) => 4,
        ValueKind::String(_) => 5,
        ValueKind::Bytes(_) => 6,
        ValueKind::Reference(_) => 7,
        ValueKind::GeoPoint(_) => 8,
        ValueKind::Array(_) => 9,
        ValueKind::Map(_) => 10,
    }
}

/// Total order over values: first by type, then by value within the type.
///
/// Integers and doubles share one numeric type; NaN sorts before every other number.
pub fn compare(left: &FirestoreValue, right: &FirestoreValue) -> Ordering {
    let by_type = type_order(left).cmp(&type_order(right));
    if by_type != Ordering::Equal {
        return by_type;
    }

    match (left.kind(), right.kind()) {
        (ValueKind::Null, ValueKind::Null) => Ordering::Equal,
        (ValueKind::Boolean(a), ValueKind::Boolean(b)) => a.cmp(b),
        (ValueKind::Integer(a), ValueKind::Integer(b)) => a.cmp(b),
        (ValueKind::Integer(a), ValueKind::Double(b)) => compare_mixed(*a, *b),
        (ValueKind::Double(a), ValueKind::Integer(b)) => compare_mixed(*b, *a).reverse(),
        (ValueKind::Double(a), ValueKind::Double(b)) => compare_doubles(*a, *b),
        (ValueKind::Timestamp(a), ValueKind::Timestamp(b)) => a.cmp(b),
        (ValueKind::ServerTimestamp(a), ValueKind::ServerTimestamp(b)) => {
            a.local_write_time().cmp(&b.local_write_time())
        }
        (ValueKind::String(a), ValueKind::String(b)) => a.cmp(b),
        (ValueKind::Bytes(a), ValueKind::Bytes(b)) => a.cmp(b),
        (ValueKind::Reference(a), ValueKind::Reference(b)) => compare_references(a, b),
        (ValueKind::GeoPoint(a), ValueKind::GeoPoint(b)) => a.compare(b),
        (ValueKind::Array(a), ValueKind::Array(b)) => {
            for (l, r) in a.values().iter().zip(b.values()) {
                let ordering = compare(l, r);
                if ordering != Ordering::Equal {
                    return ordering;
                }
            }
            a.values().len().cmp(&b.values().len())
        }
        (ValueKind::Map(a), ValueKind::Map(b)) => compare_maps(a, b),
        _ => Ordering::Equal,
    }
}

/// Firestore equality: numerically equal integers and doubles are equal, NaN equals NaN.
pub fn values_equal(left: &FirestoreValue, right: &FirestoreValue) -> bool {
    compare(left, right) == Ordering::Equal
}

fn compare_doubles(a: f64, b: f64) -> Ordering {
    match (a.is_nan(), b.is_nan()) {
        (true, true) => Ordering::Equal,
        (true, false) => Ordering::Less,
        (false, true) => Ordering::Greater,
        (false, false) => a.partial_cmp(&b).unwrap_or(Ordering::Equal),
    }
}

fn compare_mixed(integer: i64, double: f64) -> Ordering {
    if double.is_nan() {
        return Ordering::Greater;
    }
    compare_doubles(integer as f64, double)
}

fn compare_references(left: &str, right: &str) -> Ordering {
    let left_segments = left.split('/');
    let right_segments = right.split('/');
    left_segments.cmp(right_segments)
}

fn compare_maps(left: &MapValue, right: &MapValue) -> Ordering {
    let mut left_iter = left.fields().iter();
    let mut right_iter = right.fields().iter();
    loop {
        match (left_iter.next(), right_iter.next()) {
            (None, None) => return Ordering::Equal,
            (None, Some(_)) => return Ordering::Less,
            (Some(_), None) => return Ordering::Greater,
            (Some((lk, lv)), Some((rk, rv))) => {
                let ordering = lk.cmp(rk).then_with(|| compare(lv, rv));
                if ordering != Ordering::Equal {
                    return ordering;
                }
            }
        }
    }
}

/// Stable textual form of a value, used to build query canonical ids.
pub fn canonical_id(value: &FirestoreValue) -> String {
    let mut out = String::new();
    write_canonical_id(value, &mut out);
    out
}

fn write_canonical_id(value: &FirestoreValue, out: &mut String) {
    match value.kind() {
        ValueKind::Null => out.push_str("null"),
        ValueKind::Boolean(flag) => out.push_str(if *flag { "true" } else { "false" }),
        ValueKind::Integer(number) => out.push_str(&number.to_string()),
        ValueKind::Double(number) => out.push_str(&format!("{number:?}")),
        ValueKind::Timestamp(ts) => {
            out.push_str(&format!("time({},{})", ts.seconds, ts.nanos));
        }
        ValueKind::ServerTimestamp(pending) => {
            let ts = pending.local_write_time();
            out.push_str(&format!("serverTimestamp({},{})", ts.seconds, ts.nanos));
        }
        ValueKind::String(text) => out.push_str(text),
        ValueKind::Bytes(bytes) => out.push_str(&bytes.to_base64()),
        ValueKind::Reference(path) => out.push_str(path),
        ValueKind::GeoPoint(point) => {
            out.push_str(&format!("geo({},{})", point.latitude(), point.longitude()));
        }
        ValueKind::Array(array) => {
            out.push('[');
            for (index, element) in array.values().iter().enumerate() {
                if index > 0 {
                    out.push(',');
                }
                write_canonical_id(element, out);
            }
            out.push(']');
        }
        ValueKind::Map(map) => {
            out.push('{');
            for (index, (key, field)) in map.fields().iter().enumerate() {
                if index > 0 {
                    out.push(',');
                }
                out.push_str(key);
                out.push(':');
                write_canonical_id(field, out);
            }
            out.push('}');
        }
    }
}
