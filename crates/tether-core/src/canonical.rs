//! Canonical JSON encoding.
//!
//! History entries are compared byte-for-byte during admission to enforce
//! the append-only invariant. Two serializations of the same entry may
//! differ in object key order, so comparisons go through a canonical form:
//! objects with keys sorted recursively, no insignificant whitespace.

use serde::Serialize;
use serde_json::Value;

use crate::error::{Error, Result};

/// Serializes a value to canonical JSON (recursively sorted object keys).
///
/// # Errors
///
/// Returns `ShapeInvalid` if the value cannot be represented as JSON.
pub fn to_canonical_json<T: Serialize>(value: &T) -> Result<String> {
    let value = serde_json::to_value(value)
        .map_err(|e| Error::shape("CanonicalEncoding", e.to_string()))?;
    let mut out = String::new();
    write_canonical(&value, &mut out);
    Ok(out)
}

/// Returns true when two values are equal under canonical JSON encoding.
///
/// # Errors
///
/// Returns `ShapeInvalid` if either value cannot be represented as JSON.
pub fn canonically_equal<A: Serialize, B: Serialize>(a: &A, b: &B) -> Result<bool> {
    Ok(to_canonical_json(a)? == to_canonical_json(b)?)
}

fn write_canonical(value: &Value, out: &mut String) {
    match value {
        Value::Object(map) => {
            out.push('{');
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort_unstable();
            for (i, key) in keys.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                // Object keys are plain strings; serde_json escapes them.
                out.push_str(&serde_json::to_string(key).unwrap_or_default());
                out.push(':');
                write_canonical(&map[*key], out);
            }
            out.push('}');
        }
        Value::Array(items) => {
            out.push('[');
            for (i, item) in items.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                write_canonical(item, out);
            }
            out.push(']');
        }
        scalar => out.push_str(&scalar.to_string()),
    }
}
