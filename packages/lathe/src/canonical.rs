//! Canonical JSON serialization.
//!
//! One canonical byte form is used project-wide: idempotency fingerprints,
//! audit chain hashes and published task envelopes all hash or compare the
//! output of [`canonical_string`]. Rules:
//!
//! - object keys sorted lexicographically (byte order)
//! - compact separators, no non-significant whitespace
//! - floats collapsed to integers when lossless (`10.0` -> `10`)
//! - booleans lowercase, strings JSON-escaped
//!
//! Timestamps must already be RFC3339 UTC strings when they enter a payload;
//! the writer does not reinterpret strings.

use serde_json::Value;
use sha2::{Digest, Sha256};

use crate::error::EngineError;
use crate::job::{JobKind, OwnerId};

/// Serialize a JSON value to its canonical string form.
pub fn canonical_string(value: &Value) -> String {
    let mut out = String::new();
    write_value(&mut out, value);
    out
}

/// Canonical form as bytes, the input to every hash in the system.
pub fn canonical_bytes(value: &Value) -> Vec<u8> {
    canonical_string(value).into_bytes()
}

/// Serialize a `Serialize` type through its JSON value to canonical form.
pub fn to_canonical_string<T: serde::Serialize>(value: &T) -> Result<String, EngineError> {
    let json = serde_json::to_value(value).map_err(|e| EngineError::Validation {
        message: format!("value is not canonicalizable: {e}"),
    })?;
    Ok(canonical_string(&json))
}

/// Request fingerprint: SHA-256 over `canonical(params) || kind || owner`.
///
/// The owner is folded in as its decimal representation so two tenants
/// submitting identical params never collide.
pub fn fingerprint(params: &Value, kind: JobKind, owner: OwnerId) -> String {
    let mut hasher = Sha256::new();
    hasher.update(canonical_string(params).as_bytes());
    hasher.update(kind.as_str().as_bytes());
    hasher.update(owner.to_string().as_bytes());
    hex::encode(hasher.finalize())
}

/// SHA-256 of the canonical form, hex encoded.
pub fn canonical_sha256(value: &Value) -> String {
    let mut hasher = Sha256::new();
    hasher.update(canonical_string(value).as_bytes());
    hex::encode(hasher.finalize())
}

fn write_value(out: &mut String, value: &Value) {
    match value {
        Value::Null => out.push_str("null"),
        Value::Bool(true) => out.push_str("true"),
        Value::Bool(false) => out.push_str("false"),
        Value::Number(n) => write_number(out, n),
        Value::String(s) => write_string(out, s),
        Value::Array(items) => {
            out.push('[');
            for (i, item) in items.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                write_value(out, item);
            }
            out.push(']');
        }
        Value::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            out.push('{');
            for (i, key) in keys.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                write_string(out, key);
                out.push(':');
                write_value(out, &map[key.as_str()]);
            }
            out.push('}');
        }
    }
}

fn write_number(out: &mut String, n: &serde_json::Number) {
    if let Some(i) = n.as_i64() {
        out.push_str(&i.to_string());
        return;
    }
    if let Some(u) = n.as_u64() {
        out.push_str(&u.to_string());
        return;
    }
    let f = n.as_f64().unwrap_or(0.0);
    // Integral floats collapse to their integer form when the conversion is
    // lossless (inside the f64 exact-integer window).
    if f.is_finite() && f.fract() == 0.0 && f.abs() < 9_007_199_254_740_992.0 {
        out.push_str(&(f as i64).to_string());
    } else {
        // Rust's shortest round-trip float formatting: no trailing zeros.
        out.push_str(&f.to_string());
    }
}

fn write_string(out: &mut String, s: &str) {
    // serde_json escaping is deterministic; reuse it for strings and keys.
    out.push_str(&serde_json::to_string(s).expect("string serialization is infallible"));
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn keys_are_sorted() {
        let a = json!({"b": 2, "a": 1, "c": 3});
        let b = json!({"c": 3, "a": 1, "b": 2});
        assert_eq!(canonical_string(&a), canonical_string(&b));
        assert_eq!(canonical_string(&a), r#"{"a":1,"b":2,"c":3}"#);
    }

    #[test]
    fn integral_floats_collapse() {
        let value = json!({"value": 10.0, "int_float": 5.0, "frac": 10.5});
        let canonical = canonical_string(&value);
        assert!(canonical.contains(r#""value":10"#));
        assert!(canonical.contains(r#""int_float":5"#));
        assert!(canonical.contains(r#""frac":10.5"#));
        assert!(!canonical.contains("10.0"));
    }

    #[test]
    fn nested_structures_are_canonical() {
        let nested = json!({
            "outer": {
                "inner": [3, 1, 2],
                "data": {"z": 26, "a": 1}
            }
        });
        assert_eq!(
            canonical_string(&nested),
            r#"{"outer":{"data":{"a":1,"z":26},"inner":[3,1,2]}}"#
        );
    }

    #[test]
    fn no_insignificant_whitespace() {
        let value = json!({"a": [1, 2], "b": {"c": true}});
        let canonical = canonical_string(&value);
        assert!(!canonical.contains(' '));
        assert!(!canonical.contains('\n'));
    }

    #[test]
    fn escapes_are_preserved() {
        let value = json!({"quote": "he said \"hi\"", "newline": "a\nb", "tab": "a\tb"});
        let canonical = canonical_string(&value);
        assert!(canonical.contains(r#""quote":"he said \"hi\"""#));
        assert!(canonical.contains(r#""newline":"a\nb""#));
        assert!(canonical.contains(r#""tab":"a\tb""#));
    }

    #[test]
    fn unicode_keys_sort_by_byte_order() {
        let value = json!({"é": 1, "z": 2, "a": 3});
        // "a" < "z" < "é" in UTF-8 byte order.
        assert_eq!(canonical_string(&value), r#"{"a":3,"z":2,"é":1}"#);
    }

    #[test]
    fn float_edge_cases_round_trip_shortest() {
        let value = json!({"tiny": 0.1, "big": 1e300});
        let canonical = canonical_string(&value);
        assert!(canonical.contains(r#""tiny":0.1"#));
        assert!(!canonical.contains("0.10"));
    }

    #[test]
    fn fingerprint_differs_by_owner_and_kind() {
        let params = json!({"l": 10, "w": 5});
        let base = fingerprint(&params, JobKind::Model, 42);
        assert_eq!(base.len(), 64);
        assert_ne!(base, fingerprint(&params, JobKind::Model, 43));
        assert_ne!(base, fingerprint(&params, JobKind::Cam, 42));
        assert_eq!(base, fingerprint(&json!({"w": 5, "l": 10}), JobKind::Model, 42));
    }

    #[test]
    fn fingerprint_ignores_formatting_but_not_values() {
        let a = json!({"l": 10.0, "w": 5});
        let b = json!({"l": 10, "w": 5});
        let c = json!({"l": 11, "w": 5});
        assert_eq!(
            fingerprint(&a, JobKind::Model, 42),
            fingerprint(&b, JobKind::Model, 42)
        );
        assert_ne!(
            fingerprint(&b, JobKind::Model, 42),
            fingerprint(&c, JobKind::Model, 42)
        );
    }
}
