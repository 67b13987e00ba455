//! Canonical JSON and hashing.
//!
//! Every hash in the system is SHA-256 over canonical JSON: keys sorted
//! lexically, `","`/`":"` separators with no whitespace, UTF-8 bytes, and
//! `-0.0` normalized to `0.0`. `serde_json`'s default object map is a
//! `BTreeMap`, which gives sorted keys for free; normalization handles the
//! float edge case.

use serde_json::Value;
use sha2::{Digest, Sha256};

/// Hash of the empty chain: `sha256:` + 64 zeros.
pub const GENESIS_HASH: &str =
    "sha256:0000000000000000000000000000000000000000000000000000000000000000";

/// Serialize a JSON value canonically.
pub fn canonical_json(value: &Value) -> String {
    serde_json::to_string(&normalize(value.clone())).expect("JSON value serializes")
}

/// SHA-256 of arbitrary bytes, as a bare hex string.
pub fn sha256_hex(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    hex::encode(hasher.finalize())
}

/// `"sha256:" + hex(SHA-256(canonical_json(value)))`.
pub fn hash_value(value: &Value) -> String {
    format!("sha256:{}", sha256_hex(canonical_json(value).as_bytes()))
}

/// Hash a record object with its `event_hash` key removed — the form used
/// by both ledgers.
pub fn hash_without_event_hash(value: &Value) -> String {
    let mut v = value.clone();
    if let Some(obj) = v.as_object_mut() {
        obj.remove("event_hash");
    }
    hash_value(&v)
}

fn normalize(value: Value) -> Value {
    match value {
        Value::Number(n) => {
            // -0.0 and 0.0 must hash identically.
            match n.as_f64() {
                Some(f) if f == 0.0 && f.is_sign_negative() => {
                    Value::Number(serde_json::Number::from_f64(0.0).expect("0.0 is finite"))
                }
                _ => Value::Number(n),
            }
        }
        Value::Array(items) => Value::Array(items.into_iter().map(normalize).collect()),
        Value::Object(map) => {
            Value::Object(map.into_iter().map(|(k, v)| (k, normalize(v))).collect())
        }
        other => other,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn keys_are_sorted_and_compact() {
        let v = json!({"b": 1, "a": {"z": true, "m": [1, 2]}});
        assert_eq!(canonical_json(&v), r#"{"a":{"m":[1,2],"z":true},"b":1}"#);
    }

    #[test]
    fn negative_zero_normalizes() {
        let v = json!({"x": -0.0});
        assert_eq!(canonical_json(&v), r#"{"x":0.0}"#);
        assert_eq!(canonical_json(&json!({"x": 0.0})), canonical_json(&v));
    }

    #[test]
    fn canonical_form_is_a_fixed_point() {
        let v = json!({
            "seq": 3,
            "nested": {"list": ["a", "b"], "f": 1.5},
            "empty": {},
            "s": "text with \"quotes\""
        });
        let once = canonical_json(&v);
        let reparsed: Value = serde_json::from_str(&once).unwrap();
        assert_eq!(canonical_json(&reparsed), once);
    }

    #[test]
    fn genesis_hash_shape() {
        assert!(GENESIS_HASH.starts_with("sha256:"));
        assert_eq!(GENESIS_HASH.len(), "sha256:".len() + 64);
        assert!(GENESIS_HASH["sha256:".len()..].chars().all(|c| c == '0'));
    }

    #[test]
    fn hash_excludes_event_hash_field() {
        let with = json!({"a": 1, "event_hash": "sha256:abc"});
        let without = json!({"a": 1});
        assert_eq!(hash_without_event_hash(&with), hash_value(&without));
    }

    #[test]
    fn known_digest() {
        // sha256("") is the well-known empty digest.
        assert_eq!(
            sha256_hex(b""),
            "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855"
        );
    }
}
