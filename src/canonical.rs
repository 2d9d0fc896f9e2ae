// Canonical byte form and content-hash ETags.
//
// Every stored entity is reduced to one deterministic JSON encoding: keys
// sorted, nulls elided, no insignificant whitespace, external camelCase
// field names. The ETag is a truncated SHA-256 over exactly those bytes,
// so two machines holding the same document always agree on the validator.

use serde::Serialize;
use serde_json::Value;
use sha2::{Digest, Sha256};

use crate::error::Result;

/// Hex digest length of an ETag. Truncating SHA-256 to 64 bits keeps the
/// validator short enough for headers while staying collision-safe for a
/// per-identifier comparison.
const ETAG_HEX_LEN: usize = 16;

/// Canonical JSON bytes of an arbitrary document value.
///
/// `serde_json::Map` is BTreeMap-backed, so object keys come out sorted;
/// the only extra normalization needed is recursive null elision.
pub fn canonical_bytes(value: &Value) -> Vec<u8> {
    let stripped = strip_nulls(value.clone());
    serde_json::to_vec(&stripped).expect("canonical value serializes")
}

/// Canonical bytes of a typed model. The model's serde attributes produce
/// the external camelCase aliases; routing through `Value` sorts the keys.
pub fn canonical_bytes_for<T: Serialize>(model: &T) -> Result<Vec<u8>> {
    let value = serde_json::to_value(model)?;
    Ok(canonical_bytes(&value))
}

/// Content-hash ETag over canonical bytes.
pub fn generate_etag(doc_bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(doc_bytes);
    let digest = hex::encode(hasher.finalize());
    digest[..ETAG_HEX_LEN].to_string()
}

/// Remove null members everywhere in the tree. Array slots are preserved;
/// only object members are elided.
fn strip_nulls(value: Value) -> Value {
    match value {
        Value::Object(map) => Value::Object(
            map.into_iter()
                .filter(|(_, v)| !v.is_null())
                .map(|(k, v)| (k, strip_nulls(v)))
                .collect(),
        ),
        Value::Array(items) => Value::Array(items.into_iter().map(strip_nulls).collect()),
        other => other,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_key_order_is_irrelevant() {
        let a = json!({"b": 1, "a": 2, "nested": {"y": true, "x": false}});
        let b = json!({"a": 2, "nested": {"x": false, "y": true}, "b": 1});
        assert_eq!(canonical_bytes(&a), canonical_bytes(&b));
        assert_eq!(generate_etag(&canonical_bytes(&a)), generate_etag(&canonical_bytes(&b)));
    }

    #[test]
    fn test_nulls_elided() {
        let v = json!({"id": "x", "idShort": null, "items": [{"a": null, "b": 1}]});
        let bytes = canonical_bytes(&v);
        let text = String::from_utf8(bytes).unwrap();
        assert_eq!(text, r#"{"id":"x","items":[{"b":1}]}"#);
    }

    #[test]
    fn test_no_whitespace() {
        let v = json!({"a": [1, 2, 3], "b": "text"});
        let text = String::from_utf8(canonical_bytes(&v)).unwrap();
        assert!(!text.contains(' '));
    }

    #[test]
    fn test_etag_is_short_hex() {
        let etag = generate_etag(b"{}");
        assert_eq!(etag.len(), 16);
        assert!(etag.chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn test_idempotent_reparse() {
        let v = json!({"z": 1.5, "a": {"k": [true, null]}, "gone": null});
        let bytes = canonical_bytes(&v);
        let reparsed: Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(canonical_bytes(&reparsed), bytes);
    }
}
