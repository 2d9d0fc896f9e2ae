// Property tests for the canonical byte form, ETags and the identifier
// codec.

use proptest::prelude::*;
use serde_json::Value;

use titan_aas::{canonical_bytes, decode_id_from_b64url, encode_id_to_b64url, generate_etag};

/// Strategy for arbitrary JSON documents of bounded depth.
fn json_value() -> impl Strategy<Value = Value> {
    let leaf = prop_oneof![
        Just(Value::Null),
        any::<bool>().prop_map(Value::Bool),
        any::<i64>().prop_map(Value::from),
        // Finite doubles only: NaN/Inf are not representable in JSON.
        (-1.0e9f64..1.0e9).prop_map(Value::from),
        "[a-zA-Z0-9 _:/.-]{0,24}".prop_map(Value::from),
    ];
    leaf.prop_recursive(4, 48, 6, |inner| {
        prop_oneof![
            prop::collection::vec(inner.clone(), 0..6).prop_map(Value::Array),
            prop::collection::btree_map("[a-zA-Z][a-zA-Z0-9]{0,12}", inner, 0..6)
                .prop_map(|entries| Value::Object(entries.into_iter().collect())),
        ]
    })
}

proptest! {
    #[test]
    fn canonical_is_idempotent(value in json_value()) {
        let first = canonical_bytes(&value);
        let reparsed: Value = serde_json::from_slice(&first).unwrap();
        let second = canonical_bytes(&reparsed);
        prop_assert_eq!(first, second);
    }

    #[test]
    fn etag_ignores_key_order(entries in prop::collection::btree_map(
        "[a-z][a-z0-9]{0,8}", "[a-zA-Z0-9]{0,12}", 1..8))
    {
        let forward: Value = Value::Object(
            entries.iter().map(|(k, v)| (k.clone(), Value::from(v.clone()))).collect(),
        );
        let reversed: Value = Value::Object(
            entries.iter().rev().map(|(k, v)| (k.clone(), Value::from(v.clone()))).collect(),
        );
        prop_assert_eq!(
            generate_etag(&canonical_bytes(&forward)),
            generate_etag(&canonical_bytes(&reversed))
        );
    }

    #[test]
    fn etag_is_16_hex_chars(value in json_value()) {
        let etag = generate_etag(&canonical_bytes(&value));
        prop_assert_eq!(etag.len(), 16);
        prop_assert!(etag.chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn identifier_codec_roundtrips(identifier in "[ -~]{1,64}") {
        let token = encode_id_to_b64url(&identifier);
        prop_assert!(!token.contains('='));
        prop_assert_eq!(decode_id_from_b64url(&token).unwrap(), identifier);
    }
}

#[test]
fn whitespace_in_input_does_not_change_etag() {
    let compact: Value = serde_json::from_str(r#"{"a":1,"b":[true,null]}"#).unwrap();
    let spaced: Value =
        serde_json::from_str("{\n  \"b\": [ true, null ],\n  \"a\": 1\n}").unwrap();
    assert_eq!(
        generate_etag(&canonical_bytes(&compact)),
        generate_etag(&canonical_bytes(&spaced))
    );
}

#[test]
fn decoder_rejects_non_alphabet_tokens() {
    for bad in ["", "ab=", "a+b", "a/b", "a.b", "a b"] {
        assert!(decode_id_from_b64url(bad).is_err(), "accepted {bad:?}");
    }
}
