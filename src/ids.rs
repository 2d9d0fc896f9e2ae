// Identifier codec: AAS identifiers travel in URL paths as Base64URL
// without padding. The raw identifier stays canonical in storage; the
// encoded form is the indexed lookup key.

use base64::{engine::general_purpose::URL_SAFE_NO_PAD as B64URL, Engine as _};

use crate::error::{Result, TitanError};

/// Encode an identifier for use as a URL path token.
pub fn encode_id_to_b64url(identifier: &str) -> String {
    B64URL.encode(identifier.as_bytes())
}

/// Decode a URL path token back to the raw identifier.
///
/// Rejects empty tokens, characters outside the Base64URL alphabet, and
/// tokens that do not decode to UTF-8.
pub fn decode_id_from_b64url(token: &str) -> Result<String> {
    if token.is_empty() {
        return Err(TitanError::InvalidIdentifier("empty token".to_string()));
    }
    if !token
        .bytes()
        .all(|b| b.is_ascii_alphanumeric() || b == b'-' || b == b'_')
    {
        return Err(TitanError::InvalidIdentifier(token.to_string()));
    }
    let raw = B64URL
        .decode(token)
        .map_err(|_| TitanError::InvalidIdentifier(token.to_string()))?;
    String::from_utf8(raw).map_err(|_| TitanError::InvalidIdentifier(token.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_roundtrip() {
        let id = "urn:example:aas:1";
        let token = encode_id_to_b64url(id);
        assert!(!token.contains('='));
        assert!(!token.contains('+'));
        assert!(!token.contains('/'));
        assert_eq!(decode_id_from_b64url(&token).unwrap(), id);
    }

    #[test]
    fn test_known_encoding() {
        // The scenario token from the conformance suite.
        assert_eq!(encode_id_to_b64url("urn:x:aas:1"), "dXJuOng6YWFzOjE");
        assert_eq!(decode_id_from_b64url("dXJuOng6YWFzOjE").unwrap(), "urn:x:aas:1");
    }

    #[test]
    fn test_rejects_bad_tokens() {
        assert!(decode_id_from_b64url("").is_err());
        assert!(decode_id_from_b64url("abc=").is_err());
        assert!(decode_id_from_b64url("a+b").is_err());
        assert!(decode_id_from_b64url("a/b").is_err());
        assert!(decode_id_from_b64url("a b").is_err());
    }

    #[test]
    fn test_rejects_invalid_length() {
        // Single base64url char cannot form a byte.
        assert!(decode_id_from_b64url("A").is_err());
    }
}
