//! Canonical JSON encoding and SHA-256 digests for layer identities.
//!
//! Identity digests must not depend on field order or float formatting, so
//! values are normalized before hashing:
//! - object keys sorted by UTF-16 code units (RFC 8785 §3.2.3)
//! - integer-valued floats written as integers; NaN/Infinity rejected

use serde_json::{Number, Value};
use sha2::{Digest, Sha256};

use crate::domain::error::{DomainError, Result};

/// Append the canonical encoding of `value` to `out`.
///
/// Objects are written by hand: `serde_json::Map` iterates in byte order,
/// which differs from UTF-16 order for keys outside the BMP.
fn write_canonical(value: &Value, out: &mut String) -> Result<()> {
    match value {
        Value::Object(map) => {
            let mut entries: Vec<(&String, &Value)> = map.iter().collect();
            entries.sort_by(|(a, _), (b, _)| a.encode_utf16().cmp(b.encode_utf16()));
            out.push('{');
            for (i, (key, child)) in entries.into_iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                out.push_str(&serde_json::to_string(key)?);
                out.push(':');
                write_canonical(child, out)?;
            }
            out.push('}');
        }
        Value::Array(items) => {
            out.push('[');
            for (i, item) in items.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                write_canonical(item, out)?;
            }
            out.push(']');
        }
        Value::Number(n) => out.push_str(&canonical_number(n)?.to_string()),
        other => out.push_str(&serde_json::to_string(other)?),
    }
    Ok(())
}

fn canonical_number(n: &Number) -> Result<Number> {
    if n.is_i64() || n.is_u64() {
        return Ok(n.clone());
    }
    match n.as_f64() {
        Some(f) if !f.is_finite() => Err(DomainError::InvalidCanonicalValue(format!(
            "non-finite number {f} in layer identity"
        ))),
        Some(f) if f.fract() == 0.0 && f >= i64::MIN as f64 && f <= i64::MAX as f64 => {
            Ok(Number::from(f as i64))
        }
        _ => Ok(n.clone()),
    }
}

/// Compact JSON of `value` with sorted keys and normalized numbers.
pub fn canonical_json(value: &Value) -> Result<String> {
    let mut out = String::new();
    write_canonical(value, &mut out)?;
    Ok(out)
}

/// SHA-256 hex digest of `value`'s canonical JSON encoding.
pub fn compute_digest(value: &Value) -> Result<String> {
    let canonical = canonical_json(value)?;
    Ok(sha256_hex(canonical.as_bytes()))
}

/// SHA-256 hex digest of raw bytes (patch text, dependency lists).
pub fn sha256_hex(data: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(data);
    hex::encode(hasher.finalize())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_canonical_json_field_order_invariant() {
        let a = serde_json::json!({"repo": "x/y", "commit": "abc", "nested": {"z": 1, "a": 2}});
        let b = serde_json::json!({"nested": {"a": 2, "z": 1}, "commit": "abc", "repo": "x/y"});
        assert_eq!(canonical_json(&a).unwrap(), canonical_json(&b).unwrap());
    }

    #[test]
    fn test_canonical_json_integer_float() {
        let input = serde_json::json!({ "value": 1.0 });
        assert_eq!(canonical_json(&input).unwrap(), r#"{"value":1}"#);
    }

    #[test]
    fn test_canonical_json_array_order_preserved() {
        let a = serde_json::json!({"deps": ["a", "b"]});
        let b = serde_json::json!({"deps": ["b", "a"]});
        assert_ne!(canonical_json(&a).unwrap(), canonical_json(&b).unwrap());
    }

    #[test]
    fn test_canonical_json_sorts_keys_by_utf16() {
        // U+1F600 is a surrogate pair (0xD83D..) in UTF-16, so it sorts before U+FF61.
        let value = serde_json::json!({"\u{1F600}": 1, "\u{FF61}": 2});
        assert_eq!(canonical_json(&value).unwrap(), "{\"\u{1F600}\":1,\"\u{FF61}\":2}");
    }

    #[test]
    fn test_compute_digest_is_hex_sha256() {
        let digest = compute_digest(&serde_json::json!({"kind": "base"})).unwrap();
        assert_eq!(digest.len(), 64);
        assert!(digest.chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn test_sha256_hex_known_value() {
        assert_eq!(
            sha256_hex(b""),
            "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855"
        );
    }
}
