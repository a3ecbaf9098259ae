//! Deterministic CBOR (RFC 8949 CDE) encoding helpers.
//!
//! Every byte string that gets signed or hashed — COSE payloads and
//! Sig_structures, revocation records, the stable op encoding — goes through
//! `to_canonical_bytes`, which sorts map entries by their encoded key bytes
//! before serializing. `ciborium` already emits definite lengths and
//! minimal-width integers, so key ordering is the only normalization needed.
//!
//! Claim maps may use integer or string keys; readers check both, with
//! integer keys taking precedence.

use ciborium::value::Value;

use crate::error::AuthError;

/// Encode a value deterministically (nested maps sorted).
pub fn to_canonical_bytes(value: &Value) -> Result<Vec<u8>, AuthError> {
    let canonical = canonicalize(value)?;
    let mut buf = Vec::new();
    ciborium::ser::into_writer(&canonical, &mut buf)
        .map_err(|e| AuthError::Malformed(format!("cbor encode: {e}")))?;
    Ok(buf)
}

/// Decode a single CBOR value from `bytes`.
pub fn from_slice(bytes: &[u8]) -> Result<Value, AuthError> {
    ciborium::de::from_reader(bytes).map_err(|e| AuthError::Malformed(format!("cbor decode: {e}")))
}

fn encode_plain(value: &Value) -> Result<Vec<u8>, AuthError> {
    let mut buf = Vec::new();
    ciborium::ser::into_writer(value, &mut buf)
        .map_err(|e| AuthError::Malformed(format!("cbor encode: {e}")))?;
    Ok(buf)
}

/// Recursively sort map entries by their canonically encoded key bytes.
/// Duplicate keys are rejected.
fn canonicalize(value: &Value) -> Result<Value, AuthError> {
    match value {
        Value::Array(items) => {
            let mut out = Vec::with_capacity(items.len());
            for item in items {
                out.push(canonicalize(item)?);
            }
            Ok(Value::Array(out))
        }
        Value::Map(entries) => {
            let mut keyed: Vec<(Vec<u8>, Value, Value)> = Vec::with_capacity(entries.len());
            for (k, v) in entries {
                let k = canonicalize(k)?;
                let v = canonicalize(v)?;
                keyed.push((encode_plain(&k)?, k, v));
            }
            keyed.sort_by(|a, b| a.0.cmp(&b.0));
            for pair in keyed.windows(2) {
                if pair[0].0 == pair[1].0 {
                    return Err(AuthError::Malformed("duplicate map key".into()));
                }
            }
            Ok(Value::Map(keyed.into_iter().map(|(_, k, v)| (k, v)).collect()))
        }
        Value::Tag(tag, inner) => Ok(Value::Tag(*tag, Box::new(canonicalize(inner)?))),
        other => Ok(other.clone()),
    }
}

// ── Value constructors ─────────────────────────────────────────────────────

pub fn u64_value(n: u64) -> Value {
    Value::Integer(n.into())
}

pub fn i64_value(n: i64) -> Value {
    Value::Integer(n.into())
}

pub fn text(s: impl Into<String>) -> Value {
    Value::Text(s.into())
}

pub fn bytes(b: impl Into<Vec<u8>>) -> Value {
    Value::Bytes(b.into())
}

// ── Value accessors ────────────────────────────────────────────────────────

pub fn as_u64(value: &Value) -> Option<u64> {
    value.as_integer().and_then(|i| u64::try_from(i128::from(i)).ok())
}

pub fn as_i64(value: &Value) -> Option<i64> {
    value.as_integer().and_then(|i| i64::try_from(i128::from(i)).ok())
}

pub fn as_bytes(value: &Value) -> Option<&[u8]> {
    value.as_bytes().map(|b| b.as_slice())
}

pub fn as_text(value: &Value) -> Option<&str> {
    value.as_text()
}

pub fn as_array(value: &Value) -> Option<&[Value]> {
    value.as_array().map(|a| a.as_slice())
}

pub fn as_map(value: &Value) -> Option<&[(Value, Value)]> {
    value.as_map().map(|m| m.as_slice())
}

/// Look up a claim by integer key, falling back to its string name.
/// Integer keys take precedence.
pub fn claim<'a>(entries: &'a [(Value, Value)], int_key: i64, str_key: &str) -> Option<&'a Value> {
    entries
        .iter()
        .find(|(k, _)| as_i64(k) == Some(int_key))
        .or_else(|| entries.iter().find(|(k, _)| as_text(k) == Some(str_key)))
        .map(|(_, v)| v)
}

/// Look up a string-keyed map entry.
pub fn field<'a>(entries: &'a [(Value, Value)], key: &str) -> Option<&'a Value> {
    entries.iter().find(|(k, _)| as_text(k) == Some(key)).map(|(_, v)| v)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn map_keys_are_sorted() {
        let unsorted = Value::Map(vec![
            (text("b"), u64_value(1)),
            (text("a"), u64_value(2)),
        ]);
        let sorted = Value::Map(vec![
            (text("a"), u64_value(2)),
            (text("b"), u64_value(1)),
        ]);
        assert_eq!(
            to_canonical_bytes(&unsorted).unwrap(),
            to_canonical_bytes(&sorted).unwrap()
        );
    }

    #[test]
    fn integer_keys_sort_before_longer_encodings() {
        // 1 encodes as a single byte, "a" as two; canonical order is by
        // encoded bytes, so the integer key must come first.
        let v = Value::Map(vec![
            (text("a"), u64_value(0)),
            (i64_value(1), u64_value(0)),
        ]);
        let bytes = to_canonical_bytes(&v).unwrap();
        let decoded = from_slice(&bytes).unwrap();
        let entries = as_map(&decoded).unwrap();
        assert_eq!(as_i64(&entries[0].0), Some(1));
    }

    #[test]
    fn duplicate_keys_rejected() {
        let v = Value::Map(vec![
            (text("a"), u64_value(1)),
            (text("a"), u64_value(2)),
        ]);
        assert!(to_canonical_bytes(&v).is_err());
    }

    #[test]
    fn claim_prefers_integer_key() {
        let entries = vec![
            (text("aud"), text("doc-str")),
            (i64_value(3), text("doc-int")),
        ];
        assert_eq!(as_text(claim(&entries, 3, "aud").unwrap()), Some("doc-int"));
        let only_str = vec![(text("aud"), text("doc-str"))];
        assert_eq!(as_text(claim(&only_str, 3, "aud").unwrap()), Some("doc-str"));
    }

    #[test]
    fn round_trip_nested() {
        let v = Value::Map(vec![(
            text("caps"),
            Value::Array(vec![Value::Map(vec![
                (text("z"), bytes(vec![1, 2, 3])),
                (text("a"), u64_value(9)),
            ])]),
        )]);
        let encoded = to_canonical_bytes(&v).unwrap();
        let decoded = from_slice(&encoded).unwrap();
        // re-encoding the decoded value is a fixed point
        assert_eq!(to_canonical_bytes(&decoded).unwrap(), encoded);
    }
}
