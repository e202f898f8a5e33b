//! Canonicalization and content hashing.
//!
//! Structured payloads are hashed over their canonical JSON form: object keys
//! sorted, no insignificant whitespace, `,` and `:` separators, UTF-8. Two
//! payloads that differ only in key order or formatting therefore share one
//! content hash. Numbers keep their exact source text (serde_json's
//! `arbitrary_precision`), so large integers never collapse onto one float.
//! Anything that does not parse as JSON is hashed verbatim.

use serde_json::Value;
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;

/// Length of a hex-encoded SHA-256 digest.
pub const HASH_LEN: usize = 64;

/// Serialize a JSON value canonically.
pub fn canonical_json(value: &Value) -> String {
    let mut out = String::new();
    write_canonical(value, &mut out);
    out
}

fn write_canonical(value: &Value, out: &mut String) {
    match value {
        Value::Null | Value::Bool(_) | Value::Number(_) | Value::String(_) => {
            out.push_str(&value.to_string());
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
        Value::Object(map) => {
            // Explicit sort: serde_json may be built with `preserve_order`.
            let sorted: BTreeMap<&String, &Value> = map.iter().collect();
            out.push('{');
            for (i, (key, item)) in sorted.into_iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                out.push_str(&Value::String(key.clone()).to_string());
                out.push(':');
                write_canonical(item, out);
            }
            out.push('}');
        }
    }
}

/// Canonical bytes for an arbitrary payload.
pub fn canonicalize(bytes: &[u8]) -> Vec<u8> {
    match serde_json::from_slice::<Value>(bytes) {
        Ok(value) => canonical_json(&value).into_bytes(),
        Err(_) => bytes.to_vec(),
    }
}

/// Hex-encoded SHA-256 of raw bytes.
pub fn sha256_hex(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    format!("{:x}", hasher.finalize())
}

/// Content hash of a payload (hash of its canonical bytes).
pub fn content_hash(bytes: &[u8]) -> String {
    sha256_hex(&canonicalize(bytes))
}

/// Content hash of a JSON value.
pub fn hash_value(value: &Value) -> String {
    sha256_hex(canonical_json(value).as_bytes())
}

/// Whether `s` looks like a content hash produced by this module.
pub fn is_valid_hash(s: &str) -> bool {
    s.len() == HASH_LEN && s.bytes().all(|b| matches!(b, b'0'..=b'9' | b'a'..=b'f'))
}
