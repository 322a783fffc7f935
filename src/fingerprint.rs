//! Duplication fingerprints.
//!
//! A fingerprint maps a body to the duplicate key used for merge-on-insert.
//! It is a pure function, kept apart from the lease logic so another
//! equality strategy can be plugged into a `Queue` without touching it.

use serde_json::Value;
use sha2::{Digest, Sha256};

/// Derives a duplicate key from a body.
pub trait Fingerprint: Send + Sync {
    fn duplicate_key(&self, body: &Value) -> String;
}

/// SHA-256 over the canonical JSON form of the body.
///
/// Object keys are sorted recursively before hashing, so `{"a":1,"b":2}` and
/// `{"b":2,"a":1}` collide. A string and a number with the same digits do not
/// (`"42"` vs `42`).
#[derive(Debug, Clone, Copy, Default)]
pub struct ContentHash;

impl Fingerprint for ContentHash {
    fn duplicate_key(&self, body: &Value) -> String {
        content_hash(body)
    }
}

/// Stable content hash of a body, hex encoded.
pub fn content_hash(body: &Value) -> String {
    let canonical = canonicalize(body).to_string();
    let mut hasher = Sha256::new();
    hasher.update(canonical.as_bytes());
    hex::encode(hasher.finalize())
}

// Rebuilds objects with sorted keys; holds even if serde_json's
// `preserve_order` feature gets enabled somewhere in the dependency graph.
fn canonicalize(value: &Value) -> Value {
    match value {
        Value::Object(map) => {
            let mut entries: Vec<_> = map.iter().collect();
            entries.sort_by(|a, b| a.0.cmp(b.0));
            Value::Object(
                entries
                    .into_iter()
                    .map(|(k, v)| (k.clone(), canonicalize(v)))
                    .collect(),
            )
        }
        Value::Array(items) => Value::Array(items.iter().map(canonicalize).collect()),
        other => other.clone(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn identical_strings_collide() {
        assert_eq!(content_hash(&json!("foo")), content_hash(&json!("foo")));
        assert_ne!(content_hash(&json!("foo")), content_hash(&json!("bar")));
    }

    #[test]
    fn key_order_does_not_matter() {
        let a = json!({"a": "a", "b": "b"});
        let b = json!({"b": "b", "a": "a"});
        assert_eq!(content_hash(&a), content_hash(&b));
    }

    #[test]
    fn nested_objects_are_canonicalized() {
        let a = json!({"outer": {"x": 1, "y": [ {"q": 1, "p": 2} ]}});
        let b = json!({"outer": {"y": [ {"p": 2, "q": 1} ], "x": 1}});
        assert_eq!(content_hash(&a), content_hash(&b));
    }

    #[test]
    fn different_structs_do_not_collide() {
        let a = json!({"a": "a", "b": "b"});
        let b = json!({"a": "a", "c": "c"});
        assert_ne!(content_hash(&a), content_hash(&b));
    }

    #[test]
    fn string_and_number_do_not_collide() {
        assert_ne!(content_hash(&json!("42")), content_hash(&json!(42)));
    }

    #[test]
    fn hash_is_hex_sha256() {
        let key = ContentHash.duplicate_key(&json!(42));
        assert_eq!(key.len(), 64);
        assert!(key.chars().all(|c| c.is_ascii_hexdigit()));
    }
}
