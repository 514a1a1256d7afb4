//! Canonical JSON rendering and content fingerprints.
//!
//! Canonical form is what payload equality, schema fingerprints and
//! migration plan hashes are computed over: object keys sorted
//! lexicographically, no whitespace, unchanged value ordering inside
//! arrays. Identical content must produce identical bytes on every
//! platform.

use std::collections::BTreeMap;

use serde_json::Value;
use sha2::{Digest, Sha256};

/// Renders a JSON value in canonical form.
pub fn to_canonical_json(value: &Value) -> String {
    match value {
        Value::Null => "null".to_string(),
        Value::Bool(b) => b.to_string(),
        Value::Number(n) => n.to_string(),
        Value::String(s) => serde_json::to_string(s).unwrap_or_default(),
        Value::Array(items) => {
            let rendered: Vec<String> = items.iter().map(to_canonical_json).collect();
            format!("[{}]", rendered.join(","))
        }
        Value::Object(map) => {
            let mut sorted = BTreeMap::new();
            for (k, v) in map {
                sorted.insert(k.clone(), to_canonical_json(v));
            }
            let rendered: Vec<String> = sorted
                .into_iter()
                .map(|(k, v)| {
                    format!("{}:{}", serde_json::to_string(&k).unwrap_or_default(), v)
                })
                .collect();
            format!("{{{}}}", rendered.join(","))
        }
    }
}

/// SHA-256 hex digest of a byte slice.
pub fn sha256_hex(bytes: &[u8]) -> String {
    let mut h = Sha256::new();
    h.update(bytes);
    format!("{:x}", h.finalize())
}

/// SHA-256 hex digest of the canonical rendering of a JSON value.
pub fn canonical_hash(value: &Value) -> String {
    sha256_hex(to_canonical_json(value).as_bytes())
}

/// Returns `true` if two JSON values are equal in canonical form.
///
/// Object key order is irrelevant; array element order is significant.
pub fn canonical_eq(a: &Value, b: &Value) -> bool {
    to_canonical_json(a) == to_canonical_json(b)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn scalars_render_plainly() {
        assert_eq!(to_canonical_json(&json!(null)), "null");
        assert_eq!(to_canonical_json(&json!(true)), "true");
        assert_eq!(to_canonical_json(&json!(42)), "42");
        assert_eq!(to_canonical_json(&json!("hi")), "\"hi\"");
    }

    #[test]
    fn object_keys_sorted() {
        let v = json!({ "b": 2, "a": 1 });
        assert_eq!(to_canonical_json(&v), "{\"a\":1,\"b\":2}");
    }

    #[test]
    fn arrays_preserve_order() {
        let v = json!([3, 1, 2]);
        assert_eq!(to_canonical_json(&v), "[3,1,2]");
    }

    #[test]
    fn nested_structures() {
        let v = json!({ "z": [{ "y": 1 }], "a": { "x": null } });
        assert_eq!(
            to_canonical_json(&v),
            "{\"a\":{\"x\":null},\"z\":[{\"y\":1}]}"
        );
    }

    #[test]
    fn canonical_eq_ignores_key_order() {
        assert!(canonical_eq(&json!({"a": 1, "b": 2}), &json!({"b": 2, "a": 1})));
        assert!(!canonical_eq(&json!([1, 2]), &json!([2, 1])));
    }

    #[test]
    fn hash_is_stable() {
        let h1 = canonical_hash(&json!({"a": 1}));
        let h2 = canonical_hash(&json!({"a": 1}));
        assert_eq!(h1, h2);
        assert_eq!(h1.len(), 64);
    }
}
