//! Cache fingerprinting: canonical JSON encoding + SHA-256 digest.

use serde_json::Value;
use sha2::{Digest, Sha256};

/// The `(stage_id, cache_version, input_fingerprint)` triple that is the
/// sole identity of a cached artifact.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Fingerprint {
    pub stage_id: String,
    pub cache_version: String,
    pub input_fingerprint: String,
}

impl Fingerprint {
    /// Compute a fingerprint from a stage id, cache version, and the
    /// semantic input value (already reduced to its cache-relevant shape by
    /// the stage definition's `cache_key_fn`, or the raw input if none).
    pub fn compute(stage_id: impl Into<String>, cache_version: impl Into<String>, input: &Value) -> Self {
        let canonical = canonicalize(input);
        let mut hasher = Sha256::new();
        hasher.update(canonical.as_bytes());
        let digest = hasher.finalize();
        Self {
            stage_id: stage_id.into(),
            cache_version: cache_version.into(),
            input_fingerprint: hex_encode(&digest),
        }
    }

    /// Sanitized path segments, one per fingerprint component, suitable for
    /// use as nested directory names (see [`crate::cache::FsCacheBackend`]).
    pub fn path_segments(&self) -> [String; 3] {
        [
            sanitize(&self.stage_id),
            sanitize(&self.cache_version),
            sanitize(&self.input_fingerprint),
        ]
    }
}

fn hex_encode(bytes: &[u8]) -> String {
    let mut s = String::with_capacity(bytes.len() * 2);
    for b in bytes {
        s.push_str(&format!("{:02x}", b));
    }
    s
}

/// Canonical JSON: object keys recursively sorted, compact separators.
///
/// Two semantically equal inputs MUST produce identical output here for
/// the fingerprint to be a reliable cache key.
pub fn canonicalize(value: &Value) -> String {
    sorted(value).to_string()
}

fn sorted(value: &Value) -> Value {
    match value {
        Value::Object(map) => {
            let mut entries: Vec<(String, Value)> =
                map.iter().map(|(k, v)| (k.clone(), sorted(v))).collect();
            entries.sort_by(|a, b| a.0.cmp(&b.0));
            Value::Object(entries.into_iter().collect())
        }
        Value::Array(items) => Value::Array(items.iter().map(sorted).collect()),
        other => other.clone(),
    }
}

fn sanitize(s: &str) -> String {
    s.chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '-' || c == '_' {
                c
            } else {
                '_'
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_fingerprint_deterministic_across_key_order() {
        let a = Fingerprint::compute("stage", "1", &json!({"b": 1, "a": 2}));
        let b = Fingerprint::compute("stage", "1", &json!({"a": 2, "b": 1}));
        assert_eq!(a.input_fingerprint, b.input_fingerprint);
    }

    #[test]
    fn test_fingerprint_differs_on_value_change() {
        let a = Fingerprint::compute("stage", "1", &json!({"a": 1}));
        let b = Fingerprint::compute("stage", "1", &json!({"a": 2}));
        assert_ne!(a.input_fingerprint, b.input_fingerprint);
    }

    #[test]
    fn test_fingerprint_differs_on_version_bump() {
        let a = Fingerprint::compute("stage", "1", &json!({"a": 1}));
        let b = Fingerprint::compute("stage", "2", &json!({"a": 1}));
        assert_ne!(a.cache_version, b.cache_version);
    }

    #[test]
    fn test_path_segments_sanitized() {
        let fp = Fingerprint {
            stage_id: "stage/with slash".into(),
            cache_version: "1".into(),
            input_fingerprint: "abc123".into(),
        };
        let segs = fp.path_segments();
        assert_eq!(segs[0], "stage_with_slash");
    }

    #[test]
    fn test_nested_object_canonicalization() {
        let a = json!({"outer": {"z": 1, "a": 2}, "list": [3, 1, 2]});
        let b = json!({"list": [3, 1, 2], "outer": {"a": 2, "z": 1}});
        assert_eq!(canonicalize(&a), canonicalize(&b));
    }
}
