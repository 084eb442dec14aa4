//! Cache entry metadata — the half of a cache entry that isn't the raw
//! artifact bytes.

use serde::{Deserialize, Serialize};

/// Metadata committed alongside an artifact. Artifact and metadata are
/// committed atomically: either both exist and agree on the fingerprint
/// triple, or the entry is considered absent.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheMetadata {
    pub stage_id: String,
    pub cache_version: String,
    pub input_fingerprint: String,
    /// Unix seconds at commit time.
    pub created_at: u64,
    /// Fully-qualified type tag of the artifact (informational; used for
    /// diagnostics, not enforced as a strict type check).
    pub artifact_model: String,
    pub artifact_schema_version: Option<u32>,
    pub compute_ms: Option<u64>,
    pub artifact_bytes: Option<u64>,
}

impl CacheMetadata {
    /// Whether this metadata's identity triple matches a fingerprint.
    pub fn matches(&self, stage_id: &str, cache_version: &str, input_fingerprint: &str) -> bool {
        self.stage_id == stage_id
            && self.cache_version == cache_version
            && self.input_fingerprint == input_fingerprint
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_matches_identity() {
        let meta = CacheMetadata {
            stage_id: "a".into(),
            cache_version: "1".into(),
            input_fingerprint: "deadbeef".into(),
            created_at: 0,
            artifact_model: "Value".into(),
            artifact_schema_version: None,
            compute_ms: None,
            artifact_bytes: None,
        };
        assert!(meta.matches("a", "1", "deadbeef"));
        assert!(!meta.matches("a", "2", "deadbeef"));
    }
}
