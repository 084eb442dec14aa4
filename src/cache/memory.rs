//! In-process cache backend. Default/test backend; no persistence across
//! runs of the host process.

use async_trait::async_trait;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;

use super::backend::CacheBackend;
use super::clock::{Clock, SystemClock};
use super::entry::CacheMetadata;
use super::fingerprint::Fingerprint;
use super::policy::CachePolicy;
use crate::error::Result;

fn key_for(fp: &Fingerprint) -> String {
    format!("{}/{}/{}", fp.stage_id, fp.cache_version, fp.input_fingerprint)
}

/// In-memory `HashMap`-backed cache. Writes are serialized by the
/// `RwLock`, which is sufficient since within one process execution a
/// fingerprint corresponds to exactly one stage invocation per wave.
pub struct MemoryCacheBackend {
    entries: RwLock<HashMap<String, (Value, CacheMetadata)>>,
    clock: Arc<dyn Clock>,
}

impl MemoryCacheBackend {
    pub fn new() -> Self {
        Self::with_clock(Arc::new(SystemClock))
    }

    pub fn with_clock(clock: Arc<dyn Clock>) -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
            clock,
        }
    }
}

impl Default for MemoryCacheBackend {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl CacheBackend for MemoryCacheBackend {
    async fn exists(&self, fingerprint: &Fingerprint, policy: &CachePolicy) -> Result<bool> {
        let entries = self.entries.read().await;
        Ok(match entries.get(&key_for(fingerprint)) {
            Some((_, meta)) => policy.is_fresh(meta.created_at, self.clock.now_unix()),
            None => false,
        })
    }

    async fn load(&self, fingerprint: &Fingerprint, policy: &CachePolicy) -> Result<Option<Value>> {
        let entries = self.entries.read().await;
        match entries.get(&key_for(fingerprint)) {
            Some((artifact, meta))
                if meta.matches(
                    &fingerprint.stage_id,
                    &fingerprint.cache_version,
                    &fingerprint.input_fingerprint,
                ) =>
            {
                if policy.is_fresh(meta.created_at, self.clock.now_unix()) {
                    Ok(Some(artifact.clone()))
                } else {
                    Ok(None)
                }
            }
            _ => Ok(None),
        }
    }

    async fn store(
        &self,
        fingerprint: &Fingerprint,
        artifact: &Value,
        compute_ms: Option<u64>,
    ) -> Result<()> {
        let meta = CacheMetadata {
            stage_id: fingerprint.stage_id.clone(),
            cache_version: fingerprint.cache_version.clone(),
            input_fingerprint: fingerprint.input_fingerprint.clone(),
            created_at: self.clock.now_unix(),
            artifact_model: "Value".to_string(),
            artifact_schema_version: None,
            compute_ms,
            artifact_bytes: Some(artifact.to_string().len() as u64),
        };
        let mut entries = self.entries.write().await;
        entries.insert(key_for(fingerprint), (artifact.clone(), meta));
        Ok(())
    }

    async fn invalidate(&self, fingerprint: &Fingerprint) -> Result<()> {
        let mut entries = self.entries.write().await;
        entries.remove(&key_for(fingerprint));
        Ok(())
    }

    fn name(&self) -> &'static str {
        "memory"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::clock::TestClock;
    use serde_json::json;

    fn fp(id: &str) -> Fingerprint {
        Fingerprint::compute(id, "1", &json!({"k": id}))
    }

    #[tokio::test]
    async fn test_miss_then_store_then_hit() {
        let cache = MemoryCacheBackend::new();
        let f = fp("a");
        assert!(cache.load(&f, &CachePolicy::Deterministic).await.unwrap().is_none());
        cache.store(&f, &json!({"v": 1}), Some(5)).await.unwrap();
        let loaded = cache.load(&f, &CachePolicy::Deterministic).await.unwrap();
        assert_eq!(loaded, Some(json!({"v": 1})));
    }

    #[tokio::test]
    async fn test_store_idempotent() {
        let cache = MemoryCacheBackend::new();
        let f = fp("a");
        cache.store(&f, &json!({"v": 1}), None).await.unwrap();
        cache.store(&f, &json!({"v": 1}), None).await.unwrap();
        let loaded = cache.load(&f, &CachePolicy::Deterministic).await.unwrap();
        assert_eq!(loaded, Some(json!({"v": 1})));
    }

    #[tokio::test]
    async fn test_ttl_expiry() {
        let clock = Arc::new(TestClock::new(0));
        let cache = MemoryCacheBackend::with_clock(clock.clone());
        let f = fp("a");
        cache.store(&f, &json!({"v": 1}), None).await.unwrap();

        let policy = CachePolicy::Transient { ttl_secs: 1 };
        clock.set(0);
        assert!(cache.load(&f, &policy).await.unwrap().is_some());

        clock.set(2);
        assert!(cache.load(&f, &policy).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_invalidate_removes_entry() {
        let cache = MemoryCacheBackend::new();
        let f = fp("a");
        cache.store(&f, &json!(1), None).await.unwrap();
        cache.invalidate(&f).await.unwrap();
        assert!(cache.load(&f, &CachePolicy::Deterministic).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_distinct_fingerprints_distinct_entries() {
        let cache = MemoryCacheBackend::new();
        cache.store(&fp("a"), &json!(1), None).await.unwrap();
        cache.store(&fp("b"), &json!(2), None).await.unwrap();
        assert_eq!(
            cache.load(&fp("a"), &CachePolicy::Deterministic).await.unwrap(),
            Some(json!(1))
        );
        assert_eq!(
            cache.load(&fp("b"), &CachePolicy::Deterministic).await.unwrap(),
            Some(json!(2))
        );
    }
}
