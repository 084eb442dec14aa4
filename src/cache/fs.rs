//! Filesystem-backed cache: one directory per fingerprint holding
//! `artifact.json` and `meta.json`, as described in the persisted cache
//! layout reference.

use async_trait::async_trait;
use serde_json::Value;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use super::backend::CacheBackend;
use super::clock::{Clock, SystemClock};
use super::entry::CacheMetadata;
use super::fingerprint::Fingerprint;
use super::policy::CachePolicy;
use crate::error::Result;
use crate::PipelineError;

/// Cache backend that persists entries under `base_dir/<stage_id>/
/// <cache_version>/<input_fingerprint>/{artifact.json,meta.json}`.
pub struct FsCacheBackend {
    base_dir: PathBuf,
    clock: Arc<dyn Clock>,
}

impl FsCacheBackend {
    pub fn new(base_dir: impl Into<PathBuf>) -> Self {
        Self::with_clock(base_dir, Arc::new(SystemClock))
    }

    pub fn with_clock(base_dir: impl Into<PathBuf>, clock: Arc<dyn Clock>) -> Self {
        Self {
            base_dir: base_dir.into(),
            clock,
        }
    }

    fn dir_for(&self, fingerprint: &Fingerprint) -> PathBuf {
        let [a, b, c] = fingerprint.path_segments();
        self.base_dir.join(a).join(b).join(c)
    }

    async fn read_meta(path: &Path) -> Option<CacheMetadata> {
        let bytes = tokio::fs::read(path).await.ok()?;
        serde_json::from_slice(&bytes).ok()
    }

    async fn read_artifact(path: &Path) -> Option<Value> {
        let bytes = tokio::fs::read(path).await.ok()?;
        serde_json::from_slice(&bytes).ok()
    }

    async fn write_atomic(path: &Path, bytes: &[u8]) -> Result<()> {
        let tmp = path.with_extension("tmp");
        tokio::fs::write(&tmp, bytes)
            .await
            .map_err(|e| PipelineError::CacheError(format!("write {}: {e}", tmp.display())))?;
        tokio::fs::rename(&tmp, path)
            .await
            .map_err(|e| PipelineError::CacheError(format!("rename into {}: {e}", path.display())))?;
        Ok(())
    }
}

#[async_trait]
impl CacheBackend for FsCacheBackend {
    async fn exists(&self, fingerprint: &Fingerprint, policy: &CachePolicy) -> Result<bool> {
        Ok(self.load(fingerprint, policy).await?.is_some())
    }

    async fn load(&self, fingerprint: &Fingerprint, policy: &CachePolicy) -> Result<Option<Value>> {
        let dir = self.dir_for(fingerprint);
        let meta = match Self::read_meta(&dir.join("meta.json")).await {
            Some(m) => m,
            None => return Ok(None),
        };
        if !meta.matches(
            &fingerprint.stage_id,
            &fingerprint.cache_version,
            &fingerprint.input_fingerprint,
        ) {
            return Ok(None);
        }
        if !policy.is_fresh(meta.created_at, self.clock.now_unix()) {
            return Ok(None);
        }
        Ok(Self::read_artifact(&dir.join("artifact.json")).await)
    }

    async fn store(
        &self,
        fingerprint: &Fingerprint,
        artifact: &Value,
        compute_ms: Option<u64>,
    ) -> Result<()> {
        let dir = self.dir_for(fingerprint);
        tokio::fs::create_dir_all(&dir)
            .await
            .map_err(|e| PipelineError::CacheError(format!("mkdir {}: {e}", dir.display())))?;

        let artifact_bytes = serde_json::to_vec(artifact)?;
        // Artifact is committed before metadata so that metadata presence
        // implies the artifact is present too (atomic-commit ordering).
        Self::write_atomic(&dir.join("artifact.json"), &artifact_bytes).await?;

        let meta = CacheMetadata {
            stage_id: fingerprint.stage_id.clone(),
            cache_version: fingerprint.cache_version.clone(),
            input_fingerprint: fingerprint.input_fingerprint.clone(),
            created_at: self.clock.now_unix(),
            artifact_model: "Value".to_string(),
            artifact_schema_version: None,
            compute_ms,
            artifact_bytes: Some(artifact_bytes.len() as u64),
        };
        let meta_bytes = serde_json::to_vec(&meta)?;
        Self::write_atomic(&dir.join("meta.json"), &meta_bytes).await?;
        Ok(())
    }

    async fn invalidate(&self, fingerprint: &Fingerprint) -> Result<()> {
        let dir = self.dir_for(fingerprint);
        match tokio::fs::remove_dir_all(&dir).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(PipelineError::CacheError(format!(
                "remove {}: {e}",
                dir.display()
            ))),
        }
    }

    fn name(&self) -> &'static str {
        "fs"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn temp_dir() -> PathBuf {
        let mut dir = std::env::temp_dir();
        dir.push(format!("llm-pipeline-cache-test-{}", fastrand::u64(..)));
        dir
    }

    fn fp(id: &str) -> Fingerprint {
        Fingerprint::compute(id, "1", &json!({"k": id}))
    }

    #[tokio::test]
    async fn test_miss_then_store_then_hit() {
        let cache = FsCacheBackend::new(temp_dir());
        let f = fp("a");
        assert!(cache.load(&f, &CachePolicy::Deterministic).await.unwrap().is_none());
        cache.store(&f, &json!({"v": 1}), Some(3)).await.unwrap();
        let loaded = cache.load(&f, &CachePolicy::Deterministic).await.unwrap();
        assert_eq!(loaded, Some(json!({"v": 1})));
    }

    #[tokio::test]
    async fn test_invalidate_removes_namespace() {
        let cache = FsCacheBackend::new(temp_dir());
        let f = fp("a");
        cache.store(&f, &json!(1), None).await.unwrap();
        cache.invalidate(&f).await.unwrap();
        assert!(cache.load(&f, &CachePolicy::Deterministic).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_invalidate_absent_is_ok() {
        let cache = FsCacheBackend::new(temp_dir());
        assert!(cache.invalidate(&fp("never-stored")).await.is_ok());
    }

    #[tokio::test]
    async fn test_corrupted_meta_reads_as_miss() {
        let base = temp_dir();
        let cache = FsCacheBackend::new(base.clone());
        let f = fp("a");
        cache.store(&f, &json!(1), None).await.unwrap();

        let dir = cache.dir_for(&f);
        tokio::fs::write(dir.join("meta.json"), b"not json").await.unwrap();

        assert!(cache.load(&f, &CachePolicy::Deterministic).await.unwrap().is_none());
    }
}
