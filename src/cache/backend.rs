//! Cache backend trait. Concrete backends (filesystem, in-memory, remote)
//! implement this; the executor and stage execution helper are
//! backend-agnostic.

use async_trait::async_trait;
use serde_json::Value;

use super::fingerprint::Fingerprint;
use super::policy::CachePolicy;
use crate::error::Result;

/// Content-addressed store mapping a stage fingerprint to a validated
/// artifact. All operations are non-blocking from the executor's point of
/// view and safe to call concurrently.
#[async_trait]
pub trait CacheBackend: Send + Sync {
    /// True iff both artifact and metadata exist and, for `Transient`
    /// policy, are unexpired.
    async fn exists(&self, fingerprint: &Fingerprint, policy: &CachePolicy) -> Result<bool>;

    /// Load the artifact for a fingerprint. Returns `Ok(None)` on a miss —
    /// including expired `Transient` entries and any read/corruption error
    /// (load never partially succeeds; corruption reads as miss).
    async fn load(&self, fingerprint: &Fingerprint, policy: &CachePolicy) -> Result<Option<Value>>;

    /// Commit an artifact under a fingerprint. Idempotent: writing the same
    /// artifact twice leaves the cache indistinguishable from one write.
    async fn store(
        &self,
        fingerprint: &Fingerprint,
        artifact: &Value,
        compute_ms: Option<u64>,
    ) -> Result<()>;

    /// Remove any entry for a fingerprint. Not an error if absent.
    async fn invalidate(&self, fingerprint: &Fingerprint) -> Result<()>;

    /// Human-readable name for diagnostics.
    fn name(&self) -> &'static str;
}
