//! Execution context for pipeline/stage execution.
//!
//! [`ExecutionContext`] wraps [`ExecCtx`] with the additional state a
//! multi-stage orchestrator needs that a single payload invocation does
//! not: a cache backend, a per-run shared key/value bag for stages to
//! pass ad hoc state, and a run-scoped session id used to namespace
//! agent conversation ids and log correlation.

use std::collections::HashMap;
use std::sync::atomic::AtomicBool;
use std::sync::Arc;

use serde_json::Value;
use tokio::sync::RwLock;

use crate::cache::CacheBackend;
use crate::error::Result;
use crate::events::EventHandler;
use crate::exec_ctx::ExecCtx;

/// Shared state for one pipeline run.
///
/// Wraps [`ExecCtx`] (HTTP client, backend, template vars, cancellation,
/// event handler) and adds the cache backend and the state bag that the
/// executor and stage execution helper rely on.
pub struct ExecutionContext {
    pub inner: ExecCtx,
    pub cache: Arc<dyn CacheBackend>,
    /// Opaque values stages may read and write, keyed by name. Used for
    /// cross-stage bookkeeping that doesn't belong in the envelope chain
    /// (e.g. an agent controller's running iteration count).
    state: RwLock<HashMap<String, Value>>,
    /// Additive numeric metrics (durations, token counts, cache hit flags).
    metrics: RwLock<HashMap<String, f64>>,
    pub session_id: String,
}

impl ExecutionContext {
    pub fn builder(base_url: impl Into<String>) -> ExecutionContextBuilder {
        ExecutionContextBuilder {
            inner: ExecCtx::builder(base_url),
            cache: None,
            session_id: None,
        }
    }

    pub fn is_cancelled(&self) -> bool {
        self.inner.is_cancelled()
    }

    pub fn check_cancelled(&self) -> Result<()> {
        self.inner.check_cancelled()
    }

    pub fn cancel_flag(&self) -> Option<&AtomicBool> {
        self.inner.cancel_flag()
    }

    pub fn event_handler(&self) -> &Option<Arc<dyn EventHandler>> {
        &self.inner.event_handler
    }

    pub fn vars(&self) -> &HashMap<String, String> {
        &self.inner.vars
    }

    /// Read a value from the run's shared state bag.
    pub async fn get_state(&self, key: &str) -> Option<Value> {
        self.state.read().await.get(key).cloned()
    }

    /// Write a value into the run's shared state bag.
    pub async fn set_state(&self, key: impl Into<String>, value: Value) {
        self.state.write().await.insert(key.into(), value);
    }

    /// Add to a numeric metric, creating it at `value` if absent.
    pub async fn add_metric(&self, key: impl Into<String>, value: f64) {
        let mut metrics = self.metrics.write().await;
        *metrics.entry(key.into()).or_insert(0.0) += value;
    }

    /// Set a numeric metric to an exact value, overwriting any prior value.
    pub async fn set_metric(&self, key: impl Into<String>, value: f64) {
        self.metrics.write().await.insert(key.into(), value);
    }

    /// Snapshot the metrics bag.
    pub async fn metrics_snapshot(&self) -> HashMap<String, f64> {
        self.metrics.read().await.clone()
    }
}

impl std::fmt::Debug for ExecutionContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExecutionContext")
            .field("inner", &self.inner)
            .field("cache", &self.cache.name())
            .field("session_id", &self.session_id)
            .finish()
    }
}

/// Builder for [`ExecutionContext`].
pub struct ExecutionContextBuilder {
    inner: crate::exec_ctx::ExecCtxBuilder,
    cache: Option<Arc<dyn CacheBackend>>,
    session_id: Option<String>,
}

impl ExecutionContextBuilder {
    pub fn client(mut self, client: reqwest::Client) -> Self {
        self.inner = self.inner.client(client);
        self
    }

    pub fn backend(mut self, backend: Arc<dyn crate::backend::Backend>) -> Self {
        self.inner = self.inner.backend(backend);
        self
    }

    pub fn backoff(mut self, config: crate::backend::BackoffConfig) -> Self {
        self.inner = self.inner.backoff(config);
        self
    }

    pub fn vars(mut self, vars: HashMap<String, String>) -> Self {
        self.inner = self.inner.vars(vars);
        self
    }

    pub fn var(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.inner = self.inner.var(key, value);
        self
    }

    pub fn cancellation(mut self, cancel: Option<Arc<AtomicBool>>) -> Self {
        self.inner = self.inner.cancellation(cancel);
        self
    }

    pub fn event_handler(mut self, handler: Arc<dyn EventHandler>) -> Self {
        self.inner = self.inner.event_handler(handler);
        self
    }

    pub fn timeout(mut self, timeout: std::time::Duration) -> Self {
        self.inner = self.inner.timeout(timeout);
        self
    }

    pub fn cache(mut self, cache: Arc<dyn CacheBackend>) -> Self {
        self.cache = Some(cache);
        self
    }

    pub fn session_id(mut self, session_id: impl Into<String>) -> Self {
        self.session_id = Some(session_id.into());
        self
    }

    pub fn build(self) -> ExecutionContext {
        ExecutionContext {
            inner: self.inner.build(),
            cache: self
                .cache
                .unwrap_or_else(|| Arc::new(crate::cache::MemoryCacheBackend::new())),
            state: RwLock::new(HashMap::new()),
            metrics: RwLock::new(HashMap::new()),
            session_id: self.session_id.unwrap_or_else(|| "default".to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_state_bag_roundtrip() {
        let ctx = ExecutionContext::builder("http://localhost:11434").build();
        assert!(ctx.get_state("k").await.is_none());
        ctx.set_state("k", serde_json::json!(42)).await;
        assert_eq!(ctx.get_state("k").await, Some(serde_json::json!(42)));
    }

    #[test]
    fn test_default_cache_is_memory() {
        let ctx = ExecutionContext::builder("http://localhost:11434").build();
        assert_eq!(ctx.cache.name(), "memory");
    }

    #[test]
    fn test_session_id_default() {
        let ctx = ExecutionContext::builder("http://localhost:11434").build();
        assert_eq!(ctx.session_id, "default");
    }

    #[tokio::test]
    async fn test_metrics_additive() {
        let ctx = ExecutionContext::builder("http://localhost:11434").build();
        ctx.add_metric("a_duration_ms", 10.0).await;
        ctx.add_metric("a_duration_ms", 5.0).await;
        assert_eq!(ctx.metrics_snapshot().await.get("a_duration_ms"), Some(&15.0));
    }

    #[test]
    fn test_cancellation_passthrough() {
        let flag = Arc::new(AtomicBool::new(true));
        let ctx = ExecutionContext::builder("http://localhost:11434")
            .cancellation(Some(flag))
            .build();
        assert!(ctx.is_cancelled());
        assert!(ctx.check_cancelled().is_err());
    }
}
