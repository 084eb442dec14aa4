//! Declarative pipeline definition: stages, their dependency edges, and the
//! wave plan the executor drives.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;

use crate::context::ExecutionContext;
use crate::error::Result;
use crate::stage::Stage;
use crate::PipelineError;

/// How a stage's declared inputs are resolved and invoked.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecutionPattern {
    /// Exactly one invocation; inputs resolve to whatever shape they declare.
    Sequential,
    /// Like `Sequential`, but the stage is understood to run alongside wave
    /// siblings rather than gating the next wave on its own (informational —
    /// wave placement is identical to `Sequential`; this variant documents
    /// intent in pipeline definitions for readers).
    Parallel,
    /// The single declared input must resolve to a JSON array; the stage
    /// runs once per element, in parallel, with order-preserved output.
    FanOut,
    /// Runs only if `condition` returns true; otherwise produces no output.
    Conditional,
}

/// Predicate function for `StageDefinition::condition`.
pub type ConditionFn = Arc<dyn Fn(&ExecutionContext) -> bool + Send + Sync>;

/// Predicate classifying whether an outer `Stage::execute` error is worth
/// retrying at the orchestration level (as opposed to a business failure
/// carried in `Envelope::failure`, which is never retried here).
pub type RetryableFn = Arc<dyn Fn(&PipelineError) -> bool + Send + Sync>;

/// Default retryable classifier: transport errors, 429/5xx HTTP errors, and
/// timeouts. Mirrors `backend::Backend::is_retryable` but operates on the
/// coarser `PipelineError` returned from a stage's outer `Result`.
fn default_retryable(err: &PipelineError) -> bool {
    match err {
        PipelineError::Request(_) => true,
        PipelineError::Timeout { .. } => true,
        PipelineError::HttpError { status, .. } => {
            *status == 429 || (500..600).contains(status)
        }
        _ => false,
    }
}

/// Orchestration-level retry policy applied to a stage's outer `Err` path.
/// Distinct from both `backend::BackoffConfig` (transport retry, internal to
/// a single `Stage::execute` call) and `retry::RetryConfig` (semantic
/// LLM-output retry) — this governs re-invoking the whole stage when it
/// raises rather than returning a business failure.
#[derive(Clone)]
pub struct StageRetryPolicy {
    pub max_attempts: u32,
    pub initial_delay: Duration,
    pub multiplier: f64,
    pub max_delay: Duration,
    pub retryable: RetryableFn,
}

impl StageRetryPolicy {
    /// No retry: the first failure is final.
    pub fn none() -> Self {
        Self {
            max_attempts: 1,
            initial_delay: Duration::from_millis(0),
            multiplier: 1.0,
            max_delay: Duration::from_millis(0),
            retryable: Arc::new(default_retryable),
        }
    }

    /// Retry up to `max_attempts` total invocations with exponential backoff.
    pub fn new(max_attempts: u32) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            initial_delay: Duration::from_millis(500),
            multiplier: 2.0,
            max_delay: Duration::from_secs(30),
            retryable: Arc::new(default_retryable),
        }
    }

    pub fn with_initial_delay(mut self, delay: Duration) -> Self {
        self.initial_delay = delay;
        self
    }

    pub fn with_multiplier(mut self, multiplier: f64) -> Self {
        self.multiplier = multiplier;
        self
    }

    pub fn with_max_delay(mut self, delay: Duration) -> Self {
        self.max_delay = delay;
        self
    }

    pub fn with_retryable(
        mut self,
        f: impl Fn(&PipelineError) -> bool + Send + Sync + 'static,
    ) -> Self {
        self.retryable = Arc::new(f);
        self
    }

    /// Delay before the attempt numbered `attempt` (0-indexed, i.e. the
    /// delay awaited after attempt `attempt` fails and before `attempt + 1`).
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let base = self.initial_delay.as_secs_f64() * self.multiplier.powi(attempt as i32);
        Duration::from_secs_f64(base.min(self.max_delay.as_secs_f64()))
    }
}

impl Default for StageRetryPolicy {
    fn default() -> Self {
        Self::none()
    }
}

impl std::fmt::Debug for StageRetryPolicy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StageRetryPolicy")
            .field("max_attempts", &self.max_attempts)
            .field("initial_delay", &self.initial_delay)
            .field("multiplier", &self.multiplier)
            .field("max_delay", &self.max_delay)
            .finish()
    }
}

/// Function computing the semantic cache key input from a stage's resolved
/// input value. `None` disables caching for the stage.
pub type CacheKeyFn = Arc<dyn Fn(&Value) -> Value + Send + Sync>;

/// One node in a `PipelineDefinition`.
pub struct StageDefinition {
    pub id: String,
    pub stage: Arc<dyn Stage>,
    pub inputs: Vec<String>,
    pub pattern: ExecutionPattern,
    pub condition: Option<ConditionFn>,
    pub retry: StageRetryPolicy,
    pub timeout_ms: Option<u64>,
    pub critical: bool,
    pub cache_version: String,
    pub cache_key_fn: Option<CacheKeyFn>,
    pub cache_policy: crate::cache::CachePolicy,
}

impl StageDefinition {
    pub fn new(id: impl Into<String>, stage: Arc<dyn Stage>) -> StageDefinitionBuilder {
        StageDefinitionBuilder {
            id: id.into(),
            stage,
            inputs: Vec::new(),
            pattern: ExecutionPattern::Sequential,
            condition: None,
            retry: StageRetryPolicy::none(),
            timeout_ms: None,
            critical: true,
            cache_version: "1".to_string(),
            cache_key_fn: None,
            cache_policy: crate::cache::CachePolicy::Deterministic,
        }
    }
}

/// Builder for [`StageDefinition`].
pub struct StageDefinitionBuilder {
    id: String,
    stage: Arc<dyn Stage>,
    inputs: Vec<String>,
    pattern: ExecutionPattern,
    condition: Option<ConditionFn>,
    retry: StageRetryPolicy,
    timeout_ms: Option<u64>,
    critical: bool,
    cache_version: String,
    cache_key_fn: Option<CacheKeyFn>,
    cache_policy: crate::cache::CachePolicy,
}

impl StageDefinitionBuilder {
    pub fn with_inputs(mut self, inputs: impl IntoIterator<Item = impl Into<String>>) -> Self {
        self.inputs = inputs.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_pattern(mut self, pattern: ExecutionPattern) -> Self {
        self.pattern = pattern;
        self
    }

    pub fn with_condition(
        mut self,
        f: impl Fn(&ExecutionContext) -> bool + Send + Sync + 'static,
    ) -> Self {
        self.condition = Some(Arc::new(f));
        self
    }

    pub fn with_retry(mut self, retry: StageRetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_timeout_ms(mut self, timeout_ms: u64) -> Self {
        self.timeout_ms = Some(timeout_ms);
        self
    }

    pub fn critical(mut self, critical: bool) -> Self {
        self.critical = critical;
        self
    }

    pub fn with_cache_version(mut self, version: impl Into<String>) -> Self {
        self.cache_version = version.into();
        self
    }

    pub fn with_cache_key_fn(
        mut self,
        f: impl Fn(&Value) -> Value + Send + Sync + 'static,
    ) -> Self {
        self.cache_key_fn = Some(Arc::new(f));
        self
    }

    pub fn with_cache_policy(mut self, policy: crate::cache::CachePolicy) -> Self {
        self.cache_policy = policy;
        self
    }

    pub fn build(self) -> StageDefinition {
        StageDefinition {
            id: self.id,
            stage: self.stage,
            inputs: self.inputs,
            pattern: self.pattern,
            condition: self.condition,
            retry: self.retry,
            timeout_ms: self.timeout_ms,
            critical: self.critical,
            cache_version: self.cache_version,
            cache_key_fn: self.cache_key_fn,
            cache_policy: self.cache_policy,
        }
    }
}

/// A validated, immutable pipeline graph with a precomputed wave plan.
pub struct PipelineDefinition {
    pub name: String,
    pub stages: Vec<StageDefinition>,
    /// Stage indices grouped into waves; `waves[k]` are the indices of
    /// stages runnable once all of `waves[..k]` have completed.
    pub waves: Vec<Vec<usize>>,
}

impl PipelineDefinition {
    pub fn builder(name: impl Into<String>) -> PipelineDefinitionBuilder {
        PipelineDefinitionBuilder {
            name: name.into(),
            stages: Vec::new(),
        }
    }

    pub fn stage_index(&self, id: &str) -> Option<usize> {
        self.stages.iter().position(|s| s.id == id)
    }
}

/// Builder for [`PipelineDefinition`]. `build()` validates uniqueness,
/// reference closure, acyclicity, pattern-specific invariants, and computes
/// the wave plan via Kahn's algorithm.
pub struct PipelineDefinitionBuilder {
    name: String,
    stages: Vec<StageDefinition>,
}

impl PipelineDefinitionBuilder {
    pub fn add_stage(mut self, stage: StageDefinition) -> Self {
        self.stages.push(stage);
        self
    }

    pub fn build(self) -> Result<PipelineDefinition> {
        let ids: HashSet<&str> = self.stages.iter().map(|s| s.id.as_str()).collect();
        if ids.len() != self.stages.len() {
            let mut seen = HashSet::new();
            for s in &self.stages {
                if !seen.insert(s.id.as_str()) {
                    return Err(PipelineError::DuplicateStageId(s.id.clone()));
                }
            }
        }

        for s in &self.stages {
            for input in &s.inputs {
                if !ids.contains(input.as_str()) {
                    return Err(PipelineError::UnknownStageRef {
                        referenced_by: s.id.clone(),
                        input_id: input.clone(),
                    });
                }
            }
            if s.pattern == ExecutionPattern::Conditional && s.condition.is_none() {
                return Err(PipelineError::ConditionRequired(s.id.clone()));
            }
            if s.pattern == ExecutionPattern::FanOut && s.inputs.len() != 1 {
                return Err(PipelineError::InvalidConfig(format!(
                    "stage '{}' has pattern FAN_OUT but declares {} inputs (expected exactly 1)",
                    s.id,
                    s.inputs.len()
                )));
            }
        }

        let index_of: HashMap<&str, usize> = self
            .stages
            .iter()
            .enumerate()
            .map(|(i, s)| (s.id.as_str(), i))
            .collect();

        // Kahn's algorithm over stage indices.
        let n = self.stages.len();
        let mut in_degree = vec![0usize; n];
        let mut dependents: Vec<Vec<usize>> = vec![Vec::new(); n];
        for (i, s) in self.stages.iter().enumerate() {
            in_degree[i] = s.inputs.len();
            for input in &s.inputs {
                let j = index_of[input.as_str()];
                dependents[j].push(i);
            }
        }

        let mut waves: Vec<Vec<usize>> = Vec::new();
        let mut remaining_in_degree = in_degree.clone();
        let mut frontier: VecDeque<usize> = (0..n).filter(|&i| in_degree[i] == 0).collect();
        let mut processed = 0usize;

        while !frontier.is_empty() {
            let wave: Vec<usize> = frontier.drain(..).collect();
            processed += wave.len();
            let mut next_frontier = Vec::new();
            for &i in &wave {
                for &dep in &dependents[i] {
                    remaining_in_degree[dep] -= 1;
                    if remaining_in_degree[dep] == 0 {
                        next_frontier.push(dep);
                    }
                }
            }
            waves.push(wave);
            frontier = next_frontier.into();
        }

        if processed != n {
            let cyclic_stage = (0..n)
                .find(|&i| remaining_in_degree[i] > 0)
                .map(|i| self.stages[i].id.clone())
                .unwrap_or_default();
            return Err(PipelineError::CycleDetected(cyclic_stage));
        }

        Ok(PipelineDefinition {
            name: self.name,
            stages: self.stages,
            waves,
        })
    }
}
