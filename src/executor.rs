//! Pipeline executor: drives a validated [`PipelineDefinition`] wave by
//! wave, applying per-stage retry/timeout, propagating outputs, and
//! enforcing fail-fast on critical-stage failure.

use std::collections::HashMap;
use std::sync::atomic::Ordering;
use std::time::Instant;

use futures::future::join_all;
use serde_json::Value;

use crate::context::ExecutionContext;
use crate::envelope::Envelope;
use crate::error::Result;
use crate::events::{self, Event};
use crate::pipeline_def::{ExecutionPattern, PipelineDefinition, StageDefinition};
use crate::stage::StageInput;
use crate::PipelineError;

/// Outcome of a full pipeline run.
#[derive(Debug, Clone)]
pub struct PipelineResult {
    pub success: bool,
    pub outputs: HashMap<String, Envelope<Value>>,
    pub failed_stages: Vec<String>,
    pub metrics: HashMap<String, f64>,
}

/// Drives a [`PipelineDefinition`] to completion.
pub struct PipelineExecutor;

impl PipelineExecutor {
    pub fn new() -> Self {
        Self
    }

    /// Execute `pipeline` against `seed_input`, sharing `ctx` across every
    /// stage invocation.
    ///
    /// The outer `Result` carries only fatal/invariant-violation errors
    /// (e.g. a `FAN_OUT` stage resolving to a non-array input at runtime);
    /// ordinary stage failures are reported via `PipelineResult.success =
    /// false`, never as an outer `Err`.
    pub async fn execute(
        &self,
        pipeline: &PipelineDefinition,
        seed_input: Value,
        ctx: &ExecutionContext,
    ) -> Result<PipelineResult> {
        let mut outputs: HashMap<String, Envelope<Value>> = HashMap::new();
        let mut failed_stages: Vec<String> = Vec::new();

        for (wave_index, wave) in pipeline.waves.iter().enumerate() {
            if ctx.is_cancelled() {
                break;
            }

            let runnable: Vec<usize> = wave
                .iter()
                .copied()
                .filter(|&idx| {
                    let def = &pipeline.stages[idx];
                    match (&def.pattern, &def.condition) {
                        (ExecutionPattern::Conditional, Some(cond)) => cond(ctx),
                        _ => true,
                    }
                })
                .collect();

            events::emit(
                ctx.event_handler(),
                Event::WaveStart {
                    wave_index,
                    stage_ids: runnable
                        .iter()
                        .map(|&idx| pipeline.stages[idx].id.clone())
                        .collect(),
                },
            );

            let mut futs = Vec::with_capacity(runnable.len());
            for &idx in &runnable {
                let def = &pipeline.stages[idx];
                let resolved = resolve_input(def, &outputs, &seed_input)?;
                futs.push(run_stage_definition(def, resolved, ctx));
            }

            let results = join_all(futs).await;

            let mut critical_failed = false;
            for (&idx, envelope) in runnable.iter().zip(results.into_iter()) {
                let def = &pipeline.stages[idx];
                ctx.add_metric(format!("{}_duration_ms", def.id), envelope.duration_ms as f64)
                    .await;
                if envelope.tokens_used > 0 {
                    ctx.add_metric(format!("{}_tokens", def.id), envelope.tokens_used as f64)
                        .await;
                }
                if !envelope.is_success() {
                    failed_stages.push(def.id.clone());
                    if def.critical {
                        critical_failed = true;
                    }
                }
                outputs.insert(def.id.clone(), envelope);
            }

            events::emit(ctx.event_handler(), Event::WaveEnd { wave_index });

            if critical_failed {
                if let Some(flag) = ctx.cancel_flag() {
                    flag.store(true, Ordering::Relaxed);
                }
                return Ok(PipelineResult {
                    success: false,
                    outputs,
                    failed_stages,
                    metrics: ctx.metrics_snapshot().await,
                });
            }
        }

        Ok(PipelineResult {
            success: failed_stages.is_empty(),
            outputs,
            failed_stages,
            metrics: ctx.metrics_snapshot().await,
        })
    }
}

impl Default for PipelineExecutor {
    fn default() -> Self {
        Self::new()
    }
}

/// What a stage definition's declared inputs resolve to before dispatch.
enum ResolvedInput {
    Input(StageInput),
    /// A `FAN_OUT` stage's resolved sequence, one `StageInput::Element` per
    /// entry.
    Sequence(Vec<Value>),
}

fn value_for(id: &str, outputs: &HashMap<String, Envelope<Value>>) -> Value {
    outputs
        .get(id)
        .and_then(|env| env.data())
        .cloned()
        .unwrap_or(Value::Null)
}

fn resolve_input(
    def: &StageDefinition,
    outputs: &HashMap<String, Envelope<Value>>,
    seed_input: &Value,
) -> Result<ResolvedInput> {
    if def.inputs.is_empty() {
        return Ok(ResolvedInput::Input(StageInput::Single(seed_input.clone())));
    }

    if def.pattern == ExecutionPattern::FanOut {
        let value = value_for(&def.inputs[0], outputs);
        return match value {
            Value::Array(items) => Ok(ResolvedInput::Sequence(items)),
            _ => Err(PipelineError::FanOutRequiresSequence(def.id.clone())),
        };
    }

    if def.inputs.len() == 1 {
        return Ok(ResolvedInput::Input(StageInput::Single(value_for(
            &def.inputs[0],
            outputs,
        ))));
    }

    let map = def
        .inputs
        .iter()
        .map(|id| (id.clone(), value_for(id, outputs)))
        .collect();
    Ok(ResolvedInput::Input(StageInput::Multi(map)))
}

async fn run_stage_definition(
    def: &StageDefinition,
    resolved: ResolvedInput,
    ctx: &ExecutionContext,
) -> Envelope<Value> {
    match resolved {
        ResolvedInput::Input(input) => run_stage_with_retry(def, input, ctx).await,
        ResolvedInput::Sequence(items) => run_fan_out(def, items, ctx).await,
    }
}

async fn run_fan_out(def: &StageDefinition, items: Vec<Value>, ctx: &ExecutionContext) -> Envelope<Value> {
    let start = Instant::now();
    let futs = items
        .into_iter()
        .map(|item| run_stage_with_retry(def, StageInput::Element(item), ctx));
    let results = join_all(futs).await;
    let elapsed_ms = start.elapsed().as_millis() as u64;

    let all_ok = results.iter().all(|r| r.is_success());
    let tokens_used: u64 = results.iter().map(|r| r.tokens_used).sum();

    if all_ok {
        let data: Vec<Value> = results.into_iter().map(|r| r.into_data().unwrap_or(Value::Null)).collect();
        Envelope::success(def.id.clone(), Value::Array(data), elapsed_ms).with_tokens_used(tokens_used)
    } else {
        let failed_count = results.iter().filter(|r| !r.is_success()).count();
        Envelope::failure(
            def.id.clone(),
            format!("{failed_count} of {} fan-out elements failed", results.len()),
            elapsed_ms,
        )
        .with_tokens_used(tokens_used)
    }
}

/// Apply the stage's timeout and orchestration-level retry policy around
/// one (possibly fan-out element) invocation. Never returns an outer
/// `Err` — cancellation, timeout, retry exhaustion and non-retryable
/// errors all become `Envelope::failure`.
async fn run_stage_with_retry(
    def: &StageDefinition,
    input: StageInput,
    ctx: &ExecutionContext,
) -> Envelope<Value> {
    if ctx.is_cancelled() {
        return Envelope::failure(def.id.clone(), "cancelled", 0);
    }

    let mut attempt = 0u32;
    loop {
        let start = Instant::now();
        let outcome = match def.timeout_ms {
            Some(ms) => {
                match tokio::time::timeout(
                    std::time::Duration::from_millis(ms),
                    crate::stage_exec::execute_with_cache(def, input.clone(), ctx),
                )
                .await
                {
                    Ok(inner) => inner,
                    Err(_) => {
                        return Envelope::failure(
                            def.id.clone(),
                            "timeout",
                            start.elapsed().as_millis() as u64,
                        )
                    }
                }
            }
            None => crate::stage_exec::execute_with_cache(def, input.clone(), ctx).await,
        };

        match outcome {
            Ok(envelope) => return envelope,
            Err(e) => {
                let retryable = (def.retry.retryable)(&e);
                if retryable && attempt + 1 < def.retry.max_attempts {
                    let delay = def.retry.delay_for_attempt(attempt);
                    events::emit(
                        ctx.event_handler(),
                        Event::StageRetry {
                            stage: def.id.clone(),
                            attempt: attempt + 1,
                            delay_ms: delay.as_millis() as u64,
                            reason: e.to_string(),
                        },
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                    continue;
                }
                return Envelope::failure(
                    def.id.clone(),
                    e.to_string(),
                    start.elapsed().as_millis() as u64,
                );
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::MemoryCacheBackend;
    use crate::pipeline_def::{PipelineDefinition, StageDefinition, StageRetryPolicy};
    use crate::stage::FnStage;
    use serde_json::json;
    use std::sync::atomic::{AtomicU32, AtomicU64, Ordering as AtomicOrdering};
    use std::sync::Arc;

    fn test_ctx() -> ExecutionContext {
        ExecutionContext::builder("http://test")
            .cache(Arc::new(MemoryCacheBackend::new()))
            .build()
    }

    fn passthrough_stage(name: &str) -> Arc<dyn crate::stage::Stage> {
        let name = name.to_string();
        Arc::new(FnStage::new(name.clone(), move |input, _ctx| {
            let name = name.clone();
            Box::pin(async move { Ok(Envelope::success(name, input.into_value(), 1)) })
        }))
    }

    #[tokio::test]
    async fn test_happy_path_linear_chain() {
        let def = PipelineDefinition::builder("p")
            .add_stage(StageDefinition::new("a", passthrough_stage("a")).build())
            .add_stage(
                StageDefinition::new("b", passthrough_stage("b"))
                    .with_inputs(["a"])
                    .build(),
            )
            .add_stage(
                StageDefinition::new("c", passthrough_stage("c"))
                    .with_inputs(["b"])
                    .build(),
            )
            .build()
            .unwrap();

        let ctx = test_ctx();
        let result = PipelineExecutor::new()
            .execute(&def, json!("seed"), &ctx)
            .await
            .unwrap();

        assert!(result.success);
        assert_eq!(result.outputs.len(), 3);
        for id in ["a", "b", "c"] {
            assert!(result.outputs[id].is_success());
            assert_eq!(result.outputs[id].data(), Some(&json!("seed")));
        }
        assert!(result.failed_stages.is_empty());
    }

    #[tokio::test]
    async fn test_wave_parallelism_timing() {
        // A=[], B=[A], C=[A], D=[B,C]
        let started: Arc<tokio::sync::Mutex<Vec<(String, std::time::Instant)>>> =
            Arc::new(tokio::sync::Mutex::new(Vec::new()));

        fn timed_stage(
            name: &str,
            started: Arc<tokio::sync::Mutex<Vec<(String, std::time::Instant)>>>,
        ) -> Arc<dyn crate::stage::Stage> {
            let name = name.to_string();
            Arc::new(FnStage::new(name.clone(), move |input, _ctx| {
                let name = name.clone();
                let started = started.clone();
                Box::pin(async move {
                    started.lock().await.push((name.clone(), std::time::Instant::now()));
                    tokio::time::sleep(std::time::Duration::from_millis(20)).await;
                    Ok(Envelope::success(name, input.into_value(), 20))
                })
            }))
        }

        let def = PipelineDefinition::builder("p")
            .add_stage(StageDefinition::new("a", timed_stage("a", started.clone())).build())
            .add_stage(
                StageDefinition::new("b", timed_stage("b", started.clone()))
                    .with_inputs(["a"])
                    .build(),
            )
            .add_stage(
                StageDefinition::new("c", timed_stage("c", started.clone()))
                    .with_inputs(["a"])
                    .build(),
            )
            .add_stage(
                StageDefinition::new("d", timed_stage("d", started.clone()))
                    .with_inputs(["b", "c"])
                    .build(),
            )
            .build()
            .unwrap();

        let ctx = test_ctx();
        let result = PipelineExecutor::new()
            .execute(&def, json!(null), &ctx)
            .await
            .unwrap();
        assert!(result.success);

        let log = started.lock().await;
        let t = |name: &str| log.iter().find(|(n, _)| n == name).unwrap().1;
        assert!(t("b") >= t("a"));
        assert!(t("c") >= t("a"));
        let gap = if t("b") > t("c") { t("b") - t("c") } else { t("c") - t("b") };
        assert!(gap < std::time::Duration::from_millis(15), "B and C should start close together: {gap:?}");
        assert!(t("d") >= t("b") && t("d") >= t("c"));
    }

    #[tokio::test]
    async fn test_fan_out_order_preserved() {
        let stage: Arc<dyn crate::stage::Stage> = Arc::new(FnStage::new("f", |input, _ctx| {
            Box::pin(async move {
                let v = input.into_value();
                let s = v.as_str().unwrap().to_string();
                // Reverse-alphabetical elements finish first to exercise ordering.
                let delay_ms = if s == "x" { 30 } else if s == "y" { 15 } else { 0 };
                tokio::time::sleep(std::time::Duration::from_millis(delay_ms)).await;
                Ok(Envelope::success("f", json!(format!("{}!", s)), delay_ms))
            })
        }));

        let def = PipelineDefinition::builder("p")
            .add_stage(StageDefinition::new("seed", passthrough_stage("seed")).build())
            .add_stage(
                StageDefinition::new("f", stage)
                    .with_inputs(["seed"])
                    .with_pattern(ExecutionPattern::FanOut)
                    .build(),
            )
            .build()
            .unwrap();

        let ctx = test_ctx();
        let result = PipelineExecutor::new()
            .execute(&def, json!(["x", "y", "z"]), &ctx)
            .await
            .unwrap();

        assert!(result.success);
        assert_eq!(
            result.outputs["f"].data(),
            Some(&json!(["x!", "y!", "z!"]))
        );
    }

    #[tokio::test]
    async fn test_fail_fast_stops_later_waves() {
        let reached_c = Arc::new(AtomicU32::new(0));
        let c_counter = reached_c.clone();
        let failing: Arc<dyn crate::stage::Stage> = Arc::new(FnStage::new("b", |_input, _ctx| {
            Box::pin(async move { Ok(Envelope::failure("b", "business failure", 1)) })
        }));
        let c_stage: Arc<dyn crate::stage::Stage> = Arc::new(FnStage::new("c", move |input, _ctx| {
            let c_counter = c_counter.clone();
            Box::pin(async move {
                c_counter.fetch_add(1, AtomicOrdering::SeqCst);
                Ok(Envelope::success("c", input.into_value(), 1))
            })
        }));

        let def = PipelineDefinition::builder("p")
            .add_stage(StageDefinition::new("a", passthrough_stage("a")).build())
            .add_stage(
                StageDefinition::new("b", failing)
                    .with_inputs(["a"])
                    .critical(true)
                    .build(),
            )
            .add_stage(
                StageDefinition::new("c", c_stage)
                    .with_inputs(["b"])
                    .build(),
            )
            .build()
            .unwrap();

        let ctx = test_ctx();
        let result = PipelineExecutor::new()
            .execute(&def, json!(null), &ctx)
            .await
            .unwrap();

        assert!(!result.success);
        assert_eq!(result.failed_stages, vec!["b".to_string()]);
        assert_eq!(reached_c.load(AtomicOrdering::SeqCst), 0);
        assert!(result.outputs.contains_key("a"));
        assert!(result.outputs.contains_key("b"));
        assert!(!result.outputs.contains_key("c"));
    }

    #[tokio::test]
    async fn test_non_critical_failure_does_not_abort() {
        let failing: Arc<dyn crate::stage::Stage> = Arc::new(FnStage::new("b", |_input, _ctx| {
            Box::pin(async move { Ok(Envelope::failure("b", "non-critical failure", 1)) })
        }));

        let def = PipelineDefinition::builder("p")
            .add_stage(StageDefinition::new("a", passthrough_stage("a")).build())
            .add_stage(
                StageDefinition::new("b", failing)
                    .with_inputs(["a"])
                    .critical(false)
                    .build(),
            )
            .build()
            .unwrap();

        let ctx = test_ctx();
        let result = PipelineExecutor::new()
            .execute(&def, json!(null), &ctx)
            .await
            .unwrap();

        // `b` failed but wasn't critical, so the run as a whole still
        // reports the failure without a different wave ever existing to
        // abort — overall success tracks whether any stage failed.
        assert!(!result.success);
        assert_eq!(result.failed_stages, vec!["b".to_string()]);
    }

    #[tokio::test]
    async fn test_conditional_skip_absent_from_outputs() {
        let def = PipelineDefinition::builder("p")
            .add_stage(StageDefinition::new("a", passthrough_stage("a")).build())
            .add_stage(
                StageDefinition::new("b", passthrough_stage("b"))
                    .with_pattern(ExecutionPattern::Conditional)
                    .with_condition(|_ctx| false)
                    .build(),
            )
            .build()
            .unwrap();

        let ctx = test_ctx();
        let result = PipelineExecutor::new()
            .execute(&def, json!(null), &ctx)
            .await
            .unwrap();

        assert!(result.success);
        assert!(result.outputs.contains_key("a"));
        assert!(!result.outputs.contains_key("b"));
    }

    #[tokio::test]
    async fn test_fan_out_requires_sequence_is_fatal() {
        let stage = passthrough_stage("f");
        let def = PipelineDefinition::builder("p")
            .add_stage(StageDefinition::new("a", passthrough_stage("a")).build())
            .add_stage(
                StageDefinition::new("f", stage)
                    .with_inputs(["a"])
                    .with_pattern(ExecutionPattern::FanOut)
                    .build(),
            )
            .build()
            .unwrap();

        let ctx = test_ctx();
        // seed resolves to a, whose output is a plain string, not an array.
        let result = PipelineExecutor::new().execute(&def, json!("not-an-array"), &ctx).await;
        assert!(matches!(result, Err(PipelineError::FanOutRequiresSequence(_))));
    }

    #[tokio::test]
    async fn test_retry_then_success() {
        let attempts = Arc::new(AtomicU32::new(0));
        let a = attempts.clone();
        let flaky: Arc<dyn crate::stage::Stage> = Arc::new(FnStage::new("flaky", move |_input, _ctx| {
            let a = a.clone();
            Box::pin(async move {
                let n = a.fetch_add(1, AtomicOrdering::SeqCst);
                if n < 2 {
                    Err(PipelineError::HttpError {
                        status: 503,
                        body: String::new(),
                        retry_after: None,
                    })
                } else {
                    Ok(Envelope::success("flaky", json!("ok"), 1))
                }
            })
        }));

        let def = PipelineDefinition::builder("p")
            .add_stage(
                StageDefinition::new("flaky", flaky)
                    .with_retry(
                        StageRetryPolicy::new(5)
                            .with_initial_delay(std::time::Duration::from_millis(1))
                            .with_max_delay(std::time::Duration::from_millis(5)),
                    )
                    .build(),
            )
            .build()
            .unwrap();

        let ctx = test_ctx();
        let result = PipelineExecutor::new()
            .execute(&def, json!(null), &ctx)
            .await
            .unwrap();

        assert!(result.success);
        assert_eq!(result.outputs["flaky"].data(), Some(&json!("ok")));
        assert_eq!(attempts.load(AtomicOrdering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_retry_exhaustion_reports_failure_not_fatal() {
        let always_fails: Arc<dyn crate::stage::Stage> =
            Arc::new(FnStage::new("always", |_input, _ctx| {
                Box::pin(async move {
                    Err(PipelineError::HttpError {
                        status: 500,
                        body: String::new(),
                        retry_after: None,
                    })
                })
            }));

        let def = PipelineDefinition::builder("p")
            .add_stage(
                StageDefinition::new("always", always_fails)
                    .with_retry(
                        StageRetryPolicy::new(2)
                            .with_initial_delay(std::time::Duration::from_millis(1)),
                    )
                    .build(),
            )
            .build()
            .unwrap();

        let ctx = test_ctx();
        let result = PipelineExecutor::new()
            .execute(&def, json!(null), &ctx)
            .await
            .unwrap();

        assert!(!result.success);
        assert!(!result.outputs["always"].is_success());
    }

    #[tokio::test]
    async fn test_timeout_produces_failure_without_retry() {
        let attempts = Arc::new(AtomicU64::new(0));
        let a = attempts.clone();
        let slow: Arc<dyn crate::stage::Stage> = Arc::new(FnStage::new("slow", move |_input, _ctx| {
            let a = a.clone();
            Box::pin(async move {
                a.fetch_add(1, AtomicOrdering::SeqCst);
                tokio::time::sleep(std::time::Duration::from_millis(50)).await;
                Ok(Envelope::success("slow", json!("done"), 50))
            })
        }));

        let def = PipelineDefinition::builder("p")
            .add_stage(
                StageDefinition::new("slow", slow)
                    .with_timeout_ms(5)
                    .with_retry(StageRetryPolicy::new(3))
                    .build(),
            )
            .build()
            .unwrap();

        let ctx = test_ctx();
        let result = PipelineExecutor::new()
            .execute(&def, json!(null), &ctx)
            .await
            .unwrap();

        assert!(!result.success);
        assert_eq!(result.outputs["slow"].error(), Some("timeout"));
        assert_eq!(attempts.load(AtomicOrdering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_cache_hit_metric_and_no_recompute() {
        let counter = Arc::new(AtomicU32::new(0));
        let c = counter.clone();
        let stage: Arc<dyn crate::stage::Stage> = Arc::new(FnStage::new("h", move |input, _ctx| {
            let c = c.clone();
            Box::pin(async move {
                c.fetch_add(1, AtomicOrdering::SeqCst);
                Ok(Envelope::success("h", input.into_value(), 1))
            })
        }));

        let def = PipelineDefinition::builder("p")
            .add_stage(
                StageDefinition::new("h", stage)
                    .with_cache_key_fn(|v| v.clone())
                    .with_cache_version("1")
                    .build(),
            )
            .build()
            .unwrap();

        let ctx = test_ctx();
        let executor = PipelineExecutor::new();
        executor.execute(&def, json!("x"), &ctx).await.unwrap();
        let second = executor.execute(&def, json!("x"), &ctx).await.unwrap();

        assert!(second.outputs["h"].metadata.get("from_cache") == Some(&json!(true)));
        assert_eq!(counter.load(AtomicOrdering::SeqCst), 1);
        assert_eq!(second.metrics.get("h_from_cache"), Some(&1.0));
    }
}
