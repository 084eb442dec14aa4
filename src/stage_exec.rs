//! Stage execution helper: wraps a single stage invocation with cache
//! lookup, cache store, and metrics/event side effects.

use std::time::Instant;

use crate::context::ExecutionContext;
use crate::envelope::Envelope;
use crate::error::Result;
use crate::events::{self, Event};
use crate::pipeline_def::StageDefinition;
use crate::stage::StageInput;

/// Execute one stage invocation, consulting the cache first when the
/// stage declares a `cache_key_fn`.
///
/// Cache errors (read or write) are logged via the event handler and
/// treated as a miss (read) or no-op (write) — never fatal, per the
/// cache backend's error-handling contract.
///
/// The outer `Result` here is reserved for the same fatal/programmer-error
/// channel as `Stage::execute` itself; the executor applies retry/timeout
/// around this call.
pub async fn execute_with_cache(
    def: &StageDefinition,
    input: StageInput,
    ctx: &ExecutionContext,
) -> Result<Envelope<serde_json::Value>> {
    let fingerprint = def.cache_key_fn.as_ref().map(|key_fn| {
        let key = key_fn(&input.as_value());
        crate::cache::Fingerprint::compute(&def.id, &def.cache_version, &key)
    });

    if let Some(fp) = &fingerprint {
        match ctx.cache.load(fp, &def.cache_policy).await {
            Ok(Some(artifact)) => {
                events::emit(
                    ctx.event_handler(),
                    Event::CacheHit {
                        stage: def.id.clone(),
                    },
                );
                ctx.add_metric(format!("{}_from_cache", def.id), 1.0).await;
                return Ok(Envelope::success(def.id.clone(), artifact, 0)
                    .with_metadata("from_cache", true));
            }
            Ok(None) => {
                events::emit(
                    ctx.event_handler(),
                    Event::CacheMiss {
                        stage: def.id.clone(),
                    },
                );
            }
            Err(_) => {
                // Cache read failed: treat as miss, per the backend contract.
                events::emit(
                    ctx.event_handler(),
                    Event::CacheMiss {
                        stage: def.id.clone(),
                    },
                );
            }
        }
    }

    let start = Instant::now();
    let envelope = def.stage.execute(input, ctx).await?;
    let elapsed_ms = start.elapsed().as_millis() as u64;

    if envelope.is_success() {
        if let (Some(fp), Some(artifact)) = (&fingerprint, envelope.data()) {
            // Store errors are non-fatal; a failed write just means the
            // next run recomputes.
            let _ = ctx.cache.store(fp, artifact, Some(elapsed_ms)).await;
        }
        Ok(envelope.with_metadata("from_cache", false))
    } else {
        Ok(envelope)
    }
}
