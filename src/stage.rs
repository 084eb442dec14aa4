//! Stage contract — the uniform, object-safe operation the executor drives.
//!
//! A [`Stage`] is a polymorphic asynchronous operation with a stable `name`
//! and `execute(input, context) -> Result<Envelope>`. No inheritance is
//! required — any type with those two things qualifies, the same
//! structural-typing spirit as [`Payload`](crate::payload::Payload). The
//! outer `Result` is reserved for fatal/programmer errors (see
//! [`PipelineError`]); recoverable business failure is represented inside
//! the returned [`Envelope`] via `Envelope::failure`.

use crate::context::ExecutionContext;
use crate::envelope::Envelope;
use crate::error::Result;
use crate::payload::{BoxFut, Payload};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

/// The resolved input handed to a stage invocation.
///
/// Built by the executor from the declared `inputs` of a `StageDefinition`:
/// a single upstream id resolves to `Single`, two or more resolve to
/// `Multi` (keyed by upstream id), and a `FAN_OUT` invocation resolves to
/// one `Element` per item of the declared sequence.
#[derive(Debug, Clone)]
pub enum StageInput {
    /// Exactly one declared input.
    Single(Value),
    /// Two or more declared inputs, keyed by upstream stage id.
    Multi(HashMap<String, Value>),
    /// One element of a fan-out sequence.
    Element(Value),
}

impl StageInput {
    /// Collapse the input into a single JSON value for stages that don't
    /// care about the distinction (e.g. LLM payloads that prompt-template
    /// off a single value).
    pub fn into_value(self) -> Value {
        match self {
            StageInput::Single(v) | StageInput::Element(v) => v,
            StageInput::Multi(m) => Value::Object(m.into_iter().collect()),
        }
    }

    /// Borrow the input as a single JSON value without consuming it.
    pub fn as_value(&self) -> Value {
        match self {
            StageInput::Single(v) | StageInput::Element(v) => v.clone(),
            StageInput::Multi(m) => Value::Object(m.clone().into_iter().collect()),
        }
    }
}

/// The uniform asynchronous operation the pipeline executor schedules.
///
/// Implementations MUST NOT raise (return an outer `Err`) to report
/// ordinary business failure — that belongs in `Envelope::failure`. The
/// outer `Err` channel is reserved for invariant violations that should
/// abort the entire pipeline (see `PipelineExecutor::execute`).
pub trait Stage: Send + Sync {
    /// Stable identifier used for metrics, cache keys, and log correlation.
    fn name(&self) -> &str;

    /// Execute the stage against a resolved input and the run's context.
    fn execute<'a>(
        &'a self,
        input: StageInput,
        ctx: &'a ExecutionContext,
    ) -> BoxFut<'a, Result<Envelope<Value>>>;
}

/// Adapts any existing [`Payload`] (an `LlmCall`, a `Chain`, or a custom
/// implementation) into a [`Stage`], so LLM-call and chain payloads can be
/// used directly as DAG nodes without rewriting them.
impl Stage for Box<dyn Payload> {
    fn name(&self) -> &str {
        Payload::name(self.as_ref())
    }

    fn execute<'a>(
        &'a self,
        input: StageInput,
        ctx: &'a ExecutionContext,
    ) -> BoxFut<'a, Result<Envelope<Value>>> {
        let stage_name = Payload::name(self.as_ref()).to_string();
        Box::pin(async move {
            let start = Instant::now();
            let value = input.into_value();
            match self.invoke(&ctx.inner, value).await {
                Ok(out) => Ok(Envelope::success(
                    stage_name,
                    out.value,
                    start.elapsed().as_millis() as u64,
                )),
                Err(e) => Ok(Envelope::failure(
                    stage_name,
                    e.to_string(),
                    start.elapsed().as_millis() as u64,
                )),
            }
        })
    }
}

/// Type alias for the closure signature used by [`FnStage`].
pub type StageFn = Arc<
    dyn for<'a> Fn(StageInput, &'a ExecutionContext) -> BoxFut<'a, Result<Envelope<Value>>>
        + Send
        + Sync,
>;

/// A [`Stage`] backed by a plain async closure.
///
/// Useful for deterministic/CPU stages (audio analysis, transforms) that
/// don't need the full `Payload` machinery — mirrors the
/// [`FnEventHandler`](crate::events::FnEventHandler) closure-wrapper idiom
/// already used in this crate.
#[derive(Clone)]
pub struct FnStage {
    name: String,
    f: StageFn,
}

impl FnStage {
    /// Wrap a closure as a stage. The closure receives the resolved input
    /// and the execution context, and must return a boxed future resolving
    /// to `Result<Envelope<Value>>`.
    pub fn new(
        name: impl Into<String>,
        f: impl for<'a> Fn(StageInput, &'a ExecutionContext) -> BoxFut<'a, Result<Envelope<Value>>>
            + Send
            + Sync
            + 'static,
    ) -> Self {
        Self {
            name: name.into(),
            f: Arc::new(f),
        }
    }
}

impl Stage for FnStage {
    fn name(&self) -> &str {
        &self.name
    }

    fn execute<'a>(
        &'a self,
        input: StageInput,
        ctx: &'a ExecutionContext,
    ) -> BoxFut<'a, Result<Envelope<Value>>> {
        (self.f)(input, ctx)
    }
}
