//! # Pipeline Orchestrator
//!
//! A declarative multi-stage pipeline orchestrator for LLM agent workflows:
//! dependency-ordered wave scheduling, content-addressed caching, and an
//! iterative plan/validate/judge/revise agent controller.
//!
//! ## Core Concepts
//!
//! - **[`Payload`]** — object-safe trait for a single executable unit
//!   (an LLM call or a sequential chain of them). Takes a `serde_json::Value`
//!   input, returns a [`PayloadOutput`].
//! - **[`Stage`]** — the DAG node abstraction the executor schedules. Any
//!   `Payload` adapts into a `Stage`; stages can also be plain async
//!   closures via [`stage::FnStage`].
//! - **[`PipelineDefinition`]** — a validated, wave-scheduled DAG of
//!   [`StageDefinition`]s, built through [`PipelineDefinitionBuilder`].
//! - **[`PipelineExecutor`]** — runs a `PipelineDefinition` wave by wave,
//!   with retry, timeout, fan-out, and fail-fast semantics.
//! - **[`ExecutionContext`]** — shared run state: HTTP client, backend,
//!   cache, cancellation, event handler, and a scratch key/value bag.
//! - **[`Envelope`]** — the immutable success/failure result every stage
//!   produces.
//! - **[`cache::CacheBackend`]** — content-addressed artifact storage keyed
//!   by `(stage_id, cache_version, input_fingerprint)`.
//! - **[`agent::AgentController`]** — drives an iterative planner/judge loop
//!   for stages whose output needs more than one LLM turn to converge.
//!
//! ## Quick Start (Payload API)
//!
//! ```no_run
//! use pipeline_orchestrator::{LlmCall, Chain, ExecCtx};
//! use pipeline_orchestrator::payload::Payload;
//! use serde::Deserialize;
//! use serde_json::json;
//!
//! #[derive(Debug, Deserialize)]
//! struct Analysis { summary: String }
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let ctx = ExecCtx::builder("http://localhost:11434").build();
//!
//!     let chain = Chain::new("analyze")
//!         .push(Box::new(
//!             LlmCall::new("draft", "Analyze: {input}")
//!                 .with_config(pipeline_orchestrator::LlmConfig::default().with_json_mode(true))
//!         ))
//!         .push(Box::new(
//!             LlmCall::new("refine", "Refine this analysis: {input}")
//!                 .with_config(pipeline_orchestrator::LlmConfig::default().with_json_mode(true))
//!         ));
//!
//!     let output = chain.execute(&ctx, json!("Your text here")).await?;
//!     let result: Analysis = output.parse_as()?;
//!     println!("{}", result.summary);
//!     Ok(())
//! }
//! ```
//!
//! ## Quick Start (Pipeline API)
//!
//! ```no_run
//! use pipeline_orchestrator::{ExecutionContext, PipelineDefinitionBuilder, PipelineExecutor, StageDefinitionBuilder};
//! use pipeline_orchestrator::stage::FnStage;
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let ctx = ExecutionContext::builder("http://localhost:11434").build();
//!
//!     let fetch = StageDefinitionBuilder::new(
//!         "fetch",
//!         Arc::new(FnStage::new("fetch", |input, _ctx| {
//!             Box::pin(async move {
//!                 Ok(pipeline_orchestrator::Envelope::success("fetch", input.into_value(), 0))
//!             })
//!         })),
//!     )
//!     .build();
//!
//!     let pipeline = PipelineDefinitionBuilder::new("demo").add_stage(fetch).build()?;
//!
//!     let result = PipelineExecutor::new()
//!         .execute(&pipeline, serde_json::json!("seed"), &ctx)
//!         .await;
//!     println!("success: {}", result.success);
//!     Ok(())
//! }
//! ```

pub mod agent;
pub mod backend;
pub mod cache;
pub mod chain;
pub mod client;
pub mod context;
pub mod diagnostics;
pub mod envelope;
pub mod error;
pub mod events;
pub mod exec_ctx;
pub mod executor;
pub mod llm_call;
pub mod output_parser;
pub mod output_strategy;
pub mod parsing;
pub mod payload;
pub mod pipeline_def;
pub mod prompt;
pub mod retry;
pub mod stage;
pub mod stage_exec;
pub mod streaming;
pub mod types;

// --- Payload layer ---
pub use backend::{BackoffConfig, MockBackend, OllamaBackend};
#[cfg(feature = "openai")]
pub use backend::OpenAiBackend;
pub use chain::Chain;
pub use client::LlmConfig;
pub use diagnostics::ParseDiagnostics;
pub use exec_ctx::{ExecCtx, ExecCtxBuilder};
pub use llm_call::LlmCall;
pub use output_strategy::OutputStrategy;
pub use payload::{BoxFut, Payload, PayloadOutput};
pub use retry::RetryConfig;
pub use streaming::StreamingDecoder;

// --- Pipeline orchestration layer ---
pub use cache::CacheBackend;
pub use context::{ExecutionContext, ExecutionContextBuilder};
pub use envelope::Envelope;
pub use error::{PipelineError, Result};
pub use executor::{PipelineExecutor, PipelineResult};
pub use pipeline_def::{
    ExecutionPattern, PipelineDefinition, PipelineDefinitionBuilder, StageDefinition,
    StageDefinitionBuilder, StageRetryPolicy,
};
pub use stage::{Stage, StageInput};
pub use types::PipelineContext;

// --- Agent controller layer ---
pub use agent::{AgentController, AgentControllerConfig, AgentOutcome, AgentState};
