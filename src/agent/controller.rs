//! Iterative Agent Controller — drives an LLM agent through a
//! plan → validate → judge → revise loop until acceptance, budget
//! exhaustion, or the iteration ceiling.
//!
//! Concrete prompts, judge rubrics, and schema validation rules are left
//! to callers (see [`Planner`], [`Validator`], [`Judge`]); this module owns
//! only the state machine, feedback shaping, token accounting, and
//! termination policy.

use std::sync::Arc;

use serde_json::Value;

use crate::cache::{Clock, SystemClock};
use crate::context::ExecutionContext;
use crate::error::Result;
use crate::events::{self, Event};

use super::feedback::{FeedbackManager, FeedbackType};
use super::provider::LLMProvider;
use super::verdict::{Verdict, VerdictStatus, VerdictThresholds};

/// States of the controller's run loop. Terminal states are `Succeeded`,
/// `Failed`, `BudgetExhausted`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AgentState {
    Planning,
    Validating,
    Judging,
    Revising,
    Succeeded,
    Failed,
    BudgetExhausted,
}

impl AgentState {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            AgentState::Succeeded | AgentState::Failed | AgentState::BudgetExhausted
        )
    }
}

impl std::fmt::Display for AgentState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{self:?}")
    }
}

/// A structured correction request handed back to the planner on
/// `REVISING`/`PLANNING` re-entry.
#[derive(Debug, Clone)]
pub struct RevisionRequest {
    pub priority: String,
    pub focus_areas: Vec<String>,
    pub specific_fixes: Vec<String>,
    pub avoid: Vec<String>,
    pub context_for_next_attempt: String,
}

impl RevisionRequest {
    /// Chosen within the spec's named 15–25 range and enforced identically
    /// on both the model and the truncation logic below (see the Open
    /// Question decision in the design ledger).
    pub const MAX_ITEMS: usize = 20;

    /// Build a revision request from a flat list of fix strings (validator
    /// errors or a verdict's `required_fixes`), truncating to at most
    /// `MAX_ITEMS`. Truncation is FIFO of the oldest entries beyond the
    /// cap — the most recent fixes are the ones kept.
    fn from_fixes(fixes: &[String], priority: &str, context: impl Into<String>) -> Self {
        let mut truncated = false;
        let specific_fixes = if fixes.len() > Self::MAX_ITEMS {
            truncated = true;
            fixes[fixes.len() - Self::MAX_ITEMS..].to_vec()
        } else {
            fixes.to_vec()
        };

        let mut focus_areas: Vec<String> = specific_fixes.iter().take(3).cloned().collect();
        if truncated {
            focus_areas.push(format!(
                "...and {} earlier fix(es) omitted for length",
                fixes.len() - Self::MAX_ITEMS
            ));
        }

        Self {
            priority: priority.to_string(),
            focus_areas,
            specific_fixes,
            avoid: Vec::new(),
            context_for_next_attempt: context.into(),
        }
    }
}

/// Per-run transient state tracked across the loop, surfaced in full on
/// [`AgentOutcome`].
#[derive(Debug, Clone)]
pub struct IterationState {
    pub iteration_count: u32,
    pub total_tokens_used: u64,
    pub verdict_history: Vec<Verdict>,
    pub best_artifact: Option<Value>,
    pub best_score: Option<f64>,
    pub termination_reason: Option<String>,
    pub conversation_id: Option<String>,
}

/// The result of a full controller run.
#[derive(Debug, Clone)]
pub struct AgentOutcome {
    pub state: AgentState,
    /// The accepted artifact on `Succeeded`; the best-scoring
    /// best-effort candidate on a non-approving terminal state if any
    /// verdict recorded a non-zero score; `None` otherwise.
    pub artifact: Option<Value>,
    pub iteration: IterationState,
}

impl AgentOutcome {
    pub fn is_success(&self) -> bool {
        self.state == AgentState::Succeeded
    }
}

/// Tunables for one controller run, mirroring the crate's
/// builder-method configuration idiom (`ExecCtxBuilder`, `StageDefinition`).
#[derive(Clone)]
pub struct AgentControllerConfig {
    pub max_iterations: u32,
    pub token_budget: u64,
    pub thresholds: VerdictThresholds,
    /// Max estimated tokens of feedback history injected per prompt.
    pub feedback_window_tokens: usize,
    pub model: String,
    pub system_prompt: Option<String>,
    pub temperature: Option<f64>,
}

impl Default for AgentControllerConfig {
    fn default() -> Self {
        Self {
            max_iterations: 5,
            token_budget: 50_000,
            thresholds: VerdictThresholds::default(),
            feedback_window_tokens: 2_000,
            model: "default".to_string(),
            system_prompt: None,
            temperature: None,
        }
    }
}

impl AgentControllerConfig {
    pub fn with_max_iterations(mut self, n: u32) -> Self {
        self.max_iterations = n;
        self
    }

    pub fn with_token_budget(mut self, budget: u64) -> Self {
        self.token_budget = budget;
        self
    }

    pub fn with_thresholds(mut self, thresholds: VerdictThresholds) -> Self {
        self.thresholds = thresholds;
        self
    }

    pub fn with_feedback_window_tokens(mut self, tokens: usize) -> Self {
        self.feedback_window_tokens = tokens;
        self
    }

    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = model.into();
        self
    }

    pub fn with_system_prompt(mut self, prompt: impl Into<String>) -> Self {
        self.system_prompt = Some(prompt.into());
        self
    }

    pub fn with_temperature(mut self, t: f64) -> Self {
        self.temperature = Some(t);
        self
    }
}

/// Produces candidate artifacts and parses planner responses. Concrete
/// prompt text and output schema are entirely the caller's concern — the
/// controller only needs a `Value` back.
pub trait Planner: Send + Sync {
    /// Build the user-turn prompt for a planning/revision call. `revision`
    /// is `None` on the very first planning call.
    fn build_prompt(&self, input: &Value, revision: Option<&RevisionRequest>) -> String;

    /// Parse the raw model response into a candidate artifact. An `Err`
    /// here is treated as a schema-invalid response.
    fn parse_response(&self, raw: &str) -> Result<Value>;
}

/// Pure structural/semantic validation of a candidate artifact. Not an LLM
/// call — e.g. JSON-schema conformance, required-field checks.
pub trait Validator: Send + Sync {
    /// Empty vec means the candidate is valid.
    fn validate(&self, artifact: &Value) -> Vec<String>;
}

/// A judge's raw (pre-normalization) assessment, as parsed from the
/// model's response.
#[derive(Debug, Clone)]
pub struct JudgeOutput {
    pub status: VerdictStatus,
    pub score: Option<f64>,
    pub notes: String,
    pub required_fixes: Vec<String>,
}

/// Produces the judge-turn prompt and parses its response. Scoring
/// rubrics are the caller's concern; the controller normalizes the result
/// against its configured thresholds regardless of what's reported here.
pub trait Judge: Send + Sync {
    fn build_prompt(&self, artifact: &Value) -> String;
    fn parse_response(&self, raw: &str) -> Result<JudgeOutput>;
}

/// Drives one [`Planner`]/[`Validator`]/[`Judge`] triple through the
/// iterative loop against an [`LLMProvider`].
pub struct AgentController<P: Planner, V: Validator, J: Judge> {
    provider: Arc<dyn LLMProvider>,
    planner: P,
    validator: V,
    judge: J,
    config: AgentControllerConfig,
    clock: Arc<dyn Clock>,
}

impl<P: Planner, V: Validator, J: Judge> AgentController<P, V, J> {
    pub fn new(provider: Arc<dyn LLMProvider>, planner: P, validator: V, judge: J, config: AgentControllerConfig) -> Self {
        Self {
            provider,
            planner,
            validator,
            judge,
            config,
            clock: Arc::new(SystemClock),
        }
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Run the controller to a terminal state against `input`.
    pub async fn run(&self, input: Value, ctx: &ExecutionContext) -> Result<AgentOutcome> {
        let mut feedback = FeedbackManager::new();
        let mut state = AgentState::Planning;
        let mut iteration_count: u32 = 0;
        let mut total_tokens: u64 = 0;
        let mut verdict_history: Vec<Verdict> = Vec::new();
        let mut best_artifact: Option<Value> = None;
        let mut best_score: Option<f64> = None;
        let mut current_artifact: Option<Value> = None;
        let mut conversation_id: Option<String> = None;
        let mut pending_revision: Option<RevisionRequest> = None;
        let mut termination_reason: Option<String> = None;

        loop {
            if ctx.is_cancelled() {
                termination_reason = Some("cancelled".to_string());
                state = AgentState::Failed;
                break;
            }
            if total_tokens >= self.config.token_budget {
                events::emit(
                    ctx.event_handler(),
                    Event::BudgetWarning {
                        conversation_id: conversation_id.clone().unwrap_or_default(),
                        used: total_tokens,
                        budget: self.config.token_budget,
                    },
                );
                termination_reason = Some(format!(
                    "token budget exhausted ({total_tokens}/{})",
                    self.config.token_budget
                ));
                state = AgentState::BudgetExhausted;
                break;
            }

            match state {
                AgentState::Planning => {
                    if iteration_count >= self.config.max_iterations {
                        termination_reason = Some(format!(
                            "iteration ceiling reached ({iteration_count} >= {})",
                            self.config.max_iterations
                        ));
                        state = AgentState::Failed;
                        break;
                    }
                    iteration_count += 1;
                    conversation_id = None; // a fresh PLANNING entry always starts a new conversation
                    let prompt = self.planner.build_prompt(&input, pending_revision.as_ref());
                    let resp = self
                        .provider
                        .generate_structured_in_conversation(
                            &prompt,
                            None,
                            &self.config.model,
                            self.config.system_prompt.as_deref(),
                            self.config.temperature,
                        )
                        .await?;
                    total_tokens += resp.usage.total;
                    conversation_id = resp.conversation_id;

                    match self.planner.parse_response(&resp.content) {
                        Ok(artifact) => {
                            current_artifact = Some(artifact);
                            self.transition(ctx, &conversation_id, state, AgentState::Validating);
                            state = AgentState::Validating;
                        }
                        Err(e) => {
                            feedback.add(
                                FeedbackType::SchemaInvalid,
                                e.to_string(),
                                iteration_count,
                                self.clock.now_unix(),
                            );
                            pending_revision = Some(RevisionRequest::from_fixes(
                                &[e.to_string()],
                                "fix schema violation",
                                "the previous response could not be parsed",
                            ));
                            self.transition(ctx, &conversation_id, state, AgentState::Planning);
                            state = AgentState::Planning;
                        }
                    }
                }

                AgentState::Revising => {
                    let prompt = self.planner.build_prompt(&input, pending_revision.as_ref());
                    let resp = self
                        .provider
                        .generate_structured_in_conversation(
                            &prompt,
                            conversation_id.as_deref(),
                            &self.config.model,
                            self.config.system_prompt.as_deref(),
                            self.config.temperature,
                        )
                        .await?;
                    total_tokens += resp.usage.total;
                    conversation_id = resp.conversation_id;

                    match self.planner.parse_response(&resp.content) {
                        Ok(artifact) => {
                            current_artifact = Some(artifact);
                            self.transition(ctx, &conversation_id, state, AgentState::Validating);
                            state = AgentState::Validating;
                        }
                        Err(e) => {
                            feedback.add(
                                FeedbackType::SchemaInvalid,
                                e.to_string(),
                                iteration_count,
                                self.clock.now_unix(),
                            );
                            pending_revision = Some(RevisionRequest::from_fixes(
                                &[e.to_string()],
                                "fix schema violation",
                                "the previous revision could not be parsed",
                            ));
                            // Stays in the same conversation; REVISING loops
                            // back through VALIDATING's entry point.
                            self.transition(ctx, &conversation_id, state, AgentState::Revising);
                        }
                    }
                }

                AgentState::Validating => {
                    let artifact = current_artifact.as_ref().expect("validating requires a candidate");
                    let errors = self.validator.validate(artifact);
                    if errors.is_empty() {
                        self.transition(ctx, &conversation_id, state, AgentState::Judging);
                        state = AgentState::Judging;
                    } else {
                        for e in &errors {
                            feedback.add(
                                FeedbackType::ValidationFailure,
                                e.clone(),
                                iteration_count,
                                self.clock.now_unix(),
                            );
                        }
                        pending_revision = Some(RevisionRequest::from_fixes(
                            &errors,
                            "fix validation errors",
                            feedback.get_for_prompt(self.config.feedback_window_tokens, None),
                        ));
                        self.transition(ctx, &conversation_id, state, AgentState::Revising);
                        state = AgentState::Revising;
                    }
                }

                AgentState::Judging => {
                    let artifact = current_artifact.as_ref().expect("judging requires a candidate");
                    let prompt = self.judge.build_prompt(artifact);
                    let messages = vec![crate::backend::ChatMessage {
                        role: crate::backend::Role::User,
                        content: prompt,
                    }];
                    let resp = self
                        .provider
                        .generate_structured(&messages, &self.config.model, self.config.temperature)
                        .await?;
                    total_tokens += resp.usage.total;

                    let raw = self.judge.parse_response(&resp.content)?;
                    let verdict = self.config.thresholds.normalize(
                        raw.status,
                        raw.score,
                        raw.notes.clone(),
                        raw.required_fixes.clone(),
                    );
                    if verdict.was_normalized {
                        events::emit(
                            ctx.event_handler(),
                            Event::VerdictNormalized {
                                conversation_id: conversation_id.clone().unwrap_or_default(),
                                reported_status: format!("{:?}", raw.status),
                                normalized_status: format!("{:?}", verdict.status),
                            },
                        );
                    }

                    if let Some(score) = verdict.score {
                        if best_score.map_or(true, |b| score > b) {
                            best_score = Some(score);
                            best_artifact = current_artifact.clone();
                        }
                    }
                    verdict_history.push(verdict.clone());

                    match verdict.status {
                        VerdictStatus::Approve => {
                            best_artifact = current_artifact.clone();
                            termination_reason = Some(format!(
                                "approved at iteration {iteration_count} (score {:?})",
                                verdict.score
                            ));
                            self.transition(ctx, &conversation_id, state, AgentState::Succeeded);
                            state = AgentState::Succeeded;
                        }
                        VerdictStatus::SoftFail => {
                            feedback.add(
                                FeedbackType::JudgeSoftFailure,
                                verdict.notes.clone(),
                                iteration_count,
                                self.clock.now_unix(),
                            );
                            pending_revision = Some(RevisionRequest::from_fixes(
                                &verdict.required_fixes,
                                "address judge feedback (refinement)",
                                feedback.get_for_prompt(self.config.feedback_window_tokens, None),
                            ));
                            self.transition(ctx, &conversation_id, state, AgentState::Revising);
                            state = AgentState::Revising;
                        }
                        VerdictStatus::HardFail => {
                            feedback.add(
                                FeedbackType::JudgeHardFailure,
                                verdict.notes.clone(),
                                iteration_count,
                                self.clock.now_unix(),
                            );
                            pending_revision = Some(RevisionRequest::from_fixes(
                                &verdict.required_fixes,
                                "address judge feedback (replan)",
                                feedback.get_for_prompt(self.config.feedback_window_tokens, None),
                            ));
                            conversation_id = None;
                            self.transition(ctx, &conversation_id, state, AgentState::Planning);
                            state = AgentState::Planning;
                        }
                    }
                }

                AgentState::Succeeded | AgentState::Failed | AgentState::BudgetExhausted => break,
            }
        }

        let artifact = match state {
            AgentState::Succeeded => current_artifact,
            _ if best_score.is_some() => best_artifact.clone(),
            _ => None,
        };

        Ok(AgentOutcome {
            state,
            artifact,
            iteration: IterationState {
                iteration_count,
                total_tokens_used: total_tokens,
                verdict_history,
                best_artifact,
                best_score,
                termination_reason,
                conversation_id,
            },
        })
    }

    fn transition(
        &self,
        ctx: &ExecutionContext,
        conversation_id: &Option<String>,
        from: AgentState,
        to: AgentState,
    ) {
        events::emit(
            ctx.event_handler(),
            Event::AgentStateTransition {
                conversation_id: conversation_id.clone().unwrap_or_default(),
                from: from.to_string(),
                to: to.to_string(),
            },
        );
    }
}
