//! Iterative LLM agent controller: plan, validate, judge, revise.
//!
//! This module is independent of the wave executor in [`crate::executor`] —
//! an `AgentController` is typically driven from inside a [`crate::stage::Stage`]
//! implementation, with its resulting artifact returned as that stage's
//! envelope data, so a pipeline can mix plain deterministic stages with
//! agentic ones in the same DAG.

pub mod controller;
pub mod feedback;
pub mod provider;
pub mod verdict;

pub use controller::{
    AgentController, AgentControllerConfig, AgentOutcome, AgentState, IterationState, Judge,
    JudgeOutput, Planner, RevisionRequest, Validator,
};
pub use feedback::{FeedbackEntry, FeedbackManager, FeedbackType};
pub use provider::{BackendLLMProvider, GeneratedResponse, LLMProvider, Usage};
pub use verdict::{Verdict, VerdictStatus, VerdictThresholds};
