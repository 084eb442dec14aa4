use std::time::Duration;
use thiserror::Error;

/// Errors produced by the pipeline and its components.
#[derive(Error, Debug)]
pub enum PipelineError {
    /// Low-level HTTP transport failure (connection refused, timeout, etc.).
    #[error("HTTP request failed: {0}")]
    Request(#[from] reqwest::Error),

    /// JSON parsing failed at the serde level.
    #[error("JSON parsing failed: {0}")]
    Json(#[from] serde_json::Error),

    /// A pipeline stage failed with a descriptive message.
    #[error("Stage '{stage}' failed: {message}")]
    StageFailed { stage: String, message: String },

    /// The pipeline or payload was cancelled via the cancellation flag.
    #[error("Pipeline was cancelled")]
    Cancelled,

    /// Invalid configuration detected at build time.
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// HTTP error with status code, response body, and optional Retry-After hint.
    ///
    /// Returned by [`Backend`](crate::backend::Backend) implementations when
    /// the provider returns a non-success status code. The `retry_after` field
    /// is populated from the `Retry-After` response header when present.
    #[error("HTTP {status}: {body}")]
    HttpError {
        /// HTTP status code (e.g. 429, 500, 503).
        status: u16,
        /// Response body text.
        body: String,
        /// Parsed `Retry-After` header value, if present.
        retry_after: Option<Duration>,
    },

    /// A stage invocation exceeded its configured timeout.
    #[error("Stage '{stage}' timed out after {elapsed_ms}ms")]
    Timeout { stage: String, elapsed_ms: u64 },

    /// Pipeline definition validation found a cycle in the stage graph.
    #[error("Cycle detected in pipeline definition involving stage '{0}'")]
    CycleDetected(String),

    /// A `StageDefinition` declared an input that no other stage defines.
    #[error("Stage '{referenced_by}' declares unknown input '{input_id}'")]
    UnknownStageRef {
        referenced_by: String,
        input_id: String,
    },

    /// Two stage definitions share the same id.
    #[error("Duplicate stage id: '{0}'")]
    DuplicateStageId(String),

    /// A `CONDITIONAL` stage was declared without a condition predicate.
    #[error("Stage '{0}' has pattern CONDITIONAL but no condition predicate")]
    ConditionRequired(String),

    /// A `FAN_OUT` stage's resolved input was not a JSON array.
    #[error("Stage '{0}' has pattern FAN_OUT but its resolved input is not a sequence")]
    FanOutRequiresSequence(String),

    /// The iterative agent controller exhausted its token budget without
    /// reaching an approved artifact.
    #[error("Agent controller exhausted its token budget ({used}/{budget})")]
    BudgetExhausted { used: u64, budget: u64 },

    /// A cache backend read or write failed. Always non-fatal by policy
    /// (see `stage_exec::execute_with_cache`); kept here for callers that
    /// want to log or surface it explicitly.
    #[error("Cache error: {0}")]
    CacheError(String),

    /// Catch-all for other errors.
    #[error("{0}")]
    Other(String),
}

impl From<anyhow::Error> for PipelineError {
    fn from(err: anyhow::Error) -> Self {
        PipelineError::Other(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, PipelineError>;
