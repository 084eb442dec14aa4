//! Result Envelope — the immutable success/failure carrier every stage
//! produces, and the sole protocol of communication across waves.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;

use crate::error::Result;
use crate::PipelineError;

/// Immutable, typed success/failure carrier.
///
/// Invariant: `success == (data.is_some() && error.is_none())`. Only
/// constructible via [`Envelope::success`]/[`Envelope::failure`], so the
/// invariant can never be broken after construction — the same approach
/// this crate already takes with [`PayloadOutput`](crate::payload::PayloadOutput)
/// and [`BackoffConfig`](crate::backend::BackoffConfig).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Envelope<T = Value> {
    success: bool,
    data: Option<T>,
    error: Option<String>,
    /// Name of the stage that produced this envelope.
    pub stage_name: String,
    /// Wall-clock duration of the invocation, in milliseconds.
    pub duration_ms: u64,
    /// Tokens consumed by the invocation, if applicable. Zero otherwise.
    pub tokens_used: u64,
    /// Free-form side-channel metadata (from_cache, iterations, score, ...).
    #[serde(default)]
    pub metadata: HashMap<String, Value>,
}

impl<T> Envelope<T> {
    /// Build a successful envelope.
    pub fn success(stage_name: impl Into<String>, data: T, duration_ms: u64) -> Self {
        Self {
            success: true,
            data: Some(data),
            error: None,
            stage_name: stage_name.into(),
            duration_ms,
            tokens_used: 0,
            metadata: HashMap::new(),
        }
    }

    /// Build a failed envelope. Never carries data.
    pub fn failure(stage_name: impl Into<String>, error: impl Into<String>, duration_ms: u64) -> Self {
        Self {
            success: false,
            data: None,
            error: Some(error.into()),
            stage_name: stage_name.into(),
            duration_ms,
            tokens_used: 0,
            metadata: HashMap::new(),
        }
    }

    /// Attach a token count (builder style).
    pub fn with_tokens_used(mut self, tokens: u64) -> Self {
        self.tokens_used = tokens;
        self
    }

    /// Attach a metadata key/value (builder style).
    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }

    /// Whether the invocation succeeded.
    pub fn is_success(&self) -> bool {
        self.success
    }

    /// Borrow the success payload, if any.
    pub fn data(&self) -> Option<&T> {
        self.data.as_ref()
    }

    /// Consume the envelope, returning the success payload.
    pub fn into_data(self) -> Option<T> {
        self.data
    }

    /// Borrow the failure message, if any.
    pub fn error(&self) -> Option<&str> {
        self.error.as_deref()
    }
}

impl Envelope<Value> {
    /// Parse the `Value` payload into a typed `U`. Fails if the envelope
    /// itself represents a failure, or if the payload doesn't deserialize.
    pub fn parse_as<U: DeserializeOwned>(&self) -> Result<U> {
        match &self.data {
            Some(v) => serde_json::from_value(v.clone()).map_err(PipelineError::Json),
            None => Err(PipelineError::StageFailed {
                stage: self.stage_name.clone(),
                message: self
                    .error
                    .clone()
                    .unwrap_or_else(|| "envelope carries no data".to_string()),
            }),
        }
    }
}
