//! `LLMProvider` capability: the interface agent stages use to talk to a
//! language model, independent of the lower-level [`Backend`](crate::backend::Backend)
//! transport abstraction. Conversation state is kept as an opaque id
//! exchanged with the provider rather than an in-memory dialogue object
//! graph (see the crate's "conversation state as external session" design
//! note) — only the id needs to persist for checkpointing.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tokio::sync::RwLock;
use uuid::Uuid;

use crate::backend::{self, Backend, BackoffConfig, ChatMessage, LlmRequest, Role};
use crate::client::LlmConfig;
use crate::error::Result;

/// Token accounting for one call or a cumulative session.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Usage {
    pub prompt: u64,
    pub completion: u64,
    pub total: u64,
}

impl Usage {
    fn combine(self, other: Usage) -> Usage {
        Usage {
            prompt: self.prompt + other.prompt,
            completion: self.completion + other.completion,
            total: self.total + other.total,
        }
    }

    /// Best-effort extraction from whatever shape a `Backend` stuffed into
    /// `LlmResponse::metadata`. Providers differ (Ollama: `eval_count` /
    /// `prompt_eval_count`; OpenAI-style: a nested `usage` object); when
    /// neither is present, falls back to a `len() / 4` heuristic over the
    /// response text, the same approximation `FeedbackManager` uses.
    fn extract(metadata: Option<&serde_json::Value>, response_text: &str) -> Usage {
        if let Some(meta) = metadata {
            if let Some(usage) = meta.get("usage") {
                let prompt = usage.get("prompt_tokens").and_then(|v| v.as_u64()).unwrap_or(0);
                let completion = usage
                    .get("completion_tokens")
                    .and_then(|v| v.as_u64())
                    .unwrap_or(0);
                let total = usage
                    .get("total_tokens")
                    .and_then(|v| v.as_u64())
                    .unwrap_or(prompt + completion);
                if total > 0 {
                    return Usage {
                        prompt,
                        completion,
                        total,
                    };
                }
            }
            let prompt = meta.get("prompt_eval_count").and_then(|v| v.as_u64());
            let completion = meta.get("eval_count").and_then(|v| v.as_u64());
            if prompt.is_some() || completion.is_some() {
                let prompt = prompt.unwrap_or(0);
                let completion = completion.unwrap_or(0);
                return Usage {
                    prompt,
                    completion,
                    total: prompt + completion,
                };
            }
        }
        let estimated = (response_text.len() as u64 / 4).max(1);
        Usage {
            prompt: 0,
            completion: estimated,
            total: estimated,
        }
    }
}

/// A single provider response, normalized across the structured and
/// conversational call shapes.
#[derive(Debug, Clone)]
pub struct GeneratedResponse {
    pub content: String,
    pub usage: Usage,
    pub response_id: String,
    pub model: String,
    /// Present (and stable across turns) for
    /// `generate_structured_in_conversation` calls; `None` for one-shot
    /// `generate_structured` calls.
    pub conversation_id: Option<String>,
}

/// The capability an agent stage uses to talk to a language model.
///
/// Transport-level retry (rate limits, 5xx, network errors) is the
/// provider's own responsibility, not the caller's — implementations are
/// expected to apply their own backoff internally, the way
/// [`BackendLLMProvider`] reuses [`backend::with_backoff`].
#[async_trait::async_trait]
pub trait LLMProvider: Send + Sync {
    /// Stateless structured call: no conversation is created or continued.
    async fn generate_structured(
        &self,
        messages: &[ChatMessage],
        model: &str,
        temperature: Option<f64>,
    ) -> Result<GeneratedResponse>;

    /// Conversational call. `conversation_id = None` starts a new
    /// conversation (the returned response's `conversation_id` names it);
    /// `Some(id)` continues an existing one.
    async fn generate_structured_in_conversation(
        &self,
        user_message: &str,
        conversation_id: Option<&str>,
        model: &str,
        system_prompt: Option<&str>,
        temperature: Option<f64>,
    ) -> Result<GeneratedResponse>;

    /// Tokens used across every call made through this provider instance
    /// since construction or the last [`LLMProvider::reset_usage`].
    async fn get_cumulative_usage(&self) -> Usage;

    /// Zero the cumulative usage counter.
    async fn reset_usage(&self);
}

/// Adapts the crate's existing [`Backend`] + HTTP client machinery into an
/// [`LLMProvider`], the way `OllamaBackend`/`OpenAiBackend` already
/// concretize `Backend` — this is the one concrete adapter the engine
/// ships; callers are free to implement `LLMProvider` directly against any
/// other transport.
pub struct BackendLLMProvider {
    backend: Arc<dyn Backend>,
    client: reqwest::Client,
    base_url: String,
    backoff: BackoffConfig,
    conversations: RwLock<HashMap<String, Vec<ChatMessage>>>,
    cumulative: RwLock<Usage>,
    call_count: AtomicU64,
}

impl BackendLLMProvider {
    pub fn new(backend: Arc<dyn Backend>, base_url: impl Into<String>) -> Self {
        Self {
            backend,
            client: reqwest::Client::new(),
            base_url: base_url.into(),
            backoff: BackoffConfig::standard(),
            conversations: RwLock::new(HashMap::new()),
            cumulative: RwLock::new(Usage::default()),
            call_count: AtomicU64::new(0),
        }
    }

    pub fn with_backoff(mut self, backoff: BackoffConfig) -> Self {
        self.backoff = backoff;
        self
    }

    pub fn with_client(mut self, client: reqwest::Client) -> Self {
        self.client = client;
        self
    }

    async fn complete(
        &self,
        model: &str,
        messages: Vec<ChatMessage>,
        temperature: Option<f64>,
    ) -> Result<(String, Usage)> {
        let config = LlmConfig::default().with_temperature(temperature.unwrap_or(0.7));
        let prompt = messages
            .last()
            .map(|m| m.content.clone())
            .unwrap_or_default();
        let system_prompt = messages
            .iter()
            .find(|m| m.role == Role::System)
            .map(|m| m.content.clone());
        let history = if messages.len() > 1 {
            messages[..messages.len() - 1].to_vec()
        } else {
            Vec::new()
        };
        let request = LlmRequest {
            model: model.to_string(),
            system_prompt,
            prompt,
            messages: history,
            config,
            stream: false,
        };

        let response = backend::with_backoff(
            &self.backend,
            &self.client,
            &self.base_url,
            &request,
            &self.backoff,
            None,
            None,
        )
        .await?;

        let usage = Usage::extract(response.metadata.as_ref(), &response.text);
        let mut cumulative = self.cumulative.write().await;
        *cumulative = cumulative.combine(usage);
        Ok((response.text, usage))
    }

    fn mint_conversation_id(&self, model: &str) -> String {
        let call = self.call_count.fetch_add(1, Ordering::Relaxed);
        format!("{model}_iter{call}_{}", short_uuid())
    }
}

fn short_uuid() -> String {
    Uuid::new_v4().simple().to_string()[..8].to_string()
}

#[async_trait::async_trait]
impl LLMProvider for BackendLLMProvider {
    async fn generate_structured(
        &self,
        messages: &[ChatMessage],
        model: &str,
        temperature: Option<f64>,
    ) -> Result<GeneratedResponse> {
        let (content, usage) = self.complete(model, messages.to_vec(), temperature).await?;
        Ok(GeneratedResponse {
            content,
            usage,
            response_id: short_uuid(),
            model: model.to_string(),
            conversation_id: None,
        })
    }

    async fn generate_structured_in_conversation(
        &self,
        user_message: &str,
        conversation_id: Option<&str>,
        model: &str,
        system_prompt: Option<&str>,
        temperature: Option<f64>,
    ) -> Result<GeneratedResponse> {
        let id = conversation_id
            .map(|s| s.to_string())
            .unwrap_or_else(|| self.mint_conversation_id(model));

        let mut conversations = self.conversations.write().await;
        let history = conversations.entry(id.clone()).or_insert_with(Vec::new);
        if history.is_empty() {
            if let Some(sys) = system_prompt {
                history.push(ChatMessage {
                    role: Role::System,
                    content: sys.to_string(),
                });
            }
        }
        history.push(ChatMessage {
            role: Role::User,
            content: user_message.to_string(),
        });
        let messages = history.clone();
        drop(conversations);

        let (content, usage) = self.complete(model, messages, temperature).await?;

        let mut conversations = self.conversations.write().await;
        if let Some(history) = conversations.get_mut(&id) {
            history.push(ChatMessage {
                role: Role::Assistant,
                content: content.clone(),
            });
        }

        Ok(GeneratedResponse {
            content,
            usage,
            response_id: short_uuid(),
            model: model.to_string(),
            conversation_id: Some(id),
        })
    }

    async fn get_cumulative_usage(&self) -> Usage {
        *self.cumulative.read().await
    }

    async fn reset_usage(&self) {
        *self.cumulative.write().await = Usage::default();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::MockBackend;

    fn provider_with(responses: Vec<&str>) -> BackendLLMProvider {
        let backend = MockBackend::new(responses.into_iter().map(String::from).collect());
        BackendLLMProvider::new(Arc::new(backend), "http://test")
    }

    #[tokio::test]
    async fn test_generate_structured_stateless_has_no_conversation_id() {
        let provider = provider_with(vec!["hello"]);
        let messages = vec![ChatMessage {
            role: Role::User,
            content: "hi".to_string(),
        }];
        let resp = provider
            .generate_structured(&messages, "test-model", None)
            .await
            .unwrap();
        assert!(resp.conversation_id.is_none());
        assert_eq!(resp.content, "hello");
    }

    #[tokio::test]
    async fn test_conversation_continues_with_same_id() {
        let provider = provider_with(vec!["first", "second"]);
        let first = provider
            .generate_structured_in_conversation("hi", None, "m", Some("system"), None)
            .await
            .unwrap();
        let id = first.conversation_id.clone().unwrap();

        let second = provider
            .generate_structured_in_conversation("again", Some(&id), "m", Some("system"), None)
            .await
            .unwrap();
        assert_eq!(second.conversation_id.unwrap(), id);
    }

    #[tokio::test]
    async fn test_cumulative_usage_accumulates_and_resets() {
        let provider = provider_with(vec!["abcd", "abcdefgh"]);
        let messages = vec![ChatMessage {
            role: Role::User,
            content: "hi".to_string(),
        }];
        provider.generate_structured(&messages, "m", None).await.unwrap();
        provider.generate_structured(&messages, "m", None).await.unwrap();
        let usage = provider.get_cumulative_usage().await;
        assert!(usage.total > 0);

        provider.reset_usage().await;
        assert_eq!(provider.get_cumulative_usage().await, Usage::default());
    }

    #[test]
    fn test_usage_extract_openai_shape() {
        let meta = serde_json::json!({"usage": {"prompt_tokens": 10, "completion_tokens": 5, "total_tokens": 15}});
        let usage = Usage::extract(Some(&meta), "ignored");
        assert_eq!(usage, Usage { prompt: 10, completion: 5, total: 15 });
    }

    #[test]
    fn test_usage_extract_ollama_shape() {
        let meta = serde_json::json!({"prompt_eval_count": 7, "eval_count": 3});
        let usage = Usage::extract(Some(&meta), "ignored");
        assert_eq!(usage, Usage { prompt: 7, completion: 3, total: 10 });
    }

    #[test]
    fn test_usage_extract_falls_back_to_heuristic() {
        let usage = Usage::extract(None, "twelve-chars");
        assert_eq!(usage.total, (12usize / 4).max(1) as u64);
    }
}
