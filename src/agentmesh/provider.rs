//! The model-provider seam.
//!
//! Planning and agent execution both need a language model, but the
//! runtime treats it as an opaque text-in/text-out capability with token
//! accounting. [`ModelProvider`] is the only surface concrete vendor
//! clients implement; nothing else in the crate knows which vendor sits
//! behind it, and tests substitute scripted fakes.

use std::error::Error;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

/// Token accounting reported by a provider, when available.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct TokenUsage {
    pub prompt_tokens: usize,
    pub completion_tokens: usize,
    pub total_tokens: usize,
}

/// One completion request.
#[derive(Debug, Clone)]
pub struct CompletionRequest {
    pub system_prompt: String,
    pub user_message: String,
    pub model: String,
    pub temperature: f32,
    pub max_tokens: usize,
}

impl CompletionRequest {
    /// A request with the executor's default sampling parameters.
    pub fn new(system_prompt: impl Into<String>, user_message: impl Into<String>) -> Self {
        Self {
            system_prompt: system_prompt.into(),
            user_message: user_message.into(),
            model: String::from("default"),
            temperature: 0.7,
            max_tokens: 1000,
        }
    }

    /// Override the model id (builder pattern).
    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = model.into();
        self
    }

    /// Override the sampling temperature (builder pattern).
    pub fn with_temperature(mut self, temperature: f32) -> Self {
        self.temperature = temperature;
        self
    }

    /// Override the token budget (builder pattern).
    pub fn with_max_tokens(mut self, max_tokens: usize) -> Self {
        self.max_tokens = max_tokens;
        self
    }
}

/// A provider's answer.
#[derive(Debug, Clone)]
pub struct Completion {
    pub content: String,
    pub model: String,
    pub tokens: Option<TokenUsage>,
    pub finish_reason: Option<String>,
}

impl Completion {
    /// A completion carrying only text.
    pub fn text(content: impl Into<String>, model: impl Into<String>) -> Self {
        Self {
            content: content.into(),
            model: model.into(),
            tokens: None,
            finish_reason: Some(String::from("stop")),
        }
    }
}

/// Opaque text completion with token accounting.
#[async_trait]
pub trait ModelProvider: Send + Sync {
    /// Produce a completion for the request.
    async fn complete(
        &self,
        request: CompletionRequest,
    ) -> Result<Completion, Box<dyn Error + Send + Sync>>;

    /// Identifier of the backing model, for logs and output metadata.
    fn model_name(&self) -> &str;
}
