//! LLM provider abstraction.
//!
//! The daemon is polymorphic over three streaming providers:
//!
//! - [`openai::OpenAiProvider`] -- OpenAI Chat Completions.
//! - xAI Grok -- the same wire format, reached through
//!   [`openai::OpenAiProvider::xai`] with the x.ai base URL.
//! - [`anthropic::AnthropicProvider`] -- the Anthropic Messages API.
//!
//! Each provider normalizes its vendor's SSE stream (fragmented tool-call
//! deltas and all) into text deltas pushed through the caller's sink plus a
//! final [`Completion`].

pub mod anthropic;
pub mod openai;

use std::sync::Arc;

use async_trait::async_trait;

use crate::error::{AgentError, Result};
use crate::types::{ChatRequest, Completion, Message};

/// Callback receiving each text delta as it streams in.
pub type TextSink<'a> = &'a mut (dyn FnMut(&str) + Send);

/// A streaming chat-completion backend.
#[async_trait]
pub trait LlmProvider: Send + Sync {
    /// Short provider identifier (`openai`, `anthropic`, `xai`).
    fn name(&self) -> &str;

    /// The model used when a request leaves `model` empty.
    fn default_model(&self) -> &str;

    /// Stream one completion. `on_text` is invoked for every text delta in
    /// arrival order; the returned [`Completion`] carries the assembled
    /// text, reassembled tool calls, and the finish reason.
    async fn stream(&self, request: &ChatRequest, on_text: TextSink<'_>) -> Result<Completion>;

    /// Cheap reachability check used by the startup probe: a one-token
    /// request that succeeds iff the provider answers at all.
    async fn probe(&self) -> Result<()> {
        let request = ChatRequest {
            model: String::new(),
            messages: vec![Message::user("ping")],
            tools: Vec::new(),
            temperature: Some(0.0),
            max_tokens: Some(1),
        };
        self.stream(&request, &mut |_| {}).await.map(|_| ())
    }
}

/// Which provider family to talk to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProviderKind {
    OpenAi,
    Anthropic,
    Xai,
}

impl ProviderKind {
    /// Parse a config string (`openai` / `anthropic` / `xai`).
    pub fn parse(name: &str) -> Result<Self> {
        match name.to_ascii_lowercase().as_str() {
            "openai" => Ok(Self::OpenAi),
            "anthropic" => Ok(Self::Anthropic),
            "xai" | "grok" => Ok(Self::Xai),
            other => Err(AgentError::UnknownProvider { name: other.into() }),
        }
    }

    /// The flat environment variable conventionally holding this provider's
    /// API key.
    pub fn api_key_env(self) -> &'static str {
        match self {
            Self::OpenAi => "OPENAI_API_KEY",
            Self::Anthropic => "ANTHROPIC_API_KEY",
            Self::Xai => "XAI_API_KEY",
        }
    }
}

/// Settings needed to construct a provider.
#[derive(Debug, Clone)]
pub struct ProviderConfig {
    pub kind: ProviderKind,
    pub api_key: String,
    /// Override of the vendor's default endpoint.
    pub base_url: Option<String>,
    /// Default model for requests that do not name one.
    pub model: String,
    /// Default per-turn token cap.
    pub max_tokens: u32,
}

/// Build the provider described by `config`.
pub fn build_provider(config: ProviderConfig) -> Result<Arc<dyn LlmProvider>> {
    match config.kind {
        ProviderKind::OpenAi => {
            let mut p = openai::OpenAiProvider::openai(config.api_key, config.model)?
                .with_max_tokens(config.max_tokens);
            if let Some(url) = config.base_url {
                p = p.with_base_url(url);
            }
            Ok(Arc::new(p))
        }
        ProviderKind::Xai => {
            let mut p = openai::OpenAiProvider::xai(config.api_key, config.model)?
                .with_max_tokens(config.max_tokens);
            if let Some(url) = config.base_url {
                p = p.with_base_url(url);
            }
            Ok(Arc::new(p))
        }
        ProviderKind::Anthropic => {
            let mut p = anthropic::AnthropicProvider::new(config.api_key, config.model)?
                .with_max_tokens(config.max_tokens);
            if let Some(url) = config.base_url {
                p = p.with_base_url(url);
            }
            Ok(Arc::new(p))
        }
    }
}
