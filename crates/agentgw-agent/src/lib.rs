//! Agent runtime for agentgw.
//!
//! This crate implements the execution core of the daemon: streaming LLM
//! providers, the tool registry, and the reason–act–observe loop that ties
//! them together.
//!
//! ## Modules
//!
//! - [`types`] -- Provider-agnostic wire types (messages, tool calls,
//!   completions).
//! - [`provider`] -- The [`LlmProvider`] trait and the OpenAI, Anthropic,
//!   and xAI streaming clients with their SSE normalizers.
//! - [`tools`] -- Tool trait, registry with schema-validated dispatch, and
//!   the built-in tools including `delegate_to_agent`.
//! - [`agent_loop`] -- The per-request [`AgentLoop`].
//! - [`cancel`] -- Cooperative cancellation.
//! - [`error`] -- Agent error types.

pub mod agent_loop;
pub mod cancel;
pub mod error;
pub mod provider;
pub mod tools;
pub mod types;

pub use agent_loop::{AgentEvent, AgentLoop, ToolEvent};
pub use cancel::CancelHandle;
pub use error::{AgentError, Result};
pub use provider::{
    LlmProvider, ProviderConfig, ProviderKind, build_provider,
    anthropic::AnthropicProvider, openai::OpenAiProvider,
};
pub use tools::{
    AgentSpawner, Tool, ToolContext, ToolRegistry,
    builtin::{CurrentTimeTool, DelegateAgentTool, SearchKnowledgeTool},
    object_schema,
};
pub use types::{
    ChatRequest, Completion, FinishReason, Message, Role, ToolCall, ToolDefinition, Usage,
};
