//! Agent error types.
//!
//! Tool-level failures never surface here: the registry folds them into
//! structured error objects the model reads. [`AgentError`] is for the
//! failures the loop itself must react to: provider trouble degrades the
//! current run, persistence failures and cancellation end it.

use thiserror::Error;

/// Unified error type for the agent runtime.
#[derive(Debug, Error)]
pub enum AgentError {
    // -- Provider errors -----------------------------------------------------
    /// An HTTP request to the LLM provider failed.
    #[error("provider request failed: {reason}")]
    ProviderRequest { reason: String },

    /// The provider response could not be parsed into the expected shape.
    #[error("provider response parse error: {reason}")]
    ProviderParse { reason: String },

    /// The streaming connection was interrupted or produced invalid data.
    #[error("provider stream error: {reason}")]
    ProviderStream { reason: String },

    /// The API key is missing for a provider that requires one.
    #[error("missing api key for provider: {provider}")]
    MissingApiKey { provider: String },

    /// The configured provider name is not one of the supported ones.
    #[error("unknown llm provider: {name}")]
    UnknownProvider { name: String },

    // -- Tooling -------------------------------------------------------------
    /// A tool registered under an invalid name.
    #[error("invalid tool name: {name}")]
    InvalidToolName { name: String },

    /// A tool handler failed. Constructed by handlers; the registry turns
    /// this into an error object for the model.
    #[error("tool `{name}` failed: {reason}")]
    ToolFailed { name: String, reason: String },

    // -- Orchestration -------------------------------------------------------
    /// Delegation referenced a skill that is not loaded.
    #[error("unknown skill: {name}")]
    UnknownSkill { name: String },

    /// The request was cancelled. Not an error for the session; nothing
    /// in-flight is persisted.
    #[error("cancelled")]
    Cancelled,

    // -- Fatal ---------------------------------------------------------------
    /// Persisting a message failed. Fatal to the request.
    #[error("persistence error: {0}")]
    Persistence(#[from] agentgw_store::StoreError),

    /// JSON serialization or deserialization failed.
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    /// Catch-all for unexpected internal errors.
    #[error("internal agent error: {0}")]
    Internal(String),
}

/// Convenience alias used throughout the agent crate.
pub type Result<T> = std::result::Result<T, AgentError>;

impl AgentError {
    /// Whether this error is a provider failure the loop should degrade on
    /// rather than propagate.
    pub fn is_provider_error(&self) -> bool {
        matches!(
            self,
            Self::ProviderRequest { .. } | Self::ProviderParse { .. } | Self::ProviderStream { .. }
        )
    }
}

impl From<reqwest::Error> for AgentError {
    fn from(err: reqwest::Error) -> Self {
        Self::ProviderRequest {
            reason: err.to_string(),
        }
    }
}
