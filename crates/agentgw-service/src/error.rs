//! Service error types.

use thiserror::Error;

/// Alias for `Result<T, ServiceError>`.
pub type Result<T> = std::result::Result<T, ServiceError>;

/// Errors surfaced by the service layer.
#[derive(Debug, Error)]
pub enum ServiceError {
    /// Configuration loading or validation failed. Fatal at startup.
    #[error("config error: {reason}")]
    Config { reason: String },

    /// The requested skill is not loaded.
    #[error("unknown skill: {name}")]
    UnknownSkill { name: String },

    /// The request was malformed (bad session binding, bad parameters).
    #[error("invalid request: {reason}")]
    InvalidRequest { reason: String },

    /// Skill loading failure.
    #[error(transparent)]
    Skill(#[from] agentgw_skills::SkillError),

    /// Storage failure.
    #[error(transparent)]
    Store(#[from] agentgw_store::StoreError),

    /// Agent runtime failure.
    #[error(transparent)]
    Agent(#[from] agentgw_agent::AgentError),

    /// A background component failed to start.
    #[error("startup failed: {reason}")]
    Startup { reason: String },
}
