//! Error types for skill loading and validation.

use std::path::PathBuf;

use thiserror::Error;

/// Alias for `Result<T, SkillError>`.
pub type Result<T> = std::result::Result<T, SkillError>;

/// Errors raised while loading or validating skills.
#[derive(Debug, Error)]
pub enum SkillError {
    /// Reading a skill file or directory failed.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// A skill file could not be parsed as TOML.
    #[error("failed to parse {file}: {reason}")]
    Parse { file: PathBuf, reason: String },

    /// A skill definition failed validation.
    #[error("skill `{skill}` is invalid: {reason}")]
    Validation { skill: String, reason: String },

    /// The requested skill does not exist.
    #[error("unknown skill: {0}")]
    Unknown(String),
}
