//! Declarative skill definitions for agentgw.
//!
//! A skill bundles a system prompt, a tool allow-list, model parameters, and
//! a retrieval policy under a unique name. Skills are loaded from a
//! directory of TOML files at startup, validated, and swapped atomically on
//! reload.

pub mod error;
pub mod loader;
pub mod types;

pub use error::{Result, SkillError};
pub use loader::{SkillSet, load_skill_file, load_skills_from_dir, validate_skill};
pub use types::{ExamplePair, RagContext, Skill, is_identifier};
