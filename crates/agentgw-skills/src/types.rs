//! Skill type definitions.
//!
//! A skill is a declarative bundle describing one agent persona: the system
//! prompt, which tools it may call, which model to use, and how retrieval
//! context is injected. Skills are immutable once loaded; changing one means
//! editing its file and reloading the whole set.

use serde::{Deserialize, Serialize};

/// A fully parsed skill definition, loaded from a TOML file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Skill {
    /// Unique skill name. Must be an identifier (`[A-Za-z_][A-Za-z0-9_]*`).
    pub name: String,

    /// Short human-readable description; the planner uses this for routing.
    pub description: String,

    /// The system prompt prepended to every conversation.
    pub system_prompt: String,

    /// Names of the tools this skill may invoke. Tool calls outside this
    /// list are rejected at execution time regardless of what the model asks
    /// for.
    #[serde(default)]
    pub tools: Vec<String>,

    /// Optional model override; falls back to the provider default.
    #[serde(default)]
    pub model: Option<String>,

    /// Optional sampling temperature in `[0, 2]`.
    #[serde(default)]
    pub temperature: Option<f32>,

    /// Maximum reason–act iterations per request.
    #[serde(default = "default_max_iterations")]
    pub max_iterations: u32,

    /// Free-form tags used for routing and retrieval scoping.
    #[serde(default)]
    pub tags: Vec<String>,

    /// Few-shot examples expanded into user/assistant pairs ahead of the
    /// real conversation.
    #[serde(default)]
    pub examples: Vec<ExamplePair>,

    /// Skills this one is expected to delegate to. Advisory: the runtime
    /// gate on delegation is orchestration depth, not this list.
    #[serde(default)]
    pub sub_agents: Vec<String>,

    /// Retrieval-augmented context configuration.
    #[serde(default)]
    pub rag_context: Option<RagContext>,
}

/// One few-shot example exchange.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExamplePair {
    pub user: String,
    pub assistant: String,
}

/// Automatic retrieval configuration for a skill.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RagContext {
    /// Whether retrieval runs at all.
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Skill filter for the retrieval query. Empty means "default to the
    /// owning skill's own name".
    #[serde(default)]
    pub skills: Vec<String>,

    /// Tag filter for the retrieval query.
    #[serde(default)]
    pub tags: Vec<String>,

    /// How many chunks to inject.
    #[serde(default = "default_top_k")]
    pub top_k: u32,
}

fn default_max_iterations() -> u32 {
    10
}

fn default_true() -> bool {
    true
}

fn default_top_k() -> u32 {
    4
}

impl Skill {
    /// Whether `tool` is on this skill's allow-list.
    pub fn allows_tool(&self, tool: &str) -> bool {
        self.tools.iter().any(|t| t == tool)
    }
}

/// Check that a string is a valid identifier for skill and tool names.
pub fn is_identifier(name: &str) -> bool {
    let mut chars = name.chars();
    match chars.next() {
        Some(c) if c.is_ascii_alphabetic() || c == '_' => {}
        _ => return false,
    }
    chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}
