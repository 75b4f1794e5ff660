//! Skill loader: discovers and validates skill files.
//!
//! Skills are `*.toml` files in a flat directory. Files that fail to parse
//! or validate are logged and skipped; one bad skill never blocks the rest.
//! The loaded set is swapped atomically so in-flight requests keep the set
//! they started with.

use std::collections::HashMap;
use std::path::Path;
use std::sync::{Arc, RwLock};

use tracing::{info, warn};

use crate::error::{Result, SkillError};
use crate::types::{Skill, is_identifier};

/// Load and validate every skill in `dir`.
///
/// `known_tools` is the registry's tool list; a skill referencing a tool
/// outside it is rejected. Unknown `sub_agents` are only warned about,
/// since delegation is gated by depth at runtime, not by this list.
pub fn load_skills_from_dir(dir: &Path, known_tools: &[String]) -> Result<Vec<Skill>> {
    if !dir.exists() {
        warn!(path = %dir.display(), "skills directory does not exist");
        return Ok(Vec::new());
    }

    let mut skills: Vec<Skill> = Vec::new();

    let mut entries: Vec<_> = std::fs::read_dir(dir)?
        .collect::<std::io::Result<Vec<_>>>()?
        .into_iter()
        .map(|e| e.path())
        .filter(|p| p.extension().is_some_and(|ext| ext == "toml"))
        .collect();
    entries.sort();

    for path in entries {
        let skill = match load_skill_file(&path, known_tools) {
            Ok(skill) => skill,
            Err(e) => {
                warn!(path = %path.display(), error = %e, "skipping invalid skill");
                continue;
            }
        };

        if skills.iter().any(|s| s.name == skill.name) {
            warn!(
                path = %path.display(),
                name = %skill.name,
                "duplicate skill name, keeping the first definition"
            );
            continue;
        }

        info!(name = %skill.name, tools = skill.tools.len(), "loaded skill");
        skills.push(skill);
    }

    // Cross-check sub-agent references once the whole set is known.
    let names: Vec<String> = skills.iter().map(|s| s.name.clone()).collect();
    for skill in &skills {
        for sub in &skill.sub_agents {
            if !names.contains(sub) {
                warn!(
                    skill = %skill.name,
                    sub_agent = %sub,
                    "sub-agent does not name a loaded skill"
                );
            }
        }
    }

    info!(count = skills.len(), dir = %dir.display(), "skills loaded");
    Ok(skills)
}

/// Parse and validate a single skill file.
pub fn load_skill_file(path: &Path, known_tools: &[String]) -> Result<Skill> {
    let content = std::fs::read_to_string(path)?;
    let skill: Skill = toml::from_str(&content).map_err(|e| SkillError::Parse {
        file: path.to_path_buf(),
        reason: e.to_string(),
    })?;
    validate_skill(&skill, known_tools)?;
    Ok(skill)
}

/// Validate one skill definition against the structural rules.
pub fn validate_skill(skill: &Skill, known_tools: &[String]) -> Result<()> {
    let invalid = |reason: String| SkillError::Validation {
        skill: skill.name.clone(),
        reason,
    };

    if !is_identifier(&skill.name) {
        return Err(invalid(format!("name `{}` is not an identifier", skill.name)));
    }

    for tool in &skill.tools {
        if !known_tools.iter().any(|t| t == tool) {
            return Err(invalid(format!("references unknown tool `{tool}`")));
        }
    }

    if let Some(temp) = skill.temperature
        && !(0.0..=2.0).contains(&temp)
    {
        return Err(invalid(format!("temperature {temp} outside [0, 2]")));
    }

    if skill.max_iterations == 0 {
        return Err(invalid("max_iterations must be positive".into()));
    }

    if let Some(rag) = &skill.rag_context
        && rag.top_k == 0
    {
        return Err(invalid("rag_context.top_k must be positive".into()));
    }

    Ok(())
}

// ═══════════════════════════════════════════════════════════════════════
//  SkillSet
// ═══════════════════════════════════════════════════════════════════════

/// The live, atomically swappable set of loaded skills.
///
/// Readers grab an `Arc` to the current map, so a reload never disturbs a
/// request that is already running with the previous definitions.
#[derive(Default)]
pub struct SkillSet {
    inner: RwLock<Arc<HashMap<String, Arc<Skill>>>>,
}

impl SkillSet {
    /// Create an empty set.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a set from already validated skills.
    pub fn from_skills(skills: Vec<Skill>) -> Self {
        let set = Self::new();
        set.swap(skills);
        set
    }

    /// Replace the whole set in one step.
    pub fn swap(&self, skills: Vec<Skill>) {
        let map: HashMap<String, Arc<Skill>> = skills
            .into_iter()
            .map(|s| (s.name.clone(), Arc::new(s)))
            .collect();
        let mut guard = self.inner.write().expect("skill set lock poisoned");
        *guard = Arc::new(map);
    }

    /// Look up a skill by name.
    pub fn get(&self, name: &str) -> Option<Arc<Skill>> {
        self.snapshot().get(name).cloned()
    }

    /// A point-in-time view of the whole map.
    pub fn snapshot(&self) -> Arc<HashMap<String, Arc<Skill>>> {
        Arc::clone(&self.inner.read().expect("skill set lock poisoned"))
    }

    /// Sorted skill names.
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.snapshot().keys().cloned().collect();
        names.sort();
        names
    }

    /// Number of loaded skills.
    pub fn len(&self) -> usize {
        self.snapshot().len()
    }

    /// Whether the set is empty.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

// ── tests ────────────────────────────────────────────────────────────
