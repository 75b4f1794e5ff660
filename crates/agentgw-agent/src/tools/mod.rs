//! Tool registry and dispatch.
//!
//! Tools declare a name, description, and JSON schema; the registry owns the
//! process-wide name → tool map and a uniform invocation surface. Failures
//! at every stage (unknown name, arguments that don't match the schema,
//! handler errors) are folded into a structured error object that flows
//! back to the model as the tool result. The loop never sees a tool `Err`.

pub mod builtin;

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use async_trait::async_trait;
use serde_json::{Value, json};
use tracing::{debug, warn};

use crate::cancel::CancelHandle;
use crate::error::{AgentError, Result};
use crate::types::ToolDefinition;

// ---------------------------------------------------------------------------
// Context
// ---------------------------------------------------------------------------

/// Ambient context handed to every tool invocation.
///
/// This is the explicit flow-local: it travels down the call chain by value,
/// so nested delegations see monotonically increasing depths while sibling
/// requests never share state.
#[derive(Clone)]
pub struct ToolContext {
    /// The session the current loop is bound to.
    pub session_id: String,

    /// Name of the skill driving the current loop.
    pub skill: String,

    /// Orchestration depth of the current loop. Zero for a top-level
    /// request; each delegation adds one.
    pub depth: u32,

    /// Cancellation flag of the current run.
    pub cancel: CancelHandle,

    /// Delegation entry point, when the host service provides one.
    pub spawner: Option<Arc<dyn AgentSpawner>>,
}

/// Spawns sub-agent runs on behalf of the delegation tool.
///
/// Implemented by the service layer, which owns skill resolution, session
/// creation, and loop construction.
#[async_trait]
pub trait AgentSpawner: Send + Sync {
    /// Run `input` against `skill` in a fresh session at `parent_depth + 1`,
    /// to completion, and return the final text.
    async fn delegate(&self, skill: &str, input: &str, parent_depth: u32) -> Result<String>;

    /// The configured maximum orchestration depth.
    fn max_depth(&self) -> u32;
}

// ---------------------------------------------------------------------------
// Tool trait
// ---------------------------------------------------------------------------

/// A named function the model may invoke.
#[async_trait]
pub trait Tool: Send + Sync {
    /// The definition advertised to the LLM. The schema in it is the
    /// contract [`ToolRegistry::invoke`] validates arguments against.
    fn definition(&self) -> ToolDefinition;

    /// Execute with already validated arguments.
    async fn invoke(&self, arguments: Value, ctx: &ToolContext) -> Result<Value>;
}

// ---------------------------------------------------------------------------
// Registry
// ---------------------------------------------------------------------------

/// Process-wide mapping from tool name to handler.
#[derive(Default)]
pub struct ToolRegistry {
    tools: RwLock<HashMap<String, Arc<dyn Tool>>>,
}

impl ToolRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a tool. Re-registering the same name replaces the previous
    /// handler. Names must be identifiers.
    pub fn register(&self, tool: Arc<dyn Tool>) -> Result<()> {
        let name = tool.definition().name;
        if !agentgw_skills::is_identifier(&name) {
            return Err(AgentError::InvalidToolName { name });
        }

        let mut tools = self.tools.write().expect("tool registry lock poisoned");
        if tools.insert(name.clone(), tool).is_some() {
            warn!(tool = %name, "replacing existing tool registration");
        } else {
            debug!(tool = %name, "tool registered");
        }
        Ok(())
    }

    /// Sorted names of all registered tools.
    pub fn names(&self) -> Vec<String> {
        let tools = self.tools.read().expect("tool registry lock poisoned");
        let mut names: Vec<String> = tools.keys().cloned().collect();
        names.sort();
        names
    }

    /// Whether `name` is registered.
    pub fn has(&self, name: &str) -> bool {
        self.tools
            .read()
            .expect("tool registry lock poisoned")
            .contains_key(name)
    }

    /// Definitions for the given allow-list, in allow-list order. Names not
    /// registered are silently skipped (skill validation already warned).
    pub fn definitions_for(&self, allowed: &[String]) -> Vec<ToolDefinition> {
        let tools = self.tools.read().expect("tool registry lock poisoned");
        allowed
            .iter()
            .filter_map(|name| tools.get(name).map(|t| t.definition()))
            .collect()
    }

    /// Invoke `name` with `arguments`.
    ///
    /// Always returns a JSON value: the handler's result on success, or an
    /// `{"error": ..., "kind": ...}` object on any failure.
    pub async fn invoke(&self, name: &str, arguments: Value, ctx: &ToolContext) -> Value {
        let tool = {
            let tools = self.tools.read().expect("tool registry lock poisoned");
            tools.get(name).cloned()
        };

        let Some(tool) = tool else {
            return json!({
                "error": format!("unknown tool `{name}`"),
                "kind": "tool_not_found",
            });
        };

        let definition = tool.definition();
        if let Err(reason) = validate_arguments(&definition.input_schema, &arguments) {
            return json!({
                "error": format!("invalid arguments for `{name}`: {reason}"),
                "kind": "invalid_arguments",
            });
        }

        debug!(tool = %name, depth = ctx.depth, "invoking tool");
        match tool.invoke(arguments, ctx).await {
            Ok(value) => value,
            Err(e) => {
                warn!(tool = %name, error = %e, "tool invocation failed");
                json!({
                    "error": e.to_string(),
                    "kind": "tool_failed",
                })
            }
        }
    }
}

/// Validate `arguments` against a tool's input schema.
///
/// Compiled per invocation: tool schemas are small and invocation is
/// dominated by the handler's own I/O.
fn validate_arguments(schema: &Value, arguments: &Value) -> std::result::Result<(), String> {
    let compiled = jsonschema::JSONSchema::compile(schema)
        .map_err(|e| format!("tool schema does not compile: {e}"))?;
    if let Err(errors) = compiled.validate(arguments) {
        let reasons: Vec<String> = errors.map(|e| e.to_string()).collect();
        return Err(reasons.join("; "));
    }
    Ok(())
}

/// Helper for building the common `{type: object, properties, required}`
/// schema shape tools advertise.
pub fn object_schema(properties: Value, required: &[&str]) -> Value {
    json!({
        "type": "object",
        "properties": properties,
        "required": required,
    })
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
