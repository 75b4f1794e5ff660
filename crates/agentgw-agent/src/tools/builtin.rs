//! Built-in tools.
//!
//! Three tools ship with the daemon: `current_time`, `search_knowledge`
//! (vector-store lookup scoped to the calling skill), and
//! `delegate_to_agent`, the orchestration primitive that spawns a sub-agent
//! through the host service.

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{Value, json};
use tracing::info;

use agentgw_store::VectorStore;

use crate::error::Result;
use crate::tools::{Tool, ToolContext, object_schema};
use crate::types::ToolDefinition;

// ---------------------------------------------------------------------------
// current_time
// ---------------------------------------------------------------------------

/// Reports the current UTC time.
pub struct CurrentTimeTool;

#[async_trait]
impl Tool for CurrentTimeTool {
    fn definition(&self) -> ToolDefinition {
        ToolDefinition {
            name: "current_time".into(),
            description: "Get the current date and time in UTC.".into(),
            input_schema: object_schema(json!({}), &[]),
        }
    }

    async fn invoke(&self, _arguments: Value, _ctx: &ToolContext) -> Result<Value> {
        Ok(json!({ "utc": chrono::Utc::now().to_rfc3339() }))
    }
}

// ---------------------------------------------------------------------------
// search_knowledge
// ---------------------------------------------------------------------------

/// Searches the knowledge base, scoped to the calling skill's visibility.
pub struct SearchKnowledgeTool {
    vectors: Arc<VectorStore>,
    collection: String,
}

impl SearchKnowledgeTool {
    /// Create the tool over `vectors`, searching `collection`.
    pub fn new(vectors: Arc<VectorStore>, collection: impl Into<String>) -> Self {
        Self {
            vectors,
            collection: collection.into(),
        }
    }
}

#[async_trait]
impl Tool for SearchKnowledgeTool {
    fn definition(&self) -> ToolDefinition {
        ToolDefinition {
            name: "search_knowledge".into(),
            description: "Search the knowledge base for passages relevant to a query. \
                          Returns the best matching snippets with their sources."
                .into(),
            input_schema: object_schema(
                json!({
                    "query": {
                        "type": "string",
                        "description": "What to search for",
                    },
                    "top_k": {
                        "type": "integer",
                        "minimum": 1,
                        "maximum": 20,
                        "description": "How many results to return (default 4)",
                    },
                }),
                &["query"],
            ),
        }
    }

    async fn invoke(&self, arguments: Value, ctx: &ToolContext) -> Result<Value> {
        let query = arguments["query"].as_str().unwrap_or_default();
        let top_k = arguments["top_k"].as_u64().unwrap_or(4) as usize;

        // The caller's skill bounds what it may see, always.
        let skill_filter = vec![ctx.skill.clone()];
        let results = self
            .vectors
            .search(query, &self.collection, &skill_filter, &[], top_k)
            .await?;

        let snippets: Vec<Value> = results
            .iter()
            .map(|r| {
                json!({
                    "source": r.chunk.source,
                    "text": r.chunk.text,
                    "score": r.score,
                })
            })
            .collect();

        Ok(json!({ "results": snippets, "count": snippets.len() }))
    }
}

// ---------------------------------------------------------------------------
// delegate_to_agent
// ---------------------------------------------------------------------------

/// Delegates a task to another skill as a sub-agent.
///
/// Reads the ambient depth from the invocation context. At the depth limit
/// it returns an error *object* with the current depth, never an exception,
/// so the model can react. The sub-run happens in a fresh session with no
/// history sharing; an optional `context` argument is prefixed to the task.
pub struct DelegateAgentTool;

#[async_trait]
impl Tool for DelegateAgentTool {
    fn definition(&self) -> ToolDefinition {
        ToolDefinition {
            name: "delegate_to_agent".into(),
            description: "Delegate a task to another agent skill and return its result. \
                          Use when a different skill is better suited for a subtask."
                .into(),
            input_schema: object_schema(
                json!({
                    "skill_name": {
                        "type": "string",
                        "description": "Name of the skill to delegate to",
                    },
                    "task": {
                        "type": "string",
                        "description": "The task for the sub-agent",
                    },
                    "context": {
                        "type": "string",
                        "description": "Optional background prefixed to the task",
                    },
                }),
                &["skill_name", "task"],
            ),
        }
    }

    async fn invoke(&self, arguments: Value, ctx: &ToolContext) -> Result<Value> {
        let Some(spawner) = ctx.spawner.as_ref() else {
            return Ok(json!({ "error": "delegation is not available in this context" }));
        };

        let skill_name = arguments["skill_name"].as_str().unwrap_or_default();
        let task = arguments["task"].as_str().unwrap_or_default();

        let depth = ctx.depth;
        if depth + 1 > spawner.max_depth() {
            return Ok(json!({
                "error": "maximum orchestration depth reached",
                "current_depth": depth,
            }));
        }

        let input = match arguments["context"].as_str() {
            Some(context) if !context.is_empty() => format!("{context}\n\n{task}"),
            _ => task.to_string(),
        };

        info!(
            from = %ctx.skill,
            to = %skill_name,
            depth = depth + 1,
            "delegating to sub-agent"
        );

        match spawner.delegate(skill_name, &input, depth).await {
            Ok(result) => Ok(json!({
                "status": "ok",
                "skill": skill_name,
                "result": result,
                "depth": depth + 1,
            })),
            Err(e) => Ok(json!({ "error": e.to_string() })),
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cancel::CancelHandle;
    use crate::error::AgentError;
    use agentgw_store::{Db, HashEmbedder};
    use std::sync::Mutex;

    fn ctx_with(depth: u32, spawner: Option<Arc<dyn crate::tools::AgentSpawner>>) -> ToolContext {
        ToolContext {
            session_id: "s1".into(),
            skill: "alpha".into(),
            depth,
            cancel: CancelHandle::new(),
            spawner,
        }
    }

    struct StubSpawner {
        max_depth: u32,
        calls: Mutex<Vec<(String, String, u32)>>,
    }

    #[async_trait]
    impl crate::tools::AgentSpawner for StubSpawner {
        async fn delegate(&self, skill: &str, input: &str, parent_depth: u32) -> Result<String> {
            if skill == "missing" {
                return Err(AgentError::UnknownSkill {
                    name: skill.into(),
                });
            }
            self.calls
                .lock()
                .unwrap()
                .push((skill.into(), input.into(), parent_depth));
            Ok(format!("result from {skill}"))
        }

        fn max_depth(&self) -> u32 {
            self.max_depth
        }
    }

    #[tokio::test]
    async fn current_time_reports_utc() {
        let tool = CurrentTimeTool;
        let result = tool.invoke(json!({}), &ctx_with(0, None)).await.unwrap();
        assert!(result["utc"].as_str().unwrap().contains('T'));
    }

    #[tokio::test]
    async fn search_knowledge_is_scoped_to_the_calling_skill() {
        let db = Db::open_in_memory().unwrap();
        db.migrate().await.unwrap();
        let vectors = Arc::new(VectorStore::new(db, Arc::new(HashEmbedder::default())));

        vectors
            .ingest("mine", "alpha only document", &["alpha".to_string()], &[], "kb")
            .await
            .unwrap();
        vectors
            .ingest("theirs", "beta only document", &["beta".to_string()], &[], "kb")
            .await
            .unwrap();
        vectors
            .ingest("shared", "document for everyone", &[], &[], "kb")
            .await
            .unwrap();

        let tool = SearchKnowledgeTool::new(vectors, "kb");
        let result = tool
            .invoke(json!({"query": "document", "top_k": 10}), &ctx_with(0, None))
            .await
            .unwrap();

        let sources: Vec<&str> = result["results"]
            .as_array()
            .unwrap()
            .iter()
            .map(|r| r["source"].as_str().unwrap())
            .collect();
        assert!(sources.contains(&"mine"));
        assert!(sources.contains(&"shared"));
        assert!(!sources.contains(&"theirs"));
    }

    #[tokio::test]
    async fn delegate_runs_through_the_spawner() {
        let spawner = Arc::new(StubSpawner {
            max_depth: 2,
            calls: Mutex::new(Vec::new()),
        });
        let tool = DelegateAgentTool;

        let result = tool
            .invoke(
                json!({"skill_name": "beta", "task": "do a thing"}),
                &ctx_with(0, Some(spawner.clone())),
            )
            .await
            .unwrap();

        assert_eq!(result["status"], "ok");
        assert_eq!(result["skill"], "beta");
        assert_eq!(result["depth"], 1);
        assert_eq!(result["result"], "result from beta");

        let calls = spawner.calls.lock().unwrap();
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].2, 0); // parent depth observed by the spawner
    }

    #[tokio::test]
    async fn delegate_prefixes_context_to_the_task() {
        let spawner = Arc::new(StubSpawner {
            max_depth: 2,
            calls: Mutex::new(Vec::new()),
        });
        let tool = DelegateAgentTool;

        tool.invoke(
            json!({"skill_name": "beta", "task": "summarize", "context": "prior findings"}),
            &ctx_with(0, Some(spawner.clone())),
        )
        .await
        .unwrap();

        let calls = spawner.calls.lock().unwrap();
        assert_eq!(calls[0].1, "prior findings\n\nsummarize");
    }

    #[tokio::test]
    async fn delegate_refuses_past_the_depth_limit() {
        let spawner = Arc::new(StubSpawner {
            max_depth: 1,
            calls: Mutex::new(Vec::new()),
        });
        let tool = DelegateAgentTool;

        // At depth 1 with max 1, one more hop would exceed the limit.
        let result = tool
            .invoke(
                json!({"skill_name": "beta", "task": "x"}),
                &ctx_with(1, Some(spawner.clone())),
            )
            .await
            .unwrap();

        assert!(result["error"].as_str().unwrap().contains("depth"));
        assert_eq!(result["current_depth"], 1);
        assert!(spawner.calls.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn delegate_reports_unknown_skills_as_data() {
        let spawner = Arc::new(StubSpawner {
            max_depth: 3,
            calls: Mutex::new(Vec::new()),
        });
        let tool = DelegateAgentTool;

        let result = tool
            .invoke(
                json!({"skill_name": "missing", "task": "x"}),
                &ctx_with(0, Some(spawner)),
            )
            .await
            .unwrap();

        assert!(result["error"].as_str().unwrap().contains("unknown skill"));
    }

    #[tokio::test]
    async fn delegate_without_spawner_degrades() {
        let tool = DelegateAgentTool;
        let result = tool
            .invoke(json!({"skill_name": "beta", "task": "x"}), &ctx_with(0, None))
            .await
            .unwrap();
        assert!(result["error"].as_str().unwrap().contains("not available"));
    }
}
