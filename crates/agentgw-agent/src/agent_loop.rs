//! The reason–act–observe loop.
//!
//! One [`AgentLoop`] exists per in-flight request. It owns no durable state:
//! it assembles the prompt from the skill and the stored history, streams
//! from the provider, dispatches tool calls sequentially in emission order,
//! persists every exchange as it happens, and emits progress events to an
//! optional sink.
//!
//! Failure policy: tool failures are observations the model reacts to, not
//! errors. Provider failures degrade the run into a final assistant message
//! describing the problem. Cancellation stops at the next suspension point
//! without persisting in-flight output. Only persistence failures propagate.

use std::sync::Arc;

use serde_json::Value;
use tokio::sync::mpsc::UnboundedSender;
use tracing::{debug, info, warn};

use agentgw_skills::{RagContext, Skill};
use agentgw_store::{MessageStore, StoredMessage, VectorStore};

use crate::cancel::CancelHandle;
use crate::error::{AgentError, Result};
use crate::provider::LlmProvider;
use crate::tools::{AgentSpawner, ToolContext, ToolRegistry};
use crate::types::{ChatRequest, FinishReason, Message, Role, ToolCall};

/// Marker appended to a completion cut short by the token limit.
const TRUNCATION_MARKER: &str = "[truncated]";

/// Synthetic reply when the loop exhausts its iteration budget.
const MAX_ITERATIONS_MESSAGE: &str = "maximum iterations reached";

// ---------------------------------------------------------------------------
// Events
// ---------------------------------------------------------------------------

/// Progress events emitted while a loop runs.
#[derive(Debug, Clone)]
pub enum AgentEvent {
    /// A fragment of assistant text, in arrival order.
    TextDelta(String),
    /// A tool call finished executing.
    Tool(ToolEvent),
    /// The run completed; carries the final text.
    Done(String),
}

/// Details of one executed tool call.
#[derive(Debug, Clone)]
pub struct ToolEvent {
    /// The provider-assigned tool call id.
    pub tool_call_id: String,
    /// The tool that ran.
    pub name: String,
    /// Whether the result was an error object.
    pub is_error: bool,
}

// ---------------------------------------------------------------------------
// AgentLoop
// ---------------------------------------------------------------------------

/// Transient coordinator for one request against one skill-bound session.
pub struct AgentLoop {
    skill: Arc<Skill>,
    session_id: String,
    provider: Arc<dyn LlmProvider>,
    registry: Arc<ToolRegistry>,
    messages: MessageStore,
    vectors: VectorStore,
    collection: String,
    depth: u32,
    cancel: CancelHandle,
    spawner: Option<Arc<dyn AgentSpawner>>,
}

impl AgentLoop {
    /// Create a loop at depth zero with a fresh cancellation handle.
    pub fn new(
        skill: Arc<Skill>,
        session_id: impl Into<String>,
        provider: Arc<dyn LlmProvider>,
        registry: Arc<ToolRegistry>,
        messages: MessageStore,
        vectors: VectorStore,
    ) -> Self {
        Self {
            skill,
            session_id: session_id.into(),
            provider,
            registry,
            messages,
            vectors,
            collection: agentgw_store::DEFAULT_COLLECTION.to_string(),
            depth: 0,
            cancel: CancelHandle::new(),
            spawner: None,
        }
    }

    /// Set the orchestration depth this loop starts at.
    pub fn with_depth(mut self, depth: u32) -> Self {
        self.depth = depth;
        self
    }

    /// Attach an external cancellation handle.
    pub fn with_cancel(mut self, cancel: CancelHandle) -> Self {
        self.cancel = cancel;
        self
    }

    /// Attach the delegation entry point tools observe.
    pub fn with_spawner(mut self, spawner: Arc<dyn AgentSpawner>) -> Self {
        self.spawner = Some(spawner);
        self
    }

    /// Override the retrieval collection.
    pub fn with_collection(mut self, collection: impl Into<String>) -> Self {
        self.collection = collection.into();
        self
    }

    /// Run to completion without streaming, returning the final text.
    pub async fn run_to_completion(&self, user_input: &str) -> Result<String> {
        self.run(user_input, None).await
    }

    /// Run the loop. Text deltas, tool events, and the final `Done` are
    /// pushed into `events` when a sink is given; the final text is also the
    /// return value.
    pub async fn run(
        &self,
        user_input: &str,
        events: Option<&UnboundedSender<AgentEvent>>,
    ) -> Result<String> {
        info!(
            skill = %self.skill.name,
            session = %self.session_id,
            depth = self.depth,
            "agent loop starting"
        );

        let mut conversation = self.assemble_prompt(user_input).await?;
        self.messages
            .append(&self.session_id, Role::User.as_str(), user_input, None, None)
            .await?;
        conversation.push(Message::user(user_input));

        let tools = self.registry.definitions_for(&self.skill.tools);

        for iteration in 1..=self.skill.max_iterations {
            if self.cancel.is_cancelled() {
                return Err(AgentError::Cancelled);
            }

            debug!(iteration, "streaming from provider");

            let request = ChatRequest {
                model: self.skill.model.clone().unwrap_or_default(),
                messages: conversation.clone(),
                tools: tools.clone(),
                temperature: self.skill.temperature,
                max_tokens: None,
            };

            let mut streamed = String::new();
            let result = {
                let mut on_text = |delta: &str| {
                    streamed.push_str(delta);
                    emit(events, AgentEvent::TextDelta(delta.to_string()));
                };
                self.provider.stream(&request, &mut on_text).await
            };

            let completion = match result {
                Ok(completion) => completion,
                Err(e) if e.is_provider_error() => {
                    // Degrade: keep whatever text arrived, note the failure.
                    warn!(error = %e, "provider failed mid-run");
                    let text = if streamed.is_empty() {
                        format!("[provider error: {e}]")
                    } else {
                        format!("{streamed} [provider error: {e}]")
                    };
                    self.messages
                        .append(&self.session_id, Role::Assistant.as_str(), &text, None, None)
                        .await?;
                    emit(events, AgentEvent::Done(text.clone()));
                    return Ok(text);
                }
                Err(e) => return Err(e),
            };

            if completion.tool_calls.is_empty() {
                return match completion.finish {
                    FinishReason::Length => {
                        self.messages
                            .append(
                                &self.session_id,
                                Role::Assistant.as_str(),
                                &completion.text,
                                None,
                                None,
                            )
                            .await?;
                        let done = format!("{}{TRUNCATION_MARKER}", completion.text);
                        emit(events, AgentEvent::Done(done.clone()));
                        Ok(done)
                    }
                    _ => {
                        self.messages
                            .append(
                                &self.session_id,
                                Role::Assistant.as_str(),
                                &completion.text,
                                None,
                                None,
                            )
                            .await?;
                        emit(events, AgentEvent::Done(completion.text.clone()));
                        Ok(completion.text)
                    }
                };
            }

            // Tool-call turn. Text streamed alongside the calls is still
            // the assistant content of this turn, persisted before the tool
            // messages.
            let calls_json = serde_json::to_string(&completion.tool_calls)?;
            self.messages
                .append(
                    &self.session_id,
                    Role::Assistant.as_str(),
                    &completion.text,
                    Some(&calls_json),
                    None,
                )
                .await?;
            conversation.push(Message::assistant_with_tool_calls(
                completion.text.clone(),
                completion.tool_calls.clone(),
            ));

            for call in &completion.tool_calls {
                if self.cancel.is_cancelled() {
                    return Err(AgentError::Cancelled);
                }

                let result = self.execute_tool(call).await;

                // Cancellation during the handler: drop the result.
                if self.cancel.is_cancelled() {
                    return Err(AgentError::Cancelled);
                }

                let is_error = result
                    .as_object()
                    .is_some_and(|o| o.contains_key("error"));
                let content = match &result {
                    Value::String(s) => s.clone(),
                    other => other.to_string(),
                };

                self.messages
                    .append(
                        &self.session_id,
                        Role::Tool.as_str(),
                        &content,
                        None,
                        Some(&call.id),
                    )
                    .await?;
                conversation.push(Message::tool_result(&call.id, &content));

                emit(
                    events,
                    AgentEvent::Tool(ToolEvent {
                        tool_call_id: call.id.clone(),
                        name: call.name.clone(),
                        is_error,
                    }),
                );
            }

            debug!(iteration, calls = completion.tool_calls.len(), "tool turn finished");
        }

        // Iteration overflow.
        warn!(
            skill = %self.skill.name,
            max_iterations = self.skill.max_iterations,
            "iteration budget exhausted"
        );
        self.messages
            .append(
                &self.session_id,
                Role::Assistant.as_str(),
                MAX_ITERATIONS_MESSAGE,
                None,
                None,
            )
            .await?;
        emit(events, AgentEvent::Done(MAX_ITERATIONS_MESSAGE.to_string()));
        Ok(MAX_ITERATIONS_MESSAGE.to_string())
    }

    // -----------------------------------------------------------------------
    // Prompt assembly
    // -----------------------------------------------------------------------

    /// Build the prompt prefix: system prompt, retrieved context, few-shot
    /// examples, then the stored history. The new user message is appended
    /// by the caller after it is persisted.
    async fn assemble_prompt(&self, user_input: &str) -> Result<Vec<Message>> {
        let mut conversation = vec![Message::system(&self.skill.system_prompt)];

        if let Some(rag) = &self.skill.rag_context
            && rag.enabled
        {
            match self.retrieval_context(user_input, rag).await {
                Ok(Some(context)) => conversation.push(Message::system(context)),
                Ok(None) => {}
                Err(e) => {
                    // Retrieval trouble degrades to an uninformed answer.
                    warn!(error = %e, "retrieval failed, continuing without context");
                }
            }
        }

        for example in &self.skill.examples {
            conversation.push(Message::user(&example.user));
            conversation.push(Message::assistant(&example.assistant));
        }

        let history = self.messages.list(&self.session_id).await?;
        conversation.extend(conversation_from_history(&history));

        Ok(conversation)
    }

    /// Run the retrieval query for this request and format the injected
    /// context block.
    async fn retrieval_context(
        &self,
        query: &str,
        rag: &RagContext,
    ) -> Result<Option<String>> {
        let skills = if rag.skills.is_empty() {
            vec![self.skill.name.clone()]
        } else {
            rag.skills.clone()
        };

        let results = self
            .vectors
            .search(query, &self.collection, &skills, &rag.tags, rag.top_k as usize)
            .await?;

        if results.is_empty() {
            return Ok(None);
        }

        let mut context = String::from("Relevant context retrieved for this request:\n");
        for result in &results {
            context.push('\n');
            context.push_str(&format!("[{}] {}", result.chunk.source, result.chunk.text));
            context.push('\n');
        }
        Ok(Some(context))
    }

    // -----------------------------------------------------------------------
    // Tool dispatch
    // -----------------------------------------------------------------------

    /// Execute one tool call, enforcing the skill's allow-list.
    async fn execute_tool(&self, call: &ToolCall) -> Value {
        if !self.skill.allows_tool(&call.name) {
            warn!(tool = %call.name, skill = %self.skill.name, "tool not on allow-list");
            return serde_json::json!({
                "error": format!("tool `{}` is not allowed for this skill", call.name),
                "kind": "tool_not_allowed",
            });
        }

        let ctx = ToolContext {
            session_id: self.session_id.clone(),
            skill: self.skill.name.clone(),
            depth: self.depth,
            cancel: self.cancel.clone(),
            spawner: self.spawner.clone(),
        };

        self.registry
            .invoke(&call.name, call.arguments.clone(), &ctx)
            .await
    }
}

/// Send an event if a sink is attached; a dropped receiver is not an error.
fn emit(events: Option<&UnboundedSender<AgentEvent>>, event: AgentEvent) {
    if let Some(tx) = events {
        let _ = tx.send(event);
    }
}

/// Rebuild the in-memory conversation from persisted rows.
///
/// A trailing assistant message with unanswered tool calls, the residue of
/// a cancelled run, is compacted away so the prompt stays a valid
/// conversation. The stored history is left untouched.
fn conversation_from_history(rows: &[StoredMessage]) -> Vec<Message> {
    let mut conversation: Vec<Message> = Vec::with_capacity(rows.len());

    for row in rows {
        let Some(role) = Role::parse(&row.role) else {
            warn!(role = %row.role, id = row.id, "skipping message with unknown role");
            continue;
        };

        let tool_calls: Vec<ToolCall> = row
            .tool_calls_json
            .as_deref()
            .and_then(|json| serde_json::from_str(json).ok())
            .unwrap_or_default();

        conversation.push(Message {
            role,
            content: row.content.clone(),
            tool_calls,
            tool_call_id: row.tool_call_id.clone(),
        });
    }

    while conversation
        .last()
        .is_some_and(|m| m.role == Role::Assistant && !m.tool_calls.is_empty())
    {
        conversation.pop();
    }

    conversation
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::provider::TextSink;
    use crate::tools::{Tool, object_schema};
    use crate::types::{Completion, ToolDefinition, Usage};
    use agentgw_store::{Db, HashEmbedder};
    use async_trait::async_trait;
    use serde_json::json;
    use std::collections::VecDeque;
    use std::sync::Mutex;
    use tokio::sync::mpsc;

    // ── scripted provider ────────────────────────────────────────────

    enum Step {
        Reply(Completion),
        TextThenError(String, String),
        Error(String),
    }

    struct ScriptedProvider {
        steps: Mutex<VecDeque<Step>>,
        requests: Mutex<Vec<ChatRequest>>,
    }

    impl ScriptedProvider {
        fn new(steps: Vec<Step>) -> Arc<Self> {
            Arc::new(Self {
                steps: Mutex::new(steps.into()),
                requests: Mutex::new(Vec::new()),
            })
        }

        fn recorded_requests(&self) -> Vec<ChatRequest> {
            self.requests.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl LlmProvider for ScriptedProvider {
        fn name(&self) -> &str {
            "scripted"
        }

        fn default_model(&self) -> &str {
            "scripted-model"
        }

        async fn stream(
            &self,
            request: &ChatRequest,
            on_text: TextSink<'_>,
        ) -> Result<Completion> {
            self.requests.lock().unwrap().push(request.clone());
            let step = self
                .steps
                .lock()
                .unwrap()
                .pop_front()
                .expect("provider script exhausted");

            match step {
                Step::Reply(completion) => {
                    if !completion.text.is_empty() {
                        on_text(&completion.text);
                    }
                    Ok(completion)
                }
                Step::TextThenError(text, reason) => {
                    on_text(&text);
                    Err(AgentError::ProviderStream { reason })
                }
                Step::Error(reason) => Err(AgentError::ProviderRequest { reason }),
            }
        }
    }

    fn text_reply(text: &str) -> Step {
        Step::Reply(Completion {
            text: text.into(),
            tool_calls: vec![],
            finish: FinishReason::Stop,
            usage: Usage::default(),
        })
    }

    fn tool_reply(text: &str, calls: Vec<ToolCall>) -> Step {
        Step::Reply(Completion {
            text: text.into(),
            tool_calls: calls,
            finish: FinishReason::ToolCalls,
            usage: Usage::default(),
        })
    }

    fn call(id: &str, name: &str, arguments: Value) -> ToolCall {
        ToolCall {
            id: id.into(),
            name: name.into(),
            arguments,
        }
    }

    // ── test tools ───────────────────────────────────────────────────

    struct AddTool;

    #[async_trait]
    impl Tool for AddTool {
        fn definition(&self) -> ToolDefinition {
            ToolDefinition {
                name: "add".into(),
                description: "Add two integers".into(),
                input_schema: object_schema(
                    json!({
                        "a": { "type": "integer" },
                        "b": { "type": "integer" },
                    }),
                    &["a", "b"],
                ),
            }
        }

        async fn invoke(&self, arguments: Value, _ctx: &ToolContext) -> Result<Value> {
            let a = arguments["a"].as_i64().unwrap_or(0);
            let b = arguments["b"].as_i64().unwrap_or(0);
            Ok(json!(a + b))
        }
    }

    /// Trips the run's cancel flag from inside the handler, simulating a
    /// client disconnect racing a tool execution.
    struct SelfCancellingTool;

    #[async_trait]
    impl Tool for SelfCancellingTool {
        fn definition(&self) -> ToolDefinition {
            ToolDefinition {
                name: "slow_tool".into(),
                description: "Takes long enough to be cancelled".into(),
                input_schema: object_schema(json!({}), &[]),
            }
        }

        async fn invoke(&self, _arguments: Value, ctx: &ToolContext) -> Result<Value> {
            ctx.cancel.cancel();
            Ok(json!("never observed"))
        }
    }

    // ── fixture ──────────────────────────────────────────────────────

    struct Fixture {
        messages: MessageStore,
        vectors: VectorStore,
        registry: Arc<ToolRegistry>,
        session_id: String,
    }

    async fn fixture() -> Fixture {
        let db = Db::open_in_memory().unwrap();
        db.migrate().await.unwrap();
        let messages = MessageStore::new(db.clone());
        let vectors = VectorStore::new(db, Arc::new(HashEmbedder::default()));
        let registry = Arc::new(ToolRegistry::new());
        registry.register(Arc::new(AddTool)).unwrap();
        registry.register(Arc::new(SelfCancellingTool)).unwrap();

        let session = messages.create_session("tester").await.unwrap();
        Fixture {
            messages,
            vectors,
            registry,
            session_id: session.id,
        }
    }

    fn skill(tools: &[&str], max_iterations: u32) -> Arc<Skill> {
        Arc::new(Skill {
            name: "tester".into(),
            description: "test skill".into(),
            system_prompt: "You are a test agent.".into(),
            tools: tools.iter().map(|s| s.to_string()).collect(),
            model: None,
            temperature: None,
            max_iterations,
            tags: vec![],
            examples: vec![],
            sub_agents: vec![],
            rag_context: None,
        })
    }

    fn agent_loop(fx: &Fixture, skill: Arc<Skill>, provider: Arc<ScriptedProvider>) -> AgentLoop {
        AgentLoop::new(
            skill,
            fx.session_id.clone(),
            provider,
            Arc::clone(&fx.registry),
            fx.messages.clone(),
            fx.vectors.clone(),
        )
    }

    // ── scenarios ────────────────────────────────────────────────────

    #[tokio::test]
    async fn no_tool_chat_persists_one_exchange() {
        let fx = fixture().await;
        let provider = ScriptedProvider::new(vec![text_reply("hi")]);
        let agent = agent_loop(&fx, skill(&[], 5), provider);

        let (tx, mut rx) = mpsc::unbounded_channel();
        let result = agent.run("hello", Some(&tx)).await.unwrap();
        assert_eq!(result, "hi");

        let persisted = fx.messages.list(&fx.session_id).await.unwrap();
        let roles: Vec<&str> = persisted.iter().map(|m| m.role.as_str()).collect();
        assert_eq!(roles, ["user", "assistant"]);
        assert_eq!(persisted[1].content, "hi");

        drop(tx);
        let mut saw_delta = false;
        let mut saw_done = false;
        while let Some(event) = rx.recv().await {
            match event {
                AgentEvent::TextDelta(t) => {
                    assert_eq!(t, "hi");
                    saw_delta = true;
                }
                AgentEvent::Done(t) => {
                    assert_eq!(t, "hi");
                    saw_done = true;
                }
                AgentEvent::Tool(_) => panic!("no tool events expected"),
            }
        }
        assert!(saw_delta && saw_done);
    }

    #[tokio::test]
    async fn single_tool_call_round_trip() {
        let fx = fixture().await;
        let provider = ScriptedProvider::new(vec![
            tool_reply("", vec![call("tc_1", "add", json!({"a": 2, "b": 3}))]),
            text_reply("5"),
        ]);
        let agent = agent_loop(&fx, skill(&["add"], 5), provider);

        let result = agent.run_to_completion("add 2 and 3").await.unwrap();
        assert_eq!(result, "5");

        let persisted = fx.messages.list(&fx.session_id).await.unwrap();
        let roles: Vec<&str> = persisted.iter().map(|m| m.role.as_str()).collect();
        assert_eq!(roles, ["user", "assistant", "tool", "assistant"]);

        // The tool message answers exactly the emitted call.
        assert_eq!(persisted[2].tool_call_id.as_deref(), Some("tc_1"));
        assert_eq!(persisted[2].content, "5");

        let calls: Vec<ToolCall> =
            serde_json::from_str(persisted[1].tool_calls_json.as_deref().unwrap()).unwrap();
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].id, "tc_1");
    }

    #[tokio::test]
    async fn tool_calls_dispatch_in_emission_order() {
        let fx = fixture().await;
        let provider = ScriptedProvider::new(vec![
            tool_reply(
                "",
                vec![
                    call("tc_a", "add", json!({"a": 1, "b": 1})),
                    call("tc_b", "add", json!({"a": 2, "b": 2})),
                ],
            ),
            text_reply("done"),
        ]);
        let agent = agent_loop(&fx, skill(&["add"], 5), provider);
        agent.run_to_completion("go").await.unwrap();

        let persisted = fx.messages.list(&fx.session_id).await.unwrap();
        let tool_ids: Vec<&str> = persisted
            .iter()
            .filter(|m| m.role == "tool")
            .map(|m| m.tool_call_id.as_deref().unwrap())
            .collect();
        assert_eq!(tool_ids, ["tc_a", "tc_b"]);
        assert_eq!(persisted[2].content, "2");
        assert_eq!(persisted[3].content, "4");
    }

    #[tokio::test]
    async fn disallowed_tool_becomes_an_error_observation() {
        let fx = fixture().await;
        let provider = ScriptedProvider::new(vec![
            tool_reply("", vec![call("tc_1", "add", json!({"a": 1, "b": 1}))]),
            text_reply("understood"),
        ]);
        // Skill has no tools at all.
        let agent = agent_loop(&fx, skill(&[], 5), provider);

        let result = agent.run_to_completion("try anyway").await.unwrap();
        assert_eq!(result, "understood");

        let persisted = fx.messages.list(&fx.session_id).await.unwrap();
        let tool_msg = persisted.iter().find(|m| m.role == "tool").unwrap();
        assert!(tool_msg.content.contains("not allowed"));
    }

    #[tokio::test]
    async fn interleaved_text_is_persisted_with_the_tool_turn() {
        let fx = fixture().await;
        let provider = ScriptedProvider::new(vec![
            tool_reply(
                "let me compute that",
                vec![call("tc_1", "add", json!({"a": 4, "b": 4}))],
            ),
            text_reply("8"),
        ]);
        let agent = agent_loop(&fx, skill(&["add"], 5), provider);
        agent.run_to_completion("compute").await.unwrap();

        let persisted = fx.messages.list(&fx.session_id).await.unwrap();
        // Assistant text travels with the tool-call turn, before the tool
        // message.
        assert_eq!(persisted[1].role, "assistant");
        assert_eq!(persisted[1].content, "let me compute that");
        assert_eq!(persisted[2].role, "tool");
    }

    #[tokio::test]
    async fn provider_error_persists_partial_text_with_marker() {
        let fx = fixture().await;
        let provider = ScriptedProvider::new(vec![Step::TextThenError(
            "partial answer".into(),
            "connection reset".into(),
        )]);
        let agent = agent_loop(&fx, skill(&[], 5), provider);

        let result = agent.run_to_completion("hello").await.unwrap();
        assert!(result.starts_with("partial answer"));
        assert!(result.contains("[provider error:"));

        let persisted = fx.messages.list(&fx.session_id).await.unwrap();
        assert_eq!(persisted[1].role, "assistant");
        assert!(persisted[1].content.contains("partial answer"));
        assert!(persisted[1].content.contains("connection reset"));
    }

    #[tokio::test]
    async fn provider_error_without_text_still_degrades() {
        let fx = fixture().await;
        let provider = ScriptedProvider::new(vec![Step::Error("rate limited".into())]);
        let agent = agent_loop(&fx, skill(&[], 5), provider);

        let result = agent.run_to_completion("hello").await.unwrap();
        assert!(result.contains("rate limited"));
    }

    #[tokio::test]
    async fn length_finish_truncates() {
        let fx = fixture().await;
        let provider = ScriptedProvider::new(vec![Step::Reply(Completion {
            text: "partial".into(),
            tool_calls: vec![],
            finish: FinishReason::Length,
            usage: Usage::default(),
        })]);
        let agent = agent_loop(&fx, skill(&[], 5), provider);

        let result = agent.run_to_completion("hello").await.unwrap();
        assert_eq!(result, "partial[truncated]");

        let persisted = fx.messages.list(&fx.session_id).await.unwrap();
        assert_eq!(persisted[1].content, "partial");
    }

    #[tokio::test]
    async fn iteration_overflow_emits_synthetic_message() {
        let fx = fixture().await;
        let provider = ScriptedProvider::new(vec![
            tool_reply("", vec![call("t1", "add", json!({"a": 1, "b": 1}))]),
            tool_reply("", vec![call("t2", "add", json!({"a": 1, "b": 1}))]),
        ]);
        let agent = agent_loop(&fx, skill(&["add"], 2), provider.clone());

        let result = agent.run_to_completion("loop forever").await.unwrap();
        assert_eq!(result, MAX_ITERATIONS_MESSAGE);

        // Exactly max_iterations provider calls were made.
        assert_eq!(provider.recorded_requests().len(), 2);

        let persisted = fx.messages.list(&fx.session_id).await.unwrap();
        assert_eq!(persisted.last().unwrap().content, MAX_ITERATIONS_MESSAGE);
    }

    #[tokio::test]
    async fn cancel_during_tool_drops_the_result() {
        let fx = fixture().await;
        let provider = ScriptedProvider::new(vec![tool_reply(
            "",
            vec![call("tc_1", "slow_tool", json!({}))],
        )]);
        let agent = agent_loop(&fx, skill(&["slow_tool"], 5), provider);

        let result = agent.run_to_completion("start something slow").await;
        assert!(matches!(result, Err(AgentError::Cancelled)));

        // The assistant tool-call turn is persisted; the tool result is not.
        let persisted = fx.messages.list(&fx.session_id).await.unwrap();
        let roles: Vec<&str> = persisted.iter().map(|m| m.role.as_str()).collect();
        assert_eq!(roles, ["user", "assistant"]);
        assert!(persisted[1].tool_calls_json.is_some());
    }

    #[tokio::test]
    async fn pre_cancelled_loop_aborts_before_streaming() {
        let fx = fixture().await;
        let provider = ScriptedProvider::new(vec![text_reply("never")]);
        let cancel = CancelHandle::new();
        cancel.cancel();
        let agent =
            agent_loop(&fx, skill(&[], 5), provider.clone()).with_cancel(cancel);

        let result = agent.run_to_completion("hello").await;
        assert!(matches!(result, Err(AgentError::Cancelled)));
        assert!(provider.recorded_requests().is_empty());
    }

    #[tokio::test]
    async fn resumed_session_compacts_orphan_tool_call_tail() {
        let fx = fixture().await;

        // Residue of a cancelled run: assistant with unanswered tool calls.
        fx.messages
            .append(&fx.session_id, "user", "earlier question", None, None)
            .await
            .unwrap();
        fx.messages
            .append(
                &fx.session_id,
                "assistant",
                "",
                Some(r#"[{"id":"orphan","name":"add","arguments":{}}]"#),
                None,
            )
            .await
            .unwrap();

        let provider = ScriptedProvider::new(vec![text_reply("fresh answer")]);
        let agent = agent_loop(&fx, skill(&[], 5), provider.clone());
        agent.run_to_completion("new question").await.unwrap();

        let request = &provider.recorded_requests()[0];
        assert!(
            request
                .messages
                .iter()
                .all(|m| m.tool_calls.is_empty()),
            "orphan tool-call assistant message leaked into the prompt"
        );
        // The earlier user turn is still present.
        assert!(
            request
                .messages
                .iter()
                .any(|m| m.content == "earlier question")
        );
    }

    #[tokio::test]
    async fn examples_expand_to_user_assistant_pairs() {
        let fx = fixture().await;
        let mut s = (*skill(&[], 5)).clone();
        s.examples = vec![agentgw_skills::ExamplePair {
            user: "example question".into(),
            assistant: "example answer".into(),
        }];
        let provider = ScriptedProvider::new(vec![text_reply("ok")]);
        let agent = agent_loop(&fx, Arc::new(s), provider.clone());
        agent.run_to_completion("real question").await.unwrap();

        let request = &provider.recorded_requests()[0];
        let pair_pos = request
            .messages
            .iter()
            .position(|m| m.content == "example question")
            .expect("example user message missing");
        assert_eq!(request.messages[pair_pos].role, Role::User);
        assert_eq!(request.messages[pair_pos + 1].role, Role::Assistant);
        assert_eq!(request.messages[pair_pos + 1].content, "example answer");
        // The real user input comes last.
        assert_eq!(request.messages.last().unwrap().content, "real question");
    }

    #[tokio::test]
    async fn rag_context_is_injected_as_second_system_message() {
        let fx = fixture().await;
        fx.vectors
            .ingest(
                "kb-doc",
                "agentgw is a local agent daemon",
                &["tester".to_string()],
                &[],
                agentgw_store::DEFAULT_COLLECTION,
            )
            .await
            .unwrap();

        let mut s = (*skill(&[], 5)).clone();
        s.rag_context = Some(RagContext {
            enabled: true,
            skills: vec![],
            tags: vec![],
            top_k: 3,
        });

        let provider = ScriptedProvider::new(vec![text_reply("ok")]);
        let agent = agent_loop(&fx, Arc::new(s), provider.clone());
        agent.run_to_completion("what is agentgw").await.unwrap();

        let request = &provider.recorded_requests()[0];
        assert_eq!(request.messages[0].role, Role::System);
        assert_eq!(request.messages[1].role, Role::System);
        assert!(request.messages[1].content.contains("local agent daemon"));
        assert!(request.messages[1].content.contains("kb-doc"));
    }

    #[tokio::test]
    async fn disabled_rag_skips_retrieval() {
        let fx = fixture().await;
        fx.vectors
            .ingest(
                "kb-doc",
                "should not appear",
                &[],
                &[],
                agentgw_store::DEFAULT_COLLECTION,
            )
            .await
            .unwrap();

        let mut s = (*skill(&[], 5)).clone();
        s.rag_context = Some(RagContext {
            enabled: false,
            skills: vec![],
            tags: vec![],
            top_k: 3,
        });

        let provider = ScriptedProvider::new(vec![text_reply("ok")]);
        let agent = agent_loop(&fx, Arc::new(s), provider.clone());
        agent.run_to_completion("anything").await.unwrap();

        let request = &provider.recorded_requests()[0];
        let system_count = request
            .messages
            .iter()
            .filter(|m| m.role == Role::System)
            .count();
        assert_eq!(system_count, 1);
    }
}
