//! The service object.
//!
//! One [`Service`] per process owns every long-lived component: stores,
//! provider, tool registry, skill set, and the event bus. Interactive
//! clients, scheduled jobs, and delegated sub-agents all run through it, so
//! the per-session ordering guarantees live here: a `DashMap` of session
//! locks ensures no two loops advance the same session concurrently.

use std::collections::HashSet;
use std::sync::{Arc, OnceLock, Weak};

use async_trait::async_trait;
use dashmap::DashMap;
use serde::Serialize;
use serde_json::json;
use tokio::sync::mpsc::{UnboundedReceiver, UnboundedSender, unbounded_channel};
use tracing::{info, warn};

use agentgw_agent::{
    AgentError, AgentEvent, AgentLoop, AgentSpawner, CancelHandle, CurrentTimeTool,
    DelegateAgentTool, LlmProvider, SearchKnowledgeTool, ToolRegistry,
};
use agentgw_skills::{Skill, SkillSet, load_skills_from_dir};
use agentgw_store::{
    DEFAULT_COLLECTION, Db, Embedder, HashEmbedder, MessageStore, OpenAiEmbedder, StoredMessage,
    StoredSession, VectorStore,
};

use crate::config::Config;
use crate::error::{Result, ServiceError};
use crate::events::{Event, EventBus, EventKind};

/// A streaming chat handle: the session the run is bound to, the event
/// receiver, and a cancel handle tripped on client disconnect or explicit
/// cancel.
pub struct ChatStream {
    pub session_id: String,
    pub events: UnboundedReceiver<AgentEvent>,
    pub cancel: CancelHandle,
}

/// Result of a non-streaming run.
#[derive(Debug, Clone, Serialize)]
pub struct RunOutcome {
    pub session_id: String,
    pub result: String,
}

/// Planner output for `/api/route`.
#[derive(Debug, Clone, Serialize)]
pub struct RouteDecision {
    pub skill_name: String,
    pub reason: String,
}

/// Skill listing entry.
#[derive(Debug, Clone, Serialize)]
pub struct SkillSummary {
    pub name: String,
    pub description: String,
    pub tags: Vec<String>,
    pub tools: Vec<String>,
}

/// Service health information.
#[derive(Debug, Clone, Serialize)]
pub struct ServiceStatus {
    pub version: &'static str,
    pub provider: String,
    pub model: String,
    pub embedder: String,
    pub skill_count: usize,
    pub session_count: i64,
}

/// The daemon's shared service object.
pub struct Service {
    config: Config,
    skills: SkillSet,
    registry: Arc<ToolRegistry>,
    provider: Arc<dyn LlmProvider>,
    messages: MessageStore,
    vectors: VectorStore,
    bus: EventBus,
    session_locks: DashMap<String, Arc<tokio::sync::Mutex<()>>>,
    self_ref: OnceLock<Weak<Service>>,
}

impl Service {
    /// Assemble the service: open and migrate the database, build the
    /// embedder and vector store, register built-in tools, and load skills.
    ///
    /// Returns the service and the receiver end of the event bus, which the
    /// caller hands to the webhook dispatcher.
    pub async fn new(
        config: Config,
        provider: Arc<dyn LlmProvider>,
    ) -> Result<(Arc<Self>, UnboundedReceiver<Event>)> {
        // `Db::open` understands the `:memory:` sentinel, so the config
        // path goes straight through.
        let db = Db::open(&config.storage.db_path)?;
        db.migrate().await?;

        let embedder = build_embedder(&config)?;
        let messages = MessageStore::new(db.clone());
        let vectors = VectorStore::new(db, embedder);

        let registry = Arc::new(ToolRegistry::new());
        registry.register(Arc::new(CurrentTimeTool))?;
        registry.register(Arc::new(SearchKnowledgeTool::new(
            Arc::new(vectors.clone()),
            DEFAULT_COLLECTION,
        )))?;
        registry.register(Arc::new(DelegateAgentTool))?;

        let skills = SkillSet::from_skills(load_skills_from_dir(
            &config.storage.skills_dir,
            &registry.names(),
        )?);
        info!(
            skills = skills.len(),
            tools = registry.names().len(),
            provider = provider.name(),
            "service assembled"
        );

        let (bus, rx) = EventBus::new();
        let service = Arc::new(Self {
            config,
            skills,
            registry,
            provider,
            messages,
            vectors,
            bus,
            session_locks: DashMap::new(),
            self_ref: OnceLock::new(),
        });
        let _ = service.self_ref.set(Arc::downgrade(&service));

        Ok((service, rx))
    }

    // -----------------------------------------------------------------------
    // Interactive entry points
    // -----------------------------------------------------------------------

    /// Start a streaming chat. The loop runs in the background; text deltas,
    /// tool events, and the final `Done` flow through the returned receiver.
    pub async fn chat(
        self: &Arc<Self>,
        skill_name: &str,
        message: &str,
        session_id: Option<&str>,
    ) -> Result<ChatStream> {
        let (skill, session) = self.resolve_session(skill_name, session_id).await?;

        let (tx_int, rx_int) = unbounded_channel();
        let (tx_pub, rx_pub) = unbounded_channel();
        let cancel = CancelHandle::new();

        self.spawn_relay(session.id.clone(), rx_int, Some(tx_pub), cancel.clone());

        let this = Arc::clone(self);
        let session_id = session.id.clone();
        let message = message.to_string();
        let run_cancel = cancel.clone();
        tokio::spawn(async move {
            let lock = this.session_lock(&session_id);
            let _guard = lock.lock().await;
            let _ = this
                .execute(skill, session_id, message, 0, run_cancel, Some(tx_int))
                .await;
        });

        Ok(ChatStream {
            session_id: session.id,
            events: rx_pub,
            cancel,
        })
    }

    /// Run a request to completion and return the final text. Used by the
    /// REST `run` endpoint, the scheduler, and the CLI.
    pub async fn run(
        self: &Arc<Self>,
        skill_name: &str,
        message: &str,
        session_id: Option<&str>,
    ) -> Result<RunOutcome> {
        let (skill, session) = self.resolve_session(skill_name, session_id).await?;

        let lock = self.session_lock(&session.id);
        let _guard = lock.lock().await;

        let (tx_int, rx_int) = unbounded_channel();
        let cancel = CancelHandle::new();
        self.spawn_relay(session.id.clone(), rx_int, None, cancel.clone());

        let result = self
            .execute(
                skill,
                session.id.clone(),
                message.to_string(),
                0,
                cancel,
                Some(tx_int),
            )
            .await?;

        Ok(RunOutcome {
            session_id: session.id,
            result,
        })
    }

    /// Ingest a document into the knowledge base.
    pub async fn ingest(
        &self,
        text: &str,
        source: &str,
        skills: &[String],
        tags: &[String],
        collection: Option<&str>,
    ) -> Result<usize> {
        let collection = collection.unwrap_or(DEFAULT_COLLECTION);
        Ok(self
            .vectors
            .ingest(source, text, skills, tags, collection)
            .await?)
    }

    /// Record feedback on an assistant message.
    pub async fn feedback(&self, message_id: i64, value: i32) -> Result<()> {
        self.messages.set_feedback(message_id, value).await?;
        self.bus.emit(
            EventKind::FeedbackReceived,
            json!({ "message_id": message_id, "value": value }),
        );
        Ok(())
    }

    /// Pick the skill best suited for a free-form message.
    ///
    /// Deterministic keyword scoring over skill names, tags, and
    /// descriptions, usable even when the provider is down.
    pub fn route(&self, message: &str) -> Result<RouteDecision> {
        let snapshot = self.skills.snapshot();
        if snapshot.is_empty() {
            return Err(ServiceError::InvalidRequest {
                reason: "no skills loaded".into(),
            });
        }

        let message_tokens = tokenize(message);
        let mut best: Option<(i64, String, Vec<String>)> = None;

        let mut names: Vec<&String> = snapshot.keys().collect();
        names.sort();

        for name in names {
            let skill = &snapshot[name];
            let mut score = 0i64;
            let mut matched: Vec<String> = Vec::new();

            for token in tokenize(&skill.name) {
                if message_tokens.contains(&token) {
                    score += 3;
                    matched.push(token);
                }
            }
            for tag in &skill.tags {
                for token in tokenize(tag) {
                    if message_tokens.contains(&token) {
                        score += 2;
                        matched.push(token);
                    }
                }
            }
            for token in tokenize(&skill.description) {
                if message_tokens.contains(&token) {
                    score += 1;
                    matched.push(token);
                }
            }

            if best.as_ref().is_none_or(|(s, _, _)| score > *s) {
                best = Some((score, name.clone(), matched));
            }
        }

        let (score, skill_name, mut matched) = best.expect("non-empty skill set");
        matched.sort();
        matched.dedup();

        let reason = if score > 0 {
            format!("matched routing terms: {}", matched.join(", "))
        } else {
            "no keyword overlap with any skill; defaulting to the first".to_string()
        };

        Ok(RouteDecision { skill_name, reason })
    }

    // -----------------------------------------------------------------------
    // Listings & status
    // -----------------------------------------------------------------------

    /// Summaries of every loaded skill.
    pub fn skill_summaries(&self) -> Vec<SkillSummary> {
        let snapshot = self.skills.snapshot();
        let mut summaries: Vec<SkillSummary> = snapshot
            .values()
            .map(|s| SkillSummary {
                name: s.name.clone(),
                description: s.description.clone(),
                tags: s.tags.clone(),
                tools: s.tools.clone(),
            })
            .collect();
        summaries.sort_by(|a, b| a.name.cmp(&b.name));
        summaries
    }

    /// List sessions, optionally filtered by skill.
    pub async fn sessions(
        &self,
        skill: Option<&str>,
        limit: u32,
    ) -> Result<Vec<StoredSession>> {
        Ok(self.messages.list_sessions(skill, limit).await?)
    }

    /// Ordered messages of one session.
    pub async fn session_messages(&self, session_id: &str) -> Result<Vec<StoredMessage>> {
        // Surface a NotFound for unknown sessions rather than an empty list.
        self.messages.get_session(session_id).await?;
        Ok(self.messages.list(session_id).await?)
    }

    /// List document previews from the knowledge base.
    pub async fn documents(
        &self,
        collection: Option<&str>,
        skills: &[String],
        source_substring: Option<&str>,
        limit: usize,
    ) -> Result<Vec<agentgw_store::ChunkPreview>> {
        let collection = collection.unwrap_or(DEFAULT_COLLECTION);
        Ok(self
            .vectors
            .list(collection, skills, source_substring, limit)
            .await?)
    }

    /// Delete chunks by id.
    pub async fn delete_documents(&self, ids: &[String]) -> Result<usize> {
        Ok(self.vectors.delete(ids).await?)
    }

    /// Delete every chunk of a source.
    pub async fn delete_documents_by_source(&self, source: &str) -> Result<usize> {
        Ok(self.vectors.delete_by_source(source).await?)
    }

    /// Reload the skills directory and swap the live set. Returns the new
    /// skill count.
    pub async fn reload_skills(&self) -> Result<usize> {
        let skills =
            load_skills_from_dir(&self.config.storage.skills_dir, &self.registry.names())?;
        let count = skills.len();
        self.skills.swap(skills);
        info!(count, "skills reloaded");
        Ok(count)
    }

    /// Service health for `/health` and `/daemon/status`.
    pub async fn status(&self) -> Result<ServiceStatus> {
        Ok(ServiceStatus {
            version: env!("CARGO_PKG_VERSION"),
            provider: self.provider.name().to_string(),
            model: self.provider.default_model().to_string(),
            embedder: self.vectors.embedder_name(),
            skill_count: self.skills.len(),
            session_count: self.messages.count_sessions().await?,
        })
    }

    /// Startup probe against the configured provider.
    pub async fn probe_provider(&self) -> Result<()> {
        Ok(self.provider.probe().await?)
    }

    /// The loaded configuration.
    pub fn config(&self) -> &Config {
        &self.config
    }

    // -----------------------------------------------------------------------
    // Internals
    // -----------------------------------------------------------------------

    /// Resolve the skill and the session for a request, creating a fresh
    /// session when none is given. A session stays bound to its skill for
    /// life; naming it with a different skill is an invalid request.
    async fn resolve_session(
        &self,
        skill_name: &str,
        session_id: Option<&str>,
    ) -> Result<(Arc<Skill>, StoredSession)> {
        let skill = self
            .skills
            .get(skill_name)
            .ok_or_else(|| ServiceError::UnknownSkill {
                name: skill_name.to_string(),
            })?;

        let session = match session_id {
            Some(id) => {
                let session = self.messages.get_session(id).await?;
                if session.skill != skill.name {
                    return Err(ServiceError::InvalidRequest {
                        reason: format!(
                            "session {id} is bound to skill `{}`, not `{}`",
                            session.skill, skill.name
                        ),
                    });
                }
                session
            }
            None => {
                let session = self.messages.create_session(&skill.name).await?;
                self.bus.emit(
                    EventKind::SessionCreated,
                    json!({ "session_id": session.id, "skill": skill.name }),
                );
                session
            }
        };

        Ok((skill, session))
    }

    /// The lock serializing writers of one session.
    fn session_lock(&self, session_id: &str) -> Arc<tokio::sync::Mutex<()>> {
        self.session_locks
            .entry(session_id.to_string())
            .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(())))
            .clone()
    }

    /// Build and run one loop, emitting lifecycle events around it.
    async fn execute(
        self: &Arc<Self>,
        skill: Arc<Skill>,
        session_id: String,
        input: String,
        depth: u32,
        cancel: CancelHandle,
        events: Option<UnboundedSender<AgentEvent>>,
    ) -> Result<String> {
        self.bus.emit(
            EventKind::AgentStarted,
            json!({ "session_id": session_id, "skill": skill.name, "depth": depth }),
        );

        let skill_name = skill.name.clone();
        let agent = AgentLoop::new(
            skill,
            session_id.clone(),
            Arc::clone(&self.provider),
            Arc::clone(&self.registry),
            self.messages.clone(),
            self.vectors.clone(),
        )
        .with_depth(depth)
        .with_cancel(cancel)
        .with_spawner(Arc::clone(self) as Arc<dyn AgentSpawner>);

        match agent.run(&input, events.as_ref()).await {
            Ok(result) => {
                self.bus.emit(
                    EventKind::AgentCompleted,
                    json!({
                        "session_id": session_id,
                        "skill": skill_name,
                        "result": result,
                    }),
                );
                Ok(result)
            }
            Err(AgentError::Cancelled) => {
                // Cancellation is not a failure of the session.
                info!(session = %session_id, "run cancelled");
                Err(AgentError::Cancelled.into())
            }
            Err(e) => {
                warn!(session = %session_id, error = %e, "run failed");
                self.bus.emit(
                    EventKind::AgentFailed,
                    json!({
                        "session_id": session_id,
                        "skill": skill_name,
                        "error": e.to_string(),
                    }),
                );
                Err(e.into())
            }
        }
    }

    /// Forward loop events to the public receiver (when streaming) and
    /// publish `tool.executed` to the bus. A dropped public receiver trips
    /// the run's cancel handle; client disconnect is the cancel signal.
    fn spawn_relay(
        &self,
        session_id: String,
        mut rx: UnboundedReceiver<AgentEvent>,
        mut tx_pub: Option<UnboundedSender<AgentEvent>>,
        cancel: CancelHandle,
    ) {
        let bus = self.bus.clone();
        tokio::spawn(async move {
            while let Some(event) = rx.recv().await {
                if let AgentEvent::Tool(tool) = &event {
                    bus.emit(
                        EventKind::ToolExecuted,
                        json!({
                            "session_id": session_id,
                            "tool": tool.name,
                            "tool_call_id": tool.tool_call_id,
                            "is_error": tool.is_error,
                        }),
                    );
                }
                let send_failed = tx_pub.as_ref().is_some_and(|tx| tx.send(event).is_err());
                if send_failed {
                    cancel.cancel();
                    tx_pub = None;
                }
            }
        });
    }
}

/// Delegation entry point used by `delegate_to_agent`.
///
/// The sub-run gets a fresh session bound to the target skill and a fresh
/// cancellation handle; parent cancellation does not propagate into
/// delegations.
#[async_trait]
impl AgentSpawner for Service {
    async fn delegate(
        &self,
        skill_name: &str,
        input: &str,
        parent_depth: u32,
    ) -> agentgw_agent::Result<String> {
        let this = self
            .self_ref
            .get()
            .and_then(Weak::upgrade)
            .ok_or_else(|| AgentError::Internal("service is shutting down".into()))?;

        let skill = this
            .skills
            .get(skill_name)
            .ok_or_else(|| AgentError::UnknownSkill {
                name: skill_name.to_string(),
            })?;

        let session = this.messages.create_session(&skill.name).await?;
        this.bus.emit(
            EventKind::SessionCreated,
            json!({ "session_id": session.id, "skill": skill.name, "delegated": true }),
        );

        this.execute(
            skill,
            session.id,
            input.to_string(),
            parent_depth + 1,
            CancelHandle::new(),
            None,
        )
        .await
        .map_err(|e| match e {
            ServiceError::Agent(inner) => inner,
            other => AgentError::Internal(other.to_string()),
        })
    }

    fn max_depth(&self) -> u32 {
        self.config.orchestration.max_depth
    }
}

/// The scheduler fires jobs straight into the service.
#[async_trait]
impl crate::scheduler::JobRunner for Service {
    async fn run_job(&self, skill: &str, message: &str) -> Result<String> {
        let this = self
            .self_ref
            .get()
            .and_then(Weak::upgrade)
            .ok_or_else(|| ServiceError::Startup {
                reason: "service is shutting down".into(),
            })?;
        Ok(this.run(skill, message, None).await?.result)
    }
}

/// Build the embedder named by configuration.
fn build_embedder(config: &Config) -> Result<Arc<dyn Embedder>> {
    match config.embedding.provider.as_str() {
        "local" => Ok(Arc::new(HashEmbedder::default())),
        "openai" => {
            let api_key = config
                .embedding
                .api_key
                .clone()
                .or_else(|| std::env::var("OPENAI_API_KEY").ok())
                .ok_or_else(|| ServiceError::Config {
                    reason: "embedding.provider = \"openai\" requires an API key".into(),
                })?;
            Ok(Arc::new(OpenAiEmbedder::new(
                api_key,
                config.embedding.model.clone(),
            )))
        }
        other => Err(ServiceError::Config {
            reason: format!("unknown embedding provider `{other}`"),
        }),
    }
}

/// Lowercased alphanumeric tokens of a string.
fn tokenize(text: &str) -> HashSet<String> {
    text.to_lowercase()
        .split(|c: char| !c.is_alphanumeric())
        .filter(|t| t.len() > 2)
        .map(|t| t.to_string())
        .collect()
}

// ── tests ────────────────────────────────────────────────────────────
