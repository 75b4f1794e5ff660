//! Service core for agentgw.
//!
//! Assembles the stores, the LLM provider, the tool registry, and the skill
//! set into one shared [`Service`] object, and hosts the background
//! machinery around it: the cron [`Scheduler`], the [`WebhookDispatcher`],
//! and the [`EventBus`] connecting them.

pub mod config;
pub mod error;
pub mod events;
pub mod scheduler;
pub mod service;
pub mod webhook;

pub use config::{
    Config, EmbeddingConfig, LlmConfig, OrchestrationConfig, ServerConfig, StorageConfig,
};
pub use error::{Result, ServiceError};
pub use events::{Event, EventBus, EventKind};
pub use scheduler::{JobConfig, JobRunner, JobStatus, Scheduler};
pub use service::{ChatStream, RouteDecision, RunOutcome, Service, ServiceStatus, SkillSummary};
pub use webhook::{WebhookDispatcher, WebhookSubscription};
