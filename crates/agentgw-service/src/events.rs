//! In-process event bus.
//!
//! Components publish [`Event`]s through a cloneable [`EventBus`]; the
//! webhook dispatcher consumes the other end of the channel. Emission is
//! fire-and-forget: producers never wait on delivery, and a closed channel
//! (dispatcher disabled or shut down) is not an error.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::mpsc;
use tracing::trace;

/// The kinds of events the daemon emits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EventKind {
    #[serde(rename = "agent.started")]
    AgentStarted,
    #[serde(rename = "agent.completed")]
    AgentCompleted,
    #[serde(rename = "agent.failed")]
    AgentFailed,
    #[serde(rename = "tool.executed")]
    ToolExecuted,
    #[serde(rename = "session.created")]
    SessionCreated,
    #[serde(rename = "feedback.received")]
    FeedbackReceived,
}

impl EventKind {
    /// The dotted wire name of this kind.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::AgentStarted => "agent.started",
            Self::AgentCompleted => "agent.completed",
            Self::AgentFailed => "agent.failed",
            Self::ToolExecuted => "tool.executed",
            Self::SessionCreated => "session.created",
            Self::FeedbackReceived => "feedback.received",
        }
    }
}

impl std::fmt::Display for EventKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One emitted event.
#[derive(Debug, Clone, Serialize)]
pub struct Event {
    /// What happened.
    #[serde(rename = "event")]
    pub kind: EventKind,
    /// When it happened.
    pub timestamp: DateTime<Utc>,
    /// Kind-specific payload.
    pub data: Value,
}

/// Cloneable sender half of the event channel.
#[derive(Clone)]
pub struct EventBus {
    tx: mpsc::UnboundedSender<Event>,
}

impl EventBus {
    /// Create a bus and the receiver the dispatcher will consume.
    pub fn new() -> (Self, mpsc::UnboundedReceiver<Event>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }

    /// Publish an event. Never blocks; a closed channel is silently ignored.
    pub fn emit(&self, kind: EventKind, data: Value) {
        trace!(kind = %kind, "event emitted");
        let _ = self.tx.send(Event {
            kind,
            timestamp: Utc::now(),
            data,
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn emitted_events_arrive_in_order() {
        let (bus, mut rx) = EventBus::new();
        bus.emit(EventKind::SessionCreated, json!({"session_id": "s1"}));
        bus.emit(EventKind::AgentStarted, json!({"skill": "alpha"}));

        let first = rx.recv().await.unwrap();
        assert_eq!(first.kind, EventKind::SessionCreated);
        let second = rx.recv().await.unwrap();
        assert_eq!(second.kind, EventKind::AgentStarted);
        assert_eq!(second.data["skill"], "alpha");
    }

    #[tokio::test]
    async fn emit_after_receiver_drop_is_harmless() {
        let (bus, rx) = EventBus::new();
        drop(rx);
        bus.emit(EventKind::AgentCompleted, json!({}));
    }

    #[test]
    fn kind_wire_names() {
        assert_eq!(EventKind::AgentStarted.as_str(), "agent.started");
        assert_eq!(
            serde_json::to_value(EventKind::ToolExecuted).unwrap(),
            json!("tool.executed")
        );
        let parsed: EventKind = serde_json::from_value(json!("feedback.received")).unwrap();
        assert_eq!(parsed, EventKind::FeedbackReceived);
    }

    #[test]
    fn event_serializes_with_wire_field_names() {
        let event = Event {
            kind: EventKind::AgentCompleted,
            timestamp: Utc::now(),
            data: json!({"result": "ok"}),
        };
        let v = serde_json::to_value(&event).unwrap();
        assert_eq!(v["event"], "agent.completed");
        assert!(v["timestamp"].is_string());
        assert_eq!(v["data"]["result"], "ok");
    }
}
