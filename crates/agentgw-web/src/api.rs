//! REST and SSE route handlers.
//!
//! Thin shells over the service object: parse the request, call the
//! service, map errors to status codes. The chat endpoint streams the
//! loop's events as Server-Sent Events: `data:` per text delta, a named
//! `tool` event per tool execution, and `done` carrying the final text.

use std::convert::Infallible;
use std::sync::Arc;

use axum::Json;
use axum::extract::{Query, State};
use axum::http::StatusCode;
use axum::response::sse::{Event as SseEvent, KeepAlive, Sse};
use axum::response::{IntoResponse, Response};
use futures::Stream;
use futures::StreamExt;
use serde::Deserialize;
use serde_json::json;
use tokio_stream::wrappers::UnboundedReceiverStream;

use agentgw_agent::AgentEvent;
use agentgw_service::ServiceError;
use agentgw_store::StoreError;

use crate::state::AppState;

// ---------------------------------------------------------------------------
// Error mapping
// ---------------------------------------------------------------------------

/// Wraps [`ServiceError`] with an HTTP status mapping.
pub struct ApiError(ServiceError);

impl From<ServiceError> for ApiError {
    fn from(err: ServiceError) -> Self {
        Self(err)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self.0 {
            ServiceError::UnknownSkill { .. } => StatusCode::NOT_FOUND,
            ServiceError::Store(StoreError::NotFound { .. }) => StatusCode::NOT_FOUND,
            ServiceError::Store(StoreError::InvalidArgument(_)) => StatusCode::BAD_REQUEST,
            ServiceError::InvalidRequest { .. } => StatusCode::BAD_REQUEST,
            // Persistence and everything else is a server-side failure.
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        (status, Json(json!({ "error": self.0.to_string() }))).into_response()
    }
}

type ApiResult<T> = std::result::Result<T, ApiError>;

/// Split a comma-separated query value.
fn csv(value: Option<&String>) -> Vec<String> {
    value
        .map(|v| {
            v.split(',')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(String::from)
                .collect()
        })
        .unwrap_or_default()
}

// ---------------------------------------------------------------------------
// POST /api/chat  (SSE)
// ---------------------------------------------------------------------------

#[derive(Deserialize)]
pub struct ChatBody {
    pub skill_name: String,
    pub message: String,
    #[serde(default)]
    pub session_id: Option<String>,
}

/// Stream a chat as Server-Sent Events.
pub async fn chat(
    State(state): State<Arc<AppState>>,
    Json(body): Json<ChatBody>,
) -> ApiResult<Sse<impl Stream<Item = Result<SseEvent, Infallible>>>> {
    let stream = state
        .service
        .chat(&body.skill_name, &body.message, body.session_id.as_deref())
        .await?;

    let session_id = stream.session_id.clone();
    let events = UnboundedReceiverStream::new(stream.events).map(move |event| {
        Ok(match event {
            AgentEvent::TextDelta(text) => SseEvent::default().data(text),
            AgentEvent::Tool(tool) => SseEvent::default().event("tool").data(
                json!({
                    "tool": tool.name,
                    "tool_call_id": tool.tool_call_id,
                    "is_error": tool.is_error,
                })
                .to_string(),
            ),
            AgentEvent::Done(text) => SseEvent::default().event("done").data(
                json!({ "session_id": session_id, "result": text }).to_string(),
            ),
        })
    });

    Ok(Sse::new(events).keep_alive(KeepAlive::default()))
}

// ---------------------------------------------------------------------------
// POST /api/run
// ---------------------------------------------------------------------------

/// Run a request to completion, returning the final text as JSON.
pub async fn run(
    State(state): State<Arc<AppState>>,
    Json(body): Json<ChatBody>,
) -> ApiResult<Response> {
    let outcome = state
        .service
        .run(&body.skill_name, &body.message, body.session_id.as_deref())
        .await?;
    Ok(Json(json!({
        "session_id": outcome.session_id,
        "result": outcome.result,
    }))
    .into_response())
}

// ---------------------------------------------------------------------------
// POST /api/route
// ---------------------------------------------------------------------------

#[derive(Deserialize)]
pub struct RouteBody {
    pub message: String,
}

/// Ask the planner which skill fits a message.
pub async fn route(
    State(state): State<Arc<AppState>>,
    Json(body): Json<RouteBody>,
) -> ApiResult<Response> {
    let decision = state.service.route(&body.message)?;
    Ok(Json(json!({
        "skill_name": decision.skill_name,
        "reason": decision.reason,
    }))
    .into_response())
}

// ---------------------------------------------------------------------------
// POST /api/ingest
// ---------------------------------------------------------------------------

#[derive(Deserialize)]
pub struct IngestBody {
    pub text: String,
    pub source: String,
    #[serde(default)]
    pub skills: Vec<String>,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default)]
    pub collection: Option<String>,
}

/// Ingest a document into the knowledge base.
pub async fn ingest(
    State(state): State<Arc<AppState>>,
    Json(body): Json<IngestBody>,
) -> ApiResult<Response> {
    let added = state
        .service
        .ingest(
            &body.text,
            &body.source,
            &body.skills,
            &body.tags,
            body.collection.as_deref(),
        )
        .await?;
    Ok(Json(json!({ "chunks_added": added })).into_response())
}

// ---------------------------------------------------------------------------
// GET / DELETE /api/documents
// ---------------------------------------------------------------------------

#[derive(Deserialize)]
pub struct DocumentsQuery {
    pub collection: Option<String>,
    pub skills: Option<String>,
    pub source: Option<String>,
    pub limit: Option<usize>,
}

/// List document previews.
pub async fn documents(
    State(state): State<Arc<AppState>>,
    Query(query): Query<DocumentsQuery>,
) -> ApiResult<Response> {
    let docs = state
        .service
        .documents(
            query.collection.as_deref(),
            &csv(query.skills.as_ref()),
            query.source.as_deref(),
            query.limit.unwrap_or(50),
        )
        .await?;
    let count = docs.len();
    Ok(Json(json!({ "documents": docs, "count": count })).into_response())
}

#[derive(Deserialize)]
pub struct DeleteDocumentsQuery {
    pub source: Option<String>,
    pub ids: Option<String>,
}

/// Delete documents by source or by explicit chunk ids.
pub async fn delete_documents(
    State(state): State<Arc<AppState>>,
    Query(query): Query<DeleteDocumentsQuery>,
) -> ApiResult<Response> {
    let deleted = if let Some(source) = &query.source {
        state.service.delete_documents_by_source(source).await?
    } else {
        let ids = csv(query.ids.as_ref());
        if ids.is_empty() {
            return Err(ServiceError::InvalidRequest {
                reason: "provide either `source` or `ids`".into(),
            }
            .into());
        }
        state.service.delete_documents(&ids).await?
    };
    Ok(Json(json!({ "deleted": deleted })).into_response())
}

// ---------------------------------------------------------------------------
// POST /api/feedback
// ---------------------------------------------------------------------------

#[derive(Deserialize)]
pub struct FeedbackBody {
    pub message_id: i64,
    pub value: i32,
}

/// Record feedback on an assistant message.
pub async fn feedback(
    State(state): State<Arc<AppState>>,
    Json(body): Json<FeedbackBody>,
) -> ApiResult<Response> {
    state.service.feedback(body.message_id, body.value).await?;
    Ok(Json(json!({ "ok": true })).into_response())
}

// ---------------------------------------------------------------------------
// Listings
// ---------------------------------------------------------------------------

/// GET /api/skills
pub async fn skills(State(state): State<Arc<AppState>>) -> Response {
    Json(json!({ "skills": state.service.skill_summaries() })).into_response()
}

#[derive(Deserialize)]
pub struct SessionsQuery {
    pub skill: Option<String>,
    pub limit: Option<u32>,
}

/// GET /api/sessions
pub async fn sessions(
    State(state): State<Arc<AppState>>,
    Query(query): Query<SessionsQuery>,
) -> ApiResult<Response> {
    let sessions = state
        .service
        .sessions(query.skill.as_deref(), query.limit.unwrap_or(50))
        .await?;
    Ok(Json(json!({ "sessions": sessions })).into_response())
}

/// GET /api/sessions/{id}/messages
pub async fn session_messages(
    State(state): State<Arc<AppState>>,
    axum::extract::Path(id): axum::extract::Path<String>,
) -> ApiResult<Response> {
    let messages = state.service.session_messages(&id).await?;
    Ok(Json(json!({ "messages": messages })).into_response())
}

// ---------------------------------------------------------------------------
// Public endpoints
// ---------------------------------------------------------------------------

/// GET /health. Always public.
pub async fn health(State(state): State<Arc<AppState>>) -> ApiResult<Response> {
    let status = state.service.status().await?;
    Ok(Json(json!({
        "status": "ok",
        "version": status.version,
        "provider": status.provider,
        "model": status.model,
    }))
    .into_response())
}

/// GET /daemon/status. Scheduler and service info.
pub async fn daemon_status(State(state): State<Arc<AppState>>) -> ApiResult<Response> {
    let status = state.service.status().await?;
    let jobs = match &state.scheduler {
        Some(scheduler) => serde_json::to_value(scheduler.jobs().await).unwrap_or_default(),
        None => json!([]),
    };
    let scheduler_running = state
        .scheduler
        .as_ref()
        .is_some_and(|s| s.is_running());

    Ok(Json(json!({
        "service": status,
        "scheduler": {
            "running": scheduler_running,
            "jobs": jobs,
        },
    }))
    .into_response())
}

/// GET /. Identifies the daemon.
pub async fn index() -> Response {
    Json(json!({
        "name": "agentgw",
        "version": env!("CARGO_PKG_VERSION"),
    }))
    .into_response()
}
