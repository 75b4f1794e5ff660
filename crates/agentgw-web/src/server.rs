//! Router composition and server startup.

use std::sync::Arc;

use axum::Router;
use axum::http::{HeaderValue, Method};
use axum::middleware;
use axum::routing::{delete, get, post};
use tower_http::cors::CorsLayer;

use agentgw_service::{Scheduler, Service};

use crate::api;
use crate::auth;
use crate::state::AppState;

/// The agentgw HTTP server.
pub struct WebServer {
    state: Arc<AppState>,
    addr: String,
}

impl WebServer {
    /// Create a server for `service`, binding `host:port`.
    pub fn new(service: Arc<Service>, scheduler: Option<Arc<Scheduler>>) -> Self {
        let config = service.config().server.clone();
        let state = Arc::new(AppState {
            api_key: config.api_key.clone(),
            service,
            scheduler,
        });
        Self {
            state,
            addr: format!("{}:{}", config.host, config.port),
        }
    }

    /// The `host:port` this server binds.
    pub fn addr(&self) -> &str {
        &self.addr
    }

    /// Build the router: a bearer-guarded `/api` tree plus the public
    /// routes.
    pub fn router(&self) -> Router {
        let cors = CorsLayer::new()
            .allow_origin("*".parse::<HeaderValue>().expect("static header value"))
            .allow_methods([Method::GET, Method::POST, Method::DELETE])
            .allow_headers(tower_http::cors::Any);

        let api = Router::new()
            .route("/chat", post(api::chat))
            .route("/run", post(api::run))
            .route("/route", post(api::route))
            .route("/ingest", post(api::ingest))
            .route("/documents", get(api::documents))
            .route("/documents", delete(api::delete_documents))
            .route("/feedback", post(api::feedback))
            .route("/skills", get(api::skills))
            .route("/sessions", get(api::sessions))
            .route("/sessions/{id}/messages", get(api::session_messages))
            .route_layer(middleware::from_fn_with_state(
                Arc::clone(&self.state),
                auth::require_bearer,
            ));

        Router::new()
            .route("/", get(api::index))
            .route("/health", get(api::health))
            .route("/daemon/status", get(api::daemon_status))
            .nest("/api", api)
            .layer(cors)
            .with_state(Arc::clone(&self.state))
    }

    /// Bind and serve until shutdown.
    pub async fn start(self) -> std::io::Result<()> {
        let listener = tokio::net::TcpListener::bind(&self.addr).await?;
        tracing::info!(addr = %self.addr, "http server listening");
        axum::serve(listener, self.router()).await
    }
}

// ── tests ────────────────────────────────────────────────────────────
