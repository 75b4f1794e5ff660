//! HTTP façade for agentgw.
//!
//! A thin axum shell over the service object: Server-Sent Events for
//! streaming chat, JSON for everything else, and bearer-token auth on the
//! `/api` tree when a key is configured.

pub mod api;
pub mod auth;
pub mod server;
pub mod state;

pub use server::WebServer;
pub use state::AppState;
