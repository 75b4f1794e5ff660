//! Shared application state for the HTTP façade.

use std::sync::Arc;

use agentgw_service::{Scheduler, Service};

/// State accessible from every handler.
#[derive(Clone)]
pub struct AppState {
    /// The daemon's service object.
    pub service: Arc<Service>,

    /// The scheduler, when one is running; `/daemon/status` reports it.
    pub scheduler: Option<Arc<Scheduler>>,

    /// Bearer key guarding `/api/*`. `None` leaves the API open.
    pub api_key: Option<String>,
}
