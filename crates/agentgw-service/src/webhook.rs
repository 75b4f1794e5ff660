//! Webhook fan-out with in-memory retries.
//!
//! The dispatcher consumes the event bus and POSTs each event to every
//! enabled subscription that listens for its kind. Delivery is
//! fire-and-forget from the producer's point of view; each delivery retries
//! on non-2xx or transport errors with exponential backoff, up to three
//! attempts total. There is no persistent queue, so a daemon restart drops
//! anything still in flight.

use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::events::{Event, EventKind};

/// Per-request timeout for one delivery attempt.
const DELIVERY_TIMEOUT_SECS: u64 = 30;

/// Total attempts per delivery (first try included).
const MAX_ATTEMPTS: u32 = 3;

/// Base backoff delay, doubled after every failed attempt.
const BASE_BACKOFF_MS: u64 = 500;

/// One configured webhook endpoint.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WebhookSubscription {
    /// Identifier used in logs.
    pub name: String,

    /// Endpoint receiving the POSTs.
    pub url: String,

    /// Which event kinds this subscription wants.
    pub events: Vec<EventKind>,

    /// Shared secret sent as `X-Webhook-Secret`.
    #[serde(default)]
    pub secret: Option<String>,

    /// Disabled subscriptions are skipped entirely.
    #[serde(default = "default_enabled")]
    pub enabled: bool,
}

fn default_enabled() -> bool {
    true
}

impl WebhookSubscription {
    fn wants(&self, kind: EventKind) -> bool {
        self.enabled && self.events.contains(&kind)
    }
}

/// Consumes the event bus and delivers events to subscribers.
pub struct WebhookDispatcher {
    subscriptions: Vec<WebhookSubscription>,
    http: reqwest::Client,
    max_attempts: u32,
    base_backoff: Duration,
}

impl WebhookDispatcher {
    /// Create a dispatcher over the given subscriptions.
    pub fn new(subscriptions: Vec<WebhookSubscription>) -> Self {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(DELIVERY_TIMEOUT_SECS))
            .build()
            .unwrap_or_default();
        Self {
            subscriptions,
            http,
            max_attempts: MAX_ATTEMPTS,
            base_backoff: Duration::from_millis(BASE_BACKOFF_MS),
        }
    }

    /// Override the retry policy. Tests shrink the backoff.
    pub fn with_retry_policy(mut self, max_attempts: u32, base_backoff: Duration) -> Self {
        self.max_attempts = max_attempts;
        self.base_backoff = base_backoff;
        self
    }

    /// Start the consumer task. Runs until the event channel closes.
    pub fn spawn(self, mut rx: mpsc::UnboundedReceiver<Event>) -> JoinHandle<()> {
        let dispatcher = Arc::new(self);
        tokio::spawn(async move {
            while let Some(event) = rx.recv().await {
                for sub in &dispatcher.subscriptions {
                    if !sub.wants(event.kind) {
                        continue;
                    }
                    // Deliveries run detached so a slow endpoint never
                    // stalls the queue or other subscribers.
                    let dispatcher = Arc::clone(&dispatcher);
                    let sub = sub.clone();
                    let event = event.clone();
                    tokio::spawn(async move {
                        dispatcher.deliver(&sub, &event).await;
                    });
                }
            }
            debug!("webhook dispatcher stopped");
        })
    }

    /// Deliver one event to one subscription, retrying with backoff.
    async fn deliver(&self, sub: &WebhookSubscription, event: &Event) {
        let mut delay = self.base_backoff;

        for attempt in 1..=self.max_attempts {
            let mut request = self.http.post(&sub.url).json(event);
            if let Some(secret) = &sub.secret {
                request = request.header("X-Webhook-Secret", secret);
            }

            match request.send().await {
                Ok(resp) if resp.status().is_success() => {
                    debug!(
                        webhook = %sub.name,
                        event = %event.kind,
                        attempt,
                        "webhook delivered"
                    );
                    return;
                }
                Ok(resp) => {
                    warn!(
                        webhook = %sub.name,
                        event = %event.kind,
                        attempt,
                        status = %resp.status(),
                        "webhook delivery rejected"
                    );
                }
                Err(e) => {
                    warn!(
                        webhook = %sub.name,
                        event = %event.kind,
                        attempt,
                        error = %e,
                        "webhook delivery failed"
                    );
                }
            }

            if attempt < self.max_attempts {
                tokio::time::sleep(delay).await;
                delay *= 2;
            }
        }

        warn!(
            webhook = %sub.name,
            event = %event.kind,
            attempts = self.max_attempts,
            "webhook delivery dropped after final attempt"
        );
    }
}

// ── tests ────────────────────────────────────────────────────────────
