//! Cooperative cancellation.
//!
//! A [`CancelHandle`] is a cheap, cloneable flag checked at every suspension
//! point of the agent loop: before each provider call, before each tool
//! invocation, and before persisting a tool result. Tripping it stops the
//! run at the next check without persisting in-progress output.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

/// Shared cancellation flag for one agent run.
#[derive(Debug, Clone, Default)]
pub struct CancelHandle {
    flag: Arc<AtomicBool>,
}

impl CancelHandle {
    /// Create a fresh, untripped handle.
    pub fn new() -> Self {
        Self::default()
    }

    /// Trip the flag. Idempotent.
    pub fn cancel(&self) {
        self.flag.store(true, Ordering::SeqCst);
    }

    /// Whether the flag has been tripped.
    pub fn is_cancelled(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
    }
}
