//! Application state management
//!
//! Contains shared state accessible across all handlers.

use crate::controller::Controller;
use std::sync::Arc;

/// Application state shared across all handlers
pub struct AppState {
    /// Owns proposals, approvals, updates, backups and the audit log.
    /// Background tasks hold the same `Arc`.
    pub controller: Arc<Controller>,
}

impl AppState {
    pub fn new(controller: Arc<Controller>) -> Self {
        Self { controller }
    }
}

/// Type alias for shared state
pub type SharedState = Arc<AppState>;
