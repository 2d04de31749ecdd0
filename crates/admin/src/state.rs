use std::sync::Arc;

use chrono::{DateTime, Utc};
use turnstile_common::AppConfig;
use turnstile_gate::Gate;

/// Shared state type alias used across all route handlers.
pub type SharedState = Arc<AppState>;

/// Read-only view of the running service handed to every admin route.
pub struct AppState {
    pub config: AppConfig,
    pub gate: Arc<Gate>,
    pub start_time: std::time::Instant,
    pub started_at: DateTime<Utc>,
}

impl AppState {
    pub fn new(config: AppConfig, gate: Arc<Gate>) -> Self {
        Self {
            config,
            gate,
            start_time: std::time::Instant::now(),
            started_at: Utc::now(),
        }
    }
}
