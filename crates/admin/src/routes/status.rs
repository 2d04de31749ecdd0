use axum::extract::State;
use axum::Json;
use serde_json::{json, Value};

use crate::state::SharedState;

/// GET /api/status
///
/// Slot usage, tier pool load and limiter counters in one document.
pub async fn get_status(State(state): State<SharedState>) -> Json<Value> {
    let gate = &state.gate;
    let metrics = gate.metrics();
    let status = gate.status();

    let uptime_secs = state.start_time.elapsed().as_secs();
    let total_requests = metrics.requests_total.get();
    let requests_per_second = if uptime_secs > 0 {
        total_requests as f64 / uptime_secs as f64
    } else {
        0.0
    };

    Json(json!({
        "admission": status.admission,
        "scheduler": status.scheduler,
        "limiters": {
            "tracked_identities": status.tracked_identities,
            "tracked_command_identities": status.tracked_command_identities,
            "rate_limited": metrics.rate_limited_total.get(),
            "commands_rejected": metrics.commands_rejected_total.get(),
        },
        "total_requests": total_requests,
        "admitted": metrics.admitted_total.get(),
        "uptime_secs": uptime_secs,
        "requests_per_second": requests_per_second
    }))
}
