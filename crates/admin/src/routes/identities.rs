use axum::extract::{Path, State};
use axum::Json;
use turnstile_common::Identity;
use turnstile_gate::IdentityReport;

use crate::state::SharedState;

/// GET /api/identities/{id}
///
/// Tier, held slots and limiter standing for one identity. Read-only: looking
/// an identity up never counts against its windows.
pub async fn get_identity(
    State(state): State<SharedState>,
    Path(id): Path<Identity>,
) -> Json<IdentityReport> {
    Json(state.gate.identity_report(id))
}
