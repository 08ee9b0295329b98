use axum::extract::State;
use axum::Json;

use crate::error::ParamedicError;
use crate::server::SharedState;
use crate::session::SessionSnapshot;

/// Snapshot of the collection session. 503 once the server is shutting down.
pub async fn health(State(state): State<SharedState>) -> Result<Json<SessionSnapshot>, ParamedicError> {
    let snapshot = state.session.snapshot().await?;
    Ok(Json(snapshot))
}
