use axum::{Json, extract::State, response::IntoResponse};
use http::header;

use crate::AppState;

/// Public keys for verifying issued identity tokens.
///
/// Includes the active signing key and any additional verification keys
/// kept around for rotation.
#[tracing::instrument(name = "jwks", skip(state))]
pub async fn jwks(State(state): State<AppState>) -> impl IntoResponse {
    (
        [(header::CACHE_CONTROL, "public, max-age=300")],
        Json(state.flow.issuer().jwks().clone()),
    )
}
