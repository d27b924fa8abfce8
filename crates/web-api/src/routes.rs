use axum::{
    extract::{Query, State},
    http::StatusCode,
    routing::get,
    Json, Router,
};
use domain::TokenRequest;
use serde::Deserialize;
use tower_http::{cors::CorsLayer, trace::TraceLayer};

use crate::{error::ApiError, state::AppState};

#[derive(Debug, Deserialize)]
struct AuthQuery {
    #[serde(rename = "clientId")]
    client_id: Option<String>,
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/auth", get(issue_token))
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

async fn health() -> StatusCode {
    StatusCode::OK
}

async fn issue_token(
    State(state): State<AppState>,
    Query(query): Query<AuthQuery>,
) -> Result<Json<TokenRequest>, ApiError> {
    let token = state.token_issuer.issue(query.client_id)?;
    tracing::info!(client_id = ?token.client_id, "已签发令牌请求");
    Ok(Json(token))
}
