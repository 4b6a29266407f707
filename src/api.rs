//! Minimal REST surface: the reconnection backfill contract.
//!
//! The delivery plane never queues undelivered frames. A client that
//! reconnects calls `GET /rooms/{id}/messages?after_id={last}` to fetch
//! what it missed; everything else REST-shaped lives in other services.

use axum::extract::{Path, Query, State};
use axum::http::{HeaderMap, StatusCode};
use axum::routing::get;
use axum::{Json, Router};
use serde::Deserialize;
use tracing::error;

use crate::repo::StoredChatMessage;
use crate::ws::session::bearer_token;
use crate::AppState;

const DEFAULT_BACKFILL_LIMIT: usize = 50;
const MAX_BACKFILL_LIMIT: usize = 200;

#[derive(Debug, Deserialize)]
pub struct BackfillQuery {
    #[serde(default)]
    pub after_id: u64,
    pub limit: Option<usize>,
    pub token: Option<String>,
}

pub fn router() -> Router<AppState> {
    Router::new().route("/rooms/:room_id/messages", get(room_messages))
}

async fn room_messages(
    Path(room_id): Path<u64>,
    Query(query): Query<BackfillQuery>,
    headers: HeaderMap,
    State(state): State<AppState>,
) -> Result<Json<Vec<StoredChatMessage>>, StatusCode> {
    let token = bearer_token(query.token.as_deref(), &headers).ok_or(StatusCode::UNAUTHORIZED)?;
    let claims = state
        .verifier
        .validate(&token)
        .await
        .map_err(|_| StatusCode::UNAUTHORIZED)?;
    let user = state
        .users
        .get_or_create_from_claims(&claims)
        .await
        .map_err(|_| StatusCode::INTERNAL_SERVER_ERROR)?;

    let is_member = state
        .members
        .is_member(room_id, user.id)
        .await
        .map_err(|_| StatusCode::INTERNAL_SERVER_ERROR)?;
    if !is_member {
        return Err(StatusCode::FORBIDDEN);
    }

    let limit = query
        .limit
        .unwrap_or(DEFAULT_BACKFILL_LIMIT)
        .min(MAX_BACKFILL_LIMIT);
    let rows = state
        .messages
        .get_by_room_after(room_id, query.after_id, limit)
        .await
        .map_err(|e| {
            error!(room_id, error = %e, "backfill query failed");
            StatusCode::INTERNAL_SERVER_ERROR
        })?;
    Ok(Json(rows))
}
