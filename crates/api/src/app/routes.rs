//! Operator endpoints: dead-letter listing, single retry, bulk replay.

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use chrono::Utc;
use serde::Deserialize;
use serde_json::json;
use tracing::info;

use relaykit_store::DeadLetterFilter;

use super::dto::{DeadLetterDto, ReplayResponse};
use super::errors::{json_error, store_error_to_response};
use super::AppState;

const DEFAULT_PAGE: u32 = 50;
const MAX_PAGE: u32 = 200;

pub async fn health() -> Response {
    Json(json!({ "status": "ok" })).into_response()
}

#[derive(Debug, Deserialize)]
pub struct DeadQuery {
    pub kind: Option<String>,
    pub biz_key: Option<String>,
    pub offset: Option<u32>,
    pub limit: Option<u32>,
}

pub async fn list_dead(
    State(state): State<AppState>,
    Query(query): Query<DeadQuery>,
) -> Response {
    let filter = DeadLetterFilter {
        kind: query.kind,
        biz_key: query.biz_key,
    };
    let offset = query.offset.unwrap_or(0);
    let limit = query.limit.unwrap_or(DEFAULT_PAGE).min(MAX_PAGE);

    match state
        .store
        .list_dead_letters(&state.table, &filter, offset, limit)
        .await
    {
        Ok(records) => {
            let dtos: Vec<DeadLetterDto> = records.iter().map(DeadLetterDto::from).collect();
            Json(dtos).into_response()
        }
        Err(err) => store_error_to_response(err),
    }
}

pub async fn retry_one(State(state): State<AppState>, Path(id): Path<i64>) -> Response {
    match state
        .store
        .reset_dead_to_new(&state.table, id, Utc::now())
        .await
    {
        Ok(true) => {
            info!(id, "dead record reset to NEW by operator");
            Json(json!({ "id": id, "status": "NEW" })).into_response()
        }
        // Also covers records that exist but are not DEAD: replaying a
        // live record would corrupt its state machine.
        Ok(false) => json_error(
            StatusCode::NOT_FOUND,
            "not_found",
            format!("record {id} not found or not dead"),
        ),
        Err(err) => store_error_to_response(err),
    }
}

#[derive(Debug, Deserialize)]
pub struct ReplayQuery {
    pub biz_key: Option<String>,
    pub kind: Option<String>,
}

pub async fn replay_by_biz_key(
    State(state): State<AppState>,
    Query(query): Query<ReplayQuery>,
) -> Response {
    let Some(biz_key) = query.biz_key else {
        return json_error(
            StatusCode::BAD_REQUEST,
            "validation_error",
            "biz_key query parameter is required",
        );
    };

    let matches = match state
        .store
        .find_dead_by_biz_key(&state.table, &biz_key, query.kind.as_deref())
        .await
    {
        Ok(matches) => matches,
        Err(err) => return store_error_to_response(err),
    };

    let now = Utc::now();
    let mut replayed = 0;
    for record in matches {
        match state.store.reset_dead_to_new(&state.table, record.id, now).await {
            Ok(true) => replayed += 1,
            // Raced with another operator or a concurrent replay.
            Ok(false) => {}
            Err(err) => return store_error_to_response(err),
        }
    }

    info!(biz_key = %biz_key, kind = ?query.kind, replayed, "dead records replayed by operator");
    Json(ReplayResponse { replayed }).into_response()
}
