use std::sync::Arc;

use axum::{extract::State, Json};
use serde_json::{json, Value};

use super::AppState;
use crate::db;
use crate::error::{ApiError, ApiResult};

pub(super) async fn healthz(State(state): State<Arc<AppState>>) -> ApiResult<Json<Value>> {
    db::ping(&state.pool)
        .await
        .map_err(|err| ApiError::Unavailable(format!("database unreachable: {err}")))?;
    Ok(Json(json!({ "status": "ok" })))
}
