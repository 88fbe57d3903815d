use std::sync::Arc;

use axum::{
    body::Bytes,
    extract::{rejection::BytesRejection, State},
    Json,
};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::info;

use super::AppState;
use crate::error::{ApiError, ApiResult};
use crate::model::{ObservedRecord, SyncReport};
use crate::reconcile;

/// Body of `POST /api/sync_ppp_to_db`.
///
/// `ppp_users` stays untyped until it is known to be an array so a missing or
/// non-array value gets its own error message.
#[derive(Debug, Deserialize)]
pub struct SyncRequest {
    #[serde(default)]
    pub router_id: Option<String>,
    #[serde(default)]
    pub ppp_users: Option<Value>,
    #[serde(default)]
    pub prune: bool,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct SyncResponse {
    pub success: bool,
    #[serde(flatten)]
    pub report: SyncReport,
}

impl SyncRequest {
    pub fn parse(body: &[u8]) -> ApiResult<(String, Vec<ObservedRecord>, bool)> {
        let req: SyncRequest = serde_json::from_slice(body)
            .map_err(|err| ApiError::BadRequest(format!("Invalid JSON body: {err}")))?;

        let users = match req.ppp_users {
            Some(v @ Value::Array(_)) => serde_json::from_value::<Vec<ObservedRecord>>(v)
                .map_err(|err| ApiError::BadRequest(format!("Invalid ppp_users entry: {err}")))?,
            _ => return Err(ApiError::BadRequest("No PPP user data received".into())),
        };

        let router_id = req.router_id.unwrap_or_default();
        if router_id.trim().is_empty() {
            return Err(ApiError::BadRequest("router_id is required".into()));
        }
        Ok((router_id, users, req.prune))
    }
}

pub(super) async fn sync_ppp_to_db(
    State(state): State<Arc<AppState>>,
    body: Result<Bytes, BytesRejection>,
) -> ApiResult<Json<SyncResponse>> {
    let body = body?;
    let (router_id, users, prune) = SyncRequest::parse(&body)?;
    info!(router_id = %router_id, users = users.len(), prune, "sync requested");

    let report = reconcile::reconcile(
        state.store.as_ref(),
        &router_id,
        &users,
        prune,
        &state.sync_options,
    )
    .await?;

    Ok(Json(SyncResponse {
        success: true,
        report,
    }))
}
