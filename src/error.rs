use axum::{
    extract::rejection::BytesRejection,
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::Serialize;
use std::time::Duration;
use thiserror::Error;

use crate::model::SyncReport;
use crate::reconcile::SyncError;

#[derive(Error, Debug)]
pub enum ApiError {
    #[error("{0}")]
    Sync(#[from] SyncError),
    #[error("{0}")]
    BadRequest(String),
    #[error("{0}")]
    Body(#[from] BytesRejection),
    #[error("request exceeded its timeout of {0:?}")]
    RequestTimeout(Duration),
    #[error("{0}")]
    Unavailable(String),
    #[error("{0}")]
    Internal(#[from] anyhow::Error),
}

/// Every failure still answers with a JSON body; partial counts ride along
/// when a sync pass stopped midway.
#[derive(Serialize)]
struct ErrorBody {
    success: bool,
    error: String,
    #[serde(flatten)]
    partial: Option<SyncReport>,
}

impl ApiError {
    pub fn status(&self) -> StatusCode {
        match self {
            ApiError::Sync(SyncError::Validation(_)) | ApiError::BadRequest(_) => {
                StatusCode::BAD_REQUEST
            }
            ApiError::Sync(SyncError::Fatal { .. }) | ApiError::Internal(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
            ApiError::Body(rejection) => rejection.status(),
            ApiError::Sync(SyncError::Timeout { .. }) | ApiError::RequestTimeout(_) => {
                StatusCode::GATEWAY_TIMEOUT
            }
            ApiError::Unavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status.is_server_error() {
            tracing::error!(error = %self, %status, "request failed");
        }
        let partial = match &self {
            ApiError::Sync(err) => err.partial_report().cloned(),
            _ => None,
        };
        let body = Json(ErrorBody {
            success: false,
            error: self.to_string(),
            partial,
        });
        (status, body).into_response()
    }
}

pub type ApiResult<T> = Result<T, ApiError>;
