//! HTTP surface of the panel: routing, shared state, middleware.
use std::sync::Arc;
use std::time::Duration;

use axum::{
    error_handling::HandleErrorLayer,
    extract::DefaultBodyLimit,
    http::HeaderValue,
    routing::{get, post},
    BoxError, Router,
};
use tower::timeout::{error::Elapsed, TimeoutLayer};
use tower::ServiceBuilder;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::warn;

use crate::config::Config;
use crate::error::ApiError;
use crate::db::Pool;
use crate::reconcile::ReconcileOptions;
use crate::store::{SqliteStore, SubscriberStore};

mod health;
mod sync;

pub use sync::{SyncRequest, SyncResponse};

pub struct AppState {
    pub pool: Pool,
    pub store: Arc<dyn SubscriberStore>,
    pub sync_options: ReconcileOptions,
}

impl AppState {
    pub fn new(pool: Pool, sync_options: ReconcileOptions) -> Self {
        let store = Arc::new(SqliteStore::new(pool.clone()));
        Self {
            pool,
            store,
            sync_options,
        }
    }

    /// Same pool for health checks, but sync writes go through `store`.
    pub fn with_store(
        pool: Pool,
        store: Arc<dyn SubscriberStore>,
        sync_options: ReconcileOptions,
    ) -> Self {
        Self {
            pool,
            store,
            sync_options,
        }
    }
}

fn cors_layer(origins: &[String]) -> CorsLayer {
    let base = CorsLayer::new().allow_methods(Any).allow_headers(Any);
    if origins.iter().any(|o| o == "*") {
        return base.allow_origin(Any);
    }
    let parsed = origins
        .iter()
        .filter_map(|o| match o.parse::<HeaderValue>() {
            Ok(v) => Some(v),
            Err(err) => {
                warn!(origin = %o, ?err, "ignoring invalid CORS origin");
                None
            }
        })
        .collect::<Vec<_>>();
    base.allow_origin(parsed)
}

/// Turns a middleware failure into the usual JSON error body.
fn middleware_error(err: BoxError, timeout: Duration) -> ApiError {
    if err.is::<Elapsed>() {
        return ApiError::RequestTimeout(timeout);
    }
    ApiError::Internal(anyhow::anyhow!("unhandled middleware error: {err}"))
}

pub fn app_router(state: Arc<AppState>, config: &Config) -> Router {
    let timeout = config.request_timeout();
    let api = Router::new()
        .route("/sync_ppp_to_db", post(sync::sync_ppp_to_db))
        // Path the panel front-end used before the PHP endpoints were retired.
        .route("/sync_ppp_to_db.php", post(sync::sync_ppp_to_db));

    Router::new()
        .route("/healthz", get(health::healthz))
        .nest("/api", api)
        .with_state(state)
        .layer(DefaultBodyLimit::max(config.server.max_body_bytes))
        .layer(cors_layer(&config.server.cors_allow))
        .layer(
            ServiceBuilder::new()
                .layer(HandleErrorLayer::new(move |err: BoxError| async move {
                    middleware_error(err, timeout)
                }))
                .layer(TimeoutLayer::new(timeout)),
        )
        .layer(TraceLayer::new_for_http())
}
