use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use axum::body::Body;
use axum::http::{header, Method, Request, StatusCode};
use axum::Router;
use isp_panel::api::{app_router, AppState};
use isp_panel::config::{self, Config};
use isp_panel::db;
use isp_panel::reconcile::ReconcileOptions;
use isp_panel::store::{StoreError, SubscriberStore};
use serde_json::{json, Value};
use sqlx::sqlite::SqlitePoolOptions;
use tower::ServiceExt;

async fn setup_pool() -> sqlx::SqlitePool {
    let pool = SqlitePoolOptions::new()
        .max_connections(1)
        .connect("sqlite::memory:")
        .await
        .unwrap();
    sqlx::migrate!("./migrations").run(&pool).await.unwrap();
    pool
}

fn test_config() -> Config {
    serde_yaml::from_str(config::example()).unwrap()
}

fn router_for(state: AppState) -> Router {
    app_router(Arc::new(state), &test_config())
}

/// Config with no `sync` section, a short request timeout and a small body cap.
fn tight_config(request_timeout_ms: u64, max_body_bytes: usize) -> Config {
    let yaml = format!(
        "app:\n  data_dir: \"./data\"\nserver:\n  listen_addr: \"127.0.0.1:0\"\n  request_timeout_ms: {request_timeout_ms}\n  max_body_bytes: {max_body_bytes}\n"
    );
    serde_yaml::from_str(&yaml).unwrap()
}

async fn call(app: Router, method: Method, uri: &str, body: Option<Value>) -> (StatusCode, Value) {
    let mut req = Request::builder().method(method).uri(uri);
    let body = match body {
        Some(v) => {
            req = req.header(header::CONTENT_TYPE, "application/json");
            Body::from(v.to_string())
        }
        None => Body::empty(),
    };
    let resp = app.oneshot(req.body(body).unwrap()).await.unwrap();
    let status = resp.status();
    let bytes = axum::body::to_bytes(resp.into_body(), usize::MAX).await.unwrap();
    let json: Value = serde_json::from_slice(&bytes).unwrap();
    (status, json)
}

#[tokio::test]
async fn sync_adds_updates_and_prunes() {
    let pool = setup_pool().await;
    db::insert_subscriber(&pool, "R1", "alice", "p1", "prof").await.unwrap();
    db::insert_subscriber(&pool, "R1", "bob", "p1", "prof").await.unwrap();
    let app = router_for(AppState::new(pool.clone(), ReconcileOptions::default()));

    let (status, body) = call(
        app,
        Method::POST,
        "/api/sync_ppp_to_db",
        Some(json!({
            "router_id": "R1",
            "ppp_users": [
                {"name": "alice", "password": "p2", "profile": "prof"},
                {"name": "dave", "password": "d", "profile": "5M"},
                {"name": "", "password": "x", "profile": "y"}
            ],
            "prune": true
        })),
    )
    .await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(
        body,
        json!({
            "success": true,
            "added": 1,
            "updated": 1,
            "skipped": 1,
            "pruned": 1,
            "total_processed": 3
        })
    );
    assert_eq!(db::list_usernames(&pool, "R1").await.unwrap(), vec!["alice", "dave"]);
}

#[tokio::test]
async fn legacy_php_path_is_served() {
    let pool = setup_pool().await;
    let app = router_for(AppState::new(pool.clone(), ReconcileOptions::default()));

    let (status, body) = call(
        app,
        Method::POST,
        "/api/sync_ppp_to_db.php",
        Some(json!({"router_id": "R9", "ppp_users": [{"name": "eve"}]})),
    )
    .await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["added"], 1);
    let eve = db::fetch_subscriber(&pool, "R9", "eve").await.unwrap().unwrap();
    assert_eq!(eve.password, "");
}

#[tokio::test]
async fn missing_users_is_bad_request() {
    let pool = setup_pool().await;
    let app = router_for(AppState::new(pool, ReconcileOptions::default()));

    let (status, body) = call(
        app,
        Method::POST,
        "/api/sync_ppp_to_db",
        Some(json!({"router_id": "R1"})),
    )
    .await;

    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(
        body,
        json!({"success": false, "error": "No PPP user data received"})
    );
}

#[tokio::test]
async fn missing_router_is_bad_request() {
    let pool = setup_pool().await;
    let app = router_for(AppState::new(pool.clone(), ReconcileOptions::default()));

    let (status, body) = call(
        app,
        Method::POST,
        "/api/sync_ppp_to_db",
        Some(json!({"ppp_users": [{"name": "alice"}]})),
    )
    .await;

    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["success"], false);
    assert_eq!(body["error"], "router_id is required");
    let total: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM subscribers")
        .fetch_one(&pool)
        .await
        .unwrap();
    assert_eq!(total, 0);
}

#[tokio::test]
async fn non_json_body_still_gets_json_error() {
    let pool = setup_pool().await;
    let app = router_for(AppState::new(pool, ReconcileOptions::default()));

    let req = Request::builder()
        .method(Method::POST)
        .uri("/api/sync_ppp_to_db")
        .body(Body::from("router_id=R1"))
        .unwrap();
    let resp = app.oneshot(req).await.unwrap();
    assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
    let bytes = axum::body::to_bytes(resp.into_body(), usize::MAX).await.unwrap();
    let body: Value = serde_json::from_slice(&bytes).unwrap();
    assert_eq!(body["success"], false);
}

#[tokio::test]
async fn healthz_reports_ok() {
    let pool = setup_pool().await;
    let app = router_for(AppState::new(pool, ReconcileOptions::default()));

    let (status, body) = call(app, Method::GET, "/healthz", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body, json!({"status": "ok"}));
}

#[tokio::test]
async fn healthz_unavailable_when_pool_closed() {
    let pool = setup_pool().await;
    let app = router_for(AppState::new(pool.clone(), ReconcileOptions::default()));
    pool.close().await;

    let (status, body) = call(app, Method::GET, "/healthz", None).await;
    assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
    assert_eq!(body["success"], false);
}

/// Store that succeeds on updates until `fail_after` calls, then reports the
/// connection lost; optionally sleeps before each call.
struct FlakyStore {
    calls: tokio::sync::Mutex<u32>,
    fail_after: u32,
    delay: Duration,
}

#[async_trait]
impl SubscriberStore for FlakyStore {
    async fn update(&self, _r: &str, _u: &str, _p: &str, _prof: &str) -> Result<u64, StoreError> {
        tokio::time::sleep(self.delay).await;
        let mut calls = self.calls.lock().await;
        *calls += 1;
        if *calls > self.fail_after {
            return Err(StoreError::Fatal("connection lost".into()));
        }
        Ok(1)
    }

    async fn insert(&self, _r: &str, _u: &str, _p: &str, _prof: &str) -> Result<(), StoreError> {
        Ok(())
    }

    async fn usernames(&self, _r: &str) -> Result<Vec<String>, StoreError> {
        Ok(Vec::new())
    }

    async fn delete(&self, _r: &str, _usernames: &[String]) -> Result<u64, StoreError> {
        Ok(0)
    }
}

fn three_users() -> Value {
    json!({
        "router_id": "R1",
        "ppp_users": [{"name": "a"}, {"name": "b"}, {"name": "c"}]
    })
}

#[tokio::test]
async fn fatal_store_error_is_500_with_partial_counts() {
    let pool = setup_pool().await;
    let store = Arc::new(FlakyStore {
        calls: Default::default(),
        fail_after: 2,
        delay: Duration::ZERO,
    });
    let app = router_for(AppState::with_store(pool, store, ReconcileOptions::default()));

    let (status, body) = call(app, Method::POST, "/api/sync_ppp_to_db", Some(three_users())).await;

    assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
    assert_eq!(body["success"], false);
    assert!(body["error"].as_str().unwrap().contains("connection lost"));
    assert_eq!(body["updated"], 2);
    assert_eq!(body["total_processed"], 2);
}

#[tokio::test]
async fn sync_deadline_is_504_with_partial_counts() {
    let pool = setup_pool().await;
    let store = Arc::new(FlakyStore {
        calls: Default::default(),
        fail_after: u32::MAX,
        delay: Duration::from_millis(120),
    });
    let opts = ReconcileOptions {
        prune_batch_size: 200,
        deadline: Some(Duration::from_millis(200)),
    };
    let app = router_for(AppState::with_store(pool, store, opts));

    let (status, body) = call(app, Method::POST, "/api/sync_ppp_to_db", Some(three_users())).await;

    assert_eq!(status, StatusCode::GATEWAY_TIMEOUT);
    assert_eq!(body["success"], false);
    assert_eq!(body["updated"], 1);
}

fn slow_store(delay: Duration) -> Arc<FlakyStore> {
    Arc::new(FlakyStore {
        calls: Default::default(),
        fail_after: u32::MAX,
        delay,
    })
}

#[tokio::test]
async fn default_deadline_answers_json_before_request_timeout() {
    let pool = setup_pool().await;
    let cfg = tight_config(1000, 1024 * 1024);
    let state = AppState::with_store(pool, slow_store(Duration::from_millis(400)), (&cfg).into());
    let app = app_router(Arc::new(state), &cfg);

    let (status, body) = call(app, Method::POST, "/api/sync_ppp_to_db", Some(three_users())).await;

    assert_eq!(status, StatusCode::GATEWAY_TIMEOUT);
    assert_eq!(body["success"], false);
    assert_eq!(body["updated"], 2);
    assert_eq!(body["total_processed"], 2);
}

#[tokio::test]
async fn request_timeout_answers_json() {
    let pool = setup_pool().await;
    let cfg = tight_config(100, 1024 * 1024);
    // No pass deadline, so only the request timeout can stop the handler.
    let state = AppState::with_store(pool, slow_store(Duration::from_millis(80)), ReconcileOptions::default());
    let app = app_router(Arc::new(state), &cfg);

    let (status, body) = call(app, Method::POST, "/api/sync_ppp_to_db", Some(three_users())).await;

    assert_eq!(status, StatusCode::GATEWAY_TIMEOUT);
    assert_eq!(body["success"], false);
    assert_eq!(body["error"], "request exceeded its timeout of 100ms");
}

#[tokio::test]
async fn oversized_body_answers_json_413() {
    let pool = setup_pool().await;
    let cfg = tight_config(30_000, 1024);
    let app = app_router(
        Arc::new(AppState::new(pool.clone(), ReconcileOptions::default())),
        &cfg,
    );
    let body = json!({
        "router_id": "R1",
        "ppp_users": [{"name": "alice", "password": "x".repeat(4096)}]
    });

    let (status, body) = call(app, Method::POST, "/api/sync_ppp_to_db", Some(body)).await;

    assert_eq!(status, StatusCode::PAYLOAD_TOO_LARGE);
    assert_eq!(body["success"], false);
    assert!(!body["error"].as_str().unwrap().is_empty());
    assert!(db::list_usernames(&pool, "R1").await.unwrap().is_empty());
}

#[tokio::test]
async fn multi_megabyte_export_fits_default_limit() {
    let pool = setup_pool().await;
    let app = router_for(AppState::new(pool, ReconcileOptions::default()));
    // Blank names are skipped, so only the body size matters here.
    let users: Vec<Value> = (0..10_000)
        .map(|_| json!({"name": "", "password": "p".repeat(300)}))
        .collect();
    let body = json!({"router_id": "R1", "ppp_users": users});
    assert!(body.to_string().len() > 2 * 1024 * 1024);

    let (status, body) = call(app, Method::POST, "/api/sync_ppp_to_db", Some(body)).await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["skipped"], 10_000);
}
