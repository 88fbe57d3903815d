use super::model::Subscriber;
use anyhow::{Context, Result};
use chrono::Utc;
use sqlx::sqlite::SqlitePoolOptions;
use sqlx::{QueryBuilder, Sqlite, SqlitePool};
use tracing::instrument;

pub type Pool = SqlitePool;

pub async fn init_pool(database_url: &str) -> Result<Pool> {
    let normalized = prepare_sqlite_url(database_url);
    let pool = SqlitePoolOptions::new()
        .connect(&normalized)
        .await
        .with_context(|| format!("failed to open database {normalized}"))?;
    // Enable WAL and stricter durability.
    sqlx::query("PRAGMA journal_mode=WAL;")
        .execute(&pool)
        .await?;
    sqlx::query("PRAGMA synchronous=FULL;")
        .execute(&pool)
        .await?;
    Ok(pool)
}

/// If using a file-backed SQLite URL, expand a leading `~/`, ensure the parent
/// directory exists and ask SQLite to create the file. In-memory URLs pass through.
fn prepare_sqlite_url(url: &str) -> String {
    if !url.starts_with("sqlite:") || url.starts_with("sqlite::memory") {
        return url.to_string();
    }

    let rest = &url["sqlite:".len()..];
    let path_with_query = rest.strip_prefix("//").unwrap_or(rest);
    let (path_part, query_part) = match path_with_query.split_once('?') {
        Some((p, q)) => (p, Some(q)),
        None => (path_with_query, None),
    };
    if path_part.is_empty() {
        return url.to_string();
    }

    let expanded_path = match (path_part.strip_prefix("~/"), std::env::var("HOME")) {
        (Some(rest), Ok(home)) => format!("{}/{}", home.trim_end_matches('/'), rest),
        _ => path_part.to_string(),
    };

    if let Some(parent) = std::path::Path::new(&expanded_path).parent() {
        if !parent.as_os_str().is_empty() {
            let _ = std::fs::create_dir_all(parent);
        }
    }

    let query = match query_part {
        Some(q) if q.contains("mode=") => q.to_string(),
        Some(q) => format!("{q}&mode=rwc"),
        None => "mode=rwc".to_string(),
    };
    format!("sqlite://{expanded_path}?{query}")
}

pub async fn run_migrations(pool: &Pool) -> Result<()> {
    sqlx::migrate!("./migrations").run(pool).await?;
    Ok(())
}

/// Cheap round-trip used by the health endpoint.
pub async fn ping(pool: &Pool) -> sqlx::Result<()> {
    sqlx::query_scalar::<_, i64>("SELECT 1").fetch_one(pool).await?;
    Ok(())
}

/// Overwrite password and profile of an existing subscriber. Returns rows affected.
#[instrument(skip_all, fields(router_id = %router_id, username = %username))]
pub async fn update_subscriber(
    pool: &Pool,
    router_id: &str,
    username: &str,
    password: &str,
    profile: &str,
) -> sqlx::Result<u64> {
    let res = sqlx::query(
        "UPDATE subscribers SET password = ?, profile = ?, updated_at = ? WHERE router_id = ? AND username = ?",
    )
    .bind(password)
    .bind(profile)
    .bind(Utc::now())
    .bind(router_id)
    .bind(username)
    .execute(pool)
    .await?;
    Ok(res.rows_affected())
}

/// Insert a freshly observed subscriber; panel-only columns start empty.
#[instrument(skip_all, fields(router_id = %router_id, username = %username))]
pub async fn insert_subscriber(
    pool: &Pool,
    router_id: &str,
    username: &str,
    password: &str,
    profile: &str,
) -> sqlx::Result<i64> {
    let now = Utc::now();
    let id: i64 = sqlx::query_scalar(
        "INSERT INTO subscribers (router_id, username, password, profile, contact, map_link, photo, created_at, updated_at) \
         VALUES (?, ?, ?, ?, '', '', '', ?, ?) RETURNING id",
    )
    .bind(router_id)
    .bind(username)
    .bind(password)
    .bind(profile)
    .bind(now)
    .bind(now)
    .fetch_one(pool)
    .await?;
    Ok(id)
}

#[instrument(skip_all, fields(router_id = %router_id))]
pub async fn list_usernames(pool: &Pool, router_id: &str) -> sqlx::Result<Vec<String>> {
    sqlx::query_scalar("SELECT username FROM subscribers WHERE router_id = ? ORDER BY username")
        .bind(router_id)
        .fetch_all(pool)
        .await
}

/// Delete the listed usernames for one router in a single statement.
#[instrument(skip_all, fields(router_id = %router_id, count = usernames.len()))]
pub async fn delete_subscribers(
    pool: &Pool,
    router_id: &str,
    usernames: &[String],
) -> sqlx::Result<u64> {
    if usernames.is_empty() {
        return Ok(0);
    }
    let mut qb: QueryBuilder<Sqlite> =
        QueryBuilder::new("DELETE FROM subscribers WHERE router_id = ");
    qb.push_bind(router_id);
    qb.push(" AND username IN (");
    let mut separated = qb.separated(", ");
    for username in usernames {
        separated.push_bind(username);
    }
    separated.push_unseparated(")");
    let res = qb.build().execute(pool).await?;
    Ok(res.rows_affected())
}

/// Reads one subscriber row. The sync path never reads rows back; this is
/// for inspecting a router's table, mostly from tests.
pub async fn fetch_subscriber(
    pool: &Pool,
    router_id: &str,
    username: &str,
) -> sqlx::Result<Option<Subscriber>> {
    sqlx::query_as::<_, Subscriber>(
        "SELECT id, router_id, username, password, profile, contact, map_link, photo, created_at, updated_at \
         FROM subscribers WHERE router_id = ? AND username = ?",
    )
    .bind(router_id)
    .bind(username)
    .fetch_optional(pool)
    .await
}

/// Row count for one router, reported by `ppp_import` after an import.
pub async fn count_subscribers(pool: &Pool, router_id: &str) -> sqlx::Result<i64> {
    sqlx::query_scalar("SELECT COUNT(*) FROM subscribers WHERE router_id = ?")
        .bind(router_id)
        .fetch_one(pool)
        .await
}
