//! Persistence seam for the reconciliation pass.
//!
//! The pass only talks to [`SubscriberStore`]; [`SqliteStore`] adapts the
//! repository functions in [`crate::db`] and classifies driver errors into the
//! three cases the pass distinguishes.
use async_trait::async_trait;
use thiserror::Error;

use crate::db::{self, Pool};

#[derive(Debug, Error)]
pub enum StoreError {
    /// `(router_id, username)` already exists; another pass won the insert.
    #[error("subscriber already exists")]
    Conflict,
    /// The statement failed but the connection is still usable.
    #[error("{0}")]
    Persistence(String),
    /// The store is unreachable; nothing further will succeed.
    #[error("store unavailable: {0}")]
    Fatal(String),
}

#[async_trait]
pub trait SubscriberStore: Send + Sync {
    /// Set password and profile on `(router_id, username)`; returns rows affected.
    async fn update(
        &self,
        router_id: &str,
        username: &str,
        password: &str,
        profile: &str,
    ) -> Result<u64, StoreError>;

    async fn insert(
        &self,
        router_id: &str,
        username: &str,
        password: &str,
        profile: &str,
    ) -> Result<(), StoreError>;

    /// Every persisted username for `router_id`.
    async fn usernames(&self, router_id: &str) -> Result<Vec<String>, StoreError>;

    /// Delete exactly the listed usernames for `router_id`; returns rows affected.
    async fn delete(&self, router_id: &str, usernames: &[String]) -> Result<u64, StoreError>;
}

#[derive(Debug, Clone)]
pub struct SqliteStore {
    pool: Pool,
}

impl SqliteStore {
    pub fn new(pool: Pool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &Pool {
        &self.pool
    }
}

impl From<sqlx::Error> for StoreError {
    fn from(err: sqlx::Error) -> Self {
        match err {
            sqlx::Error::Database(ref db) if db.is_unique_violation() => StoreError::Conflict,
            sqlx::Error::Io(_)
            | sqlx::Error::Tls(_)
            | sqlx::Error::PoolTimedOut
            | sqlx::Error::PoolClosed
            | sqlx::Error::WorkerCrashed => StoreError::Fatal(err.to_string()),
            other => StoreError::Persistence(other.to_string()),
        }
    }
}

#[async_trait]
impl SubscriberStore for SqliteStore {
    async fn update(
        &self,
        router_id: &str,
        username: &str,
        password: &str,
        profile: &str,
    ) -> Result<u64, StoreError> {
        Ok(db::update_subscriber(&self.pool, router_id, username, password, profile).await?)
    }

    async fn insert(
        &self,
        router_id: &str,
        username: &str,
        password: &str,
        profile: &str,
    ) -> Result<(), StoreError> {
        db::insert_subscriber(&self.pool, router_id, username, password, profile).await?;
        Ok(())
    }

    async fn usernames(&self, router_id: &str) -> Result<Vec<String>, StoreError> {
        Ok(db::list_usernames(&self.pool, router_id).await?)
    }

    async fn delete(&self, router_id: &str, usernames: &[String]) -> Result<u64, StoreError> {
        Ok(db::delete_subscribers(&self.pool, router_id, usernames).await?)
    }
}
