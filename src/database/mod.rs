//! Credential store.
//!
//! Handlers only see the [`UserRepository`] and [`TokenRepository`] traits.
//! PostgreSQL backs them in production, a memory store backs tests and local
//! runs without a `postgres` configuration entry.
pub mod memory;
pub mod postgres;

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use axum::extract::FromRef;
use chrono::{DateTime, Utc};
use serde::Serialize;
use uuid::Uuid;

use crate::AppState;
use crate::error::{Result, ServerError};
use crate::user::{Invitation, NewUser, User};

pub const DEFAULT_CREDENTIALS: &str = "postgres";
pub const DEFAULT_DATABASE_NAME: &str = "sessiond";
pub const DEFAULT_POOL_SIZE: u32 = 10;
pub const DEFAULT_QUERY_TIMEOUT: Duration = Duration::from_secs(5);
pub const PURGE_INTERVAL: Duration = Duration::from_secs(60 * 60);

/// Refresh token as saved on database.
///
/// Only the hash of the token is ever stored.
#[derive(Clone, Debug, PartialEq, Serialize, sqlx::FromRow)]
pub struct RefreshToken {
    pub user_id: Uuid,
    #[serde(skip)]
    pub token_hash: String,
    pub fingerprint: String,
    pub expires_at: DateTime<Utc>,
}

impl RefreshToken {
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at <= now
    }
}

/// Users, their locations and pending invitations.
#[async_trait]
pub trait UserRepository: Send + Sync {
    /// Insert user, its location if new, and its invitation atomically.
    async fn create_and_invite(
        &self,
        user: NewUser,
        invitation: Invitation,
    ) -> Result<User>;

    /// Find user with its password hash.
    async fn find_by_email(&self, email: &str) -> Result<Option<User>>;

    async fn find_by_id(&self, id: Uuid) -> Result<Option<User>>;

    /// Consume an unexpired invitation and activate its user.
    /// Returns `false` when no invitation matches.
    async fn activate(&self, token_hash: &str) -> Result<bool>;
}

/// Refresh token records, unique per (user, fingerprint).
#[async_trait]
pub trait TokenRepository: Send + Sync {
    /// Insert or overwrite the record of the same (user, fingerprint).
    async fn upsert(&self, token: &RefreshToken) -> Result<()>;

    async fn find_by_hash(&self, token_hash: &str) -> Result<Option<RefreshToken>>;

    /// Unexpired records of a user.
    async fn list(&self, user_id: Uuid) -> Result<Vec<RefreshToken>>;

    /// Atomically consume `old_hash` and store `token`.
    ///
    /// Returns `false`, writing nothing, when `old_hash` is missing or expired,
    /// e.g. because a concurrent request already rotated it.
    async fn rotate(&self, old_hash: &str, token: &RefreshToken) -> Result<bool>;

    /// Delete a single record. Returns `false` when nothing matched.
    async fn revoke(&self, token_hash: &str) -> Result<bool>;

    /// Delete expired records, returns how many were removed.
    async fn purge_expired(&self) -> Result<u64>;
}

/// Custom db structure to pass to Axum.
#[derive(Clone)]
pub struct Database {
    pub users: Arc<dyn UserRepository>,
    pub tokens: Arc<dyn TokenRepository>,
}

impl Database {
    /// Init PostgreSQL connections and run migrations.
    pub async fn postgres(
        config: &crate::config::Postgres,
    ) -> std::result::Result<Self, sqlx::Error> {
        let store = postgres::PgStore::connect(config).await?;
        let store = Arc::new(store);

        Ok(Self {
            users: store.clone(),
            tokens: store,
        })
    }

    /// Non-persistent store.
    pub fn memory() -> Self {
        let store = Arc::new(memory::MemoryStore::default());

        Self {
            users: store.clone(),
            tokens: store,
        }
    }
}

/// Periodically drop expired refresh tokens.
///
/// Abandoned sessions are never rotated nor revoked, only this removes them.
pub fn spawn_purge(tokens: Arc<dyn TokenRepository>, every: Duration) {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(every);

        loop {
            interval.tick().await;

            match tokens.purge_expired().await {
                Ok(0) => {},
                Ok(removed) => tracing::debug!(removed, "expired refresh tokens purged"),
                Err(err) => tracing::warn!(%err, "cannot purge expired refresh tokens"),
            }
        }
    });
}

impl FromRef<AppState> for Database {
    fn from_ref(app_state: &AppState) -> Database {
        app_state.db.clone()
    }
}

/// Bound a store call.
pub(crate) async fn with_timeout<T>(
    duration: Duration,
    fut: impl Future<Output = Result<T>>,
) -> Result<T> {
    match tokio::time::timeout(duration, fut).await {
        Ok(result) => result,
        Err(_) => {
            tracing::error!(timeout = ?duration, "store call timed out");
            Err(ServerError::Timeout)
        },
    }
}
