//! PostgreSQL implementation of the credential store.

use std::time::Duration;

use async_trait::async_trait;
use sqlx::postgres::PgPoolOptions;
use sqlx::{PgPool, Postgres, Transaction};
use uuid::Uuid;

use super::{
    DEFAULT_CREDENTIALS, DEFAULT_DATABASE_NAME, DEFAULT_POOL_SIZE,
    DEFAULT_QUERY_TIMEOUT, RefreshToken, TokenRepository, UserRepository,
    with_timeout,
};
use crate::error::{Result, ServerError};
use crate::user::{Invitation, Location, NewUser, User};

const USER_COLUMNS: &str = "id, email, password, first_name, last_name, is_active, version, location_id, created_at";

/// PostgreSQL backed store.
#[derive(Clone)]
pub struct PgStore {
    pool: PgPool,
    timeout: Duration,
}

impl PgStore {
    /// Connect and run migrations scripts.
    pub async fn connect(
        config: &crate::config::Postgres,
    ) -> std::result::Result<Self, sqlx::Error> {
        let username = config.username.as_deref().unwrap_or(DEFAULT_CREDENTIALS);
        let password = config.password.as_deref().unwrap_or(DEFAULT_CREDENTIALS);
        let db = config.database.as_deref().unwrap_or(DEFAULT_DATABASE_NAME);
        let hostname = &config.address;

        let addr = format!("postgres://{username}:{password}@{hostname}/{db}");
        let pool = PgPoolOptions::new()
            .max_connections(config.pool_size.unwrap_or(DEFAULT_POOL_SIZE))
            .connect(&addr)
            .await?;

        tracing::info!(%hostname, %db, "postgres connected");

        sqlx::migrate!().run(&pool).await?;

        Ok(Self::new(pool).timeout(
            config
                .query_timeout
                .map(Duration::from_secs)
                .unwrap_or(DEFAULT_QUERY_TIMEOUT),
        ))
    }

    /// Create a new [`PgStore`] on an existing pool.
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool,
            timeout: DEFAULT_QUERY_TIMEOUT,
        }
    }

    /// Update per query timeout.
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }
}

/// Reuse an identical location or insert it.
async fn find_or_create_location(
    tx: &mut Transaction<'_, Postgres>,
    location: &Location,
) -> Result<Uuid> {
    let existing = sqlx::query_scalar::<_, Uuid>(
        r#"SELECT id FROM locations
            WHERE is_precise = $1 AND street = $2 AND city = $3 AND state = $4 AND zip_code = $5 AND country = $6
            LIMIT 1"#,
    )
    .bind(location.is_precise)
    .bind(&location.street)
    .bind(&location.city)
    .bind(&location.state)
    .bind(&location.zip_code)
    .bind(&location.country)
    .fetch_optional(&mut **tx)
    .await?;

    if let Some(id) = existing {
        return Ok(id);
    }

    sqlx::query(
        r#"INSERT INTO locations (id, street, city, state, county, zip_code, country, country_code, latitude, longitude, is_precise)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)"#,
    )
    .bind(location.id)
    .bind(&location.street)
    .bind(&location.city)
    .bind(&location.state)
    .bind(&location.county)
    .bind(&location.zip_code)
    .bind(&location.country)
    .bind(&location.country_code)
    .bind(location.latitude)
    .bind(location.longitude)
    .bind(location.is_precise)
    .execute(&mut **tx)
    .await?;

    Ok(location.id)
}

#[async_trait]
impl UserRepository for PgStore {
    async fn create_and_invite(
        &self,
        user: NewUser,
        invitation: Invitation,
    ) -> Result<User> {
        with_timeout(self.timeout, async {
            let mut tx = self.pool.begin().await?;

            let location_id = match &user.location {
                Some(location) => {
                    Some(find_or_create_location(&mut tx, location).await?)
                },
                None => None,
            };

            let query = format!(
                r#"INSERT INTO users (id, email, password, first_name, last_name, location_id)
                    VALUES ($1, $2, $3, $4, $5, $6)
                    RETURNING {USER_COLUMNS}"#
            );
            let created = sqlx::query_as::<_, User>(&query)
                .bind(user.id)
                .bind(&user.email)
                .bind(&user.password)
                .bind(&user.first_name)
                .bind(&user.last_name)
                .bind(location_id)
                .fetch_one(&mut *tx)
                .await
                .map_err(|err| match err.as_database_error() {
                    Some(db) if db.is_unique_violation() => {
                        ServerError::DuplicateEmail
                    },
                    _ => ServerError::Sql(err),
                })?;

            sqlx::query(
                r#"INSERT INTO user_invitations (token, user_id, expires_at)
                    VALUES ($1, $2, $3)"#,
            )
            .bind(&invitation.token_hash)
            .bind(created.id)
            .bind(invitation.expires_at)
            .execute(&mut *tx)
            .await?;

            tx.commit().await?;

            Ok::<_, ServerError>(created)
        })
        .await
    }

    async fn find_by_email(&self, email: &str) -> Result<Option<User>> {
        with_timeout(self.timeout, async {
            let query = format!("SELECT {USER_COLUMNS} FROM users WHERE email = $1");

            Ok::<_, ServerError>(sqlx::query_as::<_, User>(&query)
                .bind(email)
                .fetch_optional(&self.pool)
                .await?)
        })
        .await
    }

    async fn find_by_id(&self, id: Uuid) -> Result<Option<User>> {
        with_timeout(self.timeout, async {
            let query = format!("SELECT {USER_COLUMNS} FROM users WHERE id = $1");

            Ok::<_, ServerError>(sqlx::query_as::<_, User>(&query)
                .bind(id)
                .fetch_optional(&self.pool)
                .await?)
        })
        .await
    }

    async fn activate(&self, token_hash: &str) -> Result<bool> {
        with_timeout(self.timeout, async {
            let mut tx = self.pool.begin().await?;

            let user_id = sqlx::query_scalar::<_, Uuid>(
                r#"DELETE FROM user_invitations
                    WHERE token = $1 AND expires_at > NOW()
                    RETURNING user_id"#,
            )
            .bind(token_hash)
            .fetch_optional(&mut *tx)
            .await?;

            let Some(user_id) = user_id else {
                tx.rollback().await?;
                return Ok(false);
            };

            sqlx::query(
                "UPDATE users SET is_active = TRUE, version = version + 1 WHERE id = $1",
            )
            .bind(user_id)
            .execute(&mut *tx)
            .await?;

            sqlx::query("DELETE FROM user_invitations WHERE user_id = $1")
                .bind(user_id)
                .execute(&mut *tx)
                .await?;

            tx.commit().await?;

            tracing::info!(%user_id, "user activated");
            Ok::<_, ServerError>(true)
        })
        .await
    }
}

/// Insert or overwrite the (user, fingerprint) slot.
const UPSERT_TOKEN: &str = r#"INSERT INTO refresh_tokens (user_id, token_hash, fingerprint, expires_at)
    VALUES ($1, $2, $3, $4)
    ON CONFLICT (user_id, fingerprint)
    DO UPDATE SET token_hash = EXCLUDED.token_hash, expires_at = EXCLUDED.expires_at, created_at = NOW()"#;

#[async_trait]
impl TokenRepository for PgStore {
    async fn upsert(&self, token: &RefreshToken) -> Result<()> {
        with_timeout(self.timeout, async {
            sqlx::query(UPSERT_TOKEN)
                .bind(token.user_id)
                .bind(&token.token_hash)
                .bind(&token.fingerprint)
                .bind(token.expires_at)
                .execute(&self.pool)
                .await?;

            Ok::<_, ServerError>(())
        })
        .await
    }

    async fn find_by_hash(&self, token_hash: &str) -> Result<Option<RefreshToken>> {
        with_timeout(self.timeout, async {
            Ok::<_, ServerError>(sqlx::query_as::<_, RefreshToken>(
                r#"SELECT user_id, token_hash, fingerprint, expires_at
                    FROM refresh_tokens WHERE token_hash = $1"#,
            )
            .bind(token_hash)
            .fetch_optional(&self.pool)
            .await?)
        })
        .await
    }

    async fn list(&self, user_id: Uuid) -> Result<Vec<RefreshToken>> {
        with_timeout(self.timeout, async {
            Ok::<_, ServerError>(sqlx::query_as::<_, RefreshToken>(
                r#"SELECT user_id, token_hash, fingerprint, expires_at
                    FROM refresh_tokens
                    WHERE user_id = $1 AND expires_at > NOW()
                    ORDER BY expires_at DESC"#,
            )
            .bind(user_id)
            .fetch_all(&self.pool)
            .await?)
        })
        .await
    }

    async fn rotate(&self, old_hash: &str, token: &RefreshToken) -> Result<bool> {
        with_timeout(self.timeout, async {
            let mut tx = self.pool.begin().await?;

            // Row lock makes concurrent rotations of the same token serialize
            // here; the loser sees zero affected rows.
            let consumed = sqlx::query(
                "DELETE FROM refresh_tokens WHERE token_hash = $1 AND expires_at > NOW()",
            )
            .bind(old_hash)
            .execute(&mut *tx)
            .await?
            .rows_affected();

            if consumed != 1 {
                tx.rollback().await?;
                return Ok(false);
            }

            sqlx::query(UPSERT_TOKEN)
                .bind(token.user_id)
                .bind(&token.token_hash)
                .bind(&token.fingerprint)
                .bind(token.expires_at)
                .execute(&mut *tx)
                .await?;

            tx.commit().await?;

            Ok::<_, ServerError>(true)
        })
        .await
    }

    async fn revoke(&self, token_hash: &str) -> Result<bool> {
        with_timeout(self.timeout, async {
            let result =
                sqlx::query("DELETE FROM refresh_tokens WHERE token_hash = $1")
                    .bind(token_hash)
                    .execute(&self.pool)
                    .await?;

            Ok::<_, ServerError>(result.rows_affected() > 0)
        })
        .await
    }
    async fn purge_expired(&self) -> Result<u64> {
        with_timeout(self.timeout, async {
            let result =
                sqlx::query("DELETE FROM refresh_tokens WHERE expires_at <= NOW()")
                    .execute(&self.pool)
                    .await?;

            Ok::<_, ServerError>(result.rows_affected())
        })
        .await
    }
}
