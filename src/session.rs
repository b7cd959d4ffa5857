//! Session lifecycle: login, refresh rotation and per-request authentication.
//!
//! A session is a pair of an access token (stateless, fingerprint bound) and
//! an opaque refresh token whose SHA256 is stored per (user, fingerprint).
//! Every use of a refresh token consumes it.

use std::sync::Arc;

use chrono::{DateTime, TimeDelta, Utc};
use uuid::Uuid;

use crate::crypto::{Crypto, digest, random_token};
use crate::database::{Database, RefreshToken};
use crate::error::{Result, ServerError};
use crate::fingerprint::{ClientInfo, Fingerprint};
use crate::token::{Claims, TokenManager};
use crate::user::normalize_email;

/// Instant `ttl` seconds from now.
///
/// Fails instead of overflowing on lifetimes out of range.
pub fn expires_in(ttl: u64) -> Result<DateTime<Utc>> {
    i64::try_from(ttl)
        .ok()
        .and_then(TimeDelta::try_seconds)
        .and_then(|ttl| Utc::now().checked_add_signed(ttl))
        .ok_or_else(|| ServerError::Internal {
            details: format!("lifetime of {ttl} seconds is out of range"),
            source: None,
        })
}

/// Freshly minted credentials.
#[derive(Clone)]
pub struct Tokens {
    pub access_token: String,
    pub refresh_token: String,
}

impl std::fmt::Debug for Tokens {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("Tokens { .. }")
    }
}

/// Outcome of authenticating a request.
#[derive(Debug)]
pub enum SessionState {
    /// Neither access nor refresh token was presented.
    NoToken,
    /// Access token verified, refresh token untouched.
    ValidAccess(Claims),
    /// Access token unusable, refresh token rotated into `tokens`.
    ExpiredAccessValidRefresh { claims: Claims, tokens: Tokens },
    /// Credentials presented but refused.
    Invalid,
}

#[derive(Clone)]
pub struct SessionManager {
    token: Arc<TokenManager>,
    db: Database,
    refresh_ttl: u64,
}

impl SessionManager {
    /// Create a new [`SessionManager`].
    pub fn new(token: Arc<TokenManager>, db: Database, refresh_ttl: u64) -> Self {
        Self {
            token,
            db,
            refresh_ttl,
        }
    }

    pub fn access_ttl(&self) -> u64 {
        self.token.access_ttl()
    }

    pub fn refresh_ttl(&self) -> u64 {
        self.refresh_ttl
    }

    /// Mint an access token and a refresh token record for `fingerprint`.
    fn mint(
        &self,
        user_id: Uuid,
        fingerprint: &Fingerprint,
    ) -> Result<(Tokens, RefreshToken)> {
        let access_token = self.token.issue_access_token(user_id, fingerprint)?;
        let refresh_token = random_token()?;

        let record = RefreshToken {
            user_id,
            token_hash: digest(&refresh_token),
            fingerprint: fingerprint.as_str().to_owned(),
            expires_at: expires_in(self.refresh_ttl)?,
        };

        Ok((
            Tokens {
                access_token,
                refresh_token,
            },
            record,
        ))
    }

    /// Check credentials and open a session for `client`.
    ///
    /// Unknown email and wrong password are indistinguishable.
    pub async fn login(
        &self,
        crypto: &Crypto,
        email: &str,
        password: &str,
        client: &ClientInfo,
    ) -> Result<Tokens> {
        let Some(user) = self.db.users.find_by_email(&normalize_email(email)).await?
        else {
            crypto.pwd.dummy_verify(password);
            tracing::debug!("login refused, unknown email");
            metrics::counter!("sessions_rejected_total", "reason" => "credentials").increment(1);
            return Err(ServerError::Unauthorized);
        };

        if let Err(err) = crypto.pwd.verify_password(password, &user.password) {
            tracing::debug!(user_id = %user.id, "login refused, wrong password");
            metrics::counter!("sessions_rejected_total", "reason" => "credentials").increment(1);
            return Err(err);
        }

        let fingerprint = client.fingerprint();
        let (tokens, record) = self.mint(user.id, &fingerprint)?;
        self.db.tokens.upsert(&record).await?;

        tracing::info!(user_id = %user.id, "session opened");
        metrics::counter!("sessions_issued_total").increment(1);

        Ok(tokens)
    }

    /// Exchange a refresh token for a new pair bound to `client`.
    ///
    /// The presented token is consumed, a replay gets [`ServerError::Unauthorized`].
    pub async fn rotate(
        &self,
        refresh_token: &str,
        client: &ClientInfo,
    ) -> Result<Tokens> {
        let token_hash = digest(refresh_token);

        let Some(record) = self.db.tokens.find_by_hash(&token_hash).await? else {
            tracing::warn!("unknown refresh token presented");
            metrics::counter!("sessions_rejected_total", "reason" => "unknown").increment(1);
            return Err(ServerError::Unauthorized);
        };

        if record.is_expired(Utc::now()) {
            tracing::debug!(user_id = %record.user_id, "refresh token expired");
            metrics::counter!("sessions_rejected_total", "reason" => "expired").increment(1);
            return Err(ServerError::Unauthorized);
        }

        let Some(user) = self.db.users.find_by_id(record.user_id).await? else {
            tracing::warn!(user_id = %record.user_id, "refresh token of a missing user");
            return Err(ServerError::Unauthorized);
        };

        let fingerprint = client.fingerprint();
        let (tokens, next) = self.mint(user.id, &fingerprint)?;

        if !self.db.tokens.rotate(&token_hash, &next).await? {
            tracing::warn!(user_id = %user.id, "refresh token already consumed");
            metrics::counter!("sessions_rejected_total", "reason" => "replayed").increment(1);
            return Err(ServerError::Unauthorized);
        }

        tracing::debug!(user_id = %user.id, "refresh token rotated");
        metrics::counter!("sessions_rotated_total").increment(1);

        Ok(tokens)
    }

    /// Decide the state of a request from its credentials.
    ///
    /// Runs at most one rotation. Store failures are returned as errors, every
    /// credential problem becomes [`SessionState::Invalid`].
    pub async fn authenticate(
        &self,
        access_token: Option<&str>,
        refresh_token: Option<&str>,
        client: &ClientInfo,
    ) -> Result<SessionState> {
        let fingerprint = client.fingerprint();

        if let Some(token) = access_token {
            match self.token.validate_access_token(token, &fingerprint) {
                Ok(claims) => return Ok(SessionState::ValidAccess(claims)),
                Err(err) => tracing::debug!(reason = %err, "access token refused"),
            }
        }

        let Some(refresh_token) = refresh_token else {
            return Ok(match access_token {
                None => SessionState::NoToken,
                Some(_) => SessionState::Invalid,
            });
        };

        let tokens = match self.rotate(refresh_token, client).await {
            Ok(tokens) => tokens,
            Err(ServerError::Unauthorized) => return Ok(SessionState::Invalid),
            Err(err) => return Err(err),
        };

        match self.token.validate_access_token(&tokens.access_token, &fingerprint) {
            Ok(claims) => Ok(SessionState::ExpiredAccessValidRefresh { claims, tokens }),
            Err(err) => {
                tracing::error!(reason = %err, "freshly issued access token refused");
                Ok(SessionState::Invalid)
            },
        }
    }

    /// Revoke the session of `refresh_token`, other sessions stay open.
    pub async fn logout(&self, refresh_token: Option<&str>) -> Result<()> {
        if let Some(refresh_token) = refresh_token {
            if self.db.tokens.revoke(&digest(refresh_token)).await? {
                tracing::info!("session closed");
            }
        }

        Ok(())
    }

    /// Open sessions of `user_id`.
    pub async fn sessions(&self, user_id: Uuid) -> Result<Vec<RefreshToken>> {
        self.db.tokens.list(user_id).await
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::crypto::light_config;
    use crate::user::{Account, UserService};

    pub const EMAIL: &str = "a@example.com";
    pub const PASSWORD: &str = "Secret123!";
    const UA: &str = "Mozilla/5.0";

    struct Fixture {
        db: Database,
        crypto: Crypto,
        token: Arc<TokenManager>,
        session: SessionManager,
        user_id: Uuid,
    }

    async fn fixture() -> Fixture {
        let db = Database::memory();
        let crypto = Crypto::new(Some(light_config())).unwrap();
        let token = Arc::new(crate::token::tests::manager(60));
        let session = SessionManager::new(token.clone(), db.clone(), 3600);

        let (user, _) = UserService::new(&db, &crypto)
            .register(
                Account {
                    email: EMAIL.into(),
                    password: PASSWORD.into(),
                    first_name: "Ada".into(),
                    last_name: "Lovelace".into(),
                    location: None,
                },
                3600,
            )
            .await
            .unwrap();

        Fixture {
            db,
            crypto,
            token,
            session,
            user_id: user.id,
        }
    }

    fn client(ip: &str) -> ClientInfo {
        ClientInfo {
            ip: ip.into(),
            user_agent: UA.into(),
        }
    }

    #[tokio::test]
    async fn test_login() {
        let f = fixture().await;
        let client = client("203.0.113.9");

        assert!(matches!(
            f.session.login(&f.crypto, EMAIL, "wrong-password", &client).await,
            Err(ServerError::Unauthorized)
        ));
        assert!(matches!(
            f.session
                .login(&f.crypto, "nobody@example.com", PASSWORD, &client)
                .await,
            Err(ServerError::Unauthorized)
        ));

        let tokens = f.session.login(&f.crypto, EMAIL, PASSWORD, &client).await.unwrap();
        let claims = f
            .token
            .validate_access_token(&tokens.access_token, &client.fingerprint())
            .unwrap();
        assert_eq!(claims.sub, f.user_id);

        let stored = f
            .db
            .tokens
            .find_by_hash(&digest(&tokens.refresh_token))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(stored.user_id, f.user_id);
        assert_eq!(stored.fingerprint, client.fingerprint().as_str());
    }

    #[test]
    fn test_expires_in() {
        let now = Utc::now();
        let expiry = expires_in(3600).unwrap();
        assert!(expiry >= now + TimeDelta::seconds(3600));

        assert!(matches!(
            expires_in(100_000_000_000_000_000),
            Err(ServerError::Internal { .. })
        ));
        assert!(matches!(expires_in(u64::MAX), Err(ServerError::Internal { .. })));
    }

    #[tokio::test]
    async fn test_login_lifetime_out_of_range() {
        let f = fixture().await;
        let session = SessionManager::new(f.token.clone(), f.db.clone(), 100_000_000_000_000_000);

        assert!(matches!(
            session.login(&f.crypto, EMAIL, PASSWORD, &client("203.0.113.9")).await,
            Err(ServerError::Internal { .. })
        ));
        // Nothing was stored.
        assert!(f.session.sessions(f.user_id).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_authenticate_states() {
        let f = fixture().await;
        let client = client("203.0.113.9");
        let tokens = f.session.login(&f.crypto, EMAIL, PASSWORD, &client).await.unwrap();

        assert!(matches!(
            f.session.authenticate(None, None, &client).await.unwrap(),
            SessionState::NoToken
        ));
        assert!(matches!(
            f.session.authenticate(Some("garbage"), None, &client).await.unwrap(),
            SessionState::Invalid
        ));
        assert!(matches!(
            f.session
                .authenticate(Some(&tokens.access_token), Some(&tokens.refresh_token), &client)
                .await
                .unwrap(),
            SessionState::ValidAccess(_)
        ));
        // Refresh path skipped, token still usable.
        assert!(f.session.rotate(&tokens.refresh_token, &client).await.is_ok());
    }

    #[tokio::test]
    async fn test_expired_access_rotates() {
        let f = fixture().await;
        let client = client("203.0.113.9");
        let tokens = f.session.login(&f.crypto, EMAIL, PASSWORD, &client).await.unwrap();

        let expired = f
            .token
            .issue_access_token_at(f.user_id, &client.fingerprint(), Utc::now().timestamp() - 120)
            .unwrap();

        let state = f
            .session
            .authenticate(Some(&expired), Some(&tokens.refresh_token), &client)
            .await
            .unwrap();
        let (claims, fresh) = match state {
            SessionState::ExpiredAccessValidRefresh { claims, tokens } => (claims, tokens),
            other => panic!("expected a rotation, got {other:?}"),
        };
        assert_eq!(claims.sub, f.user_id);
        assert_ne!(fresh.refresh_token, tokens.refresh_token);

        // Old refresh token is spent.
        assert!(matches!(
            f.session
                .authenticate(Some(&expired), Some(&tokens.refresh_token), &client)
                .await
                .unwrap(),
            SessionState::Invalid
        ));
        // Refresh cookie alone is enough.
        assert!(matches!(
            f.session
                .authenticate(None, Some(&fresh.refresh_token), &client)
                .await
                .unwrap(),
            SessionState::ExpiredAccessValidRefresh { .. }
        ));
    }

    #[tokio::test]
    async fn test_fingerprint_change_rotates() {
        let f = fixture().await;
        let home = client("203.0.113.9");
        let tokens = f.session.login(&f.crypto, EMAIL, PASSWORD, &home).await.unwrap();

        let elsewhere = client("198.51.100.7");
        let state = f
            .session
            .authenticate(Some(&tokens.access_token), Some(&tokens.refresh_token), &elsewhere)
            .await
            .unwrap();
        let claims = match state {
            SessionState::ExpiredAccessValidRefresh { claims, .. } => claims,
            other => panic!("expected a rotation, got {other:?}"),
        };
        assert_eq!(claims.fp, elsewhere.fingerprint().as_str());

        // Access token alone from another network is refused.
        assert!(matches!(
            f.session
                .authenticate(Some(&tokens.access_token), None, &elsewhere)
                .await
                .unwrap(),
            SessionState::Invalid
        ));
    }

    #[tokio::test]
    async fn test_rotation_single_use() {
        let f = fixture().await;
        let client = client("203.0.113.9");
        let tokens = f.session.login(&f.crypto, EMAIL, PASSWORD, &client).await.unwrap();

        let (first, second) = tokio::join!(
            f.session.rotate(&tokens.refresh_token, &client),
            f.session.rotate(&tokens.refresh_token, &client),
        );
        assert!(first.is_ok() ^ second.is_ok());
        assert!(matches!(
            f.session.rotate(&tokens.refresh_token, &client).await,
            Err(ServerError::Unauthorized)
        ));
    }

    #[tokio::test]
    async fn test_expired_refresh() {
        let f = fixture().await;
        let client = client("203.0.113.9");
        let refresh_token = random_token().unwrap();

        f.db.tokens
            .upsert(&RefreshToken {
                user_id: f.user_id,
                token_hash: digest(&refresh_token),
                fingerprint: client.fingerprint().as_str().to_owned(),
                expires_at: Utc::now() - TimeDelta::seconds(1),
            })
            .await
            .unwrap();

        assert!(matches!(
            f.session.rotate(&refresh_token, &client).await,
            Err(ServerError::Unauthorized)
        ));
        assert!(matches!(
            f.session.rotate("never-issued", &client).await,
            Err(ServerError::Unauthorized)
        ));
    }

    #[tokio::test]
    async fn test_independent_sessions() {
        let f = fixture().await;
        let laptop = client("203.0.113.9");
        let phone = ClientInfo {
            ip: "203.0.113.9".into(),
            user_agent: "Mobile Safari".into(),
        };

        let first = f.session.login(&f.crypto, EMAIL, PASSWORD, &laptop).await.unwrap();
        let second = f.session.login(&f.crypto, EMAIL, PASSWORD, &phone).await.unwrap();
        assert_eq!(f.session.sessions(f.user_id).await.unwrap().len(), 2);

        f.session.logout(Some(&first.refresh_token)).await.unwrap();

        assert!(matches!(
            f.session.rotate(&first.refresh_token, &laptop).await,
            Err(ServerError::Unauthorized)
        ));
        assert!(f.session.rotate(&second.refresh_token, &phone).await.is_ok());
        assert_eq!(f.session.sessions(f.user_id).await.unwrap().len(), 1);

        // Nothing to revoke is not an error.
        f.session.logout(None).await.unwrap();
    }

    #[tokio::test]
    async fn test_relogin_same_fingerprint() {
        let f = fixture().await;
        let client = client("203.0.113.9");

        let first = f.session.login(&f.crypto, EMAIL, PASSWORD, &client).await.unwrap();
        let second = f.session.login(&f.crypto, EMAIL, PASSWORD, &client).await.unwrap();

        assert_eq!(f.session.sessions(f.user_id).await.unwrap().len(), 1);
        assert!(f.session.rotate(&first.refresh_token, &client).await.is_err());
        assert!(f.session.rotate(&second.refresh_token, &client).await.is_ok());
    }
}
