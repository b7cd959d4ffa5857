//! Configuration manager for sessiond.

use std::fs::File;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use axum::extract::FromRef;
use serde::{Deserialize, Serialize};

use crate::AppState;

const DEFAULT_CONFIG_PATH: &str = "config.yaml";
const VERSION: &str = env!("CARGO_PKG_VERSION");

const PRIVATE_KEY_PATH_ENV: &str = "JWT_ECDSA_PRIVATE_KEY_PATH";
const PUBLIC_KEY_PATH_ENV: &str = "JWT_ECDSA_PUBLIC_KEY_PATH";
const ACCESS_TTL_ENV: &str = "ACCESS_TOKEN_TTL";
const REFRESH_TTL_ENV: &str = "REFRESH_TOKEN_TTL";
const PORT_ENV: &str = "PORT";

/// Longest accepted lifetime for tokens and invitations, in seconds.
pub const MAX_TTL: u64 = 60 * 60 * 24 * 365; // 1 year.

/// Values refused at startup.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("`{field}` must be between 1 and {MAX_TTL} seconds, got {value}")]
    Ttl { field: &'static str, value: u64 },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Configuration {
    /// Instance name.
    pub name: String,
    /// Listening port.
    pub port: u16,
    /// Read the client IP from `X-Forwarded-For`.
    /// Only enable behind a proxy that overwrites the header.
    pub trust_forwarded_for: bool,
    #[serde(skip_deserializing)]
    version: String,
    #[serde(skip)]
    path: PathBuf,
    /// Related to JsonWebToken and refresh token configuration.
    #[serde(skip_serializing)]
    pub token: Token,
    /// Related to PostgreSQL configuration.
    /// In-memory storage is used when absent.
    #[serde(skip_serializing)]
    pub postgres: Option<Postgres>,
    /// Related to Argon2 configuration.
    #[serde(skip_serializing)]
    pub argon2: Option<Argon2>,
    /// Related to account registration.
    #[serde(skip_serializing)]
    pub registration: Registration,
}

impl Default for Configuration {
    fn default() -> Self {
        Self {
            name: env!("CARGO_CRATE_NAME").into(),
            port: 8080,
            trust_forwarded_for: true,
            version: VERSION.to_owned(),
            path: PathBuf::from(DEFAULT_CONFIG_PATH),
            token: Token::default(),
            postgres: None,
            argon2: None,
            registration: Registration::default(),
        }
    }
}

/// PostgreSQL configuration.
#[derive(Debug, Default, PartialEq, Clone, Serialize, Deserialize)]
pub struct Postgres {
    /// Hostname:(?port) for PostgreSQL instance.
    pub address: String,
    /// Database name.
    pub database: Option<String>,
    /// Username credential to connect.
    pub username: Option<String>,
    /// Password credential to connect.
    pub password: Option<String>,
    /// Maximum pool connections.
    pub pool_size: Option<u32>,
    /// Upper bound of a single query, in seconds.
    pub query_timeout: Option<u64>,
}

/// Argon2 configuration.
#[derive(Debug, PartialEq, Clone, Serialize, Deserialize)]
pub struct Argon2 {
    /// Memory used while hashing.
    pub memory_cost: u32,
    /// Iterations of hash.
    pub iterations: u32,
    /// Parallelism degree.
    pub parallelism: u32,
    /// Output hash length.
    pub hash_length: usize,
}

impl Default for Argon2 {
    fn default() -> Self {
        Self {
            memory_cost: 1024 * 64, // 64 MiB.
            iterations: 4,
            parallelism: 2,
            hash_length: 32,
        }
    }
}

/// Json Web Token configuration.
#[derive(Debug, PartialEq, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Token {
    /// `iss` claim.
    pub issuer: String,
    /// `aud` claim.
    pub audience: String,
    /// `kid` header, also published on JWKS.
    pub key_id: Option<String>,
    /// Access token lifetime, in seconds.
    pub access_ttl: u64,
    /// Refresh token lifetime, in seconds.
    pub refresh_ttl: u64,
    /// PEM encoded ECDSA P-256 private key (PKCS#8 or SEC1).
    pub private_key_path: PathBuf,
    /// PEM encoded ECDSA P-256 public key (SPKI).
    pub public_key_path: PathBuf,
}

impl Default for Token {
    fn default() -> Self {
        Self {
            issuer: "shotseek-auth-service".into(),
            audience: "shotseek-api".into(),
            key_id: None,
            access_ttl: 60 * 60,             // 60 minutes.
            refresh_ttl: 60 * 60 * 24 * 7, // 7 days.
            private_key_path: PathBuf::from(".keys/private_key.pem"),
            public_key_path: PathBuf::from(".keys/public_key.pem"),
        }
    }
}

/// Account registration configuration.
#[derive(Debug, PartialEq, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Registration {
    /// Activation token lifetime, in seconds.
    pub invitation_ttl: u64,
    /// Return the plain activation token on registration.
    /// MUST stay disabled in production.
    pub expose_activation_token: bool,
}

impl Default for Registration {
    fn default() -> Self {
        Self {
            invitation_ttl: 60 * 60, // 1 hour.
            expose_activation_token: false,
        }
    }
}

impl FromRef<AppState> for Arc<Configuration> {
    fn from_ref(state: &AppState) -> Arc<Configuration> {
        Arc::clone(&state.config)
    }
}

impl Configuration {
    pub fn path(mut self, path: PathBuf) -> Self {
        self.path = path;
        self
    }

    /// Reads the `config.yaml` file from the specified path or the default
    /// location, then applies environment overrides.
    pub fn read(self) -> Arc<Self> {
        let file_path = if self.path.is_file() {
            self.path.clone()
        } else {
            Path::new(DEFAULT_CONFIG_PATH).to_path_buf()
        };

        let mut config = match File::open(&file_path) {
            Ok(file) => match serde_yaml::from_reader::<_, Configuration>(file)
            {
                Ok(config) => config,
                Err(err) => self.error(err),
            },
            Err(err) => self.error(err),
        };

        config.version = VERSION.to_owned();
        config.path = file_path;
        config.apply_env(|key| std::env::var(key).ok());

        Arc::new(config)
    }

    /// Override values with environment variables.
    fn apply_env(&mut self, var: impl Fn(&str) -> Option<String>) {
        if let Some(path) = var(PRIVATE_KEY_PATH_ENV) {
            self.token.private_key_path = PathBuf::from(path);
        }
        if let Some(path) = var(PUBLIC_KEY_PATH_ENV) {
            self.token.public_key_path = PathBuf::from(path);
        }
        if let Some(ttl) = var(ACCESS_TTL_ENV).and_then(|v| v.parse().ok()) {
            self.token.access_ttl = ttl;
        }
        if let Some(ttl) = var(REFRESH_TTL_ENV).and_then(|v| v.parse().ok()) {
            self.token.refresh_ttl = ttl;
        }
        if let Some(port) = var(PORT_ENV).and_then(|v| v.parse().ok()) {
            self.port = port;
        }
    }

    /// Check values that cannot be caught while parsing.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let ttls = [
            ("token.access_ttl", self.token.access_ttl),
            ("token.refresh_ttl", self.token.refresh_ttl),
            ("registration.invitation_ttl", self.registration.invitation_ttl),
        ];

        for (field, value) in ttls {
            if value == 0 || value > MAX_TTL {
                return Err(ConfigError::Ttl { field, value });
            }
        }

        Ok(())
    }

    /// Return a default configuration as fallback.
    fn error(&self, err: impl std::error::Error) -> Self {
        tracing::error!(error = %err, path = ?self.path, "cannot read configuration file, using defaults");
        Self::default()
    }

    /// Version of the running binary.
    pub fn version(&self) -> &str {
        &self.version
    }
}
