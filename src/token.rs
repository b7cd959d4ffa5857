//! Manage json web tokens.
//!
//! Access tokens are ES256 signed and carry the client fingerprint in the
//! `fp` claim. They are never persisted.

use std::path::{Path, PathBuf};

use chrono::Utc;
use jsonwebtoken::errors::ErrorKind;
use jsonwebtoken::{
    Algorithm, DecodingKey, EncodingKey, Header, Validation, decode, encode,
};
use p256::pkcs8::{DecodePrivateKey, DecodePublicKey, EncodePrivateKey, LineEnding};
use p256::{PublicKey, SecretKey};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::config::Token as TokenConfig;
use crate::fingerprint::Fingerprint;

pub const DEFAULT_KID: &str = "default";
const ALGORITHM: Algorithm = Algorithm::ES256;

/// Error related to signing keys.
#[derive(Debug, thiserror::Error)]
pub enum KeyError {
    #[error("cannot read key file {path:?}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error(transparent)]
    Pkcs8(#[from] p256::pkcs8::Error),
    #[error(transparent)]
    Spki(#[from] p256::pkcs8::spki::Error),
    #[error("invalid SEC1 private key")]
    Sec1(#[from] p256::elliptic_curve::Error),
    #[error(transparent)]
    Jwt(#[from] jsonwebtoken::errors::Error),
    #[error("public key does not belong to private key")]
    Mismatch,
}

/// Reasons an access token is refused.
#[derive(Debug, thiserror::Error)]
pub enum TokenError {
    #[error("unexpected signing algorithm")]
    Algorithm,
    #[error("signature does not verify")]
    Signature,
    #[error("token expired")]
    Expired,
    #[error("missing `{0}` claim")]
    MissingClaim(String),
    #[error("unexpected issuer")]
    Issuer,
    #[error("unexpected audience")]
    Audience,
    #[error("fingerprint does not match client")]
    Fingerprint,
    #[error("malformed token")]
    Malformed,
    #[error("cannot sign token: {0}")]
    Signing(String),
    #[error("token lifetime out of range")]
    Lifetime,
}

impl TokenError {
    /// Failures on our side rather than the client's.
    pub fn is_internal(&self) -> bool {
        matches!(self, TokenError::Signing(_) | TokenError::Lifetime)
    }
}

impl From<jsonwebtoken::errors::Error> for TokenError {
    fn from(err: jsonwebtoken::errors::Error) -> Self {
        match err.kind() {
            ErrorKind::InvalidAlgorithm | ErrorKind::InvalidAlgorithmName => {
                TokenError::Algorithm
            },
            ErrorKind::InvalidSignature => TokenError::Signature,
            ErrorKind::ExpiredSignature => TokenError::Expired,
            ErrorKind::InvalidIssuer => TokenError::Issuer,
            ErrorKind::InvalidAudience => TokenError::Audience,
            ErrorKind::MissingRequiredClaim(claim) => {
                TokenError::MissingClaim(claim.clone())
            },
            _ => TokenError::Malformed,
        }
    }
}

/// Pieces of information asserted on a JWT.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Claims {
    /// User ID.
    pub sub: Uuid,
    /// Client fingerprint.
    pub fp: String,
    /// Identifies the organization that issued the JWT.
    pub iss: String,
    /// Recipients that the JWT is intended for.
    pub aud: String,
    /// Identifies the time at which the JWT was issued.
    pub iat: i64,
    /// Identifies the expiration time on or after which the JWT must not be
    /// accepted for processing.
    pub exp: i64,
}

/// Values stamped on every access token.
#[derive(Clone, Debug)]
pub struct TokenSettings {
    pub issuer: String,
    pub audience: String,
    pub key_id: String,
    /// Lifetime in seconds.
    pub access_ttl: u64,
}

impl From<&TokenConfig> for TokenSettings {
    fn from(config: &TokenConfig) -> Self {
        Self {
            issuer: config.issuer.clone(),
            audience: config.audience.clone(),
            key_id: config
                .key_id
                .clone()
                .unwrap_or_else(|| DEFAULT_KID.to_owned()),
            access_ttl: config.access_ttl,
        }
    }
}

/// Manage JWT tokens.
#[derive(Clone)]
pub struct TokenManager {
    settings: TokenSettings,
    encoding_key: EncodingKey,
    decoding_key: DecodingKey,
    public_key: PublicKey,
    validation: Validation,
}

impl std::fmt::Debug for TokenManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TokenManager")
            .field("settings", &self.settings)
            .finish_non_exhaustive()
    }
}

fn read_pem(path: &Path) -> Result<String, KeyError> {
    std::fs::read_to_string(path).map_err(|source| KeyError::Io {
        path: path.to_path_buf(),
        source,
    })
}

impl TokenManager {
    /// Create a new [`TokenManager`] instance.
    ///
    /// The private key may be PKCS#8 or SEC1, the public key must be SPKI and
    /// derive from the private key.
    pub fn new(
        settings: TokenSettings,
        private_key_pem: &str,
        public_key_pem: &str,
    ) -> Result<Self, KeyError> {
        let secret = if private_key_pem.contains("BEGIN EC PRIVATE KEY") {
            SecretKey::from_sec1_pem(private_key_pem)?
        } else {
            SecretKey::from_pkcs8_pem(private_key_pem)?
        };

        let public_key = PublicKey::from_public_key_pem(public_key_pem)?;
        if public_key != secret.public_key() {
            return Err(KeyError::Mismatch);
        }

        // Signing backend only understands PKCS#8.
        let pkcs8 = secret.to_pkcs8_pem(LineEnding::LF)?;
        let encoding_key = EncodingKey::from_ec_pem(pkcs8.as_bytes())?;
        let decoding_key = DecodingKey::from_ec_pem(public_key_pem.as_bytes())?;

        let mut validation = Validation::new(ALGORITHM);
        validation.leeway = 0;
        validation.set_audience(&[&settings.audience]);
        validation.set_issuer(&[&settings.issuer]);
        validation.set_required_spec_claims(&["exp", "iss", "aud", "sub"]);

        Ok(Self {
            settings,
            encoding_key,
            decoding_key,
            public_key,
            validation,
        })
    }

    /// Load keys from the paths set in configuration.
    pub fn from_config(config: &TokenConfig) -> Result<Self, KeyError> {
        let private_key_pem = read_pem(&config.private_key_path)?;
        let public_key_pem = read_pem(&config.public_key_path)?;

        Self::new(config.into(), &private_key_pem, &public_key_pem)
    }

    pub fn key_id(&self) -> &str {
        &self.settings.key_id
    }

    /// Access token lifetime, in seconds.
    pub fn access_ttl(&self) -> u64 {
        self.settings.access_ttl
    }

    /// Verification key.
    pub fn public_key(&self) -> &PublicKey {
        &self.public_key
    }

    /// Create a new access token bound to `fingerprint`.
    pub fn issue_access_token(
        &self,
        user_id: Uuid,
        fingerprint: &Fingerprint,
    ) -> Result<String, TokenError> {
        self.issue_access_token_at(user_id, fingerprint, Utc::now().timestamp())
    }

    pub(crate) fn issue_access_token_at(
        &self,
        user_id: Uuid,
        fingerprint: &Fingerprint,
        now: i64,
    ) -> Result<String, TokenError> {
        let exp = i64::try_from(self.settings.access_ttl)
            .ok()
            .and_then(|ttl| now.checked_add(ttl))
            .ok_or(TokenError::Lifetime)?;

        let mut header = Header::new(ALGORITHM);
        header.kid = Some(self.settings.key_id.clone());

        let claims = Claims {
            sub: user_id,
            fp: fingerprint.as_str().to_owned(),
            iss: self.settings.issuer.clone(),
            aud: self.settings.audience.clone(),
            iat: now,
            exp,
        };

        encode(&header, &claims, &self.encoding_key)
            .map_err(|err| TokenError::Signing(err.to_string()))
    }

    /// Decode and check a token against the fingerprint of the current client.
    pub fn validate_access_token(
        &self,
        token: &str,
        fingerprint: &Fingerprint,
    ) -> Result<Claims, TokenError> {
        let claims = decode::<Claims>(token, &self.decoding_key, &self.validation)
            .map_err(TokenError::from)?
            .claims;

        if !fingerprint.matches(&claims.fp) {
            return Err(TokenError::Fingerprint);
        }

        Ok(claims)
    }
}
