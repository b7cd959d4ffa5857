//! Cryptographic logics.

use argon2::password_hash::{
    PasswordHash, PasswordHasher, PasswordVerifier, SaltString,
};
use argon2::{Argon2, Params, Version};
use base64ct::{Base64UrlUnpadded, Encoding};
use rand::RngCore;
use rand::rngs::OsRng;
use sha2::{Digest, Sha256};
use subtle::ConstantTimeEq;

use crate::config::Argon2 as ArgonConfig;
use crate::error::ServerError;

/// Refresh tokens carry 256 bits of entropy.
pub const TOKEN_BYTES: usize = 32;
/// Length of a base64url (unpadded) encoded refresh token.
pub const TOKEN_LENGTH: usize = 43;

const DUMMY_PASSWORD: &[u8] = b"dummy password used for timing equalization";

type Result<T> = std::result::Result<T, CryptoError>;

#[derive(thiserror::Error, Debug)]
pub enum CryptoError {
    #[error("argon2 error: {0}")]
    Argon2(String),
    #[error("random generator failed: {0}")]
    Random(#[from] rand::Error),
}

/// Cryptographic manager.
pub struct Crypto {
    pub pwd: PasswordManager,
}

impl Crypto {
    /// Create a new [`Crypto`].
    pub fn new(config: Option<ArgonConfig>) -> Result<Self> {
        Ok(Self {
            pwd: PasswordManager::new(config)?,
        })
    }
}

/// Password manager that uses Argon2id and PHC string format for hashing and
/// verification.
pub struct PasswordManager {
    params: Params,
    dummy_hash: String,
}

impl PasswordManager {
    /// Create a new [`PasswordManager`].
    pub fn new(config: Option<ArgonConfig>) -> Result<Self> {
        let config = config.unwrap_or_default();

        let params = Params::new(
            config.memory_cost,
            config.iterations,
            config.parallelism,
            Some(config.hash_length),
        )
        .map_err(|err| CryptoError::Argon2(err.to_string()))?;

        let mut manager = Self {
            params,
            dummy_hash: String::default(),
        };
        manager.dummy_hash = manager.hash_password(DUMMY_PASSWORD)?;

        Ok(manager)
    }

    fn argon2(&self) -> Argon2<'_> {
        Argon2::new(
            argon2::Algorithm::Argon2id,
            Version::V0x13,
            self.params.clone(),
        )
    }

    /// Hash password using Argon2id.
    pub fn hash_password(&self, password: impl AsRef<[u8]>) -> Result<String> {
        let salt = SaltString::generate(&mut OsRng);
        let hash = self
            .argon2()
            .hash_password(password.as_ref(), &salt)
            .map_err(|e| CryptoError::Argon2(e.to_string()))?;

        Ok(hash.to_string())
    }

    /// Verify password against a PHC.
    ///
    /// A malformed PHC string is reported exactly like a wrong password.
    pub fn verify_password(
        &self,
        password: impl AsRef<[u8]>,
        phc_hash: &str,
    ) -> std::result::Result<(), ServerError> {
        let parsed =
            PasswordHash::new(phc_hash).map_err(|_| ServerError::Unauthorized)?;

        self.argon2()
            .verify_password(password.as_ref(), &parsed)
            .map_err(|_| ServerError::Unauthorized)
    }

    /// Burn the same amount of work as a real verification.
    /// Used when no account matches, so both cases take as long.
    pub fn dummy_verify(&self, password: impl AsRef<[u8]>) {
        let _ = self.verify_password(password, &self.dummy_hash);
    }
}

/// Digest data into hex encoded SHA256.
pub fn digest(data: impl AsRef<[u8]>) -> String {
    let mut hasher = Sha256::new();
    hasher.update(data.as_ref());
    hex::encode(hasher.finalize())
}

/// Generate an opaque, URL-safe random token.
pub fn random_token() -> Result<String> {
    let mut bytes = [0u8; TOKEN_BYTES];
    OsRng.try_fill_bytes(&mut bytes)?;

    Ok(Base64UrlUnpadded::encode_string(&bytes))
}

/// Compare two strings without leaking where they differ.
pub fn constant_time_eq(a: &str, b: &str) -> bool {
    a.as_bytes().ct_eq(b.as_bytes()).into()
}

#[cfg(test)]
pub(crate) fn light_config() -> ArgonConfig {
    ArgonConfig {
        memory_cost: 1024,
        iterations: 1,
        parallelism: 1,
        hash_length: 32,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_password_round_trip() {
        let manager = PasswordManager::new(Some(light_config())).unwrap();

        let hash = manager.hash_password("Secret123!").unwrap();
        assert!(hash.starts_with("$argon2id$"));
        assert!(manager.verify_password("Secret123!", &hash).is_ok());
        assert!(matches!(
            manager.verify_password("Secret124!", &hash),
            Err(ServerError::Unauthorized)
        ));
    }

    #[test]
    fn test_salted_hashes() {
        let manager = PasswordManager::new(Some(light_config())).unwrap();

        let first = manager.hash_password("Secret123!").unwrap();
        let second = manager.hash_password("Secret123!").unwrap();
        assert_ne!(first, second);
    }

    #[test]
    fn test_malformed_phc() {
        let manager = PasswordManager::new(Some(light_config())).unwrap();

        assert!(matches!(
            manager.verify_password("Secret123!", "not a phc string"),
            Err(ServerError::Unauthorized)
        ));
        manager.dummy_verify("Secret123!");
    }

    #[test]
    fn test_sha2() {
        let excepted =
            "2cf24dba5fb0a30e26e83b2ac5b9e29e1b161e5c1fa7425e73043362938b9824";

        assert_eq!(digest("hello"), excepted);
        assert_eq!(digest(b"hello"), excepted);
    }

    #[test]
    fn test_random_token() {
        let first = random_token().unwrap();
        let second = random_token().unwrap();

        assert_eq!(first.len(), TOKEN_LENGTH);
        assert!(
            first
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
        );
        assert_ne!(first, second);
    }

    #[test]
    fn test_constant_time_eq() {
        assert!(constant_time_eq("abc", "abc"));
        assert!(!constant_time_eq("abc", "abd"));
        assert!(!constant_time_eq("abc", "abcd"));
    }
}
