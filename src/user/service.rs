//! Account registration and activation.

use uuid::Uuid;

use crate::crypto::{Crypto, digest};
use crate::database::Database;
use crate::error::{Result, ServerError};
use crate::session::expires_in;
use crate::user::{Invitation, Location, NewUser, User};

/// Registration form, already validated.
#[derive(Clone, Debug)]
pub struct Account {
    pub email: String,
    pub password: String,
    pub first_name: String,
    pub last_name: String,
    pub location: Option<Location>,
}

pub struct UserService<'a> {
    db: &'a Database,
    crypto: &'a Crypto,
}

impl<'a> UserService<'a> {
    /// Create a new [`UserService`].
    pub fn new(db: &'a Database, crypto: &'a Crypto) -> Self {
        Self { db, crypto }
    }

    /// Create an inactive user and its invitation.
    ///
    /// Returns the user and the plain activation token.
    pub async fn register(
        &self,
        account: Account,
        invitation_ttl: u64,
    ) -> Result<(User, String)> {
        let password = self.crypto.pwd.hash_password(&account.password)?;

        let activation_token = Uuid::new_v4().to_string();
        let invitation = Invitation {
            token_hash: digest(&activation_token),
            expires_at: expires_in(invitation_ttl)?,
        };

        let user = NewUser {
            id: Uuid::new_v4(),
            email: normalize_email(&account.email),
            password,
            first_name: account.first_name,
            last_name: account.last_name,
            location: account.location.map(Location::normalize),
        };

        let user = self.db.users.create_and_invite(user, invitation).await?;
        tracing::info!(user_id = %user.id, "user registered");

        Ok((user, activation_token))
    }

    /// Activate the user owning `token`.
    pub async fn activate(&self, token: &str) -> Result<()> {
        if self.db.users.activate(&digest(token)).await? {
            Ok(())
        } else {
            Err(ServerError::InvalidInvitation)
        }
    }
}

/// Emails are compared case-insensitively.
pub fn normalize_email(email: &str) -> String {
    email.trim().to_lowercase()
}
