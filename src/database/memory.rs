//! Non-persistent credential store.

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use uuid::Uuid;

use super::{RefreshToken, TokenRepository, UserRepository};
use crate::error::{Result, ServerError};
use crate::user::{Invitation, Location, NewUser, User};

#[derive(Default)]
struct State {
    users: HashMap<Uuid, User>,
    locations: Vec<Location>,
    /// Invitation hash to (user, expiry).
    invitations: HashMap<String, (Uuid, DateTime<Utc>)>,
    tokens: Vec<RefreshToken>,
}

/// Every operation runs under a single lock, which gives the same atomicity
/// as the PostgreSQL transactions.
#[derive(Default)]
pub struct MemoryStore {
    state: Mutex<State>,
}

impl State {
    fn upsert(&mut self, token: &RefreshToken) {
        match self.tokens.iter_mut().find(|t| {
            t.user_id == token.user_id && t.fingerprint == token.fingerprint
        }) {
            Some(existing) => *existing = token.clone(),
            None => self.tokens.push(token.clone()),
        }
    }
}

#[async_trait]
impl UserRepository for MemoryStore {
    async fn create_and_invite(
        &self,
        user: NewUser,
        invitation: Invitation,
    ) -> Result<User> {
        let mut state = self.state.lock();

        if state.users.values().any(|u| u.email == user.email) {
            return Err(ServerError::DuplicateEmail);
        }

        let location_id = user.location.map(|location| {
            match state.locations.iter().find(|l| l.same_place(&location)) {
                Some(existing) => existing.id,
                None => {
                    let id = location.id;
                    state.locations.push(location);
                    id
                },
            }
        });

        let created = User {
            id: user.id,
            email: user.email,
            password: user.password,
            first_name: user.first_name,
            last_name: user.last_name,
            is_active: false,
            version: 0,
            location_id,
            created_at: Utc::now(),
        };

        state.users.insert(created.id, created.clone());
        state
            .invitations
            .insert(invitation.token_hash, (created.id, invitation.expires_at));

        Ok(created)
    }

    async fn find_by_email(&self, email: &str) -> Result<Option<User>> {
        let state = self.state.lock();
        Ok(state.users.values().find(|u| u.email == email).cloned())
    }

    async fn find_by_id(&self, id: Uuid) -> Result<Option<User>> {
        Ok(self.state.lock().users.get(&id).cloned())
    }

    async fn activate(&self, token_hash: &str) -> Result<bool> {
        let mut state = self.state.lock();

        let user_id = match state.invitations.get(token_hash) {
            Some((user_id, expires_at)) if *expires_at > Utc::now() => *user_id,
            _ => return Ok(false),
        };

        state.invitations.retain(|_, (id, _)| *id != user_id);
        if let Some(user) = state.users.get_mut(&user_id) {
            user.is_active = true;
            user.version += 1;
        }

        Ok(true)
    }
}

#[async_trait]
impl TokenRepository for MemoryStore {
    async fn upsert(&self, token: &RefreshToken) -> Result<()> {
        self.state.lock().upsert(token);
        Ok(())
    }

    async fn find_by_hash(&self, token_hash: &str) -> Result<Option<RefreshToken>> {
        let state = self.state.lock();
        Ok(state
            .tokens
            .iter()
            .find(|t| t.token_hash == token_hash)
            .cloned())
    }

    async fn list(&self, user_id: Uuid) -> Result<Vec<RefreshToken>> {
        let now = Utc::now();
        let state = self.state.lock();

        let mut tokens: Vec<RefreshToken> = state
            .tokens
            .iter()
            .filter(|t| t.user_id == user_id && !t.is_expired(now))
            .cloned()
            .collect();
        tokens.sort_by(|a, b| b.expires_at.cmp(&a.expires_at));

        Ok(tokens)
    }

    async fn rotate(&self, old_hash: &str, token: &RefreshToken) -> Result<bool> {
        let now = Utc::now();
        let mut state = self.state.lock();

        let Some(position) = state
            .tokens
            .iter()
            .position(|t| t.token_hash == old_hash && !t.is_expired(now))
        else {
            return Ok(false);
        };

        state.tokens.swap_remove(position);
        state.upsert(token);

        Ok(true)
    }

    async fn revoke(&self, token_hash: &str) -> Result<bool> {
        let mut state = self.state.lock();
        let before = state.tokens.len();
        state.tokens.retain(|t| t.token_hash != token_hash);

        Ok(state.tokens.len() != before)
    }

    async fn purge_expired(&self) -> Result<u64> {
        let now = Utc::now();
        let mut state = self.state.lock();
        let before = state.tokens.len();
        state.tokens.retain(|t| !t.is_expired(now));

        Ok((before - state.tokens.len()) as u64)
    }
}
