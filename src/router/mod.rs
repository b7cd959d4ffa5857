pub mod activate;
pub mod login;
pub mod logout;
pub mod refresh;
pub mod register;
pub mod status;
pub mod users;

use axum::Json;
use axum::extract::rejection::JsonRejection;
use axum::extract::{FromRequest, Request};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use validator::Validate;

use crate::ServerError;

pub const TOKEN_TYPE: &str = "Bearer";

/// Body of successful login and refresh.
///
/// Tokens themselves travel in cookies only.
#[derive(Debug, PartialEq, Serialize, Deserialize)]
pub struct SessionResponse {
    pub token_type: String,
    /// Access token lifetime, in seconds.
    pub expires_in: u64,
}

/// JSON body validated with [`validator`].
#[derive(Debug, Clone, Copy, Default)]
pub struct Valid<T>(pub T);

impl<T, S> FromRequest<S> for Valid<T>
where
    T: DeserializeOwned + Validate,
    S: Send + Sync,
    Json<T>: FromRequest<S, Rejection = JsonRejection>,
{
    type Rejection = ServerError;

    async fn from_request(
        req: Request,
        state: &S,
    ) -> Result<Self, Self::Rejection> {
        let Json(value) = Json::<T>::from_request(req, state).await?;
        value.validate()?;
        Ok(Valid(value))
    }
}

#[cfg(test)]
pub fn state() -> crate::AppState {
    use std::sync::Arc;

    use crate::config::Configuration;
    use crate::crypto::{Crypto, light_config};
    use crate::database::Database;
    use crate::session::SessionManager;

    let mut config = Configuration::default();
    config.registration.expose_activation_token = true;
    config.argon2 = Some(light_config());

    let db = Database::memory();
    let token = Arc::new(crate::token::tests::manager(config.token.access_ttl));
    let session = SessionManager::new(
        Arc::clone(&token),
        db.clone(),
        config.token.refresh_ttl,
    );

    crate::AppState {
        crypto: Arc::new(Crypto::new(config.argon2.clone()).unwrap()),
        config: Arc::new(config),
        db,
        token,
        session,
    }
}
