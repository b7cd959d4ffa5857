use axum::extract::State;
use axum::http::{HeaderMap, StatusCode};

use crate::AppState;
use crate::cookie::{self, REFRESH_COOKIE};
use crate::error::Result;

/// Handler closing the current session.
///
/// Cookies are always cleared, even without a known refresh token.
pub async fn handler(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Result<(StatusCode, HeaderMap)> {
    let refresh_token = cookie::get(&headers, REFRESH_COOKIE);
    state.session.logout(refresh_token.as_deref()).await?;

    let mut headers = HeaderMap::new();
    cookie::append_cleared(&mut headers);

    Ok((StatusCode::NO_CONTENT, headers))
}
