//! Middlewares for routes.

use axum::extract::{Request, State};
use axum::http::HeaderMap;
use axum::http::header;
use axum::middleware::Next;
use axum::response::Response;

use crate::AppState;
use crate::cookie::{self, ACCESS_COOKIE, REFRESH_COOKIE};
use crate::error::{Result, ServerError};
use crate::fingerprint::ClientInfo;
use crate::session::SessionState;
use crate::token::Claims;

const BEARER: &str = "Bearer ";

/// Principal of an authenticated request.
#[derive(Clone, Debug)]
pub struct Authenticated {
    pub claims: Claims,
    /// Whether credentials were rotated on this request.
    pub rotated: bool,
}

/// Access token from `Authorization: Bearer`.
pub fn bearer(headers: &HeaderMap) -> Option<String> {
    headers
        .get(header::AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.strip_prefix(BEARER))
        .map(|token| token.trim().to_owned())
        .filter(|token| !token.is_empty())
}

/// Gate for protected routes.
///
/// Valid access token: request goes through untouched. Unusable access token
/// and valid refresh token: credentials are rotated and the new pair is set on
/// the response. Anything else: `401 Unauthorized`, handler never runs.
pub async fn authenticate(
    State(state): State<AppState>,
    req: Request,
    next: Next,
) -> Result<Response> {
    let (mut parts, body) = req.into_parts();

    let client = ClientInfo::from_parts(&parts, state.config.trust_forwarded_for);
    let access_token =
        cookie::get(&parts.headers, ACCESS_COOKIE).or_else(|| bearer(&parts.headers));
    let refresh_token = cookie::get(&parts.headers, REFRESH_COOKIE);

    let session = state
        .session
        .authenticate(access_token.as_deref(), refresh_token.as_deref(), &client)
        .await?;

    match session {
        SessionState::NoToken | SessionState::Invalid => Err(ServerError::Unauthorized),
        SessionState::ValidAccess(claims) => {
            parts.extensions.insert(Authenticated {
                claims,
                rotated: false,
            });

            Ok(next.run(Request::from_parts(parts, body)).await)
        },
        SessionState::ExpiredAccessValidRefresh { claims, tokens } => {
            tracing::debug!(user_id = %claims.sub, "credentials rotated by middleware");
            parts.extensions.insert(Authenticated {
                claims,
                rotated: true,
            });

            let mut response = next.run(Request::from_parts(parts, body)).await;
            cookie::append_session(
                response.headers_mut(),
                &tokens.access_token,
                state.session.access_ttl(),
                &tokens.refresh_token,
                state.session.refresh_ttl(),
            );

            Ok(response)
        },
    }
}
