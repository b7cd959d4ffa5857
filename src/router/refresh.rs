use axum::Json;
use axum::extract::State;
use axum::http::HeaderMap;

use crate::AppState;
use crate::cookie::{self, REFRESH_COOKIE};
use crate::error::{Result, ServerError};
use crate::fingerprint::ClientInfo;
use crate::router::{SessionResponse, TOKEN_TYPE};

/// Handler forcing a refresh token rotation.
pub async fn handler(
    State(state): State<AppState>,
    client: ClientInfo,
    headers: HeaderMap,
) -> Result<(HeaderMap, Json<SessionResponse>)> {
    let Some(refresh_token) = cookie::get(&headers, REFRESH_COOKIE) else {
        return Err(ServerError::Unauthorized);
    };

    let tokens = state.session.rotate(&refresh_token, &client).await?;

    let mut headers = HeaderMap::new();
    cookie::append_session(
        &mut headers,
        &tokens.access_token,
        state.session.access_ttl(),
        &tokens.refresh_token,
        state.session.refresh_ttl(),
    );

    Ok((
        headers,
        Json(SessionResponse {
            token_type: TOKEN_TYPE.to_owned(),
            expires_in: state.session.access_ttl(),
        }),
    ))
}

#[cfg(test)]
mod tests {
    use crate::router::login::tests::login;
    use crate::*;
    use axum::http::StatusCode;

    #[tokio::test]
    async fn test_refresh_handler() {
        let app = app(router::state());
        let cookies = login(app.clone()).await;

        let response = make_request(
            app.clone(),
            Method::POST,
            "/refresh",
            String::default(),
            Some(&cookies),
        )
        .await;
        assert_eq!(response.status(), StatusCode::OK);
        let rotated = cookies_of(&response);
        assert_ne!(rotated, cookies);

        // Replay of the consumed refresh token.
        let response = make_request(
            app.clone(),
            Method::POST,
            "/refresh",
            String::default(),
            Some(&cookies),
        )
        .await;
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);

        let response = make_request(
            app.clone(),
            Method::POST,
            "/refresh",
            String::default(),
            Some(&rotated),
        )
        .await;
        assert_eq!(response.status(), StatusCode::OK);

        let response =
            make_request(app, Method::POST, "/refresh", String::default(), None).await;
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    }
}
