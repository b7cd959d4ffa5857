use axum::Json;
use axum::extract::State;
use axum::http::HeaderMap;
use serde::{Deserialize, Serialize};
use validator::Validate;

use crate::AppState;
use crate::cookie;
use crate::error::Result;
use crate::fingerprint::ClientInfo;
use crate::router::{SessionResponse, TOKEN_TYPE, Valid};

#[derive(Debug, Serialize, Deserialize, Validate)]
pub struct Body {
    #[validate(email(message = "Email must be formatted."))]
    pub email: String,
    #[validate(length(
        min = 8,
        max = 72,
        message = "Password must contain between 8 and 72 characters."
    ))]
    pub password: String,
}

/// Handler opening a session.
pub async fn handler(
    State(state): State<AppState>,
    client: ClientInfo,
    Valid(body): Valid<Body>,
) -> Result<(HeaderMap, Json<SessionResponse>)> {
    let tokens = state
        .session
        .login(&state.crypto, &body.email, &body.password, &client)
        .await?;

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
pub(crate) mod tests {
    use super::*;
    use crate::router::register::tests::register;
    use crate::*;
    use axum::http::StatusCode;
    use http_body_util::BodyExt;
    use serde_json::json;

    pub const EMAIL: &str = "a@example.com";
    pub const PASSWORD: &str = "Secret123!";

    /// Register, activate and log in. Returns the session cookies.
    pub async fn login(app: Router) -> String {
        let token = register(app.clone(), EMAIL, PASSWORD).await;
        let response = make_request(
            app.clone(),
            Method::PUT,
            &format!("/activate/{token}"),
            String::default(),
            None,
        )
        .await;
        assert_eq!(response.status(), StatusCode::NO_CONTENT);

        let response = make_request(
            app,
            Method::POST,
            "/login",
            json!({ "email": EMAIL, "password": PASSWORD }).to_string(),
            None,
        )
        .await;
        assert_eq!(response.status(), StatusCode::OK);

        cookies_of(&response)
    }

    #[tokio::test]
    async fn test_login_handler() {
        let state = router::state();
        let app = app(state.clone());
        register(app.clone(), EMAIL, PASSWORD).await;

        let response = make_request(
            app,
            Method::POST,
            "/login",
            json!({ "email": EMAIL, "password": PASSWORD }).to_string(),
            None,
        )
        .await;
        assert_eq!(response.status(), StatusCode::OK);

        let cookies: Vec<String> = response
            .headers()
            .get_all(header::SET_COOKIE)
            .iter()
            .map(|v| v.to_str().unwrap().to_owned())
            .collect();
        assert_eq!(cookies.len(), 2);
        assert!(cookies[0].starts_with("auth_token="));
        assert!(cookies[1].starts_with("refresh_token="));
        for cookie in &cookies {
            assert!(cookie.contains("HttpOnly"));
            assert!(cookie.contains("Secure"));
            assert!(cookie.contains("SameSite=Strict"));
        }

        let body = response.into_body().collect().await.unwrap().to_bytes();
        let body: SessionResponse = serde_json::from_slice(&body).unwrap();
        assert_eq!(body.token_type, TOKEN_TYPE);
        assert_eq!(body.expires_in, state.config.token.access_ttl);
    }

    #[tokio::test]
    async fn test_login_refused() {
        let app = app(router::state());
        register(app.clone(), EMAIL, PASSWORD).await;

        for body in [
            json!({ "email": EMAIL, "password": "Secret124!" }),
            json!({ "email": "nobody@example.com", "password": PASSWORD }),
        ] {
            let response = make_request(
                app.clone(),
                Method::POST,
                "/login",
                body.to_string(),
                None,
            )
            .await;
            assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
            assert!(response.headers().get(header::SET_COOKIE).is_none());
        }

        let response = make_request(
            app,
            Method::POST,
            "/login",
            json!({ "email": EMAIL, "password": "short" }).to_string(),
            None,
        )
        .await;
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }
}
