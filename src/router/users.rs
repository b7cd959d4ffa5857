//! Routes behind the session gate.

use axum::extract::State;
use axum::routing::get;
use axum::{Extension, Json, Router, middleware};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{Result, ServerError};
use crate::middleware::Authenticated;
use crate::user::User;
use crate::{AppState, crypto};

#[derive(Debug, Serialize, Deserialize)]
pub struct Session {
    pub fingerprint: String,
    pub expires_at: DateTime<Utc>,
    /// Session of the requesting client.
    pub current: bool,
}

/// Handler returning the authenticated user.
pub async fn me(
    State(state): State<AppState>,
    Extension(auth): Extension<Authenticated>,
) -> Result<Json<User>> {
    // Token outlived its user.
    let user = state
        .db
        .users
        .find_by_id(auth.claims.sub)
        .await?
        .ok_or(ServerError::Unauthorized)?;

    Ok(Json(user))
}

/// Handler listing open sessions of the authenticated user.
pub async fn sessions(
    State(state): State<AppState>,
    Extension(auth): Extension<Authenticated>,
) -> Result<Json<Vec<Session>>> {
    let sessions = state
        .session
        .sessions(auth.claims.sub)
        .await?
        .into_iter()
        .map(|record| Session {
            current: crypto::constant_time_eq(&record.fingerprint, &auth.claims.fp),
            fingerprint: record.fingerprint,
            expires_at: record.expires_at,
        })
        .collect();

    Ok(Json(sessions))
}

pub fn router(state: AppState) -> Router<AppState> {
    Router::new()
        // `GET /users/@me` goes to `me`. Authorization required.
        .route("/@me", get(me))
        // `GET /users/@me/sessions` goes to `sessions`. Authorization required.
        .route("/@me/sessions", get(sessions))
        .route_layer(middleware::from_fn_with_state(
            state,
            crate::middleware::authenticate,
        ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fingerprint::Fingerprint;
    use crate::router::login::tests::{EMAIL, PASSWORD, login};
    use crate::*;
    use axum::http::StatusCode;
    use http_body_util::BodyExt;
    use tower::util::ServiceExt;

    fn refresh_cookie(cookies: &str) -> String {
        cookies
            .split("; ")
            .find(|c| c.starts_with("refresh_token="))
            .unwrap()
            .to_owned()
    }

    fn expired_access(state: &AppState, user_id: uuid::Uuid) -> String {
        let fingerprint = Fingerprint::generate(TEST_IP, TEST_USER_AGENT);
        let token = state
            .token
            .issue_access_token_at(user_id, &fingerprint, Utc::now().timestamp() - 7200)
            .unwrap();

        format!("auth_token={token}")
    }

    async fn user_id(state: &AppState) -> uuid::Uuid {
        state
            .db
            .users
            .find_by_email(EMAIL)
            .await
            .unwrap()
            .unwrap()
            .id
    }

    #[tokio::test]
    async fn test_me_handler() {
        let app = app(router::state());
        let cookies = login(app.clone()).await;

        let response =
            make_request(app.clone(), Method::GET, "/users/@me", String::default(), Some(&cookies))
                .await;
        assert_eq!(response.status(), StatusCode::OK);
        // Valid access token, nothing rotated.
        assert!(response.headers().get(header::SET_COOKIE).is_none());

        let body = response.into_body().collect().await.unwrap().to_bytes();
        let body: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(body["email"], EMAIL);
        assert_eq!(body["is_active"], true);
        assert!(body.get("password").is_none());

        let response =
            make_request(app, Method::GET, "/users/@me", String::default(), None).await;
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn test_bearer_fallback() {
        let app = app(router::state());
        let cookies = login(app.clone()).await;
        let access = cookies
            .split("; ")
            .find_map(|c| c.strip_prefix("auth_token="))
            .unwrap()
            .to_owned();

        let request = axum::extract::Request::builder()
            .uri("/users/@me")
            .header("x-forwarded-for", TEST_IP)
            .header(header::USER_AGENT, TEST_USER_AGENT)
            .header(header::AUTHORIZATION, format!("Bearer {access}"))
            .body(axum::body::Body::empty())
            .unwrap();
        let response = app.oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn test_full_session_lifecycle() {
        let state = router::state();
        let app = app(state.clone());
        let cookies = login(app.clone()).await;
        let user_id = user_id(&state).await;

        // Access token expired, refresh token still valid.
        let stale = format!(
            "{}; {}",
            expired_access(&state, user_id),
            refresh_cookie(&cookies)
        );
        let response =
            make_request(app.clone(), Method::GET, "/users/@me", String::default(), Some(&stale))
                .await;
        assert_eq!(response.status(), StatusCode::OK);

        let rotated = cookies_of(&response);
        assert!(rotated.contains("auth_token="));
        assert!(rotated.contains("refresh_token="));
        assert_ne!(refresh_cookie(&rotated), refresh_cookie(&cookies));

        // Rotated pair works.
        let response =
            make_request(app.clone(), Method::GET, "/users/@me", String::default(), Some(&rotated))
                .await;
        assert_eq!(response.status(), StatusCode::OK);

        // Replaying the consumed refresh token is refused.
        let response =
            make_request(app, Method::GET, "/users/@me", String::default(), Some(&stale)).await;
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
        assert!(response.headers().get(header::SET_COOKIE).is_none());
    }

    #[tokio::test]
    async fn test_expired_access_without_refresh() {
        let state = router::state();
        let app = app(state.clone());
        login(app.clone()).await;
        let user_id = user_id(&state).await;

        let response = make_request(
            app,
            Method::GET,
            "/users/@me",
            String::default(),
            Some(&expired_access(&state, user_id)),
        )
        .await;
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn test_new_network_rotates() {
        let app = app(router::state());
        let cookies = login(app.clone()).await;

        let request = axum::extract::Request::builder()
            .uri("/users/@me")
            .header("x-forwarded-for", "198.51.100.7")
            .header(header::USER_AGENT, TEST_USER_AGENT)
            .header(header::COOKIE, &cookies)
            .body(axum::body::Body::empty())
            .unwrap();
        let response = app.oneshot(request).await.unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(response.headers().get_all(header::SET_COOKIE).iter().count(), 2);
    }

    #[tokio::test]
    async fn test_sessions_handler() {
        let app = app(router::state());
        let cookies = login(app.clone()).await;

        // Second device.
        let request = axum::extract::Request::builder()
            .method(Method::POST)
            .uri("/login")
            .header(header::CONTENT_TYPE, "application/json")
            .header("x-forwarded-for", TEST_IP)
            .header(header::USER_AGENT, "Mobile Safari")
            .body(axum::body::Body::from(
                serde_json::json!({ "email": EMAIL, "password": PASSWORD }).to_string(),
            ))
            .unwrap();
        let response = app.clone().oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let response = make_request(
            app,
            Method::GET,
            "/users/@me/sessions",
            String::default(),
            Some(&cookies),
        )
        .await;
        assert_eq!(response.status(), StatusCode::OK);

        let body = response.into_body().collect().await.unwrap().to_bytes();
        let sessions: Vec<Session> = serde_json::from_slice(&body).unwrap();
        assert_eq!(sessions.len(), 2);
        assert_eq!(sessions.iter().filter(|s| s.current).count(), 1);
        assert_eq!(
            sessions.iter().find(|s| s.current).unwrap().fingerprint,
            Fingerprint::generate(TEST_IP, TEST_USER_AGENT).as_str()
        );
    }
}
