use axum::extract::{Path, State};
use axum::http::StatusCode;

use crate::AppState;
use crate::error::Result;
use crate::user::UserService;

/// Handler consuming an activation token.
pub async fn handler(
    State(state): State<AppState>,
    Path(token): Path<String>,
) -> Result<StatusCode> {
    UserService::new(&state.db, &state.crypto)
        .activate(&token)
        .await?;

    Ok(StatusCode::NO_CONTENT)
}

#[cfg(test)]
mod tests {
    use crate::router::register::tests::register;
    use crate::*;
    use axum::http::StatusCode;

    #[tokio::test]
    async fn test_activate_handler() {
        let state = router::state();
        let app = app(state.clone());

        let token = register(app.clone(), "a@example.com", "Secret123!").await;
        let path = format!("/activate/{token}");

        let response =
            make_request(app.clone(), Method::PUT, &path, String::default(), None).await;
        assert_eq!(response.status(), StatusCode::NO_CONTENT);

        let user = state
            .db
            .users
            .find_by_email("a@example.com")
            .await
            .unwrap()
            .unwrap();
        assert!(user.is_active);

        // Invitations are single use.
        let response =
            make_request(app.clone(), Method::PUT, &path, String::default(), None).await;
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);

        let response = make_request(
            app,
            Method::PUT,
            "/activate/unknown",
            String::default(),
            None,
        )
        .await;
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }
}
