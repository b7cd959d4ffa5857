//! sessiond issues fingerprint-bound access tokens and rotating refresh
//! tokens, and guards routes with them.

#![forbid(unsafe_code)]
pub mod config;
pub mod cookie;
pub mod crypto;
pub mod database;
pub mod error;
pub mod fingerprint;
pub mod middleware;
mod router;
pub mod session;
pub mod telemetry;
pub mod token;
pub mod user;
mod well_known;

use std::sync::Arc;
use std::time::Duration;

use axum::body::Bytes;
use axum::http::{Method, StatusCode, header};
use axum::routing::{get, post, put};
use axum::{Router, middleware as AxumMiddleware};
pub use error::ServerError;
use tower::ServiceBuilder;
use tower_http::LatencyUnit;
use tower_http::cors::{Any, CorsLayer};
use tower_http::sensitive_headers::SetSensitiveHeadersLayer;
use tower_http::timeout::TimeoutLayer;
use tower_http::trace::{
    DefaultMakeSpan, DefaultOnRequest, DefaultOnResponse, TraceLayer,
};

/// Client address used by test requests.
#[cfg(test)]
pub const TEST_IP: &str = "203.0.113.9";
#[cfg(test)]
pub const TEST_USER_AGENT: &str = "sessiond-test";

/// MUST NEVER be used in production.
#[cfg(test)]
pub async fn make_request(
    app: Router,
    method: Method,
    path: &str,
    body: String,
    cookie: Option<&str>,
) -> axum::http::Response<axum::body::Body> {
    use axum::extract::Request;
    use tower::util::ServiceExt;

    let mut request = Request::builder()
        .method(method)
        .uri(path)
        .header(header::CONTENT_TYPE, "application/json")
        .header("x-forwarded-for", TEST_IP)
        .header(header::USER_AGENT, TEST_USER_AGENT);
    if let Some(cookie) = cookie {
        request = request.header(header::COOKIE, cookie);
    }

    app.oneshot(request.body(axum::body::Body::from(body)).unwrap())
        .await
        .unwrap()
}

/// Collect `Set-Cookie` headers into a `Cookie` header value.
#[cfg(test)]
pub fn cookies_of(response: &axum::http::Response<axum::body::Body>) -> String {
    response
        .headers()
        .get_all(header::SET_COOKIE)
        .iter()
        .filter_map(|value| value.to_str().ok())
        .filter_map(|value| value.split(';').next())
        .collect::<Vec<_>>()
        .join("; ")
}

/// State sharing between routes.
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<config::Configuration>,
    pub db: database::Database,
    pub crypto: Arc<crypto::Crypto>,
    pub token: Arc<token::TokenManager>,
    pub session: session::SessionManager,
}

/// Create router.
pub fn app(state: AppState) -> Router {
    let middleware = ServiceBuilder::new()
        // Add high level tracing/logging to all requests.
        .layer(
            TraceLayer::new_for_http()
                .on_body_chunk(|chunk: &Bytes, latency: Duration, _span: &tracing::Span| {
                    tracing::trace!(size_bytes = chunk.len(), latency = ?latency, "sending body chunk")
                })
                .make_span_with(DefaultMakeSpan::new().include_headers(true).level(tracing::Level::INFO))
                .on_request(DefaultOnRequest::new())
                .on_response(DefaultOnResponse::new().include_headers(true).latency_unit(LatencyUnit::Micros)),
        )
        // Set a timeout.
        .layer(TimeoutLayer::with_status_code(StatusCode::REQUEST_TIMEOUT, Duration::from_secs(10)))
        // Remove sensitive headers from trace.
        .layer(SetSensitiveHeadersLayer::new([
            header::AUTHORIZATION,
            header::COOKIE,
            header::SET_COOKIE,
        ]))
        // Add CORS preflight support.
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods([Method::GET, Method::POST, Method::PUT, Method::OPTIONS])
                .allow_headers(Any)
                .vary([header::AUTHORIZATION]),
        );

    Router::new()
        // `GET /status.json` goes to `status`.
        .route("/status.json", get(router::status::handler))
        // `POST /register` goes to `register`.
        .route("/register", post(router::register::handler))
        // `PUT /activate/{token}` goes to `activate`.
        .route("/activate/{token}", put(router::activate::handler))
        // `POST /login` goes to `login`.
        .route("/login", post(router::login::handler))
        // `POST /logout` goes to `logout`.
        .route("/logout", post(router::logout::handler))
        // `POST /refresh` goes to `refresh`.
        .route("/refresh", post(router::refresh::handler))
        .nest("/users", router::users::router(state.clone()))
        .nest("/.well-known", well_known::well_known())
        .with_state(state)
        .route_layer(AxumMiddleware::from_fn(telemetry::track))
        .layer(middleware)
}

/// Initialize the application state.
///
/// Fails on out of range settings, unreachable database or unusable signing
/// keys.
pub async fn initialize_state(
    config: Arc<config::Configuration>,
) -> Result<AppState, ServerError> {
    config.validate()?;

    let db = match config.postgres {
        Some(ref postgres) => database::Database::postgres(postgres).await?,
        None => {
            tracing::warn!(
                "missing `postgres` entry on configuration, sessions will not survive restarts"
            );
            database::Database::memory()
        },
    };

    let crypto = Arc::new(crypto::Crypto::new(config.argon2.clone())?);

    let token = Arc::new(token::TokenManager::from_config(&config.token)?);
    tracing::info!(kid = token.key_id(), "signing keys loaded");

    let session = session::SessionManager::new(
        Arc::clone(&token),
        db.clone(),
        config.token.refresh_ttl,
    );

    Ok(AppState {
        config,
        db,
        crypto,
        token,
        session,
    })
}
