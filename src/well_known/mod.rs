pub mod jwks;

use axum::Router;
use axum::routing::get;

use crate::AppState;

pub fn well_known() -> Router<AppState> {
    // `GET /.well-known/jwks.json` goes to `jwks`.
    Router::new().route("/jwks.json", get(jwks::handler))
}
