//! Based on JWK (RFC 7517 <https://datatracker.ietf.org/doc/html/rfc7517>).

use axum::Json;
use axum::extract::State;
use base64ct::{Base64UrlUnpadded, Encoding};
use p256::PublicKey;
use p256::elliptic_curve::sec1::ToEncodedPoint;
use serde::{Deserialize, Serialize};

use crate::AppState;
use crate::error::{Result, ServerError};

const COORD_LEN: usize = 32;
const PREFIX_LEN: usize = 1;

#[derive(Debug, Serialize, Deserialize)]
pub struct Response {
    pub keys: Vec<Key>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct Key {
    pub crv: String,
    pub ext: bool,
    pub key_ops: Vec<String>,
    pub kty: String,
    pub x: String,
    pub y: String,
    pub kid: String,
    pub alg: String,
    pub r#use: String,
}

/// Split an uncompressed SEC1 point into base64url `x` and `y`.
fn coordinates(public_key: &PublicKey) -> Option<(String, String)> {
    let encoded_point = public_key.to_encoded_point(false);
    let full_bytes = encoded_point.as_bytes();
    if full_bytes.len() != PREFIX_LEN + 2 * COORD_LEN || full_bytes[0] != 0x04 {
        return None;
    }

    let x = &full_bytes[PREFIX_LEN..PREFIX_LEN + COORD_LEN];
    let y = &full_bytes[PREFIX_LEN + COORD_LEN..];

    Some((
        Base64UrlUnpadded::encode_string(x),
        Base64UrlUnpadded::encode_string(y),
    ))
}

/// Handler publishing the verification key.
pub async fn handler(State(state): State<AppState>) -> Result<Json<Response>> {
    let (x, y) = coordinates(state.token.public_key()).ok_or_else(|| {
        ServerError::Internal {
            details: "public key is not an uncompressed P-256 point".into(),
            source: None,
        }
    })?;

    let keys = vec![Key {
        key_ops: vec!["verify".to_owned()],
        ext: true,
        kty: "EC".into(),
        r#use: "sig".into(),
        kid: state.token.key_id().to_owned(),
        alg: "ES256".into(),
        x,
        y,
        crv: "P-256".into(),
    }];

    Ok(Json(Response { keys }))
}
