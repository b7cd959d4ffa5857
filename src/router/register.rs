use axum::Json;
use axum::extract::State;
use axum::http::StatusCode;
use serde::{Deserialize, Serialize};
use uuid::Uuid;
use validator::Validate;

use crate::AppState;
use crate::error::Result;
use crate::router::Valid;
use crate::user::{Account, Location, UserService};

const CONFIRMATION: &str =
    "Registration successful! Check your email to verify your account.";

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
    #[validate(length(min = 1, max = 255))]
    pub first_name: String,
    #[validate(length(min = 1, max = 255))]
    pub last_name: String,
    #[validate(length(min = 1, max = 12))]
    pub zip_code: String,
    #[validate(length(min = 1, max = 255))]
    pub city: String,
    #[validate(length(min = 1, max = 255))]
    pub state: String,
    #[serde(default)]
    #[validate(length(max = 255))]
    pub street: Option<String>,
    #[serde(default)]
    #[validate(length(max = 255))]
    pub country: Option<String>,
    #[serde(default)]
    #[validate(length(equal = 2, message = "Country code must be ISO 3166-1 alpha-2."))]
    pub country_code: Option<String>,
    #[serde(default)]
    #[validate(range(min = -90.0, max = 90.0))]
    pub latitude: Option<f64>,
    #[serde(default)]
    #[validate(range(min = -180.0, max = 180.0))]
    pub longitude: Option<f64>,
}

impl From<Body> for Account {
    fn from(body: Body) -> Self {
        let location = Location {
            id: Uuid::new_v4(),
            street: body.street.unwrap_or_default(),
            city: body.city,
            state: body.state,
            county: String::default(),
            zip_code: body.zip_code,
            country: body.country.unwrap_or_default(),
            country_code: body.country_code.unwrap_or_default(),
            latitude: body.latitude.unwrap_or_default(),
            longitude: body.longitude.unwrap_or_default(),
            is_precise: false,
        };

        Account {
            email: body.email,
            password: body.password,
            first_name: body.first_name,
            last_name: body.last_name,
            location: Some(location),
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
pub struct Response {
    pub message: String,
    /// Only set when activation tokens are exposed for development.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub activation_token: Option<String>,
}

/// Handler to register an inactive user.
pub async fn handler(
    State(state): State<AppState>,
    Valid(body): Valid<Body>,
) -> Result<(StatusCode, Json<Response>)> {
    let (_, activation_token) = UserService::new(&state.db, &state.crypto)
        .register(body.into(), state.config.registration.invitation_ttl)
        .await?;

    // Delivery by mail is handled outside this service.
    let activation_token = state
        .config
        .registration
        .expose_activation_token
        .then_some(activation_token);

    Ok((
        StatusCode::CREATED,
        Json(Response {
            message: CONFIRMATION.to_owned(),
            activation_token,
        }),
    ))
}
