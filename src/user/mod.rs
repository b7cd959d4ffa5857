mod service;

pub use service::*;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// User as saved on database.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize, sqlx::FromRow)]
pub struct User {
    pub id: Uuid,
    pub email: String,
    /// PHC string.
    #[serde(skip)]
    pub password: String,
    pub first_name: String,
    pub last_name: String,
    pub is_active: bool,
    /// Optimistic concurrency counter.
    pub version: i32,
    pub location_id: Option<Uuid>,
    pub created_at: DateTime<Utc>,
}

/// Postal location, possibly shared between several users.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize, sqlx::FromRow)]
pub struct Location {
    pub id: Uuid,
    pub street: String,
    pub city: String,
    pub state: String,
    pub county: String,
    pub zip_code: String,
    pub country: String,
    pub country_code: String,
    pub latitude: f64,
    pub longitude: f64,
    /// `false` for a postal code centroid.
    pub is_precise: bool,
}

impl Location {
    /// Upper-case text fields so equal addresses compare equal.
    pub fn normalize(mut self) -> Self {
        self.street = self.street.trim().to_uppercase();
        self.city = self.city.trim().to_uppercase();
        self.state = self.state.trim().to_uppercase();
        self.county = self.county.trim().to_uppercase();
        self.zip_code = self.zip_code.trim().to_uppercase();
        self.country = self.country.trim().to_uppercase();
        self.country_code = self.country_code.trim().to_uppercase();
        self.is_precise = !self.street.is_empty();
        self
    }

    /// Whether two locations designate the same place.
    pub fn same_place(&self, other: &Location) -> bool {
        self.is_precise == other.is_precise
            && self.street == other.street
            && self.city == other.city
            && self.state == other.state
            && self.zip_code == other.zip_code
            && self.country == other.country
    }
}

/// User not yet persisted.
#[derive(Clone, Debug)]
pub struct NewUser {
    pub id: Uuid,
    pub email: String,
    pub password: String,
    pub first_name: String,
    pub last_name: String,
    /// Normalized location, reused when an identical one exists.
    pub location: Option<Location>,
}

/// Pending activation of a freshly registered user.
#[derive(Clone, Debug)]
pub struct Invitation {
    /// SHA256 of the activation token.
    pub token_hash: String,
    pub expires_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_location_normalize() {
        let location = Location {
            city: " Springfield".into(),
            state: "il".into(),
            zip_code: "62701".into(),
            country: "us".into(),
            ..Default::default()
        }
        .normalize();

        assert_eq!(location.city, "SPRINGFIELD");
        assert_eq!(location.state, "IL");
        assert_eq!(location.country, "US");
        assert!(!location.is_precise);

        let precise = Location {
            street: "1 main st".into(),
            ..location.clone()
        }
        .normalize();
        assert_eq!(precise.street, "1 MAIN ST");
        assert!(precise.is_precise);
        assert!(!precise.same_place(&location));
    }
}
