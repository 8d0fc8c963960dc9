//! User JWTs (HS256).

use chrono::{Duration, Utc};
use jsonwebtoken::{decode, encode, DecodingKey, EncodingKey, Header, Validation};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Claims {
    pub user_id: String,
    pub username: String,
    pub role: String,
    /// Expiry, seconds since the Unix epoch.
    pub exp: i64,
    pub iat: i64,
    pub iss: String,
    pub sub: String,
}

const ISSUER: &str = "ember-platform";

/// Sign a token for `user_id` valid for `expiry_hours`.
pub fn issue(
    secret: &str,
    user_id: &str,
    username: &str,
    role: &str,
    expiry_hours: i64,
) -> Result<String, jsonwebtoken::errors::Error> {
    let now = Utc::now();
    let claims = Claims {
        user_id: user_id.to_owned(),
        username: username.to_owned(),
        role: role.to_owned(),
        exp: (now + Duration::hours(expiry_hours)).timestamp(),
        iat: now.timestamp(),
        iss: ISSUER.to_owned(),
        sub: user_id.to_owned(),
    };
    encode(&Header::default(), &claims, &EncodingKey::from_secret(secret.as_bytes()))
}

/// Verify a token and return its claims.
pub fn verify(secret: &str, token: &str) -> Result<Claims, jsonwebtoken::errors::Error> {
    let mut validation = Validation::default();
    validation.set_issuer(&[ISSUER]);
    decode::<Claims>(token, &DecodingKey::from_secret(secret.as_bytes()), &validation)
        .map(|data| data.claims)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn issue_then_verify_round_trips() {
        let token = issue("secret", "u1", "alice", "user", 24).expect("issue");
        let claims = verify("secret", &token).expect("verify");
        assert_eq!(claims.user_id, "u1");
        assert_eq!(claims.role, "user");
    }

    #[test]
    fn wrong_secret_is_rejected() {
        let token = issue("secret", "u1", "alice", "user", 24).expect("issue");
        assert!(verify("other", &token).is_err());
    }

    #[test]
    fn expired_token_is_rejected() {
        let token = issue("secret", "u1", "alice", "user", -1).expect("issue");
        assert!(verify("secret", &token).is_err());
    }
}
