//! Authentication building blocks: JWTs, password hashing, API keys,
//! single-use worker join tokens, and email verification codes.

pub mod codes;
pub mod jwt;
pub mod keys;
pub mod password;
pub mod register_tokens;

/// Authenticated caller identity, inserted into request extensions by the
/// auth middleware and read by handlers.
#[derive(Debug, Clone)]
pub struct AuthUser {
    pub user_id: String,
    pub username: String,
    pub role: String,
    /// Present when the caller authenticated with an API key rather than a
    /// JWT.
    pub api_key_id: Option<String>,
}
