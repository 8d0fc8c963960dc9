//! Request middleware.

pub mod auth;

pub use auth::{auth_required, jwt_auth};
