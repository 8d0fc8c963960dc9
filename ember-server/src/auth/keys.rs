//! API key generation and validation against the store.

use base64::Engine as _;
use chrono::{Duration, Utc};
use rand::RngCore;

use crate::db::{ApiKeyRecord, ApiKeyStore};
use crate::error::ServerError;

/// Mint a new `sk-…` API key for `user_id`.
///
/// The full secret is returned exactly once, in the creation response; the
/// store keeps it for validation but listings blank it.
pub fn mint(user_id: &str, name: &str, expiry_days: i64) -> ApiKeyRecord {
    let mut raw = [0u8; 32];
    rand::thread_rng().fill_bytes(&mut raw);
    let secret = format!("sk-{}", base64::engine::general_purpose::STANDARD.encode(raw));
    let prefix = secret.chars().take(10).collect();

    let now = Utc::now();
    ApiKeyRecord {
        id: format!("key-{}", uuid::Uuid::new_v4()),
        user_id: user_id.to_owned(),
        name: name.to_owned(),
        key: secret,
        prefix,
        created_at: now,
        expires_at: now + Duration::days(expiry_days),
        last_used: None,
        revoked: false,
    }
}

/// Look up `key`, enforce revocation and expiry, and stamp `last_used`.
pub async fn validate<S: ApiKeyStore>(store: &S, key: &str) -> Result<ApiKeyRecord, ServerError> {
    let record = store
        .key_by_value(key)
        .await?
        .ok_or_else(|| ServerError::Unauthorized("invalid API key".into()))?;

    if record.revoked {
        return Err(ServerError::Unauthorized("API key has been revoked".into()));
    }
    if Utc::now() > record.expires_at {
        return Err(ServerError::Unauthorized("API key has expired".into()));
    }

    if let Err(e) = store.touch_key(&record.id).await {
        tracing::warn!(key_id = %record.id, error = %e, "failed to stamp API key last_used");
    }
    Ok(record)
}
