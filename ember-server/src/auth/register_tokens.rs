//! Single-use worker join tokens.
//!
//! A user requests a token over the authenticated API, hands it to their
//! worker process, and the worker presents it in the
//! `X-Registration-Token` header when opening the control channel.  Each
//! token binds the resulting worker session to the issuing account and is
//! consumed on first use.

use std::collections::HashMap;

use chrono::{DateTime, Duration, Utc};
use rand::RngCore;
use tokio::sync::Mutex;

#[derive(Debug, Clone)]
struct RegisterToken {
    user_id: String,
    created_at: DateTime<Utc>,
    used: bool,
}

#[derive(Debug)]
pub struct RegisterTokenCache {
    tokens: Mutex<HashMap<String, RegisterToken>>,
    ttl: Duration,
}

impl RegisterTokenCache {
    pub fn new(ttl_secs: i64) -> Self {
        Self {
            tokens: Mutex::new(HashMap::new()),
            ttl: Duration::seconds(ttl_secs),
        }
    }

    /// Issue a fresh token for `user_id`.
    pub async fn issue(&self, user_id: &str) -> String {
        let mut raw = [0u8; 32];
        rand::thread_rng().fill_bytes(&mut raw);
        let token: String = raw.iter().map(|b| format!("{b:02x}")).collect();

        self.tokens.lock().await.insert(
            token.clone(),
            RegisterToken {
                user_id: user_id.to_owned(),
                created_at: Utc::now(),
                used: false,
            },
        );
        token
    }

    /// Validate `token` and consume it, returning the owning user id.
    pub async fn consume(&self, token: &str) -> Result<String, TokenError> {
        let mut tokens = self.tokens.lock().await;
        let entry = tokens.get_mut(token).ok_or(TokenError::Invalid)?;
        if entry.used {
            return Err(TokenError::AlreadyUsed);
        }
        if Utc::now() - entry.created_at > self.ttl {
            return Err(TokenError::Expired);
        }
        entry.used = true;
        Ok(entry.user_id.clone())
    }

    /// Drop used and expired tokens; run periodically from a sweeper task.
    pub async fn cleanup(&self) -> usize {
        let now = Utc::now();
        let mut tokens = self.tokens.lock().await;
        let before = tokens.len();
        tokens.retain(|_, t| !t.used && now - t.created_at <= self.ttl);
        before - tokens.len()
    }
}

#[derive(Debug, PartialEq, Eq, thiserror::Error)]
pub enum TokenError {
    #[error("invalid registration token")]
    Invalid,
    #[error("registration token already used")]
    AlreadyUsed,
    #[error("registration token expired")]
    Expired,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn tokens_are_single_use() {
        let cache = RegisterTokenCache::new(600);
        let token = cache.issue("u1").await;

        assert_eq!(cache.consume(&token).await, Ok("u1".to_owned()));
        assert_eq!(cache.consume(&token).await, Err(TokenError::AlreadyUsed));
        assert_eq!(cache.consume("bogus").await, Err(TokenError::Invalid));
    }

    #[tokio::test]
    async fn expired_tokens_are_rejected() {
        let cache = RegisterTokenCache::new(-1);
        let token = cache.issue("u1").await;
        assert_eq!(cache.consume(&token).await, Err(TokenError::Expired));
    }

    #[tokio::test]
    async fn cleanup_drops_consumed_tokens() {
        let cache = RegisterTokenCache::new(600);
        let token = cache.issue("u1").await;
        let _keep = cache.issue("u2").await;
        cache.consume(&token).await.expect("consume");

        assert_eq!(cache.cleanup().await, 1);
    }
}
