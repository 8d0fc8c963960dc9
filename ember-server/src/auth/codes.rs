//! Email verification codes for account registration.
//!
//! The broker generates and checks the codes; actually delivering them is a
//! deployment concern behind [`CodeDelivery`].  The default delivery logs
//! the code, which is enough for development and for operators who scrape
//! logs into their own notification pipeline.

use std::collections::HashMap;

use chrono::{DateTime, Duration, Utc};
use rand::Rng;
use tokio::sync::Mutex;
use tracing::info;

/// How a generated code reaches the user.
pub trait CodeDelivery: Send + Sync + 'static {
    fn deliver(&self, email: &str, code: &str);
}

/// Development delivery: the code goes to the server log.
#[derive(Debug, Default)]
pub struct LogDelivery;

impl CodeDelivery for LogDelivery {
    fn deliver(&self, email: &str, code: &str) {
        info!(email, code, "verification code issued");
    }
}

#[derive(Debug, Clone)]
struct PendingCode {
    code: String,
    expires_at: DateTime<Utc>,
}

const CODE_TTL_MINUTES: i64 = 10;

#[derive(Debug, Default)]
pub struct CodeCache {
    codes: Mutex<HashMap<String, PendingCode>>,
}

impl CodeCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Generate a 6-digit code for `email`, replacing any previous one.
    pub async fn generate(&self, email: &str) -> String {
        let code = format!("{:06}", rand::thread_rng().gen_range(0..1_000_000));
        self.codes.lock().await.insert(
            email.to_owned(),
            PendingCode {
                code: code.clone(),
                expires_at: Utc::now() + Duration::minutes(CODE_TTL_MINUTES),
            },
        );
        code
    }

    /// Check `code` against the pending entry for `email`; a successful
    /// check consumes the code.
    pub async fn verify(&self, email: &str, code: &str) -> bool {
        let mut codes = self.codes.lock().await;
        match codes.get(email) {
            Some(pending) if pending.code == code && Utc::now() < pending.expires_at => {
                codes.remove(email);
                true
            }
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn codes_verify_once() {
        let cache = CodeCache::new();
        let code = cache.generate("a@example.com").await;
        assert_eq!(code.len(), 6);

        assert!(cache.verify("a@example.com", &code).await);
        assert!(!cache.verify("a@example.com", &code).await, "consumed on success");
    }

    #[tokio::test]
    async fn wrong_code_or_email_fails() {
        let cache = CodeCache::new();
        let code = cache.generate("a@example.com").await;
        assert!(!cache.verify("a@example.com", "000000").await || code == "000000");
        assert!(!cache.verify("b@example.com", &code).await);
    }

    #[tokio::test]
    async fn regenerating_replaces_the_previous_code() {
        let cache = CodeCache::new();
        let first = cache.generate("a@example.com").await;
        let second = cache.generate("a@example.com").await;
        if first != second {
            assert!(!cache.verify("a@example.com", &first).await);
        }
        assert!(cache.verify("a@example.com", &second).await);
    }
}
