//! Server configuration, loaded from environment variables at startup.

use anyhow::{bail, Context};

use crate::registry::balancer::BalancePolicy;

/// Runtime configuration for ember-server.
///
/// Every field has a default so the broker works out-of-the-box without any
/// environment variables set.  Invalid values (an unknown `LBA`, a negative
/// price cap, an unparsable number) abort startup with a diagnostic rather
/// than silently falling back.
#[derive(Debug, Clone)]
pub struct Config {
    /// TCP address to bind (default: `"0.0.0.0:8080"`).
    pub bind_address: String,

    /// SQLite (or other sqlx-compatible) database URL.
    ///
    /// The path in a `sqlite://` URL is relative to the working directory of
    /// the server process at startup; use an absolute path in production.
    pub database_url: String,

    /// Seconds between keepalive pings on each worker control channel.
    pub keepalive_secs: u64,

    /// Latency bound in milliseconds; workers at or above it are pruned.
    ///
    /// The default (65535) effectively disables latency eviction; operators
    /// opt in by lowering it.
    pub max_latency_ms: i64,

    /// Hard per-request deadline in seconds, from dispatch to last byte.
    pub chat_max_secs: u64,

    /// WebSocket read/write buffer size in bytes.
    pub ws_buffer: usize,

    /// HS256 signing secret for user JWTs.
    pub jwt_secret: String,

    /// JWT lifetime in hours.
    pub jwt_expiry_hours: i64,

    /// Maximum live API keys per account.
    pub max_api_keys_per_user: usize,

    /// Default API-key lifetime in days.
    pub default_key_expiry_days: i64,

    /// Load-balancing policy for worker selection.
    pub balance_policy: BalancePolicy,

    /// Upper bound on worker-advertised input price (per million tokens).
    pub ippm_max: f64,

    /// Upper bound on worker-advertised output price (per million tokens).
    pub oppm_max: f64,

    /// Lifetime in seconds of a single-use worker join token.
    pub register_token_expiry_secs: i64,

    /// How long a completed fingerprint stays queryable before the sweeper
    /// removes it.
    pub fingerprint_grace_secs: i64,

    /// `tracing` filter string, e.g. `"info"` or `"debug,tower_http=warn"`.
    pub log_level: String,

    /// When `true`, emit log records as newline-delimited JSON.
    pub log_json: bool,

    /// When `true`, serve the Swagger UI at `/swagger-ui`.
    pub enable_swagger: bool,

    /// Comma-separated allowed CORS origins; `None` allows all (`*`).
    pub cors_allowed_origins: Option<String>,

    /// Password for the seeded `admin` account (created only when the users
    /// table is empty).
    pub admin_password: String,
}

impl Config {
    /// Build [`Config`] from environment variables, falling back to defaults.
    pub fn from_env() -> anyhow::Result<Self> {
        let cfg = Self {
            bind_address: env_or("SERVER_PORT", "0.0.0.0:8080"),
            database_url: env_or("DATABASE_URL", "sqlite://ember.db?mode=rwc"),
            keepalive_secs: parse_env("KEEPALIVE_TIME", ember_proto::DEFAULT_KEEPALIVE_SECS)?,
            max_latency_ms: parse_env("MAX_LATENCY", ember_proto::DEFAULT_MAX_LATENCY_MS)?,
            chat_max_secs: parse_env("CHAT_MAX_TIME", ember_proto::DEFAULT_CHAT_MAX_SECS)?,
            ws_buffer: parse_env("WS_BUFFER", ember_proto::DEFAULT_WS_BUFFER)?,
            jwt_secret: env_or("JWT_SECRET", "ember-dev-secret-change-me"),
            jwt_expiry_hours: parse_env("JWT_EXPIRY", 24)?,
            max_api_keys_per_user: parse_env("MAX_API_KEYS_PER_USER", 3)?,
            default_key_expiry_days: parse_env("DEFAULT_KEY_EXPIRY", 30)?,
            balance_policy: env_or("LBA", "round-robin")
                .parse()
                .context("invalid LBA (expected round-robin, random, or min-conn)")?,
            ippm_max: parse_env("INPUT_TOKEN_PRICE_PER_MAX", 10.0)?,
            oppm_max: parse_env("OUTPUT_TOKEN_PRICE_PER_MAX", 10.0)?,
            register_token_expiry_secs: parse_env("REGISTER_TOKEN_EXPIRY", 600)?,
            fingerprint_grace_secs: parse_env("FINGERPRINT_GRACE", 300)?,
            log_level: env_or("EMBER_LOG", "info"),
            log_json: std::env::var("EMBER_LOG_JSON")
                .map(|v| v == "1" || v.eq_ignore_ascii_case("true"))
                .unwrap_or(false),
            enable_swagger: std::env::var("ENABLE_SWAGGER")
                .map(|v| v != "0" && !v.eq_ignore_ascii_case("false"))
                .unwrap_or(true),
            cors_allowed_origins: std::env::var("CORS_ORIGINS").ok(),
            admin_password: env_or("ADMIN_PASSWORD", "admin123"),
        };

        if cfg.ippm_max < 0.0 || cfg.oppm_max < 0.0 {
            bail!(
                "price caps must be non-negative (INPUT_TOKEN_PRICE_PER_MAX={}, OUTPUT_TOKEN_PRICE_PER_MAX={})",
                cfg.ippm_max,
                cfg.oppm_max
            );
        }
        if cfg.keepalive_secs == 0 {
            bail!("KEEPALIVE_TIME must be at least 1 second");
        }
        if cfg.chat_max_secs == 0 {
            bail!("CHAT_MAX_TIME must be at least 1 second");
        }

        Ok(cfg)
    }
}

// ── private helpers ──────────────────────────────────────────────────────────

fn env_or(key: &str, default: &str) -> String {
    std::env::var(key).unwrap_or_else(|_| default.to_owned())
}

fn parse_env<T: std::str::FromStr>(key: &str, default: T) -> anyhow::Result<T>
where
    T::Err: std::fmt::Display,
{
    match std::env::var(key) {
        Err(_) => Ok(default),
        Ok(raw) => raw
            .parse()
            .map_err(|e| anyhow::anyhow!("invalid {key}={raw}: {e}")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        // Run in a clean scope: the relevant variables are unlikely to be set
        // in a test environment, and the defaults must pass validation.
        let cfg = Config::from_env().expect("default config should validate");
        assert_eq!(cfg.keepalive_secs, 5);
        assert_eq!(cfg.max_latency_ms, 65535);
        assert_eq!(cfg.chat_max_secs, 180);
        assert_eq!(cfg.balance_policy, BalancePolicy::RoundRobin);
    }

    #[test]
    fn unknown_balance_policy_is_rejected() {
        assert!("weighted".parse::<BalancePolicy>().is_err());
        assert!("min-conn".parse::<BalancePolicy>().is_ok());
    }
}
