//! Database abstraction layer.
//!
//! One trait per concern (users, API keys, workers, fingerprints, usage,
//! trends); the default implementation for all of them is
//! [`sqlite::SqliteStore`].  To swap to another database, implement these
//! traits for a new type and change the concrete type in
//! [`crate::state::AppState`].
//!
//! All trait methods use `impl Future` in their signatures (stable since
//! Rust 1.75) so no extra `async-trait` crate is required.

pub mod sqlite;

use chrono::{DateTime, Utc};

// ── Records ──────────────────────────────────────────────────────────────────

/// A single row in the `users` table.
#[derive(Debug, Clone)]
pub struct UserRecord {
    pub id: String,
    pub username: String,
    pub email: String,
    pub password_hash: String,
    pub role: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// A single row in the `api_keys` table.  `key` holds the full secret and is
/// blanked before any listing leaves the server.
#[derive(Debug, Clone)]
pub struct ApiKeyRecord {
    pub id: String,
    pub user_id: String,
    pub name: String,
    pub key: String,
    pub prefix: String,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub last_used: Option<DateTime<Utc>>,
    pub revoked: bool,
}

/// A single row in the `workers` table (ownership view for income queries).
#[derive(Debug, Clone)]
pub struct WorkerRecord {
    pub id: String,
    pub user_id: String,
    pub remote_addr: String,
    pub engine: String,
    pub num_parallel: i64,
    pub registered_at: DateTime<Utc>,
    pub last_seen: DateTime<Utc>,
}

/// A single row in the append-only `token_usage` ledger.
///
/// `ippm`/`oppm` are the prices snapshotted at dispatch time; revenue is
/// `(ippm·input + oppm·output) / 1e6` and is computed once, here, never
/// re-derived from current prices.
#[derive(Debug, Clone)]
pub struct UsageRecord {
    pub request_id: String,
    pub user_id: String,
    pub api_key_id: Option<String>,
    pub worker_id: String,
    pub remote_addr: String,
    pub model: String,
    pub ippm: f64,
    pub oppm: f64,
    pub input_tokens: i64,
    pub output_tokens: i64,
    pub total_tokens: i64,
    pub request_type: String,
    pub revenue: f64,
    pub created_at: DateTime<Utc>,
}

/// A marketplace event (worker joined / left).
#[derive(Debug, Clone, serde::Serialize, utoipa::ToSchema)]
pub struct TrendRecord {
    pub id: i64,
    pub name: String,
    pub description: String,
    pub user_id: Option<String>,
    pub worker_id: Option<String>,
    pub created_at: DateTime<Utc>,
    pub active: bool,
}

// ── Traits ───────────────────────────────────────────────────────────────────

pub trait UserStore: Send + Sync + 'static {
    fn create_user(
        &self,
        user: UserRecord,
    ) -> impl std::future::Future<Output = Result<(), sqlx::Error>> + Send;

    fn user_by_username(
        &self,
        username: &str,
    ) -> impl std::future::Future<Output = Result<Option<UserRecord>, sqlx::Error>> + Send;

    fn user_by_email(
        &self,
        email: &str,
    ) -> impl std::future::Future<Output = Result<Option<UserRecord>, sqlx::Error>> + Send;

    fn user_by_id(
        &self,
        id: &str,
    ) -> impl std::future::Future<Output = Result<Option<UserRecord>, sqlx::Error>> + Send;

    fn count_users(&self) -> impl std::future::Future<Output = Result<i64, sqlx::Error>> + Send;
}

pub trait ApiKeyStore: Send + Sync + 'static {
    fn insert_key(
        &self,
        key: ApiKeyRecord,
    ) -> impl std::future::Future<Output = Result<(), sqlx::Error>> + Send;

    fn key_by_value(
        &self,
        key: &str,
    ) -> impl std::future::Future<Output = Result<Option<ApiKeyRecord>, sqlx::Error>> + Send;

    fn keys_by_user(
        &self,
        user_id: &str,
    ) -> impl std::future::Future<Output = Result<Vec<ApiKeyRecord>, sqlx::Error>> + Send;

    fn rename_key(
        &self,
        user_id: &str,
        key_id: &str,
        name: &str,
    ) -> impl std::future::Future<Output = Result<bool, sqlx::Error>> + Send;

    fn revoke_key(
        &self,
        user_id: &str,
        key_id: &str,
    ) -> impl std::future::Future<Output = Result<bool, sqlx::Error>> + Send;

    fn touch_key(
        &self,
        key_id: &str,
    ) -> impl std::future::Future<Output = Result<(), sqlx::Error>> + Send;
}

pub trait WorkerStore: Send + Sync + 'static {
    /// Insert or refresh the row for a (re)joining worker.
    fn upsert_worker(
        &self,
        worker: WorkerRecord,
    ) -> impl std::future::Future<Output = Result<(), sqlx::Error>> + Send;

    fn workers_by_user(
        &self,
        user_id: &str,
    ) -> impl std::future::Future<Output = Result<Vec<WorkerRecord>, sqlx::Error>> + Send;
}

pub trait FingerprintStore: Send + Sync + 'static {
    /// Mirror an in-memory fingerprint state transition for post-mortem
    /// queries.  Upserts so out-of-order writes from spawned tasks are
    /// harmless.
    fn record_fingerprint(
        &self,
        fingerprint: &str,
        worker_id: &str,
        state: &str,
    ) -> impl std::future::Future<Output = Result<(), sqlx::Error>> + Send;
}

pub trait UsageStore: Send + Sync + 'static {
    fn record_usage(
        &self,
        usage: UsageRecord,
    ) -> impl std::future::Future<Output = Result<(), sqlx::Error>> + Send;

    fn usage_by_user(
        &self,
        user_id: &str,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> impl std::future::Future<Output = Result<Vec<UsageRecord>, sqlx::Error>> + Send;

    fn usage_by_workers(
        &self,
        worker_ids: &[String],
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> impl std::future::Future<Output = Result<Vec<UsageRecord>, sqlx::Error>> + Send;

    /// Total revenue earned by every worker owned by `user_id`.
    fn cumulative_income(
        &self,
        user_id: &str,
    ) -> impl std::future::Future<Output = Result<f64, sqlx::Error>> + Send;
}

pub trait TrendStore: Send + Sync + 'static {
    fn record_trend(
        &self,
        name: &str,
        description: &str,
        user_id: Option<&str>,
        worker_id: Option<&str>,
    ) -> impl std::future::Future<Output = Result<(), sqlx::Error>> + Send;

    /// Windowed, newest-first page of trends plus the total row count.
    fn list_trends(
        &self,
        from: Option<DateTime<Utc>>,
        to: Option<DateTime<Utc>>,
        page: i64,
        size: i64,
    ) -> impl std::future::Future<Output = Result<(Vec<TrendRecord>, i64), sqlx::Error>> + Send;
}
