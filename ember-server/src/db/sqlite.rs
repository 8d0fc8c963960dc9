//! SQLite implementation of the store traits.
//!
//! Uses [`sqlx`] with the `sqlite` feature.  Migrations are run automatically
//! on startup via [`SqliteStore::connect`].
//!
//! # Migrations path
//!
//! `sqlx::migrate!("./migrations")` resolves the path **at compile time**
//! relative to `CARGO_MANIFEST_DIR` (the crate root), so the directory is
//! embedded into the binary.
//!
//! # Queries
//!
//! The `sqlx::query` (runtime-verified) form is used deliberately so that no
//! `DATABASE_URL` environment variable is needed at compile time.  Timestamps
//! are stored as RFC 3339 text.

use chrono::{DateTime, Utc};
use sqlx::sqlite::SqlitePoolOptions;
use sqlx::SqlitePool;

use super::{
    ApiKeyRecord, ApiKeyStore, FingerprintStore, TrendRecord, TrendStore, UsageRecord, UsageStore,
    UserRecord, UserStore, WorkerRecord, WorkerStore,
};

/// SQLite-backed store for every persistent concern of the broker.
#[derive(Clone, Debug)]
pub struct SqliteStore {
    pool: SqlitePool,
}

impl SqliteStore {
    /// Open (or create) the SQLite database at `url` and run pending
    /// migrations.  `"sqlite://:memory:"` works for tests.
    pub async fn connect(url: &str) -> Result<Self, sqlx::Error> {
        // An in-memory database lives and dies with its connection, so the
        // pool must hold exactly one and never recycle it.
        let pool = if url.contains(":memory:") {
            SqlitePoolOptions::new()
                .max_connections(1)
                .idle_timeout(None)
                .max_lifetime(None)
                .connect(url)
                .await?
        } else {
            SqlitePool::connect(url).await?
        };
        sqlx::migrate!("./migrations").run(&pool).await?;
        Ok(Self { pool })
    }
}

fn parse_ts(raw: &str) -> DateTime<Utc> {
    raw.parse::<DateTime<Utc>>().unwrap_or_else(|e| {
        tracing::warn!(raw, error = %e, "failed to parse stored timestamp; using now");
        Utc::now()
    })
}

fn parse_ts_opt(raw: Option<String>) -> Option<DateTime<Utc>> {
    raw.map(|s| parse_ts(&s))
}

// ── UserStore ─────────────────────────────────────────────────────────────────

impl UserStore for SqliteStore {
    async fn create_user(&self, user: UserRecord) -> Result<(), sqlx::Error> {
        sqlx::query(
            "INSERT INTO users (id, username, email, password_hash, role, created_at, updated_at) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
        )
        .bind(&user.id)
        .bind(&user.username)
        .bind(&user.email)
        .bind(&user.password_hash)
        .bind(&user.role)
        .bind(user.created_at.to_rfc3339())
        .bind(user.updated_at.to_rfc3339())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn user_by_username(&self, username: &str) -> Result<Option<UserRecord>, sqlx::Error> {
        self.user_where("username = ?1", username).await
    }

    async fn user_by_email(&self, email: &str) -> Result<Option<UserRecord>, sqlx::Error> {
        self.user_where("email = ?1", email).await
    }

    async fn user_by_id(&self, id: &str) -> Result<Option<UserRecord>, sqlx::Error> {
        self.user_where("id = ?1", id).await
    }

    async fn count_users(&self) -> Result<i64, sqlx::Error> {
        let row: (i64,) = sqlx::query_as("SELECT COUNT(*) FROM users")
            .fetch_one(&self.pool)
            .await?;
        Ok(row.0)
    }
}

impl SqliteStore {
    async fn user_where(&self, cond: &str, value: &str) -> Result<Option<UserRecord>, sqlx::Error> {
        let sql = format!(
            "SELECT id, username, email, password_hash, role, created_at, updated_at \
             FROM users WHERE {cond}"
        );
        let row: Option<(String, String, String, String, String, String, String)> =
            sqlx::query_as(&sql).bind(value).fetch_optional(&self.pool).await?;
        Ok(row.map(|(id, username, email, password_hash, role, created_at, updated_at)| UserRecord {
            id,
            username,
            email,
            password_hash,
            role,
            created_at: parse_ts(&created_at),
            updated_at: parse_ts(&updated_at),
        }))
    }
}

// ── ApiKeyStore ───────────────────────────────────────────────────────────────

type ApiKeyRow = (
    String,
    String,
    String,
    String,
    String,
    String,
    String,
    Option<String>,
    i64,
);

fn api_key_from_row(row: ApiKeyRow) -> ApiKeyRecord {
    let (id, user_id, name, key, prefix, created_at, expires_at, last_used, revoked) = row;
    ApiKeyRecord {
        id,
        user_id,
        name,
        key,
        prefix,
        created_at: parse_ts(&created_at),
        expires_at: parse_ts(&expires_at),
        last_used: parse_ts_opt(last_used),
        revoked: revoked != 0,
    }
}

impl ApiKeyStore for SqliteStore {
    async fn insert_key(&self, key: ApiKeyRecord) -> Result<(), sqlx::Error> {
        sqlx::query(
            "INSERT INTO api_keys (id, user_id, name, key, prefix, created_at, expires_at, last_used, revoked) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
        )
        .bind(&key.id)
        .bind(&key.user_id)
        .bind(&key.name)
        .bind(&key.key)
        .bind(&key.prefix)
        .bind(key.created_at.to_rfc3339())
        .bind(key.expires_at.to_rfc3339())
        .bind(key.last_used.map(|t| t.to_rfc3339()))
        .bind(key.revoked as i64)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn key_by_value(&self, key: &str) -> Result<Option<ApiKeyRecord>, sqlx::Error> {
        let row: Option<ApiKeyRow> = sqlx::query_as(
            "SELECT id, user_id, name, key, prefix, created_at, expires_at, last_used, revoked \
             FROM api_keys WHERE key = ?1",
        )
        .bind(key)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(api_key_from_row))
    }

    async fn keys_by_user(&self, user_id: &str) -> Result<Vec<ApiKeyRecord>, sqlx::Error> {
        let rows: Vec<ApiKeyRow> = sqlx::query_as(
            "SELECT id, user_id, name, key, prefix, created_at, expires_at, last_used, revoked \
             FROM api_keys WHERE user_id = ?1 ORDER BY created_at DESC",
        )
        .bind(user_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().map(api_key_from_row).collect())
    }

    async fn rename_key(&self, user_id: &str, key_id: &str, name: &str) -> Result<bool, sqlx::Error> {
        let result = sqlx::query("UPDATE api_keys SET name = ?1 WHERE id = ?2 AND user_id = ?3")
            .bind(name)
            .bind(key_id)
            .bind(user_id)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn revoke_key(&self, user_id: &str, key_id: &str) -> Result<bool, sqlx::Error> {
        let result = sqlx::query("UPDATE api_keys SET revoked = 1 WHERE id = ?1 AND user_id = ?2")
            .bind(key_id)
            .bind(user_id)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn touch_key(&self, key_id: &str) -> Result<(), sqlx::Error> {
        sqlx::query("UPDATE api_keys SET last_used = ?1 WHERE id = ?2")
            .bind(Utc::now().to_rfc3339())
            .bind(key_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}

// ── WorkerStore ───────────────────────────────────────────────────────────────

impl WorkerStore for SqliteStore {
    async fn upsert_worker(&self, worker: WorkerRecord) -> Result<(), sqlx::Error> {
        sqlx::query(
            "INSERT INTO workers (id, user_id, remote_addr, engine, num_parallel, registered_at, last_seen) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7) \
             ON CONFLICT(id) DO UPDATE SET \
                 user_id = ?2, remote_addr = ?3, engine = ?4, num_parallel = ?5, last_seen = ?7",
        )
        .bind(&worker.id)
        .bind(&worker.user_id)
        .bind(&worker.remote_addr)
        .bind(&worker.engine)
        .bind(worker.num_parallel)
        .bind(worker.registered_at.to_rfc3339())
        .bind(worker.last_seen.to_rfc3339())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn workers_by_user(&self, user_id: &str) -> Result<Vec<WorkerRecord>, sqlx::Error> {
        let rows: Vec<(String, String, String, String, i64, String, String)> = sqlx::query_as(
            "SELECT id, user_id, remote_addr, engine, num_parallel, registered_at, last_seen \
             FROM workers WHERE user_id = ?1 ORDER BY registered_at",
        )
        .bind(user_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows
            .into_iter()
            .map(|(id, user_id, remote_addr, engine, num_parallel, registered_at, last_seen)| {
                WorkerRecord {
                    id,
                    user_id,
                    remote_addr,
                    engine,
                    num_parallel,
                    registered_at: parse_ts(&registered_at),
                    last_seen: parse_ts(&last_seen),
                }
            })
            .collect())
    }
}

// ── FingerprintStore ──────────────────────────────────────────────────────────

impl FingerprintStore for SqliteStore {
    async fn record_fingerprint(
        &self,
        fingerprint: &str,
        worker_id: &str,
        state: &str,
    ) -> Result<(), sqlx::Error> {
        let now = Utc::now().to_rfc3339();
        sqlx::query(
            "INSERT INTO client_fingerprints (fingerprint, worker_id, state, created_at, updated_at) \
             VALUES (?1, ?2, ?3, ?4, ?4) \
             ON CONFLICT(fingerprint) DO UPDATE SET state = ?3, updated_at = ?4",
        )
        .bind(fingerprint)
        .bind(worker_id)
        .bind(state)
        .bind(&now)
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}

// ── UsageStore ────────────────────────────────────────────────────────────────

type UsageRow = (
    String,
    String,
    Option<String>,
    String,
    String,
    String,
    f64,
    f64,
    i64,
    i64,
    i64,
    String,
    f64,
    String,
);

fn usage_from_row(row: UsageRow) -> UsageRecord {
    let (
        request_id,
        user_id,
        api_key_id,
        worker_id,
        remote_addr,
        model,
        ippm,
        oppm,
        input_tokens,
        output_tokens,
        total_tokens,
        request_type,
        revenue,
        created_at,
    ) = row;
    UsageRecord {
        request_id,
        user_id,
        api_key_id,
        worker_id,
        remote_addr,
        model,
        ippm,
        oppm,
        input_tokens,
        output_tokens,
        total_tokens,
        request_type,
        revenue,
        created_at: parse_ts(&created_at),
    }
}

const USAGE_COLUMNS: &str = "request_id, user_id, api_key_id, worker_id, remote_addr, model, \
                             ippm, oppm, input_tokens, output_tokens, total_tokens, \
                             request_type, revenue, created_at";

impl UsageStore for SqliteStore {
    async fn record_usage(&self, usage: UsageRecord) -> Result<(), sqlx::Error> {
        sqlx::query(
            "INSERT INTO token_usage (request_id, user_id, api_key_id, worker_id, remote_addr, \
                                      model, ippm, oppm, input_tokens, output_tokens, \
                                      total_tokens, request_type, revenue, created_at) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14)",
        )
        .bind(&usage.request_id)
        .bind(&usage.user_id)
        .bind(&usage.api_key_id)
        .bind(&usage.worker_id)
        .bind(&usage.remote_addr)
        .bind(&usage.model)
        .bind(usage.ippm)
        .bind(usage.oppm)
        .bind(usage.input_tokens)
        .bind(usage.output_tokens)
        .bind(usage.total_tokens)
        .bind(&usage.request_type)
        .bind(usage.revenue)
        .bind(usage.created_at.to_rfc3339())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn usage_by_user(
        &self,
        user_id: &str,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<Vec<UsageRecord>, sqlx::Error> {
        let sql = format!(
            "SELECT {USAGE_COLUMNS} FROM token_usage \
             WHERE user_id = ?1 AND created_at BETWEEN ?2 AND ?3 \
             ORDER BY created_at DESC"
        );
        let rows: Vec<UsageRow> = sqlx::query_as(&sql)
            .bind(user_id)
            .bind(from.to_rfc3339())
            .bind(to.to_rfc3339())
            .fetch_all(&self.pool)
            .await?;
        Ok(rows.into_iter().map(usage_from_row).collect())
    }

    async fn usage_by_workers(
        &self,
        worker_ids: &[String],
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<Vec<UsageRecord>, sqlx::Error> {
        if worker_ids.is_empty() {
            return Ok(Vec::new());
        }
        let mut builder = sqlx::QueryBuilder::new(format!(
            "SELECT {USAGE_COLUMNS} FROM token_usage WHERE worker_id IN ("
        ));
        let mut separated = builder.separated(", ");
        for id in worker_ids {
            separated.push_bind(id);
        }
        builder.push(") AND created_at BETWEEN ");
        builder.push_bind(from.to_rfc3339());
        builder.push(" AND ");
        builder.push_bind(to.to_rfc3339());
        builder.push(" ORDER BY created_at DESC");

        let rows: Vec<UsageRow> = builder.build_query_as().fetch_all(&self.pool).await?;
        Ok(rows.into_iter().map(usage_from_row).collect())
    }

    async fn cumulative_income(&self, user_id: &str) -> Result<f64, sqlx::Error> {
        let row: (Option<f64>,) = sqlx::query_as(
            "SELECT SUM(u.revenue) FROM token_usage u \
             JOIN workers w ON w.id = u.worker_id \
             WHERE w.user_id = ?1",
        )
        .bind(user_id)
        .fetch_one(&self.pool)
        .await?;
        Ok(row.0.unwrap_or(0.0))
    }
}

// ── TrendStore ────────────────────────────────────────────────────────────────

impl TrendStore for SqliteStore {
    async fn record_trend(
        &self,
        name: &str,
        description: &str,
        user_id: Option<&str>,
        worker_id: Option<&str>,
    ) -> Result<(), sqlx::Error> {
        sqlx::query(
            "INSERT INTO trends (name, description, user_id, worker_id, created_at, active) \
             VALUES (?1, ?2, ?3, ?4, ?5, 1)",
        )
        .bind(name)
        .bind(description)
        .bind(user_id)
        .bind(worker_id)
        .bind(Utc::now().to_rfc3339())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn list_trends(
        &self,
        from: Option<DateTime<Utc>>,
        to: Option<DateTime<Utc>>,
        page: i64,
        size: i64,
    ) -> Result<(Vec<TrendRecord>, i64), sqlx::Error> {
        let page = page.max(1);
        let size = size.clamp(1, 200);

        let (window, from_s, to_s) = match (from, to) {
            (Some(f), Some(t)) => (
                " WHERE created_at >= ?1 AND created_at <= ?2",
                f.to_rfc3339(),
                t.to_rfc3339(),
            ),
            _ => ("", String::new(), String::new()),
        };

        let count_sql = format!("SELECT COUNT(*) FROM trends{window}");
        let mut count_query = sqlx::query_as::<_, (i64,)>(&count_sql);
        if !window.is_empty() {
            count_query = count_query.bind(&from_s).bind(&to_s);
        }
        let (total,) = count_query.fetch_one(&self.pool).await?;

        let offset = (page - 1) * size;
        let list_sql = format!(
            "SELECT id, name, description, user_id, worker_id, created_at, active \
             FROM trends{window} ORDER BY created_at DESC LIMIT {size} OFFSET {offset}"
        );
        let mut list_query =
            sqlx::query_as::<_, (i64, String, String, Option<String>, Option<String>, String, i64)>(
                &list_sql,
            );
        if !window.is_empty() {
            list_query = list_query.bind(&from_s).bind(&to_s);
        }
        let rows = list_query.fetch_all(&self.pool).await?;

        let trends = rows
            .into_iter()
            .map(|(id, name, description, user_id, worker_id, created_at, active)| TrendRecord {
                id,
                name,
                description,
                user_id,
                worker_id,
                created_at: parse_ts(&created_at),
                active: active != 0,
            })
            .collect();
        Ok((trends, total))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn memory_store() -> SqliteStore {
        SqliteStore::connect("sqlite://:memory:").await.expect("in-memory store")
    }

    fn usage(worker_id: &str, user_id: &str, revenue: f64) -> UsageRecord {
        UsageRecord {
            request_id: uuid::Uuid::new_v4().to_string(),
            user_id: user_id.to_owned(),
            api_key_id: None,
            worker_id: worker_id.to_owned(),
            remote_addr: "127.0.0.1".into(),
            model: "qwen3:0.6b".into(),
            ippm: 4.0,
            oppm: 8.0,
            input_tokens: 10,
            output_tokens: 20,
            total_tokens: 30,
            request_type: "chat".into(),
            revenue,
            created_at: Utc::now(),
        }
    }

    fn worker(id: &str, user_id: &str) -> WorkerRecord {
        WorkerRecord {
            id: id.to_owned(),
            user_id: user_id.to_owned(),
            remote_addr: "10.0.0.2:5000".into(),
            engine: "ollama".into(),
            num_parallel: 2,
            registered_at: Utc::now(),
            last_seen: Utc::now(),
        }
    }

    #[tokio::test]
    async fn cumulative_income_joins_through_worker_ownership() {
        let store = memory_store().await;
        store.upsert_worker(worker("w1", "owner")).await.unwrap();
        store.upsert_worker(worker("w2", "owner")).await.unwrap();
        store.upsert_worker(worker("w3", "other")).await.unwrap();

        // Consumer "c1" spends on workers owned by "owner" and "other".
        store.record_usage(usage("w1", "c1", 0.5)).await.unwrap();
        store.record_usage(usage("w2", "c1", 0.25)).await.unwrap();
        store.record_usage(usage("w3", "c1", 1.0)).await.unwrap();

        let income = store.cumulative_income("owner").await.unwrap();
        assert!((income - 0.75).abs() < 1e-9);
        assert_eq!(store.cumulative_income("nobody").await.unwrap(), 0.0);
    }

    #[tokio::test]
    async fn usage_windows_filter_by_worker_set() {
        let store = memory_store().await;
        store.record_usage(usage("w1", "c1", 0.1)).await.unwrap();
        store.record_usage(usage("w2", "c1", 0.2)).await.unwrap();

        let from = Utc::now() - chrono::Duration::hours(1);
        let to = Utc::now() + chrono::Duration::hours(1);
        let rows = store
            .usage_by_workers(&["w1".to_owned()], from, to)
            .await
            .unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].worker_id, "w1");

        assert!(store.usage_by_workers(&[], from, to).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn trends_paginate_newest_first() {
        let store = memory_store().await;
        for i in 0..5 {
            store
                .record_trend("worker joined", &format!("worker {i}"), Some("u1"), None)
                .await
                .unwrap();
        }

        let (page1, total) = store.list_trends(None, None, 1, 2).await.unwrap();
        assert_eq!(total, 5);
        assert_eq!(page1.len(), 2);

        let (page3, _) = store.list_trends(None, None, 3, 2).await.unwrap();
        assert_eq!(page3.len(), 1);
    }

    #[tokio::test]
    async fn api_key_crud_round_trip() {
        let store = memory_store().await;
        let key = ApiKeyRecord {
            id: "key-1".into(),
            user_id: "u1".into(),
            name: "laptop".into(),
            key: "sk-abc".into(),
            prefix: "sk-abc".into(),
            created_at: Utc::now(),
            expires_at: Utc::now() + chrono::Duration::days(30),
            last_used: None,
            revoked: false,
        };
        store.insert_key(key).await.unwrap();

        let found = store.key_by_value("sk-abc").await.unwrap().expect("key");
        assert_eq!(found.user_id, "u1");

        assert!(store.rename_key("u1", "key-1", "desktop").await.unwrap());
        assert!(!store.rename_key("u2", "key-1", "stolen").await.unwrap());

        assert!(store.revoke_key("u1", "key-1").await.unwrap());
        let revoked = store.key_by_value("sk-abc").await.unwrap().expect("key");
        assert!(revoked.revoked);
    }
}
