//! Account, marketplace, and ledger DTOs for the `/api` surface.

use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

// ── Auth ─────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Deserialize, ToSchema)]
pub struct LoginRequest {
    pub username: String,
    pub password: String,
}

#[derive(Debug, Clone, Serialize, ToSchema)]
pub struct LoginResponse {
    pub token: String,
    pub user_id: String,
    pub username: String,
    pub role: String,
}

#[derive(Debug, Clone, Deserialize, ToSchema)]
pub struct SendCodeRequest {
    pub email: String,
}

#[derive(Debug, Clone, Deserialize, ToSchema)]
pub struct RegisterUserRequest {
    pub email: String,
    pub username: String,
    pub password: String,
    /// Verification code previously issued by `POST /api/send-code`.
    pub code: String,
}

// ── API keys ─────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Deserialize, ToSchema)]
pub struct CreateKeyRequest {
    pub name: String,
    /// Lifetime in days; the server default applies when omitted.
    #[serde(default)]
    pub expiry_days: Option<i64>,
}

#[derive(Debug, Clone, Deserialize, ToSchema)]
pub struct RenameKeyRequest {
    pub name: String,
}

/// An API key as returned by the listing endpoints.  `key` carries the full
/// secret only in the creation response.
#[derive(Debug, Clone, Serialize, ToSchema)]
pub struct ApiKeyView {
    pub id: String,
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub key: Option<String>,
    pub prefix: String,
    pub created_at: chrono::DateTime<chrono::Utc>,
    pub expires_at: chrono::DateTime<chrono::Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_used: Option<chrono::DateTime<chrono::Utc>>,
    pub revoked: bool,
}

impl ApiKeyView {
    /// The listing shape: secret blanked.
    pub fn redacted(record: crate::db::ApiKeyRecord) -> Self {
        Self::from_record(record, false)
    }

    /// The creation shape: secret included, exactly once.
    pub fn fresh(record: crate::db::ApiKeyRecord) -> Self {
        Self::from_record(record, true)
    }

    fn from_record(record: crate::db::ApiKeyRecord, with_secret: bool) -> Self {
        Self {
            id: record.id,
            name: record.name,
            key: with_secret.then_some(record.key),
            prefix: record.prefix,
            created_at: record.created_at,
            expires_at: record.expires_at,
            last_used: record.last_used,
            revoked: record.revoked,
        }
    }
}

// ── Worker join token ────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, ToSchema)]
pub struct RegisterTokenResponse {
    pub token: String,
    /// Seconds until the token expires.
    pub expires_in: i64,
}

// ── Ledger views ─────────────────────────────────────────────────────────────

/// Query window shared by the usage and income endpoints; dates are
/// `YYYY-MM-DD`, the window defaults to the last 30 days, and `end_date` is
/// inclusive.
#[derive(Debug, Clone, Deserialize, utoipa::IntoParams)]
pub struct WindowQuery {
    #[serde(default)]
    pub start_date: Option<String>,
    #[serde(default)]
    pub end_date: Option<String>,
}

#[derive(Debug, Clone, Serialize, ToSchema)]
pub struct UsageRow {
    pub request_id: String,
    pub worker_id: String,
    pub model: String,
    pub ippm: f64,
    pub oppm: f64,
    pub input_tokens: i64,
    pub output_tokens: i64,
    pub total_tokens: i64,
    pub request_type: String,
    pub revenue: f64,
    pub timestamp: chrono::DateTime<chrono::Utc>,
}

impl From<crate::db::UsageRecord> for UsageRow {
    fn from(r: crate::db::UsageRecord) -> Self {
        Self {
            request_id: r.request_id,
            worker_id: r.worker_id,
            model: r.model,
            ippm: r.ippm,
            oppm: r.oppm,
            input_tokens: r.input_tokens,
            output_tokens: r.output_tokens,
            total_tokens: r.total_tokens,
            request_type: r.request_type,
            revenue: r.revenue,
            timestamp: r.created_at,
        }
    }
}

#[derive(Debug, Clone, Serialize, ToSchema)]
pub struct UsageListResponse {
    pub total: usize,
    pub data: Vec<UsageRow>,
}

#[derive(Debug, Clone, Serialize, ToSchema)]
pub struct IncomeResponse {
    pub total: usize,
    pub cumulative_income: f64,
    pub data: Vec<UsageRow>,
}

// ── Marketplace ──────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Deserialize, utoipa::IntoParams)]
pub struct TrendsQuery {
    #[serde(default)]
    pub start_date: Option<String>,
    #[serde(default)]
    pub end_date: Option<String>,
    #[serde(default = "default_page")]
    pub page: i64,
    #[serde(default = "default_size")]
    pub size: i64,
}

fn default_page() -> i64 {
    1
}

fn default_size() -> i64 {
    20
}

#[derive(Debug, Clone, Serialize, ToSchema)]
pub struct TrendsResponse {
    pub data: Vec<crate::db::TrendRecord>,
    pub total: i64,
    pub page: i64,
    pub size: i64,
    pub total_pages: i64,
}
