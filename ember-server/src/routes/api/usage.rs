//! Windowed ledger views: consumer-side token usage and worker-side income.

use axum::extract::{Query, State};
use axum::routing::get;
use axum::{Extension, Json, Router};
use chrono::{DateTime, Duration, NaiveDate, Utc};

use crate::auth::AuthUser;
use crate::db::{UsageStore, WorkerStore};
use crate::error::ServerError;
use crate::schemas::api::{IncomeResponse, UsageListResponse, UsageRow, WindowQuery};
use crate::state::AppState;

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/token-usage", get(token_usage))
        .route("/income", get(income))
}

/// Resolve a `start_date`/`end_date` query into a concrete UTC window.
///
/// Defaults to the last 30 days; `end_date` is inclusive (the whole day).
pub fn resolve_window(query: &WindowQuery) -> Result<(DateTime<Utc>, DateTime<Utc>), ServerError> {
    let start = match &query.start_date {
        Some(raw) => day_start(raw, "start_date")?,
        None => Utc::now() - Duration::days(30),
    };
    let end = match &query.end_date {
        Some(raw) => day_start(raw, "end_date")? + Duration::days(1) - Duration::seconds(1),
        None => Utc::now(),
    };
    Ok((start, end))
}

fn day_start(raw: &str, field: &str) -> Result<DateTime<Utc>, ServerError> {
    let date = raw
        .parse::<NaiveDate>()
        .map_err(|_| ServerError::BadRequest(format!("{field} is invalid")))?;
    let midnight = date
        .and_hms_opt(0, 0, 0)
        .ok_or_else(|| ServerError::BadRequest(format!("{field} is invalid")))?;
    Ok(DateTime::from_naive_utc_and_offset(midnight, Utc))
}

/// `GET /api/user/token-usage` — what the caller spent as a consumer.
pub async fn token_usage(
    State(state): State<AppState>,
    Extension(auth): Extension<AuthUser>,
    Query(query): Query<WindowQuery>,
) -> Result<Json<UsageListResponse>, ServerError> {
    let (from, to) = resolve_window(&query)?;
    let rows = state.store.usage_by_user(&auth.user_id, from, to).await?;
    let data: Vec<UsageRow> = rows.into_iter().map(UsageRow::from).collect();
    Ok(Json(UsageListResponse { total: data.len(), data }))
}

/// `GET /api/user/income` — what the caller's workers earned.
pub async fn income(
    State(state): State<AppState>,
    Extension(auth): Extension<AuthUser>,
    Query(query): Query<WindowQuery>,
) -> Result<Json<IncomeResponse>, ServerError> {
    let (from, to) = resolve_window(&query)?;

    let worker_ids: Vec<String> = state
        .store
        .workers_by_user(&auth.user_id)
        .await?
        .into_iter()
        .map(|w| w.id)
        .collect();

    let rows = if worker_ids.is_empty() {
        Vec::new()
    } else {
        state.store.usage_by_workers(&worker_ids, from, to).await?
    };
    let cumulative_income = state.store.cumulative_income(&auth.user_id).await?;

    let data: Vec<UsageRow> = rows.into_iter().map(UsageRow::from).collect();
    Ok(Json(IncomeResponse { total: data.len(), cumulative_income, data }))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn window_defaults_to_last_30_days() {
        let (from, to) = resolve_window(&WindowQuery { start_date: None, end_date: None })
            .expect("window");
        let span = to - from;
        assert!(span >= Duration::days(29) && span <= Duration::days(31));
    }

    #[test]
    fn end_date_is_inclusive() {
        let query = WindowQuery {
            start_date: Some("2026-01-01".into()),
            end_date: Some("2026-01-31".into()),
        };
        let (from, to) = resolve_window(&query).expect("window");
        assert_eq!(from.to_rfc3339(), "2026-01-01T00:00:00+00:00");
        assert_eq!(to.to_rfc3339(), "2026-01-31T23:59:59+00:00");
    }

    #[test]
    fn malformed_dates_are_rejected() {
        let query = WindowQuery {
            start_date: Some("January 1st".into()),
            end_date: None,
        };
        assert!(resolve_window(&query).is_err());
    }
}
