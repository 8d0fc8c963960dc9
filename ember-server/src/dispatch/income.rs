//! Usage metering and the `INCOME` push back to the worker.

use std::sync::Arc;

use chrono::Utc;
use tracing::warn;

use ember_proto::{Frame, FrameKind, IncomeNotice, UsageTally};

use crate::db::{UsageRecord, UsageStore};
use crate::state::AppState;

use super::{Dispatch, RequestMeta};

/// Revenue of one request under the prices frozen at dispatch time.
pub fn revenue(ippm: f64, oppm: f64, tally: &UsageTally) -> f64 {
    (ippm * tally.prompt_tokens as f64 + oppm * tally.completion_tokens as f64) / 1_000_000.0
}

/// Append the usage row and notify the worker of its earnings.
///
/// Runs on a spawned task: the relay loop (and the consumer's response) must
/// never wait on the ledger.
pub fn meter(state: &AppState, dispatch: &Dispatch, meta: &RequestMeta, tally: UsageTally, request_type: &'static str) {
    let record = UsageRecord {
        request_id: dispatch.fingerprint.to_string(),
        user_id: meta.user_id.clone(),
        api_key_id: meta.api_key_id.clone(),
        worker_id: dispatch.worker.id.clone(),
        remote_addr: meta.remote_addr.clone(),
        model: dispatch.model.clone(),
        ippm: dispatch.ippm,
        oppm: dispatch.oppm,
        input_tokens: tally.prompt_tokens as i64,
        output_tokens: tally.completion_tokens as i64,
        total_tokens: tally.total_tokens as i64,
        request_type: request_type.to_owned(),
        revenue: revenue(dispatch.ippm, dispatch.oppm, &tally),
        created_at: Utc::now(),
    };

    let state = state.clone();
    let worker = Arc::clone(&dispatch.worker);
    let model = dispatch.model.clone();
    tokio::spawn(async move {
        let income = record.revenue;
        if let Err(e) = state.store.record_usage(record).await {
            warn!(worker_id = %worker.id, error = %e, "failed to record usage");
            return;
        }

        let total_income = match state.store.cumulative_income(&worker.user_id).await {
            Ok(total) => total,
            Err(e) => {
                warn!(user_id = %worker.user_id, error = %e, "failed to compute cumulative income");
                income
            }
        };

        let notice = IncomeNotice {
            model,
            usage: tally,
            income,
            total_income,
            timestamp: Utc::now().timestamp_millis(),
        };
        match serde_json::to_value(&notice) {
            Ok(content) => {
                if worker.send(Frame::new(FrameKind::Income, content)).await.is_err() {
                    warn!(worker_id = %worker.id, "worker gone before income notice");
                }
            }
            Err(e) => warn!(error = %e, "failed to encode income notice"),
        }
    });
}
