//! End-to-end dispatcher tests.
//!
//! These drive the full relay — balance, fingerprint lifecycle, readiness,
//! frame relay, metering, income push — with the worker side played by the
//! test through the worker mailbox and an in-process response channel.  No
//! sockets involved.

use std::sync::Arc;
use std::time::Duration;

use serde_json::{json, Value};
use tokio::sync::mpsc;
use uuid::Uuid;

use ember_proto::{Frame, FrameKind, Model, ModelKind};

use crate::config::Config;
use crate::db::{UsageRecord, UsageStore, WorkerRecord, WorkerStore};
use crate::dispatch::{chat, embedding, RequestMeta};
use crate::error::ServerError;
use crate::registry::balancer::BalancePolicy;
use crate::registry::fingerprints::FingerprintState;
use crate::registry::responses::ResponseChannel;
use crate::registry::worker::test_support::online_worker;
use crate::registry::worker::Worker;
use crate::schemas::v1::{ChatCompletionRequest, EmbeddingRequest};
use crate::session::clamp_models;
use crate::state::AppState;

// ── Harness ──────────────────────────────────────────────────────────────────

async fn test_state(chat_max_secs: u64, policy: BalancePolicy) -> AppState {
    let mut cfg = Config::from_env().expect("default config");
    cfg.database_url = "sqlite://:memory:".into();
    cfg.chat_max_secs = chat_max_secs;
    cfg.balance_policy = policy;
    let store = crate::db::sqlite::SqliteStore::connect(&cfg.database_url)
        .await
        .expect("in-memory store");
    AppState::new(cfg, store)
}

fn chat_model(name: &str, ippm: f64, oppm: f64) -> Model {
    Model {
        name: name.into(),
        engine: "ollama".into(),
        kind: ModelKind::Chat,
        size: "523MB".into(),
        quantization: "Q4_K_M".into(),
        ippm,
        oppm,
    }
}

fn chat_request(model: &str, stream: bool) -> ChatCompletionRequest {
    serde_json::from_value(json!({
        "model": model,
        "messages": [{"role": "user", "content": "say hi"}],
        "stream": stream,
    }))
    .expect("request")
}

fn meta() -> RequestMeta {
    RequestMeta {
        user_id: "consumer-1".into(),
        api_key_id: Some("key-1".into()),
        remote_addr: "127.0.0.1:55000".into(),
    }
}

/// Register `worker` for `model` in the registry and persist its ownership
/// row so income queries can join.
async fn enroll(state: &AppState, worker: &Arc<Worker>, model: &str) {
    state.models.register(model, worker).await;
    state
        .store
        .upsert_worker(WorkerRecord {
            id: worker.id.clone(),
            user_id: worker.user_id.clone(),
            remote_addr: worker.remote_addr.clone(),
            engine: worker.engine.name.clone(),
            num_parallel: i64::from(worker.engine.num_parallel),
            registered_at: worker.register_time,
            last_seen: chrono::Utc::now(),
        })
        .await
        .expect("worker row");
}

/// Pull the dispatch frame off the worker mailbox and answer it by attaching
/// an in-process response channel.
async fn accept_dispatch(
    state: &AppState,
    mailbox: &mut mpsc::Receiver<Frame>,
    expected_kind: FrameKind,
) -> (Uuid, mpsc::Sender<Frame>) {
    let dispatched = tokio::time::timeout(Duration::from_secs(2), mailbox.recv())
        .await
        .expect("dispatch frame in time")
        .expect("mailbox open");
    assert_eq!(dispatched.kind, expected_kind);
    let fingerprint = dispatched
        .fingerprint
        .as_deref()
        .and_then(|fp| Uuid::parse_str(fp).ok())
        .expect("dispatch carries a fingerprint");

    let (tx, rx) = mpsc::channel(16);
    state
        .responses
        .attach(fingerprint, ResponseChannel::Frames(rx))
        .await
        .expect("dispatcher is waiting");
    (fingerprint, tx)
}

/// Metering runs on a side task; poll the ledger until the row lands.
async fn wait_for_usage(state: &AppState, user_id: &str) -> UsageRecord {
    let from = chrono::Utc::now() - chrono::Duration::hours(1);
    let to = chrono::Utc::now() + chrono::Duration::hours(1);
    for _ in 0..100 {
        let rows = state.store.usage_by_user(user_id, from, to).await.expect("query");
        if let Some(row) = rows.into_iter().next() {
            return row;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    panic!("usage row never appeared for {user_id}");
}

async fn body_bytes(response: axum::response::Response) -> Vec<u8> {
    axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .expect("body")
        .to_vec()
}

// ── Scenario: single-worker unary chat ───────────────────────────────────────

#[tokio::test]
async fn unary_chat_relays_body_and_meters_usage() {
    let state = test_state(5, BalancePolicy::RoundRobin).await;
    let (worker, mut mailbox) =
        online_worker("w1", "owner-1", vec![chat_model("qwen3:0.6b", 4.0, 8.0)], 1).await;
    enroll(&state, &worker, "qwen3:0.6b").await;

    let handler = tokio::spawn(chat::handle_chat(
        state.clone(),
        meta(),
        chat_request("qwen3:0.6b", false),
    ));

    let (fp, tx) = accept_dispatch(&state, &mut mailbox, FrameKind::Message).await;
    let payload = json!({
        "id": fp.to_string(),
        "object": "chat.completion",
        "model": "qwen3:0.6b",
        "choices": [{"index": 0, "message": {"role": "assistant", "content": "hi"}, "finish_reason": "stop"}],
        "usage": {"prompt_tokens": 10, "completion_tokens": 20, "total_tokens": 30},
    });
    tx.send(Frame::with_fingerprint(FrameKind::Message, payload.clone(), fp.to_string()))
        .await
        .expect("send response");
    tx.send(Frame::close(Some(fp.to_string()))).await.expect("send close");

    let response = handler.await.expect("join").expect("200 response");
    assert_eq!(response.status(), 200);
    let body: Value = serde_json::from_slice(&body_bytes(response).await).expect("json body");
    assert_eq!(body["choices"][0]["message"]["content"], "hi");
    assert_eq!(body["usage"]["total_tokens"], 30);

    let row = wait_for_usage(&state, "consumer-1").await;
    assert_eq!(row.input_tokens, 10);
    assert_eq!(row.output_tokens, 20);
    assert_eq!(row.total_tokens, 30);
    assert_eq!(row.request_type, "chat");
    assert!((row.revenue - 0.0002).abs() < 1e-12, "revenue = (4·10+8·20)/1e6");

    // The fingerprint reached its terminal state and the worker got its
    // income notice.
    let entry = state.fingerprints.get(fp).await.expect("entry survives grace window");
    assert_eq!(entry.state, FingerprintState::Completed);

    let income = tokio::time::timeout(Duration::from_secs(2), mailbox.recv())
        .await
        .expect("income in time")
        .expect("mailbox open");
    assert_eq!(income.kind, FrameKind::Income);
    assert_eq!(income.content["income"], row.revenue);
}

// ── Scenario: streaming with a trailing usage chunk ──────────────────────────

#[tokio::test]
async fn streaming_chat_emits_exact_sse_bytes() {
    let state = test_state(5, BalancePolicy::RoundRobin).await;
    let (worker, mut mailbox) =
        online_worker("w1", "owner-1", vec![chat_model("qwen3:0.6b", 4.0, 8.0)], 1).await;
    enroll(&state, &worker, "qwen3:0.6b").await;

    let handler = tokio::spawn(chat::handle_chat(
        state.clone(),
        meta(),
        chat_request("qwen3:0.6b", true),
    ));

    let (fp, tx) = accept_dispatch(&state, &mut mailbox, FrameKind::Message).await;

    let mut forwarded = Vec::new();
    for i in 0..5 {
        let chunk = json!({
            "id": fp.to_string(),
            "object": "chat.completion.chunk",
            "choices": [{"index": 0, "delta": {"content": format!("tok{i}")}, "finish_reason": null}],
        });
        forwarded.push(chunk.clone());
        tx.send(Frame::with_fingerprint(FrameKind::MessageStream, chunk, fp.to_string()))
            .await
            .expect("delta");
    }
    let stop = json!({
        "id": fp.to_string(),
        "object": "chat.completion.chunk",
        "choices": [{"index": 0, "delta": {}, "finish_reason": "stop"}],
    });
    forwarded.push(stop.clone());
    tx.send(Frame::with_fingerprint(FrameKind::MessageStream, stop, fp.to_string()))
        .await
        .expect("stop chunk");
    // Trailing usage chunk: accounting only, not consumer-visible.
    tx.send(Frame::with_fingerprint(
        FrameKind::MessageStream,
        json!({"choices": [], "usage": {"prompt_tokens": 5, "completion_tokens": 15, "total_tokens": 20}}),
        fp.to_string(),
    ))
    .await
    .expect("usage trailer");

    let response = handler.await.expect("join").expect("SSE response");
    assert_eq!(response.status(), 200);
    assert_eq!(
        response.headers().get("content-type").and_then(|v| v.to_str().ok()),
        Some("text/event-stream")
    );
    assert_eq!(
        response.headers().get("cache-control").and_then(|v| v.to_str().ok()),
        Some("no-cache")
    );

    let body = String::from_utf8(body_bytes(response).await).expect("utf8");
    let mut expected = String::new();
    for chunk in &forwarded {
        expected.push_str(&format!("data: {chunk}\n\n"));
    }
    expected.push_str("data: [DONE]\n\n");
    assert_eq!(body, expected, "SSE body is exactly the forwarded frames plus [DONE]");

    let row = wait_for_usage(&state, "consumer-1").await;
    assert_eq!(row.total_tokens, 20);
    assert!((row.revenue - (4.0 * 5.0 + 8.0 * 15.0) / 1e6).abs() < 1e-12);
}

#[tokio::test]
async fn stream_without_usage_records_zero_tally() {
    let state = test_state(5, BalancePolicy::RoundRobin).await;
    let (worker, mut mailbox) =
        online_worker("w1", "owner-1", vec![chat_model("m", 4.0, 8.0)], 1).await;
    enroll(&state, &worker, "m").await;

    let handler = tokio::spawn(chat::handle_chat(state.clone(), meta(), chat_request("m", true)));
    let (fp, tx) = accept_dispatch(&state, &mut mailbox, FrameKind::Message).await;

    tx.send(Frame::with_fingerprint(
        FrameKind::MessageStream,
        json!({"choices": [{"index": 0, "delta": {"content": "hi"}, "finish_reason": "stop"}]}),
        fp.to_string(),
    ))
    .await
    .expect("stop chunk");
    // Worker ends the channel without ever sending usage.
    drop(tx);

    let response = handler.await.expect("join").expect("SSE response");
    let body = String::from_utf8(body_bytes(response).await).expect("utf8");
    assert!(!body.contains("[DONE]"), "no usage frame → no [DONE] terminator");

    let row = wait_for_usage(&state, "consumer-1").await;
    assert_eq!(row.total_tokens, 0);
    assert_eq!(row.revenue, 0.0);
}

// ── Scenario: response channel never opens ───────────────────────────────────

#[tokio::test]
async fn chat_times_out_when_worker_never_opens_response_channel() {
    let state = test_state(1, BalancePolicy::RoundRobin).await;
    let (worker, mut mailbox) =
        online_worker("w1", "owner-1", vec![chat_model("m", 1.0, 1.0)], 1).await;
    enroll(&state, &worker, "m").await;

    let handler = tokio::spawn(chat::handle_chat(state.clone(), meta(), chat_request("m", false)));

    // The worker receives the dispatch but never opens /response/{fp}.
    let dispatched = mailbox.recv().await.expect("dispatch frame");
    let fp = Uuid::parse_str(dispatched.fingerprint.as_deref().expect("fp")).expect("uuid");

    let err = handler.await.expect("join").expect_err("timeout");
    assert!(matches!(err, ServerError::ChatTimeout));
    assert_eq!(err.to_string(), "Chat timeout");

    let entry = state.fingerprints.get(fp).await.expect("entry");
    assert_eq!(entry.state, FingerprintState::Completed);
}

// ── Scenario: no available worker ────────────────────────────────────────────

#[tokio::test]
async fn dispatch_without_workers_is_rejected() {
    let state = test_state(5, BalancePolicy::RoundRobin).await;
    let err = chat::handle_chat(state.clone(), meta(), chat_request("m", false))
        .await
        .expect_err("no worker");
    assert!(matches!(err, ServerError::NoAvailableClient));
    assert_eq!(err.to_string(), "No available client");
}

#[tokio::test]
async fn stale_worker_is_pruned_from_dispatch_and_marketplace() {
    let state = test_state(5, BalancePolicy::RoundRobin).await;
    let (worker, _mailbox) =
        online_worker("w1", "owner-1", vec![chat_model("m", 1.0, 1.0)], 1).await;
    enroll(&state, &worker, "m").await;

    // Keepalive stopped answering: latency rises past the bound.
    worker.set_latency_ms(state.config.max_latency_ms + 1);

    assert!(state.models.marketplace_view(state.config.max_latency_ms).await.is_empty());
    let err = chat::handle_chat(state.clone(), meta(), chat_request("m", false))
        .await
        .expect_err("pruned");
    assert!(matches!(err, ServerError::NoAvailableClient));
}

// ── Scenario: model error passthrough ────────────────────────────────────────

#[tokio::test]
async fn model_error_maps_to_500_with_message() {
    let state = test_state(5, BalancePolicy::RoundRobin).await;
    let (worker, mut mailbox) =
        online_worker("w1", "owner-1", vec![chat_model("m", 1.0, 1.0)], 1).await;
    enroll(&state, &worker, "m").await;

    let handler = tokio::spawn(chat::handle_chat(state.clone(), meta(), chat_request("m", false)));
    let (fp, tx) = accept_dispatch(&state, &mut mailbox, FrameKind::Message).await;
    tx.send(Frame::model_error("model exploded", fp.to_string()))
        .await
        .expect("error frame");

    let err = handler.await.expect("join").expect_err("model error");
    assert!(matches!(err, ServerError::ModelError(_)));
    assert_eq!(err.to_string(), "Model error: model exploded");
    assert_eq!(
        state.fingerprints.get(fp).await.expect("entry").state,
        FingerprintState::Completed
    );
}

// ── Scenario: price clamp flows into the ledger ──────────────────────────────

#[tokio::test]
async fn clamped_prices_are_billed_not_advertised_ones() {
    let state = test_state(5, BalancePolicy::RoundRobin).await;

    // The session clamps on ingest; emulate it exactly.
    let advertised = clamp_models(vec![chat_model("m", 1000.0, 8.0)], 10.0, 10.0);
    let (worker, mut mailbox) = online_worker("w1", "owner-1", advertised, 1).await;
    enroll(&state, &worker, "m").await;

    let handler = tokio::spawn(chat::handle_chat(state.clone(), meta(), chat_request("m", false)));
    let (fp, tx) = accept_dispatch(&state, &mut mailbox, FrameKind::Message).await;
    tx.send(Frame::with_fingerprint(
        FrameKind::Message,
        json!({"choices": [], "usage": {"prompt_tokens": 100, "completion_tokens": 0, "total_tokens": 100}}),
        fp.to_string(),
    ))
    .await
    .expect("response");

    handler.await.expect("join").expect("200");
    let row = wait_for_usage(&state, "consumer-1").await;
    assert_eq!(row.ippm, 10.0, "stored price is the clamped one");
    assert!((row.revenue - 10.0 * 100.0 / 1e6).abs() < 1e-12);
}

// ── Invariant: prices frozen at dispatch ─────────────────────────────────────

#[tokio::test]
async fn mid_request_price_push_does_not_change_billing() {
    let state = test_state(5, BalancePolicy::RoundRobin).await;
    let (worker, mut mailbox) =
        online_worker("w1", "owner-1", vec![chat_model("m", 4.0, 8.0)], 1).await;
    enroll(&state, &worker, "m").await;

    let handler = tokio::spawn(chat::handle_chat(state.clone(), meta(), chat_request("m", false)));
    let (fp, tx) = accept_dispatch(&state, &mut mailbox, FrameKind::Message).await;

    // Price push lands while the request is in flight.
    worker.set_models(vec![chat_model("m", 9.0, 9.0)]).await;

    tx.send(Frame::with_fingerprint(
        FrameKind::Message,
        json!({"choices": [], "usage": {"prompt_tokens": 10, "completion_tokens": 20, "total_tokens": 30}}),
        fp.to_string(),
    ))
    .await
    .expect("response");

    handler.await.expect("join").expect("200");
    let row = wait_for_usage(&state, "consumer-1").await;
    assert_eq!(row.ippm, 4.0);
    assert_eq!(row.oppm, 8.0);
    assert!((row.revenue - 0.0002).abs() < 1e-12);
}

// ── Embeddings ───────────────────────────────────────────────────────────────

#[tokio::test]
async fn embedding_relays_and_bills_input_tokens_only() {
    let state = test_state(5, BalancePolicy::RoundRobin).await;
    let mut model = chat_model("bge-m3", 0.1, 0.0);
    model.kind = ModelKind::Embedding;
    let (worker, mut mailbox) = online_worker("w1", "owner-1", vec![model], 1).await;
    enroll(&state, &worker, "bge-m3").await;

    let request: EmbeddingRequest = serde_json::from_value(json!({
        "model": "bge-m3",
        "input": "the quick brown fox",
    }))
    .expect("request");
    let handler = tokio::spawn(embedding::handle_embedding(state.clone(), meta(), request));

    let (fp, tx) = accept_dispatch(&state, &mut mailbox, FrameKind::EmbeddingRequest).await;
    tx.send(Frame::with_fingerprint(
        FrameKind::EmbeddingResponse,
        json!({
            "object": "list",
            "model": "bge-m3",
            "data": [{"object": "embedding", "index": 0, "embedding": [0.1, 0.2]}],
            "usage": {"prompt_tokens": 7, "total_tokens": 7},
        }),
        fp.to_string(),
    ))
    .await
    .expect("response");

    let response = handler.await.expect("join").expect("200");
    let body: Value = serde_json::from_slice(&body_bytes(response).await).expect("json");
    assert_eq!(body["object"], "list");

    let row = wait_for_usage(&state, "consumer-1").await;
    assert_eq!(row.request_type, "embedding");
    assert_eq!(row.input_tokens, 7);
    assert_eq!(row.output_tokens, 0);
    assert!((row.revenue - 0.1 * 7.0 / 1e6).abs() < 1e-12);
}

// ── Round-robin across two workers ───────────────────────────────────────────

#[tokio::test]
async fn round_robin_alternates_between_workers() {
    let state = test_state(5, BalancePolicy::RoundRobin).await;
    let (w1, mut mb1) = online_worker("w1", "o1", vec![chat_model("m", 1.0, 1.0)], 1).await;
    let (w2, mut mb2) = online_worker("w2", "o2", vec![chat_model("m", 1.0, 1.0)], 1).await;
    enroll(&state, &w1, "m").await;
    enroll(&state, &w2, "m").await;

    let mut hit = std::collections::HashMap::new();
    for _ in 0..4 {
        let handler =
            tokio::spawn(chat::handle_chat(state.clone(), meta(), chat_request("m", false)));

        // Whichever worker got the dispatch answers it.
        let (fp, which, tx) = tokio::select! {
            Some(frame) = mb1.recv() => {
                let fp = Uuid::parse_str(frame.fingerprint.as_deref().expect("fp")).expect("uuid");
                let (tx, rx) = mpsc::channel(4);
                state.responses.attach(fp, ResponseChannel::Frames(rx)).await.expect("attach");
                (fp, "w1", tx)
            }
            Some(frame) = mb2.recv() => {
                let fp = Uuid::parse_str(frame.fingerprint.as_deref().expect("fp")).expect("uuid");
                let (tx, rx) = mpsc::channel(4);
                state.responses.attach(fp, ResponseChannel::Frames(rx)).await.expect("attach");
                (fp, "w2", tx)
            }
        };
        *hit.entry(which).or_insert(0) += 1;

        tx.send(Frame::with_fingerprint(
            FrameKind::Message,
            json!({"choices": [], "usage": {"prompt_tokens": 1, "completion_tokens": 1, "total_tokens": 2}}),
            fp.to_string(),
        ))
        .await
        .expect("response");
        handler.await.expect("join").expect("200");
    }

    assert_eq!(hit.get("w1"), Some(&2));
    assert_eq!(hit.get("w2"), Some(&2));
}
