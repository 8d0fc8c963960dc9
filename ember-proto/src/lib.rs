//! Wire protocol shared by the Ember broker and worker clients.
//!
//! Two WebSocket channels exist between a worker and the broker:
//!
//! - the **control channel** (`/register/{worker_id}`), long-lived, carrying
//!   registration, keepalive, dispatch, and income frames;
//! - one **response channel** (`/response/{fingerprint}`) per dispatched
//!   request, short-lived, carrying the model output.
//!
//! Every frame on either channel is a JSON [`Frame`] envelope:
//! `{"type": "...", "content": ..., "fingerprint": "..."}`.  The `content`
//! shape depends on the frame kind; it is kept as raw JSON here because the
//! broker relays most payloads verbatim and only a few frame kinds need
//! typed access (see the `content` helpers).

pub mod frame;
pub mod model;

pub use frame::{Frame, FrameKind, PingPong, PingPongKind};
pub use model::{EngineInfo, IncomeNotice, Model, ModelKind, RegisterInfo, UsageTally};

/// Seconds between keepalive pings on the control channel.
pub const DEFAULT_KEEPALIVE_SECS: u64 = 5;

/// Latency bound in milliseconds above which a worker is evicted.
///
/// The default is deliberately high enough to be "effectively off";
/// operators opt in to real eviction by lowering `MAX_LATENCY`.
pub const DEFAULT_MAX_LATENCY_MS: i64 = 65535;

/// Hard deadline in seconds for a dispatched request, measured from the
/// moment the dispatch frame is enqueued on the control channel.
pub const DEFAULT_CHAT_MAX_SECS: u64 = 180;

/// WebSocket read/write buffer size in bytes.
pub const DEFAULT_WS_BUFFER: usize = 1024 * 1024;

/// Header carrying the single-use worker join token on `/register/{id}`.
pub const REGISTRATION_TOKEN_HEADER: &str = "X-Registration-Token";
