//! The broker's in-memory registries.
//!
//! Four small, independently lockable structures (injected explicitly into
//! handlers through [`crate::state::AppState`] so tests can build each in
//! isolation):
//!
//! - [`worker::Worker`] — one handle per connected worker, owned by its
//!   session;
//! - [`models::ModelRegistry`] — model name → advertising workers, pruned on
//!   access;
//! - [`fingerprints::FingerprintRegistry`] — per-request lifecycle, also the
//!   source of truth for min-conn counting;
//! - [`responses::ResponseRouter`] — per-fingerprint readiness handles that
//!   deliver the response channel to the waiting dispatcher;
//! - [`balancer::Balancer`] — selection policy over pruned candidates.
//!
//! None of these locks is ever held across another; see the relay code in
//! `crate::dispatch` for the ordering.

pub mod balancer;
pub mod fingerprints;
pub mod models;
pub mod responses;
pub mod worker;
