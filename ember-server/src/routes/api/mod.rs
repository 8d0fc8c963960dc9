//! Account, marketplace, and ledger routes under `/api`.

pub mod auth;
pub mod keys;
pub mod market;
pub mod token;
pub mod usage;
