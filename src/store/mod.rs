//! Durable state, split into two independent SQLite-backed stores.
//!
//! [`config_store`] owns `Provider`/`ModelMap`/`TimeoutSettings`/`GatewaySettings` —
//! read-mostly, written only by the admin facade and by health transitions.
//! [`log_store`] owns `RequestLog`/`SystemLog`/`UsageDaily` — write-heavy,
//! append-only. The two never share a connection or a transaction; a
//! completely separate SQLite file backs each, matching SPEC_FULL §5.

pub mod config_store;
pub mod log_store;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("task join error: {0}")]
    Join(#[from] tokio::task::JoinError),
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
}
