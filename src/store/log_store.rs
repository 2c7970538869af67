//! C2 — the log/stats store: `RequestLog`, `SystemLog`, `UsageDaily`.
//!
//! Append-only and write-heavy; kept on its own SQLite connection/file so
//! that log writes never compete with (or block behind) the config store's
//! transactions (SPEC_FULL §3, §5). Every write here is best-effort from the
//! caller's point of view — the forwarder logs and discards failures rather
//! than letting them turn a successful forward into a failed response.

use std::path::Path;
use std::sync::Arc;

use rusqlite::{params, Connection};
use serde_json::Value;
use tokio::sync::Mutex;

use super::StoreError;

const SCHEMA: &str = r#"
PRAGMA journal_mode = WAL;

CREATE TABLE IF NOT EXISTS request_logs (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    created_at INTEGER NOT NULL,
    cli_type TEXT NOT NULL,
    provider_name TEXT NOT NULL,
    model_id TEXT,
    success INTEGER NOT NULL,
    status_code INTEGER,
    elapsed_ms INTEGER NOT NULL,
    input_tokens INTEGER NOT NULL DEFAULT 0,
    output_tokens INTEGER NOT NULL DEFAULT 0,
    client_method TEXT NOT NULL,
    client_path TEXT NOT NULL,
    client_headers TEXT,
    client_body TEXT,
    forward_url TEXT,
    forward_headers TEXT,
    forward_body TEXT,
    provider_status INTEGER,
    response_body TEXT,
    error_message TEXT
);

CREATE INDEX IF NOT EXISTS idx_request_logs_created_at ON request_logs(created_at DESC);

CREATE TABLE IF NOT EXISTS system_logs (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    created_at INTEGER NOT NULL,
    level TEXT NOT NULL,
    event_type TEXT NOT NULL,
    provider_name TEXT,
    message TEXT NOT NULL,
    details TEXT
);

CREATE INDEX IF NOT EXISTS idx_system_logs_created_at ON system_logs(created_at DESC);

CREATE TABLE IF NOT EXISTS usage_daily (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    usage_date TEXT NOT NULL,
    provider_name TEXT NOT NULL,
    cli_type TEXT NOT NULL,
    request_count INTEGER NOT NULL DEFAULT 0,
    success_count INTEGER NOT NULL DEFAULT 0,
    failure_count INTEGER NOT NULL DEFAULT 0,
    prompt_tokens INTEGER NOT NULL DEFAULT 0,
    completion_tokens INTEGER NOT NULL DEFAULT 0,
    UNIQUE(usage_date, provider_name, cli_type)
);
"#;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogLevel {
    Info,
    Warn,
    Error,
}

impl LogLevel {
    fn as_str(self) -> &'static str {
        match self {
            LogLevel::Info => "INFO",
            LogLevel::Warn => "WARN",
            LogLevel::Error => "ERROR",
        }
    }
}

/// Fields for a single request-log row. Constructed by the forwarder once a
/// request has run to completion (or been rejected before routing).
#[derive(Debug, Default)]
pub struct RequestLogEntry {
    pub cli_type: String,
    pub provider_name: String,
    pub model_id: Option<String>,
    pub success: bool,
    pub status_code: Option<u16>,
    pub elapsed_ms: u64,
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub client_method: String,
    pub client_path: String,
    pub client_headers: Option<String>,
    pub client_body: Option<String>,
    pub forward_url: Option<String>,
    pub forward_headers: Option<String>,
    pub forward_body: Option<String>,
    pub provider_status: Option<u16>,
    pub response_body: Option<String>,
    pub error_message: Option<String>,
}

#[derive(Debug, Clone)]
pub struct UsageDailyRow {
    pub usage_date: String,
    pub provider_name: String,
    pub cli_type: String,
    pub request_count: i64,
    pub success_count: i64,
    pub failure_count: i64,
    pub prompt_tokens: i64,
    pub completion_tokens: i64,
}

pub struct LogStore {
    conn: Arc<Mutex<Connection>>,
}

impl LogStore {
    pub async fn open(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let path = path.as_ref().to_path_buf();
        let conn = tokio::task::spawn_blocking(move || -> Result<Connection, StoreError> {
            let conn = Connection::open(path)?;
            conn.execute_batch(SCHEMA)?;
            Ok(conn)
        })
        .await??;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Persist a request-log row. Best-effort: callers swallow the error.
    pub async fn create_request_log(&self, now: i64, entry: RequestLogEntry) -> Result<(), StoreError> {
        let conn = self.conn.clone();
        tokio::task::spawn_blocking(move || -> Result<(), StoreError> {
            let conn = conn.blocking_lock();
            conn.execute(
                "INSERT INTO request_logs (
                    created_at, cli_type, provider_name, model_id, success, status_code, elapsed_ms,
                    input_tokens, output_tokens, client_method, client_path, client_headers, client_body,
                    forward_url, forward_headers, forward_body, provider_status, response_body, error_message
                 ) VALUES (?1,?2,?3,?4,?5,?6,?7,?8,?9,?10,?11,?12,?13,?14,?15,?16,?17,?18,?19)",
                params![
                    now,
                    entry.cli_type,
                    entry.provider_name,
                    entry.model_id,
                    entry.success as i64,
                    entry.status_code,
                    entry.elapsed_ms as i64,
                    entry.input_tokens as i64,
                    entry.output_tokens as i64,
                    entry.client_method,
                    entry.client_path,
                    entry.client_headers,
                    entry.client_body,
                    entry.forward_url,
                    entry.forward_headers,
                    entry.forward_body,
                    entry.provider_status,
                    entry.response_body,
                    entry.error_message,
                ],
            )?;
            Ok(())
        })
        .await?
    }

    /// Persist a structured system event. Best-effort: callers swallow the error.
    pub async fn create_system_log(
        &self,
        now: i64,
        level: LogLevel,
        event_type: &str,
        provider_name: Option<&str>,
        message: &str,
        details: Option<Value>,
    ) -> Result<(), StoreError> {
        let conn = self.conn.clone();
        let level = level.as_str();
        let event_type = event_type.to_string();
        let provider_name = provider_name.map(|s| s.to_string());
        let message = message.to_string();
        let details = details.map(|v| v.to_string());
        tokio::task::spawn_blocking(move || -> Result<(), StoreError> {
            let conn = conn.blocking_lock();
            conn.execute(
                "INSERT INTO system_logs (created_at, level, event_type, provider_name, message, details)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                params![now, level, event_type, provider_name, message, details],
            )?;
            Ok(())
        })
        .await?
    }

    /// Atomic daily-usage upsert (SPEC_FULL §3, ported 1:1 from the
    /// `INSERT ... ON CONFLICT DO UPDATE` pattern this system already uses
    /// for stats accounting).
    pub async fn record_usage(
        &self,
        usage_date: &str,
        provider_name: &str,
        cli_type: &str,
        success: bool,
        prompt_tokens: u64,
        completion_tokens: u64,
    ) -> Result<(), StoreError> {
        let conn = self.conn.clone();
        let usage_date = usage_date.to_string();
        let provider_name = provider_name.to_string();
        let cli_type = cli_type.to_string();
        let success_inc: i64 = if success { 1 } else { 0 };
        let failure_inc: i64 = if success { 0 } else { 1 };
        tokio::task::spawn_blocking(move || -> Result<(), StoreError> {
            let conn = conn.blocking_lock();
            conn.execute(
                "INSERT INTO usage_daily (usage_date, provider_name, cli_type, request_count, success_count, failure_count, prompt_tokens, completion_tokens)
                 VALUES (?1, ?2, ?3, 1, ?4, ?5, ?6, ?7)
                 ON CONFLICT (usage_date, provider_name, cli_type) DO UPDATE SET
                     request_count = request_count + 1,
                     success_count = success_count + ?4,
                     failure_count = failure_count + ?5,
                     prompt_tokens = prompt_tokens + ?6,
                     completion_tokens = completion_tokens + ?7",
                params![
                    usage_date,
                    provider_name,
                    cli_type,
                    success_inc,
                    failure_inc,
                    prompt_tokens as i64,
                    completion_tokens as i64,
                ],
            )?;
            Ok(())
        })
        .await?
    }

    #[cfg(test)]
    pub async fn read_usage_daily_for_test(
        &self,
        usage_date: &str,
        provider_name: &str,
        cli_type: &str,
    ) -> Result<Option<UsageDailyRow>, StoreError> {
        let conn = self.conn.clone();
        let usage_date = usage_date.to_string();
        let provider_name = provider_name.to_string();
        let cli_type = cli_type.to_string();
        tokio::task::spawn_blocking(move || -> Result<Option<UsageDailyRow>, StoreError> {
            use rusqlite::OptionalExtension;
            let conn = conn.blocking_lock();
            let row = conn
                .query_row(
                    "SELECT usage_date, provider_name, cli_type, request_count, success_count, failure_count, prompt_tokens, completion_tokens
                     FROM usage_daily WHERE usage_date = ?1 AND provider_name = ?2 AND cli_type = ?3",
                    params![usage_date, provider_name, cli_type],
                    |row| {
                        Ok(UsageDailyRow {
                            usage_date: row.get(0)?,
                            provider_name: row.get(1)?,
                            cli_type: row.get(2)?,
                            request_count: row.get(3)?,
                            success_count: row.get(4)?,
                            failure_count: row.get(5)?,
                            prompt_tokens: row.get(6)?,
                            completion_tokens: row.get(7)?,
                        })
                    },
                )
                .optional()?;
            Ok(row)
        })
        .await?
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn record_usage_upserts_atomically() {
        let store = LogStore::open(":memory:").await.unwrap();
        store
            .record_usage("2026-07-27", "P1", "claude_code", true, 17, 42)
            .await
            .unwrap();
        store
            .record_usage("2026-07-27", "P1", "claude_code", false, 0, 0)
            .await
            .unwrap();
        let row = store
            .read_usage_daily_for_test("2026-07-27", "P1", "claude_code")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(row.request_count, 2);
        assert_eq!(row.success_count, 1);
        assert_eq!(row.failure_count, 1);
        assert_eq!(row.prompt_tokens, 17);
        assert_eq!(row.completion_tokens, 42);
    }

    #[tokio::test]
    async fn create_system_log_roundtrips() {
        let store = LogStore::open(":memory:").await.unwrap();
        store
            .create_system_log(1, LogLevel::Warn, "provider_failure", Some("P1"), "1/3", None)
            .await
            .unwrap();
    }
}
