//! C1 — the config store: `Provider`, `ModelMap`, `TimeoutSettings`, `GatewaySettings`.
//!
//! A single `rusqlite::Connection` behind a `tokio::sync::Mutex`, accessed
//! through `spawn_blocking` for every query, mirroring this codebase's
//! existing SQLite access pattern (see the sibling mission store). The
//! connection is intentionally single — this store is read-mostly and the
//! per-provider locking that matters for correctness lives one layer up, in
//! [`crate::health`].

use std::path::Path;
use std::sync::Arc;

use rusqlite::{params, Connection, OptionalExtension};
use tokio::sync::Mutex;

use super::StoreError;
use crate::cli::CliVariant;

const SCHEMA: &str = r#"
PRAGMA journal_mode = WAL;
PRAGMA foreign_keys = ON;

CREATE TABLE IF NOT EXISTS providers (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    cli_type TEXT NOT NULL,
    name TEXT NOT NULL,
    base_url TEXT NOT NULL,
    api_key TEXT NOT NULL,
    enabled INTEGER NOT NULL DEFAULT 1,
    failure_threshold INTEGER NOT NULL DEFAULT 3,
    blacklist_minutes INTEGER NOT NULL DEFAULT 10,
    consecutive_failures INTEGER NOT NULL DEFAULT 0,
    blacklisted_until INTEGER,
    sort_order INTEGER NOT NULL DEFAULT 0,
    UNIQUE(cli_type, name)
);

CREATE TABLE IF NOT EXISTS model_maps (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    provider_id INTEGER NOT NULL REFERENCES providers(id) ON DELETE CASCADE,
    source_model TEXT NOT NULL,
    target_model TEXT NOT NULL,
    enabled INTEGER NOT NULL DEFAULT 1,
    UNIQUE(provider_id, source_model)
);

CREATE INDEX IF NOT EXISTS idx_model_maps_provider ON model_maps(provider_id, id);

CREATE TABLE IF NOT EXISTS timeout_settings (
    id INTEGER PRIMARY KEY CHECK (id = 1),
    stream_first_byte_timeout INTEGER NOT NULL,
    stream_idle_timeout INTEGER NOT NULL,
    non_stream_timeout INTEGER NOT NULL
);

CREATE TABLE IF NOT EXISTS gateway_settings (
    id INTEGER PRIMARY KEY CHECK (id = 1),
    debug_log INTEGER NOT NULL
);
"#;

#[derive(Debug, Clone, PartialEq)]
pub struct Provider {
    pub id: i64,
    pub cli_type: CliVariant,
    pub name: String,
    pub base_url: String,
    pub api_key: String,
    pub enabled: bool,
    pub failure_threshold: i64,
    pub blacklist_minutes: i64,
    pub consecutive_failures: i64,
    pub blacklisted_until: Option<i64>,
    pub sort_order: i64,
}

impl Provider {
    /// `blacklisted_until` is set and strictly greater than `now` (epoch seconds).
    pub fn is_blacklisted(&self, now: i64) -> bool {
        self.blacklisted_until.is_some_and(|until| until > now)
    }

    pub fn remaining_blacklist_seconds(&self, now: i64) -> i64 {
        self.blacklisted_until.map(|until| until - now).unwrap_or(0).max(0)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ModelMap {
    pub id: i64,
    pub provider_id: i64,
    pub source_model: String,
    pub target_model: String,
    pub enabled: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimeoutSettings {
    pub stream_first_byte_timeout: u64,
    pub stream_idle_timeout: u64,
    pub non_stream_timeout: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GatewaySettings {
    pub debug_log: bool,
}

/// Re-read snapshot used by the health recorder's failure transition (SPEC_FULL §4.2).
#[derive(Debug, Clone)]
pub struct FailureState {
    pub name: String,
    pub consecutive_failures: i64,
    pub failure_threshold: i64,
    pub blacklist_minutes: i64,
    pub blacklisted_until: Option<i64>,
}

pub struct ConfigStore {
    conn: Arc<Mutex<Connection>>,
}

impl ConfigStore {
    /// Open (creating if absent) the config database at `path`, running the
    /// schema, and seeding the `TimeoutSettings`/`GatewaySettings` singleton
    /// rows from `seed_timeouts`/`seed_debug_log` if they do not exist yet.
    pub async fn open(
        path: impl AsRef<Path>,
        seed_timeouts: TimeoutSettings,
        seed_debug_log: bool,
    ) -> Result<Self, StoreError> {
        let path = path.as_ref().to_path_buf();
        let conn = tokio::task::spawn_blocking(move || -> Result<Connection, StoreError> {
            let conn = Connection::open(path)?;
            conn.execute_batch(SCHEMA)?;
            conn.execute(
                "INSERT OR IGNORE INTO timeout_settings (id, stream_first_byte_timeout, stream_idle_timeout, non_stream_timeout)
                 VALUES (1, ?1, ?2, ?3)",
                params![
                    seed_timeouts.stream_first_byte_timeout as i64,
                    seed_timeouts.stream_idle_timeout as i64,
                    seed_timeouts.non_stream_timeout as i64,
                ],
            )?;
            conn.execute(
                "INSERT OR IGNORE INTO gateway_settings (id, debug_log) VALUES (1, ?1)",
                params![seed_debug_log as i64],
            )?;
            Ok(conn)
        })
        .await??;

        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    fn row_to_provider(row: &rusqlite::Row<'_>) -> rusqlite::Result<Provider> {
        let cli_type_str: String = row.get("cli_type")?;
        Ok(Provider {
            id: row.get("id")?,
            cli_type: CliVariant::from_str_opt(&cli_type_str).unwrap_or(CliVariant::A),
            name: row.get("name")?,
            base_url: row.get("base_url")?,
            api_key: row.get("api_key")?,
            enabled: row.get::<_, i64>("enabled")? != 0,
            failure_threshold: row.get("failure_threshold")?,
            blacklist_minutes: row.get("blacklist_minutes")?,
            consecutive_failures: row.get("consecutive_failures")?,
            blacklisted_until: row.get("blacklisted_until")?,
            sort_order: row.get("sort_order")?,
        })
    }

    /// List enabled providers for `cli_type`, ordered `(sort_order ASC, id ASC)` (SPEC_FULL §4.1).
    pub async fn list_providers(&self, cli_type: CliVariant) -> Result<Vec<Provider>, StoreError> {
        let conn = self.conn.clone();
        tokio::task::spawn_blocking(move || -> Result<Vec<Provider>, StoreError> {
            let conn = conn.blocking_lock();
            let mut stmt = conn.prepare(
                "SELECT id, cli_type, name, base_url, api_key, enabled, failure_threshold,
                        blacklist_minutes, consecutive_failures, blacklisted_until, sort_order
                 FROM providers
                 WHERE enabled = 1 AND cli_type = ?1
                 ORDER BY sort_order ASC, id ASC",
            )?;
            let rows = stmt
                .query_map(params![cli_type.as_str()], Self::row_to_provider)?
                .collect::<Result<Vec<_>, _>>()?;
            Ok(rows)
        })
        .await?
    }

    pub async fn get_provider(&self, id: i64) -> Result<Option<Provider>, StoreError> {
        let conn = self.conn.clone();
        tokio::task::spawn_blocking(move || -> Result<Option<Provider>, StoreError> {
            let conn = conn.blocking_lock();
            let provider = conn
                .query_row(
                    "SELECT id, cli_type, name, base_url, api_key, enabled, failure_threshold,
                            blacklist_minutes, consecutive_failures, blacklisted_until, sort_order
                     FROM providers WHERE id = ?1",
                    params![id],
                    Self::row_to_provider,
                )
                .optional()?;
            Ok(provider)
        })
        .await?
    }

    /// Enabled model maps for `provider_id`, in declaration order (`id ASC`),
    /// fixing the source system's iteration-order ambiguity (SPEC_FULL §9).
    pub async fn list_model_maps(&self, provider_id: i64) -> Result<Vec<ModelMap>, StoreError> {
        let conn = self.conn.clone();
        tokio::task::spawn_blocking(move || -> Result<Vec<ModelMap>, StoreError> {
            let conn = conn.blocking_lock();
            let mut stmt = conn.prepare(
                "SELECT id, provider_id, source_model, target_model, enabled
                 FROM model_maps WHERE provider_id = ?1 AND enabled = 1 ORDER BY id ASC",
            )?;
            let rows = stmt
                .query_map(params![provider_id], |row| {
                    Ok(ModelMap {
                        id: row.get(0)?,
                        provider_id: row.get(1)?,
                        source_model: row.get(2)?,
                        target_model: row.get(3)?,
                        enabled: row.get::<_, i64>(4)? != 0,
                    })
                })?
                .collect::<Result<Vec<_>, _>>()?;
            Ok(rows)
        })
        .await?
    }

    pub async fn get_timeout_settings(&self) -> Result<TimeoutSettings, StoreError> {
        let conn = self.conn.clone();
        tokio::task::spawn_blocking(move || -> Result<TimeoutSettings, StoreError> {
            let conn = conn.blocking_lock();
            let row = conn
                .query_row(
                    "SELECT stream_first_byte_timeout, stream_idle_timeout, non_stream_timeout
                     FROM timeout_settings WHERE id = 1",
                    [],
                    |row| {
                        Ok(TimeoutSettings {
                            stream_first_byte_timeout: row.get::<_, i64>(0)? as u64,
                            stream_idle_timeout: row.get::<_, i64>(1)? as u64,
                            non_stream_timeout: row.get::<_, i64>(2)? as u64,
                        })
                    },
                )
                .optional()?;
            Ok(row.unwrap_or(TimeoutSettings {
                stream_first_byte_timeout: 30,
                stream_idle_timeout: 60,
                non_stream_timeout: 120,
            }))
        })
        .await?
    }

    pub async fn get_gateway_settings(&self) -> Result<GatewaySettings, StoreError> {
        let conn = self.conn.clone();
        tokio::task::spawn_blocking(move || -> Result<GatewaySettings, StoreError> {
            let conn = conn.blocking_lock();
            let debug_log: Option<i64> = conn
                .query_row("SELECT debug_log FROM gateway_settings WHERE id = 1", [], |row| {
                    row.get(0)
                })
                .optional()?;
            Ok(GatewaySettings {
                debug_log: debug_log.unwrap_or(0) != 0,
            })
        })
        .await?
    }

    /// Re-read the fields the failure transition needs, for a fresh read
    /// under the per-provider lock (SPEC_FULL §4.2 step 1).
    pub async fn read_failure_state(&self, id: i64) -> Result<Option<FailureState>, StoreError> {
        let conn = self.conn.clone();
        tokio::task::spawn_blocking(move || -> Result<Option<FailureState>, StoreError> {
            let conn = conn.blocking_lock();
            let state = conn
                .query_row(
                    "SELECT name, consecutive_failures, failure_threshold, blacklist_minutes, blacklisted_until
                     FROM providers WHERE id = ?1",
                    params![id],
                    |row| {
                        Ok(FailureState {
                            name: row.get(0)?,
                            consecutive_failures: row.get(1)?,
                            failure_threshold: row.get(2)?,
                            blacklist_minutes: row.get(3)?,
                            blacklisted_until: row.get(4)?,
                        })
                    },
                )
                .optional()?;
            Ok(state)
        })
        .await?
    }

    /// Apply the computed failure transition (SPEC_FULL §4.2 steps 3-4).
    pub async fn apply_failure_transition(
        &self,
        id: i64,
        consecutive_failures: i64,
        blacklisted_until: Option<i64>,
    ) -> Result<(), StoreError> {
        let conn = self.conn.clone();
        tokio::task::spawn_blocking(move || -> Result<(), StoreError> {
            let conn = conn.blocking_lock();
            conn.execute(
                "UPDATE providers SET consecutive_failures = ?1, blacklisted_until = ?2 WHERE id = ?3",
                params![consecutive_failures, blacklisted_until, id],
            )?;
            Ok(())
        })
        .await?
    }

    /// Reset `consecutive_failures` to 0 if currently non-zero; returns the
    /// previous streak length when a reset actually happened.
    pub async fn reset_consecutive_failures_if_nonzero(
        &self,
        id: i64,
    ) -> Result<Option<i64>, StoreError> {
        let conn = self.conn.clone();
        tokio::task::spawn_blocking(move || -> Result<Option<i64>, StoreError> {
            let conn = conn.blocking_lock();
            let previous: Option<i64> = conn
                .query_row(
                    "SELECT consecutive_failures FROM providers WHERE id = ?1",
                    params![id],
                    |row| row.get(0),
                )
                .optional()?;
            let previous = match previous {
                Some(p) if p > 0 => p,
                _ => return Ok(None),
            };
            conn.execute(
                "UPDATE providers SET consecutive_failures = 0 WHERE id = ?1",
                params![id],
            )?;
            Ok(Some(previous))
        })
        .await?
    }

    /// Admin facade (C8): zero `consecutive_failures`.
    pub async fn reset_failures(&self, id: i64) -> Result<(), StoreError> {
        let conn = self.conn.clone();
        tokio::task::spawn_blocking(move || -> Result<(), StoreError> {
            let conn = conn.blocking_lock();
            conn.execute(
                "UPDATE providers SET consecutive_failures = 0 WHERE id = ?1",
                params![id],
            )?;
            Ok(())
        })
        .await?
    }

    /// Admin facade (C8): zero both `consecutive_failures` and `blacklisted_until`.
    pub async fn unblacklist(&self, id: i64) -> Result<(), StoreError> {
        let conn = self.conn.clone();
        tokio::task::spawn_blocking(move || -> Result<(), StoreError> {
            let conn = conn.blocking_lock();
            conn.execute(
                "UPDATE providers SET consecutive_failures = 0, blacklisted_until = NULL WHERE id = ?1",
                params![id],
            )?;
            Ok(())
        })
        .await?
    }

    /// Test/bootstrap helper: insert a provider row, returning its id.
    #[cfg(test)]
    pub async fn insert_provider_for_test(&self, p: NewProvider) -> Result<i64, StoreError> {
        let conn = self.conn.clone();
        tokio::task::spawn_blocking(move || -> Result<i64, StoreError> {
            let conn = conn.blocking_lock();
            conn.execute(
                "INSERT INTO providers (cli_type, name, base_url, api_key, enabled, failure_threshold, blacklist_minutes, consecutive_failures, blacklisted_until, sort_order)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
                params![
                    p.cli_type.as_str(),
                    p.name,
                    p.base_url,
                    p.api_key,
                    p.enabled as i64,
                    p.failure_threshold,
                    p.blacklist_minutes,
                    p.consecutive_failures,
                    p.blacklisted_until,
                    p.sort_order,
                ],
            )?;
            Ok(conn.last_insert_rowid())
        })
        .await?
    }
}

#[cfg(test)]
pub struct NewProvider {
    pub cli_type: CliVariant,
    pub name: String,
    pub base_url: String,
    pub api_key: String,
    pub enabled: bool,
    pub failure_threshold: i64,
    pub blacklist_minutes: i64,
    pub consecutive_failures: i64,
    pub blacklisted_until: Option<i64>,
    pub sort_order: i64,
}

#[cfg(test)]
impl Default for NewProvider {
    fn default() -> Self {
        Self {
            cli_type: CliVariant::A,
            name: "test-provider".to_string(),
            base_url: "http://localhost".to_string(),
            api_key: "secret".to_string(),
            enabled: true,
            failure_threshold: 3,
            blacklist_minutes: 10,
            consecutive_failures: 0,
            blacklisted_until: None,
            sort_order: 0,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn open_test_store() -> ConfigStore {
        ConfigStore::open(
            ":memory:",
            TimeoutSettings {
                stream_first_byte_timeout: 30,
                stream_idle_timeout: 60,
                non_stream_timeout: 120,
            },
            false,
        )
        .await
        .unwrap()
    }

    #[tokio::test]
    async fn seeds_default_settings() {
        let store = open_test_store().await;
        let timeouts = store.get_timeout_settings().await.unwrap();
        assert_eq!(timeouts.non_stream_timeout, 120);
        let settings = store.get_gateway_settings().await.unwrap();
        assert!(!settings.debug_log);
    }

    #[tokio::test]
    async fn list_providers_orders_by_sort_order_then_id() {
        let store = open_test_store().await;
        let p2 = store
            .insert_provider_for_test(NewProvider {
                name: "second".to_string(),
                sort_order: 1,
                ..Default::default()
            })
            .await
            .unwrap();
        let p1 = store
            .insert_provider_for_test(NewProvider {
                name: "first".to_string(),
                sort_order: 0,
                ..Default::default()
            })
            .await
            .unwrap();
        let providers = store.list_providers(CliVariant::A).await.unwrap();
        assert_eq!(providers.len(), 2);
        assert_eq!(providers[0].id, p1);
        assert_eq!(providers[1].id, p2);
    }

    #[tokio::test]
    async fn disabled_providers_are_invisible() {
        let store = open_test_store().await;
        store
            .insert_provider_for_test(NewProvider {
                enabled: false,
                ..Default::default()
            })
            .await
            .unwrap();
        let providers = store.list_providers(CliVariant::A).await.unwrap();
        assert!(providers.is_empty());
    }

    #[tokio::test]
    async fn unblacklist_clears_both_fields() {
        let store = open_test_store().await;
        let id = store
            .insert_provider_for_test(NewProvider {
                consecutive_failures: 2,
                blacklisted_until: Some(9_999_999_999),
                ..Default::default()
            })
            .await
            .unwrap();
        store.unblacklist(id).await.unwrap();
        let p = store.get_provider(id).await.unwrap().unwrap();
        assert_eq!(p.consecutive_failures, 0);
        assert_eq!(p.blacklisted_until, None);
    }
}
