//! C4 — the health recorder: success/failure transitions under a per-provider lock.
//!
//! Structurally this is the same lazy `{id: mutex}`-map-behind-a-guard-mutex
//! pattern this codebase already uses for per-resource serialization; the
//! *policy* driving the transition is the simpler fixed-threshold
//! blacklist from SPEC_FULL §4.2 (no exponential backoff, no degraded
//! multiplier tier — a provider is either healthy or blacklisted until a
//! fixed deadline).

use std::collections::HashMap;
use std::sync::Arc;

use serde_json::json;
use tokio::sync::Mutex;

use crate::store::config_store::ConfigStore;
use crate::store::log_store::{LogLevel, LogStore};
use crate::store::StoreError;

/// Lazily-populated per-provider mutex map. The guard mutex is only ever
/// held long enough to look up or insert an `Arc<Mutex<()>>`; the actual
/// read-modify-write runs under the returned per-provider mutex, so
/// unrelated providers never serialize against each other.
struct LockMap {
    locks: Mutex<HashMap<i64, Arc<Mutex<()>>>>,
}

impl LockMap {
    fn new() -> Self {
        Self {
            locks: Mutex::new(HashMap::new()),
        }
    }

    async fn lock_for(&self, provider_id: i64) -> Arc<Mutex<()>> {
        let mut guard = self.locks.lock().await;
        guard
            .entry(provider_id)
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }
}

pub struct HealthRecorder {
    config_store: Arc<ConfigStore>,
    log_store: Arc<LogStore>,
    locks: LockMap,
}

impl HealthRecorder {
    pub fn new(config_store: Arc<ConfigStore>, log_store: Arc<LogStore>) -> Self {
        Self {
            config_store,
            log_store,
            locks: LockMap::new(),
        }
    }

    /// Record a successful forward. No lock is required for the reset-to-zero
    /// case (SPEC_FULL §4.2); the underlying store update is atomic on its own.
    pub async fn record_success(&self, provider_id: i64, now: i64) -> Result<(), StoreError> {
        let previous = self
            .config_store
            .reset_consecutive_failures_if_nonzero(provider_id)
            .await?;
        if let Some(previous_streak) = previous {
            let _ = self
                .log_store
                .create_system_log(
                    now,
                    LogLevel::Info,
                    "provider_recovered",
                    None,
                    &format!("provider recovered after {previous_streak} consecutive failure(s)"),
                    None,
                )
                .await;
        }
        Ok(())
    }

    /// Record a failed forward, serialized per provider (SPEC_FULL §4.2).
    pub async fn record_failure(&self, provider_id: i64, now: i64) -> Result<(), StoreError> {
        let lock = self.locks.lock_for(provider_id).await;
        let _guard = lock.lock().await;

        let state = match self.config_store.read_failure_state(provider_id).await? {
            Some(state) => state,
            None => return Ok(()),
        };

        // A late failure from a request issued before a blacklist trip must
        // not re-arm the counter.
        if state.blacklisted_until.is_some_and(|until| until > now) {
            return Ok(());
        }

        let new_failures = state.consecutive_failures + 1;
        let tripped = new_failures >= state.failure_threshold;
        let blacklisted_until = if tripped {
            Some(now + 60 * state.blacklist_minutes)
        } else {
            None
        };
        let stored_failures = if tripped { 0 } else { new_failures };

        self.config_store
            .apply_failure_transition(provider_id, stored_failures, blacklisted_until)
            .await?;

        let _ = self
            .log_store
            .create_system_log(
                now,
                LogLevel::Warn,
                "provider_failure",
                Some(&state.name),
                &format!("{new_failures}/{threshold}", threshold = state.failure_threshold),
                Some(json!({ "consecutive_failures": new_failures, "threshold": state.failure_threshold })),
            )
            .await;

        if tripped {
            let _ = self
                .log_store
                .create_system_log(
                    now,
                    LogLevel::Error,
                    "provider_blacklist",
                    Some(&state.name),
                    &format!("blacklisted for {} minute(s)", state.blacklist_minutes),
                    Some(json!({ "blacklisted_until": blacklisted_until })),
                )
                .await;
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::config_store::{NewProvider, TimeoutSettings};
    use std::sync::atomic::{AtomicI64, Ordering};

    async fn fixture(failure_threshold: i64) -> (HealthRecorder, Arc<ConfigStore>, i64) {
        let config_store = Arc::new(
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
            .unwrap(),
        );
        let log_store = Arc::new(LogStore::open(":memory:").await.unwrap());
        let id = config_store
            .insert_provider_for_test(NewProvider {
                failure_threshold,
                blacklist_minutes: 10,
                ..Default::default()
            })
            .await
            .unwrap();
        let recorder = HealthRecorder::new(config_store.clone(), log_store);
        (recorder, config_store, id)
    }

    #[tokio::test]
    async fn failures_below_threshold_increment_without_blacklisting() {
        let (recorder, store, id) = fixture(3).await;
        recorder.record_failure(id, 1_000).await.unwrap();
        recorder.record_failure(id, 1_001).await.unwrap();
        let p = store.get_provider(id).await.unwrap().unwrap();
        assert_eq!(p.consecutive_failures, 2);
        assert_eq!(p.blacklisted_until, None);
    }

    #[tokio::test]
    async fn nth_failure_trips_blacklist_and_resets_counter() {
        let (recorder, store, id) = fixture(3).await;
        recorder.record_failure(id, 1_000).await.unwrap();
        recorder.record_failure(id, 1_000).await.unwrap();
        recorder.record_failure(id, 1_000).await.unwrap();
        let p = store.get_provider(id).await.unwrap().unwrap();
        assert_eq!(p.consecutive_failures, 0);
        assert_eq!(p.blacklisted_until, Some(1_000 + 600));
    }

    #[tokio::test]
    async fn late_failure_after_blacklist_is_a_no_op() {
        let (recorder, store, id) = fixture(1).await;
        recorder.record_failure(id, 1_000).await.unwrap(); // trips immediately (threshold=1)
        let after_trip = store.get_provider(id).await.unwrap().unwrap();
        assert_eq!(after_trip.blacklisted_until, Some(1_000 + 600));

        recorder.record_failure(id, 1_050).await.unwrap(); // still within blacklist window
        let unchanged = store.get_provider(id).await.unwrap().unwrap();
        assert_eq!(unchanged.blacklisted_until, after_trip.blacklisted_until);
        assert_eq!(unchanged.consecutive_failures, 0);
    }

    #[tokio::test]
    async fn success_resets_nonzero_streak() {
        let (recorder, store, id) = fixture(5).await;
        recorder.record_failure(id, 1_000).await.unwrap();
        recorder.record_failure(id, 1_000).await.unwrap();
        recorder.record_success(id, 1_000).await.unwrap();
        let p = store.get_provider(id).await.unwrap().unwrap();
        assert_eq!(p.consecutive_failures, 0);
    }

    #[tokio::test]
    async fn concurrent_failures_serialize_and_sum_to_n() {
        let (recorder, store, id) = fixture(1000).await;
        let recorder = Arc::new(recorder);
        let now = Arc::new(AtomicI64::new(1_000));
        let mut handles = Vec::new();
        for _ in 0..50 {
            let recorder = recorder.clone();
            let now = now.clone();
            handles.push(tokio::spawn(async move {
                recorder
                    .record_failure(id, now.load(Ordering::SeqCst))
                    .await
                    .unwrap();
            }));
        }
        for h in handles {
            h.await.unwrap();
        }
        let p = store.get_provider(id).await.unwrap().unwrap();
        assert_eq!(p.consecutive_failures, 50);
        assert_eq!(p.blacklisted_until, None);
    }
}
