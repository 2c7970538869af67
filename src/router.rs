//! C3 — the router: pick the next eligible provider for a CLI variant.
//!
//! The selection read is a stateless snapshot over the config store; it
//! takes no lock of its own; two concurrent selections against the same
//! provider rows observe the same choice (SPEC_FULL §4.1, tested property 1).

use std::sync::Arc;

use serde_json::json;

use crate::cli::CliVariant;
use crate::store::config_store::{ConfigStore, Provider};
use crate::store::log_store::{LogLevel, LogStore};
use crate::store::StoreError;

pub struct Router {
    config_store: Arc<ConfigStore>,
    log_store: Arc<LogStore>,
}

impl Router {
    pub fn new(config_store: Arc<ConfigStore>, log_store: Arc<LogStore>) -> Self {
        Self {
            config_store,
            log_store,
        }
    }

    /// Select the highest-priority non-blacklisted enabled provider for `cli_type`.
    ///
    /// Returns `None` if no provider qualifies. When one or more providers
    /// were skipped for being blacklisted, best-effort emits a
    /// `provider_switch` INFO event; failure to log never blocks routing.
    pub async fn select(&self, cli_type: CliVariant, now: i64) -> Result<Option<Provider>, StoreError> {
        let candidates = self.config_store.list_providers(cli_type).await?;

        let mut skipped: Vec<(String, i64)> = Vec::new();
        let mut selected: Option<Provider> = None;
        for provider in candidates {
            if provider.is_blacklisted(now) {
                skipped.push((provider.name.clone(), provider.remaining_blacklist_seconds(now)));
                continue;
            }
            selected = Some(provider);
            break;
        }

        if let Some(provider) = &selected {
            if !skipped.is_empty() {
                let skipped_labels: Vec<String> = skipped
                    .iter()
                    .map(|(name, secs)| format!("{name}({secs}s)"))
                    .collect();
                let details = json!({ "skipped": skipped_labels, "selected": provider.name });
                // Best-effort: a logging failure must not affect routing.
                let _ = self
                    .log_store
                    .create_system_log(
                        now,
                        LogLevel::Info,
                        "provider_switch",
                        None,
                        &format!("switched past {} skipped provider(s)", skipped.len()),
                        Some(details),
                    )
                    .await;
            }
        }

        Ok(selected)
    }
}
