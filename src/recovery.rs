use std::sync::Arc;

use serde::Serialize;
use tracing::{debug, info, warn};

use crate::keys::{KeyDerivationService, KeyKind};
use crate::payload::{now_millis, Payload};
use crate::storage::{StorageAdapter, WriteOutcome};

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RecoveryOutcome {
    pub recovered: bool,
    pub data_found: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub recovered_from: Option<String>,
}

/// Repopulates an empty current key from the newest entry a previous
/// fingerprint left behind.
pub struct RecoveryManager {
    storage: StorageAdapter,
    keys: Arc<KeyDerivationService>,
    purposes: Vec<String>,
    primary_purpose: String,
}

impl RecoveryManager {
    pub fn new(
        storage: StorageAdapter,
        keys: Arc<KeyDerivationService>,
        purposes: Vec<String>,
        primary_purpose: String,
    ) -> Self {
        Self {
            storage,
            keys,
            purposes,
            primary_purpose,
        }
    }

    pub async fn attempt_data_recovery(&self) -> RecoveryOutcome {
        self.attempt_recovery_for(&self.primary_purpose).await
    }

    pub async fn attempt_recovery_for(&self, purpose: &str) -> RecoveryOutcome {
        let current_key = self.keys.derive_key(purpose);
        if self.storage.get(&current_key).await.is_some() {
            debug!(key = %current_key, "current key holds data, nothing to recover");
            return RecoveryOutcome {
                recovered: false,
                data_found: true,
                recovered_from: None,
            };
        }

        let Some((source_key, payload)) = self.newest_candidate().await else {
            info!(purpose, "no previous data found to recover");
            return RecoveryOutcome::default();
        };

        let from = source_key.clone();
        let outcome = self
            .storage
            .update(&current_key, move |existing| {
                if existing.is_some() {
                    return None;
                }
                let mut recovered = payload;
                recovered.recovered_at = Some(now_millis());
                recovered.recovered_from = Some(from);
                Some(recovered)
            })
            .await;

        match outcome {
            WriteOutcome::Written => {
                info!(from = %source_key, to = %current_key, "recovered data after fingerprint change");
                RecoveryOutcome {
                    recovered: true,
                    data_found: true,
                    recovered_from: Some(source_key),
                }
            }
            WriteOutcome::Skipped => {
                debug!(key = %current_key, "current key was written while recovering");
                RecoveryOutcome {
                    recovered: false,
                    data_found: true,
                    recovered_from: None,
                }
            }
            WriteOutcome::Failed => {
                warn!(from = %source_key, to = %current_key, "recovery candidate found but could not be written");
                RecoveryOutcome {
                    recovered: false,
                    data_found: true,
                    recovered_from: None,
                }
            }
        }
    }

    /// Greatest `lastModified` wins; ties and unknown timestamps go to the
    /// lexicographically smallest key.
    async fn newest_candidate(&self) -> Option<(String, Payload)> {
        let scheme = self.keys.scheme().clone();
        let current_keys = self.keys.current_keys(&self.purposes);
        let schema_version = self.storage.schema_version();

        let mut candidates: Vec<_> = self
            .storage
            .entries(&scheme)
            .await
            .into_iter()
            .filter(|entry| matches!(scheme.classify(&entry.key), Some(KeyKind::Versioned { .. })))
            .filter(|entry| !current_keys.contains(&entry.key))
            .filter_map(|entry| match self.storage.decode(&entry.raw_value) {
                Ok(payload) if payload.version() <= schema_version => Some((entry, payload)),
                Ok(payload) => {
                    debug!(key = %entry.key, version = payload.version(), "skipping candidate from a newer schema");
                    None
                }
                Err(_) => None,
            })
            .collect();

        candidates.sort_by(|(a, _), (b, _)| {
            b.last_modified
                .cmp(&a.last_modified)
                .then_with(|| a.key.cmp(&b.key))
        });
        if candidates.len() > 1 {
            debug!(count = candidates.len(), chosen = %candidates[0].0.key, "several recovery candidates");
        }
        candidates
            .into_iter()
            .next()
            .map(|(entry, payload)| (entry.key, payload))
    }
}
