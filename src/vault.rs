//! Wires the persistence services together for one store.
//!
//! Every service is built once in [`Vault::open`] and shared by handle; nothing
//! in the crate reaches for global state.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::config::StoreConfig;
use crate::error::KeySlotError;
use crate::fingerprint::DeviceSignals;
use crate::integrity::{IntegrityManager, IntegrityObserver};
use crate::keys::{select_hasher, KeyDerivationService, KeyScheme};
use crate::medium::KeyValueMedium;
use crate::payload::{now_millis, MigrationRegistry, Payload};
use crate::recovery::RecoveryManager;
use crate::storage::{StorageAdapter, WriteOutcome};
use crate::transfer::ExportImportManager;

/// Highest schema version that has ever opened this store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SchemaLedger {
    pub schema_version: u32,
    pub updated_at: i64,
}

pub struct Vault {
    config: StoreConfig,
    storage: StorageAdapter,
    keys: Arc<KeyDerivationService>,
    integrity: Arc<IntegrityManager>,
    recovery: RecoveryManager,
    transfer: ExportImportManager,
}

impl Vault {
    pub async fn open(
        config: StoreConfig,
        medium: Box<dyn KeyValueMedium>,
        signals: Arc<dyn DeviceSignals>,
    ) -> crate::Result<Self> {
        config.validate()?;

        let migrations = MigrationRegistry::standard();
        if !migrations.reaches(config.schema_version) {
            return Err(KeySlotError::Configuration(format!(
                "no migration path from v1 to schema v{}",
                config.schema_version
            )));
        }
        let storage = StorageAdapter::new(medium, migrations.clone(), config.schema_version);
        let keys = Arc::new(KeyDerivationService::new(
            signals,
            select_hasher(config.secure_digest),
            KeyScheme::new(config.prefix.clone()),
            config.schema_version,
        ));

        let integrity = Arc::new(IntegrityManager::new(
            storage.clone(),
            keys.clone(),
            config.purposes.clone(),
            config.primary_purpose.clone(),
            config.orphan_cap,
        ));
        let recovery = RecoveryManager::new(
            storage.clone(),
            keys.clone(),
            config.purposes.clone(),
            config.primary_purpose.clone(),
        );
        let transfer = ExportImportManager::new(
            storage.clone(),
            keys.clone(),
            migrations,
            config.primary_purpose.clone(),
        );

        let vault = Self {
            config,
            storage,
            keys,
            integrity,
            recovery,
            transfer,
        };
        vault.advance_schema_ledger().await?;
        info!(prefix = %vault.config.prefix, schema = vault.config.schema_version, "store opened");
        Ok(vault)
    }

    /// Refuses to run an older schema against a store a newer build has touched.
    async fn advance_schema_ledger(&self) -> crate::Result<()> {
        let meta_key = self.keys.scheme().meta();
        let configured = self.config.schema_version;
        let recorded = self.storage.read_json::<SchemaLedger>(&meta_key).await;

        match recorded {
            Some(ledger) if ledger.schema_version > configured => {
                return Err(KeySlotError::SchemaDowngrade {
                    recorded: ledger.schema_version,
                    configured,
                });
            }
            Some(ledger) if ledger.schema_version == configured => {
                debug!(schema = configured, "schema ledger up to date");
                return Ok(());
            }
            _ => {}
        }

        let ledger = SchemaLedger {
            schema_version: configured,
            updated_at: now_millis(),
        };
        if !self.storage.write_json(&meta_key, &ledger).await.is_written() {
            warn!(key = %meta_key, "could not record schema version");
        }
        Ok(())
    }

    /// Hydrates the primary payload, recovering it from an older key if the
    /// current one is empty.
    pub async fn load(&self) -> Option<Payload> {
        let key = self.current_key();
        if let Some(payload) = self.storage.get(&key).await {
            return Some(payload);
        }
        let outcome = self.recovery.attempt_data_recovery().await;
        if outcome.recovered {
            self.storage.get(&key).await
        } else {
            None
        }
    }

    pub async fn save(&self, payload: &Payload) -> WriteOutcome {
        self.storage.set(&self.current_key(), payload).await
    }

    pub async fn update_field(&self, name: &str, value: Value) -> WriteOutcome {
        let name = name.to_string();
        self.storage
            .update(&self.current_key(), move |existing| {
                Some(existing.unwrap_or_default().with_field(name, value))
            })
            .await
    }

    /// Drops cached keys so the next access re-reads the device. Returns the
    /// freshly derived primary key.
    pub fn reset_identity(&self) -> String {
        self.keys.clear_cache();
        let key = self.current_key();
        info!(key = %key, "storage identity re-derived");
        key
    }

    pub fn start_integrity_schedule(&self, observer: Arc<dyn IntegrityObserver>) -> JoinHandle<()> {
        self.integrity
            .clone()
            .spawn_schedule(self.config.initial_delay(), self.config.interval(), observer)
    }

    pub fn current_key(&self) -> String {
        self.keys.derive_key(&self.config.primary_purpose)
    }

    pub fn config(&self) -> &StoreConfig {
        &self.config
    }

    pub fn storage(&self) -> &StorageAdapter {
        &self.storage
    }

    pub fn keys(&self) -> &Arc<KeyDerivationService> {
        &self.keys
    }

    pub fn integrity(&self) -> &Arc<IntegrityManager> {
        &self.integrity
    }

    pub fn recovery(&self) -> &RecoveryManager {
        &self.recovery
    }

    pub fn transfer(&self) -> &ExportImportManager {
        &self.transfer
    }
}
