use std::path::Path;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{info, warn};

use crate::error::KeySlotError;
use crate::keys::KeyDerivationService;
use crate::medium::atomic_write;
use crate::payload::{now_millis, MigrationRegistry, Payload};
use crate::storage::StorageAdapter;

/// Bundle format written by this version.
pub const EXPORT_FORMAT_VERSION: u32 = 1;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExportBundle {
    pub version: u32,
    pub exported_at: i64,
    pub fingerprint_id: String,
    #[serde(rename = "data")]
    pub payload: Payload,
}

pub struct ExportImportManager {
    storage: StorageAdapter,
    keys: Arc<KeyDerivationService>,
    migrations: MigrationRegistry,
    purpose: String,
}

impl ExportImportManager {
    pub fn new(
        storage: StorageAdapter,
        keys: Arc<KeyDerivationService>,
        migrations: MigrationRegistry,
        purpose: String,
    ) -> Self {
        Self {
            storage,
            keys,
            migrations,
            purpose,
        }
    }

    /// Fails when the current key holds nothing: an empty export is not useful.
    pub async fn export_user_data(&self) -> crate::Result<ExportBundle> {
        let key = self.keys.derive_key(&self.purpose);
        let payload = self
            .storage
            .get(&key)
            .await
            .ok_or_else(|| KeySlotError::NothingToExport(key.clone()))?;
        Ok(ExportBundle {
            version: EXPORT_FORMAT_VERSION,
            exported_at: now_millis(),
            fingerprint_id: self.keys.fingerprint_id(),
            payload,
        })
    }

    /// Checks a bundle read from outside before anything is written.
    pub fn validate_bundle(&self, bundle: &Value) -> crate::Result<ExportBundle> {
        let object = bundle
            .as_object()
            .ok_or_else(|| KeySlotError::ImportValidation("bundle is not a JSON object".to_string()))?;

        let version = object
            .get("version")
            .ok_or_else(|| KeySlotError::ImportValidation("missing version".to_string()))?
            .as_u64()
            .ok_or_else(|| KeySlotError::ImportValidation("version is not a positive integer".to_string()))?;
        if version == 0 || version > u64::from(EXPORT_FORMAT_VERSION) {
            return Err(KeySlotError::ImportValidation(format!(
                "unsupported bundle version {version}"
            )));
        }

        let data = object
            .get("data")
            .ok_or_else(|| KeySlotError::ImportValidation("missing data".to_string()))?;
        if !data.is_object() {
            return Err(KeySlotError::ImportValidation("data is not an object".to_string()));
        }
        let payload = Payload::from_value(data.clone(), &self.migrations, self.storage.schema_version())
            .map_err(|e| KeySlotError::ImportValidation(format!("data: {e}")))?;
        if payload.version() > self.storage.schema_version() {
            return Err(KeySlotError::ImportValidation(format!(
                "data was written by schema v{}, this build reads up to v{}",
                payload.version(),
                self.storage.schema_version()
            )));
        }

        Ok(ExportBundle {
            version: version as u32,
            exported_at: object.get("exportedAt").and_then(Value::as_i64).unwrap_or_default(),
            fingerprint_id: object
                .get("fingerprintId")
                .and_then(Value::as_str)
                .unwrap_or("unknown")
                .to_string(),
            payload,
        })
    }

    /// Returns false, without touching storage, when the bundle is malformed.
    pub async fn import_user_data(&self, bundle: &Value) -> bool {
        match self.validate_bundle(bundle) {
            Ok(bundle) => self.import_bundle(bundle).await,
            Err(e) => {
                warn!(error = %e, "rejected import bundle");
                false
            }
        }
    }

    /// Merges the bundle over the current payload; imported fields win.
    pub async fn import_bundle(&self, bundle: ExportBundle) -> bool {
        let key = self.keys.derive_key(&self.purpose);
        let source = bundle.fingerprint_id;
        let incoming = bundle.payload;
        let outcome = self
            .storage
            .update(&key, move |existing| {
                let mut merged = existing.unwrap_or_default();
                merged.merge_from(incoming);
                merged.imported_at = Some(now_millis());
                merged.imported_from = Some(source);
                Some(merged)
            })
            .await;
        if outcome.is_written() {
            info!(key = %key, "imported user data");
        }
        outcome.is_written()
    }

    pub async fn export_to_file(&self, path: &Path) -> crate::Result<ExportBundle> {
        let bundle = self.export_user_data().await?;
        let json = serde_json::to_string_pretty(&bundle)?;
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent).map_err(|e| KeySlotError::FileSystem(e.to_string()))?;
        }
        let target = if path.is_absolute() {
            path.to_path_buf()
        } else {
            std::env::current_dir()?.join(path)
        };
        atomic_write(&target, json.as_bytes())?;
        info!(path = %target.display(), "exported user data");
        Ok(bundle)
    }

    pub async fn import_from_file(&self, path: &Path) -> crate::Result<bool> {
        let data = std::fs::read_to_string(path).map_err(|e| KeySlotError::FileSystem(e.to_string()))?;
        let value: Value = serde_json::from_str(&data)
            .map_err(|e| KeySlotError::ImportValidation(format!("{}: {}", path.display(), e)))?;
        Ok(self.import_user_data(&value).await)
    }
}
