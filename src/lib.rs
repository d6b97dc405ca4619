pub mod config;
pub mod error;
pub mod fingerprint;
pub mod integrity;
pub mod keys;
pub mod medium;
pub mod payload;
pub mod recovery;
pub mod storage;
pub mod transfer;
pub mod vault;

pub use config::StoreConfig;
pub use error::KeySlotError;
pub use fingerprint::{DeviceSignals, Fingerprint, FingerprintCollector, FixedSignals, SignalValues, SystemSignals};
pub use integrity::{IntegrityManager, IntegrityObserver, IntegrityReport, LogObserver, PurgeOutcome};
pub use keys::{KeyDerivationService, KeyKind, KeyScheme};
pub use medium::{FileMedium, KeyValueMedium, MemoryMedium};
pub use payload::{MigrationRegistry, Payload, CURRENT_SCHEMA_VERSION};
pub use recovery::{RecoveryManager, RecoveryOutcome};
pub use storage::{CompareOutcome, StorageAdapter, StorageEntry, WriteOutcome};
pub use transfer::{ExportBundle, ExportImportManager};
pub use vault::Vault;

/// Re-export commonly used types
pub type Result<T> = std::result::Result<T, KeySlotError>;
