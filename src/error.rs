use thiserror::Error;

#[derive(Error, Debug)]
pub enum KeySlotError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Storage quota exceeded: {0}")]
    QuotaExceeded(String),

    #[error("Corrupt entry {key}: {reason}")]
    CorruptEntry { key: String, reason: String },

    #[error("Device fingerprint unavailable: {0}")]
    FingerprintUnavailable(String),

    #[error("Invalid import bundle: {0}")]
    ImportValidation(String),

    #[error("Nothing to export: no data stored under {0}")]
    NothingToExport(String),

    #[error("Migration error: {0}")]
    Migration(String),

    #[error("Store was written by schema v{recorded}, refusing to open with v{configured}")]
    SchemaDowngrade { recorded: u32, configured: u32 },

    #[error("File system error: {0}")]
    FileSystem(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Configuration error: {0}")]
    Configuration(String),
}

impl KeySlotError {
    /// Short log category used in structured storage diagnostics.
    pub fn category(&self) -> &'static str {
        match self {
            KeySlotError::QuotaExceeded(_) => "quota",
            KeySlotError::CorruptEntry { .. } | KeySlotError::Serialization(_) => "parse",
            KeySlotError::Migration(_) => "migration",
            KeySlotError::Io(_) | KeySlotError::FileSystem(_) | KeySlotError::Storage(_) => "io",
            _ => "other",
        }
    }
}
