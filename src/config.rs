use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::KeySlotError;
use crate::payload::CURRENT_SCHEMA_VERSION;

/// Roughly what a browser grants a single origin.
pub const DEFAULT_CAPACITY_BYTES: usize = 5 * 1024 * 1024;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    /// Namespace shared by every key the core owns.
    pub prefix: String,
    pub schema_version: u32,
    /// Purposes whose current keys are protected from orphan eviction.
    pub purposes: Vec<String>,
    pub primary_purpose: String,
    pub orphan_cap: usize,
    /// When false, keys are derived with the non-cryptographic rolling hash.
    pub secure_digest: bool,
    pub capacity_bytes: Option<usize>,
    pub integrity_initial_delay_ms: u64,
    pub integrity_interval_secs: u64,
    pub data_dir: Option<PathBuf>,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            prefix: "pwgen-store".to_string(),
            schema_version: CURRENT_SCHEMA_VERSION,
            purposes: vec!["primary".to_string(), "backup".to_string()],
            primary_purpose: "primary".to_string(),
            orphan_cap: 10,
            secure_digest: true,
            capacity_bytes: Some(DEFAULT_CAPACITY_BYTES),
            integrity_initial_delay_ms: 2_000,
            integrity_interval_secs: 24 * 60 * 60,
            data_dir: None,
        }
    }
}

impl StoreConfig {
    /// Loads a JSON config file. Missing fields keep their defaults.
    pub fn load(path: &Path) -> crate::Result<Self> {
        let data = std::fs::read_to_string(path)
            .map_err(|e| KeySlotError::FileSystem(format!("{}: {}", path.display(), e)))?;
        let config: StoreConfig = serde_json::from_str(&data)
            .map_err(|e| KeySlotError::Configuration(format!("{}: {}", path.display(), e)))?;
        Ok(config)
    }

    /// Overlays `KEYSLOT_*` environment variables. Unparseable numbers are reported
    /// rather than silently ignored.
    pub fn apply_env(self) -> crate::Result<Self> {
        self.apply_vars(|name| std::env::var(name).ok())
    }

    fn apply_vars<F>(mut self, var: F) -> crate::Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(prefix) = var("KEYSLOT_PREFIX") {
            self.prefix = prefix;
        }
        if let Some(dir) = var("KEYSLOT_DATA_DIR") {
            self.data_dir = Some(PathBuf::from(dir));
        }
        if let Some(cap) = var("KEYSLOT_ORPHAN_CAP") {
            self.orphan_cap = cap
                .parse()
                .map_err(|_| KeySlotError::Configuration(format!("KEYSLOT_ORPHAN_CAP: not a number: {cap}")))?;
        }
        if let Some(flag) = var("KEYSLOT_SECURE_DIGEST") {
            self.secure_digest = match flag.to_ascii_lowercase().as_str() {
                "1" | "true" | "yes" | "on" => true,
                "0" | "false" | "no" | "off" => false,
                other => {
                    return Err(KeySlotError::Configuration(format!(
                        "KEYSLOT_SECURE_DIGEST: expected a boolean, got {other}"
                    )))
                }
            };
        }
        Ok(self)
    }

    pub fn validate(&self) -> crate::Result<()> {
        if self.prefix.is_empty() {
            return Err(KeySlotError::Configuration("prefix must not be empty".to_string()));
        }
        if self.prefix.chars().any(|c| c.is_whitespace() || c == '|') {
            return Err(KeySlotError::Configuration(format!(
                "prefix contains whitespace or '|': {:?}",
                self.prefix
            )));
        }
        if self.schema_version == 0 {
            return Err(KeySlotError::Configuration("schema_version starts at 1".to_string()));
        }
        if self.schema_version > CURRENT_SCHEMA_VERSION {
            return Err(KeySlotError::Configuration(format!(
                "schema_version {} is newer than this build supports (v{})",
                self.schema_version, CURRENT_SCHEMA_VERSION
            )));
        }
        if self.purposes.is_empty() {
            return Err(KeySlotError::Configuration("at least one purpose is required".to_string()));
        }
        if let Some(bad) = self.purposes.iter().find(|p| p.is_empty() || p.contains('|')) {
            return Err(KeySlotError::Configuration(format!("invalid purpose name: {bad:?}")));
        }
        if !self.purposes.contains(&self.primary_purpose) {
            return Err(KeySlotError::Configuration(format!(
                "primary purpose {:?} is not listed in purposes",
                self.primary_purpose
            )));
        }
        Ok(())
    }

    pub fn initial_delay(&self) -> Duration {
        Duration::from_millis(self.integrity_initial_delay_ms)
    }

    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.integrity_interval_secs.max(1))
    }

    pub fn data_file(&self) -> PathBuf {
        self.data_dir.clone().unwrap_or_else(default_data_dir).join("store.json")
    }
}

fn default_data_dir() -> PathBuf {
    let home = |var: &str| {
        std::env::var(var)
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("."))
    };
    if cfg!(target_os = "windows") {
        home("LOCALAPPDATA").join("keyslot")
    } else if cfg!(target_os = "macos") {
        home("HOME").join("Library/Application Support/keyslot")
    } else {
        home("HOME").join(".local/share/keyslot")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use tempfile::TempDir;

    #[test]
    fn test_defaults_are_valid() {
        let config = StoreConfig::default();
        config.validate().unwrap();
        assert_eq!(config.orphan_cap, 10);
        assert_eq!(config.interval(), Duration::from_secs(86_400));
    }

    #[test]
    fn test_partial_file_keeps_defaults() {
        let tmp_dir = TempDir::new().unwrap();
        let path = tmp_dir.path().join("keyslot.json");
        std::fs::write(&path, r#"{ "prefix": "custom", "orphan_cap": 3 }"#).unwrap();

        let config = StoreConfig::load(&path).unwrap();
        assert_eq!(config.prefix, "custom");
        assert_eq!(config.orphan_cap, 3);
        assert_eq!(config.primary_purpose, "primary");
    }

    #[test]
    fn test_env_overrides() {
        let vars: HashMap<&str, &str> = [
            ("KEYSLOT_PREFIX", "env-store"),
            ("KEYSLOT_ORPHAN_CAP", "4"),
            ("KEYSLOT_SECURE_DIGEST", "off"),
        ]
        .into_iter()
        .collect();
        let config = StoreConfig::default()
            .apply_vars(|name| vars.get(name).map(|v| v.to_string()))
            .unwrap();
        assert_eq!(config.prefix, "env-store");
        assert_eq!(config.orphan_cap, 4);
        assert!(!config.secure_digest);

        let err = StoreConfig::default()
            .apply_vars(|name| (name == "KEYSLOT_ORPHAN_CAP").then(|| "many".to_string()))
            .unwrap_err();
        assert!(matches!(err, KeySlotError::Configuration(_)));
    }

    #[test]
    fn test_validation_rejects_bad_values() {
        let mut config = StoreConfig::default();
        config.prefix = "has space".to_string();
        assert!(config.validate().is_err());

        let mut config = StoreConfig::default();
        config.primary_purpose = "missing".to_string();
        assert!(config.validate().is_err());

        let mut config = StoreConfig::default();
        config.purposes.push("a|b".to_string());
        assert!(config.validate().is_err());

        let mut config = StoreConfig::default();
        config.schema_version = CURRENT_SCHEMA_VERSION + 1;
        assert!(matches!(config.validate(), Err(KeySlotError::Configuration(_))));
    }
}
