use std::sync::Arc;

use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::sync::Mutex;
use tracing::{debug, warn};

use crate::error::KeySlotError;
use crate::keys::KeyScheme;
use crate::medium::KeyValueMedium;
use crate::payload::{extract_last_modified, now_millis, MigrationRegistry, Payload};

/// One stored value as seen by a namespace scan.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StorageEntry {
    pub key: String,
    pub raw_value: String,
    pub size_bytes: usize,
    pub last_modified: Option<i64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteOutcome {
    Written,
    /// The read-modify-write closure chose not to write.
    Skipped,
    /// The medium rejected the write; already logged.
    Failed,
}

impl WriteOutcome {
    pub fn is_written(self) -> bool {
        self == WriteOutcome::Written
    }
}

/// Result of a compare-and-act on one raw entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompareOutcome {
    Applied,
    /// The entry no longer holds the expected value; nothing was done.
    Changed,
    /// The medium refused; already logged.
    Failed,
}

/// Serialized façade over the medium. Every operation holds the one mutex for
/// its whole read-modify-write, so callers never observe a half-applied change.
/// Waiters are served in arrival order.
///
/// Expected failures are logged and swallowed: persistence is best effort.
#[derive(Clone)]
pub struct StorageAdapter {
    medium: Arc<Mutex<Box<dyn KeyValueMedium>>>,
    migrations: Arc<MigrationRegistry>,
    schema_version: u32,
}

impl StorageAdapter {
    pub fn new(medium: Box<dyn KeyValueMedium>, migrations: MigrationRegistry, schema_version: u32) -> Self {
        Self {
            medium: Arc::new(Mutex::new(medium)),
            migrations: Arc::new(migrations),
            schema_version,
        }
    }

    pub fn schema_version(&self) -> u32 {
        self.schema_version
    }

    pub fn decode(&self, raw: &str) -> crate::Result<Payload> {
        Payload::decode(raw, &self.migrations, self.schema_version)
    }

    pub fn decode_value(&self, value: serde_json::Value) -> crate::Result<Payload> {
        Payload::from_value(value, &self.migrations, self.schema_version)
    }

    pub async fn get(&self, key: &str) -> Option<Payload> {
        let medium = self.medium.lock().await;
        self.read_payload(medium.as_ref(), key)
    }

    pub async fn set(&self, key: &str, payload: &Payload) -> WriteOutcome {
        let mut medium = self.medium.lock().await;
        self.write_payload(medium.as_mut(), key, payload.clone())
    }

    /// Returns false when the medium refused the removal.
    pub async fn remove(&self, key: &str) -> bool {
        let mut medium = self.medium.lock().await;
        match medium.remove(key) {
            Ok(()) => true,
            Err(e) => {
                warn!(key, category = e.category(), error = %e, "failed to remove entry");
                false
            }
        }
    }

    /// Whether anything, readable or not, is stored under `key`.
    pub async fn contains(&self, key: &str) -> bool {
        let medium = self.medium.lock().await;
        match medium.get(key) {
            Ok(raw) => raw.is_some(),
            Err(e) => {
                warn!(key, category = e.category(), error = %e, "failed to read entry");
                false
            }
        }
    }

    /// Reads, transforms and writes back under a single lock acquisition.
    /// `f` returns `None` to leave the entry as it is.
    pub async fn update<F>(&self, key: &str, f: F) -> WriteOutcome
    where
        F: FnOnce(Option<Payload>) -> Option<Payload>,
    {
        let mut medium = self.medium.lock().await;
        let current = self.read_payload(medium.as_ref(), key);
        match f(current) {
            Some(next) => self.write_payload(medium.as_mut(), key, next),
            None => WriteOutcome::Skipped,
        }
    }

    /// Snapshot of every entry inside `scheme`'s namespace, ordered by key.
    pub async fn entries(&self, scheme: &KeyScheme) -> Vec<StorageEntry> {
        let medium = self.medium.lock().await;
        let mut keys = match medium.keys() {
            Ok(keys) => keys,
            Err(e) => {
                warn!(category = e.category(), error = %e, "failed to enumerate keys");
                return Vec::new();
            }
        };
        keys.retain(|k| scheme.contains(k));
        keys.sort();

        let mut entries = Vec::with_capacity(keys.len());
        for key in keys {
            match medium.get(&key) {
                Ok(Some(raw_value)) => entries.push(StorageEntry {
                    size_bytes: key.len() + raw_value.len(),
                    last_modified: extract_last_modified(&raw_value),
                    key,
                    raw_value,
                }),
                Ok(None) => {}
                Err(e) => warn!(key = %key, category = e.category(), error = %e, "failed to read entry"),
            }
        }
        entries
    }

    /// Deletes `key` only if it still holds `expected_raw`.
    pub async fn remove_if_unchanged(&self, key: &str, expected_raw: &str) -> CompareOutcome {
        let mut medium = self.medium.lock().await;
        if let Some(changed) = check_unchanged(medium.as_ref(), key, expected_raw) {
            return changed;
        }
        match medium.remove(key) {
            Ok(()) => CompareOutcome::Applied,
            Err(e) => {
                warn!(key, category = e.category(), error = %e, "failed to remove entry");
                CompareOutcome::Failed
            }
        }
    }

    /// Overwrites `key` with `new_raw`, verbatim, only if it still holds `expected_raw`.
    pub async fn replace_if_unchanged(&self, key: &str, expected_raw: &str, new_raw: &str) -> CompareOutcome {
        let mut medium = self.medium.lock().await;
        if let Some(changed) = check_unchanged(medium.as_ref(), key, expected_raw) {
            return changed;
        }
        match store(medium.as_mut(), key, new_raw) {
            WriteOutcome::Written => CompareOutcome::Applied,
            _ => CompareOutcome::Failed,
        }
    }

    /// Typed access for records that are not payloads.
    pub async fn read_json<T: DeserializeOwned>(&self, key: &str) -> Option<T> {
        let medium = self.medium.lock().await;
        let raw = match medium.get(key) {
            Ok(raw) => raw?,
            Err(e) => {
                warn!(key, category = e.category(), error = %e, "failed to read entry");
                return None;
            }
        };
        match serde_json::from_str(&raw) {
            Ok(value) => Some(value),
            Err(e) => {
                warn!(key, category = "parse", error = %e, "unreadable record");
                None
            }
        }
    }

    pub async fn write_json<T: Serialize>(&self, key: &str, value: &T) -> WriteOutcome {
        let mut medium = self.medium.lock().await;
        match serde_json::to_string(value) {
            Ok(raw) => store(medium.as_mut(), key, &raw),
            Err(e) => {
                warn!(key, category = "parse", error = %e, "failed to encode record");
                WriteOutcome::Failed
            }
        }
    }

    fn read_payload(&self, medium: &dyn KeyValueMedium, key: &str) -> Option<Payload> {
        let raw = match medium.get(key) {
            Ok(raw) => raw?,
            Err(e) => {
                warn!(key, category = e.category(), error = %e, "failed to read entry");
                return None;
            }
        };
        let decoded = self.decode(&raw).map_err(|e| KeySlotError::CorruptEntry {
            key: key.to_string(),
            reason: e.to_string(),
        });
        match decoded {
            Ok(payload) => Some(payload),
            Err(e) => {
                warn!(key, category = e.category(), error = %e, "unreadable payload");
                None
            }
        }
    }

    fn write_payload(&self, medium: &mut dyn KeyValueMedium, key: &str, mut payload: Payload) -> WriteOutcome {
        payload.last_modified = Some(now_millis());
        if payload.schema_version.is_none() {
            payload.schema_version = Some(self.schema_version);
        }
        match payload.encode() {
            Ok(raw) => store(medium, key, &raw),
            Err(e) => {
                warn!(key, category = "parse", error = %e, "failed to encode payload");
                WriteOutcome::Failed
            }
        }
    }
}

// `None` when `key` still holds `expected_raw`.
fn check_unchanged(medium: &dyn KeyValueMedium, key: &str, expected_raw: &str) -> Option<CompareOutcome> {
    match medium.get(key) {
        Ok(Some(raw)) if raw == expected_raw => None,
        Ok(_) => {
            debug!(key, "entry changed since scan, leaving it");
            Some(CompareOutcome::Changed)
        }
        Err(e) => {
            warn!(key, category = e.category(), error = %e, "failed to read entry");
            Some(CompareOutcome::Failed)
        }
    }
}

fn store(medium: &mut dyn KeyValueMedium, key: &str, raw: &str) -> WriteOutcome {
    match medium.set(key, raw) {
        Ok(()) => WriteOutcome::Written,
        Err(e @ KeySlotError::QuotaExceeded(_)) => {
            warn!(key, category = "quota", bytes = raw.len(), error = %e, "write rejected, keeping in-memory state only");
            WriteOutcome::Failed
        }
        Err(e) => {
            warn!(key, category = e.category(), error = %e, "write failed");
            WriteOutcome::Failed
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::medium::MemoryMedium;
    use serde_json::json;

    fn adapter(medium: MemoryMedium) -> StorageAdapter {
        StorageAdapter::new(Box::new(medium), MigrationRegistry::standard(), 2)
    }

    #[tokio::test]
    async fn test_set_get_remove() {
        let storage = adapter(MemoryMedium::new());
        let payload = Payload::new().with_field("theme", json!("dark"));

        assert_eq!(storage.set("k", &payload).await, WriteOutcome::Written);
        let stored = storage.get("k").await.unwrap();
        assert_eq!(stored.field("theme"), Some(&json!("dark")));
        assert!(stored.last_modified.is_some());
        assert_eq!(stored.schema_version, Some(2));

        storage.remove("k").await;
        assert!(storage.get("k").await.is_none());
    }

    #[tokio::test]
    async fn test_unparseable_value_reads_as_none() {
        let storage = adapter(MemoryMedium::with_entries([("k", "not valid json{")]));
        assert!(storage.get("k").await.is_none());
    }

    #[tokio::test]
    async fn test_quota_failure_is_swallowed() {
        let storage = adapter(MemoryMedium::with_capacity(64));
        let big = Payload::new().with_field("blob", json!("x".repeat(200)));
        assert_eq!(storage.set("k", &big).await, WriteOutcome::Failed);
        assert!(storage.get("k").await.is_none());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_sets_never_interleave() {
        let storage = adapter(MemoryMedium::new());
        let a = Payload::new().with_field("owner", json!("a")).with_field("blob", json!("a".repeat(4096)));
        let b = Payload::new().with_field("owner", json!("b")).with_field("blob", json!("b".repeat(4096)));

        let (s1, s2) = (storage.clone(), storage.clone());
        let (pa, pb) = (a.clone(), b.clone());
        let t1 = tokio::spawn(async move { s1.set("k", &pa).await });
        let t2 = tokio::spawn(async move { s2.set("k", &pb).await });
        assert!(t1.await.unwrap().is_written());
        assert!(t2.await.unwrap().is_written());

        let stored = storage.get("k").await.unwrap();
        assert!(stored.fields == a.fields || stored.fields == b.fields);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_updates_are_serialized() {
        let storage = adapter(MemoryMedium::new());
        let mut handles = Vec::new();
        for _ in 0..50 {
            let storage = storage.clone();
            handles.push(tokio::spawn(async move {
                storage
                    .update("counter", |current| {
                        let n = current
                            .and_then(|p| p.field("n").and_then(|v| v.as_u64()))
                            .unwrap_or(0);
                        Some(Payload::new().with_field("n", json!(n + 1)))
                    })
                    .await
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }
        let stored = storage.get("counter").await.unwrap();
        assert_eq!(stored.field("n"), Some(&json!(50)));
    }

    #[tokio::test]
    async fn test_entries_are_namespaced_and_sorted() {
        let storage = adapter(MemoryMedium::with_entries([
            ("pwgen-store-v2-bb", r#"{"lastModified":2}"#),
            ("pwgen-store", r#"{"x":1}"#),
            ("unrelated", "{}"),
            ("pwgen-store-v2-aa", "broken"),
        ]));
        let entries = storage.entries(&KeyScheme::new("pwgen-store")).await;
        let keys: Vec<&str> = entries.iter().map(|e| e.key.as_str()).collect();
        assert_eq!(keys, vec!["pwgen-store", "pwgen-store-v2-aa", "pwgen-store-v2-bb"]);
        assert_eq!(entries[2].last_modified, Some(2));
        assert_eq!(entries[1].last_modified, None);
        assert_eq!(entries[1].size_bytes, "pwgen-store-v2-aa".len() + "broken".len());
    }

    #[tokio::test]
    async fn test_remove_if_unchanged() {
        let storage = adapter(MemoryMedium::with_entries([("k", "old")]));
        assert_eq!(storage.remove_if_unchanged("k", "other").await, CompareOutcome::Changed);
        assert!(storage.contains("k").await);
        assert_eq!(storage.remove_if_unchanged("k", "old").await, CompareOutcome::Applied);
        assert!(!storage.contains("k").await);
        assert_eq!(storage.remove_if_unchanged("k", "old").await, CompareOutcome::Changed);
    }

    #[tokio::test]
    async fn test_replace_if_unchanged_writes_verbatim() {
        let storage = adapter(MemoryMedium::with_entries([("k", r#"{"lastModified":1.5}"#)]));
        assert_eq!(
            storage.replace_if_unchanged("k", "stale", r#"{"lastModified":1}"#).await,
            CompareOutcome::Changed
        );
        assert_eq!(
            storage
                .replace_if_unchanged("k", r#"{"lastModified":1.5}"#, r#"{"lastModified":1}"#)
                .await,
            CompareOutcome::Applied
        );
        assert_eq!(storage.get("k").await.unwrap().last_modified, Some(1));
    }

    #[tokio::test]
    async fn test_failed_removal_is_reported() {
        let storage = StorageAdapter::new(
            Box::new(RefusingMedium(MemoryMedium::with_entries([("k", "v")]))),
            MigrationRegistry::standard(),
            2,
        );
        assert!(!storage.remove("k").await);
        assert_eq!(storage.remove_if_unchanged("k", "v").await, CompareOutcome::Failed);
        assert!(storage.contains("k").await);
    }

    /// Accepts reads and writes but refuses every removal.
    struct RefusingMedium(MemoryMedium);

    impl KeyValueMedium for RefusingMedium {
        fn get(&self, key: &str) -> crate::Result<Option<String>> {
            self.0.get(key)
        }

        fn set(&mut self, key: &str, value: &str) -> crate::Result<()> {
            self.0.set(key, value)
        }

        fn remove(&mut self, _key: &str) -> crate::Result<()> {
            Err(KeySlotError::FileSystem("disk full".to_string()))
        }

        fn keys(&self) -> crate::Result<Vec<String>> {
            self.0.keys()
        }
    }
}
