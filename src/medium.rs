//! Raw string stores underneath the storage adapter.
//!
//! [`FileMedium`] does blocking file I/O inside `set` and `remove`, and the
//! adapter calls it while holding its async mutex on a runtime worker. Each
//! write rewrites the whole file, which stays cheap at the default 5 MiB
//! capacity; a much larger store should move these calls onto
//! `tokio::task::spawn_blocking`.

use std::collections::{BTreeMap, HashMap};
use std::fs;
use std::path::{Path, PathBuf};

use rand::{thread_rng, Rng};
use tracing::{info, warn};

use crate::error::KeySlotError;

/// The raw string-keyed, string-valued store underneath the core. No transactions;
/// writes may be rejected once the host's capacity is exhausted.
///
/// Only [`crate::storage::StorageAdapter`] talks to a medium directly.
pub trait KeyValueMedium: Send {
    fn get(&self, key: &str) -> crate::Result<Option<String>>;
    fn set(&mut self, key: &str, value: &str) -> crate::Result<()>;
    fn remove(&mut self, key: &str) -> crate::Result<()>;
    fn keys(&self) -> crate::Result<Vec<String>>;
}

fn entry_size(key: &str, value: &str) -> usize {
    key.len() + value.len()
}

// Rejects a write that would push the total past `capacity`.
fn check_capacity<'a, I>(entries: I, key: &str, value: &str, capacity: Option<usize>) -> crate::Result<()>
where
    I: Iterator<Item = (&'a String, &'a String)>,
{
    let Some(capacity) = capacity else {
        return Ok(());
    };
    let others: usize = entries
        .filter(|(k, _)| k.as_str() != key)
        .map(|(k, v)| entry_size(k, v))
        .sum();
    let needed = others + entry_size(key, value);
    if needed > capacity {
        return Err(KeySlotError::QuotaExceeded(format!(
            "writing {key} needs {needed} bytes, capacity is {capacity}"
        )));
    }
    Ok(())
}

#[derive(Debug, Default, Clone)]
pub struct MemoryMedium {
    entries: HashMap<String, String>,
    capacity_bytes: Option<usize>,
}

impl MemoryMedium {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_capacity(capacity_bytes: usize) -> Self {
        Self {
            entries: HashMap::new(),
            capacity_bytes: Some(capacity_bytes),
        }
    }

    /// Pre-seeded store, bypassing the capacity check.
    pub fn with_entries<I, K, V>(entries: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        Self {
            entries: entries.into_iter().map(|(k, v)| (k.into(), v.into())).collect(),
            capacity_bytes: None,
        }
    }
}

impl KeyValueMedium for MemoryMedium {
    fn get(&self, key: &str) -> crate::Result<Option<String>> {
        Ok(self.entries.get(key).cloned())
    }

    fn set(&mut self, key: &str, value: &str) -> crate::Result<()> {
        check_capacity(self.entries.iter(), key, value, self.capacity_bytes)?;
        self.entries.insert(key.to_string(), value.to_string());
        Ok(())
    }

    fn remove(&mut self, key: &str) -> crate::Result<()> {
        self.entries.remove(key);
        Ok(())
    }

    fn keys(&self) -> crate::Result<Vec<String>> {
        Ok(self.entries.keys().cloned().collect())
    }
}

/// A JSON object file holding every entry, rewritten atomically on each change.
#[derive(Debug)]
pub struct FileMedium {
    path: PathBuf,
    entries: BTreeMap<String, String>,
    capacity_bytes: Option<usize>,
}

impl FileMedium {
    /// Opens (or lazily creates) the store file. A file that no longer parses is
    /// moved aside to `<file>.corrupt` and the store starts empty.
    pub fn open(path: &Path, capacity_bytes: Option<usize>) -> crate::Result<Self> {
        if path.is_dir() {
            return Err(KeySlotError::Storage(format!("{} is a directory", path.display())));
        }
        let mut entries = BTreeMap::new();
        if path.exists() {
            let data = fs::read_to_string(path).map_err(|e| KeySlotError::FileSystem(e.to_string()))?;
            match serde_json::from_str::<BTreeMap<String, String>>(&data) {
                Ok(loaded) => entries = loaded,
                Err(e) => {
                    let aside = path.with_extension("json.corrupt");
                    warn!(path = %path.display(), error = %e, aside = %aside.display(), "store file unreadable, starting empty");
                    fs::rename(path, &aside).map_err(|e| KeySlotError::FileSystem(e.to_string()))?;
                }
            }
        }
        info!(path = %path.display(), entries = entries.len(), "opened store file");
        Ok(Self {
            path: path.to_path_buf(),
            entries,
            capacity_bytes,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn persist(&self) -> crate::Result<()> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent).map_err(|e| KeySlotError::FileSystem(e.to_string()))?;
        }
        let data = serde_json::to_string_pretty(&self.entries)?;
        atomic_write(&self.path, data.as_bytes())
    }
}

impl KeyValueMedium for FileMedium {
    fn get(&self, key: &str) -> crate::Result<Option<String>> {
        Ok(self.entries.get(key).cloned())
    }

    fn set(&mut self, key: &str, value: &str) -> crate::Result<()> {
        check_capacity(self.entries.iter(), key, value, self.capacity_bytes)?;
        let previous = self.entries.insert(key.to_string(), value.to_string());
        if let Err(e) = self.persist() {
            // Keep memory in step with what is on disk.
            match previous {
                Some(old) => self.entries.insert(key.to_string(), old),
                None => self.entries.remove(key),
            };
            return Err(e);
        }
        Ok(())
    }

    fn remove(&mut self, key: &str) -> crate::Result<()> {
        let Some(previous) = self.entries.remove(key) else {
            return Ok(());
        };
        if let Err(e) = self.persist() {
            self.entries.insert(key.to_string(), previous);
            return Err(e);
        }
        Ok(())
    }

    fn keys(&self) -> crate::Result<Vec<String>> {
        Ok(self.entries.keys().cloned().collect())
    }
}

/// Writes to a temporary sibling and renames it into place, so readers see
/// either the old file or the new one.
pub fn atomic_write(path: &Path, bytes: &[u8]) -> crate::Result<()> {
    let parent = path
        .parent()
        .ok_or_else(|| KeySlotError::FileSystem(format!("invalid path: {}", path.display())))?;
    let suffix: u64 = thread_rng().gen();
    let tmp = parent.join(format!(".tmp_keyslot.{suffix}.tmp"));

    fs::write(&tmp, bytes).map_err(|e| KeySlotError::FileSystem(e.to_string()))?;
    fs::rename(&tmp, path).map_err(|e| {
        let _ = fs::remove_file(&tmp);
        KeySlotError::FileSystem(e.to_string())
    })?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_memory_medium_quota() {
        let mut medium = MemoryMedium::with_capacity(32);
        medium.set("a", "0123456789").unwrap();
        let err = medium.set("b", &"x".repeat(40)).unwrap_err();
        assert!(matches!(err, KeySlotError::QuotaExceeded(_)));
        assert_eq!(medium.get("b").unwrap(), None);

        // Overwriting counts the replaced value only once.
        medium.set("a", &"y".repeat(30)).unwrap();
    }

    #[test]
    fn test_file_medium_roundtrip() {
        let tmp_dir = TempDir::new().unwrap();
        let path = tmp_dir.path().join("nested").join("store.json");

        let mut medium = FileMedium::open(&path, None).unwrap();
        medium.set("pwgen-store", r#"{"a":1}"#).unwrap();
        medium.set("pwgen-store-v2-ff", r#"{"b":2}"#).unwrap();
        medium.remove("pwgen-store").unwrap();
        drop(medium);

        let reopened = FileMedium::open(&path, None).unwrap();
        assert_eq!(reopened.keys().unwrap(), vec!["pwgen-store-v2-ff".to_string()]);
        assert_eq!(reopened.get("pwgen-store-v2-ff").unwrap().as_deref(), Some(r#"{"b":2}"#));
    }

    #[test]
    fn test_file_medium_quota_leaves_file_untouched() {
        let tmp_dir = TempDir::new().unwrap();
        let path = tmp_dir.path().join("store.json");

        let mut medium = FileMedium::open(&path, Some(64)).unwrap();
        medium.set("k", "small").unwrap();
        assert!(medium.set("big", &"z".repeat(100)).is_err());

        let reopened = FileMedium::open(&path, Some(64)).unwrap();
        assert_eq!(reopened.keys().unwrap(), vec!["k".to_string()]);
    }

    #[test]
    fn test_corrupt_file_is_moved_aside() {
        let tmp_dir = TempDir::new().unwrap();
        let path = tmp_dir.path().join("store.json");
        fs::write(&path, "{ truncated").unwrap();

        let medium = FileMedium::open(&path, None).unwrap();
        assert!(medium.keys().unwrap().is_empty());
        assert!(tmp_dir.path().join("store.json.corrupt").exists());
    }
}
