//! Integrity scan and repair over every entry in the core's namespace.

use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use serde_json::Value;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::keys::{KeyDerivationService, KeyKind};
use crate::payload::{extract_last_modified, now_millis, sanitize_bookkeeping};
use crate::storage::{CompareOutcome, StorageAdapter, StorageEntry, WriteOutcome};

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct IntegrityReport {
    pub valid: bool,
    pub issues: Vec<String>,
    pub cleaned_entries: usize,
    pub migrated_entries: usize,
}

/// Where integrity results are surfaced (settings panel, toast, log).
pub trait IntegrityObserver: Send + Sync {
    fn on_report(&self, report: &IntegrityReport);
}

pub struct LogObserver;

impl IntegrityObserver for LogObserver {
    fn on_report(&self, report: &IntegrityReport) {
        if report.valid {
            info!(
                cleaned = report.cleaned_entries,
                migrated = report.migrated_entries,
                "storage integrity check passed"
            );
        } else {
            warn!(
                cleaned = report.cleaned_entries,
                migrated = report.migrated_entries,
                issues = ?report.issues,
                "storage integrity check repaired issues"
            );
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PurgeOutcome {
    Purged,
    NothingToPurge,
    /// Refused: the legacy entry is the only copy of the data.
    CurrentEmpty,
    Failed,
}

pub struct IntegrityManager {
    storage: StorageAdapter,
    keys: Arc<KeyDerivationService>,
    purposes: Vec<String>,
    primary_purpose: String,
    orphan_cap: usize,
}

impl IntegrityManager {
    pub fn new(
        storage: StorageAdapter,
        keys: Arc<KeyDerivationService>,
        purposes: Vec<String>,
        primary_purpose: String,
        orphan_cap: usize,
    ) -> Self {
        Self {
            storage,
            keys,
            purposes,
            primary_purpose,
            orphan_cap,
        }
    }

    pub async fn perform_integrity_check(&self) -> IntegrityReport {
        let mut report = IntegrityReport::default();
        let scheme = self.keys.scheme().clone();
        let current_keys = self.keys.current_keys(&self.purposes);

        // Pass 1: drop what no longer parses; repair or report what parses
        // but does not decode.
        let mut survivors = Vec::new();
        for entry in self.storage.entries(&scheme).await {
            let kind = scheme.classify(&entry.key);
            match serde_json::from_str::<Value>(&entry.raw_value) {
                Ok(value) => {
                    if let Some(entry) = self.check_structure(entry, kind.as_ref(), value, &mut report).await {
                        survivors.push((entry, kind));
                    }
                }
                Err(e) => self.remove_corrupt(&entry, &e.to_string(), &mut report).await,
            }
            tokio::task::yield_now().await;
        }

        // Pass 2: cap the number of orphaned versioned entries.
        let orphans: Vec<StorageEntry> = survivors
            .iter()
            .filter(|(entry, kind)| {
                matches!(kind, Some(KeyKind::Versioned { .. })) && !current_keys.contains(&entry.key)
            })
            .map(|(entry, _)| entry.clone())
            .collect();
        let (evicted, stuck) = self.evict_excess_orphans(orphans).await;
        for key in stuck {
            report.issues.push(format!("Could not evict orphaned entry: {key}"));
        }
        if evicted > 0 {
            report.cleaned_entries += evicted;
            report.issues.push(format!(
                "Evicted {} orphaned entries over the cap of {}",
                evicted, self.orphan_cap
            ));
        }

        // Pass 3: carry pre-versioning data into the current key.
        let has_legacy = survivors
            .iter()
            .any(|(_, kind)| matches!(kind, Some(KeyKind::Legacy)));
        if has_legacy && self.migrate_legacy().await {
            report.migrated_entries += 1;
        }

        report.valid = report.issues.is_empty();
        debug!(?report, "integrity pass finished");
        report
    }

    async fn remove_corrupt(&self, entry: &StorageEntry, reason: &str, report: &mut IntegrityReport) {
        match self.storage.remove_if_unchanged(&entry.key, &entry.raw_value).await {
            CompareOutcome::Applied => {
                warn!(key = %entry.key, category = "parse", reason, "removed corrupt entry");
                report.cleaned_entries += 1;
                report.issues.push(format!("Removed corrupt entry: {}", entry.key));
            }
            CompareOutcome::Changed => {}
            CompareOutcome::Failed => {
                report.issues.push(format!("Could not remove corrupt entry: {}", entry.key));
            }
        }
    }

    /// Entries that parse are never deleted. Wrongly typed bookkeeping is
    /// repaired in place; anything else is kept and reported. Returns the entry
    /// as it now stands when it decodes.
    async fn check_structure(
        &self,
        entry: StorageEntry,
        kind: Option<&KeyKind>,
        value: Value,
        report: &mut IntegrityReport,
    ) -> Option<StorageEntry> {
        if matches!(kind, Some(KeyKind::Meta)) {
            if value.is_object() {
                return Some(entry);
            }
            report
                .issues
                .push(format!("Kept unreadable entry: {} (not a JSON object)", entry.key));
            return None;
        }

        let reason = match self.storage.decode_value(value.clone()) {
            Ok(_) => return Some(entry),
            Err(e) => e,
        };
        let Value::Object(mut map) = value else {
            warn!(key = %entry.key, category = reason.category(), error = %reason, "keeping undecodable entry");
            report.issues.push(format!("Kept unreadable entry: {} ({})", entry.key, reason));
            return None;
        };
        let touched = sanitize_bookkeeping(&mut map);
        let repaired = Value::Object(map);
        if touched.is_empty() || self.storage.decode_value(repaired.clone()).is_err() {
            warn!(key = %entry.key, category = reason.category(), error = %reason, "keeping undecodable entry");
            report.issues.push(format!("Kept unreadable entry: {} ({})", entry.key, reason));
            return None;
        }

        let repaired_raw = repaired.to_string();
        match self
            .storage
            .replace_if_unchanged(&entry.key, &entry.raw_value, &repaired_raw)
            .await
        {
            CompareOutcome::Applied => {
                warn!(key = %entry.key, fields = ?touched, "repaired malformed bookkeeping");
                report.cleaned_entries += 1;
                report
                    .issues
                    .push(format!("Repaired entry: {} ({})", entry.key, touched.join(", ")));
                Some(StorageEntry {
                    size_bytes: entry.key.len() + repaired_raw.len(),
                    last_modified: extract_last_modified(&repaired_raw),
                    key: entry.key,
                    raw_value: repaired_raw,
                })
            }
            CompareOutcome::Changed => None,
            CompareOutcome::Failed => {
                report.issues.push(format!("Could not repair entry: {}", entry.key));
                None
            }
        }
    }

    /// Returns how many were evicted and the keys that could not be.
    async fn evict_excess_orphans(&self, mut orphans: Vec<StorageEntry>) -> (usize, Vec<String>) {
        if orphans.len() <= self.orphan_cap {
            return (0, Vec::new());
        }
        // Unknown timestamps sort first and are evicted first.
        orphans.sort_by(|a, b| {
            a.last_modified
                .cmp(&b.last_modified)
                .then_with(|| a.key.cmp(&b.key))
        });
        let excess = orphans.len() - self.orphan_cap;
        let mut evicted = 0;
        let mut stuck = Vec::new();
        for entry in orphans.into_iter().take(excess) {
            match self.storage.remove_if_unchanged(&entry.key, &entry.raw_value).await {
                CompareOutcome::Applied => {
                    info!(key = %entry.key, last_modified = ?entry.last_modified, "evicted orphaned entry");
                    evicted += 1;
                }
                CompareOutcome::Changed => {}
                CompareOutcome::Failed => stuck.push(entry.key),
            }
        }
        (evicted, stuck)
    }

    async fn migrate_legacy(&self) -> bool {
        let legacy_key = self.keys.scheme().legacy();
        let current_key = self.keys.derive_key(&self.primary_purpose);

        let Some(legacy) = self.storage.get(&legacy_key).await else {
            return false;
        };
        let outcome = self
            .storage
            .update(&current_key, |existing| {
                if existing.is_some() {
                    return None;
                }
                let mut migrated = legacy;
                migrated.migrated_at = Some(now_millis());
                Some(migrated)
            })
            .await;
        if outcome == WriteOutcome::Written {
            info!(from = %legacy_key, to = %current_key, "migrated legacy data");
        }
        outcome.is_written()
    }

    /// Deletes the legacy entry. Explicit user action only, and refused while
    /// the current key holds no data yet.
    pub async fn purge_legacy(&self) -> PurgeOutcome {
        let legacy_key = self.keys.scheme().legacy();
        if !self.storage.contains(&legacy_key).await {
            debug!(key = %legacy_key, "no legacy data to purge");
            return PurgeOutcome::NothingToPurge;
        }
        let current_key = self.keys.derive_key(&self.primary_purpose);
        if self.storage.get(&current_key).await.is_none() {
            warn!(key = %current_key, "current key is empty, keeping legacy data");
            return PurgeOutcome::CurrentEmpty;
        }
        if !self.storage.remove(&legacy_key).await {
            return PurgeOutcome::Failed;
        }
        info!(key = %legacy_key, "legacy data removed");
        PurgeOutcome::Purged
    }

    /// First pass after `initial_delay`, then every `interval`.
    pub fn spawn_schedule(
        self: Arc<Self>,
        initial_delay: Duration,
        interval: Duration,
        observer: Arc<dyn IntegrityObserver>,
    ) -> JoinHandle<()> {
        tokio::spawn(async move {
            tokio::time::sleep(initial_delay).await;
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                // The first tick completes immediately.
                ticker.tick().await;
                let report = self.perform_integrity_check().await;
                observer.on_report(&report);
            }
        })
    }
}
