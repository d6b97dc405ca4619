//! Storage key derivation.
//!
//! Keys have three tiers: a SHA-256 derived key, a degraded rolling-hash key when
//! the secure digest is disabled, and a random fallback key when the device
//! fingerprint cannot be collected at all. Fallback keys are not reproducible
//! across restarts and carry a `fallback` tag so the rest of the core can tell.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};

use once_cell::sync::Lazy;
use rand::rngs::OsRng;
use rand::RngCore;
use regex::Regex;
use sha2::{Digest, Sha256};
use tracing::{debug, warn};

use crate::fingerprint::{DeviceSignals, FingerprintCollector};
use crate::payload::now_millis;

/// Bytes of the SHA-256 digest kept in a key.
const DIGEST_PREFIX_BYTES: usize = 8;
const META_SUFFIX: &str = "-meta";

// Matched against the part of a key after the namespace prefix.
static VERSIONED_SUFFIX: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^-v(\d+)-([0-9a-f]+)$").expect("valid versioned key pattern"));
static FALLBACK_SUFFIX: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^-fallback-v(\d+)-(.+)-([0-9a-f]+)-([0-9a-f]+)$").expect("valid fallback key pattern")
});

/// Digest strategy, chosen once when the derivation service is built.
pub trait KeyHasher: Send + Sync {
    fn name(&self) -> &'static str;
    fn digest_hex(&self, canonical: &str) -> String;
    fn is_degraded(&self) -> bool {
        false
    }
}

pub struct Sha256Hasher;

impl KeyHasher for Sha256Hasher {
    fn name(&self) -> &'static str {
        "sha256"
    }

    fn digest_hex(&self, canonical: &str) -> String {
        let digest = Sha256::digest(canonical.as_bytes());
        hex::encode(&digest[..DIGEST_PREFIX_BYTES])
    }
}

/// 32-bit `h * 31 + unit` over UTF-16 code units. Reproducible, not collision resistant.
pub struct RollingHasher;

impl KeyHasher for RollingHasher {
    fn name(&self) -> &'static str {
        "rolling32"
    }

    fn digest_hex(&self, canonical: &str) -> String {
        let hash = canonical
            .encode_utf16()
            .fold(0u32, |h, unit| h.wrapping_mul(31).wrapping_add(u32::from(unit)));
        format!("{hash:08x}")
    }

    fn is_degraded(&self) -> bool {
        true
    }
}

pub fn select_hasher(secure_digest: bool) -> Box<dyn KeyHasher> {
    if secure_digest {
        Box::new(Sha256Hasher)
    } else {
        warn!("secure digest disabled, deriving storage keys with the rolling hash");
        Box::new(RollingHasher)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum KeyKind {
    Legacy,
    Versioned { version: u32, digest: String },
    Fallback { version: u32, purpose: String },
    Meta,
    /// Inside the namespace but of no known shape.
    Unrecognized,
}

/// Naming rules for every key under one namespace prefix.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyScheme {
    prefix: String,
}

impl KeyScheme {
    pub fn new(prefix: impl Into<String>) -> Self {
        Self { prefix: prefix.into() }
    }

    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    pub fn legacy(&self) -> String {
        self.prefix.clone()
    }

    pub fn meta(&self) -> String {
        format!("{}{}", self.prefix, META_SUFFIX)
    }

    pub fn versioned(&self, version: u32, digest: &str) -> String {
        format!("{}-v{}-{}", self.prefix, version, digest)
    }

    pub fn fallback(&self, version: u32, purpose: &str, timestamp: i64, random: &str) -> String {
        format!("{}-fallback-v{}-{}-{:x}-{}", self.prefix, version, purpose, timestamp, random)
    }

    pub fn contains(&self, key: &str) -> bool {
        self.classify(key).is_some()
    }

    /// `None` when the key is outside this namespace.
    pub fn classify(&self, key: &str) -> Option<KeyKind> {
        let suffix = key.strip_prefix(self.prefix.as_str())?;
        if suffix.is_empty() {
            return Some(KeyKind::Legacy);
        }
        if !suffix.starts_with('-') {
            return None;
        }
        if suffix == META_SUFFIX {
            return Some(KeyKind::Meta);
        }
        if let Some(caps) = VERSIONED_SUFFIX.captures(suffix) {
            if let Ok(version) = caps[1].parse() {
                return Some(KeyKind::Versioned {
                    version,
                    digest: caps[2].to_string(),
                });
            }
        }
        if let Some(caps) = FALLBACK_SUFFIX.captures(suffix) {
            if let Ok(version) = caps[1].parse() {
                return Some(KeyKind::Fallback {
                    version,
                    purpose: caps[2].to_string(),
                });
            }
        }
        Some(KeyKind::Unrecognized)
    }
}

pub struct KeyDerivationService {
    collector: FingerprintCollector,
    hasher: Box<dyn KeyHasher>,
    scheme: KeyScheme,
    schema_version: u32,
    cache: Mutex<HashMap<String, String>>,
}

impl KeyDerivationService {
    pub fn new(
        signals: Arc<dyn DeviceSignals>,
        hasher: Box<dyn KeyHasher>,
        scheme: KeyScheme,
        schema_version: u32,
    ) -> Self {
        Self {
            collector: FingerprintCollector::new(signals),
            hasher,
            scheme,
            schema_version,
            cache: Mutex::new(HashMap::new()),
        }
    }

    pub fn scheme(&self) -> &KeyScheme {
        &self.scheme
    }

    pub fn schema_version(&self) -> u32 {
        self.schema_version
    }

    pub fn is_degraded(&self) -> bool {
        self.hasher.is_degraded()
    }

    /// Never fails: a fingerprint failure degrades to a tagged random key.
    pub fn derive_key(&self, purpose: &str) -> String {
        let mut cache = self.cache.lock().unwrap_or_else(|p| p.into_inner());
        if let Some(key) = cache.get(purpose) {
            return key.clone();
        }

        let key = match self.collector.collect() {
            Ok(fingerprint) => {
                let canonical = format!("{}|{}|{}", fingerprint.canonical(), purpose, self.schema_version);
                let digest = self.hasher.digest_hex(&canonical);
                debug!(purpose, hasher = self.hasher.name(), "derived storage key");
                self.scheme.versioned(self.schema_version, &digest)
            }
            Err(e) => {
                let key = self.fallback_key(purpose);
                warn!(purpose, error = %e, key = %key, "fingerprint unavailable, using non-reproducible fallback key");
                key
            }
        };

        cache.insert(purpose.to_string(), key.clone());
        key
    }

    fn fallback_key(&self, purpose: &str) -> String {
        let mut random = [0u8; 8];
        OsRng.fill_bytes(&mut random);
        self.scheme
            .fallback(self.schema_version, purpose, now_millis(), &hex::encode(random))
    }

    /// Current keys for every listed purpose.
    pub fn current_keys<'a, I>(&self, purposes: I) -> HashSet<String>
    where
        I: IntoIterator<Item = &'a String>,
    {
        purposes.into_iter().map(|p| self.derive_key(p)).collect()
    }

    pub fn fingerprint_id(&self) -> String {
        self.collector
            .collect()
            .map(|fp| fp.id())
            .unwrap_or_else(|_| "unknown".to_string())
    }

    /// Forgets every derived key; the next derivation re-reads the device.
    pub fn clear_cache(&self) {
        self.cache.lock().unwrap_or_else(|p| p.into_inner()).clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fingerprint::{FixedSignals, SignalValues};

    fn service(signals: &FixedSignals, secure: bool) -> KeyDerivationService {
        KeyDerivationService::new(
            Arc::new(signals.clone()),
            select_hasher(secure),
            KeyScheme::new("pwgen-store"),
            2,
        )
    }

    #[test]
    fn test_key_is_stable_and_well_formed() {
        let signals = FixedSignals::default();
        let keys = service(&signals, true);
        let first = keys.derive_key("primary");
        assert_eq!(first, keys.derive_key("primary"));
        assert!(first.starts_with("pwgen-store-v2-"));
        assert_eq!(first.len(), "pwgen-store-v2-".len() + 16);
        assert!(matches!(
            keys.scheme().classify(&first),
            Some(KeyKind::Versioned { version: 2, .. })
        ));
    }

    #[test]
    fn test_purposes_are_distinct() {
        let keys = service(&FixedSignals::default(), true);
        assert_ne!(keys.derive_key("primary"), keys.derive_key("backup"));
    }

    #[test]
    fn test_platform_change_needs_cache_clear() {
        let signals = FixedSignals::default();
        let keys = service(&signals, true);
        let before = keys.derive_key("primary");

        signals.update(|v| v.platform = Some("Linux x86_64".to_string()));
        assert_eq!(keys.derive_key("primary"), before);

        keys.clear_cache();
        assert_ne!(keys.derive_key("primary"), before);
    }

    #[test]
    fn test_small_resize_keeps_key() {
        let signals = FixedSignals::default();
        let keys = service(&signals, true);
        let before = keys.derive_key("primary");

        signals.update(|v| v.screen_size = Some((1925, 1085)));
        keys.clear_cache();
        assert_eq!(keys.derive_key("primary"), before);
    }

    #[test]
    fn test_degraded_hasher_is_reproducible() {
        let signals = FixedSignals::default();
        let a = service(&signals, false);
        let b = service(&signals, false);
        assert!(a.is_degraded());
        let key = a.derive_key("primary");
        assert_eq!(key, b.derive_key("primary"));
        assert_eq!(key.len(), "pwgen-store-v2-".len() + 8);
        assert_ne!(key, service(&signals, true).derive_key("primary"));
    }

    #[test]
    fn test_rolling_hash_known_value() {
        // ((97 * 31) + 98) * 31 + 99
        assert_eq!(RollingHasher.digest_hex("abc"), format!("{:08x}", 96354u32));
    }

    #[test]
    fn test_fallback_key_is_tagged_and_cached() {
        let signals = FixedSignals::new(SignalValues {
            available: false,
            ..SignalValues::default()
        });
        let keys = service(&signals, true);
        let key = keys.derive_key("primary");
        assert!(key.starts_with("pwgen-store-fallback-v2-primary-"));
        assert_eq!(key, keys.derive_key("primary"));
        assert!(matches!(
            keys.scheme().classify(&key),
            Some(KeyKind::Fallback { version: 2, ref purpose }) if purpose == "primary"
        ));

        keys.clear_cache();
        assert_ne!(keys.derive_key("primary"), key);
        assert_eq!(keys.fingerprint_id(), "unknown");
    }

    #[test]
    fn test_classify() {
        let scheme = KeyScheme::new("pwgen-store");
        assert_eq!(scheme.classify("pwgen-store"), Some(KeyKind::Legacy));
        assert_eq!(scheme.classify("pwgen-store-meta"), Some(KeyKind::Meta));
        assert_eq!(scheme.classify("pwgen-store-notes"), Some(KeyKind::Unrecognized));
        assert_eq!(scheme.classify("pwgen-storefront"), None);
        assert_eq!(scheme.classify("other"), None);
        assert_eq!(
            scheme.classify("pwgen-store-v1-00ff"),
            Some(KeyKind::Versioned {
                version: 1,
                digest: "00ff".to_string()
            })
        );
    }
}
