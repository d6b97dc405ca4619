//! Device fingerprint collection.
//!
//! The fingerprint is an identity convenience, not a security boundary. Volatile
//! signals are coarsened so a DST shift or a window resize keeps the same
//! fingerprint, and therefore the same storage key.

use std::sync::{Arc, RwLock};

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::debug;

use crate::error::KeySlotError;

const DEFAULT_PLATFORM: &str = "unknown";
const DEFAULT_LANGUAGE: &str = "en";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Fingerprint {
    pub platform: String,
    pub architecture: Option<String>,
    pub os_family: Option<String>,
    pub language_base: String,
    /// UTC offset in minutes, rounded to the hour.
    pub timezone_bucket: i32,
    /// Screen width and height, each rounded to the nearest 100px.
    pub screen_bucket: (u32, u32),
    pub concurrency_hint: u32,
}

impl Fingerprint {
    /// Pipe-delimited canonical form fed to the key hasher.
    pub fn canonical(&self) -> String {
        format!(
            "{}|{}|{}|{}|{}|{}x{}|{}",
            self.platform,
            self.architecture.as_deref().unwrap_or(""),
            self.os_family.as_deref().unwrap_or(""),
            self.language_base,
            self.timezone_bucket,
            self.screen_bucket.0,
            self.screen_bucket.1,
            self.concurrency_hint
        )
    }

    /// Short stable identifier recorded in export bundles.
    pub fn id(&self) -> String {
        let digest = Sha256::digest(self.canonical().as_bytes());
        hex::encode(&digest[..8])
    }
}

pub fn bucket_timezone(offset_minutes: i32) -> i32 {
    ((offset_minutes as f64 / 60.0).round() as i32) * 60
}

pub fn bucket_screen(width: u32, height: u32) -> (u32, u32) {
    let round = |v: u32| (v.saturating_add(50) / 100) * 100;
    (round(width), round(height))
}

/// `en-US`, `en_US.UTF-8` and `EN` all reduce to `en`.
pub fn language_base(tag: &str) -> Option<String> {
    let base = tag
        .split(|c: char| c == '-' || c == '_' || c == '.' || c == '@')
        .next()
        .unwrap_or("")
        .trim()
        .to_ascii_lowercase();
    // "C" and "POSIX" locales say nothing about the user's language.
    if base.is_empty() || base == "c" || base == "posix" {
        None
    } else {
        Some(base)
    }
}

/// The host's device-signal query surface. Each signal can fail on its own.
pub trait DeviceSignals: Send + Sync {
    /// Fails when the whole surface is unreachable, not when a single signal is.
    fn probe(&self) -> crate::Result<()> {
        Ok(())
    }
    fn platform(&self) -> crate::Result<String>;
    fn architecture(&self) -> crate::Result<String>;
    fn os_family(&self) -> crate::Result<String>;
    fn language(&self) -> crate::Result<String>;
    fn utc_offset_minutes(&self) -> crate::Result<i32>;
    fn screen_size(&self) -> crate::Result<(u32, u32)>;
    fn logical_cores(&self) -> crate::Result<u32>;
}

/// Signals read from the running host.
#[derive(Debug, Clone, Default)]
pub struct SystemSignals {
    screen: Option<(u32, u32)>,
}

impl SystemSignals {
    pub fn new() -> Self {
        Self::default()
    }

    /// Headless processes have no screen; the embedding UI supplies one.
    pub fn with_screen(mut self, width: u32, height: u32) -> Self {
        self.screen = Some((width, height));
        self
    }
}

impl DeviceSignals for SystemSignals {
    fn platform(&self) -> crate::Result<String> {
        let platform = match std::env::consts::OS {
            "windows" => "Win32".to_string(),
            "macos" => "MacIntel".to_string(),
            "linux" => format!("Linux {}", std::env::consts::ARCH),
            "" => return Err(KeySlotError::FingerprintUnavailable("platform".to_string())),
            other => other.to_string(),
        };
        Ok(platform)
    }

    fn architecture(&self) -> crate::Result<String> {
        Ok(std::env::consts::ARCH.to_string())
    }

    fn os_family(&self) -> crate::Result<String> {
        Ok(std::env::consts::FAMILY.to_string())
    }

    fn language(&self) -> crate::Result<String> {
        ["LC_ALL", "LC_MESSAGES", "LANG"]
            .iter()
            .filter_map(|var| std::env::var(var).ok())
            .find(|value| !value.is_empty())
            .ok_or_else(|| KeySlotError::FingerprintUnavailable("language".to_string()))
    }

    fn utc_offset_minutes(&self) -> crate::Result<i32> {
        Ok(chrono::Local::now().offset().local_minus_utc() / 60)
    }

    fn screen_size(&self) -> crate::Result<(u32, u32)> {
        self.screen
            .ok_or_else(|| KeySlotError::FingerprintUnavailable("screen".to_string()))
    }

    fn logical_cores(&self) -> crate::Result<u32> {
        std::thread::available_parallelism()
            .map(|n| n.get() as u32)
            .map_err(|e| KeySlotError::FingerprintUnavailable(format!("cores: {e}")))
    }
}

/// Raw signal values held by [`FixedSignals`]. `None` makes that signal fail.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SignalValues {
    pub available: bool,
    pub platform: Option<String>,
    pub architecture: Option<String>,
    pub os_family: Option<String>,
    pub language: Option<String>,
    pub utc_offset_minutes: Option<i32>,
    pub screen_size: Option<(u32, u32)>,
    pub logical_cores: Option<u32>,
}

impl Default for SignalValues {
    fn default() -> Self {
        Self {
            available: true,
            platform: Some("Win32".to_string()),
            architecture: Some("x86_64".to_string()),
            os_family: Some("windows".to_string()),
            language: Some("en-US".to_string()),
            utc_offset_minutes: Some(-300),
            screen_size: Some((1920, 1080)),
            logical_cores: Some(8),
        }
    }
}

/// Caller-controlled signals for tests and headless embedding.
#[derive(Debug, Clone, Default)]
pub struct FixedSignals {
    values: Arc<RwLock<SignalValues>>,
}

impl FixedSignals {
    pub fn new(values: SignalValues) -> Self {
        Self {
            values: Arc::new(RwLock::new(values)),
        }
    }

    /// Changes the simulated environment. Clones share the same values.
    pub fn update<F>(&self, f: F)
    where
        F: FnOnce(&mut SignalValues),
    {
        let mut guard = self.values.write().unwrap_or_else(|p| p.into_inner());
        f(&mut guard);
    }

    fn read<T, F>(&self, name: &str, f: F) -> crate::Result<T>
    where
        F: FnOnce(&SignalValues) -> Option<T>,
    {
        let guard = self.values.read().unwrap_or_else(|p| p.into_inner());
        f(&guard).ok_or_else(|| KeySlotError::FingerprintUnavailable(name.to_string()))
    }
}

impl DeviceSignals for FixedSignals {
    fn probe(&self) -> crate::Result<()> {
        self.read("device signals", |v| v.available.then_some(()))
    }

    fn platform(&self) -> crate::Result<String> {
        self.read("platform", |v| v.platform.clone())
    }

    fn architecture(&self) -> crate::Result<String> {
        self.read("architecture", |v| v.architecture.clone())
    }

    fn os_family(&self) -> crate::Result<String> {
        self.read("os family", |v| v.os_family.clone())
    }

    fn language(&self) -> crate::Result<String> {
        self.read("language", |v| v.language.clone())
    }

    fn utc_offset_minutes(&self) -> crate::Result<i32> {
        self.read("timezone", |v| v.utc_offset_minutes)
    }

    fn screen_size(&self) -> crate::Result<(u32, u32)> {
        self.read("screen", |v| v.screen_size)
    }

    fn logical_cores(&self) -> crate::Result<u32> {
        self.read("cores", |v| v.logical_cores)
    }
}

pub struct FingerprintCollector {
    signals: Arc<dyn DeviceSignals>,
}

impl FingerprintCollector {
    pub fn new(signals: Arc<dyn DeviceSignals>) -> Self {
        Self { signals }
    }

    pub fn collect(&self) -> crate::Result<Fingerprint> {
        self.signals.probe()?;

        let platform = or_default("platform", self.signals.platform(), DEFAULT_PLATFORM.to_string());
        let architecture = self.signals.architecture().map_err(log_missing("architecture")).ok();
        let os_family = self.signals.os_family().map_err(log_missing("os family")).ok();
        let language_base = self
            .signals
            .language()
            .map_err(log_missing("language"))
            .ok()
            .and_then(|tag| language_base(&tag))
            .unwrap_or_else(|| DEFAULT_LANGUAGE.to_string());
        let offset = or_default("timezone", self.signals.utc_offset_minutes(), 0);
        let (width, height) = or_default("screen", self.signals.screen_size(), (0, 0));
        let cores = or_default("cores", self.signals.logical_cores(), 1).max(1);

        Ok(Fingerprint {
            platform,
            architecture,
            os_family,
            language_base,
            timezone_bucket: bucket_timezone(offset),
            screen_bucket: bucket_screen(width, height),
            concurrency_hint: cores,
        })
    }
}

fn log_missing(signal: &'static str) -> impl Fn(KeySlotError) -> KeySlotError {
    move |e| {
        debug!(signal, error = %e, "device signal unavailable, using default");
        e
    }
}

fn or_default<T>(signal: &'static str, value: crate::Result<T>, default: T) -> T {
    value.map_err(log_missing(signal)).unwrap_or(default)
}
