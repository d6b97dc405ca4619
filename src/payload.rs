//! Versioned payload stored under one key, and the per-version migration table.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::KeySlotError;

pub const CURRENT_SCHEMA_VERSION: u32 = 2;

/// Payloads written before versioning carry no `schemaVersion` field.
pub const LEGACY_SCHEMA_VERSION: u32 = 1;

const TIMESTAMP_FIELDS: [&str; 4] = ["lastModified", "migratedAt", "importedAt", "recoveredAt"];
const SOURCE_FIELDS: [&str; 2] = ["importedFrom", "recoveredFrom"];

pub fn now_millis() -> i64 {
    Utc::now().timestamp_millis()
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Payload {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub schema_version: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_modified: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub migrated_at: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub imported_at: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub imported_from: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub recovered_at: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub recovered_from: Option<String>,
    /// Application-defined fields, kept verbatim.
    #[serde(flatten)]
    pub fields: Map<String, Value>,
}

impl Payload {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_field(mut self, name: impl Into<String>, value: Value) -> Self {
        self.fields.insert(name.into(), value);
        self
    }

    pub fn field(&self, name: &str) -> Option<&Value> {
        self.fields.get(name)
    }

    pub fn version(&self) -> u32 {
        self.schema_version.unwrap_or(LEGACY_SCHEMA_VERSION)
    }

    /// Parses a stored value, migrating it up to `target` first.
    pub fn decode(raw: &str, migrations: &MigrationRegistry, target: u32) -> crate::Result<Self> {
        let value: Value = serde_json::from_str(raw)?;
        Self::from_value(value, migrations, target)
    }

    pub fn from_value(value: Value, migrations: &MigrationRegistry, target: u32) -> crate::Result<Self> {
        let Value::Object(map) = value else {
            return Err(KeySlotError::Migration("payload is not a JSON object".to_string()));
        };
        let map = migrations.migrate(map, target)?;
        Ok(serde_json::from_value(Value::Object(map))?)
    }

    pub fn encode(&self) -> crate::Result<String> {
        Ok(serde_json::to_string(self)?)
    }

    /// Overlays `other` onto `self`; fields present in `other` win.
    pub fn merge_from(&mut self, other: Payload) {
        self.fields.extend(other.fields);
        self.schema_version = other.schema_version.max(self.schema_version);
        self.last_modified = other.last_modified.or(self.last_modified);
        self.migrated_at = other.migrated_at.or(self.migrated_at);
        self.imported_at = other.imported_at.or(self.imported_at);
        self.imported_from = other.imported_from.or(self.imported_from.take());
        self.recovered_at = other.recovered_at.or(self.recovered_at);
        self.recovered_from = other.recovered_from.or(self.recovered_from.take());
    }
}

/// Normalizes bookkeeping fields of the wrong type so the payload decodes again:
/// timestamps are coerced to epoch millis where possible, anything else
/// unusable is dropped. Application fields are never touched. Returns the
/// names of the fields that changed.
pub fn sanitize_bookkeeping(map: &mut Map<String, Value>) -> Vec<&'static str> {
    let mut touched = Vec::new();
    if let Some(version) = map.get("schemaVersion") {
        if version.as_u64().and_then(|v| u32::try_from(v).ok()).is_none() {
            map.remove("schemaVersion");
            touched.push("schemaVersion");
        }
    }
    for name in TIMESTAMP_FIELDS {
        let Some(value) = map.get(name) else {
            continue;
        };
        if value.is_null() || value.is_i64() {
            continue;
        }
        let coerced = timestamp_millis(value);
        map.remove(name);
        if let Some(ms) = coerced {
            map.insert(name.to_string(), Value::from(ms));
        }
        touched.push(name);
    }
    for name in SOURCE_FIELDS {
        if map.get(name).is_some_and(|v| !v.is_null() && !v.is_string()) {
            map.remove(name);
            touched.push(name);
        }
    }
    touched
}

/// Best-effort modification time of a raw stored value.
pub fn extract_last_modified(raw: &str) -> Option<i64> {
    let Ok(Value::Object(map)) = serde_json::from_str::<Value>(raw) else {
        return None;
    };
    if let Some(ts) = map.get("lastModified").and_then(timestamp_millis) {
        return Some(ts);
    }
    TIMESTAMP_FIELDS[1..]
        .iter()
        .filter_map(|name| map.get(*name).and_then(timestamp_millis))
        .max()
}

/// Accepts epoch millis or an RFC 3339 string.
fn timestamp_millis(value: &Value) -> Option<i64> {
    match value {
        Value::Number(n) => n.as_i64().or_else(|| n.as_f64().map(|f| f as i64)),
        Value::String(s) => DateTime::parse_from_rfc3339(s)
            .ok()
            .map(|dt| dt.timestamp_millis()),
        _ => None,
    }
}

pub type MigrationFn = fn(Map<String, Value>) -> crate::Result<Map<String, Value>>;

/// `from_version -> step` table. Each step lifts a payload by exactly one version.
#[derive(Debug, Clone, Default)]
pub struct MigrationRegistry {
    steps: BTreeMap<u32, MigrationFn>,
}

impl MigrationRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn standard() -> Self {
        let mut registry = Self::new();
        registry.register(1, migrate_v1_to_v2);
        registry
    }

    pub fn register(&mut self, from_version: u32, step: MigrationFn) {
        self.steps.insert(from_version, step);
    }

    /// Whether a pre-versioning payload can be lifted all the way to `target`.
    pub fn reaches(&self, target: u32) -> bool {
        (LEGACY_SCHEMA_VERSION..target).all(|version| self.steps.contains_key(&version))
    }

    /// Payloads newer than `target` pass through untouched; nothing is down-migrated.
    pub fn migrate(&self, mut map: Map<String, Value>, target: u32) -> crate::Result<Map<String, Value>> {
        let mut version = match map.get("schemaVersion") {
            None => LEGACY_SCHEMA_VERSION,
            Some(v) => v
                .as_u64()
                .and_then(|v| u32::try_from(v).ok())
                .ok_or_else(|| KeySlotError::Migration(format!("bad schemaVersion: {v}")))?,
        };
        while version < target {
            let step = self
                .steps
                .get(&version)
                .ok_or_else(|| KeySlotError::Migration(format!("no migration registered from v{version}")))?;
            map = step(map)?;
            version += 1;
            map.insert("schemaVersion".to_string(), Value::from(version));
        }
        Ok(map)
    }
}

/// v1 stored timestamps as RFC 3339 strings; v2 uses epoch millis.
fn migrate_v1_to_v2(mut map: Map<String, Value>) -> crate::Result<Map<String, Value>> {
    for name in TIMESTAMP_FIELDS {
        let Some(value) = map.remove(name) else {
            continue;
        };
        if let Some(ms) = timestamp_millis(&value) {
            map.insert(name.to_string(), Value::from(ms));
        }
    }
    for name in SOURCE_FIELDS {
        if map.get(name).is_some_and(|v| !v.is_string()) {
            map.remove(name);
        }
    }
    Ok(map)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_decode_current_payload() {
        let raw = r#"{"schemaVersion":2,"lastModified":5,"theme":"dark"}"#;
        let payload = Payload::decode(raw, &MigrationRegistry::standard(), 2).unwrap();
        assert_eq!(payload.last_modified, Some(5));
        assert_eq!(payload.field("theme"), Some(&json!("dark")));
        assert!(!payload.fields.contains_key("lastModified"));
    }

    #[test]
    fn test_legacy_payload_is_migrated() {
        let raw = r#"{"lastModified":"2024-03-01T12:00:00Z","recoveredFrom":7,"length":16}"#;
        let payload = Payload::decode(raw, &MigrationRegistry::standard(), 2).unwrap();
        assert_eq!(payload.schema_version, Some(2));
        assert_eq!(payload.last_modified, Some(1_709_294_400_000));
        assert_eq!(payload.recovered_from, None);
        assert_eq!(payload.field("length"), Some(&json!(16)));
    }

    #[test]
    fn test_newer_payload_is_not_downgraded() {
        let raw = r#"{"schemaVersion":5,"x":1}"#;
        let payload = Payload::decode(raw, &MigrationRegistry::standard(), 2).unwrap();
        assert_eq!(payload.schema_version, Some(5));
    }

    #[test]
    fn test_missing_step_is_an_error() {
        let raw = r#"{"x":1}"#;
        let err = Payload::decode(raw, &MigrationRegistry::new(), 2).unwrap_err();
        assert!(matches!(err, KeySlotError::Migration(_)));
    }

    #[test]
    fn test_non_object_rejected() {
        let registry = MigrationRegistry::standard();
        assert!(Payload::decode("[1,2]", &registry, 2).is_err());
        assert!(Payload::decode("not valid json{", &registry, 2).is_err());
    }

    #[test]
    fn test_merge_prefers_incoming_fields() {
        let mut base = Payload::new()
            .with_field("a", json!(1))
            .with_field("b", json!(2));
        base.imported_from = Some("old".to_string());
        let incoming = Payload::new()
            .with_field("b", json!(20))
            .with_field("c", json!(30));

        base.merge_from(incoming);
        assert_eq!(base.field("a"), Some(&json!(1)));
        assert_eq!(base.field("b"), Some(&json!(20)));
        assert_eq!(base.field("c"), Some(&json!(30)));
        assert_eq!(base.imported_from.as_deref(), Some("old"));
    }

    #[test]
    fn test_registry_reach() {
        let registry = MigrationRegistry::standard();
        assert!(registry.reaches(1));
        assert!(registry.reaches(CURRENT_SCHEMA_VERSION));
        assert!(!registry.reaches(CURRENT_SCHEMA_VERSION + 1));
        assert!(!MigrationRegistry::new().reaches(2));
    }

    #[test]
    fn test_sanitize_bookkeeping_keeps_app_fields() {
        let Value::Object(mut map) = json!({
            "schemaVersion": 2,
            "lastModified": 1.5,
            "importedAt": "not a date",
            "recoveredFrom": 7,
            "importedFrom": null,
            "history": ["keep"]
        }) else {
            unreachable!()
        };
        let touched = sanitize_bookkeeping(&mut map);
        assert_eq!(touched, vec!["lastModified", "importedAt", "recoveredFrom"]);
        assert_eq!(map.get("lastModified"), Some(&json!(1)));
        assert!(!map.contains_key("importedAt"));
        assert!(!map.contains_key("recoveredFrom"));
        assert_eq!(map.get("history"), Some(&json!(["keep"])));

        let payload = Payload::from_value(Value::Object(map.clone()), &MigrationRegistry::standard(), 2).unwrap();
        assert_eq!(payload.field("history"), Some(&json!(["keep"])));
        assert!(sanitize_bookkeeping(&mut map).is_empty());
    }

    #[test]
    fn test_extract_last_modified() {
        assert_eq!(extract_last_modified(r#"{"lastModified":42}"#), Some(42));
        assert_eq!(extract_last_modified(r#"{"migratedAt":3,"importedAt":9}"#), Some(9));
        assert_eq!(extract_last_modified(r#"{"x":1}"#), None);
        assert_eq!(extract_last_modified("garbage"), None);
    }
}
