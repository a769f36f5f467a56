//! Configuration Store
//!
//! Section-keyed key-value document persisted as TOML.
//!
//! # Consistency Model
//!
//! - **Reads** come from an in-memory snapshot that is replaced only after a
//!   write has been renamed into place, so `get` always reflects the last
//!   committed write and never a partial file.
//! - **Writes** are serialized by a single writer lock. Each write re-reads
//!   the live file, applies the mutation, writes a temp file, flushes it and
//!   renames it over the live file.
//! - **External writers** are detected by hashing the live file before and
//!   after the cycle; a change aborts the commit and the whole cycle is
//!   retried against the fresh file with exponential backoff.

use crate::atomic;
use crate::error::ConfigError;
use parking_lot::RwLock;
use serde::Serialize;
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

/// Max read-modify-write attempts before reporting a conflict
const MAX_COMMIT_ATTEMPTS: u32 = 5;

/// First retry delay, doubled on each attempt
const INITIAL_BACKOFF: Duration = Duration::from_millis(10);

/// Value type of a configuration entry
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum TypeHint {
    String,
    Bool,
    Int,
}

/// Typed keys. Keys outside this table are free-form.
const SCHEMA: &[(&str, &str, TypeHint)] = &[
    ("server", "ip", TypeHint::String),
    ("server", "port", TypeHint::Int),
    ("server", "forcehttps", TypeHint::Bool),
    ("server", "sslkey", TypeHint::String),
    ("server", "sslcrt", TypeHint::String),
    ("auth", "username", TypeHint::String),
    ("auth", "password", TypeHint::String),
    ("runtime", "mode", TypeHint::String),
    ("time", "timezone", TypeHint::String),
    ("time", "ntpserver", TypeHint::String),
];

/// Schema type of a key, if it has one
pub fn schema_hint(section: &str, key: &str) -> Option<TypeHint> {
    SCHEMA
        .iter()
        .find(|(s, k, _)| *s == section && *k == key)
        .map(|(_, _, hint)| *hint)
}

/// Keys the schema declares for a section
pub fn schema_keys(section: &str) -> Vec<&'static str> {
    SCHEMA
        .iter()
        .filter(|(s, _, _)| *s == section)
        .map(|(_, k, _)| *k)
        .collect()
}

/// A configuration value
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(untagged)]
pub enum ConfigValue {
    Bool(bool),
    Int(i64),
    Str(String),
}

impl ConfigValue {
    pub fn type_hint(&self) -> TypeHint {
        match self {
            ConfigValue::Bool(_) => TypeHint::Bool,
            ConfigValue::Int(_) => TypeHint::Int,
            ConfigValue::Str(_) => TypeHint::String,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            ConfigValue::Str(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            ConfigValue::Bool(b) => Some(*b),
            _ => None,
        }
    }

    pub fn as_int(&self) -> Option<i64> {
        match self {
            ConfigValue::Int(n) => Some(*n),
            _ => None,
        }
    }

    fn to_toml(&self) -> toml::Value {
        match self {
            ConfigValue::Bool(b) => toml::Value::Boolean(*b),
            ConfigValue::Int(n) => toml::Value::Integer(*n),
            ConfigValue::Str(s) => toml::Value::String(s.clone()),
        }
    }

    fn from_toml(value: &toml::Value) -> Option<Self> {
        match value {
            toml::Value::Boolean(b) => Some(ConfigValue::Bool(*b)),
            toml::Value::Integer(n) => Some(ConfigValue::Int(*n)),
            toml::Value::String(s) => Some(ConfigValue::Str(s.clone())),
            _ => None,
        }
    }

    /// Convert a JSON input into a value for `section.key`
    ///
    /// Typed keys accept their native JSON type or a string that parses as
    /// that type. Free-form keys take the JSON type as given.
    pub fn from_json(
        section: &str,
        key: &str,
        input: &serde_json::Value,
    ) -> Result<Self, ConfigError> {
        use serde_json::Value;

        let invalid = |expected: &str| {
            ConfigError::Invalid(format!("'{}.{}' expects a {} value", section, key, expected))
        };

        match schema_hint(section, key) {
            Some(TypeHint::Bool) => match input {
                Value::Bool(b) => Ok(ConfigValue::Bool(*b)),
                Value::String(s) => parse_bool(s).map(ConfigValue::Bool).ok_or_else(|| invalid("boolean")),
                _ => Err(invalid("boolean")),
            },
            Some(TypeHint::Int) => match input {
                Value::Number(n) => n.as_i64().map(ConfigValue::Int).ok_or_else(|| invalid("integer")),
                Value::String(s) => s.trim().parse().map(ConfigValue::Int).map_err(|_| invalid("integer")),
                _ => Err(invalid("integer")),
            },
            Some(TypeHint::String) => match input {
                Value::String(s) => Ok(ConfigValue::Str(s.clone())),
                _ => Err(invalid("string")),
            },
            None => match input {
                Value::Bool(b) => Ok(ConfigValue::Bool(*b)),
                Value::Number(n) => n.as_i64().map(ConfigValue::Int).ok_or_else(|| invalid("integer")),
                Value::String(s) => Ok(ConfigValue::Str(s.clone())),
                _ => Err(ConfigError::Invalid(format!(
                    "'{}.{}' must be a string, boolean or integer",
                    section, key
                ))),
            },
        }
    }
}

impl fmt::Display for ConfigValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConfigValue::Bool(b) => write!(f, "{}", b),
            ConfigValue::Int(n) => write!(f, "{}", n),
            ConfigValue::Str(s) => f.write_str(s),
        }
    }
}

fn parse_bool(value: &str) -> Option<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "true" | "on" | "yes" | "1" => Some(true),
        "false" | "off" | "no" | "0" => Some(false),
        _ => None,
    }
}

/// One entry of the document
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ConfigEntry {
    pub section: String,
    pub key: String,
    pub value: ConfigValue,
    pub type_hint: TypeHint,
}

fn invalid_document() -> ConfigError {
    ConfigError::Invalid("config document is invalid".to_string())
}

/// The whole settings document
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ConfigDocument {
    sections: BTreeMap<String, BTreeMap<String, ConfigValue>>,
}

impl ConfigDocument {
    pub fn new() -> Self {
        Self::default()
    }

    /// Parse a TOML document. Every top-level item must be a table of scalars.
    pub fn parse(text: &str) -> Result<Self, ConfigError> {
        // Parser output quotes file content; it is logged, never returned
        let table: toml::Table = text.parse().map_err(|e| {
            warn!("Config document is not valid TOML: {}", e);
            invalid_document()
        })?;

        let mut doc = Self::new();
        for (section, items) in table {
            let items = items.as_table().ok_or_else(|| {
                warn!(section = %section, "Config top-level item is not a section");
                invalid_document()
            })?;
            for (key, value) in items {
                let value = ConfigValue::from_toml(value).ok_or_else(|| {
                    warn!(section = %section, key = %key, "Config value has an unsupported type");
                    invalid_document()
                })?;
                doc.insert(&section, key, value);
            }
        }

        doc.validate()?;
        Ok(doc)
    }

    /// Serialize to TOML
    pub fn render(&self) -> String {
        let mut table = toml::Table::new();
        for (section, items) in &self.sections {
            let items: toml::Table = items
                .iter()
                .map(|(k, v)| (k.clone(), v.to_toml()))
                .collect();
            table.insert(section.clone(), toml::Value::Table(items));
        }
        toml::to_string(&table).unwrap_or_default()
    }

    /// Check every typed key carries its schema type
    pub fn validate(&self) -> Result<(), ConfigError> {
        for (section, items) in &self.sections {
            for (key, value) in items {
                if let Some(hint) = schema_hint(section, key) {
                    if value.type_hint() != hint {
                        return Err(ConfigError::Invalid(format!(
                            "'{}.{}' must be of type {:?}",
                            section, key, hint
                        )));
                    }
                }
            }
        }

        if let Some(port) = self.get("server", "port").and_then(ConfigValue::as_int) {
            if !(1..=65535).contains(&port) {
                return Err(ConfigError::Invalid(
                    "'server.port' must be between 1 and 65535".to_string(),
                ));
            }
        }

        Ok(())
    }

    pub fn get(&self, section: &str, key: &str) -> Option<&ConfigValue> {
        self.sections.get(section).and_then(|items| items.get(key))
    }

    pub fn get_str(&self, section: &str, key: &str) -> Option<&str> {
        self.get(section, key).and_then(ConfigValue::as_str)
    }

    pub fn get_bool(&self, section: &str, key: &str) -> Option<bool> {
        self.get(section, key).and_then(ConfigValue::as_bool)
    }

    pub fn get_int(&self, section: &str, key: &str) -> Option<i64> {
        self.get(section, key).and_then(ConfigValue::as_int)
    }

    pub fn has_section(&self, section: &str) -> bool {
        self.sections.contains_key(section)
    }

    pub fn sections(&self) -> Vec<String> {
        self.sections.keys().cloned().collect()
    }

    /// Entries of one section, in key order
    pub fn entries(&self, section: &str) -> Vec<ConfigEntry> {
        self.sections
            .get(section)
            .map(|items| {
                items
                    .iter()
                    .map(|(key, value)| ConfigEntry {
                        section: section.to_string(),
                        key: key.clone(),
                        value: value.clone(),
                        type_hint: value.type_hint(),
                    })
                    .collect()
            })
            .unwrap_or_default()
    }

    pub fn insert(&mut self, section: &str, key: &str, value: ConfigValue) {
        self.sections
            .entry(section.to_string())
            .or_default()
            .insert(key.to_string(), value);
    }

    /// Remove a key; an emptied section is removed too
    pub fn remove(&mut self, section: &str, key: &str) -> Option<ConfigValue> {
        let items = self.sections.get_mut(section)?;
        let removed = items.remove(key);
        if items.is_empty() {
            self.sections.remove(section);
        }
        removed
    }
}

/// Concurrency-safe persisted settings
pub struct ConfigStore {
    path: PathBuf,
    snapshot: RwLock<Arc<ConfigDocument>>,
    writer: Mutex<()>,
}

impl ConfigStore {
    /// Open the document at `path`, writing `defaults()` if it does not exist
    pub async fn open<F>(path: impl Into<PathBuf>, defaults: F) -> Result<Self, ConfigError>
    where
        F: FnOnce() -> Result<ConfigDocument, ConfigError>,
    {
        let path = path.into();

        let doc = match tokio::fs::read_to_string(&path).await {
            Ok(text) => ConfigDocument::parse(&text)?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                let doc = defaults()?;
                doc.validate()?;

                if let Some(parent) = path.parent() {
                    tokio::fs::create_dir_all(parent).await.map_err(|e| {
                        warn!("Failed to create config directory {}: {}", parent.display(), e);
                        ConfigError::IoFailure
                    })?;
                }
                atomic::replace_file(&path, doc.render().as_bytes(), Some(0o600))
                    .await
                    .map_err(|e| {
                        warn!("Failed to write default config {}: {}", path.display(), e);
                        ConfigError::IoFailure
                    })?;

                info!("Created default config at {}", path.display());
                doc
            }
            Err(e) => {
                warn!("Failed to read config {}: {}", path.display(), e);
                return Err(ConfigError::IoFailure);
            }
        };

        Ok(Self {
            path,
            snapshot: RwLock::new(Arc::new(doc)),
            writer: Mutex::new(()),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Last committed document
    pub fn snapshot(&self) -> Arc<ConfigDocument> {
        self.snapshot.read().clone()
    }

    /// Value of `section.key`
    pub fn get(&self, section: &str, key: &str) -> Result<ConfigValue, ConfigError> {
        self.snapshot()
            .get(section, key)
            .cloned()
            .ok_or_else(|| ConfigError::NotFound(format!("Setting {}.{}", section, key)))
    }

    /// All entries of a section
    pub fn section(&self, section: &str) -> Result<Vec<ConfigEntry>, ConfigError> {
        let doc = self.snapshot();
        if !doc.has_section(section) {
            return Err(ConfigError::NotFound(format!("Section {}", section)));
        }
        Ok(doc.entries(section))
    }

    pub fn sections(&self) -> Vec<String> {
        self.snapshot().sections()
    }

    /// Set one value
    pub async fn set(&self, section: &str, key: &str, value: ConfigValue) -> Result<(), ConfigError> {
        if let Some(hint) = schema_hint(section, key) {
            if value.type_hint() != hint {
                return Err(ConfigError::Invalid(format!(
                    "'{}.{}' must be of type {:?}",
                    section, key, hint
                )));
            }
        }

        self.update(|doc| {
            doc.insert(section, key, value.clone());
            Ok(())
        })
        .await
    }

    /// Remove one value
    pub async fn remove(&self, section: &str, key: &str) -> Result<ConfigValue, ConfigError> {
        self.update(|doc| {
            doc.remove(section, key)
                .ok_or_else(|| ConfigError::NotFound(format!("Setting {}.{}", section, key)))
        })
        .await
    }

    /// Run a read-modify-write cycle
    ///
    /// `mutate` may run more than once if the file changes underneath the
    /// cycle; each run sees the fresh document.
    pub async fn update<F, T>(&self, mut mutate: F) -> Result<T, ConfigError>
    where
        F: FnMut(&mut ConfigDocument) -> Result<T, ConfigError>,
    {
        let _guard = self.writer.lock().await;
        let mut backoff = INITIAL_BACKOFF;

        for attempt in 1..=MAX_COMMIT_ATTEMPTS {
            let (mut doc, digest) = self.read_live().await?;
            let result = mutate(&mut doc)?;
            doc.validate()?;

            let temp = atomic::temp_sibling(&self.path);
            if let Err(e) = atomic::write_synced(&temp, doc.render().as_bytes(), Some(0o600)).await {
                warn!("Failed to write config temp file: {}", e);
                tokio::fs::remove_file(&temp).await.ok();
                return Err(ConfigError::IoFailure);
            }

            let (_, current) = self.read_live().await?;
            if current != digest {
                tokio::fs::remove_file(&temp).await.ok();
                warn!(
                    "Config file changed during update (attempt {}/{}), retrying",
                    attempt, MAX_COMMIT_ATTEMPTS
                );
                tokio::time::sleep(backoff).await;
                backoff *= 2;
                continue;
            }

            if let Err(e) = tokio::fs::rename(&temp, &self.path).await {
                warn!("Failed to commit config file: {}", e);
                tokio::fs::remove_file(&temp).await.ok();
                return Err(ConfigError::IoFailure);
            }

            *self.snapshot.write() = Arc::new(doc);
            debug!("Committed config update to {}", self.path.display());
            return Ok(result);
        }

        Err(ConfigError::WriteConflict)
    }

    /// Re-read the live file into the snapshot
    pub async fn reload(&self) -> Result<(), ConfigError> {
        let _guard = self.writer.lock().await;
        let (doc, _) = self.read_live().await?;
        *self.snapshot.write() = Arc::new(doc);
        Ok(())
    }

    /// Parse the live file and hash its bytes. A missing file falls back to
    /// the committed snapshot.
    async fn read_live(&self) -> Result<(ConfigDocument, Option<String>), ConfigError> {
        match tokio::fs::read(&self.path).await {
            Ok(bytes) => {
                let digest = hex::encode(Sha256::digest(&bytes));
                let text = String::from_utf8(bytes).map_err(|_| {
                    warn!("Config file {} is not valid UTF-8", self.path.display());
                    invalid_document()
                })?;
                Ok((ConfigDocument::parse(&text)?, Some(digest)))
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                warn!("Config file {} missing, rebuilding from memory", self.path.display());
                Ok((self.snapshot().as_ref().clone(), None))
            }
            Err(e) => {
                warn!("Failed to read config {}: {}", self.path.display(), e);
                Err(ConfigError::IoFailure)
            }
        }
    }
}
