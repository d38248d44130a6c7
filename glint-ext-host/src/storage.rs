//! Per-extension key-value storage
//!
//! A small JSON object persisted in the extension's private root. Every
//! [`Storage::set`] rewrites the file synchronously. Reading and writing
//! never fails from the caller's point of view: a missing or corrupt file
//! loads as empty and write errors are logged.

use serde_json::{Map, Value};
use std::path::{Path, PathBuf};

/// Persisted string → JSON value map
#[derive(Debug, Clone)]
pub struct Storage {
    path: PathBuf,
    data: Map<String, Value>,
}

impl Storage {
    /// Open storage backed by `path`, reading it if present
    pub fn open(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let data = Self::load(&path);
        Self { path, data }
    }

    fn load(path: &Path) -> Map<String, Value> {
        let text = match std::fs::read_to_string(path) {
            Ok(text) => text,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Map::new(),
            Err(e) => {
                tracing::warn!(path = %path.display(), error = %e, "Failed to read storage");
                return Map::new();
            }
        };

        match serde_json::from_str::<Value>(&text) {
            Ok(Value::Object(map)) => map,
            Ok(_) => {
                tracing::warn!(path = %path.display(), "Storage file is not a JSON object, starting empty");
                Map::new()
            }
            Err(e) => {
                tracing::warn!(path = %path.display(), error = %e, "Corrupt storage file, starting empty");
                Map::new()
            }
        }
    }

    /// Backing file path
    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.data.get(key)
    }

    /// Value for `key`, or `default` when absent
    pub fn get_or(&self, key: &str, default: impl Into<Value>) -> Value {
        self.data.get(key).cloned().unwrap_or_else(|| default.into())
    }

    /// Store a value and persist immediately
    pub fn set(&mut self, key: impl Into<String>, value: impl Into<Value>) {
        self.data.insert(key.into(), value.into());
        self.save();
    }

    /// Remove a value and persist immediately
    pub fn remove(&mut self, key: &str) -> Option<Value> {
        let removed = self.data.remove(key);
        if removed.is_some() {
            self.save();
        }
        removed
    }

    pub fn contains(&self, key: &str) -> bool {
        self.data.contains_key(key)
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.data.keys().map(String::as_str)
    }

    fn save(&self) {
        if let Err(e) = self.try_save() {
            tracing::warn!(path = %self.path.display(), error = %e, "Failed to write storage");
        }
    }

    fn try_save(&self) -> std::io::Result<()> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let text = serde_json::to_string_pretty(&self.data)?;
        std::fs::write(&self.path, text)
    }
}
