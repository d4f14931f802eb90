//! Key-value store for secrets that must survive restarts, such as the
//! store's own master key.

use super::{DatabaseError, Result};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, PoisonError};

/// Persistent string settings.
///
/// Implementations are expected to keep their backing file out of reach of
/// other users; the values are not encrypted by this layer.
pub trait SecureSettings: Send + Sync {
    fn get_string(&self, key: &str) -> Result<Option<String>>;

    /// Stores `value`, or removes the key when `value` is `None`.
    fn put_string(&self, key: &str, value: Option<&str>) -> Result<()>;
}

/// Settings kept as a JSON object in a single file.
pub struct FileSettings {
    path: PathBuf,
    lock: Mutex<()>,
}

impl FileSettings {
    pub fn new<P: AsRef<Path>>(path: P) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
            lock: Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn read_all(&self) -> Result<BTreeMap<String, String>> {
        if !self.path.exists() {
            return Ok(BTreeMap::new());
        }
        let content = fs::read_to_string(&self.path)?;
        if content.trim().is_empty() {
            return Ok(BTreeMap::new());
        }
        serde_json::from_str(&content).map_err(|e| {
            DatabaseError::Settings(format!("{}: {}", self.path.display(), e))
        })
    }

    fn write_all(&self, values: &BTreeMap<String, String>) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)?;
        }
        let content = serde_json::to_string_pretty(values)?;
        let tmp = self.path.with_extension("tmp");
        fs::write(&tmp, content)?;
        fs::rename(&tmp, &self.path)?;
        Ok(())
    }
}

impl SecureSettings for FileSettings {
    fn get_string(&self, key: &str) -> Result<Option<String>> {
        let _guard = self.lock.lock().unwrap_or_else(PoisonError::into_inner);
        Ok(self.read_all()?.remove(key))
    }

    fn put_string(&self, key: &str, value: Option<&str>) -> Result<()> {
        let _guard = self.lock.lock().unwrap_or_else(PoisonError::into_inner);
        let mut values = self.read_all()?;
        match value {
            Some(value) => values.insert(key.to_string(), value.to_string()),
            None => values.remove(key),
        };
        self.write_all(&values)
    }
}

/// In-memory settings, for tests and ephemeral sessions.
#[derive(Default)]
pub struct MemorySettings {
    values: Mutex<BTreeMap<String, String>>,
}

impl MemorySettings {
    pub fn new() -> Self {
        Self::default()
    }
}

impl SecureSettings for MemorySettings {
    fn get_string(&self, key: &str) -> Result<Option<String>> {
        let values = self.values.lock().unwrap_or_else(PoisonError::into_inner);
        Ok(values.get(key).cloned())
    }

    fn put_string(&self, key: &str, value: Option<&str>) -> Result<()> {
        let mut values = self.values.lock().unwrap_or_else(PoisonError::into_inner);
        match value {
            Some(value) => values.insert(key.to_string(), value.to_string()),
            None => values.remove(key),
        };
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_file_settings_persist() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("nested").join("settings.json");

        let settings = FileSettings::new(&path);
        assert_eq!(settings.get_string("database_key").unwrap(), None);
        settings.put_string("database_key", Some("abc")).unwrap();
        settings.put_string("other", Some("1")).unwrap();

        let reopened = FileSettings::new(&path);
        assert_eq!(reopened.get_string("database_key").unwrap().as_deref(), Some("abc"));

        reopened.put_string("database_key", None).unwrap();
        assert_eq!(settings.get_string("database_key").unwrap(), None);
        assert_eq!(settings.get_string("other").unwrap().as_deref(), Some("1"));
    }

    #[test]
    fn test_file_settings_corrupt_file() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("settings.json");
        std::fs::write(&path, "not json").unwrap();

        let err = FileSettings::new(&path).get_string("x").unwrap_err();
        assert!(matches!(err, DatabaseError::Settings(_)));
    }

    #[test]
    fn test_memory_settings() {
        let settings = MemorySettings::new();
        settings.put_string("k", Some("v")).unwrap();
        assert_eq!(settings.get_string("k").unwrap().as_deref(), Some("v"));
        settings.put_string("k", None).unwrap();
        assert_eq!(settings.get_string("k").unwrap(), None);
    }
}
