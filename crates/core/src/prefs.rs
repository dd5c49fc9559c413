//! Boolean preference storage for the analytics opt-in flag.

use std::{
    collections::BTreeMap,
    fs,
    io::Write,
    path::{Path, PathBuf},
    sync::Mutex,
};

use crate::error::{Result, TelemetryError};

pub const OPT_IN_KEY: &str = "analytics_opt_in";

pub trait PreferenceStore: Send + Sync {
    fn get_bool(&self, key: &str) -> Option<bool>;
    fn set_bool(&self, key: &str, value: bool) -> Result<()>;
}

#[derive(Debug, Default)]
pub struct MemoryPreferences {
    values: Mutex<BTreeMap<String, bool>>,
}

impl MemoryPreferences {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(key: &str, value: bool) -> Self {
        let prefs = Self::default();
        prefs
            .values
            .lock()
            .expect("MemoryPreferences poisoned")
            .insert(key.to_string(), value);
        prefs
    }
}

impl PreferenceStore for MemoryPreferences {
    fn get_bool(&self, key: &str) -> Option<bool> {
        self.values
            .lock()
            .expect("MemoryPreferences poisoned")
            .get(key)
            .copied()
    }

    fn set_bool(&self, key: &str, value: bool) -> Result<()> {
        self.values
            .lock()
            .expect("MemoryPreferences poisoned")
            .insert(key.to_string(), value);
        Ok(())
    }
}

/// Preferences kept in a flat JSON object on disk.
///
/// Every write rewrites the whole file through a temp file and a rename, so a
/// crash leaves either the old or the new contents.
#[derive(Debug)]
pub struct FilePreferences {
    path: PathBuf,
    values: Mutex<BTreeMap<String, bool>>,
}

impl FilePreferences {
    pub fn default_path() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("/tmp"))
            .join("telespool")
            .join("prefs.json")
    }

    /// Load from `path`. A missing file is an empty store.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let values = match fs::read_to_string(&path) {
            Ok(content) if content.trim().is_empty() => BTreeMap::new(),
            Ok(content) => serde_json::from_str(&content).map_err(|e| {
                TelemetryError::Preferences(format!("{}: {e}", path.display()))
            })?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => BTreeMap::new(),
            Err(e) => return Err(e.into()),
        };
        Ok(Self {
            path,
            values: Mutex::new(values),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn persist(&self, values: &BTreeMap<String, bool>) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)?;
        }
        let tmp = self.path.with_extension("json.tmp");
        let mut file = fs::File::create(&tmp)?;
        file.write_all(&serde_json::to_vec_pretty(values)?)?;
        file.sync_all()?;
        fs::rename(&tmp, &self.path)?;
        Ok(())
    }
}

impl PreferenceStore for FilePreferences {
    fn get_bool(&self, key: &str) -> Option<bool> {
        self.values
            .lock()
            .expect("FilePreferences poisoned")
            .get(key)
            .copied()
    }

    fn set_bool(&self, key: &str, value: bool) -> Result<()> {
        let mut values = self.values.lock().expect("FilePreferences poisoned");
        let previous = values.insert(key.to_string(), value);
        if let Err(e) = self.persist(&values) {
            match previous {
                Some(old) => values.insert(key.to_string(), old),
                None => values.remove(key),
            };
            return Err(e);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_memory_store() {
        let prefs = MemoryPreferences::new();
        assert_eq!(prefs.get_bool(OPT_IN_KEY), None);
        prefs.set_bool(OPT_IN_KEY, false).unwrap();
        assert_eq!(prefs.get_bool(OPT_IN_KEY), Some(false));
    }

    #[test]
    fn test_file_store_persists_across_opens() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("prefs.json");

        let prefs = FilePreferences::open(&path).unwrap();
        assert_eq!(prefs.get_bool(OPT_IN_KEY), None);
        prefs.set_bool(OPT_IN_KEY, false).unwrap();

        let reopened = FilePreferences::open(&path).unwrap();
        assert_eq!(reopened.get_bool(OPT_IN_KEY), Some(false));
        assert!(!path.with_extension("json.tmp").exists());
    }

    #[test]
    fn test_corrupt_file_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("prefs.json");
        fs::write(&path, "{not json").unwrap();
        let err = FilePreferences::open(&path).unwrap_err();
        assert!(matches!(err, TelemetryError::Preferences(_)));
    }

    #[test]
    fn test_default_path() {
        assert!(FilePreferences::default_path().ends_with("telespool/prefs.json"));
    }
}
