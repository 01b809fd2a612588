//! Process-wide key/value settings.
//!
//! A single JSON object, stringified with sorted keys on write. Reads
//! tolerate a missing file. Writes take a coarse lock and fail fast
//! when another writer holds it, rather than serializing.

use crate::error::{Error, Result};
use parking_lot::Mutex;
use serde_json::Value;
use std::collections::BTreeMap;
use std::path::PathBuf;

pub struct Settings {
    path: PathBuf,
    write_lock: Mutex<()>,
}

impl Settings {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            write_lock: Mutex::new(()),
        }
    }

    fn read_map(&self) -> Result<BTreeMap<String, Value>> {
        match std::fs::read_to_string(&self.path) {
            Ok(text) => Ok(serde_json::from_str(&text)?),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(BTreeMap::new()),
            Err(err) => Err(err.into()),
        }
    }

    fn write_map(&self, map: &BTreeMap<String, Value>) -> Result<()> {
        let tmp = self.path.with_extension("tmp");
        std::fs::write(&tmp, serde_json::to_string(map)?)?;
        std::fs::rename(&tmp, &self.path)?;
        Ok(())
    }

    pub fn get(&self, key: &str) -> Result<Option<Value>> {
        Ok(self.read_map()?.remove(key))
    }

    pub fn set(&self, key: &str, value: Value) -> Result<()> {
        let _guard = self.write_lock.try_lock().ok_or(Error::SettingsLocked)?;
        let mut map = self.read_map()?;
        map.insert(key.to_owned(), value);
        self.write_map(&map)
    }

    /// Returns whether the key was present.
    pub fn remove(&self, key: &str) -> Result<bool> {
        let _guard = self.write_lock.try_lock().ok_or(Error::SettingsLocked)?;
        let mut map = self.read_map()?;
        let removed = map.remove(key).is_some();
        if removed {
            self.write_map(&map)?;
        }
        Ok(removed)
    }

    #[cfg(test)]
    fn hold(&self) -> parking_lot::MutexGuard<'_, ()> {
        self.write_lock.lock()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn missing_file_reads_as_empty() {
        let dir = tempfile::tempdir().unwrap();
        let settings = Settings::new(dir.path().join("settings.json"));
        assert_eq!(settings.get("anything").unwrap(), None);
    }

    #[test]
    fn set_get_remove() {
        let dir = tempfile::tempdir().unwrap();
        let settings = Settings::new(dir.path().join("settings.json"));
        settings.set("b", json!(2)).unwrap();
        settings.set("a", json!({"nested": true})).unwrap();
        assert_eq!(settings.get("b").unwrap(), Some(json!(2)));
        assert!(settings.remove("b").unwrap());
        assert!(!settings.remove("b").unwrap());
        assert_eq!(settings.get("b").unwrap(), None);
    }

    #[test]
    fn file_is_sorted_key_json() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("settings.json");
        let settings = Settings::new(&path);
        settings.set("zebra", json!(1)).unwrap();
        settings.set("alpha", json!(2)).unwrap();
        let text = std::fs::read_to_string(&path).unwrap();
        assert!(text.find("alpha").unwrap() < text.find("zebra").unwrap());
    }

    #[test]
    fn concurrent_writer_fails_fast() {
        let dir = tempfile::tempdir().unwrap();
        let settings = Settings::new(dir.path().join("settings.json"));
        let _held = settings.hold();
        assert!(matches!(
            settings.set("k", json!(1)),
            Err(Error::SettingsLocked)
        ));
    }
}
