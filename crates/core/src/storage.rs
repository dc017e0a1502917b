//! Path-keyed key/value storage.
//!
//! Keys are segment vectors (`["message", session_id, message_id]`);
//! values are arbitrary JSON blobs. The backend is a trait so a hosted
//! variant can substitute remote row storage for chosen prefixes — the
//! rest of the system only ever sees the [`Storage`] facade and must not
//! observe which backend is in use.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use parking_lot::Mutex;
use serde_json::Value;

use maestro_domain::{Error, Result};

/// Object-safe storage contract. Writes are durable before the call
/// returns; `list` is consistent with same-process writes; concurrent
/// writes to one key are serialized by the implementation.
pub trait StorageBackend: Send + Sync {
    fn write(&self, key: &[String], value: Value) -> Result<()>;
    fn read(&self, key: &[String]) -> Result<Option<Value>>;
    fn remove(&self, key: &[String]) -> Result<()>;
    fn list(&self, prefix: &[String]) -> Result<Vec<Vec<String>>>;
    fn clear(&self) -> Result<()>;
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Local backend
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// In-memory map with an optional JSON file mirror. With a root directory
/// configured, each key persists at `{root}/{a}/{b}/{c}.json` and survives
/// process restarts; without one, storage is purely in-memory (tests).
pub struct LocalStorage {
    data: Mutex<BTreeMap<String, Value>>,
    root: Option<PathBuf>,
}

impl LocalStorage {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            data: Mutex::new(BTreeMap::new()),
            root: Some(root.into()),
        }
    }

    /// Purely in-memory storage, no file mirror.
    pub fn in_memory() -> Self {
        Self {
            data: Mutex::new(BTreeMap::new()),
            root: None,
        }
    }

    fn join_key(key: &[String]) -> String {
        key.join("/")
    }

    fn file_path(root: &Path, key: &[String]) -> PathBuf {
        let mut path = root.to_path_buf();
        for segment in &key[..key.len() - 1] {
            path.push(segment);
        }
        path.push(format!("{}.json", key[key.len() - 1]));
        path
    }
}

impl StorageBackend for LocalStorage {
    fn write(&self, key: &[String], value: Value) -> Result<()> {
        if key.is_empty() {
            return Err(Error::Other("empty storage key".into()));
        }
        let mut data = self.data.lock();
        if let Some(root) = &self.root {
            let path = Self::file_path(root, key);
            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent)?;
            }
            std::fs::write(&path, serde_json::to_vec(&value)?)?;
        }
        data.insert(Self::join_key(key), value);
        Ok(())
    }

    fn read(&self, key: &[String]) -> Result<Option<Value>> {
        if key.is_empty() {
            return Ok(None);
        }
        let mut data = self.data.lock();
        let path_key = Self::join_key(key);
        if let Some(value) = data.get(&path_key) {
            return Ok(Some(value.clone()));
        }
        // Fall back to the file mirror and cache the hit.
        if let Some(root) = &self.root {
            let path = Self::file_path(root, key);
            if path.exists() {
                let value: Value = serde_json::from_slice(&std::fs::read(&path)?)?;
                data.insert(path_key, value.clone());
                return Ok(Some(value));
            }
        }
        Ok(None)
    }

    fn remove(&self, key: &[String]) -> Result<()> {
        if key.is_empty() {
            return Ok(());
        }
        let mut data = self.data.lock();
        data.remove(&Self::join_key(key));
        if let Some(root) = &self.root {
            let path = Self::file_path(root, key);
            if path.exists() {
                std::fs::remove_file(&path)?;
            }
        }
        Ok(())
    }

    fn list(&self, prefix: &[String]) -> Result<Vec<Vec<String>>> {
        let data = self.data.lock();
        let prefix_path = format!("{}/", Self::join_key(prefix));
        let mut keys: Vec<Vec<String>> = data
            .keys()
            .filter(|k| k.starts_with(&prefix_path))
            .map(|k| k.split('/').map(String::from).collect())
            .collect();

        // Include keys only present on disk (written by a prior process).
        if let Some(root) = &self.root {
            let mut dir = root.clone();
            for segment in prefix {
                dir.push(segment);
            }
            if dir.is_dir() {
                for entry in std::fs::read_dir(&dir)? {
                    let entry = entry?;
                    if entry.path().extension().and_then(|e| e.to_str()) == Some("json") {
                        if let Some(stem) = entry.path().file_stem().and_then(|s| s.to_str()) {
                            let mut key: Vec<String> = prefix.to_vec();
                            key.push(stem.to_owned());
                            if !keys.contains(&key) {
                                keys.push(key);
                            }
                        }
                    }
                }
            }
        }

        keys.sort();
        Ok(keys)
    }

    fn clear(&self) -> Result<()> {
        self.data.lock().clear();
        Ok(())
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Facade
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// The storage handle the rest of the system is built on.
#[derive(Clone)]
pub struct Storage {
    backend: Arc<dyn StorageBackend>,
}

impl Storage {
    pub fn new(backend: Arc<dyn StorageBackend>) -> Self {
        Self { backend }
    }

    /// Local storage mirrored under `root`.
    pub fn local(root: impl Into<PathBuf>) -> Self {
        Self::new(Arc::new(LocalStorage::new(root)))
    }

    /// In-memory storage for tests and ephemeral hosts.
    pub fn in_memory() -> Self {
        Self::new(Arc::new(LocalStorage::in_memory()))
    }

    pub fn write(&self, key: &[String], value: Value) -> Result<()> {
        self.backend.write(key, value)
    }

    pub fn read(&self, key: &[String]) -> Result<Option<Value>> {
        self.backend.read(key)
    }

    /// Read, erroring with `NotFound` when the key is absent.
    pub fn read_or_raise(&self, key: &[String]) -> Result<Value> {
        self.backend
            .read(key)?
            .ok_or_else(|| Error::not_found(key))
    }

    /// Read-modify-write under the backend's serialization guarantees.
    /// The key must exist.
    pub fn update<F>(&self, key: &[String], mutate: F) -> Result<Value>
    where
        F: FnOnce(&mut Value),
    {
        let mut value = self.read_or_raise(key)?;
        mutate(&mut value);
        self.backend.write(key, value.clone())?;
        Ok(value)
    }

    pub fn remove(&self, key: &[String]) -> Result<()> {
        self.backend.remove(key)
    }

    pub fn list(&self, prefix: &[String]) -> Result<Vec<Vec<String>>> {
        self.backend.list(prefix)
    }

    pub fn clear(&self) -> Result<()> {
        self.backend.clear()
    }
}

/// Convenience: build a key vector from string-ish segments.
pub fn key(segments: &[&str]) -> Vec<String> {
    segments.iter().map(|s| (*s).to_owned()).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn write_read_roundtrip() {
        let storage = Storage::in_memory();
        let k = key(&["session", "ses_1"]);
        storage
            .write(&k, serde_json::json!({"title": "hello"}))
            .unwrap();

        let value = storage.read(&k).unwrap().unwrap();
        assert_eq!(value["title"], "hello");
    }

    #[test]
    fn read_missing_returns_none() {
        let storage = Storage::in_memory();
        assert!(storage.read(&key(&["nope"])).unwrap().is_none());
    }

    #[test]
    fn read_or_raise_errors_with_key_path() {
        let storage = Storage::in_memory();
        let err = storage
            .read_or_raise(&key(&["session", "ses_x"]))
            .unwrap_err();
        assert!(err.to_string().contains("session/ses_x"));
    }

    #[test]
    fn update_mutates_in_place() {
        let storage = Storage::in_memory();
        let k = key(&["todo", "ses_1"]);
        storage.write(&k, serde_json::json!({"count": 1})).unwrap();

        let updated = storage
            .update(&k, |v| v["count"] = serde_json::json!(2))
            .unwrap();
        assert_eq!(updated["count"], 2);
        assert_eq!(storage.read(&k).unwrap().unwrap()["count"], 2);
    }

    #[test]
    fn update_missing_key_errors() {
        let storage = Storage::in_memory();
        assert!(storage.update(&key(&["missing"]), |_| {}).is_err());
    }

    #[test]
    fn remove_is_idempotent() {
        let storage = Storage::in_memory();
        let k = key(&["session", "ses_1"]);
        storage.write(&k, serde_json::json!({})).unwrap();
        storage.remove(&k).unwrap();
        storage.remove(&k).unwrap();
        assert!(storage.read(&k).unwrap().is_none());
    }

    #[test]
    fn list_returns_keys_under_prefix_only() {
        let storage = Storage::in_memory();
        storage
            .write(&key(&["message", "s1", "m1"]), serde_json::json!({}))
            .unwrap();
        storage
            .write(&key(&["message", "s1", "m2"]), serde_json::json!({}))
            .unwrap();
        storage
            .write(&key(&["message", "s2", "m3"]), serde_json::json!({}))
            .unwrap();

        let keys = storage.list(&key(&["message", "s1"])).unwrap();
        assert_eq!(keys.len(), 2);
        assert!(keys.iter().all(|k| k[1] == "s1"));
    }

    #[test]
    fn clear_drops_everything() {
        let storage = Storage::in_memory();
        storage.write(&key(&["a", "b"]), serde_json::json!(1)).unwrap();
        storage.clear().unwrap();
        assert!(storage.read(&key(&["a", "b"])).unwrap().is_none());
    }

    #[test]
    fn file_mirror_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let k = key(&["session", "ses_1"]);
        {
            let storage = Storage::local(dir.path());
            storage
                .write(&k, serde_json::json!({"title": "persisted"}))
                .unwrap();
        }

        let storage = Storage::local(dir.path());
        let value = storage.read(&k).unwrap().unwrap();
        assert_eq!(value["title"], "persisted");

        let keys = storage.list(&key(&["session"])).unwrap();
        assert_eq!(keys, vec![k]);
    }

    #[test]
    fn file_mirror_remove_deletes_file() {
        let dir = tempfile::tempdir().unwrap();
        let storage = Storage::local(dir.path());
        let k = key(&["message", "s1", "m1"]);
        storage.write(&k, serde_json::json!({})).unwrap();
        storage.remove(&k).unwrap();

        let reopened = Storage::local(dir.path());
        assert!(reopened.read(&k).unwrap().is_none());
    }
}
