use async_trait::async_trait;
use chrono::Utc;
use eyre::{eyre, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::Duration;

#[async_trait]
pub trait KvStore: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<String>>;
    async fn put(&self, key: &str, value: &str, ttl: Option<Duration>) -> Result<()>;
    async fn delete(&self, key: &str) -> Result<()>;
    async fn list_prefix(&self, prefix: &str, limit: usize) -> Result<Vec<String>>;

    /// Best-effort mutual exclusion: writes `key` only if absent. Returns
    /// `true` if this call won the claim. Racy by construction. The real
    /// defense is a dedupe key stamped on success, never this claim alone.
    async fn claim(&self, key: &str, ttl: Duration) -> Result<bool> {
        if self.get(key).await?.is_some() {
            return Ok(false);
        }
        self.put(key, "1", Some(ttl)).await?;
        Ok(true)
    }

    async fn exists(&self, key: &str) -> Result<bool> {
        Ok(self.get(key).await?.is_some())
    }
}

#[derive(Clone)]
struct Entry {
    value: String,
    expires_at: Option<chrono::DateTime<Utc>>,
}

impl Entry {
    fn is_live(&self) -> bool {
        match self.expires_at {
            Some(exp) => exp > Utc::now(),
            None => true,
        }
    }
}

/// In-memory store behind a mutex. Used by tests and by the admin
/// `simulate` subcommand, which must never touch production state.
#[derive(Default)]
pub struct MemoryKvStore {
    inner: Mutex<HashMap<String, Entry>>,
}

impl MemoryKvStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl KvStore for MemoryKvStore {
    async fn get(&self, key: &str) -> Result<Option<String>> {
        let mut guard = self.inner.lock().map_err(|_| eyre!("kv mutex poisoned"))?;
        let live = guard.get(key).map(|e| e.is_live()).unwrap_or(false);
        if !live {
            guard.remove(key);
            return Ok(None);
        }
        Ok(guard.get(key).map(|e| e.value.clone()))
    }

    async fn put(&self, key: &str, value: &str, ttl: Option<Duration>) -> Result<()> {
        let mut guard = self.inner.lock().map_err(|_| eyre!("kv mutex poisoned"))?;
        let expires_at = ttl.map(|d| Utc::now() + chrono::Duration::from_std(d).unwrap_or_default());
        guard.insert(
            key.to_string(),
            Entry {
                value: value.to_string(),
                expires_at,
            },
        );
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<()> {
        let mut guard = self.inner.lock().map_err(|_| eyre!("kv mutex poisoned"))?;
        guard.remove(key);
        Ok(())
    }

    async fn list_prefix(&self, prefix: &str, limit: usize) -> Result<Vec<String>> {
        let mut guard = self.inner.lock().map_err(|_| eyre!("kv mutex poisoned"))?;
        guard.retain(|_, e| e.is_live());
        let mut keys: Vec<String> = guard
            .keys()
            .filter(|k| k.starts_with(prefix))
            .cloned()
            .collect();
        keys.sort();
        keys.truncate(limit);
        Ok(keys)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
struct FileDocument {
    entries: HashMap<String, FileEntry>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct FileEntry {
    value: String,
    expires_at: Option<chrono::DateTime<Utc>>,
}

/// A single JSON document on disk, rewritten atomically (write-to-temp,
/// then rename) on every mutation.
pub struct FileKvStore {
    path: PathBuf,
    doc: Mutex<FileDocument>,
}

impl FileKvStore {
    pub fn load_or_init(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let doc = if path.exists() {
            let raw = fs::read_to_string(&path)
                .map_err(|e| eyre!("failed to read kv file {}: {e}", path.display()))?;
            serde_json::from_str(&raw)
                .map_err(|e| eyre!("failed to parse kv file {}: {e}", path.display()))?
        } else {
            if let Some(parent) = path.parent() {
                if !parent.as_os_str().is_empty() {
                    fs::create_dir_all(parent).map_err(|e| {
                        eyre!("failed to create kv directory {}: {e}", parent.display())
                    })?;
                }
            }
            FileDocument::default()
        };
        let store = Self {
            path,
            doc: Mutex::new(doc),
        };
        store.save()?;
        Ok(store)
    }

    fn save(&self) -> Result<()> {
        let guard = self.doc.lock().map_err(|_| eyre!("kv mutex poisoned"))?;
        let json = serde_json::to_string_pretty(&*guard)
            .map_err(|e| eyre!("failed to serialize kv document: {e}"))?;
        let tmp_path = self.path.with_extension("json.tmp");
        fs::write(&tmp_path, json)
            .map_err(|e| eyre!("failed to write temp kv file {}: {e}", tmp_path.display()))?;
        if let Err(err) = fs::rename(&tmp_path, &self.path) {
            if cfg!(windows) {
                let _ = fs::remove_file(&self.path);
                fs::rename(&tmp_path, &self.path)
                    .map_err(|e| eyre!("failed to replace kv file {}: {e}", self.path.display()))?;
            } else {
                return Err(eyre!(
                    "failed to replace kv file {}: {err}",
                    self.path.display()
                ));
            }
        }
        Ok(())
    }
}

#[async_trait]
impl KvStore for FileKvStore {
    async fn get(&self, key: &str) -> Result<Option<String>> {
        let mut guard = self.doc.lock().map_err(|_| eyre!("kv mutex poisoned"))?;
        let live = guard
            .entries
            .get(key)
            .map(|e| e.expires_at.map(|exp| exp > Utc::now()).unwrap_or(true))
            .unwrap_or(false);
        if !live {
            guard.entries.remove(key);
            return Ok(None);
        }
        Ok(guard.entries.get(key).map(|e| e.value.clone()))
    }

    async fn put(&self, key: &str, value: &str, ttl: Option<Duration>) -> Result<()> {
        {
            let mut guard = self.doc.lock().map_err(|_| eyre!("kv mutex poisoned"))?;
            let expires_at =
                ttl.map(|d| Utc::now() + chrono::Duration::from_std(d).unwrap_or_default());
            guard.entries.insert(
                key.to_string(),
                FileEntry {
                    value: value.to_string(),
                    expires_at,
                },
            );
        }
        self.save()
    }

    async fn delete(&self, key: &str) -> Result<()> {
        {
            let mut guard = self.doc.lock().map_err(|_| eyre!("kv mutex poisoned"))?;
            guard.entries.remove(key);
        }
        self.save()
    }

    async fn list_prefix(&self, prefix: &str, limit: usize) -> Result<Vec<String>> {
        let mut guard = self.doc.lock().map_err(|_| eyre!("kv mutex poisoned"))?;
        let now = Utc::now();
        guard
            .entries
            .retain(|_, e| e.expires_at.map(|exp| exp > now).unwrap_or(true));
        let mut keys: Vec<String> = guard
            .entries
            .keys()
            .filter(|k| k.starts_with(prefix))
            .cloned()
            .collect();
        keys.sort();
        keys.truncate(limit);
        Ok(keys)
    }
}
