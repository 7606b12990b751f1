//! Content cache service
//!
//! Providers keep the bytes of their files in a cache keyed by tree path,
//! together with a timestamp and an optional content type. Each provider
//! instance gets its own namespace from the [`CacheServiceFactory`]; caches
//! are never shared between providers.
//!
//! Two backends are available: an in-memory map and a Fjall LSM keyspace.

use crate::config::CacheBackend;
use crate::error::{Result, SemanticError};
use bytes::Bytes;
use fjall::{Database, KeyspaceCreateOptions};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// Current time in milliseconds since the epoch
pub fn now_millis() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

/// Hex SHA-256 of cached content
pub fn content_digest(content: &[u8]) -> String {
    hex::encode(Sha256::digest(content))
}

/// One cached file
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheEntry {
    pub path: String,
    pub content: Bytes,
    pub timestamp: i64,
    pub content_type: Option<String>,
}

/// Path-keyed byte cache
pub trait CacheService: Send + Sync {
    fn has_content(&self, path: &str) -> Result<bool> {
        Ok(self.entry(path)?.is_some())
    }

    /// Bytes of `path`, `CachedContentNotFound` if absent
    fn get_content(&self, path: &str) -> Result<Bytes> {
        self.entry(path)?
            .map(|e| e.content)
            .ok_or_else(|| SemanticError::CachedContentNotFound(path.to_string()))
    }

    fn content_timestamp(&self, path: &str) -> Result<Option<i64>> {
        Ok(self.entry(path)?.map(|e| e.timestamp))
    }

    fn content_type(&self, path: &str) -> Result<Option<String>> {
        Ok(self.entry(path)?.and_then(|e| e.content_type))
    }

    fn entry(&self, path: &str) -> Result<Option<CacheEntry>>;

    /// Add or replace content; returns the timestamp stored
    ///
    /// Without an explicit timestamp the current time is used.
    fn add_content(&self, path: &str, content: Bytes, timestamp: Option<i64>) -> Result<i64>;

    fn set_content_timestamp(&self, path: &str, timestamp: i64) -> Result<()>;

    fn set_content_type(&self, path: &str, content_type: Option<&str>) -> Result<()>;

    fn append_content(&self, path: &str, content: &[u8], timestamp: Option<i64>) -> Result<i64> {
        let mut combined = match self.entry(path)? {
            Some(entry) => entry.content.to_vec(),
            None => Vec::new(),
        };
        combined.extend_from_slice(content);
        self.add_content(path, Bytes::from(combined), timestamp)
    }

    fn delete_content(&self, path: &str) -> Result<()>;

    /// Delete `prefix` and everything below it; returns the number of entries removed
    fn delete_recursive(&self, prefix: &str) -> Result<usize>;

    /// All cached paths
    fn paths(&self) -> Result<Vec<String>>;

    /// Make pending writes durable
    fn persist(&self) -> Result<()> {
        Ok(())
    }
}

/// `"/"` (or `""`) matches every path
fn is_at_or_below(path: &str, prefix: &str) -> bool {
    let prefix = prefix.trim_end_matches('/');
    prefix.is_empty()
        || path == prefix
        || (path.starts_with(prefix) && path.as_bytes().get(prefix.len()) == Some(&b'/'))
}

// ─────────────────────────────────────────────────────
// In-memory backend
// ─────────────────────────────────────────────────────

/// Cache held in process memory
#[derive(Default)]
pub struct MemoryCacheService {
    entries: RwLock<BTreeMap<String, CacheEntry>>,
}

impl MemoryCacheService {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn shared() -> Arc<dyn CacheService> {
        Arc::new(Self::new())
    }
}

impl CacheService for MemoryCacheService {
    fn entry(&self, path: &str) -> Result<Option<CacheEntry>> {
        Ok(self.entries.read().get(path).cloned())
    }

    fn add_content(&self, path: &str, content: Bytes, timestamp: Option<i64>) -> Result<i64> {
        let timestamp = timestamp.unwrap_or_else(now_millis);
        let mut entries = self.entries.write();
        let content_type = entries.get(path).and_then(|e| e.content_type.clone());
        entries.insert(
            path.to_string(),
            CacheEntry {
                path: path.to_string(),
                content,
                timestamp,
                content_type,
            },
        );
        Ok(timestamp)
    }

    fn set_content_timestamp(&self, path: &str, timestamp: i64) -> Result<()> {
        let mut entries = self.entries.write();
        let entry = entries
            .get_mut(path)
            .ok_or_else(|| SemanticError::CachedContentNotFound(path.to_string()))?;
        entry.timestamp = timestamp;
        Ok(())
    }

    fn set_content_type(&self, path: &str, content_type: Option<&str>) -> Result<()> {
        let mut entries = self.entries.write();
        let entry = entries
            .get_mut(path)
            .ok_or_else(|| SemanticError::CachedContentNotFound(path.to_string()))?;
        entry.content_type = content_type.map(str::to_string);
        Ok(())
    }

    fn delete_content(&self, path: &str) -> Result<()> {
        self.entries.write().remove(path);
        Ok(())
    }

    fn delete_recursive(&self, prefix: &str) -> Result<usize> {
        let mut entries = self.entries.write();
        let before = entries.len();
        entries.retain(|path, _| !is_at_or_below(path, prefix));
        Ok(before - entries.len())
    }

    fn paths(&self) -> Result<Vec<String>> {
        Ok(self.entries.read().keys().cloned().collect())
    }
}

// ─────────────────────────────────────────────────────
// Fjall backend
// ─────────────────────────────────────────────────────

/// Stored form of a cache entry inside a Fjall keyspace
#[derive(Debug, Clone, Serialize, Deserialize)]
struct StoredEntry {
    timestamp: i64,
    content_type: Option<String>,
    content: Vec<u8>,
}

/// Key under which the set of cached paths is kept
const MANIFEST_KEY: &[u8] = b"\0manifest";

/// Cache persisted in a Fjall keyspace
pub struct FjallCacheService {
    db: Arc<Database>,
    entries: fjall::Keyspace,
    /// Mirror of the manifest
    paths: RwLock<BTreeSet<String>>,
}

impl FjallCacheService {
    /// Open (or create) the keyspace `name` in `db`
    pub fn open(db: Arc<Database>, name: &str) -> Result<Self> {
        let entries = db
            .keyspace(name, || KeyspaceCreateOptions::default())
            .map_err(|e| SemanticError::Cache(format!("Failed to open keyspace {}: {}", name, e)))?;

        let paths = match entries
            .get(MANIFEST_KEY)
            .map_err(|e| SemanticError::Cache(format!("Failed to read manifest: {}", e)))?
        {
            Some(data) => {
                let bytes: &[u8] = data.as_ref();
                serde_json::from_slice(bytes)?
            }
            None => BTreeSet::new(),
        };

        Ok(Self {
            db,
            entries,
            paths: RwLock::new(paths),
        })
    }

    /// Open a standalone Fjall cache at `path`
    pub fn open_path(path: &Path, name: &str) -> Result<Self> {
        std::fs::create_dir_all(path)?;
        let db = Database::builder(path)
            .open()
            .map_err(|e| SemanticError::Cache(format!("Failed to open cache database: {}", e)))?;
        Self::open(Arc::new(db), name)
    }

    fn read(&self, path: &str) -> Result<Option<StoredEntry>> {
        match self.entries.get(path.as_bytes()) {
            Ok(Some(data)) => {
                let bytes: &[u8] = data.as_ref();
                Ok(Some(bincode::deserialize(bytes)?))
            }
            Ok(None) => Ok(None),
            Err(e) => Err(SemanticError::Cache(format!("Get failed for {}: {}", path, e))),
        }
    }

    fn write(&self, path: &str, entry: &StoredEntry) -> Result<()> {
        let data = bincode::serialize(entry)?;
        self.entries
            .insert(path.as_bytes(), data.as_slice())
            .map_err(|e| SemanticError::Cache(format!("Put failed for {}: {}", path, e)))?;
        Ok(())
    }

    fn write_manifest(&self, paths: &BTreeSet<String>) -> Result<()> {
        let data = serde_json::to_vec(paths)?;
        self.entries
            .insert(MANIFEST_KEY, data.as_slice())
            .map_err(|e| SemanticError::Cache(format!("Manifest update failed: {}", e)))?;
        Ok(())
    }
}

impl CacheService for FjallCacheService {
    fn entry(&self, path: &str) -> Result<Option<CacheEntry>> {
        Ok(self.read(path)?.map(|stored| CacheEntry {
            path: path.to_string(),
            content: Bytes::from(stored.content),
            timestamp: stored.timestamp,
            content_type: stored.content_type,
        }))
    }

    fn add_content(&self, path: &str, content: Bytes, timestamp: Option<i64>) -> Result<i64> {
        let timestamp = timestamp.unwrap_or_else(now_millis);
        let content_type = self.read(path)?.and_then(|e| e.content_type);
        self.write(
            path,
            &StoredEntry {
                timestamp,
                content_type,
                content: content.to_vec(),
            },
        )?;

        let mut paths = self.paths.write();
        if paths.insert(path.to_string()) {
            self.write_manifest(&paths)?;
        }
        Ok(timestamp)
    }

    fn set_content_timestamp(&self, path: &str, timestamp: i64) -> Result<()> {
        let mut stored = self
            .read(path)?
            .ok_or_else(|| SemanticError::CachedContentNotFound(path.to_string()))?;
        stored.timestamp = timestamp;
        self.write(path, &stored)
    }

    fn set_content_type(&self, path: &str, content_type: Option<&str>) -> Result<()> {
        let mut stored = self
            .read(path)?
            .ok_or_else(|| SemanticError::CachedContentNotFound(path.to_string()))?;
        stored.content_type = content_type.map(str::to_string);
        self.write(path, &stored)
    }

    fn delete_content(&self, path: &str) -> Result<()> {
        self.entries
            .remove(path.as_bytes())
            .map_err(|e| SemanticError::Cache(format!("Delete failed for {}: {}", path, e)))?;
        let mut paths = self.paths.write();
        if paths.remove(path) {
            self.write_manifest(&paths)?;
        }
        Ok(())
    }

    fn delete_recursive(&self, prefix: &str) -> Result<usize> {
        let mut paths = self.paths.write();
        let doomed: Vec<String> = paths
            .iter()
            .filter(|p| is_at_or_below(p, prefix))
            .cloned()
            .collect();
        for path in &doomed {
            self.entries
                .remove(path.as_bytes())
                .map_err(|e| SemanticError::Cache(format!("Delete failed for {}: {}", path, e)))?;
            paths.remove(path);
        }
        if !doomed.is_empty() {
            self.write_manifest(&paths)?;
        }
        Ok(doomed.len())
    }

    fn paths(&self) -> Result<Vec<String>> {
        Ok(self.paths.read().iter().cloned().collect())
    }

    fn persist(&self) -> Result<()> {
        self.db
            .persist(fjall::PersistMode::SyncAll)
            .map_err(|e| SemanticError::Cache(format!("Failed to persist cache: {}", e)))?;
        Ok(())
    }
}

// ─────────────────────────────────────────────────────
// Factory
// ─────────────────────────────────────────────────────

/// Hands out one cache per provider instance
pub struct CacheServiceFactory {
    backend: CacheBackend,
    db: Mutex<Option<Arc<Database>>>,
    caches: Mutex<HashMap<String, Arc<dyn CacheService>>>,
}

impl CacheServiceFactory {
    pub fn new(backend: CacheBackend) -> Self {
        Self {
            backend,
            db: Mutex::new(None),
            caches: Mutex::new(HashMap::new()),
        }
    }

    pub fn memory() -> Self {
        Self::new(CacheBackend::Memory)
    }

    pub fn backend(&self) -> &CacheBackend {
        &self.backend
    }

    /// Namespace for the provider `provider_id` within `scope`
    ///
    /// The scope is an opaque string the provider keeps stable across
    /// restarts (the built-in providers store one on their root node).
    pub fn namespace(provider_id: &str, scope: &str) -> String {
        let digest = hex::encode(Sha256::digest(scope.as_bytes()));
        let id: String = provider_id
            .chars()
            .map(|c| if c.is_ascii_alphanumeric() { c } else { '_' })
            .collect();
        format!("{}_{}", id, &digest[..16])
    }

    /// Cache for the provider `provider_id` within `scope`
    pub fn cache_for(&self, provider_id: &str, scope: &str) -> Result<Arc<dyn CacheService>> {
        let namespace = Self::namespace(provider_id, scope);
        let mut caches = self.caches.lock();
        if let Some(cache) = caches.get(&namespace) {
            return Ok(cache.clone());
        }

        let cache: Arc<dyn CacheService> = match &self.backend {
            CacheBackend::Memory => MemoryCacheService::shared(),
            CacheBackend::Fjall { path } => {
                let db = self.database(path)?;
                Arc::new(FjallCacheService::open(db, &namespace)?)
            }
        };
        tracing::debug!(%namespace, provider_id, scope, "created content cache");
        caches.insert(namespace, cache.clone());
        Ok(cache)
    }

    fn database(&self, path: &PathBuf) -> Result<Arc<Database>> {
        let mut db = self.db.lock();
        if let Some(db) = db.as_ref() {
            return Ok(db.clone());
        }
        std::fs::create_dir_all(path)?;
        let opened = Arc::new(
            Database::builder(path)
                .open()
                .map_err(|e| SemanticError::Cache(format!("Failed to open cache database: {}", e)))?,
        );
        *db = Some(opened.clone());
        Ok(opened)
    }

    /// Persist every cache handed out so far
    pub fn persist_all(&self) -> Result<()> {
        let caches: Vec<Arc<dyn CacheService>> = self.caches.lock().values().cloned().collect();
        for cache in caches {
            cache.persist()?;
        }
        Ok(())
    }
}

// ─────────────────────────────────────────────────────
// Output stream
// ─────────────────────────────────────────────────────

/// Invoked with the stored timestamp after each commit
pub type CommitHook = Arc<dyn Fn(i64) + Send + Sync>;

/// Buffered writer that stores its content in a cache
///
/// The buffer is committed on every `flush()` and once more on drop if
/// anything was written since. In append mode the buffer starts with the
/// content cached at open time.
pub struct CachedOutputStream {
    cache: Arc<dyn CacheService>,
    path: String,
    buffer: Vec<u8>,
    dirty: bool,
    on_commit: Option<CommitHook>,
}

impl CachedOutputStream {
    pub fn open(cache: Arc<dyn CacheService>, path: &str, append: bool) -> Result<Self> {
        let buffer = if append {
            match cache.entry(path)? {
                Some(entry) => entry.content.to_vec(),
                None => Vec::new(),
            }
        } else {
            Vec::new()
        };
        Ok(Self {
            cache,
            path: path.to_string(),
            buffer,
            // Truncation reaches the cache even if nothing is written
            dirty: !append,
            on_commit: None,
        })
    }

    pub fn with_commit_hook(mut self, hook: CommitHook) -> Self {
        self.on_commit = Some(hook);
        self
    }

    fn commit(&mut self) -> Result<i64> {
        let timestamp = self
            .cache
            .add_content(&self.path, Bytes::copy_from_slice(&self.buffer), None)?;
        self.dirty = false;
        if let Some(hook) = &self.on_commit {
            hook(timestamp);
        }
        Ok(timestamp)
    }
}

impl Write for CachedOutputStream {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.buffer.extend_from_slice(buf);
        self.dirty = true;
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        if self.dirty {
            self.commit().map_err(io::Error::other)?;
        }
        Ok(())
    }
}

impl Drop for CachedOutputStream {
    fn drop(&mut self) {
        if self.dirty {
            if let Err(e) = self.commit() {
                tracing::warn!(path = %self.path, error = %e, "failed to commit cached content on close");
            }
        }
    }
}
