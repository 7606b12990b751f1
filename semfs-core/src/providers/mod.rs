//! Built-in content providers
//!
//! - [`DefaultContentProvider`]: cache-only local content
//! - [`RemoteStoreProvider`]: synchronizes with a [`MemoryRemoteStore`]
//! - [`FederatingProvider`]: routes first-level children to other providers
//!
//! [`ProviderContext`] holds what every cache-backed provider needs (its
//! root store and its lazily opened cache) and implements the cache-backed
//! content operations they share.

mod default;
mod federation;
mod remote_store;

pub use default::DefaultContentProvider;
pub use federation::FederatingProvider;
pub use remote_store::{MemoryRemoteStore, RemoteFile, RemoteStoreProvider};

use crate::cache::{CacheService, CachedOutputStream, CommitHook};
use crate::error::{Result, SemanticError};
use crate::node::props;
use crate::provider::{InputStream, OutputStream};
use crate::store::{SemanticStore, WeakStore};
use parking_lot::{Mutex, RwLock};
use std::fs;
use std::io::Cursor;
use std::path::PathBuf;
use std::sync::Arc;

/// Root binding and content cache of one provider instance
pub struct ProviderContext {
    id: String,
    root: RwLock<Option<WeakStore>>,
    cache: Mutex<Option<Arc<dyn CacheService>>>,
}

impl ProviderContext {
    pub fn new(id: &str) -> Self {
        Self {
            id: id.to_string(),
            root: RwLock::new(None),
            cache: Mutex::new(None),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    /// Record the boundary store; does not touch the tree
    pub fn set_root_store(&self, store: &SemanticStore) {
        *self.root.write() = Some(store.downgrade());
    }

    pub fn root_store(&self) -> Option<SemanticStore> {
        self.root.read().as_ref().and_then(WeakStore::upgrade)
    }

    fn bound_root(&self) -> Result<SemanticStore> {
        self.root_store()
            .ok_or_else(|| SemanticError::StoreNotFound(format!("provider {} is not bound", self.id)))
    }

    /// The provider's cache, opened on first use
    ///
    /// The namespace is seeded from a scope id stored on the root node, so
    /// it survives restarts and root renames.
    pub fn cache(&self) -> Result<Arc<dyn CacheService>> {
        let mut slot = self.cache.lock();
        if let Some(cache) = slot.as_ref() {
            return Ok(cache.clone());
        }
        let root = self.bound_root()?;
        let key = props::key(props::CACHE_SCOPE);
        let scope = match root.persistent_property(&key)? {
            Some(scope) => scope,
            None => {
                let scope = uuid::Uuid::new_v4().to_string();
                root.set_persistent_property(&key, Some(&scope))?;
                scope
            }
        };
        let cache = root.cache_factory().cache_for(&self.id, &scope)?;
        *slot = Some(cache.clone());
        Ok(cache)
    }

    /// Cache key of `store`: its path relative to the root store
    pub fn cache_key(&self, store: &SemanticStore) -> Result<String> {
        Ok(format!("/{}", self.relative_path(store)?))
    }

    /// Path of `store` relative to the root store, without a leading slash
    pub fn relative_path(&self, store: &SemanticStore) -> Result<String> {
        let path = store.path()?;
        let root = self.bound_root()?.path()?;
        match path.strip_prefix(&root) {
            Some(rest) if rest.is_empty() || rest.starts_with('/') => {
                Ok(rest.trim_start_matches('/').to_string())
            }
            _ => Err(SemanticError::StoreNotFound(format!(
                "{} is outside the subtree of provider {}",
                path, self.id
            ))),
        }
    }

    // ── Cache-backed content operations ─────────────────────────

    pub fn open_input_stream(&self, store: &SemanticStore) -> Result<InputStream> {
        let content = self.cache()?.get_content(&self.cache_key(store)?)?;
        Ok(Box::new(Cursor::new(content)))
    }

    pub fn open_output_stream(
        &self,
        store: &SemanticStore,
        append: bool,
        on_commit: Option<CommitHook>,
    ) -> Result<OutputStream> {
        let mut stream = CachedOutputStream::open(self.cache()?, &self.cache_key(store)?, append)?;
        if let Some(hook) = on_commit {
            stream = stream.with_commit_hook(hook);
        }
        Ok(Box::new(stream))
    }

    pub fn resource_timestamp(&self, store: &SemanticStore) -> Result<Option<i64>> {
        self.cache()?.content_timestamp(&self.cache_key(store)?)
    }

    pub fn set_resource_timestamp(&self, store: &SemanticStore, timestamp: i64) -> Result<()> {
        self.cache()?.set_content_timestamp(&self.cache_key(store)?, timestamp)
    }

    /// Drop cached content at and below `store`
    pub fn remove_resource(&self, store: &SemanticStore) -> Result<()> {
        let key = self.cache_key(store)?;
        let removed = self.cache()?.delete_recursive(&key)?;
        tracing::debug!(provider = %self.id, %key, removed, "cached content released");
        Ok(())
    }

    /// Copy the cached bytes of `store` into the spool directory
    pub fn spool_to_local(&self, store: &SemanticStore) -> Result<PathBuf> {
        let content = self.cache()?.get_content(&self.cache_key(store)?)?;
        let path = store.path()?;
        let target = store
            .file_system()
            .config()
            .local_dir()
            .join(path.trim_start_matches('/'));
        if let Some(parent) = target.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(&target, &content)?;
        Ok(target)
    }
}
