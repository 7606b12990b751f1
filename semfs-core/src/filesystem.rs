//! Semantic file system
//!
//! Owns the tree lock, the provider registry, the cache factory and the URI
//! locator, and persists the tree document. Stores are obtained from here by
//! root name or path.

use crate::cache::CacheServiceFactory;
use crate::config::FileSystemConfig;
use crate::error::{Result, SemanticError};
use crate::lock::{ensure_unlocked, TreeLock};
use crate::locator::UriLocator;
use crate::node::{NodeTree, TreeDocument};
use crate::registry::ProviderRegistry;
use crate::status::CancellationToken;
use crate::store::SemanticStore;
use parking_lot::Mutex;
use std::fs;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// URI scheme accepted by [`SemanticFileSystem::get_store`]
pub const SCHEME: &str = "semfs";

pub(crate) struct FsShared {
    pub(crate) config: FileSystemConfig,
    pub(crate) tree: TreeLock,
    pub(crate) registry: Arc<ProviderRegistry>,
    pub(crate) caches: CacheServiceFactory,
    pub(crate) locator: UriLocator,
    dirty: AtomicBool,
    /// Serializes document writes
    flush_lock: Mutex<()>,
}

impl FsShared {
    pub(crate) fn request_flush(&self) -> Result<()> {
        self.dirty.store(true, Ordering::SeqCst);
        if self.config.auto_flush {
            self.flush()?;
        }
        Ok(())
    }

    fn flush(&self) -> Result<()> {
        ensure_unlocked("flush")?;
        let _guard = self.flush_lock.lock();
        // Cleared before the snapshot so concurrent changes re-mark it
        self.dirty.store(false, Ordering::SeqCst);
        let document = self.tree.read("flush", |t| t.to_document())?;

        if let Some(path) = &self.config.tree_path {
            if let Err(e) = save_document(path, &document) {
                self.dirty.store(true, Ordering::SeqCst);
                return Err(e);
            }
            tracing::debug!(path = %path.display(), roots = document.roots.len(), "tree document saved");
        }
        self.caches.persist_all()
    }
}

fn save_document(path: &Path, document: &TreeDocument) -> Result<()> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent)?;
        }
    }
    let tmp_path = path.with_extension("tmp");
    let data = serde_json::to_string_pretty(document)?;
    fs::write(&tmp_path, &data)?;
    fs::rename(&tmp_path, path)?;
    Ok(())
}

fn load_document(path: &Path) -> Result<Option<TreeDocument>> {
    if !path.exists() {
        return Ok(None);
    }
    let data = fs::read_to_string(path)?;
    Ok(Some(serde_json::from_str(&data)?))
}

/// Handle to one semantic file system; clones share the same tree
#[derive(Clone)]
pub struct SemanticFileSystem {
    shared: Arc<FsShared>,
}

impl SemanticFileSystem {
    /// Open a file system, loading the tree document if `config.tree_path` exists
    pub fn open(config: FileSystemConfig, registry: Arc<ProviderRegistry>) -> Result<Self> {
        let tree = match &config.tree_path {
            Some(path) => match load_document(path)? {
                Some(document) => {
                    let tree = NodeTree::from_document(&document)?;
                    tracing::info!(path = %path.display(), nodes = tree.len(), "tree document loaded");
                    tree
                }
                None => NodeTree::new(),
            },
            None => NodeTree::new(),
        };

        let caches = CacheServiceFactory::new(config.cache.clone());
        Ok(Self {
            shared: Arc::new(FsShared {
                config,
                tree: TreeLock::new(tree),
                registry,
                caches,
                locator: UriLocator::new(),
                dirty: AtomicBool::new(false),
                flush_lock: Mutex::new(()),
            }),
        })
    }

    /// Memory-only file system
    pub fn in_memory(registry: Arc<ProviderRegistry>) -> Result<Self> {
        Self::open(FileSystemConfig::in_memory(), registry)
    }

    pub(crate) fn from_shared(shared: Arc<FsShared>) -> Self {
        Self { shared }
    }

    pub fn config(&self) -> &FileSystemConfig {
        &self.shared.config
    }

    pub fn registry(&self) -> &Arc<ProviderRegistry> {
        &self.shared.registry
    }

    pub fn cache_factory(&self) -> &CacheServiceFactory {
        &self.shared.caches
    }

    // ── Roots ───────────────────────────────────────────────────

    pub fn root_names(&self) -> Result<Vec<String>> {
        self.shared.tree.read("root names", |t| t.root_names())
    }

    /// Existing root `name`
    pub fn root(&self, name: &str) -> Result<SemanticStore> {
        let handle = self.shared.tree.read("root", |t| {
            t.root(name).filter(|h| t.get(*h).is_some_and(|n| n.exists))
        })?;
        handle
            .map(|h| SemanticStore::new(self.shared.clone(), h))
            .ok_or_else(|| SemanticError::StoreNotFound(format!("/{}", name)))
    }

    pub fn add_root(&self, name: &str, root_uri: Option<&str>) -> Result<SemanticStore> {
        let handle = self
            .shared
            .tree
            .try_write("add root", |t| t.add_root(name, root_uri))?;
        tracing::info!(root = name, "root added");
        self.shared.locator.invalidate();
        self.shared.request_flush()?;
        Ok(SemanticStore::new(self.shared.clone(), handle))
    }

    /// Clear root `name` and mark it non-existent
    pub fn remove_root(&self, name: &str, token: &CancellationToken) -> Result<()> {
        self.root(name)?.remove(true, token)?;
        tracing::info!(root = name, "root removed");
        Ok(())
    }

    pub fn rename_root(&self, old: &str, new: &str) -> Result<SemanticStore> {
        let handle = self
            .shared
            .tree
            .try_write("rename root", |t| t.rename_root(old, new))?;
        tracing::info!(old, new, "root renamed");
        self.shared.locator.invalidate();
        self.shared.request_flush()?;
        Ok(SemanticStore::new(self.shared.clone(), handle))
    }

    /// Store at `path`, materializing placeholders along the way
    ///
    /// Accepts `/root/a/b` or `semfs:/root/a/b`; any other scheme fails with
    /// `StoreNotFound`.
    pub fn get_store(&self, path: &str) -> Result<SemanticStore> {
        let local = match path.split_once(':') {
            Some((scheme, rest)) if scheme == SCHEME => rest,
            Some(_) => return Err(SemanticError::StoreNotFound(path.to_string())),
            None => path,
        };
        let mut segments = local.split('/').filter(|s| !s.is_empty());
        let root = segments
            .next()
            .ok_or_else(|| SemanticError::StoreNotFound(path.to_string()))?;
        let mut store = self.root(root)?;
        for segment in segments {
            store = store.get_child(segment)?;
        }
        Ok(store)
    }

    /// Store at `path` if the tree already knows it; never creates placeholders
    pub fn find_store(&self, path: &str) -> Result<Option<SemanticStore>> {
        let handle = self.shared.tree.read("find store", |t| t.resolve(path))?;
        Ok(handle.map(|h| SemanticStore::new(self.shared.clone(), h)))
    }

    // ── Persistence ─────────────────────────────────────────────

    /// Mark the tree dirty; saved immediately when `auto_flush` is on
    pub fn request_flush(&self) -> Result<()> {
        self.shared.request_flush()
    }

    /// Save the tree document and persist every cache
    pub fn flush(&self) -> Result<()> {
        self.shared.flush()?;
        tracing::info!("file system flushed");
        Ok(())
    }

    pub fn is_dirty(&self) -> bool {
        self.shared.dirty.load(Ordering::SeqCst)
    }

    // ── URI index ───────────────────────────────────────────────

    /// Paths whose remote URI is `uri`, optionally below `root_path`
    pub fn locate(&self, uri: &str, root_path: Option<&str>) -> Result<Vec<String>> {
        ensure_unlocked("locate")?;
        self.shared.locator.locate(&self.shared.tree, uri, root_path)
    }

    /// Stores whose remote URI is `uri`
    pub fn locate_stores(&self, uri: &str, root_path: Option<&str>) -> Result<Vec<SemanticStore>> {
        let mut stores = Vec::new();
        for path in self.locate(uri, root_path)? {
            if let Some(store) = self.find_store(&path)? {
                stores.push(store);
            }
        }
        Ok(stores)
    }

    /// Drop the URI index; the next query rebuilds it from the tree
    pub fn rebuild_uri_index(&self) {
        self.shared.locator.invalidate();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::providers::DefaultContentProvider;
    use tempfile::TempDir;

    fn registry() -> Arc<ProviderRegistry> {
        Arc::new(ProviderRegistry::new().with("default", |id| Ok(DefaultContentProvider::shared(id))))
    }

    #[test]
    fn test_get_store_schemes() {
        let fs = SemanticFileSystem::in_memory(registry()).unwrap();
        fs.add_root("proj", None).unwrap();

        let a = fs.get_store("/proj/a/b").unwrap();
        assert_eq!(a.path().unwrap(), "/proj/a/b");
        assert_eq!(fs.get_store("semfs:/proj/a/b").unwrap(), a);
        assert!(matches!(
            fs.get_store("http://proj/a"),
            Err(SemanticError::StoreNotFound(_))
        ));
        assert!(matches!(fs.get_store("/missing"), Err(SemanticError::StoreNotFound(_))));
        assert!(matches!(fs.get_store("/"), Err(SemanticError::StoreNotFound(_))));
    }

    #[test]
    fn test_manual_flush_and_reload() {
        let dir = TempDir::new().unwrap();
        let mut config = FileSystemConfig::persistent(dir.path());
        config.auto_flush = false;

        {
            let fs = SemanticFileSystem::open(config.clone(), registry()).unwrap();
            fs.add_root("proj", Some("file:///proj")).unwrap();
            assert!(fs.is_dirty());
            assert!(!dir.path().join("tree.json").exists());
            fs.flush().unwrap();
            assert!(!fs.is_dirty());
        }

        let fs = SemanticFileSystem::open(config, registry()).unwrap();
        assert_eq!(fs.root_names().unwrap(), vec!["proj".to_string()]);
    }

    #[test]
    fn test_root_lifecycle() {
        let fs = SemanticFileSystem::in_memory(registry()).unwrap();
        fs.add_root("a", None).unwrap();
        fs.rename_root("a", "b").unwrap();
        assert_eq!(fs.root_names().unwrap(), vec!["b".to_string()]);
        assert!(fs.root("a").is_err());

        fs.remove_root("b", &CancellationToken::new()).unwrap();
        assert!(fs.root_names().unwrap().is_empty());
        // A removed root can be added again
        fs.add_root("b", None).unwrap();
        assert!(fs.root("b").is_ok());
    }
}
