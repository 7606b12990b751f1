//! Remote store provider
//!
//! [`MemoryRemoteStore`] is an in-process stand-in for a versioned remote
//! repository: files carry content, a timestamp, a content-derived ETag and
//! an optional lock token; folders are implicit in file paths or created
//! explicitly. [`RemoteStoreProvider`] caches its content locally and
//! reconciles through the [`SyncEngine`].

use super::ProviderContext;
use crate::cache::now_millis;
use crate::error::{Result, SemanticError};
use crate::node::{props, ResourceKind};
use crate::provider::{
    ContentProvider, InputStream, LockingCapability, OutputStream, RemoteCapability,
};
use crate::status::{CancellationToken, MultiStatus, Status};
use crate::store::SemanticStore;
use crate::sync::{record_synced, RemoteChild, RemoteEndpoint, RemoteState, SyncDirection, SyncEngine};
use bytes::Bytes;
use parking_lot::RwLock;
use sha2::{Digest, Sha256};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

/// One file held by a [`MemoryRemoteStore`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteFile {
    pub content: Bytes,
    pub timestamp: i64,
    pub etag: String,
    pub lock_token: Option<String>,
}

impl RemoteFile {
    fn state(&self) -> RemoteState {
        RemoteState {
            timestamp: Some(self.timestamp),
            etag: Some(self.etag.clone()),
        }
    }
}

#[derive(Default)]
struct RemoteTree {
    files: BTreeMap<String, RemoteFile>,
    folders: BTreeSet<String>,
}

impl RemoteTree {
    fn is_folder(&self, path: &str) -> bool {
        path.is_empty() || self.folders.contains(path)
    }

    fn add_parents(&mut self, path: &str) {
        let mut current = path;
        while let Some((parent, _)) = current.rsplit_once('/') {
            self.folders.insert(parent.to_string());
            current = parent;
        }
    }
}

fn normalize(path: &str) -> String {
    path.trim_matches('/').to_string()
}

fn parent_of(path: &str) -> &str {
    path.rsplit_once('/').map(|(parent, _)| parent).unwrap_or("")
}

/// Path-keyed remote repository kept in memory
#[derive(Default)]
pub struct MemoryRemoteStore {
    inner: RwLock<RemoteTree>,
}

impl MemoryRemoteStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn shared() -> Arc<Self> {
        Arc::new(Self::new())
    }

    /// ETag of `content`: truncated SHA-256 hex
    pub fn etag_for(content: &[u8]) -> String {
        let digest = hex::encode(Sha256::digest(content));
        digest[..16].to_string()
    }

    /// Create or replace a file; a locked file needs its lock token
    pub fn put_file(
        &self,
        path: &str,
        content: Bytes,
        timestamp: i64,
        lock_token: Option<&str>,
    ) -> Result<RemoteState> {
        let path = normalize(path);
        let mut tree = self.inner.write();
        if tree.is_folder(&path) {
            return Err(SemanticError::ResourceWithOtherTypeExists {
                path,
                existing: ResourceKind::Folder.to_string(),
            });
        }
        let held = tree.files.get(&path).and_then(|f| f.lock_token.clone());
        if let Some(held) = &held {
            if lock_token != Some(held.as_str()) {
                return Err(SemanticError::LockConflict(format!("{} is locked remotely", path)));
            }
        }
        tree.add_parents(&path);
        let file = RemoteFile {
            etag: Self::etag_for(&content),
            content,
            timestamp,
            lock_token: held,
        };
        let state = file.state();
        tree.files.insert(path, file);
        Ok(state)
    }

    pub fn get_file(&self, path: &str) -> Option<RemoteFile> {
        self.inner.read().files.get(&normalize(path)).cloned()
    }

    pub fn state(&self, path: &str) -> Option<RemoteState> {
        self.inner.read().files.get(&normalize(path)).map(RemoteFile::state)
    }

    pub fn contains(&self, path: &str) -> bool {
        let path = normalize(path);
        let tree = self.inner.read();
        tree.files.contains_key(&path) || tree.is_folder(&path)
    }

    pub fn mkdir(&self, path: &str) -> Result<()> {
        let path = normalize(path);
        let mut tree = self.inner.write();
        if tree.files.contains_key(&path) {
            return Err(SemanticError::ResourceWithOtherTypeExists {
                path,
                existing: ResourceKind::File.to_string(),
            });
        }
        tree.add_parents(&path);
        if !path.is_empty() {
            tree.folders.insert(path);
        }
        Ok(())
    }

    /// Delete a file, or a folder with everything below it
    pub fn delete(&self, path: &str) -> Result<()> {
        let path = normalize(path);
        let mut tree = self.inner.write();
        if tree.files.remove(&path).is_some() {
            return Ok(());
        }
        if path.is_empty() || !tree.folders.contains(&path) {
            return Err(SemanticError::RemoteResourceNotFound(path));
        }
        let below = format!("{}/", path);
        tree.files.retain(|p, _| !p.starts_with(&below));
        tree.folders.retain(|p| p != &path && !p.starts_with(&below));
        Ok(())
    }

    /// Direct children of the folder `path`, `None` if it is not a folder
    pub fn list(&self, path: &str) -> Option<Vec<RemoteChild>> {
        let path = normalize(path);
        let tree = self.inner.read();
        if !tree.is_folder(&path) {
            return None;
        }
        let mut children: BTreeMap<String, ResourceKind> = BTreeMap::new();
        let files = tree.files.keys().map(|p| (p, ResourceKind::File));
        let folders = tree.folders.iter().map(|p| (p, ResourceKind::Folder));
        for (p, kind) in files.chain(folders) {
            if parent_of(p) == path {
                let name = p.rsplit('/').next().unwrap_or(p.as_str());
                children.insert(name.to_string(), kind);
            }
        }
        Some(
            children
                .into_iter()
                .map(|(name, kind)| RemoteChild { name, kind })
                .collect(),
        )
    }

    /// Lock a file; returns the new lock token
    pub fn lock(&self, path: &str) -> Result<String> {
        let path = normalize(path);
        let mut tree = self.inner.write();
        let file = tree
            .files
            .get_mut(&path)
            .ok_or_else(|| SemanticError::RemoteResourceNotFound(path.clone()))?;
        if file.lock_token.is_some() {
            return Err(SemanticError::LockConflict(format!("{} is already locked", path)));
        }
        let token = uuid::Uuid::new_v4().to_string();
        file.lock_token = Some(token.clone());
        Ok(token)
    }

    pub fn unlock(&self, path: &str, token: &str) -> Result<()> {
        let path = normalize(path);
        let mut tree = self.inner.write();
        let file = tree
            .files
            .get_mut(&path)
            .ok_or_else(|| SemanticError::RemoteResourceNotFound(path.clone()))?;
        match file.lock_token.clone() {
            Some(held) if held == token => {
                file.lock_token = None;
                Ok(())
            }
            Some(_) => Err(SemanticError::LockConflict(format!("{} is locked by another client", path))),
            None => Ok(()),
        }
    }
}

/// Provider synchronizing with a shared [`MemoryRemoteStore`]
pub struct RemoteStoreProvider {
    context: ProviderContext,
    remote: Arc<MemoryRemoteStore>,
}

impl RemoteStoreProvider {
    pub const ID: &'static str = "remote-store";

    pub fn new(id: &str, remote: Arc<MemoryRemoteStore>) -> Self {
        Self {
            context: ProviderContext::new(id),
            remote,
        }
    }

    /// Registry factory producing providers over `remote`
    pub fn factory(
        remote: Arc<MemoryRemoteStore>,
    ) -> impl Fn(&str) -> Result<Arc<dyn ContentProvider>> + Send + Sync + 'static {
        move |id: &str| Ok(Arc::new(RemoteStoreProvider::new(id, remote.clone())) as Arc<dyn ContentProvider>)
    }

    pub fn remote(&self) -> &Arc<MemoryRemoteStore> {
        &self.remote
    }

    fn remote_path(&self, store: &SemanticStore) -> Result<String> {
        self.context.relative_path(store)
    }

    fn child_path(&self, parent: &SemanticStore, name: &str) -> Result<String> {
        let parent = self.remote_path(parent)?;
        Ok(if parent.is_empty() {
            name.to_string()
        } else {
            format!("{}/{}", parent, name)
        })
    }

    fn lock_token(store: &SemanticStore) -> Result<Option<String>> {
        store.persistent_property(&props::key(props::LOCK_TOKEN))
    }
}

impl ContentProvider for RemoteStoreProvider {
    fn id(&self) -> &str {
        self.context.id()
    }

    fn set_root_store(&self, store: &SemanticStore) {
        self.context.set_root_store(store);
    }

    fn root_store(&self) -> Option<SemanticStore> {
        self.context.root_store()
    }

    fn open_input_stream(&self, store: &SemanticStore, _token: &CancellationToken) -> Result<InputStream> {
        self.context.open_input_stream(store)
    }

    fn open_output_stream(
        &self,
        store: &SemanticStore,
        append: bool,
        _token: &CancellationToken,
    ) -> Result<OutputStream> {
        self.context.open_output_stream(store, append, None)
    }

    fn resource_timestamp(&self, store: &SemanticStore, _token: &CancellationToken) -> Result<Option<i64>> {
        self.context.resource_timestamp(store)
    }

    fn set_resource_timestamp(
        &self,
        store: &SemanticStore,
        timestamp: i64,
        _token: &CancellationToken,
    ) -> Result<()> {
        self.context.set_resource_timestamp(store, timestamp)
    }

    fn remove_resource(&self, store: &SemanticStore, _token: &CancellationToken) -> Result<()> {
        self.context.remove_resource(store)
    }

    fn synchronize_content_with_remote(
        &self,
        store: &SemanticStore,
        direction: SyncDirection,
        status: &mut MultiStatus,
        token: &CancellationToken,
    ) {
        let cache = match self.context.cache() {
            Ok(cache) => cache,
            Err(e) => {
                status.add_error(&store.path().unwrap_or_default(), &e);
                return;
            }
        };
        let key = |s: &SemanticStore| self.context.cache_key(s);
        SyncEngine::new(cache, self, &key).synchronize(store, direction, status, token);
    }

    /// Read-only files become editable by taking the remote lock
    fn validate_edit(&self, stores: &[SemanticStore]) -> Status {
        let token = CancellationToken::new();
        for store in stores {
            let path = store.path().unwrap_or_default();
            match self.is_read_only(store, &token) {
                Ok(false) => continue,
                Ok(true) => {}
                Err(e) => {
                    tracing::warn!(%path, error = %e, "read-only check failed during validate_edit");
                    return Status::from_error(&path, &e);
                }
            }
            let locked = self.lock_resource(store, &token);
            if !locked.is_ok() {
                return locked;
            }
            if let Err(e) = self.set_read_only(store, false, &token) {
                return Status::from_error(&path, &e);
            }
            tracing::debug!(%path, "locked for editing");
        }
        Status::ok()
    }

    /// Restore the remote content into the cache
    fn revert_changes(&self, store: &SemanticStore, _token: &CancellationToken) -> Result<()> {
        if store.kind()? != ResourceKind::File {
            return Ok(());
        }
        let path = self.remote_path(store)?;
        let file = self
            .remote
            .get_file(&path)
            .ok_or_else(|| SemanticError::RemoteResourceNotFound(path.clone()))?;
        self.context
            .cache()?
            .add_content(&self.context.cache_key(store)?, file.content.clone(), Some(file.timestamp))?;
        record_synced(store, &file.state(), &file.content)
    }

    fn as_remote(&self) -> Option<&dyn RemoteCapability> {
        Some(self)
    }

    fn as_locking(&self) -> Option<&dyn LockingCapability> {
        Some(self)
    }
}

impl RemoteEndpoint for RemoteStoreProvider {
    fn fetch_state(&self, store: &SemanticStore) -> Result<Option<RemoteState>> {
        Ok(self.remote.state(&self.remote_path(store)?))
    }

    fn download(&self, store: &SemanticStore) -> Result<(Bytes, RemoteState)> {
        let path = self.remote_path(store)?;
        let file = self
            .remote
            .get_file(&path)
            .ok_or(SemanticError::RemoteResourceNotFound(path))?;
        let state = file.state();
        Ok((file.content, state))
    }

    fn upload(&self, store: &SemanticStore, content: Bytes, timestamp: i64) -> Result<RemoteState> {
        let lock_token = Self::lock_token(store)?;
        self.remote
            .put_file(&self.remote_path(store)?, content, timestamp, lock_token.as_deref())
    }

    fn list_children(&self, store: &SemanticStore) -> Result<Option<Vec<RemoteChild>>> {
        Ok(self.remote.list(&self.remote_path(store)?))
    }
}

impl RemoteCapability for RemoteStoreProvider {
    fn create_file_remotely(
        &self,
        parent: &SemanticStore,
        name: &str,
        source: Option<Bytes>,
        _context: Option<&str>,
        token: &CancellationToken,
    ) -> Result<SemanticStore> {
        let path = self.child_path(parent, name)?;
        if self.remote.contains(&path) {
            return Err(SemanticError::ResourceAlreadyExists(path));
        }
        let child = parent.add_child_file(name, None, None)?;
        let content = source.unwrap_or_default();
        let timestamp = now_millis();
        let state = match self.remote.put_file(&path, content.clone(), timestamp, None) {
            Ok(state) => state,
            Err(e) => {
                if let Err(cleanup) = child.remove(true, token) {
                    tracing::warn!(%path, error = %cleanup, "failed to drop local file after remote create failed");
                }
                return Err(e);
            }
        };
        self.context
            .cache()?
            .add_content(&self.context.cache_key(&child)?, content.clone(), Some(timestamp))?;
        record_synced(&child, &state, &content)?;
        Ok(child)
    }

    fn create_resource_remotely(
        &self,
        parent: &SemanticStore,
        name: &str,
        _context: Option<&str>,
        _token: &CancellationToken,
    ) -> Result<SemanticStore> {
        let path = self.child_path(parent, name)?;
        self.remote.mkdir(&path)?;
        let child = parent.add_child_folder(name, None)?;
        child.set_persistent_property(
            &props::key(props::SYNCED_TIMESTAMP),
            Some(&now_millis().to_string()),
        )?;
        Ok(child)
    }

    fn delete_remotely(&self, store: &SemanticStore, _token: &CancellationToken) -> Result<()> {
        let path = self.remote_path(store)?;
        self.remote.delete(&path)?;
        tracing::debug!(%path, "deleted remotely");
        Ok(())
    }

    fn validate_remote_create(&self, parent: &SemanticStore, name: &str) -> Status {
        match self.child_path(parent, name) {
            Ok(path) if self.remote.contains(&path) => {
                Status::error(format!("{} already exists remotely", path)).at(&path)
            }
            Ok(_) => Status::ok(),
            Err(e) => Status::from_error(name, &e),
        }
    }

    fn validate_remote_delete(&self, store: &SemanticStore) -> Status {
        let result = self
            .remote_path(store)
            .and_then(|path| Ok((Self::lock_token(store)?, path)));
        let (local_token, path) = match result {
            Ok(found) => found,
            Err(e) => return Status::from_error(&store.path().unwrap_or_default(), &e),
        };
        match self.remote.get_file(&path) {
            Some(file) => match file.lock_token {
                Some(held) if Some(&held) != local_token.as_ref() => {
                    Status::error("Locked remotely by another client").at(&path)
                }
                _ => Status::ok(),
            },
            None if self.remote.contains(&path) => Status::ok(),
            None => Status::warning("Does not exist remotely").at(&path),
        }
    }
}

impl LockingCapability for RemoteStoreProvider {
    fn lock_resource(&self, store: &SemanticStore, _token: &CancellationToken) -> Status {
        let result = self.remote_path(store).and_then(|path| {
            let lock = self.remote.lock(&path)?;
            store.set_persistent_property(&props::key(props::LOCK_TOKEN), Some(&lock))?;
            Ok(path)
        });
        match result {
            Ok(path) => {
                tracing::debug!(%path, "remote lock acquired");
                Status::ok()
            }
            Err(e) => Status::from_error(&store.path().unwrap_or_default(), &e),
        }
    }

    fn unlock_resource(&self, store: &SemanticStore, _token: &CancellationToken) -> Status {
        let result = self.remote_path(store).and_then(|path| {
            let Some(lock) = Self::lock_token(store)? else {
                return Ok(false);
            };
            self.remote.unlock(&path, &lock)?;
            store.remove_persistent_property(&props::key(props::LOCK_TOKEN))?;
            Ok(true)
        });
        match result {
            Ok(true) => Status::ok(),
            Ok(false) => Status::info("Not locked"),
            Err(e) => Status::from_error(&store.path().unwrap_or_default(), &e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_remote_store_listing() {
        let remote = MemoryRemoteStore::new();
        remote.put_file("a/b/c.txt", Bytes::from_static(b"c"), 1, None).unwrap();
        remote.put_file("top.txt", Bytes::from_static(b"t"), 1, None).unwrap();
        remote.mkdir("empty").unwrap();

        let root: Vec<_> = remote.list("").unwrap().into_iter().map(|c| (c.name, c.kind)).collect();
        assert_eq!(
            root,
            vec![
                ("a".to_string(), ResourceKind::Folder),
                ("empty".to_string(), ResourceKind::Folder),
                ("top.txt".to_string(), ResourceKind::File),
            ]
        );
        assert_eq!(remote.list("a/b").unwrap().len(), 1);
        assert!(remote.list("top.txt").is_none());

        remote.delete("a").unwrap();
        assert!(!remote.contains("a/b/c.txt"));
        assert!(matches!(remote.delete("a"), Err(SemanticError::RemoteResourceNotFound(_))));
    }

    #[test]
    fn test_locked_file_rejects_foreign_writes() {
        let remote = MemoryRemoteStore::new();
        let first = remote.put_file("f", Bytes::from_static(b"1"), 1, None).unwrap();
        let token = remote.lock("f").unwrap();

        assert!(matches!(
            remote.put_file("f", Bytes::from_static(b"2"), 2, None),
            Err(SemanticError::LockConflict(_))
        ));
        let second = remote.put_file("f", Bytes::from_static(b"2"), 2, Some(&token)).unwrap();
        assert_ne!(first.etag, second.etag);
        assert!(remote.lock("f").is_err());
        assert!(remote.unlock("f", "wrong").is_err());
        remote.unlock("f", &token).unwrap();
        assert!(remote.get_file("f").unwrap().lock_token.is_none());
    }

    #[test]
    fn test_etag_is_content_derived() {
        assert_eq!(MemoryRemoteStore::etag_for(b"x"), MemoryRemoteStore::etag_for(b"x"));
        assert_ne!(MemoryRemoteStore::etag_for(b"x"), MemoryRemoteStore::etag_for(b"y"));
        assert_eq!(MemoryRemoteStore::etag_for(b"x").len(), 16);
    }
}
