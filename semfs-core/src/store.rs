//! Store facade
//!
//! [`SemanticStore`] is the per-node handle handed to callers and providers.
//! It is a cheap clone of (file system, node handle); all state lives in the
//! tree. Every operation follows the same shape: read or mutate the tree
//! inside one lock scope, get an owned value back, then call the provider
//! without the lock.

use crate::cache::CacheServiceFactory;
use crate::error::{Capability, Result, SemanticError};
use crate::filesystem::{FsShared, SemanticFileSystem};
use crate::lock::ensure_unlocked;
use crate::node::{props, validate_name, Lookup, NodeHandle, QualifiedName, ResourceKind, SessionValue};
use crate::provider::{relative_path, require, ContentProvider, InputStream, OutputStream, ProviderBinding};
use crate::status::{CancellationToken, MultiStatus, Status};
use crate::sync::SyncDirection;
use bytes::Bytes;
use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;
use std::sync::{Arc, Weak};

/// Snapshot returned by [`SemanticStore::fetch_info`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoreInfo {
    pub exists: bool,
    pub is_directory: bool,
    /// Milliseconds since the epoch, `None` if unknown
    pub last_modified: Option<i64>,
    pub read_only: bool,
}

/// Facade over one node of the tree
#[derive(Clone)]
pub struct SemanticStore {
    fs: Arc<FsShared>,
    handle: NodeHandle,
}

/// Non-owning [`SemanticStore`], held by providers bound into the tree
#[derive(Clone)]
pub struct WeakStore {
    fs: Weak<FsShared>,
    handle: NodeHandle,
}

impl WeakStore {
    pub fn upgrade(&self) -> Option<SemanticStore> {
        Some(SemanticStore {
            fs: self.fs.upgrade()?,
            handle: self.handle,
        })
    }
}

impl PartialEq for SemanticStore {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.fs, &other.fs) && self.handle == other.handle
    }
}

impl Eq for SemanticStore {}

impl fmt::Debug for SemanticStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let path = self.fs.tree.try_read("debug", |t| t.path(self.handle));
        f.debug_struct("SemanticStore")
            .field("handle", &self.handle)
            .field("path", &path.ok())
            .finish()
    }
}

impl SemanticStore {
    pub(crate) fn new(fs: Arc<FsShared>, handle: NodeHandle) -> Self {
        Self { fs, handle }
    }

    fn at(&self, handle: NodeHandle) -> SemanticStore {
        SemanticStore {
            fs: self.fs.clone(),
            handle,
        }
    }

    pub fn handle(&self) -> NodeHandle {
        self.handle
    }

    pub fn downgrade(&self) -> WeakStore {
        WeakStore {
            fs: Arc::downgrade(&self.fs),
            handle: self.handle,
        }
    }

    pub fn file_system(&self) -> SemanticFileSystem {
        SemanticFileSystem::from_shared(self.fs.clone())
    }

    pub fn cache_factory(&self) -> &CacheServiceFactory {
        &self.fs.caches
    }

    // ── Node state ──────────────────────────────────────────────

    pub fn name(&self) -> Result<String> {
        self.fs.tree.try_read("name", |t| Ok(t.node(self.handle)?.name.clone()))
    }

    /// Absolute path, computed in one read-lock scope
    pub fn path(&self) -> Result<String> {
        self.fs.tree.try_read("path", |t| t.path(self.handle))
    }

    pub fn kind(&self) -> Result<ResourceKind> {
        self.fs.tree.try_read("kind", |t| Ok(t.node(self.handle)?.kind))
    }

    pub fn exists(&self) -> Result<bool> {
        self.fs.tree.try_read("exists", |t| Ok(t.node(self.handle)?.exists))
    }

    pub fn is_local_only(&self) -> Result<bool> {
        self.fs.tree.try_read("local only", |t| Ok(t.node(self.handle)?.local_only))
    }

    pub fn parent(&self) -> Result<Option<SemanticStore>> {
        let parent = self.fs.tree.try_read("parent", |t| Ok(t.node(self.handle)?.parent))?;
        Ok(parent.map(|h| self.at(h)))
    }

    /// Names of children that exist
    pub fn child_names(&self) -> Result<Vec<String>> {
        self.fs.tree.try_read("child names", |t| t.child_names(self.handle))
    }

    /// Facades of children that exist
    pub fn child_stores(&self) -> Result<Vec<SemanticStore>> {
        let handles = self
            .fs
            .tree
            .try_read("child stores", |t| t.existing_children(self.handle))?;
        Ok(handles.into_iter().map(|h| self.at(h)).collect())
    }

    /// Existence, type and provider-reported metadata
    ///
    /// Provider failures while fetching the timestamp or read-only flag are
    /// logged and degrade to `read_only=true, last_modified=None`.
    pub fn fetch_info(&self, token: &CancellationToken) -> Result<StoreInfo> {
        let (exists, kind) = self.fs.tree.try_read("fetch info", |t| {
            let node = t.node(self.handle)?;
            Ok((node.exists, node.kind))
        })?;
        let mut info = StoreInfo {
            exists,
            is_directory: kind.is_container(),
            last_modified: None,
            read_only: false,
        };
        if !(exists && kind == ResourceKind::File) {
            return Ok(info);
        }

        let fetched = self.effective_content_provider().and_then(|provider| {
            ensure_unlocked("fetch info")?;
            let last_modified = provider.resource_timestamp(self, token)?;
            let read_only = provider.is_read_only(self, token)?;
            Ok((last_modified, read_only))
        });
        match fetched {
            Ok((last_modified, read_only)) => {
                info.last_modified = last_modified;
                info.read_only = read_only;
            }
            Err(e) => {
                tracing::warn!(path = %self.path().unwrap_or_default(), error = %e, "provider metadata unavailable");
                info.read_only = true;
            }
        }
        Ok(info)
    }

    // ── Provider resolution ─────────────────────────────────────

    /// Template id set on this node
    pub fn content_provider_id(&self) -> Result<Option<String>> {
        self.fs
            .tree
            .try_read("content provider id", |t| Ok(t.node(self.handle)?.template_id.clone()))
    }

    /// Make this node a resolution boundary for `id` (or drop it with `None`)
    pub fn set_content_provider_id(&self, id: Option<&str>) -> Result<()> {
        self.fs.tree.try_write("set content provider id", |t| {
            t.node_mut(self.handle)?.template_id = id.map(str::to_string);
            t.unbind(self.handle);
            Ok(())
        })?;
        self.fs.request_flush()
    }

    /// The provider responsible for this node, binding it on first use
    ///
    /// The binding lives on the boundary node: the nearest ancestor-or-self
    /// with a template id, or the root when there is none, in which case the
    /// configured default provider is bound there.
    pub fn effective_content_provider(&self) -> Result<Arc<dyn ContentProvider>> {
        let bound = self.fs.tree.try_read("resolve provider", |t| {
            let boundary = match t.binding_boundary(self.handle)? {
                Some((boundary, _)) => boundary,
                None => t.root_of(self.handle)?,
            };
            Ok(t.binding(boundary).map(|b| b.provider.clone()))
        })?;
        if let Some(provider) = bound {
            return Ok(provider);
        }

        let default_id = self.fs.config.default_provider_id.clone();
        self.fs.tree.try_write("bind provider", |t| {
            let (boundary, template_id) = match t.binding_boundary(self.handle)? {
                Some(found) => found,
                None => (t.root_of(self.handle)?, default_id),
            };
            // Another thread may have bound it in between
            if let Some(binding) = t.binding(boundary) {
                return Ok(binding.provider.clone());
            }
            let provider = self.fs.registry.create_provider(&template_id)?;
            provider.set_root_store(&self.at(boundary));
            tracing::debug!(%template_id, boundary = %t.path(boundary)?, "bound content provider");
            t.bind(
                boundary,
                ProviderBinding {
                    template_id,
                    provider: provider.clone(),
                },
            );
            Ok(provider)
        })
    }

    // ── Navigation ──────────────────────────────────────────────

    /// Child facade, materializing a placeholder if the name is unknown
    pub fn get_child(&self, name: &str) -> Result<SemanticStore> {
        validate_name(name)?;
        let existing = self
            .fs
            .tree
            .try_read("get child", |t| t.lookup_child(self.handle, name))?;
        if let Some(handle) = existing.handle() {
            return Ok(self.at(handle));
        }

        let provider = self.effective_content_provider()?;
        ensure_unlocked("federation lookup")?;
        let federated = match provider.as_federation() {
            Some(federation) => {
                let parent = relative_path(provider.as_ref(), self)?;
                let relative = if parent.is_empty() {
                    name.to_string()
                } else {
                    format!("{}/{}", parent, name)
                };
                federation
                    .federated_provider_id_for_path(&relative)
                    .filter(|id| id != provider.id())
            }
            None => None,
        };

        let (handle, created) = self.fs.tree.try_write("create placeholder", |t| {
            match t.lookup_child(self.handle, name)? {
                Lookup::NotPresent => {
                    let handle = t.create_child(self.handle, name, ResourceKind::Unknown, false)?;
                    if let Some(id) = &federated {
                        t.node_mut(handle)?.template_id = Some(id.clone());
                    }
                    Ok((handle, true))
                }
                Lookup::Placeholder(handle) | Lookup::Present(handle) => Ok((handle, false)),
            }
        })?;
        let child = self.at(handle);
        if !created {
            return Ok(child);
        }
        self.fs.request_flush()?;

        if let Err(e) = provider.on_implicit_store_create(&child) {
            tracing::debug!(name, provider = provider.id(), error = %e, "implicit create notification failed");
        }
        if federated.is_some() {
            match child.effective_content_provider() {
                Ok(other) => {
                    if let Err(e) = other.on_implicit_store_create(&child) {
                        tracing::debug!(name, provider = other.id(), error = %e, "implicit create notification failed");
                    }
                }
                Err(e) => tracing::debug!(name, error = %e, "federated provider unavailable"),
            }
        }
        Ok(child)
    }

    // ── Structural changes ──────────────────────────────────────

    /// Make this node an existing folder, creating missing parents unless `shallow`
    pub fn mkdir(&self, shallow: bool) -> Result<SemanticStore> {
        let (parent, kind, exists) = self.fs.tree.try_read("mkdir", |t| {
            let node = t.node(self.handle)?;
            Ok((node.parent, node.kind, node.exists))
        })?;
        if kind == ResourceKind::File && exists {
            return Err(self.other_type_error(kind)?);
        }
        if let Some(parent) = parent.map(|h| self.at(h)) {
            if !parent.exists()? {
                if shallow {
                    return Err(SemanticError::ResourceParentMissing(parent.path()?));
                }
                parent.mkdir(false)?;
            }
        }

        let changed = self.fs.tree.try_write("mkdir", |t| {
            let path = t.path(self.handle)?;
            let node = t.node_mut(self.handle)?;
            if node.kind == ResourceKind::File && node.exists {
                return Err(SemanticError::ResourceWithOtherTypeExists {
                    path,
                    existing: node.kind.to_string(),
                });
            }
            let changed = !node.exists || !node.kind.is_container();
            if node.kind != ResourceKind::Project {
                node.set_kind(ResourceKind::Folder);
            }
            node.exists = true;
            Ok(changed)
        })?;
        if changed {
            self.fs.request_flush()?;
        }
        Ok(self.clone())
    }

    fn other_type_error(&self, existing: ResourceKind) -> Result<SemanticError> {
        Ok(SemanticError::ResourceWithOtherTypeExists {
            path: self.path()?,
            existing: existing.to_string(),
        })
    }

    /// Add (or revive a placeholder as) an existing file
    pub fn add_child_file(
        &self,
        name: &str,
        provider_id: Option<&str>,
        properties: Option<&BTreeMap<String, String>>,
    ) -> Result<SemanticStore> {
        self.add_child(name, ResourceKind::File, false, provider_id, properties)
    }

    pub fn add_child_folder(&self, name: &str, provider_id: Option<&str>) -> Result<SemanticStore> {
        self.add_child(name, ResourceKind::Folder, true, provider_id, None)
    }

    /// Add a resource of yet unknown type that only exists locally
    pub fn add_local_child_resource(
        &self,
        name: &str,
        provider_id: Option<&str>,
    ) -> Result<SemanticStore> {
        self.add_child(name, ResourceKind::Unknown, true, provider_id, None)
    }

    fn add_child(
        &self,
        name: &str,
        kind: ResourceKind,
        local_only: bool,
        provider_id: Option<&str>,
        properties: Option<&BTreeMap<String, String>>,
    ) -> Result<SemanticStore> {
        validate_name(name)?;
        if let Some(properties) = properties {
            for key in properties.keys() {
                QualifiedName::parse(key)?;
            }
        }

        let handle = self.fs.tree.try_write("add child", |t| {
            let parent_kind = t.node(self.handle)?.kind;
            if parent_kind == ResourceKind::File {
                return Err(SemanticError::InvalidResourceType {
                    path: t.path(self.handle)?,
                    kind: parent_kind.to_string(),
                });
            }
            let handle = match t.lookup_child(self.handle, name)? {
                Lookup::Present(existing) => {
                    return Err(SemanticError::ResourceAlreadyExists(t.path(existing)?));
                }
                Lookup::Placeholder(existing) => {
                    let node = t.node_mut(existing)?;
                    node.exists = true;
                    node.local_only = local_only;
                    node.set_kind(kind);
                    existing
                }
                Lookup::NotPresent => {
                    let created = t.create_child(self.handle, name, kind, true)?;
                    t.node_mut(created)?.local_only = local_only || kind.is_container();
                    created
                }
            };
            if let Some(id) = provider_id {
                t.node_mut(handle)?.template_id = Some(id.to_string());
                t.unbind(handle);
            }
            if let Some(properties) = properties {
                let path = t.path(handle)?;
                let node = t.node_mut(handle)?;
                for (key, value) in properties {
                    let old = node.persistent_properties.insert(key.clone(), value.clone());
                    if key == props::REMOTE_URI {
                        self.fs.locator.uri_changed(&path, old.as_deref(), Some(value));
                    }
                }
            }
            Ok(handle)
        })?;
        self.fs.request_flush()?;
        tracing::debug!(name, %kind, "child added");
        Ok(self.at(handle))
    }

    /// Remove locally; with `keep_remote=false` the remote counterpart is deleted first
    pub fn remove(&self, keep_remote: bool, token: &CancellationToken) -> Result<()> {
        if !keep_remote {
            return self.delete_remotely(token);
        }
        self.remove_locally(token)
    }

    /// Delete the remote counterpart, then remove locally
    pub fn delete_remotely(&self, token: &CancellationToken) -> Result<()> {
        let provider = self.effective_content_provider()?;
        ensure_unlocked("delete remotely")?;
        let remote = require(provider.as_remote(), Capability::Remote, "delete_remotely", provider.as_ref())?;
        remote.delete_remotely(self, token)?;
        self.remove_locally(token)
    }

    fn remove_locally(&self, token: &CancellationToken) -> Result<()> {
        let provider = self.effective_content_provider()?;
        let nested = self.fs.tree.try_read("nested bindings", |t| {
            Ok(t.nested_bindings(self.handle)?
                .into_iter()
                .map(|(boundary, binding)| (boundary, binding.provider.clone()))
                .collect::<Vec<_>>())
        })?;
        ensure_unlocked("remove resource")?;
        for (boundary, nested_provider) in nested {
            nested_provider.remove_resource(&self.at(boundary), token)?;
        }
        provider.remove_resource(self, token)?;

        let released = self.fs.tree.try_write("remove", |t| {
            if t.node(self.handle)?.parent.is_none() {
                t.clear_root(self.handle)?;
                Ok(0)
            } else {
                t.detach(self.handle)
            }
        })?;
        tracing::debug!(handle = %self.handle, released, "store removed");
        self.fs.locator.invalidate();
        self.fs.request_flush()
    }

    // ── Content ─────────────────────────────────────────────────

    pub fn open_input_stream(&self, token: &CancellationToken) -> Result<InputStream> {
        let kind = self.kind()?;
        if kind != ResourceKind::File {
            return Err(SemanticError::InvalidResourceType {
                path: self.path()?,
                kind: kind.to_string(),
            });
        }
        let provider = self.effective_content_provider()?;
        ensure_unlocked("open input stream")?;
        provider.open_input_stream(self, token)
    }

    /// Open for writing; an `Unknown` node becomes an existing file
    pub fn open_output_stream(&self, append: bool, token: &CancellationToken) -> Result<OutputStream> {
        let kind = self.kind()?;
        if !matches!(kind, ResourceKind::File | ResourceKind::Unknown) {
            return Err(SemanticError::InvalidResourceType {
                path: self.path()?,
                kind: kind.to_string(),
            });
        }
        let provider = self.effective_content_provider()?;
        ensure_unlocked("open output stream")?;
        let stream = provider.open_output_stream(self, append, token)?;

        let changed = self.fs.tree.try_write("open output stream", |t| {
            let node = t.node_mut(self.handle)?;
            let changed = !node.exists || node.kind != ResourceKind::File;
            node.exists = true;
            node.set_kind(ResourceKind::File);
            Ok(changed)
        })?;
        if changed {
            self.fs.request_flush()?;
        }
        Ok(stream)
    }

    pub fn is_read_only(&self, token: &CancellationToken) -> Result<bool> {
        let provider = self.effective_content_provider()?;
        ensure_unlocked("is read only")?;
        provider.is_read_only(self, token)
    }

    pub fn set_read_only(&self, read_only: bool, token: &CancellationToken) -> Result<()> {
        let provider = self.effective_content_provider()?;
        ensure_unlocked("set read only")?;
        provider.set_read_only(self, read_only, token)
    }

    pub fn last_modified(&self, token: &CancellationToken) -> Result<Option<i64>> {
        let provider = self.effective_content_provider()?;
        ensure_unlocked("last modified")?;
        provider.resource_timestamp(self, token)
    }

    pub fn set_last_modified(&self, timestamp: i64, token: &CancellationToken) -> Result<()> {
        let provider = self.effective_content_provider()?;
        ensure_unlocked("set last modified")?;
        provider.set_resource_timestamp(self, timestamp, token)
    }

    pub fn revert_changes(&self, token: &CancellationToken) -> Result<()> {
        let provider = self.effective_content_provider()?;
        ensure_unlocked("revert changes")?;
        provider.revert_changes(self, token)
    }

    /// Local on-disk copy of the content, from a provider with the Local capability
    pub fn to_local_file(&self, token: &CancellationToken) -> Result<PathBuf> {
        let provider = self.effective_content_provider()?;
        ensure_unlocked("to local file")?;
        let local = require(provider.as_local(), Capability::Local, "to_local_file", provider.as_ref())?;
        local.to_local_file(self, token)
    }

    /// Reconcile with the remote side; failures are recorded in `status`
    pub fn synchronize_content_with_remote(
        &self,
        direction: SyncDirection,
        status: &mut MultiStatus,
        token: &CancellationToken,
    ) {
        let path = self.path().unwrap_or_default();
        if let Err(e) = ensure_unlocked("synchronize content") {
            status.add_error(&path, &e);
            return;
        }
        match self.effective_content_provider() {
            Ok(provider) => provider.synchronize_content_with_remote(self, direction, status, token),
            Err(e) => status.add_error(&path, &e),
        }
    }

    // ── Remote creation ─────────────────────────────────────────

    /// Resolve the provider of this node after making sure it is a folder
    fn container_provider(&self) -> Result<Arc<dyn ContentProvider>> {
        self.mkdir(false)?;
        let provider = self.effective_content_provider()?;
        ensure_unlocked("remote creation")?;
        Ok(provider)
    }

    pub fn create_file_remotely(
        &self,
        name: &str,
        source: Option<Bytes>,
        context: Option<&str>,
        token: &CancellationToken,
    ) -> Result<SemanticStore> {
        let provider = self.container_provider()?;
        let remote = require(provider.as_remote(), Capability::Remote, "create_file_remotely", provider.as_ref())?;
        remote.create_file_remotely(self, name, source, context, token)
    }

    pub fn create_resource_remotely(
        &self,
        name: &str,
        context: Option<&str>,
        token: &CancellationToken,
    ) -> Result<SemanticStore> {
        let provider = self.container_provider()?;
        let remote = require(provider.as_remote(), Capability::Remote, "create_resource_remotely", provider.as_ref())?;
        remote.create_resource_remotely(self, name, context, token)
    }

    pub fn add_file_from_remote(&self, name: &str, token: &CancellationToken) -> Result<SemanticStore> {
        self.add_resource_from_remote(name, ResourceKind::File, token)
    }

    pub fn add_folder_from_remote(&self, name: &str, token: &CancellationToken) -> Result<SemanticStore> {
        self.add_resource_from_remote(name, ResourceKind::Folder, token)
    }

    /// Let the provider model a child it knows to exist remotely
    pub fn add_resource_from_remote(
        &self,
        name: &str,
        kind: ResourceKind,
        token: &CancellationToken,
    ) -> Result<SemanticStore> {
        let provider = self.container_provider()?;
        provider.add_resource(self, name, kind, token)
    }

    pub fn add_file_from_remote_by_uri(
        &self,
        name: &str,
        uri: &str,
        token: &CancellationToken,
    ) -> Result<SemanticStore> {
        let provider = self.container_provider()?;
        let rest = require(provider.as_rest(), Capability::Rest, "add_file_by_uri", provider.as_ref())?;
        rest.add_file_by_uri(self, name, uri, token)
    }

    pub fn add_folder_from_remote_by_uri(
        &self,
        name: &str,
        uri: &str,
        token: &CancellationToken,
    ) -> Result<SemanticStore> {
        let provider = self.container_provider()?;
        let rest = require(provider.as_rest(), Capability::Rest, "add_folder_by_uri", provider.as_ref())?;
        rest.add_folder_by_uri(self, name, uri, token)
    }

    // ── Capability-gated delegations ────────────────────────────

    /// Run `f` against the provider, turning resolution failures into a status
    fn delegate(&self, f: impl FnOnce(&dyn ContentProvider) -> Status) -> Status {
        let path = self.path().unwrap_or_default();
        let provider = match self.effective_content_provider() {
            Ok(provider) => provider,
            Err(e) => return Status::from_error(&path, &e),
        };
        if let Err(e) = ensure_unlocked("provider delegation") {
            return Status::from_error(&path, &e);
        }
        f(provider.as_ref())
    }

    fn unsupported(&self, capability: Capability, method: &'static str, provider: &dyn ContentProvider) -> Status {
        let path = self.path().unwrap_or_default();
        Status::from_error(&path, &SemanticError::not_supported(capability, method, provider.id()))
    }

    /// Remote URI, from the REST capability or the stored property
    pub fn remote_uri(&self) -> Result<Option<String>> {
        let provider = self.effective_content_provider()?;
        ensure_unlocked("remote uri")?;
        match provider.as_rest() {
            Some(rest) => rest.uri(self),
            None => self.persistent_property(&props::key(props::REMOTE_URI)),
        }
    }

    pub fn set_remote_uri(&self, uri: &str, token: &CancellationToken) -> Status {
        self.delegate(|provider| match provider.as_rest() {
            Some(rest) => match rest.set_uri(self, uri, token) {
                Ok(()) => Status::ok(),
                Err(e) => Status::from_error(&self.path().unwrap_or_default(), &e),
            },
            None => self.unsupported(Capability::Rest, "set_uri", provider),
        })
    }

    pub fn lock_resource(&self, token: &CancellationToken) -> Status {
        self.delegate(|provider| match provider.as_locking() {
            Some(locking) => locking.lock_resource(self, token),
            None => Status::info("Locking not supported, nothing to lock"),
        })
    }

    pub fn unlock_resource(&self, token: &CancellationToken) -> Status {
        self.delegate(|provider| match provider.as_locking() {
            Some(locking) => locking.unlock_resource(self, token),
            None => Status::info("Locking not supported, nothing to unlock"),
        })
    }

    pub fn validate_remote_create(&self, name: &str) -> Status {
        self.delegate(|provider| match provider.as_remote() {
            Some(remote) => remote.validate_remote_create(self, name),
            None => self.unsupported(Capability::Remote, "validate_remote_create", provider),
        })
    }

    pub fn validate_remote_delete(&self) -> Status {
        self.delegate(|provider| match provider.as_remote() {
            Some(remote) => remote.validate_remote_delete(self),
            None => self.unsupported(Capability::Remote, "validate_remote_delete", provider),
        })
    }

    pub fn validate_remove(&self, token: &CancellationToken) -> Status {
        self.delegate(|provider| provider.validate_remove(self, token))
    }

    pub fn validate_edit(&self) -> Status {
        self.delegate(|provider| provider.validate_edit(std::slice::from_ref(self)))
    }

    pub fn validate_save(&self) -> Status {
        self.delegate(|provider| provider.validate_save(self))
    }

    // ── Properties ──────────────────────────────────────────────

    pub fn persistent_property(&self, key: &QualifiedName) -> Result<Option<String>> {
        let key = key.to_string();
        self.fs.tree.try_read("persistent property", |t| {
            Ok(t.node(self.handle)?.persistent_properties.get(&key).cloned())
        })
    }

    /// Snapshot of all persistent properties
    pub fn persistent_properties(&self) -> Result<BTreeMap<String, String>> {
        self.fs.tree.try_read("persistent properties", |t| {
            Ok(t.node(self.handle)?.persistent_properties.clone())
        })
    }

    /// Set (or with `None` remove) a persistent property
    pub fn set_persistent_property(&self, key: &QualifiedName, value: Option<&str>) -> Result<()> {
        let key = key.to_string();
        let changed = self.fs.tree.try_write("set persistent property", |t| {
            let path = if key == props::REMOTE_URI {
                Some(t.path(self.handle)?)
            } else {
                None
            };
            let node = t.node_mut(self.handle)?;
            let old = match value {
                Some(value) => node.persistent_properties.insert(key.clone(), value.to_string()),
                None => node.persistent_properties.remove(&key),
            };
            if let Some(path) = path {
                self.fs.locator.uri_changed(&path, old.as_deref(), value);
            }
            Ok(old.as_deref() != value)
        })?;
        if changed {
            self.fs.request_flush()?;
        }
        Ok(())
    }

    pub fn remove_persistent_property(&self, key: &QualifiedName) -> Result<()> {
        self.set_persistent_property(key, None)
    }

    pub fn session_property(&self, key: &QualifiedName) -> Result<Option<SessionValue>> {
        self.fs.tree.try_read("session property", |t| {
            Ok(t.node(self.handle)?.session_properties.get(key).cloned())
        })
    }

    pub fn set_session_property(&self, key: &QualifiedName, value: Option<SessionValue>) -> Result<()> {
        self.fs.tree.try_write("set session property", |t| {
            let node = t.node_mut(self.handle)?;
            match value {
                Some(value) => {
                    node.session_properties.insert(key.clone(), value);
                }
                None => {
                    node.session_properties.remove(key);
                }
            }
            Ok(())
        })
    }
}
