//! Content provider SPI
//!
//! A content provider supplies the bytes and metadata for a subtree. Every
//! provider implements [`ContentProvider`]; optional behavior is exposed
//! through capability traits that the provider hands out from the
//! `as_*` accessors. Callers that need a capability use [`require`], which
//! turns a missing capability into a typed `MethodNotSupported` error.
//!
//! Providers are always called without the tree lock held and may call
//! back into the store facade freely.

use crate::error::{Capability, Result, SemanticError};
use crate::node::{props, ResourceKind};
use crate::status::{CancellationToken, MultiStatus, Status};
use crate::store::SemanticStore;
use crate::sync::SyncDirection;
use bytes::Bytes;
use std::fmt;
use std::io::{Read, Write};
use std::path::PathBuf;
use std::sync::Arc;

/// Byte stream handed out by `open_input_stream`
pub type InputStream = Box<dyn Read + Send>;

/// Byte sink handed out by `open_output_stream`; content is committed on flush or drop
pub type OutputStream = Box<dyn Write + Send>;

/// A provider instance bound to a resolution boundary
#[derive(Clone)]
pub struct ProviderBinding {
    pub template_id: String,
    pub provider: Arc<dyn ContentProvider>,
}

impl fmt::Debug for ProviderBinding {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProviderBinding")
            .field("template_id", &self.template_id)
            .finish()
    }
}

/// Base trait of every content provider
pub trait ContentProvider: Send + Sync {
    /// Template id this instance was created for
    fn id(&self) -> &str;

    /// Called once when the provider is bound to its boundary node
    ///
    /// Runs while the binding is being installed and must not call back
    /// into the tree.
    fn set_root_store(&self, store: &SemanticStore);

    /// The boundary store this provider was bound to
    fn root_store(&self) -> Option<SemanticStore>;

    fn open_input_stream(
        &self,
        store: &SemanticStore,
        token: &CancellationToken,
    ) -> Result<InputStream>;

    fn open_output_stream(
        &self,
        store: &SemanticStore,
        append: bool,
        token: &CancellationToken,
    ) -> Result<OutputStream>;

    /// Modification timestamp in milliseconds, `None` if unknown
    fn resource_timestamp(
        &self,
        store: &SemanticStore,
        token: &CancellationToken,
    ) -> Result<Option<i64>>;

    fn set_resource_timestamp(
        &self,
        store: &SemanticStore,
        timestamp: i64,
        token: &CancellationToken,
    ) -> Result<()>;

    fn is_read_only(&self, store: &SemanticStore, token: &CancellationToken) -> Result<bool> {
        let _ = token;
        Ok(store
            .persistent_property(&props::key(props::READ_ONLY))?
            .is_some_and(|v| v == "true"))
    }

    fn set_read_only(
        &self,
        store: &SemanticStore,
        read_only: bool,
        token: &CancellationToken,
    ) -> Result<()> {
        let _ = token;
        store.set_persistent_property(
            &props::key(props::READ_ONLY),
            Some(if read_only { "true" } else { "false" }),
        )
    }

    /// Add a child resource the provider knows to exist remotely
    fn add_resource(
        &self,
        parent: &SemanticStore,
        name: &str,
        kind: ResourceKind,
        token: &CancellationToken,
    ) -> Result<SemanticStore> {
        let _ = token;
        match kind {
            ResourceKind::File => parent.add_child_file(name, None, None),
            ResourceKind::Folder => parent.add_child_folder(name, None),
            ResourceKind::Unknown => parent.add_local_child_resource(name, None),
            ResourceKind::Project => Err(SemanticError::InvalidResourceType {
                path: format!("{}/{}", parent.path()?, name),
                kind: kind.to_string(),
            }),
        }
    }

    /// Notification that navigation materialized a placeholder for `store`
    fn on_implicit_store_create(&self, store: &SemanticStore) -> Result<()> {
        let _ = store;
        Ok(())
    }

    /// Release provider-side state (cached content) before local removal
    fn remove_resource(&self, store: &SemanticStore, token: &CancellationToken) -> Result<()>;

    /// Reconcile `store` (recursively for containers) with its remote counterpart
    ///
    /// Per-resource failures go into `status`.
    fn synchronize_content_with_remote(
        &self,
        store: &SemanticStore,
        direction: SyncDirection,
        status: &mut MultiStatus,
        token: &CancellationToken,
    );

    fn validate_edit(&self, stores: &[SemanticStore]) -> Status {
        let token = CancellationToken::new();
        for store in stores {
            match self.is_read_only(store, &token) {
                Ok(false) => {}
                Ok(true) => {
                    let path = store.path().unwrap_or_default();
                    return Status::error("Resource is read-only").at(&path);
                }
                Err(e) => {
                    let path = store.path().unwrap_or_default();
                    tracing::warn!(%path, error = %e, "read-only check failed during validate_edit");
                    return Status::from_error(&path, &e);
                }
            }
        }
        Status::ok()
    }

    fn validate_save(&self, store: &SemanticStore) -> Status {
        let _ = store;
        Status::ok()
    }

    fn validate_remove(&self, store: &SemanticStore, token: &CancellationToken) -> Status {
        let _ = (store, token);
        Status::ok()
    }

    /// Discard local changes
    fn revert_changes(&self, store: &SemanticStore, token: &CancellationToken) -> Result<()> {
        let _ = (store, token);
        Ok(())
    }

    fn as_local(&self) -> Option<&dyn LocalCapability> {
        None
    }

    fn as_remote(&self) -> Option<&dyn RemoteCapability> {
        None
    }

    fn as_rest(&self) -> Option<&dyn RestCapability> {
        None
    }

    fn as_federation(&self) -> Option<&dyn FederationCapability> {
        None
    }

    fn as_locking(&self) -> Option<&dyn LockingCapability> {
        None
    }
}

/// Access to a local on-disk copy of the content
pub trait LocalCapability {
    fn to_local_file(&self, store: &SemanticStore, token: &CancellationToken) -> Result<PathBuf>;
}

/// Creation and deletion of remote objects
pub trait RemoteCapability {
    fn create_file_remotely(
        &self,
        parent: &SemanticStore,
        name: &str,
        source: Option<Bytes>,
        context: Option<&str>,
        token: &CancellationToken,
    ) -> Result<SemanticStore>;

    fn create_resource_remotely(
        &self,
        parent: &SemanticStore,
        name: &str,
        context: Option<&str>,
        token: &CancellationToken,
    ) -> Result<SemanticStore>;

    fn delete_remotely(&self, store: &SemanticStore, token: &CancellationToken) -> Result<()>;

    fn validate_remote_create(&self, parent: &SemanticStore, name: &str) -> Status;

    fn validate_remote_delete(&self, store: &SemanticStore) -> Status;
}

/// URI-addressable resources
pub trait RestCapability {
    fn uri(&self, store: &SemanticStore) -> Result<Option<String>>;

    fn set_uri(&self, store: &SemanticStore, uri: &str, token: &CancellationToken) -> Result<()>;

    fn add_file_by_uri(
        &self,
        parent: &SemanticStore,
        name: &str,
        uri: &str,
        token: &CancellationToken,
    ) -> Result<SemanticStore>;

    fn add_folder_by_uri(
        &self,
        parent: &SemanticStore,
        name: &str,
        uri: &str,
        token: &CancellationToken,
    ) -> Result<SemanticStore>;
}

/// Delegation of sub-trees to other providers
pub trait FederationCapability {
    /// Provider id responsible for `relative_path` (relative to the root store),
    /// `None` to keep it with this provider
    fn federated_provider_id_for_path(&self, relative_path: &str) -> Option<String>;
}

/// Explicit lock/unlock of remote resources
pub trait LockingCapability {
    fn lock_resource(&self, store: &SemanticStore, token: &CancellationToken) -> Status;

    fn unlock_resource(&self, store: &SemanticStore, token: &CancellationToken) -> Status;
}

/// Unwrap a capability or fail with `MethodNotSupported`
pub fn require<'a, T: ?Sized>(
    capability: Option<&'a T>,
    kind: Capability,
    method: &'static str,
    provider: &dyn ContentProvider,
) -> Result<&'a T> {
    capability.ok_or_else(|| SemanticError::not_supported(kind, method, provider.id()))
}

/// Path of `store` relative to the provider's root store
pub fn relative_path(provider: &dyn ContentProvider, store: &SemanticStore) -> Result<String> {
    let path = store.path()?;
    let root = match provider.root_store() {
        Some(root) => root.path()?,
        None => return Ok(path.trim_start_matches('/').to_string()),
    };
    Ok(path
        .strip_prefix(&root)
        .unwrap_or(&path)
        .trim_start_matches('/')
        .to_string())
}
