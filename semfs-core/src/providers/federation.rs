//! Federating provider
//!
//! Delegates first-level children of its root to other providers according
//! to a fixed routing table. Everything it keeps itself is stored like the
//! default provider does.

use super::ProviderContext;
use crate::error::Result;
use crate::provider::{ContentProvider, FederationCapability, InputStream, OutputStream};
use crate::status::{CancellationToken, MultiStatus, Status};
use crate::store::SemanticStore;
use crate::sync::SyncDirection;
use parking_lot::Mutex;
use std::collections::BTreeMap;

pub struct FederatingProvider {
    context: ProviderContext,
    /// First-level child name → provider id
    routes: BTreeMap<String, String>,
    /// Relative paths reported through `on_implicit_store_create`
    implicit: Mutex<Vec<String>>,
}

impl FederatingProvider {
    pub const ID: &'static str = "federation";

    pub fn new(id: &str, routes: BTreeMap<String, String>) -> Self {
        Self {
            context: ProviderContext::new(id),
            routes,
            implicit: Mutex::new(Vec::new()),
        }
    }

    pub fn routes(&self) -> &BTreeMap<String, String> {
        &self.routes
    }

    /// Placeholders created below this provider so far
    pub fn implicit_creations(&self) -> Vec<String> {
        self.implicit.lock().clone()
    }
}

impl ContentProvider for FederatingProvider {
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

    fn on_implicit_store_create(&self, store: &SemanticStore) -> Result<()> {
        let relative = self.context.relative_path(store)?;
        tracing::debug!(provider = self.id(), %relative, "implicit store created");
        self.implicit.lock().push(relative);
        Ok(())
    }

    fn remove_resource(&self, store: &SemanticStore, _token: &CancellationToken) -> Result<()> {
        self.context.remove_resource(store)
    }

    /// Only delegated children have a remote side
    fn synchronize_content_with_remote(
        &self,
        store: &SemanticStore,
        direction: SyncDirection,
        status: &mut MultiStatus,
        token: &CancellationToken,
    ) {
        let path = store.path().unwrap_or_default();
        let children = match store.child_stores() {
            Ok(children) => children,
            Err(e) => {
                status.add_error(&path, &e);
                return;
            }
        };
        for child in children {
            if token.is_cancelled() {
                status.add(Status::cancel().at(&path));
                return;
            }
            // Delegated files and folders reach their own provider through the facade
            child.synchronize_content_with_remote(direction, status, token);
        }
    }

    fn as_federation(&self) -> Option<&dyn FederationCapability> {
        Some(self)
    }
}

impl FederationCapability for FederatingProvider {
    fn federated_provider_id_for_path(&self, relative_path: &str) -> Option<String> {
        if relative_path.contains('/') {
            return None;
        }
        self.routes.get(relative_path).cloned()
    }
}
