//! Default content provider
//!
//! Keeps file content in its cache only. There is no remote side, so
//! synchronization does nothing.

use super::ProviderContext;
use crate::error::Result;
use crate::provider::{ContentProvider, InputStream, LocalCapability, OutputStream};
use crate::status::{CancellationToken, MultiStatus};
use crate::store::SemanticStore;
use crate::sync::SyncDirection;
use std::path::PathBuf;
use std::sync::Arc;

/// Cache-only provider, bound wherever no template id is set
pub struct DefaultContentProvider {
    context: ProviderContext,
}

impl DefaultContentProvider {
    pub const ID: &'static str = crate::config::DEFAULT_PROVIDER_ID;

    pub fn new(id: &str) -> Self {
        Self {
            context: ProviderContext::new(id),
        }
    }

    /// Fresh instance behind an `Arc`, the shape registry factories return
    pub fn shared(id: &str) -> Arc<dyn ContentProvider> {
        Arc::new(Self::new(id))
    }
}

impl ContentProvider for DefaultContentProvider {
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
        _status: &mut MultiStatus,
        _token: &CancellationToken,
    ) {
        tracing::debug!(path = %store.path().unwrap_or_default(), %direction, "no remote side, nothing to synchronize");
    }

    fn as_local(&self) -> Option<&dyn LocalCapability> {
        Some(self)
    }
}

impl LocalCapability for DefaultContentProvider {
    fn to_local_file(&self, store: &SemanticStore, _token: &CancellationToken) -> Result<PathBuf> {
        self.context.spool_to_local(store)
    }
}
