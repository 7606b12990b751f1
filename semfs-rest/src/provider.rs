//! REST content provider
//!
//! Every resource below the provider's root is addressed by a URI. A node's
//! URI is its `semfs:remote-uri` property if set, otherwise the URI of its
//! parent with the node name appended as a path segment. Content is cached
//! like any other provider's and moved with GET/PUT during synchronization.

use crate::transport::RestTransport;
use bytes::Bytes;
use semfs_core::{
    props, CancellationToken, ContentProvider, InputStream, MultiStatus, OutputStream,
    ProviderContext, RemoteChild, RemoteEndpoint, RemoteState, RestCapability, Result,
    SemanticError, SemanticStore, SyncDirection, SyncEngine,
};
use std::collections::BTreeMap;
use std::sync::Arc;
use url::Url;

/// Parse an absolute URI, mapping failures to `InvalidUriSyntax`
pub fn parse_uri(uri: &str) -> Result<Url> {
    Url::parse(uri).map_err(|e| SemanticError::InvalidUriSyntax(format!("{}: {}", uri, e)))
}

/// `base` with `name` appended as one path segment
fn child_uri(base: &Url, name: &str) -> Result<Url> {
    let mut url = base.clone();
    url.path_segments_mut()
        .map_err(|_| SemanticError::InvalidUriSyntax(format!("{} cannot have children", base)))?
        .pop_if_empty()
        .push(name);
    Ok(url)
}

pub struct RestContentProvider {
    context: ProviderContext,
    transport: Arc<dyn RestTransport>,
}

impl RestContentProvider {
    pub const ID: &'static str = "rest";

    pub fn new(id: &str, transport: Arc<dyn RestTransport>) -> Self {
        Self {
            context: ProviderContext::new(id),
            transport,
        }
    }

    /// Registry factory sharing one transport between provider instances
    pub fn factory(
        transport: Arc<dyn RestTransport>,
    ) -> impl Fn(&str) -> Result<Arc<dyn ContentProvider>> + Send + Sync + 'static {
        move |id: &str| Ok(Arc::new(RestContentProvider::new(id, transport.clone())) as Arc<dyn ContentProvider>)
    }

    /// Explicit or derived URI of `store`
    pub fn resolve_uri(&self, store: &SemanticStore) -> Result<Option<Url>> {
        if let Some(uri) = store.persistent_property(&props::key(props::REMOTE_URI))? {
            return parse_uri(&uri).map(Some);
        }
        if self.context.root_store().as_ref() == Some(store) {
            return Ok(None);
        }
        let Some(parent) = store.parent()? else {
            return Ok(None);
        };
        match self.resolve_uri(&parent)? {
            Some(base) => child_uri(&base, &store.name()?).map(Some),
            None => Ok(None),
        }
    }

    fn require_uri(&self, store: &SemanticStore) -> Result<Url> {
        self.resolve_uri(store)?.ok_or_else(|| {
            SemanticError::RemoteResourceNotFound(format!(
                "{} has no remote URI",
                store.path().unwrap_or_default()
            ))
        })
    }
}

impl ContentProvider for RestContentProvider {
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

    fn as_rest(&self) -> Option<&dyn RestCapability> {
        Some(self)
    }
}

impl RemoteEndpoint for RestContentProvider {
    fn fetch_state(&self, store: &SemanticStore) -> Result<Option<RemoteState>> {
        match self.resolve_uri(store)? {
            Some(url) => Ok(self.transport.head(&url)?),
            None => Ok(None),
        }
    }

    fn download(&self, store: &SemanticStore) -> Result<(Bytes, RemoteState)> {
        let url = self.require_uri(store)?;
        Ok(self.transport.get(&url)?)
    }

    fn upload(&self, store: &SemanticStore, content: Bytes, _timestamp: i64) -> Result<RemoteState> {
        let url = self.require_uri(store)?;
        Ok(self.transport.put(&url, content)?)
    }

    /// Plain REST has no listing verb
    fn list_children(&self, _store: &SemanticStore) -> Result<Option<Vec<RemoteChild>>> {
        Ok(None)
    }
}

impl RestCapability for RestContentProvider {
    fn uri(&self, store: &SemanticStore) -> Result<Option<String>> {
        Ok(self.resolve_uri(store)?.map(String::from))
    }

    fn set_uri(&self, store: &SemanticStore, uri: &str, _token: &CancellationToken) -> Result<()> {
        let url = parse_uri(uri)?;
        store.set_persistent_property(&props::key(props::REMOTE_URI), Some(url.as_str()))
    }

    /// Files linked by URI start out read-only
    fn add_file_by_uri(
        &self,
        parent: &SemanticStore,
        name: &str,
        uri: &str,
        _token: &CancellationToken,
    ) -> Result<SemanticStore> {
        let url = parse_uri(uri)?;
        let mut properties = BTreeMap::new();
        properties.insert(props::REMOTE_URI.to_string(), url.to_string());
        properties.insert(props::READ_ONLY.to_string(), "true".to_string());
        let child = parent.add_child_file(name, None, Some(&properties))?;
        tracing::debug!(path = %child.path().unwrap_or_default(), %url, "linked file");
        Ok(child)
    }

    fn add_folder_by_uri(
        &self,
        parent: &SemanticStore,
        name: &str,
        uri: &str,
        _token: &CancellationToken,
    ) -> Result<SemanticStore> {
        let url = parse_uri(uri)?;
        let child = parent.add_child_folder(name, None)?;
        child.set_persistent_property(&props::key(props::REMOTE_URI), Some(url.as_str()))?;
        tracing::debug!(path = %child.path().unwrap_or_default(), %url, "linked folder");
        Ok(child)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_child_uri_appends_segment() {
        let base = parse_uri("http://example.com/base/").unwrap();
        assert_eq!(child_uri(&base, "a.txt").unwrap().as_str(), "http://example.com/base/a.txt");

        let bare = parse_uri("http://example.com/base").unwrap();
        assert_eq!(child_uri(&bare, "a b").unwrap().as_str(), "http://example.com/base/a%20b");
    }

    #[test]
    fn test_parse_uri_rejects_relative() {
        assert!(matches!(parse_uri("not a uri"), Err(SemanticError::InvalidUriSyntax(_))));
        assert!(matches!(
            child_uri(&parse_uri("mailto:someone@example.com").unwrap(), "x"),
            Err(SemanticError::InvalidUriSyntax(_))
        ));
    }
}
