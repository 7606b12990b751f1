//! Content provider registry
//!
//! Maps template ids to factories. The registry is an explicit object owned
//! by the file system rather than global state. Its id index is built
//! lazily on the first lookup and dropped by [`ProviderRegistry::invalidate`].

use crate::error::{Result, SemanticError};
use crate::provider::ContentProvider;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;

/// Constructs a fresh provider instance for a template id
pub type ProviderFactory = Arc<dyn Fn(&str) -> Result<Arc<dyn ContentProvider>> + Send + Sync>;

struct ProviderDescriptor {
    id: String,
    factory: ProviderFactory,
}

/// Registry of content provider factories
#[derive(Default)]
pub struct ProviderRegistry {
    descriptors: RwLock<Vec<ProviderDescriptor>>,
    index: RwLock<Option<HashMap<String, usize>>>,
}

impl ProviderRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a factory; a later registration of the same id wins
    pub fn register<F>(&self, id: &str, factory: F)
    where
        F: Fn(&str) -> Result<Arc<dyn ContentProvider>> + Send + Sync + 'static,
    {
        self.descriptors.write().push(ProviderDescriptor {
            id: id.to_string(),
            factory: Arc::new(factory),
        });
        self.invalidate();
    }

    /// Builder-style [`ProviderRegistry::register`]
    pub fn with<F>(self, id: &str, factory: F) -> Self
    where
        F: Fn(&str) -> Result<Arc<dyn ContentProvider>> + Send + Sync + 'static,
    {
        self.register(id, factory);
        self
    }

    /// Drop the id index; it is rebuilt on the next lookup
    pub fn invalidate(&self) {
        *self.index.write() = None;
    }

    pub fn contains(&self, id: &str) -> bool {
        self.lookup(id).is_some()
    }

    /// Registered ids in registration order, without duplicates
    pub fn ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = Vec::new();
        for d in self.descriptors.read().iter() {
            if !ids.contains(&d.id) {
                ids.push(d.id.clone());
            }
        }
        ids
    }

    fn lookup(&self, id: &str) -> Option<ProviderFactory> {
        let cached = self.index.read().as_ref().map(|index| index.get(id).copied());
        match cached {
            Some(Some(position)) => {
                return self
                    .descriptors
                    .read()
                    .get(position)
                    .map(|d| d.factory.clone());
            }
            Some(None) => return None,
            None => {}
        }

        let (index, factory) = {
            let descriptors = self.descriptors.read();
            let mut index = HashMap::with_capacity(descriptors.len());
            for (position, d) in descriptors.iter().enumerate() {
                index.insert(d.id.clone(), position);
            }
            let factory = index
                .get(id)
                .and_then(|p| descriptors.get(*p))
                .map(|d| d.factory.clone());
            (index, factory)
        };
        tracing::debug!(providers = index.len(), "rebuilt content provider index");
        *self.index.write() = Some(index);
        factory
    }

    /// Instantiate the provider registered for `id`
    pub fn create_provider(&self, id: &str) -> Result<Arc<dyn ContentProvider>> {
        let factory = self
            .lookup(id)
            .ok_or_else(|| SemanticError::UnknownProviderId(id.to_string()))?;
        tracing::debug!(template_id = id, "instantiating content provider");
        factory(id)
    }
}
