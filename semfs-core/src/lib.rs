//! SemFS Core Library
//!
//! A virtual file-system overlay whose content is supplied by pluggable
//! content providers:
//! - Node store with lazily materialized placeholders and JSON persistence
//! - One tree lock; providers are never called while it is held
//! - Provider registry and effective-provider resolution along the ancestor chain
//! - Store facade for navigation, CRUD and capability delegation
//! - Per-provider content caches (memory or Fjall)
//! - INCOMING/OUTGOING/BOTH synchronization
//! - URI locator mapping remote URIs back to tree paths

pub mod cache;
pub mod config;
pub mod error;
pub mod filesystem;
pub mod locator;
pub mod lock;
pub mod node;
pub mod provider;
pub mod providers;
pub mod registry;
pub mod status;
pub mod store;
pub mod sync;

pub use cache::{CacheEntry, CacheService, CacheServiceFactory, CachedOutputStream, FjallCacheService, MemoryCacheService};
pub use config::{CacheBackend, FileSystemConfig, DEFAULT_PROVIDER_ID};
pub use error::{Capability, Result, SemanticError};
pub use filesystem::SemanticFileSystem;
pub use node::{props, Lookup, NodeHandle, QualifiedName, ResourceKind, SessionValue, TreeDocument};
pub use provider::{
    ContentProvider, FederationCapability, InputStream, LocalCapability, LockingCapability,
    OutputStream, ProviderBinding, RemoteCapability, RestCapability,
};
pub use providers::{DefaultContentProvider, FederatingProvider, MemoryRemoteStore, ProviderContext, RemoteStoreProvider};
pub use registry::{ProviderFactory, ProviderRegistry};
pub use status::{CancellationToken, MultiStatus, Severity, Status};
pub use store::{SemanticStore, StoreInfo, WeakStore};
pub use sync::{decide, LocalState, RemoteChild, RemoteEndpoint, RemoteState, SyncAction, SyncDirection, SyncEngine};
