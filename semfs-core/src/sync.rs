//! Content synchronization
//!
//! Directional reconciliation between a provider's content cache and its
//! remote counterpart. Providers describe their remote side through
//! [`RemoteEndpoint`] and hand it to a [`SyncEngine`] together with their
//! cache; the engine decides per resource whether bytes move in or out.
//!
//! Synchronization walks the store facade and therefore must never run
//! while the tree lock is held.

use crate::cache::{content_digest, now_millis, CacheService};
use crate::error::{Result, SemanticError};
use crate::lock::ensure_unlocked;
use crate::node::{props, ResourceKind};
use crate::status::{CancellationToken, MultiStatus, Status};
use crate::store::SemanticStore;
use bytes::Bytes;
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

/// Which side wins when content is reconciled
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SyncDirection {
    /// Remote content replaces the cache
    Incoming,
    /// Cached content replaces the remote
    Outgoing,
    /// Per-resource decision, see [`decide`]
    Both,
}

impl fmt::Display for SyncDirection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            SyncDirection::Incoming => "incoming",
            SyncDirection::Outgoing => "outgoing",
            SyncDirection::Both => "both",
        };
        f.write_str(s)
    }
}

impl FromStr for SyncDirection {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "incoming" | "in" => Ok(SyncDirection::Incoming),
            "outgoing" | "out" => Ok(SyncDirection::Outgoing),
            "both" => Ok(SyncDirection::Both),
            other => Err(format!("unknown sync direction: {}", other)),
        }
    }
}

/// What the remote side reports about a resource
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteState {
    /// Modification time in milliseconds, `None` if the remote does not say
    pub timestamp: Option<i64>,
    pub etag: Option<String>,
}

/// One entry of a remote folder listing
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteChild {
    pub name: String,
    pub kind: ResourceKind,
}

/// Remote side of a provider, as seen by the [`SyncEngine`]
pub trait RemoteEndpoint {
    /// State of the remote counterpart of `store`, `None` if it does not exist
    fn fetch_state(&self, store: &SemanticStore) -> Result<Option<RemoteState>>;

    fn download(&self, store: &SemanticStore) -> Result<(Bytes, RemoteState)>;

    /// Upload `content`, last modified locally at `timestamp`
    fn upload(&self, store: &SemanticStore, content: Bytes, timestamp: i64) -> Result<RemoteState>;

    /// Remote children of a container, `None` if the remote side cannot list it
    fn list_children(&self, store: &SemanticStore) -> Result<Option<Vec<RemoteChild>>>;
}

/// Local bookkeeping of a cached file
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LocalState {
    /// Timestamp of the cached content, `None` if nothing is cached
    pub cache_timestamp: Option<i64>,
    /// SHA-256 of the cached content
    pub content_digest: Option<String>,
    /// Remote timestamp recorded by the last successful synchronization
    pub synced_timestamp: Option<i64>,
    /// Content digest recorded by the last successful synchronization
    pub synced_digest: Option<String>,
    /// Remote ETag recorded by the last successful synchronization
    pub etag: Option<String>,
}

impl LocalState {
    pub fn has_content(&self) -> bool {
        self.cache_timestamp.is_some()
    }

    /// Cached content changed since the last synchronization
    ///
    /// Digests decide when both are known; trees synchronized before digests
    /// were recorded fall back to comparing timestamps.
    pub fn is_modified(&self) -> bool {
        if !self.has_content() {
            return false;
        }
        match (&self.content_digest, &self.synced_digest) {
            (Some(current), Some(synced)) => current != synced,
            _ => self.cache_timestamp != self.synced_timestamp,
        }
    }
}

/// Outcome of [`decide`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncAction {
    Download,
    Upload,
    Nothing,
}

/// Decide which way content moves for a single file
///
/// `Both` compares ETags when both sides have one: a changed remote ETag
/// downloads, an unchanged one uploads only local changes. Without ETags a
/// remote whose timestamp still matches the last synchronization also uploads
/// only local changes. A remote that moved on downloads unless the local
/// change is strictly newer. A remote without any timestamp loses to a
/// local change and is downloaded otherwise.
pub fn decide(direction: SyncDirection, local: &LocalState, remote: Option<&RemoteState>) -> SyncAction {
    match direction {
        SyncDirection::Incoming => match remote {
            Some(_) => SyncAction::Download,
            None => SyncAction::Nothing,
        },
        SyncDirection::Outgoing => {
            if local.has_content() {
                SyncAction::Upload
            } else {
                SyncAction::Nothing
            }
        }
        SyncDirection::Both => {
            let Some(remote) = remote else {
                return if local.is_modified() {
                    SyncAction::Upload
                } else {
                    SyncAction::Nothing
                };
            };
            let Some(local_ts) = local.cache_timestamp else {
                return SyncAction::Download;
            };
            if let (Some(remote_etag), Some(local_etag)) = (&remote.etag, &local.etag) {
                return if remote_etag != local_etag {
                    SyncAction::Download
                } else if local.is_modified() {
                    SyncAction::Upload
                } else {
                    SyncAction::Nothing
                };
            }
            let Some(remote_ts) = remote.timestamp else {
                return if local.is_modified() {
                    SyncAction::Upload
                } else {
                    SyncAction::Download
                };
            };
            if local.synced_timestamp == Some(remote_ts) {
                if local.is_modified() {
                    SyncAction::Upload
                } else {
                    SyncAction::Nothing
                }
            } else if local.is_modified() && local_ts > remote_ts {
                SyncAction::Upload
            } else {
                SyncAction::Download
            }
        }
    }
}

/// Reconciles one provider's cache with its remote endpoint
pub struct SyncEngine<'a> {
    cache: Arc<dyn CacheService>,
    endpoint: &'a dyn RemoteEndpoint,
    /// Maps a store to its cache key
    key: &'a dyn Fn(&SemanticStore) -> Result<String>,
}

impl<'a> SyncEngine<'a> {
    pub fn new(
        cache: Arc<dyn CacheService>,
        endpoint: &'a dyn RemoteEndpoint,
        key: &'a dyn Fn(&SemanticStore) -> Result<String>,
    ) -> Self {
        Self {
            cache,
            endpoint,
            key,
        }
    }

    /// Synchronize `store`, recursing into containers
    ///
    /// Failures are recorded in `status`; this never returns an error.
    pub fn synchronize(
        &self,
        store: &SemanticStore,
        direction: SyncDirection,
        status: &mut MultiStatus,
        token: &CancellationToken,
    ) {
        let path = store.path().unwrap_or_default();
        if let Err(e) = ensure_unlocked("synchronize") {
            status.add_error(&path, &e);
            return;
        }
        if token.is_cancelled() {
            status.add(Status::cancel().at(&path));
            return;
        }

        let snapshot = store.kind().and_then(|kind| Ok((kind, store.is_local_only()?)));
        match snapshot {
            Ok((ResourceKind::File, true)) => {
                tracing::debug!(%path, "skipping local-only file");
            }
            Ok((ResourceKind::File, false)) => {
                match self.sync_file(store, direction) {
                    Ok(action) => tracing::debug!(%path, %direction, ?action, "file synchronized"),
                    Err(e) => status.add_error(&path, &e),
                }
            }
            Ok((ResourceKind::Folder | ResourceKind::Project, _)) => {
                self.sync_container(store, direction, status, token);
            }
            Ok((ResourceKind::Unknown, _)) => {}
            Err(e) => status.add_error(&path, &e),
        }
    }

    fn local_state(&self, store: &SemanticStore, key: &str) -> Result<LocalState> {
        let synced_timestamp = store
            .persistent_property(&props::key(props::SYNCED_TIMESTAMP))?
            .and_then(|v| v.parse::<i64>().ok());
        let entry = self.cache.entry(key)?;
        Ok(LocalState {
            cache_timestamp: entry.as_ref().map(|e| e.timestamp),
            content_digest: entry.as_ref().map(|e| content_digest(&e.content)),
            synced_timestamp,
            synced_digest: store.persistent_property(&props::key(props::SYNCED_DIGEST))?,
            etag: store.persistent_property(&props::key(props::ETAG))?,
        })
    }

    fn sync_file(&self, store: &SemanticStore, direction: SyncDirection) -> Result<SyncAction> {
        let key = (self.key)(store)?;
        let local = self.local_state(store, &key)?;
        let remote = self.endpoint.fetch_state(store)?;
        let action = decide(direction, &local, remote.as_ref());

        match action {
            SyncAction::Download => {
                let (content, state) = self.endpoint.download(store)?;
                self.cache.add_content(&key, content.clone(), state.timestamp)?;
                record_synced(store, &state, &content)?;
            }
            SyncAction::Upload => {
                let content = self.cache.get_content(&key)?;
                let timestamp = local
                    .cache_timestamp
                    .ok_or_else(|| SemanticError::CachedContentNotFound(key.clone()))?;
                let state = self.endpoint.upload(store, content.clone(), timestamp)?;
                record_synced(store, &state, &content)?;
            }
            SyncAction::Nothing => {}
        }
        Ok(action)
    }

    fn sync_container(
        &self,
        store: &SemanticStore,
        direction: SyncDirection,
        status: &mut MultiStatus,
        token: &CancellationToken,
    ) {
        let path = store.path().unwrap_or_default();

        if direction != SyncDirection::Outgoing {
            match self.endpoint.list_children(store) {
                Ok(Some(remote)) => {
                    if let Err(e) = self.reconcile_children(store, &remote, status, token) {
                        status.add_error(&path, &e);
                    }
                }
                Ok(None) => {}
                Err(e) => {
                    status.add_error(&path, &e);
                    return;
                }
            }
        }

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
            // The child may be bound to another provider
            child.synchronize_content_with_remote(direction, status, token);
        }
    }

    /// Add remote-only children and drop unmodified local children gone remotely
    fn reconcile_children(
        &self,
        store: &SemanticStore,
        remote: &[RemoteChild],
        status: &mut MultiStatus,
        token: &CancellationToken,
    ) -> Result<()> {
        mark_known_remotely(store)?;
        let parent_path = store.path()?;

        let local: BTreeSet<String> = store.child_names()?.into_iter().collect();
        let remote_names: BTreeMap<&str, ResourceKind> =
            remote.iter().map(|c| (c.name.as_str(), c.kind)).collect();

        for (name, kind) in &remote_names {
            if local.contains(*name) {
                continue;
            }
            token.check()?;
            let child_path = format!("{}/{}", parent_path, name);
            let added = match kind {
                ResourceKind::File => {
                    let mut properties = BTreeMap::new();
                    properties.insert(props::READ_ONLY.to_string(), "true".to_string());
                    store.add_child_file(name, None, Some(&properties))
                }
                ResourceKind::Folder => store
                    .add_child_folder(name, None)
                    .and_then(|child| mark_known_remotely(&child).map(|_| child)),
                other => Err(SemanticError::InvalidResourceType {
                    path: child_path.clone(),
                    kind: other.to_string(),
                }),
            };
            match added {
                Ok(_) => tracing::debug!(path = %child_path, "added remote child"),
                Err(e) => status.add_error(&child_path, &e),
            }
        }

        for name in local.iter().filter(|n| !remote_names.contains_key(n.as_str())) {
            token.check()?;
            let child_path = format!("{}/{}", parent_path, name);
            let child = match store.get_child(name) {
                Ok(child) => child,
                Err(e) => {
                    status.add_error(&child_path, &e);
                    continue;
                }
            };
            match self.has_local_changes(&child) {
                Ok(true) => tracing::debug!(path = %child_path, "keeping locally changed resource missing remotely"),
                Ok(false) => match child.remove(true, token) {
                    Ok(()) => tracing::debug!(path = %child_path, "removed resource deleted remotely"),
                    Err(e) => status.add_error(&child_path, &e),
                },
                Err(e) => status.add_error(&child_path, &e),
            }
        }
        Ok(())
    }

    /// True if `store` (or anything below it) holds changes the remote never saw
    fn has_local_changes(&self, store: &SemanticStore) -> Result<bool> {
        let synced = store.persistent_property(&props::key(props::SYNCED_TIMESTAMP))?;
        let digest = store.persistent_property(&props::key(props::SYNCED_DIGEST))?;
        if synced.is_none() && digest.is_none() {
            return Ok(true);
        }
        match store.kind()? {
            ResourceKind::File => {
                if store.is_local_only()? {
                    return Ok(true);
                }
                let key = (self.key)(store)?;
                Ok(self.local_state(store, &key)?.is_modified())
            }
            ResourceKind::Folder | ResourceKind::Project => {
                for child in store.child_stores()? {
                    if self.has_local_changes(&child)? {
                        return Ok(true);
                    }
                }
                Ok(false)
            }
            ResourceKind::Unknown => Ok(false),
        }
    }
}

/// Remember what the remote reported and what was transferred
pub fn record_synced(store: &SemanticStore, state: &RemoteState, content: &[u8]) -> Result<()> {
    let timestamp = state.timestamp.map(|ts| ts.to_string());
    store.set_persistent_property(&props::key(props::SYNCED_TIMESTAMP), timestamp.as_deref())?;
    store.set_persistent_property(&props::key(props::SYNCED_DIGEST), Some(&content_digest(content)))?;
    store.set_persistent_property(&props::key(props::ETAG), state.etag.as_deref())
}

/// Containers carry a sync marker once the remote side has listed them
fn mark_known_remotely(store: &SemanticStore) -> Result<()> {
    let key = props::key(props::SYNCED_TIMESTAMP);
    if store.persistent_property(&key)?.is_none() {
        store.set_persistent_property(&key, Some(&now_millis().to_string()))?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn local(cache: Option<i64>, synced: Option<i64>, etag: Option<&str>) -> LocalState {
        LocalState {
            cache_timestamp: cache,
            synced_timestamp: synced,
            etag: etag.map(str::to_string),
            ..LocalState::default()
        }
    }

    fn remote(timestamp: i64, etag: Option<&str>) -> RemoteState {
        RemoteState {
            timestamp: Some(timestamp),
            etag: etag.map(str::to_string),
        }
    }

    fn digests(mut state: LocalState, current: &[u8], synced: &[u8]) -> LocalState {
        state.content_digest = Some(content_digest(current));
        state.synced_digest = Some(content_digest(synced));
        state
    }

    #[test]
    fn test_incoming_and_outgoing_ignore_timestamps() {
        let l = local(Some(50), Some(50), None);
        let r = remote(10, None);
        assert_eq!(decide(SyncDirection::Incoming, &l, Some(&r)), SyncAction::Download);
        assert_eq!(decide(SyncDirection::Incoming, &l, None), SyncAction::Nothing);
        assert_eq!(decide(SyncDirection::Outgoing, &l, Some(&r)), SyncAction::Upload);
        assert_eq!(
            decide(SyncDirection::Outgoing, &LocalState::default(), Some(&r)),
            SyncAction::Nothing
        );
    }

    #[test]
    fn test_both_timestamp_rules() {
        // Unchanged on both sides
        assert_eq!(
            decide(SyncDirection::Both, &local(Some(10), Some(10), None), Some(&remote(10, None))),
            SyncAction::Nothing
        );
        // Local strictly newer
        assert_eq!(
            decide(SyncDirection::Both, &local(Some(20), Some(10), None), Some(&remote(10, None))),
            SyncAction::Upload
        );
        // Equal timestamps but something changed: remote wins
        assert_eq!(
            decide(SyncDirection::Both, &local(Some(30), Some(10), None), Some(&remote(30, None))),
            SyncAction::Download
        );
        // Remote moved on, local untouched but with a later timestamp
        assert_eq!(
            decide(SyncDirection::Both, &local(Some(50), Some(50), None), Some(&remote(40, None))),
            SyncAction::Download
        );
        // Remote newer
        assert_eq!(
            decide(SyncDirection::Both, &local(Some(10), Some(10), None), Some(&remote(40, None))),
            SyncAction::Download
        );
        // Nothing cached yet
        assert_eq!(
            decide(SyncDirection::Both, &LocalState::default(), Some(&remote(1, None))),
            SyncAction::Download
        );
    }

    #[test]
    fn test_both_etag_takes_precedence() {
        // Local timestamp is newer but the remote ETag moved
        assert_eq!(
            decide(
                SyncDirection::Both,
                &local(Some(99), Some(10), Some("a")),
                Some(&remote(1, Some("b")))
            ),
            SyncAction::Download
        );
        // Same ETag, local edit
        assert_eq!(
            decide(
                SyncDirection::Both,
                &local(Some(5), Some(1), Some("a")),
                Some(&remote(50, Some("a")))
            ),
            SyncAction::Upload
        );
        // Same ETag, no local edit, remote timestamp drifted
        assert_eq!(
            decide(
                SyncDirection::Both,
                &local(Some(1), Some(1), Some("a")),
                Some(&remote(50, Some("a")))
            ),
            SyncAction::Nothing
        );
    }

    #[test]
    fn test_both_without_remote() {
        assert_eq!(
            decide(SyncDirection::Both, &local(Some(5), None, None), None),
            SyncAction::Upload
        );
        assert_eq!(
            decide(SyncDirection::Both, &local(Some(5), Some(5), None), None),
            SyncAction::Nothing
        );
    }

    #[test]
    fn test_digest_detects_edit_within_same_millisecond() {
        let edited = digests(local(Some(10), Some(10), Some("a")), b"B", b"A");
        assert!(edited.is_modified());
        assert_eq!(
            decide(SyncDirection::Both, &edited, Some(&remote(10, Some("a")))),
            SyncAction::Upload
        );

        let edited = digests(local(Some(10), Some(10), None), b"B", b"A");
        assert_eq!(
            decide(SyncDirection::Both, &edited, Some(&remote(10, None))),
            SyncAction::Upload
        );
        assert_eq!(decide(SyncDirection::Both, &edited, None), SyncAction::Upload);
    }

    #[test]
    fn test_digest_ignores_timestamp_drift() {
        // Content rewritten unchanged under a new timestamp
        let same = digests(local(Some(99), Some(10), None), b"A", b"A");
        assert!(!same.is_modified());
        assert_eq!(
            decide(SyncDirection::Both, &same, Some(&remote(10, None))),
            SyncAction::Nothing
        );
    }

    #[test]
    fn test_both_without_remote_timestamp() {
        let unknown = RemoteState {
            timestamp: None,
            etag: None,
        };
        let edited = digests(local(Some(5), None, None), b"B", b"A");
        assert_eq!(decide(SyncDirection::Both, &edited, Some(&unknown)), SyncAction::Upload);
        let clean = digests(local(Some(5), None, None), b"A", b"A");
        assert_eq!(decide(SyncDirection::Both, &clean, Some(&unknown)), SyncAction::Download);
    }

    #[test]
    fn test_direction_parsing() {
        assert_eq!("IN".parse::<SyncDirection>().unwrap(), SyncDirection::Incoming);
        assert_eq!("both".parse::<SyncDirection>().unwrap(), SyncDirection::Both);
        assert!("sideways".parse::<SyncDirection>().is_err());
        assert_eq!(SyncDirection::Outgoing.to_string(), "outgoing");
    }
}
