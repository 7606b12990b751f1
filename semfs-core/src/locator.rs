//! URI locator
//!
//! Secondary index from remote URI strings to tree paths. Built lazily on
//! the first query by walking the tree, kept current by property-change
//! notifications, and dropped wholesale on structural changes.

use crate::error::Result;
use crate::lock::TreeLock;
use crate::node::props;
use parking_lot::Mutex;
use std::collections::{BTreeSet, HashMap};

type UriIndex = HashMap<String, BTreeSet<String>>;

#[derive(Default)]
struct LocatorState {
    index: Option<UriIndex>,
    /// Bumped by every invalidation so a build racing one is discarded
    epoch: u64,
}

/// URI → path index
#[derive(Default)]
pub struct UriLocator {
    state: Mutex<LocatorState>,
}

impl UriLocator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_built(&self) -> bool {
        self.state.lock().index.is_some()
    }

    /// Drop the index; the next query rebuilds it
    pub fn invalidate(&self) {
        let mut state = self.state.lock();
        state.index = None;
        state.epoch += 1;
        tracing::debug!(epoch = state.epoch, "uri index invalidated");
    }

    /// Incremental update after the URI property of `path` changed
    ///
    /// Called with the tree write lock held. While the index is not built
    /// only the epoch moves, so a build that read the old value is discarded.
    pub fn uri_changed(&self, path: &str, old: Option<&str>, new: Option<&str>) {
        let mut state = self.state.lock();
        let Some(index) = state.index.as_mut() else {
            state.epoch += 1;
            return;
        };
        if let Some(old) = old {
            if let Some(paths) = index.get_mut(old) {
                paths.remove(path);
                if paths.is_empty() {
                    index.remove(old);
                }
            }
        }
        if let Some(new) = new {
            index.entry(new.to_string()).or_default().insert(path.to_string());
        }
    }

    /// Paths whose remote URI is `uri`, optionally restricted to the subtree at `root_path`
    ///
    /// Must be called without the tree lock held. The mutex is never held
    /// while the tree lock is being acquired.
    pub fn locate(&self, tree: &TreeLock, uri: &str, root_path: Option<&str>) -> Result<Vec<String>> {
        let epoch = {
            let state = self.state.lock();
            if let Some(index) = &state.index {
                return Ok(filter(index, uri, root_path));
            }
            state.epoch
        };

        let index = Self::build(tree)?;
        let result = filter(&index, uri, root_path);

        let mut state = self.state.lock();
        if state.epoch == epoch && state.index.is_none() {
            tracing::debug!(uris = index.len(), "uri index built");
            state.index = Some(index);
        }
        Ok(result)
    }

    fn build(tree: &TreeLock) -> Result<UriIndex> {
        tree.read("uri index build", |t| {
            let mut index = UriIndex::new();
            t.walk(|path, node| {
                if !node.exists {
                    return;
                }
                if let Some(uri) = node.persistent_properties.get(props::REMOTE_URI) {
                    index.entry(uri.clone()).or_default().insert(path.to_string());
                }
            });
            index
        })
    }
}

fn filter(index: &UriIndex, uri: &str, root_path: Option<&str>) -> Vec<String> {
    let Some(paths) = index.get(uri) else {
        return Vec::new();
    };
    paths
        .iter()
        .filter(|p| match root_path {
            None => true,
            Some(root) => {
                let root = root.trim_end_matches('/');
                p.as_str() == root || p.starts_with(&format!("{}/", root))
            }
        })
        .cloned()
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::node::{NodeTree, ResourceKind};

    fn tree_with_uris() -> TreeLock {
        let mut tree = NodeTree::new();
        let a = tree.add_root("a", None).unwrap();
        let b = tree.add_root("b", None).unwrap();
        for root in [a, b] {
            let f = tree.create_child(root, "f", ResourceKind::File, true).unwrap();
            tree.get_mut(f)
                .unwrap()
                .persistent_properties
                .insert(props::REMOTE_URI.to_string(), "http://host/f".to_string());
        }
        TreeLock::new(tree)
    }

    #[test]
    fn test_lazy_build_and_subtree_filter() {
        let tree = tree_with_uris();
        let locator = UriLocator::new();
        assert!(!locator.is_built());

        let all = locator.locate(&tree, "http://host/f", None).unwrap();
        assert_eq!(all, vec!["/a/f".to_string(), "/b/f".to_string()]);
        assert!(locator.is_built());

        let only_b = locator.locate(&tree, "http://host/f", Some("/b")).unwrap();
        assert_eq!(only_b, vec!["/b/f".to_string()]);
        assert!(locator.locate(&tree, "http://other", None).unwrap().is_empty());
    }

    #[test]
    fn test_incremental_updates() {
        let tree = tree_with_uris();
        let locator = UriLocator::new();
        locator.locate(&tree, "x", None).unwrap();

        locator.uri_changed("/a/f", Some("http://host/f"), Some("http://host/g"));
        assert_eq!(
            locator.locate(&tree, "http://host/g", None).unwrap(),
            vec!["/a/f".to_string()]
        );
        assert_eq!(
            locator.locate(&tree, "http://host/f", None).unwrap(),
            vec!["/b/f".to_string()]
        );

        locator.invalidate();
        assert!(!locator.is_built());
        // Rebuilding from the tree restores what the tree actually holds
        assert_eq!(locator.locate(&tree, "http://host/f", None).unwrap().len(), 2);
    }
}
