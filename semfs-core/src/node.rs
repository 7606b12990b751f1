//! Node store
//!
//! The in-memory resource tree. Nodes live in an arena addressed by
//! generational [`NodeHandle`]s; parents hold their children by name and
//! children keep a non-owning handle back to the parent. Top-level nodes
//! are roots, kept in a separate collection keyed by name.
//!
//! Nothing in this module locks. The whole [`NodeTree`] sits behind the
//! lock manager in [`crate::lock`].

use crate::error::{Result, SemanticError};
use crate::provider::ProviderBinding;
use serde::{Deserialize, Serialize};
use std::any::Any;
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::Arc;

/// Version of the persisted tree document
pub const DOCUMENT_VERSION: u32 = 1;

/// Kind of resource a node represents
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResourceKind {
    File,
    Folder,
    Project,
    /// Placeholder for a child that has not been resolved yet
    Unknown,
}

impl ResourceKind {
    pub fn is_container(&self) -> bool {
        matches!(self, ResourceKind::Folder | ResourceKind::Project)
    }
}

impl fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ResourceKind::File => "file",
            ResourceKind::Folder => "folder",
            ResourceKind::Project => "project",
            ResourceKind::Unknown => "unknown",
        };
        f.write_str(s)
    }
}

/// Namespaced property key
///
/// The string form is `qualifier:local_name`. The qualifier must not be empty.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct QualifiedName {
    qualifier: String,
    local_name: String,
}

impl QualifiedName {
    pub fn new(qualifier: &str, local_name: &str) -> Result<Self> {
        if qualifier.is_empty() || qualifier.contains(':') {
            return Err(SemanticError::InvalidPropertyKey(format!(
                "{}:{}",
                qualifier, local_name
            )));
        }
        if local_name.is_empty() {
            return Err(SemanticError::InvalidPropertyKey(format!("{}:", qualifier)));
        }
        Ok(Self {
            qualifier: qualifier.to_string(),
            local_name: local_name.to_string(),
        })
    }

    /// Parse `qualifier:local_name`
    pub fn parse(key: &str) -> Result<Self> {
        match key.split_once(':') {
            Some((qualifier, local_name)) => Self::new(qualifier, local_name),
            None => Err(SemanticError::InvalidPropertyKey(key.to_string())),
        }
    }

    pub fn qualifier(&self) -> &str {
        &self.qualifier
    }

    pub fn local_name(&self) -> &str {
        &self.local_name
    }
}

impl fmt::Display for QualifiedName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.qualifier, self.local_name)
    }
}

/// Well-known persistent property keys
pub mod props {
    /// Qualifier shared by all built-in keys
    pub const QUALIFIER: &str = "semfs";

    /// Remote URI of a resource; indexed by the URI locator
    pub const REMOTE_URI: &str = "semfs:remote-uri";

    /// ETag seen at the last successful synchronization
    pub const ETAG: &str = "semfs:etag";

    /// Remote timestamp recorded at the last successful synchronization
    pub const SYNCED_TIMESTAMP: &str = "semfs:synced-timestamp";

    /// Content digest recorded at the last successful synchronization
    pub const SYNCED_DIGEST: &str = "semfs:synced-digest";

    /// Read-only flag ("true"/"false")
    pub const READ_ONLY: &str = "semfs:read-only";

    /// Lock token held on the remote counterpart
    pub const LOCK_TOKEN: &str = "semfs:lock-token";

    /// Stable cache namespace seed, stored on a provider's root node
    pub const CACHE_SCOPE: &str = "semfs:cache-scope";

    pub fn key(name: &str) -> super::QualifiedName {
        let (qualifier, local_name) = name.split_once(':').unwrap_or((QUALIFIER, name));
        super::QualifiedName {
            qualifier: qualifier.to_string(),
            local_name: local_name.to_string(),
        }
    }
}

/// Process-lifetime property value
pub type SessionValue = Arc<dyn Any + Send + Sync>;

/// Stable address of a node in the arena
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct NodeHandle {
    index: u32,
    generation: u32,
}

impl fmt::Display for NodeHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}.{}", self.index, self.generation)
    }
}

/// One path segment of the tree
#[derive(Clone)]
pub struct Node {
    pub name: String,
    pub kind: ResourceKind,
    pub exists: bool,
    pub local_only: bool,
    pub template_id: Option<String>,
    pub persistent_properties: BTreeMap<String, String>,
    pub session_properties: HashMap<QualifiedName, SessionValue>,
    pub children: BTreeMap<String, NodeHandle>,
    pub parent: Option<NodeHandle>,
    /// Only set on roots
    pub root_uri: Option<String>,
}

impl Node {
    fn new(name: &str, kind: ResourceKind, exists: bool) -> Self {
        Self {
            name: name.to_string(),
            kind,
            exists,
            local_only: kind.is_container(),
            template_id: None,
            persistent_properties: BTreeMap::new(),
            session_properties: HashMap::new(),
            children: BTreeMap::new(),
            parent: None,
            root_uri: None,
        }
    }

    /// Folders and projects never have a remote counterpart
    pub fn set_kind(&mut self, kind: ResourceKind) {
        self.kind = kind;
        if kind.is_container() {
            self.local_only = true;
        }
    }
}

impl fmt::Debug for Node {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Node")
            .field("name", &self.name)
            .field("kind", &self.kind)
            .field("exists", &self.exists)
            .field("local_only", &self.local_only)
            .field("template_id", &self.template_id)
            .field("children", &self.children.len())
            .finish()
    }
}

/// Result of looking up a child by name
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Lookup {
    NotPresent,
    /// Known to the tree but `exists=false`
    Placeholder(NodeHandle),
    Present(NodeHandle),
}

impl Lookup {
    pub fn handle(&self) -> Option<NodeHandle> {
        match self {
            Lookup::NotPresent => None,
            Lookup::Placeholder(h) | Lookup::Present(h) => Some(*h),
        }
    }
}

struct Slot {
    generation: u32,
    node: Option<Node>,
}

/// Arena-backed resource tree plus the named roots collection
pub struct NodeTree {
    slots: Vec<Slot>,
    free: Vec<u32>,
    roots: BTreeMap<String, NodeHandle>,
    bindings: HashMap<NodeHandle, ProviderBinding>,
}

impl Default for NodeTree {
    fn default() -> Self {
        Self::new()
    }
}

impl NodeTree {
    /// Create an empty tree
    pub fn new() -> Self {
        Self {
            slots: Vec::new(),
            free: Vec::new(),
            roots: BTreeMap::new(),
            bindings: HashMap::new(),
        }
    }

    fn alloc(&mut self, node: Node) -> NodeHandle {
        if let Some(index) = self.free.pop() {
            let slot = &mut self.slots[index as usize];
            slot.generation = slot.generation.wrapping_add(1);
            slot.node = Some(node);
            NodeHandle {
                index,
                generation: slot.generation,
            }
        } else {
            let index = self.slots.len() as u32;
            self.slots.push(Slot {
                generation: 0,
                node: Some(node),
            });
            NodeHandle {
                index,
                generation: 0,
            }
        }
    }

    fn release(&mut self, handle: NodeHandle) -> Option<Node> {
        let slot = self.slots.get_mut(handle.index as usize)?;
        if slot.generation != handle.generation {
            return None;
        }
        let node = slot.node.take()?;
        self.free.push(handle.index);
        self.bindings.remove(&handle);
        Some(node)
    }

    /// Number of live nodes
    pub fn len(&self) -> usize {
        self.slots.iter().filter(|s| s.node.is_some()).count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn get(&self, handle: NodeHandle) -> Option<&Node> {
        self.slots
            .get(handle.index as usize)
            .filter(|s| s.generation == handle.generation)
            .and_then(|s| s.node.as_ref())
    }

    pub fn get_mut(&mut self, handle: NodeHandle) -> Option<&mut Node> {
        self.slots
            .get_mut(handle.index as usize)
            .filter(|s| s.generation == handle.generation)
            .and_then(|s| s.node.as_mut())
    }

    /// Like [`NodeTree::get`] but fails with `StoreNotFound` for stale handles
    pub fn node(&self, handle: NodeHandle) -> Result<&Node> {
        self.get(handle)
            .ok_or_else(|| SemanticError::StoreNotFound(handle.to_string()))
    }

    pub fn node_mut(&mut self, handle: NodeHandle) -> Result<&mut Node> {
        self.get_mut(handle)
            .ok_or_else(|| SemanticError::StoreNotFound(handle.to_string()))
    }

    pub fn contains(&self, handle: NodeHandle) -> bool {
        self.get(handle).is_some()
    }

    // ── Roots ───────────────────────────────────────────────────

    pub fn root(&self, name: &str) -> Option<NodeHandle> {
        self.roots.get(name).copied()
    }

    /// Names of roots that exist
    pub fn root_names(&self) -> Vec<String> {
        self.roots
            .iter()
            .filter(|(_, h)| self.get(**h).is_some_and(|n| n.exists))
            .map(|(name, _)| name.clone())
            .collect()
    }

    /// Add a root, reusing a non-existent root of the same name
    pub fn add_root(&mut self, name: &str, root_uri: Option<&str>) -> Result<NodeHandle> {
        validate_name(name)?;
        if let Some(handle) = self.root(name) {
            let node = self.node_mut(handle)?;
            if node.exists {
                return Err(SemanticError::ResourceAlreadyExists(format!("/{}", name)));
            }
            node.exists = true;
            node.set_kind(ResourceKind::Project);
            node.root_uri = root_uri.map(str::to_string);
            return Ok(handle);
        }
        let mut node = Node::new(name, ResourceKind::Project, true);
        node.root_uri = root_uri.map(str::to_string);
        let handle = self.alloc(node);
        self.roots.insert(name.to_string(), handle);
        Ok(handle)
    }

    /// Clear a root's children and mark it non-existent
    pub fn clear_root(&mut self, handle: NodeHandle) -> Result<()> {
        let children: Vec<NodeHandle> = self.node(handle)?.children.values().copied().collect();
        for child in children {
            self.free_subtree(child);
        }
        let node = self.node_mut(handle)?;
        node.children.clear();
        node.exists = false;
        node.persistent_properties.clear();
        node.session_properties.clear();
        node.template_id = None;
        self.bindings.remove(&handle);
        Ok(())
    }

    pub fn rename_root(&mut self, old: &str, new: &str) -> Result<NodeHandle> {
        validate_name(new)?;
        if self.root(new).is_some_and(|h| self.get(h).is_some_and(|n| n.exists)) {
            return Err(SemanticError::ResourceAlreadyExists(format!("/{}", new)));
        }
        let handle = self
            .roots
            .remove(old)
            .ok_or_else(|| SemanticError::StoreNotFound(format!("/{}", old)))?;
        if let Some(stale) = self.roots.remove(new) {
            self.free_subtree(stale);
        }
        self.node_mut(handle)?.name = new.to_string();
        self.roots.insert(new.to_string(), handle);
        Ok(handle)
    }

    // ── Children ────────────────────────────────────────────────

    pub fn lookup_child(&self, parent: NodeHandle, name: &str) -> Result<Lookup> {
        let node = self.node(parent)?;
        Ok(match node.children.get(name) {
            None => Lookup::NotPresent,
            Some(h) => match self.get(*h) {
                Some(child) if child.exists => Lookup::Present(*h),
                Some(_) => Lookup::Placeholder(*h),
                None => Lookup::NotPresent,
            },
        })
    }

    /// Names of children with `exists=true`
    pub fn child_names(&self, parent: NodeHandle) -> Result<Vec<String>> {
        let node = self.node(parent)?;
        Ok(node
            .children
            .iter()
            .filter(|(_, h)| self.get(**h).is_some_and(|c| c.exists))
            .map(|(name, _)| name.clone())
            .collect())
    }

    pub fn existing_children(&self, parent: NodeHandle) -> Result<Vec<NodeHandle>> {
        let node = self.node(parent)?;
        Ok(node
            .children
            .values()
            .copied()
            .filter(|h| self.get(*h).is_some_and(|c| c.exists))
            .collect())
    }

    /// Create a new child node; an existing entry of the same name is replaced
    pub fn create_child(
        &mut self,
        parent: NodeHandle,
        name: &str,
        kind: ResourceKind,
        exists: bool,
    ) -> Result<NodeHandle> {
        validate_name(name)?;
        self.node(parent)?;
        let mut node = Node::new(name, kind, exists);
        node.parent = Some(parent);
        let handle = self.alloc(node);
        let previous = self
            .node_mut(parent)?
            .children
            .insert(name.to_string(), handle);
        if let Some(previous) = previous {
            self.free_subtree(previous);
        }
        Ok(handle)
    }

    /// Detach a node from its parent and free its subtree
    ///
    /// Returns the number of nodes released.
    pub fn detach(&mut self, handle: NodeHandle) -> Result<usize> {
        let node = self.node(handle)?;
        let name = node.name.clone();
        if let Some(parent) = node.parent {
            if let Some(p) = self.get_mut(parent) {
                if p.children.get(&name) == Some(&handle) {
                    p.children.remove(&name);
                }
            }
        } else if self.roots.get(&name) == Some(&handle) {
            self.roots.remove(&name);
        }
        Ok(self.free_subtree(handle))
    }

    fn free_subtree(&mut self, handle: NodeHandle) -> usize {
        let mut stack = vec![handle];
        let mut released = 0;
        while let Some(h) = stack.pop() {
            if let Some(node) = self.release(h) {
                stack.extend(node.children.values().copied());
                released += 1;
            }
        }
        released
    }

    // ── Paths ───────────────────────────────────────────────────

    /// Path of a node, walking parents up to its root
    pub fn path(&self, handle: NodeHandle) -> Result<String> {
        let mut segments = Vec::new();
        let mut current = Some(handle);
        while let Some(h) = current {
            let node = self.node(h)?;
            segments.push(node.name.as_str());
            current = node.parent;
        }
        let mut path = String::new();
        for segment in segments.iter().rev() {
            path.push('/');
            path.push_str(segment);
        }
        Ok(path)
    }

    /// Resolve an absolute path to an existing handle without creating placeholders
    pub fn resolve(&self, path: &str) -> Option<NodeHandle> {
        let mut parts = path.split('/').filter(|p| !p.is_empty());
        let mut current = self.root(parts.next()?)?;
        for part in parts {
            current = *self.get(current)?.children.get(part)?;
        }
        Some(current)
    }

    /// First node at or above `handle` carrying a template id
    pub fn binding_boundary(&self, handle: NodeHandle) -> Result<Option<(NodeHandle, String)>> {
        let mut current = Some(handle);
        while let Some(h) = current {
            let node = self.node(h)?;
            if let Some(id) = &node.template_id {
                return Ok(Some((h, id.clone())));
            }
            current = node.parent;
        }
        Ok(None)
    }

    /// The root at the top of `handle`'s ancestor chain
    pub fn root_of(&self, handle: NodeHandle) -> Result<NodeHandle> {
        let mut current = handle;
        while let Some(parent) = self.node(current)?.parent {
            current = parent;
        }
        Ok(current)
    }

    // ── Provider bindings ───────────────────────────────────────

    pub fn binding(&self, handle: NodeHandle) -> Option<&ProviderBinding> {
        self.bindings.get(&handle)
    }

    pub fn bind(&mut self, handle: NodeHandle, binding: ProviderBinding) {
        self.bindings.insert(handle, binding);
    }

    pub fn unbind(&mut self, handle: NodeHandle) -> Option<ProviderBinding> {
        self.bindings.remove(&handle)
    }

    /// Bound boundaries strictly below `handle`
    pub fn nested_bindings(&self, handle: NodeHandle) -> Result<Vec<(NodeHandle, &ProviderBinding)>> {
        let mut found = Vec::new();
        let mut pending: Vec<NodeHandle> = self.node(handle)?.children.values().copied().collect();
        while let Some(current) = pending.pop() {
            let Some(node) = self.get(current) else {
                continue;
            };
            if let Some(binding) = self.bindings.get(&current) {
                found.push((current, binding));
            }
            pending.extend(node.children.values().copied());
        }
        Ok(found)
    }

    // ── Traversal ───────────────────────────────────────────────

    /// Visit every existing node depth-first with its path
    pub fn walk<F>(&self, mut visit: F)
    where
        F: FnMut(&str, &Node),
    {
        for handle in self.roots.values() {
            if let Some(root) = self.get(*handle) {
                let path = format!("/{}", root.name);
                self.walk_from(&path, root, &mut visit);
            }
        }
    }

    fn walk_from<F>(&self, path: &str, node: &Node, visit: &mut F)
    where
        F: FnMut(&str, &Node),
    {
        visit(path, node);
        for (name, handle) in &node.children {
            if let Some(child) = self.get(*handle) {
                let child_path = format!("{}/{}", path, name);
                self.walk_from(&child_path, child, visit);
            }
        }
    }

    // ── Persistence ─────────────────────────────────────────────

    pub fn to_document(&self) -> TreeDocument {
        let roots = self
            .roots
            .iter()
            .filter_map(|(name, h)| {
                let node = self.get(*h)?;
                Some(RootDocument {
                    name: name.clone(),
                    root_uri: node.root_uri.clone(),
                    node: self.node_document(node),
                })
            })
            .collect();
        TreeDocument {
            version: DOCUMENT_VERSION,
            roots,
        }
    }

    fn node_document(&self, node: &Node) -> NodeDocument {
        NodeDocument {
            name: node.name.clone(),
            kind: node.kind,
            exists: node.exists,
            local_only: node.local_only,
            template_id: node.template_id.clone(),
            persistent_properties: node.persistent_properties.clone(),
            children: node
                .children
                .values()
                .filter_map(|h| self.get(*h))
                .map(|child| self.node_document(child))
                .collect(),
        }
    }

    pub fn from_document(document: &TreeDocument) -> Result<Self> {
        if document.version > DOCUMENT_VERSION {
            return Err(SemanticError::Serialization(format!(
                "Unsupported tree document version {}",
                document.version
            )));
        }
        let mut tree = Self::new();
        for root in &document.roots {
            validate_name(&root.name)?;
            let handle = tree.load_node(&root.node, None)?;
            {
                let node = tree.node_mut(handle)?;
                node.name = root.name.clone();
                node.root_uri = root.root_uri.clone();
            }
            tree.roots.insert(root.name.clone(), handle);
        }
        Ok(tree)
    }

    fn load_node(&mut self, doc: &NodeDocument, parent: Option<NodeHandle>) -> Result<NodeHandle> {
        validate_name(&doc.name)?;
        let mut node = Node::new(&doc.name, doc.kind, doc.exists);
        node.local_only = doc.local_only || doc.kind.is_container();
        node.template_id = doc.template_id.clone();
        node.persistent_properties = doc.persistent_properties.clone();
        node.parent = parent;
        let handle = self.alloc(node);
        for child in &doc.children {
            let child_handle = self.load_node(child, Some(handle))?;
            self.node_mut(handle)?
                .children
                .insert(child.name.clone(), child_handle);
        }
        Ok(handle)
    }
}

/// Reject names that cannot be a single path segment
pub fn validate_name(name: &str) -> Result<()> {
    if name.is_empty() || name == "." || name == ".." || name.contains('/') {
        return Err(SemanticError::InvalidResourceName(name.to_string()));
    }
    Ok(())
}

/// Persisted form of the whole tree
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TreeDocument {
    pub version: u32,
    #[serde(default)]
    pub roots: Vec<RootDocument>,
}

/// Persisted root entry
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RootDocument {
    pub name: String,
    #[serde(default)]
    pub root_uri: Option<String>,
    pub node: NodeDocument,
}

/// Persisted node; session properties are intentionally absent
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeDocument {
    pub name: String,
    pub kind: ResourceKind,
    #[serde(default = "default_exists")]
    pub exists: bool,
    #[serde(default)]
    pub local_only: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub template_id: Option<String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub persistent_properties: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub children: Vec<NodeDocument>,
}

fn default_exists() -> bool {
    true
}
