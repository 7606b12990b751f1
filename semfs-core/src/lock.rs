//! Lock manager
//!
//! One readers-writer lock guards every read and write of the [`NodeTree`].
//! Access goes through closures that receive the tree and return an owned
//! value, so no reference into the tree can outlive the critical section.
//!
//! Providers may call back into the tree while serving a request. To keep
//! that safe, no provider is ever called with the lock held. A per-thread
//! hold counter turns accidental re-entry into a `LockConflict` error
//! instead of a deadlock.

use crate::error::{Result, SemanticError};
use crate::node::NodeTree;
use parking_lot::RwLock;
use std::cell::Cell;

thread_local! {
    static HELD: Cell<u32> = const { Cell::new(0) };
}

/// Decrements the per-thread hold counter when the critical section ends,
/// including on unwind.
struct HoldGuard;

impl HoldGuard {
    fn enter(operation: &'static str) -> Result<Self> {
        HELD.with(|held| {
            if held.get() > 0 {
                return Err(SemanticError::LockConflict(format!(
                    "{} attempted to acquire the tree lock while this thread already holds it",
                    operation
                )));
            }
            held.set(held.get() + 1);
            Ok(HoldGuard)
        })
    }
}

impl Drop for HoldGuard {
    fn drop(&mut self) {
        HELD.with(|held| held.set(held.get().saturating_sub(1)));
    }
}

/// True if the calling thread is inside a tree critical section
pub fn is_held_by_current_thread() -> bool {
    HELD.with(|held| held.get() > 0)
}

/// Fail with `LockConflict` if the calling thread holds the tree lock
///
/// Called before every provider call-out and before synchronization.
pub fn ensure_unlocked(operation: &'static str) -> Result<()> {
    if is_held_by_current_thread() {
        return Err(SemanticError::LockConflict(format!(
            "{} must not be invoked while the tree lock is held",
            operation
        )));
    }
    Ok(())
}

/// The process-wide tree lock
pub struct TreeLock {
    tree: RwLock<NodeTree>,
}

impl TreeLock {
    pub fn new(tree: NodeTree) -> Self {
        Self {
            tree: RwLock::new(tree),
        }
    }

    /// Run `f` under the read lock
    pub fn read<R>(&self, operation: &'static str, f: impl FnOnce(&NodeTree) -> R) -> Result<R> {
        let _hold = HoldGuard::enter(operation)?;
        let tree = self.tree.read();
        tracing::trace!(operation, "tree read lock acquired");
        Ok(f(&tree))
    }

    /// Run `f` under the write lock
    pub fn write<R>(
        &self,
        operation: &'static str,
        f: impl FnOnce(&mut NodeTree) -> R,
    ) -> Result<R> {
        let _hold = HoldGuard::enter(operation)?;
        let mut tree = self.tree.write();
        tracing::trace!(operation, "tree write lock acquired");
        Ok(f(&mut tree))
    }

    /// Read-lock variant for closures that themselves return a `Result`
    pub fn try_read<R>(
        &self,
        operation: &'static str,
        f: impl FnOnce(&NodeTree) -> Result<R>,
    ) -> Result<R> {
        self.read(operation, f)?
    }

    /// Write-lock variant for closures that themselves return a `Result`
    pub fn try_write<R>(
        &self,
        operation: &'static str,
        f: impl FnOnce(&mut NodeTree) -> Result<R>,
    ) -> Result<R> {
        self.write(operation, f)?
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::node::ResourceKind;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn test_reentry_is_a_conflict_not_a_deadlock() {
        let lock = TreeLock::new(NodeTree::new());
        let nested = lock
            .read("outer", |_| lock.read("inner", |_| ()))
            .unwrap();
        assert!(matches!(nested, Err(SemanticError::LockConflict(_))));

        let nested = lock
            .write("outer", |_| lock.write("inner", |_| ()))
            .unwrap();
        assert!(matches!(nested, Err(SemanticError::LockConflict(_))));
    }

    #[test]
    fn test_ensure_unlocked() {
        let lock = TreeLock::new(NodeTree::new());
        assert!(ensure_unlocked("call-out").is_ok());
        let inside = lock.read("inspect", |_| ensure_unlocked("call-out")).unwrap();
        assert!(matches!(inside, Err(SemanticError::LockConflict(_))));
        assert!(!is_held_by_current_thread());
    }

    #[test]
    fn test_hold_counter_released_after_panic() {
        let lock = Arc::new(TreeLock::new(NodeTree::new()));
        let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
            let _ = lock.read("panicking", |_| -> () { panic!("boom") });
        }));
        assert!(result.is_err());
        assert!(!is_held_by_current_thread());
        assert!(lock.read("after", |_| ()).is_ok());
    }

    #[test]
    fn test_writers_are_serialized() {
        let mut tree = NodeTree::new();
        let root = tree.add_root("p", None).unwrap();
        let lock = Arc::new(TreeLock::new(tree));

        let handles: Vec<_> = (0..8)
            .map(|i| {
                let lock = lock.clone();
                thread::spawn(move || {
                    lock.try_write("create", |t| {
                        t.create_child(root, &format!("f{}", i), ResourceKind::File, true)
                    })
                    .unwrap();
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }

        let names = lock.try_read("names", |t| t.child_names(root)).unwrap();
        assert_eq!(names.len(), 8);
    }
}
