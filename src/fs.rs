use alloc::sync::Arc;

use crate::{
    EvalContext, Location, MountEntry, NodePermission, NodeRef, NodeType, VfsError, VfsResult,
    node_ptr_eq,
};

/// Per-instance filesystem operations.
///
/// One value implementing this trait backs each mounted instance. Apart from
/// `name`, `root_node` and `eval_path`, every operation has a default so a
/// backend only implements what it supports.
pub trait FilesystemOps: Send + Sync {
    /// Gets the name of the filesystem
    fn name(&self) -> &str;

    /// Gets the root node of a freshly mounted instance.
    fn root_node(&self) -> VfsResult<NodeRef>;

    /// Acquires the instance lock.
    ///
    /// This is the only blocking lock of the core. It guards structural
    /// mutation of this instance and must allow nesting.
    fn lock(&self) {}

    /// Releases the instance lock.
    fn unlock(&self) {}

    /// Evaluates the remaining path of `ctx` relative to its current
    /// location. Most backends forward to
    /// [`eval_path_generic`](crate::eval_path_generic).
    fn eval_path(&self, ctx: &mut EvalContext<'_>);

    /// Returns whether two locations of this instance refer to the same node.
    fn are_nodes_equal(&self, a: &Location, b: &Location) -> bool {
        node_ptr_eq(a.node(), b.node())
    }

    /// Called when a location of this instance is cloned.
    ///
    /// An error turns the clone into the null location.
    fn clone_node(&self, _loc: &Location) -> VfsResult<()> {
        Ok(())
    }

    /// Called when a location of this instance goes away.
    fn free_node(&self, _loc: &Location) {}

    /// Creates a node named `name` in the directory `parent`.
    fn mknod(
        &self,
        _parent: &Location,
        _name: &str,
        _node_type: NodeType,
        _mode: NodePermission,
        _uid: u32,
        _gid: u32,
    ) -> VfsResult<()> {
        Err(VfsError::Unsupported)
    }

    /// Replaces the permission bits of the node at `loc`.
    fn fchmod(&self, _loc: &Location, _mode: NodePermission) -> VfsResult<()> {
        Err(VfsError::Unsupported)
    }

    /// Changes the owner and group of the node at `loc`.
    fn chown(&self, _loc: &Location, _uid: u32, _gid: u32) -> VfsResult<()> {
        Err(VfsError::Unsupported)
    }

    /// Marks `mount_point`, a location of this instance, as covered by
    /// `entry`. Path evaluation must restart at the root of `entry` when it
    /// walks into the mount point.
    fn mount(&self, _mount_point: &Location, _entry: &Arc<MountEntry>) -> VfsResult<()> {
        Err(VfsError::Unsupported)
    }

    /// Removes the mark set by [`FilesystemOps::mount`] for `entry`.
    fn unmount(&self, _entry: &MountEntry) -> VfsResult<()> {
        Err(VfsError::Unsupported)
    }

    /// Called once the instance has been torn down.
    fn unmounted(&self, _entry: &MountEntry) {}
}

/// Options of a single mount.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MountOptions {
    pub read_only: bool,
}
