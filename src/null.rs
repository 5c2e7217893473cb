//! The null location: what every failed evaluation and every torn down
//! global location collapses into.

use core::any::Any;

use alloc::sync::Arc;
use spin::Lazy;

use crate::{
    EvalContext, FilesystemOps, Handle, Location, Metadata, MountEntry, MountOptions, NodeOps,
    NodeRef, NodeType, OpenFlags, VfsError, VfsResult,
};

struct NullNode;

impl NodeOps for NullNode {
    fn node_type(&self) -> NodeType {
        NodeType::Unknown
    }

    fn fstat(&self) -> VfsResult<Metadata> {
        Err(VfsError::NoDevice)
    }

    fn open(&self, _handle: &Handle, _flags: OpenFlags) -> VfsResult<()> {
        Err(VfsError::NoDevice)
    }

    fn close(&self, _handle: &Handle) -> VfsResult<()> {
        Err(VfsError::NoDevice)
    }

    fn read(&self, _handle: &Handle, _buf: &mut [u8], _offset: u64) -> VfsResult<usize> {
        Err(VfsError::NoDevice)
    }

    fn write(&self, _handle: &Handle, _buf: &[u8], _offset: u64) -> VfsResult<usize> {
        Err(VfsError::NoDevice)
    }

    fn ioctl(&self, _handle: &Handle, _request: u32, _arg: usize) -> VfsResult<usize> {
        Err(VfsError::NoDevice)
    }

    fn into_any(self: Arc<Self>) -> Arc<dyn Any + Send + Sync> {
        self
    }
}

struct NullFilesystem;

impl FilesystemOps for NullFilesystem {
    fn name(&self) -> &str {
        "null"
    }

    fn root_node(&self) -> VfsResult<NodeRef> {
        Err(VfsError::NoDevice)
    }

    fn eval_path(&self, ctx: &mut EvalContext<'_>) {
        // The current location is null, so this only consumes the path.
        ctx.error(VfsError::NoDevice);
    }

    fn are_nodes_equal(&self, _a: &Location, _b: &Location) -> bool {
        false
    }

    fn mknod(
        &self,
        _parent: &Location,
        _name: &str,
        _node_type: NodeType,
        _mode: crate::NodePermission,
        _uid: u32,
        _gid: u32,
    ) -> VfsResult<()> {
        Err(VfsError::NoDevice)
    }

    fn fchmod(&self, _loc: &Location, _mode: crate::NodePermission) -> VfsResult<()> {
        Err(VfsError::NoDevice)
    }

    fn chown(&self, _loc: &Location, _uid: u32, _gid: u32) -> VfsResult<()> {
        Err(VfsError::NoDevice)
    }

    fn mount(&self, _mount_point: &Location, _entry: &Arc<MountEntry>) -> VfsResult<()> {
        Err(VfsError::NoDevice)
    }

    fn unmount(&self, _entry: &MountEntry) -> VfsResult<()> {
        Err(VfsError::NoDevice)
    }
}

pub(crate) static NULL_NODE: Lazy<NodeRef> = Lazy::new(|| Arc::new(NullNode));

pub(crate) static NULL_FILESYSTEM: Lazy<Arc<dyn FilesystemOps>> =
    Lazy::new(|| Arc::new(NullFilesystem));

pub(crate) static NULL_MOUNT: Lazy<Arc<MountEntry>> =
    Lazy::new(|| MountEntry::null(NULL_FILESYSTEM.clone(), MountOptions::default()));
