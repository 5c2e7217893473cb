use core::any::Any;

use alloc::sync::Arc;

use crate::{Handle, Metadata, NodeType, OpenFlags, VfsError, VfsResult};

/// Node operations: the handler set every located node carries.
///
/// The core dispatches through this trait exactly once per operation and
/// never looks at backend-private data. Everything except `node_type`,
/// `fstat` and `into_any` has a default that mirrors what a node without the
/// capability would report.
pub trait NodeOps: Send + Sync {
    /// Gets the type of the node.
    fn node_type(&self) -> NodeType;

    /// Gets the metadata of the node.
    fn fstat(&self) -> VfsResult<Metadata>;

    /// Called after the node has been bound to `handle` by `open`.
    fn open(&self, _handle: &Handle, _flags: OpenFlags) -> VfsResult<()> {
        Ok(())
    }

    /// Called once when the last `close` of `handle` happens.
    fn close(&self, _handle: &Handle) -> VfsResult<()> {
        Ok(())
    }

    /// Reads a number of bytes starting from a given offset.
    fn read(&self, _handle: &Handle, _buf: &mut [u8], _offset: u64) -> VfsResult<usize> {
        Err(VfsError::Unsupported)
    }

    /// Writes a number of bytes starting from a given offset.
    fn write(&self, _handle: &Handle, _buf: &[u8], _offset: u64) -> VfsResult<usize> {
        Err(VfsError::Unsupported)
    }

    /// Device-specific control request.
    fn ioctl(&self, _handle: &Handle, _request: u32, _arg: usize) -> VfsResult<usize> {
        Err(VfsError::Unsupported)
    }

    /// Casts the node to a `&dyn core::any::Any`.
    fn into_any(self: Arc<Self>) -> Arc<dyn Any + Send + Sync>;
}

/// Shared reference to a node's handler set and private data.
pub type NodeRef = Arc<dyn NodeOps>;

/// Returns whether two node references designate the same node.
pub fn node_ptr_eq(a: &NodeRef, b: &NodeRef) -> bool {
    core::ptr::addr_eq(Arc::as_ptr(a), Arc::as_ptr(b))
}

/// Downcasts a node to the backend's concrete node type.
pub fn downcast_node<T: Send + Sync + 'static>(node: &NodeRef) -> VfsResult<Arc<T>> {
    node.clone()
        .into_any()
        .downcast()
        .map_err(|_| VfsError::InvalidArgument)
}
