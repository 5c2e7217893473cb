use core::{
    fmt, mem,
    sync::atomic::{AtomicUsize, Ordering},
};

use alloc::sync::Arc;
use inherit_methods_macro::inherit_methods;
use log::{trace, warn};
use smallvec::SmallVec;
use spin::{Lazy, Mutex};

use crate::{
    FilesystemOps, Metadata, MountEntry, NodeRef, NodeType, VfsError, VfsResult, downcast_node,
    mount::MemberKey,
    null::{NULL_MOUNT, NULL_NODE},
};

/// A located node: a node of one filesystem instance.
///
/// While alive, a location is a member of its instance's location chain.
/// Cloning asks the backend first and registers the clone; dropping tells the
/// backend and unregisters, which may complete a pending unmount of the
/// instance.
pub struct Location {
    node: NodeRef,
    mount: Arc<MountEntry>,
    key: Option<MemberKey>,
}

#[inherit_methods(from = "self.node")]
impl Location {
    pub fn node_type(&self) -> NodeType;
    pub fn fstat(&self) -> VfsResult<Metadata>;
}

impl Location {
    pub fn new(mount: Arc<MountEntry>, node: NodeRef) -> Self {
        let key = mount.add_location();
        Self {
            node,
            mount,
            key: Some(key),
        }
    }

    /// The inert location every failed operation falls back to.
    pub fn null() -> Self {
        Self {
            node: NULL_NODE.clone(),
            mount: NULL_MOUNT.clone(),
            key: None,
        }
    }

    pub fn is_null(&self) -> bool {
        Arc::ptr_eq(&self.mount, &NULL_MOUNT)
    }

    pub fn node(&self) -> &NodeRef {
        &self.node
    }

    pub fn mount(&self) -> &Arc<MountEntry> {
        &self.mount
    }

    pub fn ops(&self) -> &Arc<dyn FilesystemOps> {
        self.mount.ops()
    }

    /// Moves the location to another node of the same instance.
    pub fn set_node(&mut self, node: NodeRef) {
        self.node = node;
    }

    /// Releases the location and leaves the null location in its place.
    pub fn detach(&mut self) {
        drop(self.take());
    }

    /// Moves the location out, leaving the null location in its place.
    pub fn take(&mut self) -> Location {
        mem::replace(self, Location::null())
    }

    pub fn is_directory(&self) -> bool {
        self.node_type().is_directory()
    }

    /// Returns whether this is the root node of its instance.
    pub fn is_instance_root(&self) -> bool {
        self.mount.is_root_location(self)
    }

    pub fn same_instance_as(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.mount, &other.mount)
    }

    /// Checks that both locations exist and live in the same instance.
    ///
    /// Fails with [`VfsError::NoDevice`] if either one is the null location
    /// and with [`VfsError::CrossDevice`] if they belong to different
    /// instances.
    pub fn exists_in_same_instance_as(&self, other: &Self) -> VfsResult<()> {
        if self.is_null() || other.is_null() {
            return Err(VfsError::NoDevice);
        }
        if !self.same_instance_as(other) {
            return Err(VfsError::CrossDevice);
        }
        Ok(())
    }

    pub fn downcast<T: Send + Sync + 'static>(&self) -> VfsResult<Arc<T>> {
        downcast_node(&self.node)
    }
}

impl Clone for Location {
    fn clone(&self) -> Self {
        if self.is_null() {
            return Location::null();
        }
        match self.ops().clone_node(self) {
            Ok(()) => Location::new(self.mount.clone(), self.node.clone()),
            Err(err) => {
                warn!("cannot clone location in {}: {}", self.ops().name(), err);
                Location::null()
            }
        }
    }
}

impl Drop for Location {
    fn drop(&mut self) {
        let Some(key) = self.key.take() else {
            return;
        };
        self.mount.ops().free_node(self);
        self.mount.remove_location(key);
    }
}

impl fmt::Debug for Location {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_null() {
            return f.write_str("Location(null)");
        }
        f.debug_struct("Location")
            .field("fs", &self.ops().name())
            .field("device", &self.mount.device())
            .field("node_type", &self.node_type())
            .finish()
    }
}

/// A location shared by reference count.
///
/// The count is explicit rather than the `Arc` strong count: reaching zero
/// tears the location down right away in the releasing context, unless the
/// release was deferred, in which case the last reference is parked in the
/// deferred-release queue of the [`Vfs`](crate::Vfs) until the next
/// `obtain`.
pub struct GlobalLocation {
    location: Mutex<Location>,
    reference_count: AtomicUsize,
    deferred_released_count: AtomicUsize,
}

pub(crate) static NULL_GLOBAL: Lazy<Arc<GlobalLocation>> =
    Lazy::new(|| Arc::new(GlobalLocation::new(Location::null())));

impl GlobalLocation {
    fn new(location: Location) -> Self {
        Self {
            location: Mutex::new(location),
            reference_count: AtomicUsize::new(1),
            deferred_released_count: AtomicUsize::new(0),
        }
    }

    fn is_null(self: &Arc<Self>) -> bool {
        Arc::ptr_eq(self, &NULL_GLOBAL)
    }

    pub fn reference_count(&self) -> usize {
        self.reference_count.load(Ordering::Acquire)
    }

    /// Drops `count` references. The last one tears the location down, and
    /// every release re-tests whether its instance became ready for unmount.
    fn release_count(self: &Arc<Self>, count: usize) {
        let mount = self.location.lock().mount().clone();
        let (do_free, do_unmount) = mount.update_then_check_unmount(|| {
            self.reference_count.fetch_sub(count, Ordering::AcqRel) == count
        });
        if do_free && !self.is_null() {
            let location = self.location.lock().take();
            drop(location);
        }
        if do_unmount {
            mount.do_unmount();
        }
    }
}

/// One counted reference to a [`GlobalLocation`].
///
/// Dropping it is a non-deferred release. Use
/// [`Vfs::release`](crate::Vfs::release) to release from a context that must
/// not block.
pub struct GlobalRef {
    global: Arc<GlobalLocation>,
    counted: bool,
}

impl GlobalRef {
    /// Wraps an owned location into a new global location with a reference
    /// count of one.
    pub fn new(location: Location) -> Self {
        Self {
            global: Arc::new(GlobalLocation::new(location)),
            counted: true,
        }
    }

    /// Returns a counted reference to the null global location.
    pub fn null() -> Self {
        NULL_GLOBAL.reference_count.fetch_add(1, Ordering::AcqRel);
        Self {
            global: NULL_GLOBAL.clone(),
            counted: true,
        }
    }

    pub fn is_null(&self) -> bool {
        self.global.is_null()
    }

    pub fn reference_count(&self) -> usize {
        self.global.reference_count()
    }

    pub fn ptr_eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.global, &other.global)
    }

    pub fn mount(&self) -> Arc<MountEntry> {
        self.global.location.lock().mount().clone()
    }

    pub fn node(&self) -> NodeRef {
        self.global.location.lock().node().clone()
    }

    pub fn node_type(&self) -> NodeType {
        self.node().node_type()
    }

    /// Clones the shared location into an owned one.
    pub fn clone_location(&self) -> Location {
        self.global.location.lock().clone()
    }

    /// Runs `f` with the shared location locked. `f` must not touch this
    /// global location again.
    pub(crate) fn with_location<R>(&self, f: impl FnOnce(&Location) -> R) -> R {
        f(&self.global.location.lock())
    }

    pub(crate) fn global(&self) -> &Arc<GlobalLocation> {
        &self.global
    }
}

impl Clone for GlobalRef {
    fn clone(&self) -> Self {
        self.global.reference_count.fetch_add(1, Ordering::AcqRel);
        Self {
            global: self.global.clone(),
            counted: true,
        }
    }
}

impl Drop for GlobalRef {
    fn drop(&mut self) {
        if self.counted {
            self.global.release_count(1);
        }
    }
}

impl fmt::Debug for GlobalRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("GlobalRef")
            .field("null", &self.is_null())
            .field("reference_count", &self.reference_count())
            .finish()
    }
}

/// A place that holds one reference to a global location, such as the root
/// directory of a task or the root of a mounted instance.
///
/// An empty slot reads as the null location.
pub struct GlobalSlot(Mutex<Option<GlobalRef>>);

impl GlobalSlot {
    pub const fn empty() -> Self {
        Self(Mutex::new(None))
    }

    pub fn new(global: GlobalRef) -> Self {
        Self(Mutex::new(Some(global)))
    }

    pub fn is_empty(&self) -> bool {
        self.0.lock().is_none()
    }

    /// Reference count of the held global location.
    pub fn reference_count(&self) -> Option<usize> {
        self.0.lock().as_ref().map(GlobalRef::reference_count)
    }

    /// Returns whether the slot holds the same global location as `global`.
    pub fn holds(&self, global: &GlobalRef) -> bool {
        self.0.lock().as_ref().is_some_and(|it| it.ptr_eq(global))
    }

    /// Takes a new counted reference on the held global location.
    pub(crate) fn get(&self) -> GlobalRef {
        match self.0.lock().as_ref() {
            Some(global) => global.clone(),
            None => GlobalRef::null(),
        }
    }

    /// Returns the held global location without counting a reference.
    pub(crate) fn peek(&self) -> Option<Arc<GlobalLocation>> {
        self.0.lock().as_ref().map(|it| it.global().clone())
    }

    pub(crate) fn replace(&self, global: Option<GlobalRef>) -> Option<GlobalRef> {
        mem::replace(&mut *self.0.lock(), global)
    }

    pub(crate) fn take(&self) -> Option<GlobalRef> {
        self.replace(None)
    }
}

impl Default for GlobalSlot {
    fn default() -> Self {
        Self::empty()
    }
}

impl GlobalLocation {
    /// Runs `f` with the shared location locked.
    pub(crate) fn with_location<R>(&self, f: impl FnOnce(&Location) -> R) -> R {
        f(&self.location.lock())
    }
}

/// Global locations whose last reference was released where blocking is not
/// allowed. The teardown happens on the next `obtain`.
pub(crate) struct DeferredReleases {
    queue: Mutex<SmallVec<[Arc<GlobalLocation>; 4]>>,
}

impl DeferredReleases {
    pub const fn new() -> Self {
        Self {
            queue: Mutex::new(SmallVec::new_const()),
        }
    }

    /// Releases `global` without tearing anything down.
    pub fn defer(&self, mut global: GlobalRef) {
        global.counted = false;
        let inner = global.global();
        let released = inner
            .reference_count
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |count| {
                (count > 1).then(|| count - 1)
            })
            .is_ok();
        if released {
            return;
        }
        trace!("deferring release of the last reference");
        let mut queue = self.queue.lock();
        if inner.deferred_released_count.fetch_add(1, Ordering::Relaxed) == 0 {
            queue.push(inner.clone());
        }
    }

    /// Completes every deferred release. Must run where blocking is legal.
    pub fn drain(&self) {
        loop {
            let next = self.queue.lock().pop().map(|global| {
                let count = global.deferred_released_count.swap(0, Ordering::Relaxed);
                (global, count)
            });
            let Some((global, count)) = next else {
                break;
            };
            trace!("completing {} deferred release(s)", count);
            global.release_count(count);
        }
    }

    pub fn pending(&self) -> usize {
        self.queue.lock().len()
    }
}
