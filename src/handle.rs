use core::{
    any::Any,
    ops::Deref,
    sync::atomic::{AtomicU32, AtomicU64, AtomicUsize, Ordering},
};

use alloc::{boxed::Box, collections::VecDeque, sync::Arc};
use log::warn;
use spin::{Mutex, MutexGuard};

use crate::{Location, NodeRef, OpenFlags, VfsError, VfsResult};

/// File descriptor: index into the [`HandleTable`].
pub type Fd = usize;

bitflags::bitflags! {
    /// State and access bits of a handle.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct HandleFlags: u32 {
        /// The slot sits on the free list.
        const FREE = 0x1;
        const NO_DELAY = 0x2;
        const READ = 0x4;
        const WRITE = 0x8;
        /// Set once the backend accepted the open, cleared by close.
        const OPEN = 0x100;
        const APPEND = 0x200;
        const CLOSE_ON_EXEC = 0x800;

        const READ_WRITE = Self::READ.bits() | Self::WRITE.bits();
    }
}

impl From<OpenFlags> for HandleFlags {
    fn from(flags: OpenFlags) -> Self {
        let mut result = HandleFlags::empty();
        result.set(HandleFlags::READ, flags.contains(OpenFlags::READ));
        result.set(HandleFlags::WRITE, flags.contains(OpenFlags::WRITE));
        result.set(HandleFlags::APPEND, flags.contains(OpenFlags::APPEND));
        result.set(HandleFlags::NO_DELAY, flags.contains(OpenFlags::NONBLOCK));
        result.set(
            HandleFlags::CLOSE_ON_EXEC,
            flags.contains(OpenFlags::CLOSE_ON_EXEC),
        );
        result
    }
}

/// Observed state of a handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HandleState {
    pub flags: HandleFlags,
    pub references: usize,
}

impl HandleState {
    pub fn is_open(&self) -> bool {
        self.flags.contains(HandleFlags::OPEN)
    }
}

/// One slot of the handle table.
pub struct Handle {
    fd: Fd,
    flags: AtomicU32,
    references: AtomicUsize,
    offset: AtomicU64,
    location: Mutex<Location>,
    data: Mutex<Option<Arc<dyn Any + Send + Sync>>>,
}

impl Handle {
    fn new(fd: Fd) -> Self {
        Self {
            fd,
            flags: AtomicU32::new(HandleFlags::FREE.bits()),
            references: AtomicUsize::new(0),
            offset: AtomicU64::new(0),
            location: Mutex::new(Location::null()),
            data: Mutex::new(None),
        }
    }

    pub fn fd(&self) -> Fd {
        self.fd
    }

    pub fn flags(&self) -> HandleFlags {
        HandleFlags::from_bits_retain(self.flags.load(Ordering::Acquire))
    }

    pub fn references(&self) -> usize {
        self.references.load(Ordering::Acquire)
    }

    pub fn is_open(&self) -> bool {
        self.flags().contains(HandleFlags::OPEN)
    }

    pub fn state(&self) -> HandleState {
        HandleState {
            flags: self.flags(),
            references: self.references(),
        }
    }

    /// Takes a reference and returns the state as observed.
    pub fn hold(&self) -> HandleState {
        let references = self.references.fetch_add(1, Ordering::Acquire) + 1;
        HandleState {
            flags: self.flags(),
            references,
        }
    }

    pub(crate) fn set_flags(&self, flags: HandleFlags) -> HandleFlags {
        HandleFlags::from_bits_retain(self.flags.fetch_or(flags.bits(), Ordering::AcqRel))
    }

    pub(crate) fn clear_flags(&self, flags: HandleFlags) -> HandleFlags {
        HandleFlags::from_bits_retain(self.flags.fetch_and(!flags.bits(), Ordering::AcqRel))
    }

    pub fn offset(&self) -> u64 {
        self.offset.load(Ordering::Acquire)
    }

    pub fn set_offset(&self, offset: u64) {
        self.offset.store(offset, Ordering::Release);
    }

    pub(crate) fn advance(&self, len: usize) {
        self.offset.fetch_add(len as u64, Ordering::AcqRel);
    }

    /// The location the handle is bound to.
    pub fn location(&self) -> MutexGuard<'_, Location> {
        self.location.lock()
    }

    pub fn node(&self) -> NodeRef {
        self.location.lock().node().clone()
    }

    pub(crate) fn bind(&self, location: Location) {
        let old = core::mem::replace(&mut *self.location.lock(), location);
        drop(old);
    }

    /// Backend private data attached by `open`.
    pub fn data(&self) -> Option<Arc<dyn Any + Send + Sync>> {
        self.data.lock().clone()
    }

    pub fn set_data(&self, data: Arc<dyn Any + Send + Sync>) {
        *self.data.lock() = Some(data);
    }

    /// Returns the slot to its pristine state and hands out what it held.
    fn reset(&self) -> (Location, Option<Arc<dyn Any + Send + Sync>>) {
        self.flags.store(HandleFlags::FREE.bits(), Ordering::Release);
        self.offset.store(0, Ordering::Relaxed);
        let location = self.location.lock().take();
        let data = self.data.lock().take();
        (location, data)
    }
}

/// Fixed-size table of handles.
///
/// A slot is on the free list exactly when it is closed and unreferenced.
/// Dropping the last [`HandleGuard`] is the only way back onto the free list.
pub struct HandleTable {
    handles: Box<[Handle]>,
    free: Mutex<VecDeque<Fd>>,
}

impl HandleTable {
    pub fn new(count: usize) -> Self {
        Self {
            handles: (0..count).map(Handle::new).collect(),
            free: Mutex::new((0..count).collect()),
        }
    }

    pub fn len(&self) -> usize {
        self.handles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handles.is_empty()
    }

    fn slot(&self, fd: Fd) -> VfsResult<&Handle> {
        self.handles.get(fd).ok_or(VfsError::BadHandle)
    }

    /// Pops a slot off the free list.
    ///
    /// The handle comes back held once and not yet open; the caller sets
    /// the open bit when the backend accepted the open.
    pub fn allocate(&self) -> VfsResult<HandleGuard<'_>> {
        let Some(fd) = self.free.lock().pop_front() else {
            warn!("handle table exhausted ({} slots)", self.handles.len());
            return Err(VfsError::NoHandlesAvailable);
        };
        let handle = &self.handles[fd];
        handle.references.fetch_add(1, Ordering::Acquire);
        handle.flags.store(0, Ordering::Release);
        Ok(HandleGuard { table: self, fd })
    }

    /// Drops one reference; frees the slot if it is now closed and
    /// unreferenced. An unreferenced slot is left alone.
    pub(crate) fn drop_ref(&self, fd: Fd) {
        let Some(handle) = self.handles.get(fd) else {
            return;
        };
        let Ok(previous) = handle
            .references
            .fetch_update(Ordering::Release, Ordering::Relaxed, |count| {
                count.checked_sub(1)
            })
        else {
            warn!("dropping an unheld reference on handle {fd}");
            return;
        };
        if previous == 1 && !handle.is_open() {
            self.try_free(handle);
        }
    }

    fn try_free(&self, handle: &Handle) {
        let released = {
            let mut free = self.free.lock();
            let flags = handle.flags();
            if flags.intersects(HandleFlags::FREE | HandleFlags::OPEN)
                || handle.references.load(Ordering::Acquire) != 0
            {
                return;
            }
            let released = handle.reset();
            free.push_back(handle.fd);
            released
        };
        drop(released);
    }

    /// Translates `fd` into a held handle that is open and grants `access`.
    pub fn get(&self, fd: Fd, access: HandleFlags) -> VfsResult<HandleGuard<'_>> {
        let handle = self.slot(fd)?;
        let state = handle.hold();
        let guard = HandleGuard { table: self, fd };
        if !state.is_open() {
            return Err(VfsError::BadHandle);
        }
        if !state.flags.contains(access) {
            return Err(VfsError::AccessDenied);
        }
        Ok(guard)
    }

    /// Clears the open bit of `fd` and returns the handle still held, so the
    /// caller can run the backend close. The slot is freed once the last
    /// holder lets go.
    pub fn close_flags(&self, fd: Fd) -> VfsResult<HandleGuard<'_>> {
        let handle = self.slot(fd)?;
        handle.hold();
        let guard = HandleGuard { table: self, fd };
        let previous = handle.clear_flags(HandleFlags::OPEN);
        if !previous.contains(HandleFlags::OPEN) {
            return Err(VfsError::BadHandle);
        }
        Ok(guard)
    }

    pub fn state(&self, fd: Fd) -> Option<HandleState> {
        self.handles.get(fd).map(Handle::state)
    }

    /// Returns whether `fd` sits on the free list.
    pub fn is_free(&self, fd: Fd) -> bool {
        self.free.lock().contains(&fd)
    }

    pub fn count_free(&self) -> usize {
        self.free.lock().len()
    }

    pub fn count_open(&self) -> usize {
        self.handles.iter().filter(|it| it.is_open()).count()
    }
}

/// A held reference to a handle. Dropping it releases the reference.
pub struct HandleGuard<'a> {
    table: &'a HandleTable,
    fd: Fd,
}

impl HandleGuard<'_> {
    pub fn fd(&self) -> Fd {
        self.fd
    }
}

impl Deref for HandleGuard<'_> {
    type Target = Handle;

    fn deref(&self) -> &Handle {
        &self.table.handles[self.fd]
    }
}

impl Drop for HandleGuard<'_> {
    fn drop(&mut self) {
        self.table.drop_ref(self.fd);
    }
}
