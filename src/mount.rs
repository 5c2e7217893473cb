use core::sync::atomic::{AtomicBool, Ordering};

use alloc::{
    string::{String, ToString},
    sync::{Arc, Weak},
    vec::Vec,
};
use hashbrown::HashSet;
use log::debug;
use spin::Mutex;

use crate::{
    EvalContext, EvalFlags, FilesystemOps, GlobalRef, GlobalSlot, Location, MountOptions, UserEnv,
    Vfs, VfsError, VfsResult, null::NULL_FILESYSTEM,
};

/// Key of one live location in the chain of its mount entry.
pub(crate) type MemberKey = u64;

#[derive(Default)]
struct LocationChain {
    members: HashSet<MemberKey>,
    next_key: MemberKey,
}

/// Bookkeeping of one mounted filesystem instance.
pub struct MountEntry {
    ops: Arc<dyn FilesystemOps>,
    device: u64,
    target: String,
    options: MountOptions,
    /// Locations currently alive in this instance.
    chain: Mutex<LocationChain>,
    /// Root of the instance.
    root: GlobalSlot,
    /// Covered directory in the parent instance. Empty for the root instance.
    mount_point: GlobalSlot,
    mounted: AtomicBool,
    unmounted: AtomicBool,
}

impl MountEntry {
    fn new(
        ops: Arc<dyn FilesystemOps>,
        device: u64,
        target: &str,
        options: MountOptions,
    ) -> VfsResult<Arc<Self>> {
        let node = ops.root_node()?;
        let entry = Arc::new(Self {
            ops,
            device,
            target: target.to_string(),
            options,
            chain: Mutex::default(),
            root: GlobalSlot::empty(),
            mount_point: GlobalSlot::empty(),
            mounted: AtomicBool::new(true),
            unmounted: AtomicBool::new(false),
        });
        let root = Location::new(entry.clone(), node);
        entry.root.replace(Some(GlobalRef::new(root)));
        Ok(entry)
    }

    /// The mount entry of the null location. It is never unmounted.
    pub(crate) fn null(ops: Arc<dyn FilesystemOps>, options: MountOptions) -> Arc<Self> {
        Arc::new(Self {
            ops,
            device: 0,
            target: String::new(),
            options,
            chain: Mutex::default(),
            root: GlobalSlot::empty(),
            mount_point: GlobalSlot::empty(),
            mounted: AtomicBool::new(true),
            unmounted: AtomicBool::new(false),
        })
    }

    pub fn ops(&self) -> &Arc<dyn FilesystemOps> {
        &self.ops
    }

    pub fn device(&self) -> u64 {
        self.device
    }

    /// Path the instance was mounted on.
    pub fn target(&self) -> &str {
        &self.target
    }

    pub fn options(&self) -> MountOptions {
        self.options
    }

    pub fn is_writeable(&self) -> bool {
        !self.options.read_only
    }

    pub fn is_mounted(&self) -> bool {
        self.mounted.load(Ordering::Acquire)
    }

    /// Returns whether the instance has been torn down.
    pub fn is_unmounted(&self) -> bool {
        self.unmounted.load(Ordering::Acquire)
    }

    pub fn root_slot(&self) -> &GlobalSlot {
        &self.root
    }

    pub fn mount_point_slot(&self) -> &GlobalSlot {
        &self.mount_point
    }

    pub fn has_mount_point(&self) -> bool {
        !self.mount_point.is_empty()
    }

    /// Number of locations currently alive in this instance.
    pub fn location_count(&self) -> usize {
        self.chain.lock().members.len()
    }

    pub(crate) fn add_location(&self) -> MemberKey {
        let mut chain = self.chain.lock();
        let key = chain.next_key;
        chain.next_key += 1;
        chain.members.insert(key);
        key
    }

    pub(crate) fn remove_location(&self, key: MemberKey) {
        let ready = {
            let mut chain = self.chain.lock();
            chain.members.remove(&key);
            self.ready_locked(&mut chain)
        };
        if ready {
            self.do_unmount();
        }
    }

    /// Tests whether nothing but the root still references the instance.
    ///
    /// Observing readiness empties the chain, so at most one caller sees
    /// `true` until a new location is added.
    pub fn is_ready_for_unmount(&self) -> bool {
        self.ready_locked(&mut self.chain.lock())
    }

    fn ready_locked(&self, chain: &mut LocationChain) -> bool {
        let ready = !self.is_mounted()
            && chain.members.len() == 1
            && self.root.reference_count() == Some(1);
        if ready {
            chain.members.clear();
        }
        ready
    }

    /// Runs `update` and the readiness test inside one chain critical section.
    pub(crate) fn update_then_check_unmount<R>(&self, update: impl FnOnce() -> R) -> (R, bool) {
        let mut chain = self.chain.lock();
        let result = update();
        (result, self.ready_locked(&mut chain))
    }

    pub fn lock_instance(&self) {
        self.ops.lock();
    }

    pub fn unlock_instance(&self) {
        self.ops.unlock();
    }

    /// Returns whether `loc` is the root node of this instance.
    pub(crate) fn is_root_location(&self, loc: &Location) -> bool {
        if !core::ptr::eq(Arc::as_ptr(loc.mount()), self) {
            return false;
        }
        let Some(root) = self.root.peek() else {
            return false;
        };
        root.with_location(|root| self.ops.are_nodes_equal(loc, root))
    }

    /// Operations of the instance this one is mounted on.
    fn parent_ops(&self) -> Arc<dyn FilesystemOps> {
        match self.mount_point.peek() {
            Some(mount_point) => mount_point.with_location(|loc| loc.ops().clone()),
            None => NULL_FILESYSTEM.clone(),
        }
    }

    /// Drops the root and the mount point. The root location holds this
    /// entry, so this is also what lets the entry itself go away.
    fn detach(&self) {
        drop(self.root.take());
        drop(self.mount_point.take());
    }

    pub(crate) fn do_unmount(&self) {
        debug!("tearing down {} instance at {}", self.ops.name(), self.target);
        self.detach();
        self.ops.unmounted(self);
        self.unmounted.store(true, Ordering::Release);
    }

    /// Undoes a mount that failed half way.
    fn abort(&self) {
        self.mounted.store(false, Ordering::Release);
        self.do_unmount();
    }
}

impl Vfs {
    /// Mounts a filesystem instance.
    ///
    /// With `target` set to `None` the instance becomes the root filesystem
    /// and the root and current directory of `env` are moved onto it.
    pub fn mount(
        &self,
        env: &UserEnv,
        target: Option<&str>,
        fs: Arc<dyn FilesystemOps>,
        options: MountOptions,
    ) -> VfsResult<Arc<MountEntry>> {
        let entry = MountEntry::new(fs, self.next_device(), target.unwrap_or("/"), options)?;
        let result = match target {
            None => self.register_root(env, &entry),
            Some(target) => self.register_subordinate(env, &entry, target),
        };
        if let Err(err) = result {
            entry.abort();
            return Err(err);
        }
        debug!(
            "mounted {} at {} (device {})",
            entry.ops.name(),
            entry.target,
            entry.device
        );
        Ok(entry)
    }

    fn register_root(&self, env: &UserEnv, entry: &Arc<MountEntry>) -> VfsResult<()> {
        {
            let mut mounts = self.mounts.lock();
            mounts.retain(|it| it.upgrade().is_some_and(|it| !it.is_unmounted()));
            if !mounts.is_empty() {
                return Err(VfsError::InvalidArgument);
            }
            mounts.push(Arc::downgrade(entry));
        }
        self.assign(env.root_slot(), self.obtain(entry.root_slot()));
        self.assign(env.current_slot(), self.obtain(entry.root_slot()));
        Ok(())
    }

    fn register_subordinate(
        &self,
        env: &UserEnv,
        entry: &Arc<MountEntry>,
        target: &str,
    ) -> VfsResult<()> {
        let flags = EvalFlags::PERMS_RWX | EvalFlags::FOLLOW_LINK;
        let mut ctx = EvalContext::start(self, env, target, flags);
        ctx.status()?;
        if ctx.currentloc().is_instance_root() {
            return Err(VfsError::Busy);
        }
        let mount_point = ctx.extract_currentloc();
        mount_point.ops().mount(&mount_point, entry)?;
        entry.mount_point.replace(Some(GlobalRef::new(mount_point)));
        drop(ctx);
        self.mounts.lock().push(Arc::downgrade(entry));
        Ok(())
    }

    /// Unmounts the instance whose root `path` resolves to.
    ///
    /// This does not wait: the instance is torn down as soon as the last
    /// location in it goes away, which may already happen before this
    /// returns. Use [`MountEntry::is_unmounted`] to observe completion.
    pub fn unmount(&self, env: &UserEnv, path: &str) -> VfsResult<()> {
        let ctx = EvalContext::start(self, env, path, EvalFlags::FOLLOW_LINK);
        ctx.status()?;
        let loc = ctx.currentloc();
        if !loc.is_instance_root() {
            return Err(VfsError::AccessDenied);
        }
        if contains_root_or_current(env, loc) {
            return Err(VfsError::Busy);
        }
        let entry = loc.mount().clone();
        entry.parent_ops().unmount(&entry)?;
        entry.mounted.store(false, Ordering::Release);
        debug!("unmounting {} at {}", entry.ops.name(), entry.target);
        drop(ctx);
        Ok(())
    }

    /// Lists the instances that are still mounted.
    pub fn mounts(&self) -> Vec<Arc<MountEntry>> {
        self.mounts
            .lock()
            .iter()
            .filter_map(Weak::upgrade)
            .filter(|it| it.is_mounted())
            .collect()
    }

    /// Breaks the self reference of every instance still mounted.
    pub(crate) fn detach_mounts(&self) {
        let mounts: Vec<_> = self.mounts.lock().drain(..).collect();
        for entry in mounts.iter().filter_map(Weak::upgrade) {
            entry.detach();
        }
    }
}

/// Whether the root or current directory of `env` lies in the instance of
/// `root`.
fn contains_root_or_current(env: &UserEnv, root: &Location) -> bool {
    [env.root_slot(), env.current_slot()].into_iter().any(|slot| {
        slot.peek().is_some_and(|global| {
            global.with_location(|loc| loc.exists_in_same_instance_as(root).is_ok())
        })
    })
}
