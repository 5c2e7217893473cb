use core::sync::atomic::{AtomicU64, Ordering};

use alloc::{string::String, sync::Weak, vec::Vec};
use spin::Mutex;

use crate::{
    Credentials, EvalContext, EvalFlags, Fd, GlobalRef, GlobalSlot, HandleFlags, HandleGuard,
    HandleTable, Location, Metadata, MountEntry, NodePermission, NodeType, OpenFlags, UserEnv,
    VfsError, VfsResult, location::DeferredReleases,
};

/// Configuration consumed by [`Vfs::new`].
#[derive(Debug, Clone, Copy)]
pub struct VfsConfig {
    /// Number of slots of the handle table.
    pub max_handles: usize,
}

impl Default for VfsConfig {
    fn default() -> Self {
        Self { max_handles: 64 }
    }
}

/// Process-wide state of the virtual filesystem: the handle table, the
/// mounted instances and the deferred-release queue.
pub struct Vfs {
    handles: HandleTable,
    pub(crate) mounts: Mutex<Vec<Weak<MountEntry>>>,
    deferred: DeferredReleases,
    next_device: AtomicU64,
}

impl Vfs {
    pub fn new(config: VfsConfig) -> Self {
        Self {
            handles: HandleTable::new(config.max_handles),
            mounts: Mutex::new(Vec::new()),
            deferred: DeferredReleases::new(),
            next_device: AtomicU64::new(1),
        }
    }

    pub fn handles(&self) -> &HandleTable {
        &self.handles
    }

    pub(crate) fn next_device(&self) -> u64 {
        self.next_device.fetch_add(1, Ordering::Relaxed)
    }

    /// Creates an environment that starts out in the root and current
    /// directory of `env`.
    pub fn derive_env(&self, env: &UserEnv, credentials: Credentials) -> UserEnv {
        let derived = UserEnv::new(credentials);
        self.assign(derived.root_slot(), self.obtain(env.root_slot()));
        self.assign(derived.current_slot(), self.obtain(env.current_slot()));
        derived
    }

    /// Takes a reference on the global location held by `slot`.
    ///
    /// Deferred releases are completed first. An empty slot yields the null
    /// location.
    pub fn obtain(&self, slot: &GlobalSlot) -> GlobalRef {
        self.deferred.drain();
        slot.get()
    }

    pub fn obtain_null(&self) -> GlobalRef {
        self.deferred.drain();
        GlobalRef::null()
    }

    /// Releases `global`.
    ///
    /// With `deferred` set, the caller may not block: if this was the last
    /// reference, the teardown is postponed to the next [`Vfs::obtain`].
    pub fn release(&self, global: GlobalRef, deferred: bool) {
        if deferred {
            self.deferred.defer(global);
        } else {
            drop(global);
        }
    }

    /// Stores `global` in `slot` and releases what the slot held before.
    pub fn assign(&self, slot: &GlobalSlot, global: GlobalRef) {
        let old = slot.replace(Some(global));
        drop(old);
    }

    /// Wraps `location` into a global location with a single reference.
    pub fn transform_to_global(&self, location: Location) -> GlobalRef {
        GlobalRef::new(location)
    }

    /// Number of global locations waiting for their deferred teardown.
    pub fn pending_releases(&self) -> usize {
        self.deferred.pending()
    }

    /// Resolves `path` into a location.
    ///
    /// With [`EvalFlags::MAKE`], a missing final component yields its parent
    /// directory.
    pub fn resolve(&self, env: &UserEnv, path: &str, flags: EvalFlags) -> VfsResult<Location> {
        EvalContext::start(self, env, path, flags).finish()
    }

    /// Resolves `path` and its parent directory. Returns `(parent, node)`.
    pub fn resolve_with_parent(
        &self,
        env: &UserEnv,
        path: &str,
        flags: EvalFlags,
        parent_flags: EvalFlags,
    ) -> VfsResult<(Location, Location)> {
        let (ctx, parent) = EvalContext::start_with_parent(self, env, path, flags, parent_flags);
        let location = ctx.finish()?;
        Ok((parent, location))
    }

    pub fn open(
        &self,
        env: &UserEnv,
        path: &str,
        flags: OpenFlags,
        mode: NodePermission,
    ) -> VfsResult<Fd> {
        let handle = self.handles.allocate()?;
        let read_access = flags.contains(OpenFlags::READ);
        let write_access = flags.contains(OpenFlags::WRITE);

        let mut eval_flags = EvalFlags::FOLLOW_LINK;
        eval_flags.set(EvalFlags::PERMS_READ, read_access);
        eval_flags.set(EvalFlags::PERMS_WRITE, write_access);
        eval_flags.set(EvalFlags::MAKE, flags.contains(OpenFlags::CREATE));
        eval_flags.set(EvalFlags::EXCLUSIVE, flags.contains(OpenFlags::EXCLUSIVE));
        if flags.contains(OpenFlags::NO_FOLLOW) {
            eval_flags.remove(EvalFlags::FOLLOW_SYM_LINK);
        }

        let mut ctx = EvalContext::start(self, env, path, eval_flags);
        if ctx.has_token() {
            create_regular_file(&mut ctx, mode);
        }
        if write_access || flags.contains(OpenFlags::DIRECTORY) {
            let is_directory = ctx.currentloc().is_directory();
            if write_access && is_directory {
                ctx.error(VfsError::IsADirectory);
            }
            if flags.contains(OpenFlags::DIRECTORY) && !is_directory {
                ctx.error(VfsError::NotADirectory);
            }
        }
        ctx.status()?;
        let location = ctx.extract_currentloc();
        drop(ctx);

        handle.bind(location);
        handle.set_flags(HandleFlags::from(flags));
        handle.node().open(&handle, flags)?;
        handle.set_flags(HandleFlags::OPEN);
        Ok(handle.fd())
    }

    /// Translates `fd` into a held handle granting `access`.
    pub fn handle_from_fd(&self, fd: Fd, access: HandleFlags) -> VfsResult<HandleGuard<'_>> {
        self.handles.get(fd, access)
    }

    pub fn close(&self, fd: Fd) -> VfsResult<()> {
        let handle = self.handles.close_flags(fd)?;
        handle.node().close(&handle)
    }

    pub fn read(&self, fd: Fd, buf: &mut [u8]) -> VfsResult<usize> {
        let handle = self.handles.get(fd, HandleFlags::READ)?;
        let read = handle.node().read(&handle, buf, handle.offset())?;
        handle.advance(read);
        Ok(read)
    }

    pub fn write(&self, fd: Fd, buf: &[u8]) -> VfsResult<usize> {
        let handle = self.handles.get(fd, HandleFlags::WRITE)?;
        let node = handle.node();
        if handle.flags().contains(HandleFlags::APPEND) {
            handle.set_offset(node.fstat()?.size);
        }
        let written = node.write(&handle, buf, handle.offset())?;
        handle.advance(written);
        Ok(written)
    }

    pub fn fstat(&self, fd: Fd) -> VfsResult<Metadata> {
        let handle = self.handles.get(fd, HandleFlags::empty())?;
        handle.node().fstat()
    }

    pub fn ioctl(&self, fd: Fd, request: u32, arg: usize) -> VfsResult<usize> {
        let handle = self.handles.get(fd, HandleFlags::empty())?;
        handle.node().ioctl(&handle, request, arg)
    }

    /// Creates a node of `node_type` at `path`.
    pub fn mknod(
        &self,
        env: &UserEnv,
        path: &str,
        node_type: NodeType,
        mode: NodePermission,
    ) -> VfsResult<()> {
        let mut eval_flags = EvalFlags::FOLLOW_LINK | EvalFlags::MAKE | EvalFlags::EXCLUSIVE;
        if node_type == NodeType::Directory {
            eval_flags |= EvalFlags::ACCEPT_RESIDUAL_DELIMITERS;
        }
        let ctx = EvalContext::start(self, env, path, eval_flags);
        ctx.status()?;
        let parent = ctx.currentloc();
        let creds = ctx.credentials();
        parent
            .ops()
            .mknod(parent, ctx.token(), node_type, mode, creds.euid, creds.egid)
    }

    pub fn mkdir(&self, env: &UserEnv, path: &str, mode: NodePermission) -> VfsResult<()> {
        self.mknod(env, path, NodeType::Directory, mode)
    }

    /// Replaces the permission bits of the node `path` resolves to.
    ///
    /// Only the owner of the node or the superuser may do this.
    pub fn chmod(&self, env: &UserEnv, path: &str, mode: NodePermission) -> VfsResult<()> {
        let location = self.resolve_owned(env, path, EvalFlags::FOLLOW_LINK)?;
        location.ops().fchmod(&location, mode)
    }

    /// Changes the owner and group of the node `path` resolves to.
    ///
    /// Only the owner of the node or the superuser may do this. `path` is
    /// followed if it is a symbolic link unless `follow` is false.
    pub fn chown(
        &self,
        env: &UserEnv,
        path: &str,
        uid: u32,
        gid: u32,
        follow: bool,
    ) -> VfsResult<()> {
        let flags = if follow {
            EvalFlags::FOLLOW_LINK
        } else {
            EvalFlags::empty()
        };
        let location = self.resolve_owned(env, path, flags)?;
        location.ops().chown(&location, uid, gid)
    }

    /// Resolves `path` to a node of a writeable instance that the effective
    /// user of `env` owns.
    fn resolve_owned(&self, env: &UserEnv, path: &str, flags: EvalFlags) -> VfsResult<Location> {
        let location = self.resolve(env, path, flags)?;
        if !location.mount().is_writeable() {
            return Err(VfsError::ReadOnly);
        }
        let euid = env.credentials().euid;
        if euid != 0 && euid != location.fstat()?.uid {
            return Err(VfsError::NotPermitted);
        }
        Ok(location)
    }

    /// Changes the current directory of `env`.
    pub fn chdir(&self, env: &UserEnv, path: &str) -> VfsResult<()> {
        let location = self.resolve_directory(env, path)?;
        self.assign(env.current_slot(), self.transform_to_global(location));
        Ok(())
    }

    /// Changes the root directory of `env`. `..` never leaves it again.
    pub fn chroot(&self, env: &UserEnv, path: &str) -> VfsResult<()> {
        let location = self.resolve_directory(env, path)?;
        self.assign(env.root_slot(), self.transform_to_global(location));
        Ok(())
    }

    fn resolve_directory(&self, env: &UserEnv, path: &str) -> VfsResult<Location> {
        let flags = EvalFlags::PERMS_EXEC | EvalFlags::FOLLOW_LINK | EvalFlags::DIRECTORY;
        self.resolve(env, path, flags)
    }
}

fn create_regular_file(ctx: &mut EvalContext<'_>, mode: NodePermission) {
    let name = String::from(ctx.token());
    let result = {
        let parent = ctx.currentloc();
        let creds = ctx.credentials();
        parent
            .ops()
            .mknod(parent, &name, NodeType::RegularFile, mode, creds.euid, creds.egid)
    };
    match result {
        Ok(()) => {
            ctx.set_flags(EvalFlags::empty());
            ctx.clear_token();
            ctx.set_path(&name);
            ctx.continue_eval();
        }
        Err(err) => ctx.error(err),
    }
}

impl Drop for Vfs {
    fn drop(&mut self) {
        self.deferred.drain();
        self.detach_mounts();
    }
}
