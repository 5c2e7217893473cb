//! Path evaluation.
//!
//! An [`EvalContext`] walks a path one token at a time. The walking itself is
//! done by the filesystem instance owning the current location through
//! [`FilesystemOps::eval_path`], which for most backends is
//! [`eval_path_generic`]. The context carries the state shared by all of
//! them: the remaining path, the last token, the current location and the
//! root and start locations it may re-anchor on.

mod generic;

use core::{mem, ops::Range};

use alloc::sync::Arc;
use log::trace;

pub use self::generic::*;
use crate::{
    Credentials, GlobalRef, GlobalSlot, Location, NodePermission, NodeRef, Permissions, UserEnv,
    Vfs, VfsError, VfsResult, check_access,
};

/// Maximum number of symbolic link substitutions in one resolution.
pub const SYMLOOP_MAX: u32 = 32;

bitflags::bitflags! {
    /// Flags controlling a path evaluation.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct EvalFlags: u32 {
        const PERMS_READ = 0x4;
        const PERMS_WRITE = 0x2;
        const PERMS_EXEC = 0x1;
        const PERMS_RWX = Self::PERMS_READ.bits() | Self::PERMS_WRITE.bits() | Self::PERMS_EXEC.bits();

        const FOLLOW_HARD_LINK = 0x8;
        const FOLLOW_SYM_LINK = 0x10;
        const FOLLOW_LINK = Self::FOLLOW_HARD_LINK.bits() | Self::FOLLOW_SYM_LINK.bits();

        /// The final component may be missing; it is left as the token.
        const MAKE = 0x20;
        /// The final component must be missing.
        const EXCLUSIVE = 0x40;
        /// A missing final component may be followed by delimiters.
        const ACCEPT_RESIDUAL_DELIMITERS = 0x80;
        /// A terminal `.` is an error.
        const REJECT_TERMINAL_DOT = 0x100;
        /// The result must be a directory.
        const DIRECTORY = 0x200;
    }
}

impl EvalFlags {
    /// Access the evaluation requests on the final node.
    pub fn permissions(self) -> Permissions {
        Permissions::from_bits_truncate((self & Self::PERMS_RWX).bits() as u16)
    }
}

pub fn is_delimiter(c: u8) -> bool {
    c == b'/' || c == b'\\'
}

pub fn is_current_directory(token: &str) -> bool {
    token == "."
}

pub fn is_parent_directory(token: &str) -> bool {
    token == ".."
}

/// State of one path resolution.
///
/// Dropping the context unlocks the start instance and releases every
/// location it still holds.
pub struct EvalContext<'a> {
    vfs: &'a Vfs,
    env: &'a UserEnv,
    buf: Arc<str>,
    /// Remaining path: `buf[path..pathend]`.
    path: usize,
    pathend: usize,
    token_buf: Arc<str>,
    token: Range<usize>,
    flags: EvalFlags,
    links_followed: u32,
    currentloc: Location,
    startloc: GlobalRef,
    rootloc: GlobalRef,
    error: Option<VfsError>,
}

impl<'a> EvalContext<'a> {
    fn new(vfs: &'a Vfs, env: &'a UserEnv, buf: Arc<str>, flags: EvalFlags) -> Self {
        let pathend = buf.len();
        Self {
            vfs,
            env,
            token_buf: buf.clone(),
            buf,
            path: 0,
            pathend,
            token: 0..0,
            flags,
            links_followed: 0,
            currentloc: Location::null(),
            startloc: GlobalRef::null(),
            rootloc: GlobalRef::null(),
            error: None,
        }
    }

    /// Starts evaluating `path` relative to the root or current directory of
    /// `env` and runs it to completion.
    pub fn start(vfs: &'a Vfs, env: &'a UserEnv, path: &str, flags: EvalFlags) -> Self {
        let mut ctx = Self::new(vfs, env, Arc::from(path), flags);
        ctx.begin();
        ctx.continue_eval();
        ctx
    }

    /// Evaluates the parent directory of `path` with `parent_flags`, then
    /// continues with the final component and `flags`.
    ///
    /// Returns the context together with a clone of the parent location.
    pub fn start_with_parent(
        vfs: &'a Vfs,
        env: &'a UserEnv,
        path: &str,
        flags: EvalFlags,
        parent_flags: EvalFlags,
    ) -> (Self, Location) {
        let bytes = path.as_bytes();
        let mut name_start = bytes.len();
        while name_start > 0 && !is_delimiter(bytes[name_start - 1]) {
            name_start -= 1;
        }
        let parent = if name_start == 0 { "." } else { &path[..name_start] };

        let mut ctx = Self::new(vfs, env, Arc::from(parent), parent_flags);
        ctx.begin();
        ctx.continue_eval();
        let parentloc = ctx.currentloc.clone();
        ctx.set_path(&path[name_start..]);
        ctx.flags = flags;
        ctx.continue_eval();
        (ctx, parentloc)
    }

    fn begin(&mut self) {
        if self.has_path() {
            self.rootloc = self.vfs.obtain(self.env.root_slot());
            if is_delimiter(self.buf.as_bytes()[self.path]) {
                self.path += 1;
                self.startloc = self.rootloc.clone();
            } else {
                self.startloc = self.vfs.obtain(self.env.current_slot());
            }
        } else {
            self.error = Some(VfsError::NoEntry);
        }
        self.startloc.mount().lock_instance();
        self.currentloc = self.startloc.clone_location();
    }

    /// Runs the backends until the path is consumed, then applies the
    /// checks on the final component.
    pub fn continue_eval(&mut self) {
        while self.has_path() {
            let ops = self.currentloc.ops().clone();
            ops.eval_path(self);
        }

        let flags = self.flags;
        if self.has_token() {
            if flags.contains(EvalFlags::MAKE) {
                self.check_final_access(EvalFlags::PERMS_WRITE);
            } else {
                self.error(VfsError::NoEntry);
            }
        } else if flags.contains(EvalFlags::EXCLUSIVE) {
            self.error(VfsError::Exists);
        } else if flags.contains(EvalFlags::DIRECTORY)
            && !self.currentloc.is_null()
            && !self.currentloc.is_directory()
        {
            self.error(VfsError::NotADirectory);
        } else {
            self.check_final_access(flags);
        }
    }

    fn check_final_access(&mut self, flags: EvalFlags) {
        if flags.contains(EvalFlags::PERMS_WRITE) && !self.currentloc.mount().is_writeable() {
            self.error(VfsError::ReadOnly);
            return;
        }
        match self.currentloc.fstat() {
            Ok(metadata) => {
                self.check_access(
                    flags.permissions(),
                    metadata.mode,
                    metadata.uid,
                    metadata.gid,
                );
            }
            Err(err) => self.error(err),
        }
    }

    pub fn vfs(&self) -> &'a Vfs {
        self.vfs
    }

    pub fn credentials(&self) -> &Credentials {
        self.env.credentials()
    }

    /// The unconsumed part of the path.
    pub fn path(&self) -> &str {
        &self.buf[self.path..self.pathend]
    }

    pub fn has_path(&self) -> bool {
        self.path < self.pathend
    }

    pub fn clear_path(&mut self) {
        self.path = self.pathend;
    }

    /// Replaces the remaining path.
    pub fn set_path(&mut self, path: &str) {
        self.buf = Arc::from(path);
        self.path = 0;
        self.pathend = self.buf.len();
    }

    pub fn token(&self) -> &str {
        &self.token_buf[self.token.clone()]
    }

    /// The buffer and range of the current token, for use while the context
    /// is borrowed mutably.
    pub fn token_source(&self) -> (Arc<str>, Range<usize>) {
        (self.token_buf.clone(), self.token.clone())
    }

    pub fn has_token(&self) -> bool {
        !self.token.is_empty()
    }

    pub fn clear_token(&mut self) {
        self.token = 0..0;
    }

    /// Skips consecutive delimiters.
    pub fn eat_delimiter(&mut self) {
        let bytes = self.buf.as_bytes();
        while self.path < self.pathend && is_delimiter(bytes[self.path]) {
            self.path += 1;
        }
    }

    /// Skips delimiters and takes the following run of non-delimiters as the
    /// token. The token is empty at the end of the path.
    pub fn next_token(&mut self) {
        self.eat_delimiter();
        let bytes = self.buf.as_bytes();
        let begin = self.path;
        while self.path < self.pathend && !is_delimiter(bytes[self.path]) {
            self.path += 1;
        }
        self.token_buf = self.buf.clone();
        self.token = begin..self.path;
    }

    /// Undoes the last [`next_token`](Self::next_token).
    pub fn put_back_token(&mut self) {
        if Arc::ptr_eq(&self.token_buf, &self.buf) && self.token.end == self.path {
            self.path = self.token.start;
        }
        self.clear_token();
    }

    pub fn flags(&self) -> EvalFlags {
        self.flags
    }

    pub fn set_flags(&mut self, flags: EvalFlags) {
        self.flags = flags;
    }

    pub fn currentloc(&self) -> &Location {
        &self.currentloc
    }

    /// Moves the current location to another node of the same instance.
    pub fn set_current_node(&mut self, node: NodeRef) {
        self.currentloc.set_node(node);
    }

    pub fn rootloc(&self) -> &GlobalRef {
        &self.rootloc
    }

    pub fn startloc(&self) -> &GlobalRef {
        &self.startloc
    }

    pub fn links_followed(&self) -> u32 {
        self.links_followed
    }

    /// Returns whether the current location is the root the evaluation is
    /// confined to.
    pub fn is_eval_root(&self) -> bool {
        let currentloc = &self.currentloc;
        !currentloc.is_null()
            && self.rootloc.with_location(|root| {
                currentloc.same_instance_as(root) && currentloc.ops().are_nodes_equal(currentloc, root)
            })
    }

    /// Re-anchors the evaluation on the location held by `slot`, keeping the
    /// remaining path.
    pub fn restart(&mut self, slot: &GlobalSlot) {
        let newstart = self.vfs.obtain(slot);
        self.restart_at(newstart);
    }

    fn restart_at(&mut self, newstart: GlobalRef) {
        trace!("restarting evaluation at {:?}", newstart);
        self.currentloc.detach();
        self.startloc.mount().unlock_instance();
        self.startloc = newstart;
        self.startloc.mount().lock_instance();
        self.currentloc = self.startloc.clone_location();
    }

    /// Substitutes a symbolic link target and evaluates it in place.
    ///
    /// Each substitution counts against [`SYMLOOP_MAX`] for the whole
    /// resolution. An absolute target restarts at the root.
    pub fn eval_recursive(&mut self, target: &str) {
        if target.is_empty() {
            self.error(VfsError::NoEntry);
            return;
        }
        if self.links_followed >= SYMLOOP_MAX {
            self.error(VfsError::TooManySymbolicLinks);
            return;
        }
        self.links_followed += 1;
        trace!("following symbolic link to {target}");

        let saved_buf = mem::replace(&mut self.buf, Arc::from(target));
        let saved_path = mem::replace(&mut self.path, 0);
        let saved_pathend = mem::replace(&mut self.pathend, target.len());

        if is_delimiter(target.as_bytes()[0]) {
            let root = self.rootloc.clone();
            self.restart_at(root);
        }
        while self.has_path() {
            let ops = self.currentloc.ops().clone();
            ops.eval_path(self);
        }
        let unresolved = self.has_token();

        self.buf = saved_buf;
        self.path = saved_path;
        self.pathend = saved_pathend;

        // A missing link target may only stand for the last component.
        if unresolved && self.has_path() {
            self.eat_delimiter();
            if !self.flags.contains(EvalFlags::ACCEPT_RESIDUAL_DELIMITERS) || self.has_path() {
                self.error(VfsError::NoEntry);
            }
        }
    }

    /// Ends the evaluation with `err`.
    ///
    /// The error is only recorded while the current location is not null, so
    /// the first error of a resolution is the one reported.
    pub fn error(&mut self, err: VfsError) {
        self.clear_path();
        self.clear_token();
        if !self.currentloc.is_null() {
            self.error = Some(err);
            self.currentloc.detach();
        }
    }

    /// Checks `requested` access against a node's mode and owner, recording
    /// [`VfsError::AccessDenied`] on failure.
    pub fn check_access(
        &mut self,
        requested: Permissions,
        mode: NodePermission,
        uid: u32,
        gid: u32,
    ) -> bool {
        let granted = check_access(requested, mode, uid, gid, self.credentials());
        if !granted {
            self.error(VfsError::AccessDenied);
        }
        granted
    }

    /// Outcome of the evaluation so far.
    pub fn status(&self) -> VfsResult<()> {
        match self.error {
            Some(err) => Err(err),
            None if self.currentloc.is_null() => Err(VfsError::NoDevice),
            None => Ok(()),
        }
    }

    /// Moves the current location out, leaving the null location behind.
    pub fn extract_currentloc(&mut self) -> Location {
        self.currentloc.take()
    }

    /// Consumes the context, yielding the resolved location.
    pub fn finish(mut self) -> VfsResult<Location> {
        self.status()?;
        Ok(self.extract_currentloc())
    }
}

impl Drop for EvalContext<'_> {
    fn drop(&mut self) {
        self.currentloc.detach();
        self.startloc.mount().unlock_instance();
    }
}
