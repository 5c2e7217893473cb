use smallvec::SmallVec;

use crate::GlobalSlot;

/// Supplementary groups kept inline before spilling to the heap.
const INLINE_GROUPS: usize = 8;

/// Effective identity of a caller, used by the access check.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Credentials {
    pub uid: u32,
    pub gid: u32,
    pub euid: u32,
    pub egid: u32,
    pub groups: SmallVec<[u32; INLINE_GROUPS]>,
}

impl Credentials {
    pub fn new(uid: u32, gid: u32) -> Self {
        Self {
            uid,
            gid,
            euid: uid,
            egid: gid,
            groups: SmallVec::new(),
        }
    }

    pub fn root() -> Self {
        Self::new(0, 0)
    }

    pub fn with_groups(mut self, groups: impl IntoIterator<Item = u32>) -> Self {
        self.groups.extend(groups);
        self
    }

    pub fn in_group(&self, gid: u32) -> bool {
        self.groups.contains(&gid)
    }
}

impl Default for Credentials {
    fn default() -> Self {
        Self::root()
    }
}

/// Per-task filesystem environment.
///
/// Holds the root and current directory every relative or absolute path
/// evaluation anchors on. Both slots start out empty, which resolves to the
/// null location until a root filesystem is mounted.
pub struct UserEnv {
    root: GlobalSlot,
    current: GlobalSlot,
    credentials: Credentials,
}

impl UserEnv {
    pub fn new(credentials: Credentials) -> Self {
        Self {
            root: GlobalSlot::empty(),
            current: GlobalSlot::empty(),
            credentials,
        }
    }

    pub fn root_slot(&self) -> &GlobalSlot {
        &self.root
    }

    pub fn current_slot(&self) -> &GlobalSlot {
        &self.current
    }

    pub fn credentials(&self) -> &Credentials {
        &self.credentials
    }

    pub fn set_credentials(&mut self, credentials: Credentials) {
        self.credentials = credentials;
    }
}

impl Default for UserEnv {
    fn default() -> Self {
        Self::new(Credentials::root())
    }
}
