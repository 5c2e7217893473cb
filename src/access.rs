use crate::{Credentials, NodePermission};

bitflags::bitflags! {
    /// Requested access, in the bit layout of the "other" permission triple.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct Permissions: u16 {
        const READ = 0o4;
        const WRITE = 0o2;
        const EXEC = 0o1;

        const RWX = Self::READ.bits() | Self::WRITE.bits() | Self::EXEC.bits();
    }
}

const OWNER_SHIFT: u16 = 6;
const GROUP_SHIFT: u16 = 3;
const OTHER_SHIFT: u16 = 0;

/// Checks whether `creds` may access a node with the given mode and owner.
///
/// The effective UID selects the owner triple when it is 0 or matches
/// `file_uid`. Otherwise the group triple applies when the effective GID is 0,
/// matches `file_gid`, or `file_gid` is one of the supplementary groups.
/// Everybody else is checked against the "other" triple. Note that UID 0 is
/// not exempt: root is tested against the owner bits.
pub fn check_access(
    requested: Permissions,
    mode: NodePermission,
    file_uid: u32,
    file_gid: u32,
    creds: &Credentials,
) -> bool {
    let requested = requested & Permissions::RWX;
    let shift = if creds.euid == 0 || creds.euid == file_uid {
        OWNER_SHIFT
    } else if creds.egid == 0 || creds.egid == file_gid || creds.in_group(file_gid) {
        GROUP_SHIFT
    } else {
        OTHER_SHIFT
    };
    let wanted = requested.bits() << shift;
    mode.bits() & wanted == wanted
}
