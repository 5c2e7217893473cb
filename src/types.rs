/// Type of a node, encoded like the file-type field of a mode word.
#[repr(u16)]
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum NodeType {
    /// What the null location reports.
    Unknown = 0,
    Fifo = 0o010000,
    CharacterDevice = 0o020000,
    Directory = 0o040000,
    BlockDevice = 0o060000,
    RegularFile = 0o100000,
    Symlink = 0o120000,
    Socket = 0o140000,
}

impl NodeType {
    const MASK: u32 = 0o170000;

    /// Extracts the node type from a full mode word.
    pub fn from_mode(mode: u32) -> Self {
        match mode & Self::MASK {
            0o010000 => Self::Fifo,
            0o020000 => Self::CharacterDevice,
            0o040000 => Self::Directory,
            0o060000 => Self::BlockDevice,
            0o100000 => Self::RegularFile,
            0o120000 => Self::Symlink,
            0o140000 => Self::Socket,
            _ => Self::Unknown,
        }
    }

    pub fn is_directory(self) -> bool {
        self == Self::Directory
    }
}

bitflags::bitflags! {
    /// Permission bits of a node: owner, group and other triples.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct NodePermission: u16 {
        const OWNER_READ = 0o400;
        const OWNER_WRITE = 0o200;
        const OWNER_EXEC = 0o100;
        const GROUP_READ = 0o40;
        const GROUP_WRITE = 0o20;
        const GROUP_EXEC = 0o10;
        const OTHER_READ = 0o4;
        const OTHER_WRITE = 0o2;
        const OTHER_EXEC = 0o1;
    }
}

impl Default for NodePermission {
    /// `rw-rw-rw-`, before any creation mask.
    fn default() -> Self {
        Self::from_bits_truncate(0o666)
    }
}

/// Filesystem node metadata, as reported by `fstat`.
#[derive(Clone, Debug)]
pub struct Metadata {
    pub inode: u64,
    pub nlink: u64,
    pub mode: NodePermission,
    pub node_type: NodeType,
    /// Owner, checked by the access check together with `gid`.
    pub uid: u32,
    pub gid: u32,
    /// Size in bytes. `Vfs::write` appends here when the handle has
    /// `APPEND` set.
    pub size: u64,
}

bitflags::bitflags! {
    /// Flags accepted by [`Vfs::open`](crate::Vfs::open).
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct OpenFlags: u32 {
        const READ = 1 << 0;
        const WRITE = 1 << 1;
        const APPEND = 1 << 2;
        /// Create a regular file if the final component does not exist.
        const CREATE = 1 << 3;
        /// With `CREATE`, fail if the final component exists.
        const EXCLUSIVE = 1 << 4;
        /// The final component must be a directory.
        const DIRECTORY = 1 << 5;
        /// Do not follow a trailing symbolic link.
        const NO_FOLLOW = 1 << 6;
        const NONBLOCK = 1 << 7;
        const CLOSE_ON_EXEC = 1 << 8;

        const READ_WRITE = Self::READ.bits() | Self::WRITE.bits();
    }
}
