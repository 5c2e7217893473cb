//! In-memory filesystem used by the integration tests.
#![allow(dead_code)]

use std::{
    any::Any,
    collections::BTreeMap,
    sync::{
        Arc, Mutex, Weak,
        atomic::{AtomicU64, AtomicUsize, Ordering},
    },
};

use rtvfs::{
    EvalContext, EvalFlags, EvalStatus, FilesystemOps, GenericEval, Handle, Location, Metadata,
    MountEntry, NodeOps, NodePermission, NodeRef, NodeType, Permissions, UserEnv, Vfs, VfsConfig,
    VfsError, VfsResult, eval_path_generic,
};

pub fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

static NEXT_INODE: AtomicU64 = AtomicU64::new(1);

enum MemKind {
    Dir {
        children: Mutex<BTreeMap<String, Arc<MemNode>>>,
        /// Instance mounted on this directory.
        covered_by: Mutex<Option<Weak<MountEntry>>>,
    },
    File(Mutex<Vec<u8>>),
    Symlink(String),
}

/// Permission bits and ownership of a node.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Owner {
    pub mode: NodePermission,
    pub uid: u32,
    pub gid: u32,
}

pub struct MemNode {
    inode: u64,
    owner: Mutex<Owner>,
    parent: Mutex<Weak<MemNode>>,
    kind: MemKind,
}

impl MemNode {
    fn new(kind: MemKind, mode: NodePermission, uid: u32, gid: u32) -> Arc<Self> {
        Arc::new(Self {
            inode: NEXT_INODE.fetch_add(1, Ordering::Relaxed),
            owner: Mutex::new(Owner { mode, uid, gid }),
            parent: Mutex::new(Weak::new()),
            kind,
        })
    }

    fn new_dir(mode: NodePermission, uid: u32, gid: u32) -> Arc<Self> {
        Self::new(
            MemKind::Dir {
                children: Mutex::new(BTreeMap::new()),
                covered_by: Mutex::new(None),
            },
            mode,
            uid,
            gid,
        )
    }

    fn children(&self) -> VfsResult<&Mutex<BTreeMap<String, Arc<MemNode>>>> {
        match &self.kind {
            MemKind::Dir { children, .. } => Ok(children),
            _ => Err(VfsError::NotADirectory),
        }
    }

    fn insert(self: &Arc<Self>, name: &str, node: Arc<MemNode>) -> VfsResult<Arc<MemNode>> {
        let mut children = self.children()?.lock().unwrap();
        if children.contains_key(name) {
            return Err(VfsError::Exists);
        }
        *node.parent.lock().unwrap() = Arc::downgrade(self);
        children.insert(name.to_owned(), node.clone());
        Ok(node)
    }

    pub fn lookup(&self, name: &str) -> Option<Arc<MemNode>> {
        self.children().ok()?.lock().unwrap().get(name).cloned()
    }

    pub fn owner(&self) -> Owner {
        *self.owner.lock().unwrap()
    }

    pub fn parent(&self) -> Option<Arc<MemNode>> {
        self.parent.lock().unwrap().upgrade()
    }

    pub fn add_dir(self: &Arc<Self>, name: &str) -> Arc<MemNode> {
        self.add_dir_with_mode(name, NodePermission::from_bits_truncate(0o755))
    }

    pub fn add_dir_with_mode(self: &Arc<Self>, name: &str, mode: NodePermission) -> Arc<MemNode> {
        self.insert(name, MemNode::new_dir(mode, 0, 0))
            .expect("Failed to add directory")
    }

    pub fn add_file(self: &Arc<Self>, name: &str, content: &[u8]) -> Arc<MemNode> {
        self.add_file_with_owner(name, content, NodePermission::from_bits_truncate(0o644), 0, 0)
    }

    pub fn add_file_with_owner(
        self: &Arc<Self>,
        name: &str,
        content: &[u8],
        mode: NodePermission,
        uid: u32,
        gid: u32,
    ) -> Arc<MemNode> {
        let node = MemNode::new(MemKind::File(Mutex::new(content.to_vec())), mode, uid, gid);
        self.insert(name, node).expect("Failed to add file")
    }

    pub fn add_symlink(self: &Arc<Self>, name: &str, target: &str) -> Arc<MemNode> {
        let node = MemNode::new(
            MemKind::Symlink(target.to_owned()),
            NodePermission::from_bits_truncate(0o777),
            0,
            0,
        );
        self.insert(name, node).expect("Failed to add symlink")
    }

    pub fn content(&self) -> Vec<u8> {
        match &self.kind {
            MemKind::File(data) => data.lock().unwrap().clone(),
            _ => Vec::new(),
        }
    }

    fn covered_by(&self) -> Option<Arc<MountEntry>> {
        match &self.kind {
            MemKind::Dir { covered_by, .. } => covered_by.lock().unwrap().as_ref()?.upgrade(),
            _ => None,
        }
    }
}

impl std::fmt::Debug for MemNode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemNode")
            .field("inode", &self.inode)
            .field("type", &self.node_type())
            .finish()
    }
}

impl NodeOps for MemNode {
    fn node_type(&self) -> NodeType {
        match &self.kind {
            MemKind::Dir { .. } => NodeType::Directory,
            MemKind::File(_) => NodeType::RegularFile,
            MemKind::Symlink(_) => NodeType::Symlink,
        }
    }

    fn fstat(&self) -> VfsResult<Metadata> {
        let size = match &self.kind {
            MemKind::Dir { children, .. } => children.lock().unwrap().len() as u64,
            MemKind::File(data) => data.lock().unwrap().len() as u64,
            MemKind::Symlink(target) => target.len() as u64,
        };
        let owner = self.owner();
        Ok(Metadata {
            inode: self.inode,
            nlink: 1,
            mode: owner.mode,
            node_type: self.node_type(),
            uid: owner.uid,
            gid: owner.gid,
            size,
        })
    }

    fn read(&self, _handle: &Handle, buf: &mut [u8], offset: u64) -> VfsResult<usize> {
        let MemKind::File(data) = &self.kind else {
            return Err(VfsError::IsADirectory);
        };
        let data = data.lock().unwrap();
        let start = (offset as usize).min(data.len());
        let len = buf.len().min(data.len() - start);
        buf[..len].copy_from_slice(&data[start..start + len]);
        Ok(len)
    }

    fn write(&self, _handle: &Handle, buf: &[u8], offset: u64) -> VfsResult<usize> {
        let MemKind::File(data) = &self.kind else {
            return Err(VfsError::IsADirectory);
        };
        let mut data = data.lock().unwrap();
        let end = offset as usize + buf.len();
        if data.len() < end {
            data.resize(end, 0);
        }
        data[offset as usize..end].copy_from_slice(buf);
        Ok(buf.len())
    }

    fn into_any(self: Arc<Self>) -> Arc<dyn Any + Send + Sync> {
        self
    }
}

/// Counters of the calls the core made into one instance.
#[derive(Default)]
pub struct Stats {
    pub lock_depth: AtomicUsize,
    pub locks: AtomicUsize,
    pub clones: AtomicUsize,
    pub frees: AtomicUsize,
    pub unmounted: AtomicUsize,
}

pub struct MemFs {
    root: Arc<MemNode>,
    pub stats: Stats,
}

impl MemFs {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            root: MemNode::new_dir(NodePermission::from_bits_truncate(0o755), 0, 0),
            stats: Stats::default(),
        })
    }

    pub fn root(&self) -> &Arc<MemNode> {
        &self.root
    }

    pub fn lock_depth(&self) -> usize {
        self.stats.lock_depth.load(Ordering::SeqCst)
    }
}

impl GenericEval for MemFs {
    fn is_directory(&self, ctx: &EvalContext<'_>) -> bool {
        ctx.currentloc().node_type() == NodeType::Directory
    }

    fn eval_token(&self, ctx: &mut EvalContext<'_>, token: &str) -> EvalStatus {
        let dir = match ctx.currentloc().downcast::<MemNode>() {
            Ok(dir) => dir,
            Err(err) => {
                ctx.error(err);
                return EvalStatus::Done;
            }
        };
        let owner = dir.owner();
        if !ctx.check_access(Permissions::EXEC, owner.mode, owner.uid, owner.gid) {
            return EvalStatus::Done;
        }
        let entry = match token {
            "." => Some(dir.clone()),
            ".." => Some(dir.parent().unwrap_or_else(|| dir.clone())),
            name => dir.lookup(name),
        };
        let Some(entry) = entry else {
            return EvalStatus::NoEntry;
        };

        ctx.clear_token();
        let terminal = !ctx.has_path();
        let follow = ctx.flags().contains(EvalFlags::FOLLOW_SYM_LINK);
        match &entry.kind {
            MemKind::Symlink(target) if !terminal || follow => {
                ctx.eval_recursive(target);
                EvalStatus::Done
            }
            _ => {
                if let Some(mounted) = entry.covered_by() {
                    let owner = entry.owner();
                    if ctx.check_access(Permissions::EXEC, owner.mode, owner.uid, owner.gid) {
                        ctx.restart(mounted.root_slot());
                    }
                    return EvalStatus::Done;
                }
                ctx.set_current_node(entry);
                if terminal {
                    EvalStatus::Done
                } else {
                    EvalStatus::Continue
                }
            }
        }
    }
}

impl FilesystemOps for MemFs {
    fn name(&self) -> &str {
        "memfs"
    }

    fn root_node(&self) -> VfsResult<NodeRef> {
        Ok(self.root.clone())
    }

    fn lock(&self) {
        self.stats.lock_depth.fetch_add(1, Ordering::SeqCst);
        self.stats.locks.fetch_add(1, Ordering::SeqCst);
    }

    fn unlock(&self) {
        self.stats.lock_depth.fetch_sub(1, Ordering::SeqCst);
    }

    fn eval_path(&self, ctx: &mut EvalContext<'_>) {
        eval_path_generic(ctx, self);
    }

    fn clone_node(&self, _loc: &Location) -> VfsResult<()> {
        self.stats.clones.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn free_node(&self, _loc: &Location) {
        self.stats.frees.fetch_add(1, Ordering::SeqCst);
    }

    fn mknod(
        &self,
        parent: &Location,
        name: &str,
        node_type: NodeType,
        mode: NodePermission,
        uid: u32,
        gid: u32,
    ) -> VfsResult<()> {
        let dir = parent.downcast::<MemNode>()?;
        let node = match node_type {
            NodeType::Directory => MemNode::new_dir(mode, uid, gid),
            NodeType::RegularFile => {
                MemNode::new(MemKind::File(Mutex::new(Vec::new())), mode, uid, gid)
            }
            _ => return Err(VfsError::InvalidArgument),
        };
        dir.insert(name, node).map(|_| ())
    }

    fn fchmod(&self, loc: &Location, mode: NodePermission) -> VfsResult<()> {
        loc.downcast::<MemNode>()?.owner.lock().unwrap().mode = mode;
        Ok(())
    }

    fn chown(&self, loc: &Location, uid: u32, gid: u32) -> VfsResult<()> {
        let node = loc.downcast::<MemNode>()?;
        let mut owner = node.owner.lock().unwrap();
        owner.uid = uid;
        owner.gid = gid;
        Ok(())
    }

    fn mount(&self, mount_point: &Location, entry: &Arc<MountEntry>) -> VfsResult<()> {
        let dir = mount_point.downcast::<MemNode>()?;
        let MemKind::Dir { covered_by, .. } = &dir.kind else {
            return Err(VfsError::NotADirectory);
        };
        let mut covered_by = covered_by.lock().unwrap();
        if covered_by.as_ref().is_some_and(|it| it.strong_count() > 0) {
            return Err(VfsError::Busy);
        }
        *covered_by = Some(Arc::downgrade(entry));
        Ok(())
    }

    fn unmount(&self, entry: &MountEntry) -> VfsResult<()> {
        fn uncover(dir: &MemNode, entry: &MountEntry) -> bool {
            let MemKind::Dir {
                children,
                covered_by,
            } = &dir.kind
            else {
                return false;
            };
            {
                let mut covered_by = covered_by.lock().unwrap();
                if covered_by
                    .as_ref()
                    .is_some_and(|it| std::ptr::eq(it.as_ptr(), entry))
                {
                    *covered_by = None;
                    return true;
                }
            }
            let children: Vec<_> = children.lock().unwrap().values().cloned().collect();
            children.iter().any(|child| uncover(child, entry))
        }
        if uncover(&self.root, entry) {
            Ok(())
        } else {
            Err(VfsError::InvalidArgument)
        }
    }

    fn unmounted(&self, _entry: &MountEntry) {
        self.stats.unmounted.fetch_add(1, Ordering::SeqCst);
    }
}

/// A fresh core with `fs` mounted as root filesystem.
pub fn setup(fs: &Arc<MemFs>) -> (Vfs, UserEnv) {
    init_logging();
    let vfs = Vfs::new(VfsConfig::default());
    let env = UserEnv::default();
    vfs.mount(&env, None, fs.clone(), Default::default())
        .expect("Failed to mount root filesystem");
    (vfs, env)
}

/// The node a location designates, as a memfs node.
pub fn mem_node(loc: &Location) -> Arc<MemNode> {
    loc.downcast::<MemNode>().expect("Location is not a memfs node")
}
