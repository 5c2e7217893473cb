mod common;

use std::thread;

use common::{MemFs, setup};
use rtvfs::{
    HandleFlags, NodePermission, NodeType, OpenFlags, UserEnv, Vfs, VfsConfig, VfsError,
};

fn assert_free_list_invariant(vfs: &Vfs) {
    let table = vfs.handles();
    for fd in 0..table.len() {
        let state = table.state(fd).expect("fd within table");
        assert_eq!(
            table.is_free(fd),
            !state.is_open() && state.references == 0,
            "fd {fd}: {state:?}"
        );
    }
}

fn mode() -> NodePermission {
    NodePermission::from_bits_truncate(0o644)
}

#[test]
fn open_read_close() {
    let fs = MemFs::new();
    fs.root().add_file("f", b"hello");
    let (vfs, env) = setup(&fs);

    let fd = vfs
        .open(&env, "/f", OpenFlags::READ, mode())
        .expect("Failed to open /f");
    assert_free_list_invariant(&vfs);

    let mut buf = [0u8; 8];
    assert_eq!(vfs.read(fd, &mut buf), Ok(5));
    assert_eq!(&buf[..5], b"hello");
    assert_eq!(vfs.read(fd, &mut buf), Ok(0));
    assert_eq!(vfs.fstat(fd).map(|it| it.size), Ok(5));

    vfs.close(fd).expect("Failed to close");
    assert_eq!(vfs.fstat(fd).unwrap_err(), VfsError::BadHandle);
    assert_eq!(vfs.handles().count_open(), 0);
    assert_free_list_invariant(&vfs);
}

#[test]
fn write_and_append() {
    let fs = MemFs::new();
    let file = fs.root().add_file("f", b"0123");
    let (vfs, env) = setup(&fs);

    let fd = vfs
        .open(&env, "f", OpenFlags::WRITE, mode())
        .expect("Failed to open for writing");
    assert_eq!(vfs.write(fd, b"ab"), Ok(2));
    assert_eq!(file.content(), b"ab23");
    vfs.close(fd).expect("Failed to close");

    let fd = vfs
        .open(&env, "f", OpenFlags::WRITE | OpenFlags::APPEND, mode())
        .expect("Failed to open for appending");
    assert_eq!(vfs.write(fd, b"xy"), Ok(2));
    assert_eq!(file.content(), b"ab23xy");
    vfs.close(fd).expect("Failed to close");
}

#[test]
fn create() {
    let fs = MemFs::new();
    fs.root().add_dir("dir");
    let (vfs, env) = setup(&fs);

    let fd = vfs
        .open(&env, "/dir/new", OpenFlags::READ_WRITE | OpenFlags::CREATE, mode())
        .expect("Failed to create");
    assert_eq!(vfs.write(fd, b"abc"), Ok(3));
    vfs.close(fd).expect("Failed to close");
    let created = fs
        .root()
        .lookup("dir")
        .and_then(|dir| dir.lookup("new"))
        .expect("File was not created");
    assert_eq!(created.content(), b"abc");

    // Existing file, plain create just opens it.
    let fd = vfs
        .open(&env, "/dir/new", OpenFlags::READ | OpenFlags::CREATE, mode())
        .expect("Failed to reopen");
    vfs.close(fd).expect("Failed to close");

    assert_eq!(
        vfs.open(
            &env,
            "/dir/new",
            OpenFlags::READ | OpenFlags::CREATE | OpenFlags::EXCLUSIVE,
            mode()
        )
        .unwrap_err(),
        VfsError::Exists
    );
    assert_eq!(
        vfs.open(&env, "/nodir/new", OpenFlags::WRITE | OpenFlags::CREATE, mode())
            .unwrap_err(),
        VfsError::NoEntry
    );
    assert_eq!(vfs.handles().count_free(), vfs.handles().len());
    assert_free_list_invariant(&vfs);
}

#[test]
fn type_checks_on_open() {
    let fs = MemFs::new();
    fs.root().add_dir("dir");
    fs.root().add_file("file", b"");
    fs.root().add_symlink("link", "file");
    let (vfs, env) = setup(&fs);

    assert_eq!(
        vfs.open(&env, "dir", OpenFlags::WRITE, mode()).unwrap_err(),
        VfsError::IsADirectory
    );
    assert_eq!(
        vfs.open(&env, "file", OpenFlags::READ | OpenFlags::DIRECTORY, mode())
            .unwrap_err(),
        VfsError::NotADirectory
    );
    let fd = vfs
        .open(&env, "dir", OpenFlags::READ | OpenFlags::DIRECTORY, mode())
        .expect("Failed to open directory");
    vfs.close(fd).expect("Failed to close");

    let fd = vfs
        .open(&env, "link", OpenFlags::NO_FOLLOW, mode())
        .expect("Failed to open the link itself");
    assert_eq!(vfs.fstat(fd).map(|it| it.node_type), Ok(NodeType::Symlink));
    vfs.close(fd).expect("Failed to close");

    assert_eq!(
        vfs.open(&env, "missing", OpenFlags::READ, mode()).unwrap_err(),
        VfsError::NoEntry
    );
    assert_eq!(vfs.handles().count_free(), vfs.handles().len());
}

#[test]
fn permission_checked_on_open() {
    let fs = MemFs::new();
    fs.root()
        .add_file_with_owner("f", b"", NodePermission::from_bits_truncate(0o444), 10, 10);
    let (vfs, env) = setup(&fs);
    let user = vfs.derive_env(&env, rtvfs::Credentials::new(10, 10));

    assert_eq!(
        vfs.open(&user, "/f", OpenFlags::WRITE, mode()).unwrap_err(),
        VfsError::AccessDenied
    );
    let fd = vfs
        .open(&user, "/f", OpenFlags::READ, mode())
        .expect("Failed to open for reading");
    vfs.close(fd).expect("Failed to close");
}

#[test]
fn fd_past_the_end() {
    let fs = MemFs::new();
    let (vfs, _env) = setup(&fs);
    let table = vfs.handles();

    assert_eq!(
        vfs.handle_from_fd(table.len(), HandleFlags::empty()).err(),
        Some(VfsError::BadHandle)
    );
    for fd in 0..table.len() {
        assert_eq!(table.state(fd).map(|it| it.references), Some(0));
    }
    assert_eq!(vfs.close(table.len()).unwrap_err(), VfsError::BadHandle);
}

#[test]
fn access_flags_of_the_handle() {
    let fs = MemFs::new();
    fs.root().add_file("f", b"data");
    let (vfs, env) = setup(&fs);

    let fd = vfs
        .open(&env, "f", OpenFlags::READ, mode())
        .expect("Failed to open");
    assert_eq!(
        vfs.handle_from_fd(fd, HandleFlags::WRITE).err(),
        Some(VfsError::AccessDenied)
    );
    assert_eq!(vfs.write(fd, b"x").unwrap_err(), VfsError::AccessDenied);
    assert_eq!(vfs.handles().state(fd).map(|it| it.references), Some(0));
    vfs.close(fd).expect("Failed to close");
    assert_eq!(vfs.close(fd).unwrap_err(), VfsError::BadHandle);
    assert_free_list_invariant(&vfs);
}

#[test]
fn close_while_held() {
    let fs = MemFs::new();
    fs.root().add_file("f", b"data");
    let (vfs, env) = setup(&fs);
    let entry = vfs.mounts().pop().expect("No root instance");
    let baseline = entry.location_count();

    let fd = vfs
        .open(&env, "f", OpenFlags::READ, mode())
        .expect("Failed to open");
    let held = vfs
        .handle_from_fd(fd, HandleFlags::READ)
        .expect("Failed to hold");
    vfs.close(fd).expect("Failed to close");

    assert!(!vfs.handles().is_free(fd));
    assert_eq!(vfs.read(fd, &mut [0; 4]).unwrap_err(), VfsError::BadHandle);
    assert_eq!(held.location().node_type(), NodeType::RegularFile);
    assert_eq!(entry.location_count(), baseline + 1);
    assert_free_list_invariant(&vfs);

    drop(held);
    assert!(vfs.handles().is_free(fd));
    assert_eq!(entry.location_count(), baseline);
    assert_free_list_invariant(&vfs);
}

#[test]
fn table_exhaustion() {
    common::init_logging();
    let fs = MemFs::new();
    fs.root().add_file("f", b"");
    let vfs = Vfs::new(VfsConfig { max_handles: 2 });
    let env = UserEnv::default();
    vfs.mount(&env, None, fs.clone(), Default::default())
        .expect("Failed to mount root filesystem");

    let a = vfs.open(&env, "f", OpenFlags::READ, mode()).expect("first");
    let b = vfs.open(&env, "f", OpenFlags::READ, mode()).expect("second");
    assert_ne!(a, b);
    assert_eq!(
        vfs.open(&env, "f", OpenFlags::READ, mode()).unwrap_err(),
        VfsError::NoHandlesAvailable
    );
    vfs.close(a).expect("Failed to close");
    let c = vfs.open(&env, "f", OpenFlags::READ, mode()).expect("third");
    assert_eq!(c, a);
    assert_free_list_invariant(&vfs);
}

#[test]
fn close_races_with_holders() {
    let fs = MemFs::new();
    fs.root().add_file("f", b"data");
    let (vfs, env) = setup(&fs);
    let entry = vfs.mounts().pop().expect("No root instance");
    let baseline = entry.location_count();

    for _ in 0..32 {
        let fd = vfs
            .open(&env, "/f", OpenFlags::READ, mode())
            .expect("Failed to open /f");
        thread::scope(|s| {
            for _ in 0..4 {
                s.spawn(|| {
                    for _ in 0..200 {
                        match vfs.handle_from_fd(fd, HandleFlags::READ) {
                            Ok(handle) => assert_eq!(handle.fd(), fd),
                            Err(err) => assert_eq!(err, VfsError::BadHandle),
                        }
                    }
                });
            }
            s.spawn(|| vfs.close(fd).expect("Failed to close"));
        });
        assert!(vfs.handles().is_free(fd));
        assert_eq!(vfs.handles().state(fd).map(|it| it.references), Some(0));
        assert_free_list_invariant(&vfs);
        assert_eq!(entry.location_count(), baseline);
    }
    assert_eq!(vfs.handles().count_free(), vfs.handles().len());
}

#[test]
fn concurrent_open_and_close() {
    let fs = MemFs::new();
    fs.root().add_file("f", b"data");
    let (vfs, env) = setup(&fs);
    let entry = vfs.mounts().pop().expect("No root instance");
    let baseline = entry.location_count();

    thread::scope(|s| {
        for _ in 0..4 {
            s.spawn(|| {
                let mut buf = [0u8; 4];
                for _ in 0..100 {
                    let fd = vfs
                        .open(&env, "/f", OpenFlags::READ, mode())
                        .expect("Failed to open /f");
                    assert_eq!(vfs.read(fd, &mut buf), Ok(4));
                    vfs.close(fd).expect("Failed to close");
                }
            });
        }
    });
    assert_eq!(vfs.handles().count_free(), vfs.handles().len());
    assert_free_list_invariant(&vfs);
    assert_eq!(entry.location_count(), baseline);
    assert_eq!(fs.lock_depth(), 0);
}
