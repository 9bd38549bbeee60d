use super::fs_daemon::FsCacheFs;
use cache_store::{BlockCache, CacheMaintainer};
use fscache_lib::CacheConfig;
use fuser::FileType;
use remote_client::MemRemoteStore;
use std::sync::Arc;
use tempfile::TempDir;
use tokio::runtime::{Handle, Runtime};

fn create_test_daemon() -> (FsCacheFs, Arc<MemRemoteStore>, Handle, TempDir) {
    let tmp = TempDir::new().expect("create temp dir");
    let runtime = Runtime::new().expect("create runtime");
    let handle = runtime.handle().clone();

    let mut config = CacheConfig::new(tmp.path().join("cache"), "http://r".to_string());
    config.part_bytes = 64 * 1024;
    config.block_bytes = 4 * 1024;
    config.capacity_bytes = 1024 * 1024;

    let remote = Arc::new(MemRemoteStore::new());
    let engine = Arc::new(BlockCache::open(config, remote.clone()).expect("open engine"));
    let maintainer = CacheMaintainer::new(engine.clone());
    (
        FsCacheFs::new(runtime, engine, maintainer),
        remote,
        handle,
        tmp,
    )
}

#[test]
fn test_mkdir_and_lookup() {
    let (daemon, _remote, _handle, _tmp) = create_test_daemon();
    let attr = daemon.mkdir_path(1, "alpha").expect("mkdir alpha");
    assert_eq!(attr.kind, FileType::Directory);
    let (_ino, lookup_attr) = daemon.lookup_entry(1, "alpha").expect("lookup alpha");
    assert_eq!(lookup_attr.kind, FileType::Directory);
}

#[test]
fn test_create_write_read_file() {
    let (daemon, _remote, _handle, _tmp) = create_test_daemon();
    let attr = daemon.create_file(1, "file.txt").expect("create file");
    assert_eq!(attr.kind, FileType::RegularFile);
    assert_eq!(attr.size, 0);

    daemon.write_path(attr.ino, 0, b"hello").expect("write");
    let data = daemon.read_path(attr.ino, 0, 5).expect("read");
    assert_eq!(data, b"hello");

    let updated = daemon.getattr_entry(attr.ino).expect("getattr");
    assert_eq!(updated.size, 5);
}

#[test]
fn test_lookup_remote_file() {
    let (daemon, remote, handle, _tmp) = create_test_daemon();
    handle.block_on(remote.insert_object("/remote.bin", vec![9u8; 4096]));

    let (ino, attr) = daemon.lookup_entry(1, "remote.bin").expect("lookup");
    assert_eq!(attr.size, 4096);
    let data = daemon.read_path(ino, 0, 4096).expect("read");
    assert_eq!(data, vec![9u8; 4096]);
}

#[test]
fn test_rename_file_and_noreplace() {
    let (daemon, _remote, _handle, _tmp) = create_test_daemon();
    let attr = daemon.create_file(1, "old.txt").expect("create old");
    daemon.write_path(attr.ino, 0, b"x").expect("write");

    daemon
        .rename_path(1, "old.txt", 1, "new.txt", 0)
        .expect("rename");
    assert!(daemon.lookup_entry(1, "old.txt").is_err());
    assert!(daemon.lookup_entry(1, "new.txt").is_ok());

    let other = daemon.create_file(1, "other.txt").expect("create other");
    daemon.write_path(other.ino, 0, b"y").expect("write other");
    let err = daemon
        .rename_path(1, "other.txt", 1, "new.txt", libc::RENAME_NOREPLACE)
        .expect_err("noreplace must refuse");
    assert_eq!(err, libc::EEXIST);
}

#[test]
fn test_unlink_file() {
    let (daemon, _remote, _handle, _tmp) = create_test_daemon();
    let attr = daemon.create_file(1, "delete.txt").expect("create delete");
    daemon.write_path(attr.ino, 0, b"bye").expect("write");
    daemon.unlink_path(1, "delete.txt").expect("unlink");
    assert!(daemon.lookup_entry(1, "delete.txt").is_err());
}

#[test]
fn test_readdir_contains_entries() {
    let (daemon, _remote, _handle, _tmp) = create_test_daemon();
    daemon.mkdir_path(1, "dir").expect("mkdir dir");
    daemon.create_file(1, "file").expect("create file");

    let entries = daemon.readdir_entries(1, 0).expect("readdir");
    let names: Vec<String> = entries.into_iter().map(|e| e.2).collect();
    assert!(names.contains(&".".to_string()));
    assert!(names.contains(&"..".to_string()));
    assert!(names.contains(&"dir".to_string()));
    assert!(names.contains(&"file".to_string()));
}

#[test]
fn test_truncate_via_setattr_path() {
    let (daemon, _remote, _handle, _tmp) = create_test_daemon();
    let attr = daemon.create_file(1, "t.txt").expect("create");
    daemon.write_path(attr.ino, 0, b"0123456789").expect("write");

    let truncated = daemon.truncate_path(attr.ino, 4).expect("truncate");
    assert_eq!(truncated.size, 4);
    let data = daemon.read_path(attr.ino, 0, 16).expect("read");
    assert_eq!(data, b"0123");
}

#[test]
fn test_fsync_pushes_to_remote() {
    let (daemon, remote, handle, _tmp) = create_test_daemon();
    let attr = daemon.create_file(1, "sync.txt").expect("create");
    daemon.write_path(attr.ino, 0, b"durable").expect("write");
    assert_eq!(remote.put_count(), 0);

    daemon.sync_path(attr.ino).expect("fsync");
    assert!(remote.put_count() > 0);
    let pushed = handle
        .block_on(remote.object_data("/sync.txt"))
        .expect("remote object");
    assert_eq!(pushed, b"durable");
}

#[test]
fn test_statfs_reflects_capacity() {
    let (daemon, _remote, _handle, _tmp) = create_test_daemon();
    let (blocks, free_blocks, bsize) = daemon.statfs_info();
    assert_eq!(bsize, 4096);
    assert_eq!(blocks, 1024 * 1024 / 4096);
    assert!(free_blocks <= blocks);
}
