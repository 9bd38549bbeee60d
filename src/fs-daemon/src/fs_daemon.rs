use cache_store::{BlockCache, CacheMaintainer, CacheMetadata};
use fscache_lib::{CacheConfig, CacheError};
use fuser::{
    FileAttr, FileType, Filesystem, MountOption, ReplyAttr, ReplyCreate, ReplyData,
    ReplyDirectory, ReplyEmpty, ReplyEntry, ReplyOpen, ReplyWrite, Request,
};
use libc::{EACCES, EAGAIN, EEXIST, EINVAL, EIO, EISDIR, ENOENT, ENOSPC, ENOSYS, ENOTDIR, ENOTEMPTY};
use log::{info, warn};
use remote_client::HttpRemoteStore;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tokio::runtime::Runtime;

const TTL: Duration = Duration::from_secs(1);
pub const DEFAULT_CONFIG_PATH: &str = "/etc/fscache/fscache.json";

#[derive(Debug, Clone)]
pub struct RunOptions {
    pub mountpoint: PathBuf,
    pub config_path: PathBuf,
}

fn map_cache_err(err: CacheError) -> i32 {
    match err {
        CacheError::NotFound(_) => ENOENT,
        CacheError::AlreadyExists(_) => EEXIST,
        CacheError::NotADirectory(_) => ENOTDIR,
        CacheError::IsADirectory(_) => EISDIR,
        CacheError::NotEmpty(_) => ENOTEMPTY,
        CacheError::NoSpace(_) => ENOSPC,
        CacheError::NotReady(_) => EAGAIN,
        CacheError::PermissionDenied(_) => EACCES,
        CacheError::InvalidParam(_) => EINVAL,
        CacheError::Unsupported(_) => ENOSYS,
        CacheError::RemoteError(_)
        | CacheError::VerifyError(_)
        | CacheError::IoError(_)
        | CacheError::DbError(_)
        | CacheError::InvalidState(_)
        | CacheError::Internal(_) => EIO,
    }
}

struct InodeTable {
    next_inode: AtomicU64,
    inode_to_path: RwLock<HashMap<u64, String>>,
    path_to_inode: RwLock<HashMap<String, u64>>,
}

impl InodeTable {
    fn new() -> Self {
        let mut inode_to_path = HashMap::new();
        let mut path_to_inode = HashMap::new();
        inode_to_path.insert(1, "/".to_string());
        path_to_inode.insert("/".to_string(), 1);
        Self {
            next_inode: AtomicU64::new(2),
            inode_to_path: RwLock::new(inode_to_path),
            path_to_inode: RwLock::new(path_to_inode),
        }
    }

    fn get_path(&self, inode: u64) -> Option<String> {
        self.inode_to_path.read().unwrap().get(&inode).cloned()
    }

    fn get_or_create(&self, path: &str) -> u64 {
        if let Some(inode) = self.path_to_inode.read().unwrap().get(path) {
            return *inode;
        }
        let inode = self.next_inode.fetch_add(1, Ordering::SeqCst);
        self.inode_to_path
            .write()
            .unwrap()
            .insert(inode, path.to_string());
        self.path_to_inode
            .write()
            .unwrap()
            .insert(path.to_string(), inode);
        inode
    }

    fn remove_path_recursive(&self, path: &str) {
        let mut inode_to_path = self.inode_to_path.write().unwrap();
        let mut path_to_inode = self.path_to_inode.write().unwrap();
        let prefix = format!("{}/", path);
        let gone: Vec<String> = path_to_inode
            .keys()
            .filter(|candidate| *candidate == path || candidate.starts_with(&prefix))
            .cloned()
            .collect();
        for removed in gone {
            if let Some(inode) = path_to_inode.remove(&removed) {
                inode_to_path.remove(&inode);
            }
        }
    }

    fn rename_path_recursive(&self, old_path: &str, new_path: &str) {
        let mut inode_to_path = self.inode_to_path.write().unwrap();
        let mut path_to_inode = self.path_to_inode.write().unwrap();

        let old_prefix = format!("{}/", old_path);
        let moved: Vec<(String, u64)> = path_to_inode
            .iter()
            .filter(|(path, _)| *path == old_path || path.starts_with(&old_prefix))
            .map(|(path, inode)| (path.clone(), *inode))
            .collect();

        let new_prefix = format!("{}/", new_path);
        let replaced: Vec<String> = path_to_inode
            .keys()
            .filter(|path| *path == new_path || path.starts_with(&new_prefix))
            .cloned()
            .collect();
        for path in replaced {
            if let Some(inode) = path_to_inode.remove(&path) {
                inode_to_path.remove(&inode);
            }
        }

        for (old, inode) in moved {
            path_to_inode.remove(&old);
            let suffix = old.strip_prefix(old_path).unwrap_or("");
            let renamed = format!("{}{}", new_path, suffix);
            path_to_inode.insert(renamed.clone(), inode);
            inode_to_path.insert(inode, renamed);
        }
    }
}

fn system_time(secs: u64) -> SystemTime {
    UNIX_EPOCH + Duration::from_secs(secs)
}

/// FUSE dispatcher over the cache engine. The fuser callbacks are
/// synchronous; every engine call crosses into the owned tokio runtime
/// with `block_on`, the way a daemon thread pool would.
pub struct FsCacheFs {
    runtime: Runtime,
    engine: Arc<BlockCache>,
    maintainer: Arc<CacheMaintainer>,
    inode_table: InodeTable,
}

impl FsCacheFs {
    pub fn new(runtime: Runtime, engine: Arc<BlockCache>, maintainer: Arc<CacheMaintainer>) -> Self {
        Self {
            runtime,
            engine,
            maintainer,
            inode_table: InodeTable::new(),
        }
    }

    fn path_from_parent(&self, parent: u64, name: &str) -> Option<String> {
        let parent_path = self.inode_table.get_path(parent)?;
        if parent_path == "/" {
            Some(format!("/{}", name))
        } else {
            Some(format!("{}/{}", parent_path, name))
        }
    }

    fn build_attr(&self, inode: u64, meta: &CacheMetadata) -> FileAttr {
        let (kind, perm, nlink) = if meta.is_dir() {
            (FileType::Directory, 0o755, 2)
        } else {
            (FileType::RegularFile, 0o644, 1)
        };
        FileAttr {
            ino: inode,
            size: meta.size,
            blocks: (meta.size + 511) / 512,
            atime: system_time(meta.last_accessed),
            mtime: system_time(meta.timestamp),
            ctime: system_time(meta.timestamp),
            crtime: system_time(meta.timestamp),
            kind,
            perm,
            nlink,
            uid: unsafe { libc::getuid() },
            gid: unsafe { libc::getgid() },
            rdev: 0,
            flags: 0,
            blksize: self.engine.config().block_bytes as u32,
        }
    }

    fn stat_path(&self, path: &str) -> Result<CacheMetadata, i32> {
        self.runtime
            .block_on(self.engine.stat(path))
            .map_err(map_cache_err)
    }

    pub(crate) fn lookup_entry(&self, parent: u64, name: &str) -> Result<(u64, FileAttr), i32> {
        let path = self.path_from_parent(parent, name).ok_or(ENOENT)?;
        let meta = self.stat_path(&path)?;
        let inode = self.inode_table.get_or_create(&path);
        Ok((inode, self.build_attr(inode, &meta)))
    }

    pub(crate) fn getattr_entry(&self, ino: u64) -> Result<FileAttr, i32> {
        let path = self.inode_table.get_path(ino).ok_or(ENOENT)?;
        let meta = self.stat_path(&path)?;
        Ok(self.build_attr(ino, &meta))
    }

    pub(crate) fn mkdir_path(&self, parent: u64, name: &str) -> Result<FileAttr, i32> {
        let path = self.path_from_parent(parent, name).ok_or(ENOENT)?;
        let meta = self
            .runtime
            .block_on(self.engine.mkdir(&path))
            .map_err(map_cache_err)?;
        let inode = self.inode_table.get_or_create(&path);
        Ok(self.build_attr(inode, &meta))
    }

    pub(crate) fn create_file(&self, parent: u64, name: &str) -> Result<FileAttr, i32> {
        let path = self.path_from_parent(parent, name).ok_or(ENOENT)?;
        let meta = self
            .runtime
            .block_on(self.engine.create(&path, false))
            .map_err(map_cache_err)?;
        let inode = self.inode_table.get_or_create(&path);
        Ok(self.build_attr(inode, &meta))
    }

    pub(crate) fn unlink_path(&self, parent: u64, name: &str) -> Result<(), i32> {
        let path = self.path_from_parent(parent, name).ok_or(ENOENT)?;
        self.runtime
            .block_on(self.engine.unlink(&path))
            .map_err(map_cache_err)?;
        self.inode_table.remove_path_recursive(&path);
        Ok(())
    }

    pub(crate) fn rmdir_path(&self, parent: u64, name: &str) -> Result<(), i32> {
        let path = self.path_from_parent(parent, name).ok_or(ENOENT)?;
        self.runtime
            .block_on(self.engine.rmdir(&path))
            .map_err(map_cache_err)?;
        self.inode_table.remove_path_recursive(&path);
        Ok(())
    }

    pub(crate) fn rename_path(
        &self,
        parent: u64,
        name: &str,
        newparent: u64,
        newname: &str,
        flags: u32,
    ) -> Result<(), i32> {
        if flags & libc::RENAME_EXCHANGE != 0 {
            return Err(ENOSYS);
        }
        let no_replace = flags & libc::RENAME_NOREPLACE != 0;
        let old_path = self.path_from_parent(parent, name).ok_or(ENOENT)?;
        let new_path = self.path_from_parent(newparent, newname).ok_or(ENOENT)?;
        self.runtime
            .block_on(self.engine.rename(&old_path, &new_path, no_replace))
            .map_err(map_cache_err)?;
        self.inode_table.rename_path_recursive(&old_path, &new_path);
        Ok(())
    }

    pub(crate) fn read_path(&self, ino: u64, offset: i64, size: u32) -> Result<Vec<u8>, i32> {
        let path = self.inode_table.get_path(ino).ok_or(ENOENT)?;
        self.runtime
            .block_on(self.engine.read(&path, offset.max(0) as u64, size))
            .map_err(map_cache_err)
    }

    pub(crate) fn write_path(&self, ino: u64, offset: i64, data: &[u8]) -> Result<usize, i32> {
        let path = self.inode_table.get_path(ino).ok_or(ENOENT)?;
        self.runtime
            .block_on(self.engine.write(&path, offset.max(0) as u64, data))
            .map_err(map_cache_err)
    }

    pub(crate) fn truncate_path(&self, ino: u64, size: u64) -> Result<FileAttr, i32> {
        let path = self.inode_table.get_path(ino).ok_or(ENOENT)?;
        self.runtime
            .block_on(self.engine.truncate(&path, size))
            .map_err(map_cache_err)?;
        self.getattr_entry(ino)
    }

    /// fsync/flush: push this object's dirty blocks now and wait.
    pub(crate) fn sync_path(&self, ino: u64) -> Result<(), i32> {
        let path = self.inode_table.get_path(ino).ok_or(ENOENT)?;
        self.runtime
            .block_on(self.maintainer.flush_path(&path))
            .map_err(map_cache_err)
    }

    pub(crate) fn readdir_entries(
        &self,
        ino: u64,
        offset: i64,
    ) -> Result<Vec<(u64, FileType, String, i64)>, i32> {
        let path = self.inode_table.get_path(ino).ok_or(ENOENT)?;
        let children = self
            .runtime
            .block_on(self.engine.readdir(&path))
            .map_err(map_cache_err)?;

        let mut out = Vec::new();
        let mut idx: i64 = offset;
        if offset == 0 {
            out.push((ino, FileType::Directory, ".".to_string(), 1));
            out.push((ino, FileType::Directory, "..".to_string(), 2));
            idx = 2;
        }

        for entry in children.into_iter().skip((idx - 2).max(0) as usize) {
            let child_path = if path == "/" {
                format!("/{}", entry.name)
            } else {
                format!("{}/{}", path, entry.name)
            };
            let inode = self.inode_table.get_or_create(&child_path);
            let kind = if entry.is_dir {
                FileType::Directory
            } else {
                FileType::RegularFile
            };
            idx += 1;
            out.push((inode, kind, entry.name, idx));
        }
        Ok(out)
    }

    pub(crate) fn statfs_info(&self) -> (u64, u64, u32) {
        let capacity = self.engine.config().capacity_bytes;
        let bsize = self.engine.config().block_bytes as u32;
        let used = self
            .runtime
            .block_on(self.engine.usage_bytes())
            .unwrap_or(0);
        let blocks = capacity / bsize as u64;
        let free_blocks = capacity.saturating_sub(used) / bsize as u64;
        (blocks, free_blocks, bsize)
    }
}

impl Filesystem for FsCacheFs {
    fn lookup(&mut self, _req: &Request<'_>, parent: u64, name: &std::ffi::OsStr, reply: ReplyEntry) {
        let Some(name) = name.to_str() else {
            reply.error(EINVAL);
            return;
        };
        match self.lookup_entry(parent, name) {
            Ok((_ino, attr)) => reply.entry(&TTL, &attr, 0),
            Err(code) => reply.error(code),
        }
    }

    fn getattr(&mut self, _req: &Request<'_>, ino: u64, reply: ReplyAttr) {
        match self.getattr_entry(ino) {
            Ok(attr) => reply.attr(&TTL, &attr),
            Err(code) => reply.error(code),
        }
    }

    fn setattr(
        &mut self,
        _req: &Request<'_>,
        ino: u64,
        _mode: Option<u32>,
        _uid: Option<u32>,
        _gid: Option<u32>,
        size: Option<u64>,
        _atime: Option<fuser::TimeOrNow>,
        _mtime: Option<fuser::TimeOrNow>,
        _ctime: Option<SystemTime>,
        _fh: Option<u64>,
        _crtime: Option<SystemTime>,
        _chgtime: Option<SystemTime>,
        _bkuptime: Option<SystemTime>,
        _flags: Option<u32>,
        reply: ReplyAttr,
    ) {
        let result = match size {
            Some(new_size) => self.truncate_path(ino, new_size),
            None => self.getattr_entry(ino),
        };
        match result {
            Ok(attr) => reply.attr(&TTL, &attr),
            Err(code) => reply.error(code),
        }
    }

    fn mknod(
        &mut self,
        _req: &Request<'_>,
        parent: u64,
        name: &std::ffi::OsStr,
        _mode: u32,
        _umask: u32,
        _rdev: u32,
        reply: ReplyEntry,
    ) {
        let Some(name) = name.to_str() else {
            reply.error(EINVAL);
            return;
        };
        match self.create_file(parent, name) {
            Ok(attr) => reply.entry(&TTL, &attr, 0),
            Err(code) => reply.error(code),
        }
    }

    fn mkdir(
        &mut self,
        _req: &Request<'_>,
        parent: u64,
        name: &std::ffi::OsStr,
        _mode: u32,
        _umask: u32,
        reply: ReplyEntry,
    ) {
        let Some(name) = name.to_str() else {
            reply.error(EINVAL);
            return;
        };
        match self.mkdir_path(parent, name) {
            Ok(attr) => reply.entry(&TTL, &attr, 0),
            Err(code) => reply.error(code),
        }
    }

    fn unlink(&mut self, _req: &Request<'_>, parent: u64, name: &std::ffi::OsStr, reply: ReplyEmpty) {
        let Some(name) = name.to_str() else {
            reply.error(EINVAL);
            return;
        };
        match self.unlink_path(parent, name) {
            Ok(()) => reply.ok(),
            Err(code) => reply.error(code),
        }
    }

    fn rmdir(&mut self, _req: &Request<'_>, parent: u64, name: &std::ffi::OsStr, reply: ReplyEmpty) {
        let Some(name) = name.to_str() else {
            reply.error(EINVAL);
            return;
        };
        match self.rmdir_path(parent, name) {
            Ok(()) => reply.ok(),
            Err(code) => reply.error(code),
        }
    }

    fn rename(
        &mut self,
        _req: &Request<'_>,
        parent: u64,
        name: &std::ffi::OsStr,
        newparent: u64,
        newname: &std::ffi::OsStr,
        flags: u32,
        reply: ReplyEmpty,
    ) {
        let (Some(name), Some(newname)) = (name.to_str(), newname.to_str()) else {
            reply.error(EINVAL);
            return;
        };
        match self.rename_path(parent, name, newparent, newname, flags) {
            Ok(()) => reply.ok(),
            Err(code) => reply.error(code),
        }
    }

    fn open(&mut self, _req: &Request<'_>, ino: u64, _flags: i32, reply: ReplyOpen) {
        match self.getattr_entry(ino) {
            Ok(_) => reply.opened(0, 0),
            Err(code) => reply.error(code),
        }
    }

    fn create(
        &mut self,
        _req: &Request<'_>,
        parent: u64,
        name: &std::ffi::OsStr,
        _mode: u32,
        _umask: u32,
        _flags: i32,
        reply: ReplyCreate,
    ) {
        let Some(name) = name.to_str() else {
            reply.error(EINVAL);
            return;
        };
        match self.create_file(parent, name) {
            Ok(attr) => reply.created(&TTL, &attr, 0, 0, 0),
            Err(code) => reply.error(code),
        }
    }

    fn read(
        &mut self,
        _req: &Request<'_>,
        ino: u64,
        _fh: u64,
        offset: i64,
        size: u32,
        _flags: i32,
        _lock_owner: Option<u64>,
        reply: ReplyData,
    ) {
        match self.read_path(ino, offset, size) {
            Ok(data) => reply.data(&data),
            Err(code) => reply.error(code),
        }
    }

    fn write(
        &mut self,
        _req: &Request<'_>,
        ino: u64,
        _fh: u64,
        offset: i64,
        data: &[u8],
        _write_flags: u32,
        _flags: i32,
        _lock_owner: Option<u64>,
        reply: ReplyWrite,
    ) {
        match self.write_path(ino, offset, data) {
            Ok(written) => reply.written(written as u32),
            Err(code) => reply.error(code),
        }
    }

    fn flush(&mut self, _req: &Request<'_>, ino: u64, _fh: u64, _lock_owner: u64, reply: ReplyEmpty) {
        match self.sync_path(ino) {
            Ok(()) => reply.ok(),
            Err(code) => reply.error(code),
        }
    }

    fn release(
        &mut self,
        _req: &Request<'_>,
        _ino: u64,
        _fh: u64,
        _flags: i32,
        _lock_owner: Option<u64>,
        _flush: bool,
        reply: ReplyEmpty,
    ) {
        // No forced flush on close; the writeback cycle owns that.
        reply.ok();
    }

    fn fsync(&mut self, _req: &Request<'_>, ino: u64, _fh: u64, _datasync: bool, reply: ReplyEmpty) {
        match self.sync_path(ino) {
            Ok(()) => reply.ok(),
            Err(code) => reply.error(code),
        }
    }

    fn opendir(&mut self, _req: &Request<'_>, ino: u64, _flags: i32, reply: ReplyOpen) {
        match self.getattr_entry(ino) {
            Ok(attr) if attr.kind == FileType::Directory => reply.opened(0, 0),
            Ok(_) => reply.error(ENOTDIR),
            Err(code) => reply.error(code),
        }
    }

    fn readdir(
        &mut self,
        _req: &Request<'_>,
        ino: u64,
        _fh: u64,
        offset: i64,
        mut reply: ReplyDirectory,
    ) {
        match self.readdir_entries(ino, offset) {
            Ok(entries) => {
                for (inode, kind, name, next_offset) in entries {
                    if reply.add(inode, next_offset, kind, name) {
                        break;
                    }
                }
                reply.ok();
            }
            Err(code) => reply.error(code),
        }
    }

    fn releasedir(&mut self, _req: &Request<'_>, _ino: u64, _fh: u64, _flags: i32, reply: ReplyEmpty) {
        reply.ok();
    }

    fn fsyncdir(&mut self, _req: &Request<'_>, _ino: u64, _fh: u64, _datasync: bool, reply: ReplyEmpty) {
        reply.ok();
    }

    fn statfs(&mut self, _req: &Request<'_>, _ino: u64, reply: fuser::ReplyStatfs) {
        let (blocks, free_blocks, bsize) = self.statfs_info();
        reply.statfs(blocks, free_blocks, free_blocks, 0, 0, bsize, 255, bsize);
    }

    fn access(&mut self, _req: &Request<'_>, _ino: u64, _mask: i32, reply: ReplyEmpty) {
        reply.ok();
    }

    fn destroy(&mut self) {
        info!("unmounting, flushing dirty objects");
        self.runtime.block_on(self.maintainer.writeback_tick());
    }
}

fn read_json_config(path: &Path) -> Result<CacheConfig, CacheError> {
    let content = std::fs::read_to_string(path).map_err(|e| {
        warn!("read config {} failed: {}", path.display(), e);
        CacheError::NotFound(format!("config {} not readable: {}", path.display(), e))
    })?;
    serde_json::from_str(&content)
        .map_err(|e| CacheError::InvalidParam(format!("config {} invalid: {}", path.display(), e)))
}

pub fn run_daemon(options: RunOptions) -> Result<(), CacheError> {
    let config = read_json_config(&options.config_path)?;
    let runtime = Runtime::new().map_err(|e| CacheError::Internal(e.to_string()))?;

    let remote = Arc::new(HttpRemoteStore::new(&config.remote_base_url)?);
    let engine = Arc::new(BlockCache::open(config, remote)?);
    let maintainer = CacheMaintainer::new(engine.clone());
    runtime.spawn(maintainer.clone().run());

    std::fs::create_dir_all(&options.mountpoint).map_err(|e| {
        CacheError::IoError(format!(
            "create mountpoint {} failed: {}",
            options.mountpoint.display(),
            e
        ))
    })?;

    let filesystem = FsCacheFs::new(runtime, engine, maintainer);
    let mount_options = vec![
        MountOption::FSName("fscache".to_string()),
        MountOption::DefaultPermissions,
    ];
    #[cfg(not(target_os = "macos"))]
    let mut mount_options = mount_options;
    #[cfg(not(target_os = "macos"))]
    mount_options.push(MountOption::AutoUnmount);

    info!(
        "mounting fscache at {:?}, config={}",
        options.mountpoint,
        options.config_path.display()
    );
    match fuser::spawn_mount2(filesystem, &options.mountpoint, &mount_options) {
        Ok(session) => {
            println!("fscache mounted at {:?}", options.mountpoint);
            session.join();
            Ok(())
        }
        Err(err) => Err(CacheError::IoError(format!("mount failed: {}", err))),
    }
}
