use fs2::FileExt;
use fscache_lib::{path_hash_hex, CacheConfig, CacheError, CacheLayout, CacheResult};
use log::{debug, info, warn};
use remote_client::RemoteStore;
use std::collections::{BTreeSet, VecDeque};
use std::fs::File as StdFile;
use std::os::unix::fs::FileExt as UnixFileExt;
use std::sync::{Arc, Mutex};
use tokio::fs;

use crate::{unix_timestamp, BitmapStore, CacheMetadata, MetaDb};

const LOCK_FILE_NAME: &str = ".lock";

/// Remote mutation recorded by a foreground operation and replayed by the
/// writeback manager, in order, before any data flush.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RemoteOp {
    Create { path: String, directory: bool },
    Rename { old_path: String, new_path: String },
    Delete { path: String },
}

/// One readdir answer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DirEntryInfo {
    pub name: String,
    pub is_dir: bool,
}

fn write_at_all(file: &StdFile, mut offset: u64, mut buf: &[u8]) -> std::io::Result<()> {
    while !buf.is_empty() {
        let n = file.write_at(buf, offset)?;
        if n == 0 {
            return Err(std::io::Error::new(
                std::io::ErrorKind::WriteZero,
                "write_at returned zero",
            ));
        }
        offset += n as u64;
        buf = &buf[n..];
    }
    Ok(())
}

/// Positional read; bytes past EOF come back as zeros.
fn read_at_padded(file: &StdFile, offset: u64, buf: &mut [u8]) -> std::io::Result<()> {
    let mut read_total = 0usize;
    while read_total < buf.len() {
        let n = file.read_at(&mut buf[read_total..], offset + read_total as u64)?;
        if n == 0 {
            break;
        }
        read_total += n;
    }
    for byte in &mut buf[read_total..] {
        *byte = 0;
    }
    Ok(())
}

/// The cache engine: decides when to fetch, materializes parts on demand,
/// absorbs writes locally and tracks them block by block.
///
/// One engine owns one cache root; an exclusive lock file keeps a second
/// process out. Everything durable lives in the metadata DB, the part
/// files and the bitmap files, so dropping the engine and reopening the
/// same root resumes where it left off.
pub struct BlockCache {
    config: CacheConfig,
    layout: CacheLayout,
    db: Arc<MetaDb>,
    bitmaps: Arc<BitmapStore>,
    remote: Arc<dyn RemoteStore>,
    pending_ops: Mutex<VecDeque<RemoteOp>>,
    _root_lock: StdFile,
}

impl BlockCache {
    pub fn open(config: CacheConfig, remote: Arc<dyn RemoteStore>) -> CacheResult<Self> {
        config.validate()?;
        std::fs::create_dir_all(&config.cache_root)
            .map_err(|e| CacheError::IoError(format!("create cache root failed: {}", e)))?;

        let lock_path = config.cache_root.join(LOCK_FILE_NAME);
        let lock_file = StdFile::create(&lock_path)
            .map_err(|e| CacheError::IoError(format!("create lock file failed: {}", e)))?;
        lock_file.try_lock_exclusive().map_err(|e| {
            warn!("cache root {} already locked: {}", config.cache_root.display(), e);
            CacheError::InvalidState(format!(
                "cache root {} is in use by another process",
                config.cache_root.display()
            ))
        })?;

        let layout = CacheLayout::new(config.cache_root.clone());
        let db = Arc::new(MetaDb::new(&layout.meta_db_path())?);
        if db.get("/")?.is_none() {
            db.put(&CacheMetadata::new_dir("/".to_string()))?;
        }
        let bitmaps = Arc::new(BitmapStore::new(layout.clone()));

        info!("cache engine open at {}", config.cache_root.display());
        Ok(Self {
            config,
            layout,
            db,
            bitmaps,
            remote,
            pending_ops: Mutex::new(VecDeque::new()),
            _root_lock: lock_file,
        })
    }

    pub fn config(&self) -> &CacheConfig {
        &self.config
    }

    pub fn layout(&self) -> &CacheLayout {
        &self.layout
    }

    pub fn db(&self) -> &MetaDb {
        &self.db
    }

    pub fn bitmaps(&self) -> &BitmapStore {
        &self.bitmaps
    }

    pub fn remote(&self) -> &Arc<dyn RemoteStore> {
        &self.remote
    }

    pub fn push_remote_op(&self, op: RemoteOp) {
        self.pending_ops.lock().unwrap().push_back(op);
    }

    pub fn drain_remote_ops(&self) -> Vec<RemoteOp> {
        self.pending_ops.lock().unwrap().drain(..).collect()
    }

    pub fn requeue_remote_ops(&self, ops: Vec<RemoteOp>) {
        let mut pending = self.pending_ops.lock().unwrap();
        for op in ops.into_iter().rev() {
            pending.push_front(op);
        }
    }

    fn norm_path(path: &str) -> String {
        let trimmed = path.trim_end_matches('/');
        if trimmed.is_empty() {
            return "/".to_string();
        }
        if trimmed.starts_with('/') {
            trimmed.to_string()
        } else {
            format!("/{}", trimmed)
        }
    }

    fn parent_of(path: &str) -> String {
        match path.rfind('/') {
            Some(0) | None => "/".to_string(),
            Some(n) => path[..n].to_string(),
        }
    }

    fn part_bytes(&self) -> u64 {
        self.config.part_bytes
    }

    fn block_bytes(&self) -> u64 {
        self.config.block_bytes
    }

    async fn part_file_len(&self, hash_hex: &str, part_idx: u32) -> u64 {
        match fs::metadata(self.layout.data_path(hash_hex, part_idx)).await {
            Ok(meta) => meta.len(),
            Err(_) => 0,
        }
    }

    async fn open_part_file(&self, hash_hex: &str, part_idx: u32) -> CacheResult<StdFile> {
        let path = self.layout.data_path(hash_hex, part_idx);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).await?;
        }
        let file = std::fs::OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .open(&path)
            .map_err(|e| {
                warn!("open part file {} failed! {}", path.display(), e);
                CacheError::from(e)
            })?;
        Ok(file)
    }

    /// Ensures every block of `[start, end)` (offsets within the part) is
    /// backed by real bytes: either locally authored (dirty bit set) or
    /// materialized from the remote. Missing blocks are fetched as
    /// maximal contiguous runs. No bit changes are made here, so an
    /// abandoned fetch leaves no trace beyond harmless file bytes.
    async fn ensure_present(
        &self,
        path: &str,
        hash_hex: &str,
        part_idx: u32,
        start: u64,
        end: u64,
        object_size: u64,
    ) -> CacheResult<()> {
        let part_start = part_idx as u64 * self.part_bytes();
        let remote_limit = self
            .part_bytes()
            .min(object_size.saturating_sub(part_start));
        let end = end.min(remote_limit);
        if start >= end {
            return Ok(());
        }

        self.bitmaps.ensure_loaded(hash_hex, part_idx).await?;
        let file_len = self.part_file_len(hash_hex, part_idx).await;
        let bb = self.block_bytes();

        let first_block = start / bb;
        let last_block = (end - 1) / bb;
        let mut missing: Vec<(u64, u64)> = Vec::new();
        for block in first_block..=last_block {
            let block_start = block * bb;
            let block_end = (block_start + bb).min(remote_limit);
            let present = self.bitmaps.is_dirty_block(hash_hex, part_idx, block)
                || file_len >= block_end;
            if present {
                continue;
            }
            match missing.last_mut() {
                Some(run) if run.1 == block_start => run.1 = block_end,
                _ => missing.push((block_start, block_end)),
            }
        }
        if missing.is_empty() {
            return Ok(());
        }

        let file = self.open_part_file(hash_hex, part_idx).await?;
        for (run_start, run_end) in missing {
            let data = self
                .remote
                .fetch(path, part_start + run_start, run_end - run_start)
                .await?;
            write_at_all(&file, run_start, &data)?;
            debug!(
                "materialized {} [{}, {}) of part {} for {}",
                data.len(),
                run_start,
                run_end,
                part_idx,
                path
            );
        }
        Ok(())
    }

    /// Reads `[offset, offset+len)` from the local part files only,
    /// zero-filling anything the files do not cover.
    pub(crate) async fn read_local_range(
        &self,
        hash_hex: &str,
        offset: u64,
        len: u64,
    ) -> CacheResult<Vec<u8>> {
        let mut out = vec![0u8; len as usize];
        let pb = self.part_bytes();
        let mut cursor = offset;
        let end = offset + len;
        while cursor < end {
            let part_idx = (cursor / pb) as u32;
            let part_start = part_idx as u64 * pb;
            let within = cursor - part_start;
            let chunk = (pb - within).min(end - cursor);
            let path = self.layout.data_path(hash_hex, part_idx);
            match std::fs::File::open(&path) {
                Ok(file) => {
                    let buf_start = (cursor - offset) as usize;
                    read_at_padded(&file, within, &mut out[buf_start..buf_start + chunk as usize])?;
                }
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => return Err(e.into()),
            }
            cursor += chunk;
        }
        Ok(out)
    }

    /// Creates metadata rows for any missing ancestor directories.
    async fn ensure_ancestors(&self, path: &str) -> CacheResult<()> {
        let mut ancestors = Vec::new();
        let mut cur = Self::parent_of(path);
        while cur != "/" {
            ancestors.push(cur.clone());
            cur = Self::parent_of(&cur);
        }
        for dir in ancestors.into_iter().rev() {
            if self.db.get(&dir)?.is_none() {
                self.db.put(&CacheMetadata::new_dir(dir))?;
            }
        }
        Ok(())
    }

    /// Metadata for a path, consulting the remote on a local miss and
    /// recording what it learns.
    pub async fn stat(&self, path: &str) -> CacheResult<CacheMetadata> {
        let path = Self::norm_path(path);
        if let Some(meta) = self.db.get(&path)? {
            return Ok(meta);
        }

        let remote_stat = self.remote.stat(&path).await?;
        let meta = if remote_stat.is_dir {
            CacheMetadata::new_dir(path.clone())
        } else {
            let mut meta =
                CacheMetadata::new_file(path.clone(), remote_stat.size, remote_stat.timestamp);
            if remote_stat.size == 0 {
                // Keep empty files distinguishable from directories.
                let hash = path_hash_hex(&path);
                self.open_part_file(&hash, 0).await?;
                meta.local_path = self.layout.data_path(&hash, 0).to_string_lossy().to_string();
            }
            meta
        };
        self.ensure_ancestors(&path).await?;
        self.db.put(&meta)?;
        debug!("materialized metadata for {} from remote", path);
        Ok(meta)
    }

    pub async fn read(&self, path: &str, offset: u64, size: u32) -> CacheResult<Vec<u8>> {
        let path = Self::norm_path(path);
        let mut meta = self.stat(&path).await?;
        if meta.is_dir() {
            return Err(CacheError::IsADirectory(path));
        }
        if offset >= meta.size || size == 0 {
            return Ok(Vec::new());
        }
        let len = (size as u64).min(meta.size - offset);
        let hash = path_hash_hex(&path);

        let pb = self.part_bytes();
        let first_part = (offset / pb) as u32;
        let last_part = ((offset + len - 1) / pb) as u32;
        for part_idx in first_part..=last_part {
            let part_start = part_idx as u64 * pb;
            let s = offset.max(part_start) - part_start;
            let e = (offset + len).min(part_start + pb) - part_start;
            self.ensure_present(&path, &hash, part_idx, s, e, meta.size)
                .await?;
        }

        let data = self.read_local_range(&hash, offset, len).await?;

        if meta.local_path.is_empty() {
            meta.local_path = self.layout.data_path(&hash, 0).to_string_lossy().to_string();
            meta.last_accessed = unix_timestamp();
            self.db.put(&meta)?;
        } else {
            self.db.update_access_time(&path, unix_timestamp())?;
        }
        Ok(data)
    }

    pub async fn write(&self, path: &str, offset: u64, data: &[u8]) -> CacheResult<usize> {
        let path = Self::norm_path(path);
        let mut meta = match self.db.get(&path)? {
            Some(meta) => meta,
            None => match self.stat(&path).await {
                Ok(meta) => meta,
                Err(err) if err.is_not_found() => {
                    self.ensure_ancestors(&path).await?;
                    CacheMetadata::new_file(path.clone(), 0, unix_timestamp())
                }
                Err(err) => return Err(err),
            },
        };
        if meta.is_dir() {
            return Err(CacheError::IsADirectory(path));
        }
        if data.is_empty() {
            return Ok(0);
        }

        let hash = path_hash_hex(&path);
        let pb = self.part_bytes();
        let bb = self.block_bytes();
        let end = offset + data.len() as u64;

        let first_part = (offset / pb) as u32;
        let last_part = ((end - 1) / pb) as u32;
        for part_idx in first_part..=last_part {
            let part_start = part_idx as u64 * pb;
            let s = offset.max(part_start) - part_start;
            let e = end.min(part_start + pb) - part_start;

            self.bitmaps.ensure_loaded(&hash, part_idx).await?;

            // Fill any hole this write would leave below it, so a part
            // file always contains real bytes up to its length.
            let file_len = self.part_file_len(&hash, part_idx).await;
            if s > file_len {
                self.ensure_present(&path, &hash, part_idx, file_len, s, meta.size)
                    .await?;
            }
            // Read-modify-write for partially covered edge blocks.
            if s % bb != 0 {
                self.ensure_present(&path, &hash, part_idx, s - s % bb, s, meta.size)
                    .await?;
            }
            if e % bb != 0 {
                self.ensure_present(&path, &hash, part_idx, e, e + (bb - e % bb), meta.size)
                    .await?;
            }

            let file = self.open_part_file(&hash, part_idx).await?;
            let buf_start = (part_start + s - offset) as usize;
            let buf_end = (part_start + e - offset) as usize;
            write_at_all(&file, s, &data[buf_start..buf_end])?;

            for block in s / bb..=(e - 1) / bb {
                self.bitmaps.mark_dirty_block(&hash, part_idx, block);
            }
        }

        let now = unix_timestamp();
        meta.size = meta.size.max(end);
        meta.timestamp = now;
        meta.last_accessed = now;
        meta.dirty = true;
        meta.local_path = self.layout.data_path(&hash, 0).to_string_lossy().to_string();
        self.db.put(&meta)?;
        self.bitmaps.flush_bitmaps(&hash).await?;
        Ok(data.len())
    }

    pub async fn truncate(&self, path: &str, new_size: u64) -> CacheResult<()> {
        let path = Self::norm_path(path);
        let mut meta = self.stat(&path).await?;
        if meta.is_dir() {
            return Err(CacheError::IsADirectory(path));
        }
        if new_size == meta.size {
            return Ok(());
        }
        let hash = path_hash_hex(&path);
        let pb = self.part_bytes();
        let bb = self.block_bytes();

        if new_size < meta.size {
            let last_part = if new_size == 0 { 0 } else { ((new_size - 1) / pb) as u32 };
            let old_last_part = if meta.size == 0 { 0 } else { ((meta.size - 1) / pb) as u32 };
            for part_idx in 0..=old_last_part {
                self.bitmaps.ensure_loaded(&hash, part_idx).await?;
            }

            // The clipped boundary block becomes dirty and will be pushed
            // back; its surviving bytes must be real before the tail goes.
            if new_size > 0 {
                let boundary_len = new_size - last_part as u64 * pb;
                let block_start = ((boundary_len - 1) / bb) * bb;
                self.ensure_present(&path, &hash, last_part, block_start, boundary_len, meta.size)
                    .await?;
            }

            for part_idx in (last_part + 1)..=old_last_part {
                let part_path = self.layout.data_path(&hash, part_idx);
                match fs::remove_file(&part_path).await {
                    Ok(()) => {}
                    Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                    Err(e) => return Err(e.into()),
                }
                let bmp_path = self.layout.bitmap_path(&hash, part_idx);
                match fs::remove_file(&bmp_path).await {
                    Ok(()) => {}
                    Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                    Err(e) => return Err(e.into()),
                }
            }

            let boundary_len = new_size - last_part as u64 * pb;
            let boundary_path = self.layout.data_path(&hash, last_part);
            if boundary_path.exists() {
                let file = fs::OpenOptions::new()
                    .write(true)
                    .open(&boundary_path)
                    .await?;
                let cur_len = file.metadata().await?.len();
                if cur_len > boundary_len {
                    file.set_len(boundary_len).await?;
                }
            }

            let surviving_blocks = (boundary_len + bb - 1) / bb;
            self.bitmaps.truncate_object(&hash, last_part, surviving_blocks);
            if new_size > 0 {
                self.bitmaps
                    .mark_dirty_block(&hash, last_part, (boundary_len - 1) / bb);
            }
        } else {
            // Grow: extend the tail parts so the new range reads as
            // zeros without consulting the remote.
            let old_last_part = if meta.size == 0 { 0 } else { ((meta.size - 1) / pb) as u32 };
            let new_last_part = ((new_size - 1) / pb) as u32;
            for part_idx in old_last_part..=new_last_part {
                let part_len = pb.min(new_size - part_idx as u64 * pb);
                let file = self.open_part_file(&hash, part_idx).await?;
                let cur_len = file.metadata()?.len();
                if cur_len < part_len {
                    file.set_len(part_len)?;
                }
            }
            self.bitmaps.ensure_loaded(&hash, new_last_part).await?;
            self.bitmaps.mark_dirty_block(
                &hash,
                new_last_part,
                (new_size - 1 - new_last_part as u64 * pb) / bb,
            );
        }

        let now = unix_timestamp();
        meta.size = new_size;
        meta.timestamp = now;
        meta.last_accessed = now;
        meta.dirty = true;
        meta.local_path = self.layout.data_path(&hash, 0).to_string_lossy().to_string();
        self.db.put(&meta)?;
        self.bitmaps.flush_bitmaps(&hash).await?;
        Ok(())
    }

    pub async fn create(&self, path: &str, directory: bool) -> CacheResult<CacheMetadata> {
        let path = Self::norm_path(path);
        if let Some(existing) = self.db.get(&path)? {
            if existing.is_dir() {
                return Err(CacheError::IsADirectory(path));
            }
            return Err(CacheError::AlreadyExists(path));
        }
        let parent = Self::parent_of(&path);
        if parent != "/" {
            let parent_meta = self
                .db
                .get(&parent)?
                .ok_or_else(|| CacheError::NotFound(parent.clone()))?;
            if !parent_meta.is_dir() {
                return Err(CacheError::NotADirectory(parent));
            }
        }

        let meta = if directory {
            CacheMetadata::new_dir(path.clone())
        } else {
            let hash = path_hash_hex(&path);
            self.open_part_file(&hash, 0).await?;
            let mut meta = CacheMetadata::new_file(path.clone(), 0, unix_timestamp());
            meta.local_path = self.layout.data_path(&hash, 0).to_string_lossy().to_string();
            meta
        };
        self.db.put(&meta)?;
        self.push_remote_op(RemoteOp::Create {
            path: path.clone(),
            directory,
        });
        Ok(meta)
    }

    pub async fn mkdir(&self, path: &str) -> CacheResult<CacheMetadata> {
        self.create(path, true).await
    }

    pub async fn rmdir(&self, path: &str) -> CacheResult<()> {
        let path = Self::norm_path(path);
        let meta = self
            .db
            .get(&path)?
            .ok_or_else(|| CacheError::NotFound(path.clone()))?;
        if !meta.is_dir() {
            return Err(CacheError::NotADirectory(path));
        }
        let prefix = format!("{}/", path);
        let has_children = self
            .db
            .all_entries()?
            .iter()
            .any(|entry| entry.path.starts_with(&prefix));
        if has_children {
            return Err(CacheError::NotEmpty(path));
        }
        self.db.remove(&path)?;
        self.push_remote_op(RemoteOp::Delete { path });
        Ok(())
    }

    pub async fn unlink(&self, path: &str) -> CacheResult<()> {
        let path = Self::norm_path(path);
        let meta = self
            .db
            .get(&path)?
            .ok_or_else(|| CacheError::NotFound(path.clone()))?;
        if meta.is_dir() {
            return Err(CacheError::IsADirectory(path));
        }

        let hash = path_hash_hex(&path);
        self.remove_object_files(&hash).await?;
        self.db.remove(&path)?;
        self.push_remote_op(RemoteOp::Delete { path });
        Ok(())
    }

    pub(crate) async fn remove_object_files(&self, hash_hex: &str) -> CacheResult<()> {
        let data_dir = self.layout.object_data_dir(hash_hex);
        match fs::remove_dir_all(&data_dir).await {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }
        self.bitmaps.remove_files(hash_hex).await
    }

    /// Moves one row and its on-disk state to a new path. Children of a
    /// renamed directory are moved by the caller.
    async fn rename_single(&self, old_path: &str, new_path: &str) -> CacheResult<()> {
        let meta = self
            .db
            .get(old_path)?
            .ok_or_else(|| CacheError::NotFound(old_path.to_string()))?;

        let mut new_meta = meta.clone();
        new_meta.path = new_path.to_string();

        if !meta.is_dir() {
            let old_hash = path_hash_hex(old_path);
            let new_hash = path_hash_hex(new_path);

            for (old_dir, new_dir) in [
                (
                    self.layout.object_data_dir(&old_hash),
                    self.layout.object_data_dir(&new_hash),
                ),
                (
                    self.layout.object_bitmap_dir(&old_hash),
                    self.layout.object_bitmap_dir(&new_hash),
                ),
            ] {
                if !old_dir.exists() {
                    continue;
                }
                if let Some(parent) = new_dir.parent() {
                    fs::create_dir_all(parent).await?;
                }
                match fs::remove_dir_all(&new_dir).await {
                    Ok(()) => {}
                    Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                    Err(e) => return Err(e.into()),
                }
                fs::rename(&old_dir, &new_dir).await?;
            }
            self.bitmaps.rename_object(&old_hash, &new_hash);
            if !meta.local_path.is_empty() {
                new_meta.local_path =
                    self.layout.data_path(&new_hash, 0).to_string_lossy().to_string();
            }
        }

        self.db.put(&new_meta)?;
        self.db.remove(old_path)?;
        Ok(())
    }

    /// Rename; a present-but-dirty object keeps its dirty state. With
    /// `no_replace`, an existing target fails with already-exists.
    pub async fn rename(&self, old_path: &str, new_path: &str, no_replace: bool) -> CacheResult<()> {
        let old_path = Self::norm_path(old_path);
        let new_path = Self::norm_path(new_path);
        let meta = self
            .db
            .get(&old_path)?
            .ok_or_else(|| CacheError::NotFound(old_path.clone()))?;

        if let Some(target) = self.db.get(&new_path)? {
            if no_replace {
                return Err(CacheError::AlreadyExists(new_path));
            }
            if target.is_dir() {
                if !meta.is_dir() {
                    return Err(CacheError::IsADirectory(new_path));
                }
                let prefix = format!("{}/", new_path);
                if self
                    .db
                    .all_entries()?
                    .iter()
                    .any(|entry| entry.path.starts_with(&prefix))
                {
                    return Err(CacheError::NotEmpty(new_path));
                }
                self.db.remove(&new_path)?;
            } else {
                if meta.is_dir() {
                    return Err(CacheError::NotADirectory(new_path));
                }
                let target_hash = path_hash_hex(&new_path);
                self.remove_object_files(&target_hash).await?;
                self.db.remove(&new_path)?;
            }
        }

        if meta.is_dir() {
            let prefix = format!("{}/", old_path);
            let mut descendants: Vec<String> = self
                .db
                .all_entries()?
                .into_iter()
                .filter(|entry| entry.path.starts_with(&prefix))
                .map(|entry| entry.path)
                .collect();
            // Parents first so new rows never orphan their children.
            descendants.sort();
            self.rename_single(&old_path, &new_path).await?;
            for child in descendants {
                let new_child = format!("{}{}", new_path, &child[old_path.len()..]);
                self.rename_single(&child, &new_child).await?;
            }
        } else {
            self.rename_single(&old_path, &new_path).await?;
        }

        self.push_remote_op(RemoteOp::Rename {
            old_path,
            new_path,
        });
        Ok(())
    }

    /// Direct children of a directory: the local prefix scan, merged with
    /// the remote listing when it is reachable.
    pub async fn readdir(&self, path: &str) -> CacheResult<Vec<DirEntryInfo>> {
        let path = Self::norm_path(path);
        let meta = self.stat(&path).await?;
        if !meta.is_dir() {
            return Err(CacheError::NotADirectory(path));
        }

        let prefix = if path == "/" { "/".to_string() } else { format!("{}/", path) };
        let mut seen = BTreeSet::new();
        let mut entries = Vec::new();
        for row in self.db.all_entries()? {
            let Some(rest) = row.path.strip_prefix(&prefix) else {
                continue;
            };
            if rest.is_empty() || rest.contains('/') {
                continue;
            }
            seen.insert(rest.to_string());
            entries.push(DirEntryInfo {
                name: rest.to_string(),
                is_dir: row.is_dir(),
            });
        }

        match self.remote.list(&path).await {
            Ok(names) => {
                for name in names {
                    if seen.contains(&name) {
                        continue;
                    }
                    let child_path = format!("{}{}", prefix, name);
                    match self.stat(&child_path).await {
                        Ok(child) => entries.push(DirEntryInfo {
                            name,
                            is_dir: child.is_dir(),
                        }),
                        Err(err) => {
                            warn!("stat remote child {} failed: {}", child_path, err);
                        }
                    }
                }
            }
            Err(err) if err.is_not_found() => {}
            Err(err) => {
                // Remote being down must not hide the local cache.
                warn!("remote list {} failed: {}", path, err);
            }
        }

        entries.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(entries)
    }

    /// Aggregate on-disk size of all materialized part files.
    pub async fn usage_bytes(&self) -> CacheResult<u64> {
        let mut total = 0u64;
        for entry in self.db.all_entries()? {
            if entry.local_path.is_empty() {
                continue;
            }
            total += self.object_disk_bytes(&path_hash_hex(&entry.path)).await?;
        }
        Ok(total)
    }

    pub(crate) async fn object_disk_bytes(&self, hash_hex: &str) -> CacheResult<u64> {
        let dir = self.layout.object_data_dir(hash_hex);
        let mut read_dir = match fs::read_dir(&dir).await {
            Ok(read_dir) => read_dir,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(0),
            Err(e) => return Err(e.into()),
        };
        let mut total = 0u64;
        while let Some(entry) = read_dir
            .next_entry()
            .await
            .map_err(|e| CacheError::IoError(e.to_string()))?
        {
            if let Ok(meta) = entry.metadata().await {
                total += meta.len();
            }
        }
        Ok(total)
    }

    /// Lists the materialized part indices of an object.
    pub(crate) async fn object_parts(&self, hash_hex: &str) -> CacheResult<Vec<u32>> {
        let dir = self.layout.object_data_dir(hash_hex);
        let mut read_dir = match fs::read_dir(&dir).await {
            Ok(read_dir) => read_dir,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };
        let mut parts = Vec::new();
        while let Some(entry) = read_dir
            .next_entry()
            .await
            .map_err(|e| CacheError::IoError(e.to_string()))?
        {
            let name = entry.file_name();
            if let Some(idx) = name
                .to_str()
                .and_then(|n| n.strip_prefix("part_"))
                .and_then(|n| n.parse::<u32>().ok())
            {
                parts.push(idx);
            }
        }
        parts.sort_unstable();
        Ok(parts)
    }
}

impl std::fmt::Debug for BlockCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BlockCache")
            .field("cache_root", &self.config.cache_root)
            .finish()
    }
}
