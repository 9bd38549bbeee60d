use async_trait::async_trait;
use fscache_lib::CacheResult;
use serde::{Deserialize, Serialize};

/// Stat answer from the remote store, the `/api/info/{p}` body.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RemoteStat {
    pub size: u64,
    pub timestamp: u64,
    pub is_dir: bool,
}

/// One coalesced dirty run to be pushed back to the remote.
#[derive(Debug, Clone)]
pub struct FlushRun {
    pub offset: u64,
    pub data: Vec<u8>,
}

/// Remote object store as seen by the cache engine and writeback manager.
///
/// `fetch` must return exactly `len` bytes or fail; callers rely on that to
/// keep part files byte-accurate. Implementations handle their own retry
/// policy; errors that survive it are terminal for the call.
#[async_trait]
pub trait RemoteStore: Send + Sync {
    async fn stat(&self, path: &str) -> CacheResult<RemoteStat>;

    async fn list(&self, path: &str) -> CacheResult<Vec<String>>;

    async fn fetch(&self, path: &str, offset: u64, len: u64) -> CacheResult<Vec<u8>>;

    /// Range write. `total` is the full object size after the write and is
    /// carried in `Content-Range` so the remote can extend or truncate.
    async fn put_range(&self, path: &str, offset: u64, data: &[u8], total: u64)
        -> CacheResult<()>;

    /// Whole-object write, replacing any previous content.
    async fn put_object(&self, path: &str, data: &[u8]) -> CacheResult<()>;

    async fn create(&self, path: &str, directory: bool) -> CacheResult<()>;

    async fn rename(&self, old_path: &str, new_path: &str) -> CacheResult<()>;

    async fn delete(&self, path: &str) -> CacheResult<()>;

    /// Pushes every run; success only if all runs succeeded.
    async fn flush_runs(&self, path: &str, runs: &[FlushRun], total: u64) -> CacheResult<()> {
        for run in runs {
            self.put_range(path, run.offset, &run.data, total).await?;
        }
        Ok(())
    }
}
