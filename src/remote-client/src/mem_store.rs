use async_trait::async_trait;
use fscache_lib::{CacheError, CacheResult};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::{SystemTime, UNIX_EPOCH};
use tokio::sync::RwLock;

use crate::{RemoteStat, RemoteStore};

fn unix_timestamp() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

#[derive(Debug, Clone)]
struct MemObject {
    data: Vec<u8>,
    timestamp: u64,
    is_dir: bool,
}

/// One recorded PUT, for assertions in tests.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PutRecord {
    pub path: String,
    pub offset: u64,
    pub len: u64,
    pub total: u64,
}

/// In-memory remote store for local development and tests.
#[derive(Default)]
pub struct MemRemoteStore {
    objects: RwLock<HashMap<String, MemObject>>,
    fetch_count: AtomicU64,
    put_count: AtomicU64,
    rename_count: AtomicU64,
    delete_count: AtomicU64,
    put_log: Mutex<Vec<PutRecord>>,
    fail_puts: AtomicBool,
}

impl MemRemoteStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn norm(path: &str) -> String {
        format!("/{}", path.trim_start_matches('/'))
    }

    pub async fn insert_object(&self, path: &str, data: Vec<u8>) {
        let mut objects = self.objects.write().await;
        objects.insert(
            Self::norm(path),
            MemObject {
                data,
                timestamp: unix_timestamp(),
                is_dir: false,
            },
        );
    }

    pub async fn insert_dir(&self, path: &str) {
        let mut objects = self.objects.write().await;
        objects.insert(
            Self::norm(path),
            MemObject {
                data: Vec::new(),
                timestamp: unix_timestamp(),
                is_dir: true,
            },
        );
    }

    pub async fn object_data(&self, path: &str) -> Option<Vec<u8>> {
        let objects = self.objects.read().await;
        objects.get(&Self::norm(path)).map(|obj| obj.data.clone())
    }

    pub fn fetch_count(&self) -> u64 {
        self.fetch_count.load(Ordering::Relaxed)
    }

    pub fn put_count(&self) -> u64 {
        self.put_count.load(Ordering::Relaxed)
    }

    pub fn rename_count(&self) -> u64 {
        self.rename_count.load(Ordering::Relaxed)
    }

    pub fn delete_count(&self) -> u64 {
        self.delete_count.load(Ordering::Relaxed)
    }

    pub fn put_log(&self) -> Vec<PutRecord> {
        self.put_log.lock().unwrap().clone()
    }

    /// Makes every following PUT fail, for exercising flush-failure paths.
    pub fn set_fail_puts(&self, fail: bool) {
        self.fail_puts.store(fail, Ordering::Relaxed);
    }

    fn check_puts_allowed(&self, path: &str) -> CacheResult<()> {
        if self.fail_puts.load(Ordering::Relaxed) {
            return Err(CacheError::RemoteError(format!(
                "injected put failure for {}",
                path
            )));
        }
        Ok(())
    }
}

#[async_trait]
impl RemoteStore for MemRemoteStore {
    async fn stat(&self, path: &str) -> CacheResult<RemoteStat> {
        let objects = self.objects.read().await;
        let obj = objects
            .get(&Self::norm(path))
            .ok_or_else(|| CacheError::NotFound(path.to_string()))?;
        Ok(RemoteStat {
            size: obj.data.len() as u64,
            timestamp: obj.timestamp,
            is_dir: obj.is_dir,
        })
    }

    async fn list(&self, path: &str) -> CacheResult<Vec<String>> {
        let dir = Self::norm(path);
        let objects = self.objects.read().await;
        if dir != "/" {
            match objects.get(&dir) {
                Some(obj) if obj.is_dir => {}
                Some(_) => return Err(CacheError::NotADirectory(path.to_string())),
                None => return Err(CacheError::NotFound(path.to_string())),
            }
        }
        let prefix = if dir == "/" { "/".to_string() } else { format!("{}/", dir) };
        let mut names: Vec<String> = objects
            .keys()
            .filter_map(|key| {
                let rest = key.strip_prefix(&prefix)?;
                if rest.is_empty() || rest.contains('/') {
                    None
                } else {
                    Some(rest.to_string())
                }
            })
            .collect();
        names.sort();
        Ok(names)
    }

    async fn fetch(&self, path: &str, offset: u64, len: u64) -> CacheResult<Vec<u8>> {
        self.fetch_count.fetch_add(1, Ordering::Relaxed);
        let objects = self.objects.read().await;
        let obj = objects
            .get(&Self::norm(path))
            .ok_or_else(|| CacheError::NotFound(path.to_string()))?;
        let end = offset + len;
        if end > obj.data.len() as u64 {
            return Err(CacheError::VerifyError(format!(
                "range [{}, {}) beyond object size {} for {}",
                offset,
                end,
                obj.data.len(),
                path
            )));
        }
        Ok(obj.data[offset as usize..end as usize].to_vec())
    }

    async fn put_range(
        &self,
        path: &str,
        offset: u64,
        data: &[u8],
        total: u64,
    ) -> CacheResult<()> {
        self.check_puts_allowed(path)?;
        self.put_count.fetch_add(1, Ordering::Relaxed);
        self.put_log.lock().unwrap().push(PutRecord {
            path: Self::norm(path),
            offset,
            len: data.len() as u64,
            total,
        });
        let mut objects = self.objects.write().await;
        let obj = objects.entry(Self::norm(path)).or_insert_with(|| MemObject {
            data: Vec::new(),
            timestamp: unix_timestamp(),
            is_dir: false,
        });
        let end = (offset + data.len() as u64) as usize;
        if obj.data.len() < end {
            obj.data.resize(end, 0);
        }
        obj.data[offset as usize..end].copy_from_slice(data);
        // Content-Range total is the authoritative object size.
        obj.data.resize(total as usize, 0);
        obj.timestamp = unix_timestamp();
        Ok(())
    }

    async fn put_object(&self, path: &str, data: &[u8]) -> CacheResult<()> {
        self.check_puts_allowed(path)?;
        self.put_count.fetch_add(1, Ordering::Relaxed);
        self.put_log.lock().unwrap().push(PutRecord {
            path: Self::norm(path),
            offset: 0,
            len: data.len() as u64,
            total: data.len() as u64,
        });
        let mut objects = self.objects.write().await;
        objects.insert(
            Self::norm(path),
            MemObject {
                data: data.to_vec(),
                timestamp: unix_timestamp(),
                is_dir: false,
            },
        );
        Ok(())
    }

    async fn create(&self, path: &str, directory: bool) -> CacheResult<()> {
        let mut objects = self.objects.write().await;
        let key = Self::norm(path);
        if let Some(existing) = objects.get(&key) {
            if !existing.is_dir {
                return Err(CacheError::AlreadyExists(path.to_string()));
            }
            return Ok(());
        }
        objects.insert(
            key,
            MemObject {
                data: Vec::new(),
                timestamp: unix_timestamp(),
                is_dir: directory,
            },
        );
        Ok(())
    }

    async fn rename(&self, old_path: &str, new_path: &str) -> CacheResult<()> {
        self.rename_count.fetch_add(1, Ordering::Relaxed);
        let mut objects = self.objects.write().await;
        let old_key = Self::norm(old_path);
        let new_key = Self::norm(new_path);
        match objects.remove(&old_key) {
            Some(obj) => {
                objects.insert(new_key, obj);
                Ok(())
            }
            // The object may only exist locally; nothing to move yet.
            None => Ok(()),
        }
    }

    async fn delete(&self, path: &str) -> CacheResult<()> {
        self.delete_count.fetch_add(1, Ordering::Relaxed);
        let mut objects = self.objects.write().await;
        objects.remove(&Self::norm(path));
        Ok(())
    }
}
