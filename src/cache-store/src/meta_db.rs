use fscache_lib::{CacheError, CacheResult};
use log::{debug, warn};
use rusqlite::{params, Connection};
use std::path::Path;
use std::sync::Mutex;

use crate::unix_timestamp;

/// One metadata row: everything the cache durably knows about a logical
/// path besides the part files and bitmaps themselves.
#[derive(Debug, Clone, PartialEq)]
pub struct CacheMetadata {
    pub path: String,
    /// Location of part 0; the other parts follow from the layout. Empty
    /// for directories and for files whose parts are not materialized.
    pub local_path: String,
    pub size: u64,
    pub timestamp: u64,
    pub last_accessed: u64,
    pub dirty: bool,
}

impl CacheMetadata {
    pub fn new_file(path: String, size: u64, timestamp: u64) -> Self {
        let now = unix_timestamp();
        Self {
            path,
            local_path: String::new(),
            size,
            timestamp,
            last_accessed: now,
            dirty: false,
        }
    }

    pub fn new_dir(path: String) -> Self {
        let now = unix_timestamp();
        Self {
            path,
            local_path: String::new(),
            size: 0,
            timestamp: now,
            last_accessed: now,
            dirty: false,
        }
    }

    /// A zero-size entry with no local materialization is a directory.
    /// Empty regular files keep a (zero-length) part 0 so the two stay
    /// distinguishable.
    pub fn is_dir(&self) -> bool {
        self.size == 0 && self.local_path.is_empty()
    }
}

/// Durable path index backed by SQLite. All statements go through one
/// connection behind a mutex; callers may invoke it freely from any
/// thread.
pub struct MetaDb {
    conn: Mutex<Connection>,
}

impl MetaDb {
    pub fn new(db_path: &Path) -> CacheResult<Self> {
        debug!("MetaDb: open {}", db_path.display());
        let conn = Connection::open(db_path).map_err(|e| {
            warn!("MetaDb: open db failed! {}", e);
            CacheError::DbError(e.to_string())
        })?;

        conn.execute(
            "CREATE TABLE IF NOT EXISTS metadata (
                path TEXT PRIMARY KEY,
                local_path TEXT,
                size INTEGER,
                timestamp INTEGER,
                last_accessed INTEGER,
                dirty INTEGER
            )",
            [],
        )
        .map_err(|e| {
            warn!("MetaDb: create table failed! {}", e);
            CacheError::DbError(e.to_string())
        })?;

        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    pub fn get(&self, path: &str) -> CacheResult<Option<CacheMetadata>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn
            .prepare(
                "SELECT local_path, size, timestamp, last_accessed, dirty
                 FROM metadata WHERE path = ?1",
            )
            .map_err(|e| CacheError::DbError(e.to_string()))?;

        let row = stmt.query_row(params![path], |row| {
            Ok(CacheMetadata {
                path: path.to_string(),
                local_path: row.get(0)?,
                size: row.get::<_, i64>(1)? as u64,
                timestamp: row.get::<_, i64>(2)? as u64,
                last_accessed: row.get::<_, i64>(3)? as u64,
                dirty: row.get::<_, i64>(4)? != 0,
            })
        });
        match row {
            Ok(meta) => Ok(Some(meta)),
            Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
            Err(e) => {
                warn!("MetaDb: get {} failed! {}", path, e);
                Err(CacheError::DbError(e.to_string()))
            }
        }
    }

    pub fn put(&self, meta: &CacheMetadata) -> CacheResult<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT INTO metadata (path, local_path, size, timestamp, last_accessed, dirty)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)
             ON CONFLICT(path) DO UPDATE SET
                local_path = excluded.local_path,
                size = excluded.size,
                timestamp = excluded.timestamp,
                last_accessed = excluded.last_accessed,
                dirty = excluded.dirty",
            params![
                meta.path,
                meta.local_path,
                meta.size as i64,
                meta.timestamp as i64,
                meta.last_accessed as i64,
                meta.dirty as i64,
            ],
        )
        .map_err(|e| {
            warn!("MetaDb: upsert {} failed! {}", meta.path, e);
            CacheError::DbError(e.to_string())
        })?;
        Ok(())
    }

    /// No-op when the key is absent.
    pub fn update_access_time(&self, path: &str, last_accessed: u64) -> CacheResult<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "UPDATE metadata SET last_accessed = ?1 WHERE path = ?2",
            params![last_accessed as i64, path],
        )
        .map_err(|e| {
            warn!("MetaDb: update access time {} failed! {}", path, e);
            CacheError::DbError(e.to_string())
        })?;
        Ok(())
    }

    /// No-op when the key is absent.
    pub fn mark_dirty(&self, path: &str, dirty: bool) -> CacheResult<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "UPDATE metadata SET dirty = ?1 WHERE path = ?2",
            params![dirty as i64, path],
        )
        .map_err(|e| {
            warn!("MetaDb: mark dirty {} failed! {}", path, e);
            CacheError::DbError(e.to_string())
        })?;
        Ok(())
    }

    /// Removes the row only; part and bitmap files are the caller's job.
    pub fn remove(&self, path: &str) -> CacheResult<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute("DELETE FROM metadata WHERE path = ?1", params![path])
            .map_err(|e| {
                warn!("MetaDb: remove {} failed! {}", path, e);
                CacheError::DbError(e.to_string())
            })?;
        Ok(())
    }

    pub fn all_entries(&self) -> CacheResult<Vec<CacheMetadata>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn
            .prepare(
                "SELECT path, local_path, size, timestamp, last_accessed, dirty
                 FROM metadata",
            )
            .map_err(|e| CacheError::DbError(e.to_string()))?;

        let rows = stmt
            .query_map([], |row| {
                Ok(CacheMetadata {
                    path: row.get(0)?,
                    local_path: row.get(1)?,
                    size: row.get::<_, i64>(2)? as u64,
                    timestamp: row.get::<_, i64>(3)? as u64,
                    last_accessed: row.get::<_, i64>(4)? as u64,
                    dirty: row.get::<_, i64>(5)? != 0,
                })
            })
            .map_err(|e| CacheError::DbError(e.to_string()))?;

        let mut entries = Vec::new();
        for row in rows {
            entries.push(row.map_err(|e| CacheError::DbError(e.to_string()))?);
        }
        Ok(entries)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn open_db(dir: &TempDir) -> MetaDb {
        MetaDb::new(&dir.path().join("metadata.db")).unwrap()
    }

    #[test]
    fn test_put_get_roundtrip() {
        let dir = TempDir::new().unwrap();
        let db = open_db(&dir);

        let meta = CacheMetadata {
            path: "/a.txt".to_string(),
            local_path: "/cache/data/ab/cd/abcd/part_00000000".to_string(),
            size: 4096,
            timestamp: 100,
            last_accessed: 200,
            dirty: true,
        };
        db.put(&meta).unwrap();
        let loaded = db.get("/a.txt").unwrap().unwrap();
        assert_eq!(loaded, meta);

        assert!(db.get("/missing").unwrap().is_none());
    }

    #[test]
    fn test_upsert_replaces_row() {
        let dir = TempDir::new().unwrap();
        let db = open_db(&dir);

        let mut meta = CacheMetadata::new_file("/a.txt".to_string(), 10, 1);
        db.put(&meta).unwrap();
        meta.size = 20;
        meta.dirty = true;
        db.put(&meta).unwrap();

        let loaded = db.get("/a.txt").unwrap().unwrap();
        assert_eq!(loaded.size, 20);
        assert!(loaded.dirty);
        assert_eq!(db.all_entries().unwrap().len(), 1);
    }

    #[test]
    fn test_updates_on_absent_key_succeed() {
        let dir = TempDir::new().unwrap();
        let db = open_db(&dir);
        db.update_access_time("/nope", 123).unwrap();
        db.mark_dirty("/nope", true).unwrap();
        db.remove("/nope").unwrap();
    }

    #[test]
    fn test_mark_dirty_and_access_time() {
        let dir = TempDir::new().unwrap();
        let db = open_db(&dir);

        db.put(&CacheMetadata::new_file("/a".to_string(), 5, 1)).unwrap();
        db.mark_dirty("/a", true).unwrap();
        db.update_access_time("/a", 999).unwrap();

        let loaded = db.get("/a").unwrap().unwrap();
        assert!(loaded.dirty);
        assert_eq!(loaded.last_accessed, 999);
    }

    #[test]
    fn test_all_entries_and_remove() {
        let dir = TempDir::new().unwrap();
        let db = open_db(&dir);

        db.put(&CacheMetadata::new_file("/a".to_string(), 1, 1)).unwrap();
        db.put(&CacheMetadata::new_dir("/docs".to_string())).unwrap();
        db.put(&CacheMetadata::new_file("/docs/b".to_string(), 2, 1))
            .unwrap();

        let mut paths: Vec<String> = db
            .all_entries()
            .unwrap()
            .into_iter()
            .map(|m| m.path)
            .collect();
        paths.sort();
        assert_eq!(paths, vec!["/a", "/docs", "/docs/b"]);

        db.remove("/a").unwrap();
        assert!(db.get("/a").unwrap().is_none());
        assert_eq!(db.all_entries().unwrap().len(), 2);
    }
}
