use fscache_lib::{CacheError, CacheLayout, CacheResult};
use log::warn;
use std::collections::{HashMap, HashSet};
use std::sync::RwLock;
use tokio::fs;

/// Per-part dirty bit vectors for one object, keyed by part index.
pub type ObjectBitmaps = HashMap<u32, Vec<bool>>;

fn pack_bits(bits: &[bool]) -> Vec<u8> {
    let mut bytes = vec![0u8; (bits.len() + 7) / 8];
    for (i, bit) in bits.iter().enumerate() {
        if *bit {
            bytes[i / 8] |= 1 << (i % 8);
        }
    }
    bytes
}

fn unpack_bits(bytes: &[u8]) -> Vec<bool> {
    let mut bits = vec![false; bytes.len() * 8];
    for (i, byte) in bytes.iter().enumerate() {
        for b in 0..8 {
            bits[i * 8 + b] = byte & (1 << b) != 0;
        }
    }
    bits
}

/// In-memory dirty bitmaps plus their packed on-disk persistence.
///
/// Bit `i` of a part bitmap lives at `byte[i/8] & (1 << (i%8))` in the
/// bitmap file. A set bit means the block was locally modified since the
/// last successful flush; the same bit doubles as a presence marker for
/// locally authored data. The map lock is never held across file I/O.
pub struct BitmapStore {
    layout: CacheLayout,
    bitmaps: RwLock<HashMap<String, ObjectBitmaps>>,
    /// (hash, part) pairs whose on-disk bitmap has already been probed,
    /// so clean parts do not hit the filesystem on every access.
    probed: RwLock<HashSet<(String, u32)>>,
}

impl BitmapStore {
    pub fn new(layout: CacheLayout) -> Self {
        Self {
            layout,
            bitmaps: RwLock::new(HashMap::new()),
            probed: RwLock::new(HashSet::new()),
        }
    }

    /// Sets one dirty bit, growing the vector as needed.
    pub fn mark_dirty_block(&self, hash_hex: &str, part_idx: u32, block_idx: u64) {
        let mut map = self.bitmaps.write().unwrap();
        let bits = map
            .entry(hash_hex.to_string())
            .or_default()
            .entry(part_idx)
            .or_default();
        if bits.len() as u64 <= block_idx {
            bits.resize(block_idx as usize + 1, false);
        }
        bits[block_idx as usize] = true;
    }

    pub fn is_dirty_block(&self, hash_hex: &str, part_idx: u32, block_idx: u64) -> bool {
        let map = self.bitmaps.read().unwrap();
        map.get(hash_hex)
            .and_then(|parts| parts.get(&part_idx))
            .map(|bits| bits.get(block_idx as usize).copied().unwrap_or(false))
            .unwrap_or(false)
    }

    pub fn has_dirty(&self, hash_hex: &str) -> bool {
        let map = self.bitmaps.read().unwrap();
        map.get(hash_hex)
            .map(|parts| parts.values().any(|bits| bits.iter().any(|b| *b)))
            .unwrap_or(false)
    }

    /// Copy of every in-memory bitmap for the object, taken at flush
    /// start so concurrent writes can keep dirtying the live map.
    pub fn snapshot(&self, hash_hex: &str) -> ObjectBitmaps {
        let map = self.bitmaps.read().unwrap();
        map.get(hash_hex).cloned().unwrap_or_default()
    }

    /// Clears exactly the bits set in `snapshot`: bits dirtied after the
    /// snapshot was taken survive for the next flush.
    pub fn clear_bits(&self, hash_hex: &str, snapshot: &ObjectBitmaps) {
        let mut map = self.bitmaps.write().unwrap();
        let Some(parts) = map.get_mut(hash_hex) else {
            return;
        };
        for (part_idx, snap_bits) in snapshot {
            if let Some(bits) = parts.get_mut(part_idx) {
                for (i, snap_bit) in snap_bits.iter().enumerate() {
                    if *snap_bit && i < bits.len() {
                        bits[i] = false;
                    }
                }
            }
        }
        // All-clear parts stay resident until flush_bitmaps removes their
        // files; dropping them here would leave stale bits on disk.
    }

    /// Drops every bit at or beyond `first_gone_block` of the given part,
    /// and whole parts beyond `last_part`.
    pub fn truncate_object(&self, hash_hex: &str, last_part: u32, first_gone_block: u64) {
        let mut map = self.bitmaps.write().unwrap();
        if let Some(parts) = map.get_mut(hash_hex) {
            parts.retain(|part_idx, _| *part_idx <= last_part);
            if let Some(bits) = parts.get_mut(&last_part) {
                bits.truncate(first_gone_block as usize);
            }
        }
    }

    /// Moves the in-memory bitmaps to a renamed object's hash.
    pub fn rename_object(&self, old_hash: &str, new_hash: &str) {
        let mut map = self.bitmaps.write().unwrap();
        if let Some(parts) = map.remove(old_hash) {
            map.insert(new_hash.to_string(), parts);
        }
        drop(map);

        let mut probed = self.probed.write().unwrap();
        let moved: Vec<u32> = probed
            .iter()
            .filter(|(hash, _)| hash == old_hash)
            .map(|(_, part)| *part)
            .collect();
        for part in moved {
            probed.remove(&(old_hash.to_string(), part));
            probed.insert((new_hash.to_string(), part));
        }
    }

    pub fn remove_object(&self, hash_hex: &str) {
        let mut map = self.bitmaps.write().unwrap();
        map.remove(hash_hex);
        drop(map);
        let mut probed = self.probed.write().unwrap();
        probed.retain(|(hash, _)| hash != hash_hex);
    }

    /// Persists every in-memory bitmap of the object. A part whose bits
    /// are all clear has its bitmap file removed instead. Returns an
    /// error if any part failed; the in-memory state is left untouched
    /// either way.
    pub async fn flush_bitmaps(&self, hash_hex: &str) -> CacheResult<()> {
        let parts: Vec<(u32, Vec<bool>)> = {
            let map = self.bitmaps.read().unwrap();
            map.get(hash_hex)
                .map(|parts| {
                    parts
                        .iter()
                        .map(|(idx, bits)| (*idx, bits.clone()))
                        .collect()
                })
                .unwrap_or_default()
        };

        let mut ok = true;
        for (part_idx, bits) in parts {
            let path = self.layout.bitmap_path(hash_hex, part_idx);
            let result = if bits.iter().any(|b| *b) {
                async {
                    if let Some(parent) = path.parent() {
                        fs::create_dir_all(parent).await?;
                    }
                    fs::write(&path, pack_bits(&bits)).await
                }
                .await
            } else {
                match fs::remove_file(&path).await {
                    Err(e) if e.kind() != std::io::ErrorKind::NotFound => Err(e),
                    _ => Ok(()),
                }
            };
            if let Err(e) = result {
                warn!("persist bitmap {} failed! {}", path.display(), e);
                ok = false;
            }
        }

        if !ok {
            return Err(CacheError::IoError(format!(
                "persist bitmaps for {} failed",
                hash_hex
            )));
        }

        // Persisted state now matches memory; drop the all-clear parts.
        let mut map = self.bitmaps.write().unwrap();
        if let Some(parts) = map.get_mut(hash_hex) {
            parts.retain(|_, bits| bits.iter().any(|b| *b));
            if parts.is_empty() {
                map.remove(hash_hex);
            }
        }
        Ok(())
    }

    /// Loads one persisted bitmap into memory. A missing file means no
    /// dirty bits and is a success. The file is read in full and expanded
    /// to `file_size * 8` bits.
    pub async fn load_bitmap(&self, hash_hex: &str, part_idx: u32) -> CacheResult<()> {
        let path = self.layout.bitmap_path(hash_hex, part_idx);
        let bytes = match fs::read(&path).await {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                self.mark_probed(hash_hex, part_idx);
                return Ok(());
            }
            Err(e) => {
                warn!("load bitmap {} failed! {}", path.display(), e);
                return Err(e.into());
            }
        };

        let bits = unpack_bits(&bytes);
        let mut map = self.bitmaps.write().unwrap();
        let slot = map
            .entry(hash_hex.to_string())
            .or_default()
            .entry(part_idx)
            .or_default();
        // Bits set since startup win over the persisted image.
        if slot.len() < bits.len() {
            slot.resize(bits.len(), false);
        }
        for (i, bit) in bits.iter().enumerate() {
            if *bit {
                slot[i] = true;
            }
        }
        drop(map);
        self.mark_probed(hash_hex, part_idx);
        Ok(())
    }

    fn mark_probed(&self, hash_hex: &str, part_idx: u32) {
        let mut probed = self.probed.write().unwrap();
        probed.insert((hash_hex.to_string(), part_idx));
    }

    /// Loads the part's persisted bitmap once per process lifetime.
    pub async fn ensure_loaded(&self, hash_hex: &str, part_idx: u32) -> CacheResult<()> {
        {
            let probed = self.probed.read().unwrap();
            if probed.contains(&(hash_hex.to_string(), part_idx)) {
                return Ok(());
            }
        }
        self.load_bitmap(hash_hex, part_idx).await
    }

    /// Deletes every bitmap file of the object and forgets its in-memory
    /// state.
    pub async fn remove_files(&self, hash_hex: &str) -> CacheResult<()> {
        self.remove_object(hash_hex);
        let dir = self.layout.object_bitmap_dir(hash_hex);
        match fs::remove_dir_all(&dir).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => {
                warn!("remove bitmap dir {} failed! {}", dir.display(), e);
                Err(e.into())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use fscache_lib::path_hash_hex;
    use tempfile::TempDir;

    fn store(dir: &TempDir) -> BitmapStore {
        BitmapStore::new(CacheLayout::new(dir.path().to_path_buf()))
    }

    #[test]
    fn test_pack_unpack_roundtrip() {
        let bits = vec![true, false, false, true, true, false, true, false, true];
        let packed = pack_bits(&bits);
        assert_eq!(packed.len(), 2);
        // bit 0, 3, 4, 6 of byte 0: 0b0101_1001
        assert_eq!(packed[0], 0b0101_1001);
        assert_eq!(packed[1], 0b0000_0001);

        let unpacked = unpack_bits(&packed);
        assert_eq!(unpacked.len(), 16);
        assert_eq!(&unpacked[..9], &bits[..]);
        assert!(unpacked[9..].iter().all(|b| !*b));
    }

    #[test]
    fn test_mark_grows_vector() {
        let dir = TempDir::new().unwrap();
        let bitmaps = store(&dir);
        let hash = path_hash_hex("/a");

        bitmaps.mark_dirty_block(&hash, 0, 9);
        assert!(bitmaps.is_dirty_block(&hash, 0, 9));
        assert!(!bitmaps.is_dirty_block(&hash, 0, 8));
        assert!(!bitmaps.is_dirty_block(&hash, 1, 0));
        assert!(bitmaps.has_dirty(&hash));
    }

    #[tokio::test]
    async fn test_persist_load_roundtrip() {
        let dir = TempDir::new().unwrap();
        let hash = path_hash_hex("/a");
        {
            let bitmaps = store(&dir);
            bitmaps.mark_dirty_block(&hash, 0, 0);
            bitmaps.mark_dirty_block(&hash, 0, 5);
            bitmaps.mark_dirty_block(&hash, 2, 17);
            bitmaps.flush_bitmaps(&hash).await.unwrap();
        }

        let bitmaps = store(&dir);
        bitmaps.load_bitmap(&hash, 0).await.unwrap();
        bitmaps.load_bitmap(&hash, 2).await.unwrap();
        assert!(bitmaps.is_dirty_block(&hash, 0, 0));
        assert!(bitmaps.is_dirty_block(&hash, 0, 5));
        assert!(!bitmaps.is_dirty_block(&hash, 0, 4));
        assert!(bitmaps.is_dirty_block(&hash, 2, 17));
    }

    #[tokio::test]
    async fn test_load_missing_file_is_empty_success() {
        let dir = TempDir::new().unwrap();
        let bitmaps = store(&dir);
        let hash = path_hash_hex("/nothing");
        bitmaps.load_bitmap(&hash, 0).await.unwrap();
        assert!(!bitmaps.has_dirty(&hash));
    }

    #[tokio::test]
    async fn test_flush_removes_file_once_bits_clear() {
        let dir = TempDir::new().unwrap();
        let bitmaps = store(&dir);
        let hash = path_hash_hex("/a");
        let bmp_path = CacheLayout::new(dir.path().to_path_buf()).bitmap_path(&hash, 0);

        bitmaps.mark_dirty_block(&hash, 0, 1);
        bitmaps.flush_bitmaps(&hash).await.unwrap();
        assert!(bmp_path.exists());

        let snapshot = bitmaps.snapshot(&hash);
        bitmaps.clear_bits(&hash, &snapshot);
        bitmaps.flush_bitmaps(&hash).await.unwrap();
        assert!(!bmp_path.exists());
        assert!(!bitmaps.has_dirty(&hash));
    }

    #[test]
    fn test_shadow_clear_keeps_new_bits() {
        let dir = TempDir::new().unwrap();
        let bitmaps = store(&dir);
        let hash = path_hash_hex("/a");

        bitmaps.mark_dirty_block(&hash, 0, 0);
        let snapshot = bitmaps.snapshot(&hash);

        // A write lands on a new block while the flush is in flight; only
        // the bits the snapshot observed may clear.
        bitmaps.mark_dirty_block(&hash, 0, 7);

        bitmaps.clear_bits(&hash, &snapshot);
        assert!(!bitmaps.is_dirty_block(&hash, 0, 0));
        assert!(bitmaps.is_dirty_block(&hash, 0, 7));
        assert!(bitmaps.has_dirty(&hash));
    }

    #[test]
    fn test_rename_and_truncate() {
        let dir = TempDir::new().unwrap();
        let bitmaps = store(&dir);
        let old_hash = path_hash_hex("/old");
        let new_hash = path_hash_hex("/new");

        bitmaps.mark_dirty_block(&old_hash, 1, 2);
        bitmaps.rename_object(&old_hash, &new_hash);
        assert!(!bitmaps.has_dirty(&old_hash));
        assert!(bitmaps.is_dirty_block(&new_hash, 1, 2));

        bitmaps.mark_dirty_block(&new_hash, 3, 0);
        bitmaps.truncate_object(&new_hash, 1, 3);
        assert!(!bitmaps.is_dirty_block(&new_hash, 3, 0));
        assert!(bitmaps.is_dirty_block(&new_hash, 1, 2));
        bitmaps.truncate_object(&new_hash, 1, 2);
        assert!(!bitmaps.is_dirty_block(&new_hash, 1, 2));
    }
}
