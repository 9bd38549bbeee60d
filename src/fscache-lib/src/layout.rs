use sha2::{Digest, Sha256};
use std::path::{Path, PathBuf};

const DATA_DIR_NAME: &str = "data";
const BITMAP_DIR_NAME: &str = "bitmap";
const META_DB_FILE: &str = "metadata.db";

/// Hash of the absolute logical path, used as the stable on-disk identity
/// of an object.
pub fn path_hash_hex(logical_path: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(logical_path.as_bytes());
    hex::encode(hasher.finalize())
}

/// Deterministic mapping from object identity to local file locations.
///
/// Part and bitmap files live in twin trees under the cache root, fanned
/// out on the first two hex-pairs of the object hash so no directory grows
/// unbounded:
///
/// `{root}/data/ab/cd/abcd.../part_00000000`
/// `{root}/bitmap/ab/cd/abcd.../part_00000000.bmp`
#[derive(Debug, Clone)]
pub struct CacheLayout {
    root: PathBuf,
}

impl CacheLayout {
    pub fn new(root: PathBuf) -> Self {
        Self { root }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn meta_db_path(&self) -> PathBuf {
        self.root.join(META_DB_FILE)
    }

    fn fanout_dir(&self, top: &str, hash_hex: &str) -> PathBuf {
        self.root
            .join(top)
            .join(&hash_hex[0..2])
            .join(&hash_hex[2..4])
            .join(hash_hex)
    }

    pub fn object_data_dir(&self, hash_hex: &str) -> PathBuf {
        self.fanout_dir(DATA_DIR_NAME, hash_hex)
    }

    pub fn object_bitmap_dir(&self, hash_hex: &str) -> PathBuf {
        self.fanout_dir(BITMAP_DIR_NAME, hash_hex)
    }

    pub fn data_path(&self, hash_hex: &str, part_idx: u32) -> PathBuf {
        self.object_data_dir(hash_hex)
            .join(format!("part_{:08}", part_idx))
    }

    pub fn bitmap_path(&self, hash_hex: &str, part_idx: u32) -> PathBuf {
        self.object_bitmap_dir(hash_hex)
            .join(format!("part_{:08}.bmp", part_idx))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hash_is_deterministic_lowercase_hex() {
        let a = path_hash_hex("/a.txt");
        let b = path_hash_hex("/a.txt");
        assert_eq!(a, b);
        assert_eq!(a.len(), 64);
        assert!(a.chars().all(|c| c.is_ascii_hexdigit() && !c.is_ascii_uppercase()));
        assert_ne!(a, path_hash_hex("/b.txt"));
    }

    #[test]
    fn test_layout_fanout() {
        let layout = CacheLayout::new(PathBuf::from("/cache"));
        let hash = path_hash_hex("/dir/file.bin");
        let data = layout.data_path(&hash, 3);
        let expect = PathBuf::from("/cache")
            .join("data")
            .join(&hash[0..2])
            .join(&hash[2..4])
            .join(&hash)
            .join("part_00000003");
        assert_eq!(data, expect);

        let bitmap = layout.bitmap_path(&hash, 3);
        assert!(bitmap.to_string_lossy().ends_with("part_00000003.bmp"));
        assert!(bitmap.starts_with("/cache/bitmap"));

        assert_eq!(layout.meta_db_path(), PathBuf::from("/cache/metadata.db"));
    }

    #[test]
    fn test_parts_of_one_object_share_a_directory() {
        let layout = CacheLayout::new(PathBuf::from("/cache"));
        let hash = path_hash_hex("/x");
        assert_eq!(
            layout.data_path(&hash, 0).parent(),
            layout.data_path(&hash, 7).parent()
        );
    }
}
