mod bitmap;
mod block_cache;
mod maintain;
mod meta_db;

pub use bitmap::*;
pub use block_cache::*;
pub use maintain::*;
pub use meta_db::*;

use std::time::{SystemTime, UNIX_EPOCH};

pub(crate) fn unix_timestamp() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}
