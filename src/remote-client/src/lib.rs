mod http_client;
mod mem_store;
mod store;

pub use http_client::*;
pub use mem_store::*;
pub use store::*;
