pub mod key;
pub mod response_cache;

pub use key::cache_key;
pub use response_cache::{CacheError, CacheStats, CacheStatus, ResponseCache};
