//! 结果缓存（Result Cache）模块。
//!
//! 以 `(operation, 规范化参数)` 的哈希为键，缓存幂等调用的成功且非空的结果。

mod key;
mod result_cache;
mod store;

pub use key::CacheKey;
pub use result_cache::{CacheSettings, CacheStats, CacheValue, Cached, ResultCache};
pub use store::{CacheStore, MokaStore, StoreError};
