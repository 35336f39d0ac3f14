//! probegrid-cache: time-bounded cache of recent check results.
//!
//! [`ResultCache`] keeps the last good result per target for `ttl` and
//! holds at most `max_size` entries. Storage is a fixed arena indexed by
//! key with an intrusive access-ordered list, so eviction of the least
//! recently accessed entry is O(1) and memory is bounded up front.
//!
//! Consumers that care about evictions subscribe to [`CacheEvent`]s.

pub mod cache;
mod table;

pub use cache::{CacheConfig, CacheEvent, CacheStats, ResultCache};
