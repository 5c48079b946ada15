//! Layered caching for web resource optimization
//!
//! Builds the cache stack from one asynchronous contract
//! ([`CacheBackend`]): an in-process LRU, a disk cache, a
//! size-partitioning fallback composite, an HTTP-aware cache enforcing
//! freshness and failure memory, and a cohort-grouped property cache.
//!
//! # Layering
//!
//! ```text
//! HttpCache            freshness, sentinels, compression
//!   └─ FallbackCache   small/large routing
//!        ├─ LRU        fast, bounded, in-process
//!        └─ FileCache  large, persistent, cleaned periodically
//! ```

pub mod compress;
pub mod error;
pub mod fallback;
pub mod file;
pub mod headers;
pub mod http;
pub mod interface;
pub mod lru;
pub mod property;
pub mod value;

pub use compress::{DEFAULT_MIN_COMPRESS_BYTES, decompress, maybe_compress};
pub use error::{Error, Result};
pub use fallback::FallbackCache;
pub use file::{CleanPolicy, FileCache};
pub use headers::{CachePolicy, DEFAULT_IMPLICIT_CACHE_TTL_MS, ResponseHeaders};
pub use http::{HttpCache, HttpCacheResult};
pub use interface::{
    AcceptAll, CacheBackend, CandidateValidator, InMemoryCache, KeyState, Lookup,
};
pub use lru::{LruCache, ThreadsafeLruCache};
pub use property::{Cohort, PropertyCache, PropertyPage, PropertyValue};
pub use value::HttpValue;
