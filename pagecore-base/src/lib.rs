//! Shared primitives for the pagecore content-optimization core
//!
//! This crate provides the building blocks every other pagecore crate
//! leans on:
//! - Copy-on-write shared byte buffers for cache payload transit
//! - One-shot operation tokens with run/cancel arms
//! - Injectable timers (system and mock)
//! - Process-shared statistics over mmap segments, with no-op fallback
//! - Cross-process named locks over a shared cache directory

pub mod buffer;
pub mod error;
pub mod function;
pub mod lock;
pub mod sharedmem;
pub mod stats;
pub mod timer;

pub use buffer::SharedBuffer;
pub use error::{Error, Result};
pub use function::OpToken;
pub use lock::FileSystemLockManager;
pub use sharedmem::{MmapSharedMem, NullSharedMem, SharedMemRuntime};
pub use stats::{Histogram, SplitStatistics, Statistics, StatisticsBuilder, Variable};
pub use timer::{MockTimer, SharedTimer, SystemTimer, Timer};
