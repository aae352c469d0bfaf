//! L1/L2 read-through cache in front of `StateStore` (§4.4).

mod cache;
mod compression;
mod error;
mod prefetch;
mod tier;

pub use cache::{Loader, MultiLevelCache, MultiLevelCacheConfig, SetOptions};
pub use error::LoadError;
pub use prefetch::PrefetchTracker;
