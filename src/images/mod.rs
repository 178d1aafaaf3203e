//! Image caching for client apps.
//!
//! This module resolves remote image references to files in a bounded,
//! persistent cache directory. The rendering layer asks
//! [`ImageCache::get_cached_image`] for a path and renders whatever comes
//! back; a miss or failure simply yields the original URL.

mod cache;
mod eviction;
mod index;
mod key;
mod loader;

pub use cache::{CacheStats, ImageCache, PRELOAD_BATCH_SIZE};
pub use eviction::{EvictionPlan, MaintenanceReport, expired_keys, plan_evictions};
pub use index::{CacheCounters, CacheEntry, CacheIndex, INDEX_STORE_KEY, STATS_STORE_KEY};
pub use key::derive_key;
pub use loader::{
    DEFAULT_EXTENSION, DownloadOutcome, Downloader, HttpDownloader, file_extension, is_passthrough,
};
