//! # imgstash
//!
//! A bounded, persistent, least-recently-used cache for remote images.
//!
//! ## Overview
//!
//! UI code hands the cache a remote image reference and gets back a local
//! file path to render. Downloads are de-duplicated while in flight, the
//! index survives restarts, and three budgets (total bytes, item count,
//! age) keep the cache directory in check.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                        ImageCache                           │
//! │  initialize · get_cached_image · preload_images · stats     │
//! └─────────────────────────────────────────────────────────────┘
//!                              │
//!          ┌───────────────────┼───────────────────┐
//!          ▼                   ▼                   ▼
//! ┌─────────────────┐ ┌─────────────────┐ ┌─────────────────┐
//! │      Index      │ │     Loader      │ │    Eviction     │
//! │                 │ │                 │ │                 │
//! │ • Entries       │ │ • Passthrough   │ │ • Max age       │
//! │ • Counters      │ │ • Downloader    │ │ • Max items     │
//! │ • Persistence   │ │ • Part files    │ │ • Max bytes     │
//! └─────────────────┘ └─────────────────┘ └─────────────────┘
//!          │                   │
//!          ▼                   ▼
//! ┌─────────────────┐ ┌─────────────────┐
//! │  KeyValueStore  │ │  Cache dir      │
//! │ (SQLite/memory) │ │  <key>.<ext>    │
//! └─────────────────┘ └─────────────────┘
//! ```
//!
//! ## Modules
//!
//! - [`images`] — The cache itself: keys, index, downloads, eviction
//! - [`store`] — Durable key-value storage for the index
//! - [`config`] — Cache budgets and on-disk settings
//! - [`paths`] — Default locations
//! - [`error`] — Internal error type
//!
//! ## Example
//!
//! ```no_run
//! use imgstash::{CacheConfig, HttpDownloader, ImageCache, MemoryStore};
//!
//! # async fn demo() {
//! let cache = ImageCache::new(
//!     "/tmp/imgstash",
//!     CacheConfig::default(),
//!     HttpDownloader::new(),
//!     MemoryStore::new(),
//! );
//! let path = cache.get_cached_image("https://example.com/cover.jpg").await;
//! println!("render {path}");
//! # }
//! ```

#![warn(missing_docs)]
#![warn(rustdoc::missing_crate_level_docs)]
#![allow(clippy::missing_errors_doc)]
#![allow(clippy::missing_panics_doc)]
#![allow(clippy::must_use_candidate)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::option_if_let_else)]
#![allow(clippy::single_match_else)]
#![allow(clippy::too_many_lines)]
#![allow(clippy::uninlined_format_args)]
#![allow(clippy::cast_possible_truncation)]
#![allow(clippy::cast_possible_wrap)]
#![allow(clippy::cast_precision_loss)]
#![allow(clippy::significant_drop_tightening)]

pub mod config;
pub mod error;
pub mod images;
pub mod paths;
pub mod store;

// Re-export main types for convenience
pub use config::{CacheConfig, CacheConfigUpdate, Settings};
pub use error::CacheError;
pub use images::{CacheEntry, CacheStats, Downloader, HttpDownloader, ImageCache, derive_key};
pub use store::{KeyValueStore, MemoryStore, SqliteStore};

/// Application version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
