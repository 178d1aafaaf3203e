//! Persistent LRU cache for remote images.
//!
//! Maps a remote reference to a file inside the cache directory. Lookups
//! never fail: on any problem the caller gets the original reference back
//! and renders it directly.

use chrono::{DateTime, Utc};
use std::collections::HashSet;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock};

use tokio::sync::OnceCell;
use tokio::task::JoinSet;

use super::eviction::{self, MaintenanceReport};
use super::index::{CacheCounters, CacheEntry, CacheIndex, INDEX_STORE_KEY, STATS_STORE_KEY};
use super::key::derive_key;
use super::loader::{Downloader, file_extension, is_passthrough};
use crate::config::{CacheConfig, CacheConfigUpdate};
use crate::store::KeyValueStore;

/// Downloads running at once during [`ImageCache::preload_images`]
pub const PRELOAD_BATCH_SIZE: usize = 3;

const BYTES_PER_MB: f64 = 1024.0 * 1024.0;

/// Snapshot returned by [`ImageCache::get_cache_stats`]
#[derive(Debug, Clone, PartialEq)]
pub struct CacheStats {
    /// Number of indexed images
    pub total_items: usize,
    /// Sum of indexed file sizes
    pub total_size_bytes: u64,
    /// Same, in megabytes
    pub total_size_mb: f64,
    /// Earliest `created_at` in the index
    pub oldest_item: Option<DateTime<Utc>>,
    /// Latest `created_at` in the index
    pub newest_item: Option<DateTime<Utc>>,
    /// Lookups served from disk
    pub hits: u64,
    /// Lookups that needed a download
    pub misses: u64,
    /// `hits / (hits + misses)`, 0.0 when nothing was recorded
    pub hit_rate: f64,
}

#[derive(Debug, Default)]
struct State {
    index: CacheIndex,
    counters: CacheCounters,
    /// Keys with a download running; never persisted
    in_progress: HashSet<String>,
}

struct Inner<D, S> {
    cache_dir: PathBuf,
    config: RwLock<CacheConfig>,
    downloader: D,
    store: S,
    state: Mutex<State>,
    ready: OnceCell<()>,
    /// Post-insert maintenance passes, awaited by `flush`
    background: Mutex<JoinSet<()>>,
}

/// Cheaply cloneable handle to a shared image cache
pub struct ImageCache<D, S> {
    inner: Arc<Inner<D, S>>,
}

impl<D, S> Clone for ImageCache<D, S> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

/// Clears the in-progress marker for a key when dropped
struct InFlight<'a> {
    state: &'a Mutex<State>,
    key: String,
}

impl<'a> InFlight<'a> {
    fn claim(state: &'a Mutex<State>, key: &str) -> Option<Self> {
        let mut guard = lock(state);
        if !guard.in_progress.insert(key.to_string()) {
            return None;
        }
        Some(Self {
            state,
            key: key.to_string(),
        })
    }
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        lock(self.state).in_progress.remove(&self.key);
    }
}

fn lock(state: &Mutex<State>) -> MutexGuard<'_, State> {
    state.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Delete backing files; a file that is already gone is fine.
async fn delete_files(entries: &[CacheEntry]) {
    for entry in entries {
        match tokio::fs::remove_file(&entry.local_path).await {
            Ok(()) => {}
            Err(e) if e.kind() == ErrorKind::NotFound => {}
            Err(e) => {
                tracing::warn!(
                    "Failed to delete cached image {}: {e}",
                    entry.local_path.display()
                );
            }
        }
    }
}

impl<D, S> ImageCache<D, S>
where
    D: Downloader,
    S: KeyValueStore + 'static,
{
    /// Create a cache rooted at `cache_dir`.
    ///
    /// Nothing touches the disk until [`initialize`](Self::initialize)
    /// (or the first call that needs it).
    pub fn new(
        cache_dir: impl Into<PathBuf>,
        config: CacheConfig,
        downloader: D,
        store: S,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                cache_dir: cache_dir.into(),
                config: RwLock::new(config),
                downloader,
                store,
                state: Mutex::new(State::default()),
                ready: OnceCell::new(),
                background: Mutex::new(JoinSet::new()),
            }),
        }
    }

    /// Directory holding the cached files.
    pub fn cache_dir(&self) -> &Path {
        &self.inner.cache_dir
    }

    /// Current budgets.
    pub fn config(&self) -> CacheConfig {
        self.inner
            .config
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Merge new budgets into the live config; applies from the next maintenance pass.
    pub fn update_config(&self, update: &CacheConfigUpdate) {
        self.inner
            .config
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .apply(update);
        tracing::debug!("Image cache config updated: {update:?}");
    }

    fn state(&self) -> MutexGuard<'_, State> {
        lock(&self.inner.state)
    }

    fn background(&self) -> MutexGuard<'_, JoinSet<()>> {
        self.inner
            .background
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    /// Wait for background maintenance started by earlier lookups.
    ///
    /// Call before the runtime shuts down; passes still pending at that
    /// point would be dropped and leave the persisted index over budget.
    pub async fn flush(&self) {
        loop {
            let mut tasks = std::mem::take(&mut *self.background());
            if tasks.is_empty() {
                break;
            }
            while let Some(result) = tasks.join_next().await {
                if let Err(e) = result {
                    tracing::warn!("Image cache maintenance task failed: {e}");
                }
            }
        }
    }

    fn persist(&self, state: &State) {
        state.index.save(&self.inner.store);
        state.counters.save(&self.inner.store);
    }

    /// Create the directory, load the index and run startup maintenance.
    ///
    /// Runs once; later and concurrent calls wait for the first one.
    pub async fn initialize(&self) {
        self.inner.ready.get_or_init(|| self.bootstrap()).await;
    }

    async fn bootstrap(&self) {
        if let Err(e) = tokio::fs::create_dir_all(&self.inner.cache_dir).await {
            tracing::warn!(
                "Failed to create image cache directory {}: {e}",
                self.inner.cache_dir.display()
            );
        }

        let index = CacheIndex::load(&self.inner.store);
        let counters = CacheCounters::load(&self.inner.store);
        let loaded = index.len();
        {
            let mut state = self.state();
            state.index = index;
            state.counters = counters;
        }

        let expired = self.run_cleanup_expired().await;
        let limited = self.run_enforce_limits().await;
        tracing::info!(
            "Image cache ready: {loaded} indexed, {} expired, {} over budget",
            expired.removed,
            limited.removed
        );
    }

    /// Resolve a reference to something renderable.
    ///
    /// Local and inline references come back unchanged. Cached images
    /// resolve to their file path. Anything else is downloaded; while that
    /// runs, or if it fails, the original reference is returned.
    pub async fn get_cached_image(&self, reference: &str) -> String {
        if is_passthrough(reference) {
            return reference.to_string();
        }
        self.initialize().await;

        let key = derive_key(reference);
        if let Some(path) = self.lookup(&key, reference).await {
            return path.to_string_lossy().into_owned();
        }

        {
            let mut state = self.state();
            state.counters.misses += 1;
            state.counters.save(&self.inner.store);
        }

        match self.fetch(reference, &key, true).await {
            Some(path) => path.to_string_lossy().into_owned(),
            None => reference.to_string(),
        }
    }

    /// Whether `reference` would be served from disk, without touching recency.
    pub async fn is_cached(&self, reference: &str) -> bool {
        self.initialize().await;
        self.valid_entry(&derive_key(reference), reference)
            .await
            .is_some()
    }

    /// Entry for `key` if it belongs to `reference`, is fresh and its file exists.
    async fn valid_entry(&self, key: &str, reference: &str) -> Option<CacheEntry> {
        let max_age = self.config().max_age();
        let entry = self.state().index.get(key).cloned()?;

        if entry.remote_reference != reference || entry.is_expired(Utc::now(), max_age) {
            return None;
        }
        match tokio::fs::try_exists(&entry.local_path).await {
            Ok(true) => Some(entry),
            _ => None,
        }
    }

    /// Hit path: bump recency and return the file, or drop a stale entry.
    async fn lookup(&self, key: &str, reference: &str) -> Option<PathBuf> {
        if self.valid_entry(key, reference).await.is_some() {
            return self.record_hit(key, reference);
        }

        let stale = {
            let mut state = self.state();
            // A running download for this key supersedes the entry anyway
            let owned = !state.in_progress.contains(key)
                && state
                    .index
                    .get(key)
                    .is_some_and(|e| e.remote_reference == reference);
            let stale = if owned { state.index.remove(key) } else { None };
            if stale.is_some() {
                state.index.save(&self.inner.store);
            }
            stale
        };
        if let Some(entry) = stale {
            tracing::debug!("Dropping stale cache entry for {reference}");
            delete_files(std::slice::from_ref(&entry)).await;
        }
        None
    }

    /// Bump recency for `key` if it still belongs to `reference`.
    ///
    /// The entry may have been evicted or replaced by a colliding
    /// reference while the file check was awaited.
    fn record_hit(&self, key: &str, reference: &str) -> Option<PathBuf> {
        let mut state = self.state();
        let current = state
            .index
            .get_mut(key)
            .filter(|e| e.remote_reference == reference)?;
        current.touch(Utc::now());
        let path = current.local_path.clone();
        state.counters.hits += 1;
        self.persist(&state);
        Some(path)
    }

    /// Miss path: download into the cache directory and index the result.
    async fn fetch(&self, reference: &str, key: &str, enforce: bool) -> Option<PathBuf> {
        let Some(_marker) = InFlight::claim(&self.inner.state, key) else {
            tracing::debug!("Download already in flight for {reference}");
            return None;
        };

        let dest = self
            .inner
            .cache_dir
            .join(format!("{key}.{}", file_extension(reference)));

        let outcome = match self.inner.downloader.download(reference, &dest).await {
            Ok(outcome) if outcome.is_success() => outcome,
            Ok(outcome) => {
                tracing::warn!("Failed to cache image {reference}: HTTP {}", outcome.status);
                // The slot may still hold a colliding reference's valid file
                let shared = self.state().index.get(key).is_some_and(|e| {
                    e.local_path == outcome.path && e.remote_reference != reference
                });
                if !shared {
                    let _ = tokio::fs::remove_file(&outcome.path).await;
                }
                return None;
            }
            Err(e) => {
                tracing::warn!("Failed to cache image {reference}: {e}");
                return None;
            }
        };

        let size = match tokio::fs::metadata(&outcome.path).await {
            Ok(meta) => meta.len(),
            Err(e) => {
                tracing::warn!("Downloaded image {reference} is unreadable: {e}");
                return None;
            }
        };

        {
            let mut state = self.state();
            state.index.put(
                key.to_string(),
                CacheEntry::fresh(reference, outcome.path.clone(), size),
            );
            state.index.save(&self.inner.store);
        }
        tracing::debug!("Cached {reference} ({size} bytes)");

        if enforce {
            let cache = self.clone();
            let mut tasks = self.background();
            // Reap finished passes so the set does not grow unbounded
            while tasks.try_join_next().is_some() {}
            tasks.spawn(async move {
                cache.run_enforce_limits().await;
            });
        }

        Some(outcome.path)
    }

    /// Warm the cache for upcoming references.
    ///
    /// Skips references that are already cached, then downloads the rest
    /// [`PRELOAD_BATCH_SIZE`] at a time. Budgets are enforced once at the end.
    /// Returns how many images were downloaded.
    pub async fn preload_images<I>(&self, references: I) -> usize
    where
        I: IntoIterator,
        I::Item: Into<String>,
    {
        self.initialize().await;

        let mut seen = HashSet::new();
        let mut pending = Vec::new();
        for reference in references {
            let reference: String = reference.into();
            if is_passthrough(&reference) {
                continue;
            }
            let key = derive_key(&reference);
            if !seen.insert(key.clone()) || self.valid_entry(&key, &reference).await.is_some() {
                continue;
            }
            pending.push((reference, key));
        }

        let mut loaded = 0;
        for batch in pending.chunks(PRELOAD_BATCH_SIZE) {
            let mut tasks = JoinSet::new();
            for (reference, key) in batch.iter().cloned() {
                let cache = self.clone();
                tasks.spawn(async move { cache.fetch(&reference, &key, false).await.is_some() });
            }
            while let Some(result) = tasks.join_next().await {
                match result {
                    Ok(true) => loaded += 1,
                    Ok(false) => {}
                    Err(e) => tracing::warn!("Preload task failed: {e}"),
                }
            }
        }

        if loaded > 0 {
            self.run_enforce_limits().await;
        }
        tracing::debug!("Preloaded {loaded} of {} images", pending.len());
        loaded
    }

    /// Remove entries older than the age budget.
    pub async fn cleanup_expired(&self) -> MaintenanceReport {
        self.initialize().await;
        self.run_cleanup_expired().await
    }

    async fn run_cleanup_expired(&self) -> MaintenanceReport {
        let max_age = self.config().max_age();
        let removed = {
            let mut state = self.state();
            let keys = eviction::expired_keys(state.index.entries(), Utc::now(), max_age);
            self.remove_keys(&mut state, &keys)
        };
        self.finish_removal(&removed, "expired").await
    }

    /// Evict least-recently-used entries until the size and item budgets hold.
    pub async fn enforce_limits(&self) -> MaintenanceReport {
        self.initialize().await;
        self.run_enforce_limits().await
    }

    async fn run_enforce_limits(&self) -> MaintenanceReport {
        let config = self.config();
        let removed = {
            let mut state = self.state();
            let plan = eviction::plan_evictions(
                state.index.entries(),
                config.max_cache_size_bytes,
                config.max_items,
            );
            self.remove_keys(&mut state, &plan.keys)
        };
        self.finish_removal(&removed, "over budget").await
    }

    /// Drop keys from the index and persist once if anything changed.
    fn remove_keys(&self, state: &mut State, keys: &[String]) -> Vec<CacheEntry> {
        let removed: Vec<_> = keys.iter().filter_map(|k| state.index.remove(k)).collect();
        if !removed.is_empty() {
            state.index.save(&self.inner.store);
        }
        removed
    }

    async fn finish_removal(&self, removed: &[CacheEntry], reason: &str) -> MaintenanceReport {
        delete_files(removed).await;
        let report = MaintenanceReport {
            removed: removed.len(),
            bytes_freed: removed.iter().map(|e| e.size_bytes).sum(),
        };
        if report.removed > 0 {
            tracing::info!(
                "Evicted {} {reason} images ({} bytes)",
                report.removed,
                report.bytes_freed
            );
        }
        report
    }

    /// Aggregate counts, sizes and hit rate.
    pub async fn get_cache_stats(&self) -> CacheStats {
        self.initialize().await;
        let state = self.state();
        let total_size_bytes = state.index.total_size();

        CacheStats {
            total_items: state.index.len(),
            total_size_bytes,
            total_size_mb: total_size_bytes as f64 / BYTES_PER_MB,
            oldest_item: state.index.entries().map(|(_, e)| e.created_at).min(),
            newest_item: state.index.entries().map(|(_, e)| e.created_at).max(),
            hits: state.counters.hits,
            misses: state.counters.misses,
            hit_rate: state.counters.hit_rate(),
        }
    }

    /// Delete every cached file and forget the persisted index.
    pub async fn clear_cache(&self) {
        self.initialize().await;

        let dir = &self.inner.cache_dir;
        match tokio::fs::remove_dir_all(dir).await {
            Ok(()) => {}
            Err(e) if e.kind() == ErrorKind::NotFound => {}
            Err(e) => tracing::warn!("Failed to remove image cache {}: {e}", dir.display()),
        }

        {
            let mut state = self.state();
            state.index.clear();
            state.counters = CacheCounters::default();
        }
        for key in [INDEX_STORE_KEY, STATS_STORE_KEY] {
            if let Err(e) = self.inner.store.remove_item(key) {
                tracing::warn!("Failed to remove {key} from store: {e}");
            }
        }

        if let Err(e) = tokio::fs::create_dir_all(dir).await {
            tracing::warn!("Failed to recreate image cache {}: {e}", dir.display());
        }
        tracing::info!("Image cache cleared");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{CacheError, Result};
    use crate::images::loader::DownloadOutcome;
    use crate::store::{MemoryStore, SqliteStore};
    use chrono::Duration;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tempfile::tempdir;
    use tokio::sync::Semaphore;

    const MB: u64 = 1024 * 1024;
    const BODY: &[u8] = b"\x89PNG fake image body";

    /// Writes a fixed body and counts calls
    #[derive(Clone)]
    struct FakeDownloader {
        calls: Arc<AtomicUsize>,
        status: u16,
        error: bool,
        gate: Option<Arc<Semaphore>>,
    }

    impl FakeDownloader {
        fn ok() -> Self {
            Self {
                calls: Arc::new(AtomicUsize::new(0)),
                status: 200,
                error: false,
                gate: None,
            }
        }

        fn status(status: u16) -> Self {
            Self { status, ..Self::ok() }
        }

        fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    impl Downloader for FakeDownloader {
        async fn download(&self, _url: &str, dest: &Path) -> Result<DownloadOutcome> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if let Some(gate) = &self.gate {
                let _permit = gate.acquire().await;
            }
            if self.error {
                return Err(CacheError::Io(std::io::Error::other("connection reset")));
            }
            if (200..300).contains(&self.status) {
                tokio::fs::write(dest, BODY).await?;
            }
            Ok(DownloadOutcome {
                status: self.status,
                path: dest.to_path_buf(),
            })
        }
    }

    fn cache_with<S: KeyValueStore + 'static>(
        dir: &Path,
        config: CacheConfig,
        downloader: FakeDownloader,
        store: S,
    ) -> ImageCache<FakeDownloader, S> {
        ImageCache::new(dir.join("images"), config, downloader, store)
    }

    /// Persist `count` entries with files on disk; higher index = more recently used.
    fn seed(dir: &Path, store: &MemoryStore, count: usize, size: u64) -> Vec<String> {
        let images = dir.join("images");
        std::fs::create_dir_all(&images).unwrap();
        let base = Utc::now() - Duration::hours(1);

        let mut index = CacheIndex::new();
        let mut keys = Vec::new();
        for i in 0..count {
            let url = format!("https://cdn.example.com/listing/{i}.jpg");
            let key = derive_key(&url);
            let path = images.join(format!("{key}.jpg"));
            std::fs::write(&path, BODY).unwrap();

            let at = base + Duration::seconds(i as i64);
            index.put(
                key.clone(),
                CacheEntry {
                    remote_reference: url,
                    local_path: path,
                    created_at: at,
                    last_accessed_at: at,
                    size_bytes: size,
                    access_count: 1,
                },
            );
            keys.push(key);
        }
        index.save(store);
        keys
    }

    #[tokio::test]
    async fn test_end_to_end_first_download() {
        let dir = tempdir().unwrap();
        let downloader = FakeDownloader::ok();
        let cache = cache_with(
            dir.path(),
            CacheConfig::default(),
            downloader.clone(),
            MemoryStore::new(),
        );
        cache.initialize().await;

        let url = "https://x/a.jpg";
        let path = cache.get_cached_image(url).await;
        assert_ne!(path, url);
        assert!(path.ends_with(".jpg"));
        assert_eq!(std::fs::read(&path).unwrap(), BODY);

        let stats = cache.get_cache_stats().await;
        assert_eq!(stats.total_items, 1);
        assert_eq!(stats.total_size_bytes, BODY.len() as u64);
        assert_eq!(stats.misses, 1);
        assert_eq!(downloader.calls(), 1);
    }

    #[tokio::test]
    async fn test_hit_after_miss() {
        let dir = tempdir().unwrap();
        let downloader = FakeDownloader::ok();
        let cache = cache_with(
            dir.path(),
            CacheConfig::default(),
            downloader.clone(),
            MemoryStore::new(),
        );

        let url = "https://x/a.jpg";
        let first = cache.get_cached_image(url).await;
        let second = cache.get_cached_image(url).await;

        assert_eq!(first, second);
        assert_ne!(second, url);
        assert_eq!(downloader.calls(), 1);

        let stats = cache.get_cache_stats().await;
        assert_eq!(stats.hits, 1);
        assert!((stats.hit_rate - 0.5).abs() < f64::EPSILON);

        let state = cache.state();
        let entry = state.index.get(&derive_key(url)).unwrap();
        assert_eq!(entry.access_count, 2);
        assert!(entry.created_at <= entry.last_accessed_at);
    }

    #[tokio::test]
    async fn test_local_passthrough() {
        let dir = tempdir().unwrap();
        let downloader = FakeDownloader::ok();
        let cache = cache_with(
            dir.path(),
            CacheConfig::default(),
            downloader.clone(),
            MemoryStore::new(),
        );

        assert_eq!(cache.get_cached_image("file:///x.png").await, "file:///x.png");
        let inline = "data:image/png;base64,AAAA";
        assert_eq!(cache.get_cached_image(inline).await, inline);
        assert_eq!(downloader.calls(), 0);
    }

    #[tokio::test]
    async fn test_fail_soft_on_bad_status() {
        let dir = tempdir().unwrap();
        let downloader = FakeDownloader::status(500);
        let cache = cache_with(
            dir.path(),
            CacheConfig::default(),
            downloader.clone(),
            MemoryStore::new(),
        );

        let url = "https://x/missing.png";
        assert_eq!(cache.get_cached_image(url).await, url);
        assert_eq!(cache.get_cache_stats().await.total_items, 0);
        assert!(!cache.is_cached(url).await);
    }

    #[tokio::test]
    async fn test_fail_soft_on_transport_error() {
        let dir = tempdir().unwrap();
        let downloader = FakeDownloader {
            error: true,
            ..FakeDownloader::ok()
        };
        let cache = cache_with(
            dir.path(),
            CacheConfig::default(),
            downloader.clone(),
            MemoryStore::new(),
        );

        let url = "https://x/a.jpg";
        assert_eq!(cache.get_cached_image(url).await, url);
        assert_eq!(cache.get_cache_stats().await.total_items, 0);
        // Marker was released, so a retry downloads again
        cache.get_cached_image(url).await;
        assert_eq!(downloader.calls(), 2);
    }

    #[tokio::test]
    async fn test_in_flight_download_is_not_duplicated() {
        let dir = tempdir().unwrap();
        let gate = Arc::new(Semaphore::new(0));
        let downloader = FakeDownloader {
            gate: Some(Arc::clone(&gate)),
            ..FakeDownloader::ok()
        };
        let cache = cache_with(
            dir.path(),
            CacheConfig::default(),
            downloader.clone(),
            MemoryStore::new(),
        );
        cache.initialize().await;

        let url = "https://x/slow.jpg";
        let first = tokio::spawn({
            let cache = cache.clone();
            async move { cache.get_cached_image(url).await }
        });
        while downloader.calls() == 0 {
            tokio::task::yield_now().await;
        }

        // Second caller is degraded, not blocked
        assert_eq!(cache.get_cached_image(url).await, url);
        assert_eq!(downloader.calls(), 1);

        gate.add_permits(1);
        let path = first.await.unwrap();
        assert_ne!(path, url);
        assert_eq!(cache.get_cached_image(url).await, path);
        assert_eq!(downloader.calls(), 1);
    }

    #[tokio::test]
    async fn test_size_budget_evicts_least_recent() {
        let dir = tempdir().unwrap();
        let store = MemoryStore::new();
        let keys = seed(dir.path(), &store, 15, MB);
        let config = CacheConfig {
            max_cache_size_bytes: 10 * MB,
            ..CacheConfig::default()
        };
        let cache = cache_with(dir.path(), config, FakeDownloader::ok(), store);
        cache.initialize().await;

        let stats = cache.get_cache_stats().await;
        assert!(stats.total_size_bytes <= 10 * MB);
        assert_eq!(stats.total_items, 10);

        let state = cache.state();
        for key in &keys[..5] {
            assert!(state.index.get(key).is_none());
        }
        for key in &keys[5..] {
            assert!(state.index.get(key).is_some());
        }
        assert!(!cache.cache_dir().join(format!("{}.jpg", keys[0])).exists());
        assert!(cache.cache_dir().join(format!("{}.jpg", keys[14])).exists());
    }

    #[tokio::test]
    async fn test_item_budget_keeps_most_recent() {
        let dir = tempdir().unwrap();
        let store = MemoryStore::new();
        let keys = seed(dir.path(), &store, 8, 1);
        let cache = cache_with(dir.path(), CacheConfig::default(), FakeDownloader::ok(), store);
        cache.initialize().await;
        assert_eq!(cache.get_cache_stats().await.total_items, 8);

        cache.update_config(&CacheConfigUpdate {
            max_items: Some(5),
            ..Default::default()
        });
        let report = cache.enforce_limits().await;
        assert_eq!(report.removed, 3);

        let state = cache.state();
        assert_eq!(state.index.len(), 5);
        for key in &keys[3..] {
            assert!(state.index.get(key).is_some());
        }
    }

    #[tokio::test]
    async fn test_expired_entries_removed_and_redownloaded() {
        let dir = tempdir().unwrap();
        let store = MemoryStore::new();
        let keys = seed(dir.path(), &store, 2, 1);

        // Age the first entry past the budget
        let mut index = CacheIndex::load(&store);
        let entry = index.get_mut(&keys[0]).unwrap();
        entry.created_at = Utc::now() - Duration::hours(48);
        let url = entry.remote_reference.clone();
        index.save(&store);

        let config = CacheConfig {
            max_age_hours: 24,
            ..CacheConfig::default()
        };
        let downloader = FakeDownloader::ok();
        let cache = cache_with(dir.path(), config, downloader.clone(), store);
        cache.initialize().await;

        assert!(cache.state().index.get(&keys[0]).is_none());
        assert!(cache.state().index.get(&keys[1]).is_some());

        let path = cache.get_cached_image(&url).await;
        assert_ne!(path, url);
        assert_eq!(downloader.calls(), 1);
    }

    #[tokio::test]
    async fn test_missing_file_is_a_miss() {
        let dir = tempdir().unwrap();
        let downloader = FakeDownloader::ok();
        let cache = cache_with(
            dir.path(),
            CacheConfig::default(),
            downloader.clone(),
            MemoryStore::new(),
        );

        let url = "https://x/a.jpg";
        let path = cache.get_cached_image(url).await;
        std::fs::remove_file(&path).unwrap();

        assert!(!cache.is_cached(url).await);
        assert_eq!(cache.get_cached_image(url).await, path);
        assert_eq!(downloader.calls(), 2);
        assert!(Path::new(&path).exists());
    }

    #[tokio::test]
    async fn test_preload_skips_cached_and_duplicates() {
        let dir = tempdir().unwrap();
        let downloader = FakeDownloader::ok();
        let cache = cache_with(
            dir.path(),
            CacheConfig::default(),
            downloader.clone(),
            MemoryStore::new(),
        );

        cache.get_cached_image("https://x/0.jpg").await;
        let urls: Vec<String> = (0..7).map(|i| format!("https://x/{i}.jpg")).collect();
        let mut refs = urls.clone();
        refs.push("https://x/3.jpg".to_string());
        refs.push("file:///local.png".to_string());

        let loaded = cache.preload_images(refs).await;
        assert_eq!(loaded, 6);
        assert_eq!(downloader.calls(), 7);
        for url in &urls {
            assert!(cache.is_cached(url).await, "{url}");
        }
        // Preload does not count as lookups
        assert_eq!(cache.get_cache_stats().await.misses, 1);
    }

    #[tokio::test]
    async fn test_preload_respects_item_budget() {
        let dir = tempdir().unwrap();
        let config = CacheConfig {
            max_items: 2,
            ..CacheConfig::default()
        };
        let cache = cache_with(dir.path(), config, FakeDownloader::ok(), MemoryStore::new());

        let loaded = cache
            .preload_images((0..5).map(|i| format!("https://x/{i}.jpg")))
            .await;
        assert_eq!(loaded, 5);
        assert_eq!(cache.get_cache_stats().await.total_items, 2);
    }

    #[tokio::test]
    async fn test_clear_cache_is_idempotent() {
        let dir = tempdir().unwrap();
        let cache = cache_with(
            dir.path(),
            CacheConfig::default(),
            FakeDownloader::ok(),
            MemoryStore::new(),
        );
        cache.get_cached_image("https://x/a.jpg").await;

        for _ in 0..2 {
            cache.clear_cache().await;
            let stats = cache.get_cache_stats().await;
            assert_eq!(stats.total_items, 0);
            assert_eq!(stats.misses, 0);
            assert!(cache.cache_dir().is_dir());
            assert_eq!(std::fs::read_dir(cache.cache_dir()).unwrap().count(), 0);
            assert_eq!(cache.inner.store.get_item(INDEX_STORE_KEY).unwrap(), None);
        }
    }

    #[tokio::test]
    async fn test_index_survives_restart() {
        let dir = tempdir().unwrap();
        let store_path = dir.path().join("store.sqlite");
        let url = "https://x/avatar.png";

        let first_path = {
            let store = SqliteStore::open_path(&store_path).unwrap();
            let cache = cache_with(dir.path(), CacheConfig::default(), FakeDownloader::ok(), store);
            cache.get_cached_image(url).await
        };

        let downloader = FakeDownloader::ok();
        let store = SqliteStore::open_path(&store_path).unwrap();
        let cache = cache_with(dir.path(), CacheConfig::default(), downloader.clone(), store);
        assert_eq!(cache.get_cached_image(url).await, first_path);
        assert_eq!(downloader.calls(), 0);
        assert_eq!(cache.get_cache_stats().await.hits, 1);
    }

    #[tokio::test]
    async fn test_collision_does_not_serve_other_image() {
        let dir = tempdir().unwrap();
        let store = MemoryStore::new();
        let keys = seed(dir.path(), &store, 1, 1);
        let downloader = FakeDownloader::ok();
        let cache = cache_with(dir.path(), CacheConfig::default(), downloader.clone(), store);
        cache.initialize().await;

        // Same key, different reference: forge the collision in the index
        let other = "https://elsewhere/other.jpg";
        {
            let mut state = cache.state();
            let entry = state.index.get(&keys[0]).cloned().unwrap();
            state.index.remove(&keys[0]);
            state.index.put(derive_key(other), entry);
        }
        assert_ne!(cache.get_cached_image(other).await, other);
        assert_eq!(downloader.calls(), 1);
    }

    #[tokio::test]
    async fn test_lookups_evict_least_recent_over_item_budget() {
        let dir = tempdir().unwrap();
        let config = CacheConfig {
            max_items: 2,
            ..CacheConfig::default()
        };
        let cache = cache_with(dir.path(), config, FakeDownloader::ok(), MemoryStore::new());

        let urls: Vec<String> = (0..3).map(|i| format!("https://x/{i}.jpg")).collect();
        let mut paths = Vec::new();
        for url in &urls {
            paths.push(cache.get_cached_image(url).await);
        }
        cache.flush().await;

        {
            let state = cache.state();
            assert_eq!(state.index.len(), 2);
            assert!(state.index.get(&derive_key(&urls[0])).is_none());
            assert!(state.index.get(&derive_key(&urls[1])).is_some());
            assert!(state.index.get(&derive_key(&urls[2])).is_some());
        }
        assert!(!Path::new(&paths[0]).exists());
        assert!(Path::new(&paths[2]).exists());
    }

    #[test]
    fn test_flush_persists_eviction_before_shutdown() {
        let dir = tempdir().unwrap();
        let store_path = dir.path().join("store.sqlite");
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .unwrap();

        runtime.block_on(async {
            let store = SqliteStore::open_path(&store_path).unwrap();
            let config = CacheConfig {
                max_items: 1,
                ..CacheConfig::default()
            };
            let cache = cache_with(dir.path(), config, FakeDownloader::ok(), store);
            for i in 0..3 {
                cache.get_cached_image(&format!("https://x/{i}.jpg")).await;
            }
            cache.flush().await;
        });
        drop(runtime);

        let store = SqliteStore::open_path(&store_path).unwrap();
        let index = CacheIndex::load(&store);
        assert_eq!(index.len(), 1);
        assert!(index.get(&derive_key("https://x/2.jpg")).is_some());
    }

    #[tokio::test]
    async fn test_expired_entry_redownloaded_on_access() {
        let dir = tempdir().unwrap();
        let downloader = FakeDownloader::ok();
        let cache = cache_with(
            dir.path(),
            CacheConfig::default(),
            downloader.clone(),
            MemoryStore::new(),
        );
        cache.initialize().await;

        let url = "https://x/a.jpg";
        let key = derive_key(url);
        cache.get_cached_image(url).await;
        cache.flush().await;

        // Startup maintenance already ran; only the lookup can notice the age
        cache.state().index.get_mut(&key).unwrap().created_at = Utc::now() - Duration::hours(48);
        cache.update_config(&CacheConfigUpdate {
            max_age_hours: Some(24),
            ..Default::default()
        });
        assert!(!cache.is_cached(url).await);

        let path = cache.get_cached_image(url).await;
        assert_ne!(path, url);
        assert!(Path::new(&path).exists());
        assert_eq!(downloader.calls(), 2);

        let state = cache.state();
        let entry = state.index.get(&key).unwrap();
        assert!(entry.created_at > Utc::now() - Duration::minutes(1));
        assert_eq!(entry.access_count, 1);
        assert_eq!(state.counters.misses, 2);
    }

    #[tokio::test]
    async fn test_hit_not_recorded_for_replaced_entry() {
        let dir = tempdir().unwrap();
        let cache = cache_with(
            dir.path(),
            CacheConfig::default(),
            FakeDownloader::ok(),
            MemoryStore::new(),
        );

        let url = "https://x/a.jpg";
        let key = derive_key(url);
        cache.get_cached_image(url).await;
        assert!(cache.record_hit(&key, url).is_some());

        // Another reference took the slot between the file check and the touch
        cache.state().index.get_mut(&key).unwrap().remote_reference =
            "https://elsewhere/b.jpg".to_string();
        assert_eq!(cache.record_hit(&key, url), None);

        let state = cache.state();
        assert_eq!(state.counters.hits, 1);
        assert_eq!(state.index.get(&key).unwrap().access_count, 2);
    }

    #[tokio::test]
    async fn test_failed_download_keeps_colliding_file() {
        let dir = tempdir().unwrap();
        let store = MemoryStore::new();
        let keys = seed(dir.path(), &store, 1, 1);
        let downloader = FakeDownloader::status(500);
        let cache = cache_with(dir.path(), CacheConfig::default(), downloader.clone(), store);
        cache.initialize().await;

        // Move the seeded image into the slot `other` downloads into
        let other = "https://elsewhere/other.jpg";
        let other_key = derive_key(other);
        let slot = cache.cache_dir().join(format!("{other_key}.jpg"));
        {
            let mut state = cache.state();
            let mut entry = state.index.remove(&keys[0]).unwrap();
            std::fs::rename(&entry.local_path, &slot).unwrap();
            entry.local_path = slot.clone();
            state.index.put(other_key.clone(), entry);
        }

        assert_eq!(cache.get_cached_image(other).await, other);
        assert_eq!(downloader.calls(), 1);
        assert!(slot.exists());
        assert!(cache.state().index.get(&other_key).is_some());
    }
}
