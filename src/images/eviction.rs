//! Eviction planning for the image cache.
//!
//! Planning is pure: it looks at the index and returns the keys to drop.
//! [`ImageCache`](super::ImageCache) applies the plan (file deletes,
//! index removal, one persist per batch).

use chrono::{DateTime, Duration, Utc};

use super::index::CacheEntry;

/// Keys selected for removal and the bytes they account for.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EvictionPlan {
    /// Keys to remove, least recently used first
    pub keys: Vec<String>,
    /// Sum of `size_bytes` over the selected entries
    pub bytes_freed: u64,
}

/// Outcome of a maintenance pass
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MaintenanceReport {
    /// Entries removed from the index
    pub removed: usize,
    /// Bytes accounted to those entries
    pub bytes_freed: u64,
}

/// Keys whose age exceeds `max_age`.
pub fn expired_keys<'a>(
    entries: impl IntoIterator<Item = (&'a String, &'a CacheEntry)>,
    now: DateTime<Utc>,
    max_age: Duration,
) -> Vec<String> {
    entries
        .into_iter()
        .filter(|(_, entry)| entry.is_expired(now, max_age))
        .map(|(key, _)| key.clone())
        .collect()
}

/// Pick least-recently-used entries until both budgets hold.
///
/// First removes enough entries to satisfy `max_items`, then keeps going
/// while the remaining total exceeds `max_bytes`.
pub fn plan_evictions<'a>(
    entries: impl IntoIterator<Item = (&'a String, &'a CacheEntry)>,
    max_bytes: u64,
    max_items: usize,
) -> EvictionPlan {
    let mut ordered: Vec<_> = entries.into_iter().collect();
    let mut total: u64 = ordered.iter().map(|(_, e)| e.size_bytes).sum();

    if total <= max_bytes && ordered.len() <= max_items {
        return EvictionPlan::default();
    }

    // Oldest access first; key breaks ties so plans are reproducible
    ordered.sort_by(|(ka, a), (kb, b)| {
        a.last_accessed_at
            .cmp(&b.last_accessed_at)
            .then_with(|| ka.cmp(kb))
    });

    let item_overage = ordered.len().saturating_sub(max_items);
    let mut plan = EvictionPlan::default();

    for (i, (key, entry)) in ordered.into_iter().enumerate() {
        if i >= item_overage && total <= max_bytes {
            break;
        }
        total -= entry.size_bytes;
        plan.bytes_freed += entry.size_bytes;
        plan.keys.push(key.clone());
    }

    plan
}
