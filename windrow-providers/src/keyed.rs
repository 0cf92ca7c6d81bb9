//! Key-indexed row cache shared across wrapper layers
//!
//! Records the rows a consumer has actually seen, keyed by row key. One
//! instance is shared (via `Arc`) between the iterator-caching, dedup, and
//! event-filtering layers of a wrapped stack so all three agree on the
//! visited set. Access is synchronous because event listeners run on the
//! dispatch call stack.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

use windrow_core::{MutationDetail, RowData, RowItem, RowKey};

/// Cumulative lookup counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct KeyedCacheStats {
    pub hits: u64,
    pub misses: u64,
}

impl KeyedCacheStats {
    pub fn hit_rate(&self) -> f64 {
        let total = self.hits + self.misses;
        if total == 0 {
            0.0
        } else {
            self.hits as f64 / total as f64
        }
    }
}

/// Visited-row cache. `complete` flips once an iteration sequence has
/// yielded its final page, at which point `len()` is an exact count of
/// the provider's rows.
pub struct KeyedResultCache<K, D> {
    rows: RwLock<HashMap<K, RowItem<K, D>>>,
    complete: AtomicBool,
    hits: AtomicU64,
    misses: AtomicU64,
}

impl<K: RowKey, D: RowData> KeyedResultCache<K, D> {
    pub fn new() -> Self {
        Self {
            rows: RwLock::new(HashMap::new()),
            complete: AtomicBool::new(false),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
        }
    }

    fn read(&self) -> RwLockReadGuard<'_, HashMap<K, RowItem<K, D>>> {
        self.rows.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, HashMap<K, RowItem<K, D>>> {
        self.rows.write().unwrap_or_else(PoisonError::into_inner)
    }

    /// Records yielded rows, overwriting earlier versions of the same key.
    pub fn record(&self, rows: &[RowItem<K, D>]) {
        if rows.is_empty() {
            return;
        }
        let mut map = self.write();
        for row in rows {
            map.insert(row.key().clone(), row.clone());
        }
    }

    /// Looks a row up, counting the outcome.
    pub fn get(&self, key: &K) -> Option<RowItem<K, D>> {
        let found = self.read().get(key).cloned();
        if found.is_some() {
            self.hits.fetch_add(1, Ordering::Relaxed);
        } else {
            self.misses.fetch_add(1, Ordering::Relaxed);
        }
        found
    }

    /// Membership check without touching the counters.
    pub fn contains(&self, key: &K) -> bool {
        self.read().contains_key(key)
    }

    /// Drops the row for `key`; returns whether it was present.
    pub fn remove(&self, key: &K) -> bool {
        self.write().remove(key).is_some()
    }

    /// Overwrites an already-seen row. Updates for rows the consumer has
    /// never seen are ignored so they don't enter the visited set.
    pub fn update(&self, row: RowItem<K, D>) -> bool {
        let mut map = self.write();
        match map.get_mut(row.key()) {
            Some(existing) => {
                *existing = row;
                true
            }
            None => false,
        }
    }

    /// Drops every key named by a remove block.
    pub fn apply_remove_detail(&self, detail: &MutationDetail<K, D>) {
        let mut map = self.write();
        for key in &detail.keys {
            map.remove(key);
        }
    }

    /// Applies an update block: rows that arrive with fresh data are
    /// overwritten in place, rows updated without data are dropped so a
    /// stale copy is never served.
    pub fn apply_update_detail(&self, detail: &MutationDetail<K, D>) {
        match &detail.data {
            Some(data) => {
                for (key, row) in detail.keys.iter().zip(data.iter()) {
                    self.update(RowItem::new(key.clone(), row.clone()));
                }
            }
            None => {
                let mut map = self.write();
                for key in &detail.keys {
                    map.remove(key);
                }
            }
        }
    }

    /// Clears the visited set. Lookup counters survive; they describe the
    /// cache's lifetime, not one iteration.
    pub fn reset(&self) {
        self.write().clear();
        self.complete.store(false, Ordering::Release);
    }

    pub fn len(&self) -> usize {
        self.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.read().is_empty()
    }

    pub fn mark_complete(&self) {
        self.complete.store(true, Ordering::Release);
    }

    pub fn is_complete(&self) -> bool {
        self.complete.load(Ordering::Acquire)
    }

    pub fn stats(&self) -> KeyedCacheStats {
        KeyedCacheStats {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
        }
    }
}

impl<K: RowKey, D: RowData> Default for KeyedResultCache<K, D> {
    fn default() -> Self {
        Self::new()
    }
}

impl<K, D> std::fmt::Debug for KeyedResultCache<K, D> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KeyedResultCache")
            .field("complete", &self.complete.load(Ordering::Relaxed))
            .finish_non_exhaustive()
    }
}

// =============================================================================
// TESTS
// =============================================================================
