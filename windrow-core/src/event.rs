//! Provider event types and the synchronous listener hub
//!
//! Providers publish two kinds of events: granular mutations (add, remove,
//! update) and wholesale refreshes. Listeners run synchronously on the
//! dispatching call stack, so wrapper layers can rewrite or suppress an
//! event before any downstream consumer observes it.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, PoisonError, RwLock};

use crate::provider::RowMetadata;

// =============================================================================
// MUTATION PAYLOADS
// =============================================================================

/// One block of a mutation event: the affected keys plus optional
/// positionally aligned rows, metadata, and absolute indexes.
///
/// Keys are unique within a block. When `data`, `metadata`, or `indexes`
/// are present they have the same length as `keys` and entry `i` of each
/// describes the same row.
#[derive(Debug, Clone, PartialEq)]
pub struct MutationDetail<K, D> {
    pub keys: Vec<K>,
    pub data: Option<Vec<D>>,
    pub metadata: Option<Vec<RowMetadata<K>>>,
    pub indexes: Option<Vec<usize>>,
}

impl<K, D> Default for MutationDetail<K, D> {
    fn default() -> Self {
        Self {
            keys: Vec::new(),
            data: None,
            metadata: None,
            indexes: None,
        }
    }
}

impl<K, D> MutationDetail<K, D> {
    /// Detail carrying keys only.
    pub fn with_keys(keys: Vec<K>) -> Self {
        Self {
            keys,
            ..Default::default()
        }
    }

    pub fn with_data(mut self, data: Vec<D>) -> Self {
        self.data = Some(data);
        self
    }

    pub fn with_metadata(mut self, metadata: Vec<RowMetadata<K>>) -> Self {
        self.metadata = Some(metadata);
        self
    }

    pub fn with_indexes(mut self, indexes: Vec<usize>) -> Self {
        self.indexes = Some(indexes);
        self
    }

    pub fn len(&self) -> usize {
        self.keys.len()
    }

    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }

    /// The index aligned with position `pos`, if indexes were provided.
    pub fn index_at(&self, pos: usize) -> Option<usize> {
        self.indexes.as_ref().and_then(|idx| idx.get(pos)).copied()
    }

    /// Keep only the entries whose key passes `keep`, preserving the
    /// positional alignment of `data`, `metadata`, and `indexes`.
    /// Returns `None` when no entry survives.
    pub fn filter_by_key(&self, keep: impl Fn(&K) -> bool) -> Option<Self>
    where
        K: Clone,
        D: Clone,
    {
        let kept: Vec<usize> = self
            .keys
            .iter()
            .enumerate()
            .filter(|(_, key)| keep(key))
            .map(|(pos, _)| pos)
            .collect();
        if kept.is_empty() {
            return None;
        }
        if kept.len() == self.keys.len() {
            return Some(self.clone());
        }
        fn pick<T: Clone>(source: &[T], kept: &[usize]) -> Vec<T> {
            kept.iter().map(|&pos| source[pos].clone()).collect()
        }
        Some(Self {
            keys: pick(&self.keys, &kept),
            data: self.data.as_deref().map(|d| pick(d, &kept)),
            metadata: self.metadata.as_deref().map(|m| pick(m, &kept)),
            indexes: self.indexes.as_deref().map(|i| pick(i, &kept)),
        })
    }
}

/// A batch of mutations observed in one pass over the underlying data.
#[derive(Debug, Clone, PartialEq)]
pub struct MutationEvent<K, D> {
    pub add: Option<MutationDetail<K, D>>,
    pub remove: Option<MutationDetail<K, D>>,
    pub update: Option<MutationDetail<K, D>>,
}

impl<K, D> Default for MutationEvent<K, D> {
    fn default() -> Self {
        Self {
            add: None,
            remove: None,
            update: None,
        }
    }
}

impl<K, D> MutationEvent<K, D> {
    pub fn with_add(mut self, detail: MutationDetail<K, D>) -> Self {
        self.add = Some(detail);
        self
    }

    pub fn with_remove(mut self, detail: MutationDetail<K, D>) -> Self {
        self.remove = Some(detail);
        self
    }

    pub fn with_update(mut self, detail: MutationDetail<K, D>) -> Self {
        self.update = Some(detail);
        self
    }

    /// True when no block carries any key. Empty events are not worth
    /// dispatching and filtering layers suppress them.
    pub fn is_empty(&self) -> bool {
        fn blank<K, D>(detail: &Option<MutationDetail<K, D>>) -> bool {
            detail.as_ref().map_or(true, MutationDetail::is_empty)
        }
        blank(&self.add) && blank(&self.remove) && blank(&self.update)
    }
}

/// Event published by a provider to its listeners.
#[derive(Debug, Clone, PartialEq)]
pub enum ProviderEvent<K, D> {
    /// Granular row changes.
    Mutate(MutationEvent<K, D>),
    /// The underlying data changed wholesale; all derived state is stale.
    Refresh,
}

// =============================================================================
// LISTENER HUB
// =============================================================================

/// Callback registered with a provider. Invoked synchronously on the
/// dispatching call stack; must not block.
pub type ProviderListener<K, D> = Arc<dyn Fn(&ProviderEvent<K, D>) + Send + Sync>;

/// Handle for removing a registered listener.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(u64);

/// Listener registry shared by every provider implementation.
///
/// Dispatch snapshots the listener list before invoking, so a handler may
/// register or remove listeners without deadlocking the hub. Listeners
/// added during a dispatch see only subsequent events.
pub struct EventHub<K, D> {
    listeners: RwLock<Vec<(ListenerId, ProviderListener<K, D>)>>,
    next_id: AtomicU64,
}

impl<K, D> EventHub<K, D> {
    pub fn new() -> Self {
        Self {
            listeners: RwLock::new(Vec::new()),
            next_id: AtomicU64::new(1),
        }
    }

    pub fn add_listener(&self, listener: ProviderListener<K, D>) -> ListenerId {
        let id = ListenerId(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.listeners
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .push((id, listener));
        id
    }

    /// Removes the listener; returns false when the id is unknown.
    pub fn remove_listener(&self, id: ListenerId) -> bool {
        let mut listeners = self
            .listeners
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        let before = listeners.len();
        listeners.retain(|(existing, _)| *existing != id);
        listeners.len() != before
    }

    /// Invokes every registered listener with `event`, in registration
    /// order, on the current call stack.
    pub fn dispatch(&self, event: &ProviderEvent<K, D>) {
        let snapshot: Vec<ProviderListener<K, D>> = self
            .listeners
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .map(|(_, listener)| Arc::clone(listener))
            .collect();
        for listener in snapshot {
            listener(event);
        }
    }

    pub fn len(&self) -> usize {
        self.listeners
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl<K, D> Default for EventHub<K, D> {
    fn default() -> Self {
        Self::new()
    }
}

impl<K, D> fmt::Debug for EventHub<K, D> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventHub")
            .field("listeners", &self.len())
            .finish()
    }
}

// =============================================================================
// TESTS
// =============================================================================


#[cfg(test)]
mod prop_tests {
    use super::*;
    use proptest::prelude::*;

    /// A detail whose data, metadata, and indexes (when present) are all
    /// derived from the key they sit next to, so any misalignment after
    /// filtering is detectable.
    fn arb_detail() -> impl Strategy<Value = MutationDetail<u32, String>> {
        (
            prop::collection::hash_set(0u32..100, 0..10),
            any::<bool>(),
            any::<bool>(),
            any::<bool>(),
        )
            .prop_map(|(keys, with_data, with_metadata, with_indexes)| {
                let keys: Vec<u32> = keys.into_iter().collect();
                let mut detail = MutationDetail::with_keys(keys.clone());
                if with_data {
                    detail = detail.with_data(keys.iter().map(|k| format!("data-{k}")).collect());
                }
                if with_metadata {
                    detail = detail.with_metadata(keys.iter().map(|k| RowMetadata::new(*k)).collect());
                }
                if with_indexes {
                    detail = detail.with_indexes(keys.iter().map(|k| *k as usize + 500).collect());
                }
                detail
            })
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(200))]

        /// Filtering keeps exactly the passing keys in order and never
        /// re-pairs a key with another entry's data, metadata, or index.
        #[test]
        fn prop_filter_by_key_preserves_alignment(
            detail in arb_detail(),
            keep in prop::collection::hash_set(0u32..100, 0..10),
        ) {
            let expected: Vec<u32> =
                detail.keys.iter().copied().filter(|k| keep.contains(k)).collect();
            match detail.filter_by_key(|key| keep.contains(key)) {
                None => prop_assert!(expected.is_empty()),
                Some(filtered) => {
                    prop_assert_eq!(&filtered.keys, &expected);
                    prop_assert_eq!(filtered.data.is_some(), detail.data.is_some());
                    prop_assert_eq!(filtered.metadata.is_some(), detail.metadata.is_some());
                    prop_assert_eq!(filtered.indexes.is_some(), detail.indexes.is_some());
                    if let Some(data) = &filtered.data {
                        for (key, value) in filtered.keys.iter().zip(data) {
                            prop_assert_eq!(value, &format!("data-{key}"));
                        }
                    }
                    if let Some(metadata) = &filtered.metadata {
                        for (key, meta) in filtered.keys.iter().zip(metadata) {
                            prop_assert_eq!(meta.key, *key);
                        }
                    }
                    if let Some(indexes) = &filtered.indexes {
                        for (key, index) in filtered.keys.iter().zip(indexes) {
                            prop_assert_eq!(*index, *key as usize + 500);
                        }
                    }
                }
            }
        }

        /// A predicate passing every key returns the detail unchanged.
        #[test]
        fn prop_filter_passing_everything_is_identity(detail in arb_detail()) {
            if detail.is_empty() {
                prop_assert!(detail.filter_by_key(|_| true).is_none());
            } else {
                prop_assert_eq!(detail.filter_by_key(|_| true), Some(detail));
            }
        }
    }
}
