//! Duplicate-key suppression for the iteration path
//!
//! Some backends page with overlap or re-serve rows after upstream
//! compaction. [`DedupDataProvider`] guarantees consumers see each key at
//! most once per iteration sequence, while still recording everything it
//! yields into the shared visited-row cache for the layers above it.

use std::collections::HashSet;
use std::sync::{Arc, Mutex, PoisonError};

use async_trait::async_trait;
use futures_util::StreamExt;
use windrow_core::{
    Capability, CapabilityKind, ContainsKeysParams, ContainsKeysResult, DataProvider,
    DedupCapability, DedupMode, EventHub, FetchByKeysParams, FetchByKeysResult,
    FetchByOffsetParams, FetchByOffsetResult, FetchFirstParams, IsEmptyStatus, ListenerId,
    PageStream, ProviderEvent, ProviderListener, ProviderResult, RowData, RowKey,
};

use crate::keyed::KeyedResultCache;

/// Wrapper that drops rows whose keys were already yielded by the same
/// iteration. Advertises `Dedup` at the `Iterator` mode; everything else
/// is forwarded to the base provider.
pub struct DedupDataProvider<K: RowKey, D: RowData> {
    inner: Arc<Inner<K, D>>,
}

struct Inner<K: RowKey, D: RowData> {
    base: Arc<dyn DataProvider<K, D>>,
    cache: Arc<KeyedResultCache<K, D>>,
    hub: EventHub<K, D>,
    base_listener: Mutex<Option<ListenerId>>,
}

impl<K: RowKey, D: RowData> DedupDataProvider<K, D> {
    pub fn new(base: Arc<dyn DataProvider<K, D>>) -> Self {
        Self::with_shared_cache(base, Arc::new(KeyedResultCache::new()))
    }

    /// Wraps `base`, recording the rows that survive deduplication into
    /// `cache`.
    pub fn with_shared_cache(
        base: Arc<dyn DataProvider<K, D>>,
        cache: Arc<KeyedResultCache<K, D>>,
    ) -> Self {
        let inner = Arc::new(Inner {
            base: Arc::clone(&base),
            cache,
            hub: EventHub::new(),
            base_listener: Mutex::new(None),
        });
        let weak = Arc::downgrade(&inner);
        let id = base.add_event_listener(Arc::new(move |event| {
            if let Some(inner) = weak.upgrade() {
                inner.on_base_event(event);
            }
        }));
        *inner
            .base_listener
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some(id);
        Self { inner }
    }

    /// The shared visited-row cache.
    pub fn cache(&self) -> Arc<KeyedResultCache<K, D>> {
        Arc::clone(&self.inner.cache)
    }
}

impl<K: RowKey, D: RowData> Inner<K, D> {
    fn on_base_event(&self, event: &ProviderEvent<K, D>) {
        match event {
            ProviderEvent::Refresh => self.cache.reset(),
            ProviderEvent::Mutate(mutation) => {
                if let Some(remove) = &mutation.remove {
                    self.cache.apply_remove_detail(remove);
                }
                if let Some(update) = &mutation.update {
                    self.cache.apply_update_detail(update);
                }
            }
        }
        self.hub.dispatch(event);
    }
}

#[async_trait]
impl<K: RowKey, D: RowData> DataProvider<K, D> for DedupDataProvider<K, D> {
    fn fetch_first(&self, params: FetchFirstParams) -> PageStream<K, D> {
        let stream = self.inner.base.fetch_first(params);
        let cache = Arc::clone(&self.inner.cache);
        // Duplicates are scoped to one iteration sequence, so the seen
        // set travels in the stream state. A second fetch_first starts
        // from an empty set and yields every key again.
        let seen: HashSet<K> = HashSet::new();
        Box::pin(futures_util::stream::unfold(
            (stream, cache, seen),
            |(mut stream, cache, mut seen)| async move {
                match stream.next().await {
                    Some(Ok(mut page)) => {
                        page.results.retain(|row| seen.insert(row.key().clone()));
                        cache.record(&page.results);
                        if page.done {
                            cache.mark_complete();
                        }
                        Some((Ok(page), (stream, cache, seen)))
                    }
                    Some(Err(err)) => Some((Err(err), (stream, cache, seen))),
                    None => None,
                }
            },
        ))
    }

    async fn fetch_by_offset(
        &self,
        params: FetchByOffsetParams,
    ) -> ProviderResult<FetchByOffsetResult<K, D>> {
        self.inner.base.fetch_by_offset(params).await
    }

    async fn fetch_by_keys(
        &self,
        params: FetchByKeysParams<K>,
    ) -> ProviderResult<FetchByKeysResult<K, D>> {
        self.inner.base.fetch_by_keys(params).await
    }

    async fn contains_keys(
        &self,
        params: ContainsKeysParams<K>,
    ) -> ProviderResult<ContainsKeysResult<K>> {
        self.inner.base.contains_keys(params).await
    }

    async fn total_size(&self) -> ProviderResult<Option<usize>> {
        self.inner.base.total_size().await
    }

    async fn is_empty(&self) -> ProviderResult<IsEmptyStatus> {
        self.inner.base.is_empty().await
    }

    fn capability(&self, kind: CapabilityKind) -> Option<Capability> {
        match kind {
            CapabilityKind::Dedup => Some(Capability::Dedup(DedupCapability {
                mode: DedupMode::Iterator,
            })),
            other => self.inner.base.capability(other),
        }
    }

    fn add_event_listener(&self, listener: ProviderListener<K, D>) -> ListenerId {
        self.inner.hub.add_listener(listener)
    }

    fn remove_event_listener(&self, id: ListenerId) -> bool {
        self.inner.hub.remove_listener(id)
    }
}

impl<K: RowKey, D: RowData> Drop for DedupDataProvider<K, D> {
    fn drop(&mut self) {
        let id = self
            .inner
            .base_listener
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(id) = id {
            self.inner.base.remove_event_listener(id);
        }
    }
}

// =============================================================================
// TESTS
// =============================================================================
