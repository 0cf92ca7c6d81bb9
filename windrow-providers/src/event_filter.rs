//! Mutation event narrowing
//!
//! A virtualized consumer only materializes the rows it has fetched, so a
//! mutation touching ten thousand keys it never saw is pure noise.
//! [`MutateEventFilteringDataProvider`] records every row its `fetch_first`
//! stream yields and narrows base `mutate` events to those keys before
//! forwarding. It is also the layer that honors `params.signal` on the
//! random-access fetches, racing the delegate against the abort.

use std::sync::{Arc, Mutex, PoisonError};

use async_trait::async_trait;
use futures_util::StreamExt;
use windrow_core::{
    Capability, CapabilityKind, ContainsKeysParams, ContainsKeysResult, DataProvider, EventHub,
    EventFilteringCapability, EventFilteringMode, FetchByKeysParams, FetchByKeysResult,
    FetchByOffsetParams, FetchByOffsetResult, FetchFirstParams, IsEmptyStatus, ListenerId,
    MutationEvent, PageStream, ProviderError, ProviderEvent, ProviderListener, ProviderResult,
    RowData, RowKey,
};

use crate::keyed::KeyedResultCache;

/// Wrapper that forwards only the mutation details affecting rows the
/// consumer has actually seen. `add` details always pass through; a
/// mutation left with nothing relevant is suppressed entirely.
pub struct MutateEventFilteringDataProvider<K: RowKey, D: RowData> {
    inner: Arc<Inner<K, D>>,
}

struct Inner<K: RowKey, D: RowData> {
    base: Arc<dyn DataProvider<K, D>>,
    cache: Arc<KeyedResultCache<K, D>>,
    hub: EventHub<K, D>,
    base_listener: Mutex<Option<ListenerId>>,
}

impl<K: RowKey, D: RowData> MutateEventFilteringDataProvider<K, D> {
    pub fn new(base: Arc<dyn DataProvider<K, D>>) -> Self {
        Self::with_shared_cache(base, Arc::new(KeyedResultCache::new()))
    }

    /// Wraps `base`, judging relevance against `cache`. In a composed
    /// stack this is the same cache the caching layers fill, so relevance
    /// covers everything the consumer fetched through any path.
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
            ProviderEvent::Refresh => {
                self.cache.reset();
                self.hub.dispatch(event);
            }
            ProviderEvent::Mutate(mutation) => match self.narrow(mutation) {
                Some(narrowed) => {
                    // Keep the visited set honest before listeners run:
                    // a removed key must not look relevant next time.
                    if let Some(remove) = &narrowed.remove {
                        self.cache.apply_remove_detail(remove);
                    }
                    if let Some(update) = &narrowed.update {
                        self.cache.apply_update_detail(update);
                    }
                    self.hub.dispatch(&ProviderEvent::Mutate(narrowed));
                }
                None => {
                    tracing::trace!("suppressed mutation touching no visited rows");
                }
            },
        }
    }

    /// Narrows `remove` and `update` to visited keys. Returns `None` when
    /// nothing relevant remains in any block.
    fn narrow(&self, mutation: &MutationEvent<K, D>) -> Option<MutationEvent<K, D>> {
        let remove = mutation
            .remove
            .as_ref()
            .and_then(|detail| detail.filter_by_key(|key| self.cache.contains(key)));
        let update = mutation
            .update
            .as_ref()
            .and_then(|detail| detail.filter_by_key(|key| self.cache.contains(key)));
        let add = mutation.add.clone().filter(|detail| !detail.is_empty());
        if add.is_none() && remove.is_none() && update.is_none() {
            return None;
        }
        Some(MutationEvent {
            add,
            remove,
            update,
        })
    }
}

#[async_trait]
impl<K: RowKey, D: RowData> DataProvider<K, D> for MutateEventFilteringDataProvider<K, D> {
    fn fetch_first(&self, params: FetchFirstParams) -> PageStream<K, D> {
        let stream = self.inner.base.fetch_first(params);
        let cache = Arc::clone(&self.inner.cache);
        Box::pin(futures_util::stream::unfold(
            (stream, cache),
            |(mut stream, cache)| async move {
                match stream.next().await {
                    Some(Ok(page)) => {
                        cache.record(&page.results);
                        if page.done {
                            cache.mark_complete();
                        }
                        Some((Ok(page), (stream, cache)))
                    }
                    Some(Err(err)) => Some((Err(err), (stream, cache))),
                    None => None,
                }
            },
        ))
    }

    async fn fetch_by_offset(
        &self,
        params: FetchByOffsetParams,
    ) -> ProviderResult<FetchByOffsetResult<K, D>> {
        match params.signal.clone() {
            Some(signal) => {
                if let Some(reason) = signal.abort_reason() {
                    return Err(ProviderError::aborted(reason));
                }
                // The delegate future is dropped on abort, not told to
                // stop; a backend past the point of no return completes
                // into the void.
                tokio::select! {
                    reason = signal.aborted() => Err(ProviderError::aborted(reason)),
                    result = self.inner.base.fetch_by_offset(params) => result,
                }
            }
            None => self.inner.base.fetch_by_offset(params).await,
        }
    }

    async fn fetch_by_keys(
        &self,
        params: FetchByKeysParams<K>,
    ) -> ProviderResult<FetchByKeysResult<K, D>> {
        match params.signal.clone() {
            Some(signal) => {
                if let Some(reason) = signal.abort_reason() {
                    return Err(ProviderError::aborted(reason));
                }
                tokio::select! {
                    reason = signal.aborted() => Err(ProviderError::aborted(reason)),
                    result = self.inner.base.fetch_by_keys(params) => result,
                }
            }
            None => self.inner.base.fetch_by_keys(params).await,
        }
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
            CapabilityKind::EventFiltering => {
                Some(Capability::EventFiltering(EventFilteringCapability {
                    mode: EventFilteringMode::Iterator,
                }))
            }
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

impl<K: RowKey, D: RowData> Drop for MutateEventFilteringDataProvider<K, D> {
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
