//! Iteration result caching layer
//!
//! Wraps a base provider and records every row its `fetch_first` stream
//! yields into a shared [`KeyedResultCache`]. Key lookups are then served
//! from the cache first, with only the missing keys delegated. Once an
//! iteration completes, the visited count doubles as an exact total.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, PoisonError};

use async_trait::async_trait;
use futures_util::StreamExt;
use windrow_core::{
    Capability, CapabilityKind, CachingLevel, ContainsKeysParams, ContainsKeysResult,
    DataProvider, FetchByKeysParams, FetchByKeysResult, FetchByOffsetParams, FetchByOffsetResult,
    FetchFirstCapability, FetchFirstParams, IsEmptyStatus, ListenerId, PageStream, ProviderEvent,
    ProviderListener, ProviderResult, RowCountPrecision, RowData, RowItem, RowKey,
};
use windrow_core::EventHub;

use crate::keyed::KeyedResultCache;

/// Caching wrapper for the sequential-iteration path.
///
/// Advertises `fetch_first` caching at the `Visited` level with an exact
/// filtered row count; every other capability question is forwarded to
/// the base provider.
pub struct IteratorCachingDataProvider<K: RowKey, D: RowData> {
    inner: Arc<Inner<K, D>>,
}

struct Inner<K: RowKey, D: RowData> {
    base: Arc<dyn DataProvider<K, D>>,
    cache: Arc<KeyedResultCache<K, D>>,
    hub: EventHub<K, D>,
    base_listener: Mutex<Option<ListenerId>>,
}

impl<K: RowKey, D: RowData> IteratorCachingDataProvider<K, D> {
    /// Wraps `base` with a fresh visited-row cache.
    pub fn new(base: Arc<dyn DataProvider<K, D>>) -> Self {
        Self::with_shared_cache(base, Arc::new(KeyedResultCache::new()))
    }

    /// Wraps `base`, recording visited rows into `cache`. The composition
    /// factory threads one cache through every layer of a stack.
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
        // Weak back-reference: the base's hub must not keep this wrapper
        // alive after every consumer handle is gone.
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
                // Adds enter the cache only once iteration yields them.
            }
        }
        self.hub.dispatch(event);
    }
}

#[async_trait]
impl<K: RowKey, D: RowData> DataProvider<K, D> for IteratorCachingDataProvider<K, D> {
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
                    None => {
                        cache.mark_complete();
                        None
                    }
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
        let mut results = HashMap::with_capacity(params.keys.len());
        let mut missing: Vec<K> = Vec::new();
        for key in &params.keys {
            match self.inner.cache.get(key) {
                Some(row) => {
                    results.insert(key.clone(), row);
                }
                None => missing.push(key.clone()),
            }
        }
        if !missing.is_empty() {
            tracing::debug!(
                missing = missing.len(),
                requested = params.keys.len(),
                "delegating uncached keys"
            );
            let delegated = self
                .inner
                .base
                .fetch_by_keys(FetchByKeysParams {
                    keys: missing,
                    signal: params.signal.clone(),
                })
                .await?;
            let fetched: Vec<RowItem<K, D>> = delegated.results.values().cloned().collect();
            self.inner.cache.record(&fetched);
            results.extend(delegated.results);
        }
        Ok(FetchByKeysResult {
            fetch_parameters: params,
            results,
        })
    }

    async fn contains_keys(
        &self,
        params: ContainsKeysParams<K>,
    ) -> ProviderResult<ContainsKeysResult<K>> {
        let mut contains: HashSet<K> = HashSet::new();
        let mut missing: Vec<K> = Vec::new();
        for key in &params.keys {
            if self.inner.cache.contains(key) {
                contains.insert(key.clone());
            } else {
                missing.push(key.clone());
            }
        }
        if !missing.is_empty() {
            let delegated = self
                .inner
                .base
                .contains_keys(ContainsKeysParams::new(missing))
                .await?;
            contains.extend(delegated.contains);
        }
        Ok(ContainsKeysResult { contains })
    }

    async fn total_size(&self) -> ProviderResult<Option<usize>> {
        if self.inner.cache.is_complete() {
            Ok(Some(self.inner.cache.len()))
        } else {
            self.inner.base.total_size().await
        }
    }

    async fn is_empty(&self) -> ProviderResult<IsEmptyStatus> {
        if self.inner.cache.is_complete() {
            Ok(if self.inner.cache.len() == 0 {
                IsEmptyStatus::Empty
            } else {
                IsEmptyStatus::NotEmpty
            })
        } else {
            self.inner.base.is_empty().await
        }
    }

    fn capability(&self, kind: CapabilityKind) -> Option<Capability> {
        match kind {
            CapabilityKind::FetchFirst => Some(Capability::FetchFirst(FetchFirstCapability {
                caching: CachingLevel::Visited,
                total_filtered_row_count: RowCountPrecision::Exact,
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

impl<K: RowKey, D: RowData> Drop for IteratorCachingDataProvider<K, D> {
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
