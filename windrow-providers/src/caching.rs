//! Offset-based caching provider
//!
//! Serves `fetch_by_offset` from a [`WindowCache`] when the requested span
//! is fully covered, and otherwise fetches the whole span from the base
//! provider in one call. Partial coverage is deliberately treated as a
//! miss for the entire span; the alternative (stitching cached fragments
//! around a narrower fetch) costs more bookkeeping than it saves.
//!
//! Concurrent identical misses coalesce onto one in-flight base fetch.
//! Under the `Lru` eviction strategy a recalibration pass runs after every
//! fetch: cold distant ranges are purged and, when prefetch is enabled,
//! the gap ahead of the consumer's movement is refilled in the background.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use futures_util::future::{BoxFuture, FutureExt, Shared};
use futures_util::StreamExt;
use tokio::task::JoinHandle;
use windrow_core::{
    AbortSignal, CacheError, Capability, CapabilityKind, CachingLevel, ContainsKeysParams,
    ContainsKeysResult, DataProvider, EventHub, FetchByKeysParams, FetchByKeysResult,
    FetchByOffsetCapability, FetchByOffsetParams, FetchByOffsetResult, FetchFirstParams,
    IsEmptyStatus, ListenerId, PageStream, ProviderError, ProviderEvent, ProviderListener,
    ProviderResult,
};
use windrow_core::{RowData, RowKey};

use crate::window::{CacheOptions, EvictionStrategy, FetchDirection, WindowCache};

type SharedFetch = Shared<BoxFuture<'static, ProviderResult<()>>>;

/// Offset-caching wrapper around any [`DataProvider`].
///
/// Advertises `fetch_by_offset` caching at the `Visited` level. Base
/// fetch failures propagate unchanged; there is no retry and no
/// stale-data fallback.
pub struct CachingDataProvider<K: RowKey, D: RowData> {
    inner: Arc<CachingInner<K, D>>,
}

struct CachingInner<K: RowKey, D: RowData> {
    base: Arc<dyn DataProvider<K, D>>,
    options: CacheOptions,
    state: Mutex<CacheState<K, D>>,
    /// Spans currently being fetched from the base, shared so identical
    /// concurrent misses ride one call.
    inflight: Mutex<HashMap<(usize, usize), SharedFetch>>,
    hub: EventHub<K, D>,
    base_listener: Mutex<Option<ListenerId>>,
    prefetch_task: Mutex<Option<JoinHandle<()>>>,
}

struct CacheState<K, D> {
    window: WindowCache<K, D>,
    last_offset: usize,
}

impl<K: RowKey, D: RowData> CachingDataProvider<K, D> {
    pub fn new(base: Arc<dyn DataProvider<K, D>>) -> Self {
        Self::with_options(base, CacheOptions::default())
    }

    pub fn with_options(base: Arc<dyn DataProvider<K, D>>, options: CacheOptions) -> Self {
        let inner = Arc::new(CachingInner {
            base: Arc::clone(&base),
            options,
            state: Mutex::new(CacheState {
                window: WindowCache::new(),
                last_offset: 0,
            }),
            inflight: Mutex::new(HashMap::new()),
            hub: EventHub::new(),
            base_listener: Mutex::new(None),
            prefetch_task: Mutex::new(None),
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

    /// Detaches from the base provider and aborts any background
    /// prefetch. Safe to call more than once; `Drop` calls it too.
    pub fn destroy(&self) {
        let id = self
            .inner
            .base_listener
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(id) = id {
            self.inner.base.remove_event_listener(id);
        }
        let task = self
            .inner
            .prefetch_task
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(task) = task {
            task.abort();
        }
    }

    /// Waits for the most recently scheduled background prefetch to
    /// settle. For orderly shutdown and deterministic tests.
    pub async fn prefetch_settled(&self) {
        let task = self
            .inner
            .prefetch_task
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(task) = task {
            let _ = task.await;
        }
    }
}

impl<K: RowKey, D: RowData> CachingInner<K, D> {
    fn lock_state(&self) -> ProviderResult<MutexGuard<'_, CacheState<K, D>>> {
        self.state
            .lock()
            .map_err(|_| ProviderError::Cache(CacheError::LockPoisoned))
    }

    fn inflight(&self) -> MutexGuard<'_, HashMap<(usize, usize), SharedFetch>> {
        self.inflight.lock().unwrap_or_else(PoisonError::into_inner)
    }

    async fn fetch_offset(
        self: &Arc<Self>,
        params: FetchByOffsetParams,
    ) -> ProviderResult<FetchByOffsetResult<K, D>> {
        let span = (params.offset, params.end());
        let direction = {
            let mut state = self.lock_state()?;
            let direction = if params.offset <= state.last_offset {
                FetchDirection::Up
            } else {
                FetchDirection::Down
            };
            state.last_offset = params.offset;
            state.window.note_fetch_size(params.size);
            if state.window.is_in_cache(span.0, span.1) {
                state.window.note_hit(span.0, span.1);
                let results = state.window.slice(params.offset, params.size);
                drop(state);
                tracing::debug!(
                    offset = params.offset,
                    size = params.size,
                    "offset fetch served from cache"
                );
                self.recalibrate(span, direction);
                return Ok(FetchByOffsetResult {
                    results,
                    fetch_parameters: params,
                    done: false,
                });
            }
            direction
        };
        tracing::debug!(
            offset = params.offset,
            size = params.size,
            "offset fetch missed cache"
        );
        self.fetch_span(span, params.signal.clone()).await?;
        let results = {
            let state = self.lock_state()?;
            state.window.slice(params.offset, params.size)
        };
        self.recalibrate(span, direction);
        Ok(FetchByOffsetResult {
            results,
            fetch_parameters: params,
            done: false,
        })
    }

    /// Fetches `span` from the base into the window, coalescing onto an
    /// in-flight fetch that already covers it.
    async fn fetch_span(
        self: &Arc<Self>,
        span: (usize, usize),
        signal: Option<AbortSignal>,
    ) -> ProviderResult<()> {
        let covering = {
            let inflight = self.inflight();
            inflight
                .iter()
                .find(|((start, end), _)| *start <= span.0 && span.1 <= *end)
                .map(|(_, fetch)| fetch.clone())
        };
        if let Some(fetch) = covering {
            tracing::debug!(start = span.0, end = span.1, "riding in-flight fetch");
            fetch.await?;
            let covered = self.lock_state()?.window.is_in_cache(span.0, span.1);
            if covered {
                return Ok(());
            }
            // Coverage can have been lost to eviction in the meantime;
            // fall through to a fetch of our own.
        }
        {
            let mut state = self.lock_state()?;
            state.window.note_miss(span.0, span.1);
        }
        let fetch: SharedFetch = {
            let this = Arc::clone(self);
            async move {
                let result = this
                    .base
                    .fetch_by_offset(FetchByOffsetParams {
                        offset: span.0,
                        size: span.1 - span.0,
                        signal,
                    })
                    .await?;
                let mut state = this.lock_state()?;
                state.window.commit(span.0, &result.results);
                state.window.finish_span(span.0, span.1);
                if result.done {
                    state.window.set_done();
                }
                Ok(())
            }
            .boxed()
            .shared()
        };
        self.inflight().insert(span, fetch.clone());
        let outcome = fetch.await;
        self.inflight().remove(&span);
        outcome
    }

    /// Post-fetch eviction and prefetch pass. A no-op unless the `Lru`
    /// strategy is configured. Eviction runs before this call returns;
    /// the prefetch refill is fire and forget.
    fn recalibrate(self: &Arc<Self>, span: (usize, usize), direction: FetchDirection) {
        if self.options.eviction != EvictionStrategy::Lru {
            return;
        }
        let plan = {
            let Ok(mut state) = self.state.lock() else {
                return;
            };
            let purged = state
                .window
                .evict_distant(span.0, span.1, self.options.miss_threshold);
            if purged > 0 {
                tracing::debug!(purged, start = span.0, end = span.1, "purged distant ranges");
            }
            if self.options.prefetch {
                state.window.plan_prefetch(span.0, span.1, direction)
            } else {
                None
            }
        };
        if let Some((offset, size)) = plan {
            self.spawn_prefetch(offset, size);
        }
    }

    fn spawn_prefetch(self: &Arc<Self>, offset: usize, size: usize) {
        tracing::debug!(offset, size, "prefetching boundary gap");
        let this = Arc::clone(self);
        let handle = tokio::spawn(async move {
            match this
                .base
                .fetch_by_offset(FetchByOffsetParams::new(offset, size))
                .await
            {
                Ok(result) => {
                    if let Ok(mut state) = this.state.lock() {
                        state.window.commit(offset, &result.results);
                        state.window.finish_span(offset, offset + size);
                    }
                }
                Err(err) => {
                    // A failed prefetch only means the gap stays cold.
                    tracing::debug!(error = %err, offset, size, "prefetch failed");
                }
            }
        });
        let previous = self
            .prefetch_task
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .replace(handle);
        drop(previous);
    }

    fn on_base_event(&self, event: &ProviderEvent<K, D>) {
        if let Ok(mut state) = self.state.lock() {
            match event {
                ProviderEvent::Refresh => state.window.reset(),
                ProviderEvent::Mutate(mutation) => {
                    if let Some(remove) = &mutation.remove {
                        state.window.apply_remove(remove);
                    }
                    if let Some(add) = &mutation.add {
                        state.window.apply_add(add);
                    }
                    if let Some(update) = &mutation.update {
                        state.window.apply_update(update);
                    }
                }
            }
        }
        self.hub.dispatch(event);
    }
}

#[async_trait]
impl<K: RowKey, D: RowData> DataProvider<K, D> for CachingDataProvider<K, D> {
    /// Starts a fresh iteration: the window is reset and every yielded
    /// page is appended to it, so subsequent offset fetches over visited
    /// rows are cache hits.
    fn fetch_first(&self, params: FetchFirstParams) -> PageStream<K, D> {
        if let Ok(mut state) = self.inner.state.lock() {
            state.window.reset();
            state.last_offset = 0;
        }
        let stream = self.inner.base.fetch_first(params);
        let inner = Arc::clone(&self.inner);
        Box::pin(futures_util::stream::unfold(
            (stream, inner),
            |(mut stream, inner)| async move {
                match stream.next().await {
                    Some(Ok(page)) => {
                        if let Ok(mut state) = inner.state.lock() {
                            state.window.append_page(&page.results, page.done);
                        }
                        Some((Ok(page), (stream, inner)))
                    }
                    Some(Err(err)) => Some((Err(err), (stream, inner))),
                    None => {
                        if let Ok(mut state) = inner.state.lock() {
                            state.window.set_done();
                        }
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
        self.inner.fetch_offset(params).await
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
            CapabilityKind::FetchByOffset => {
                Some(Capability::FetchByOffset(FetchByOffsetCapability {
                    caching: CachingLevel::Visited,
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

impl<K: RowKey, D: RowData> Drop for CachingDataProvider<K, D> {
    fn drop(&mut self) {
        self.destroy();
    }
}

// =============================================================================
// TESTS
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use futures_util::StreamExt;
    use windrow_test_utils::{ArrayDataProvider, CountingDataProvider, TestRow};

    fn wrapped(
        rows: usize,
    ) -> (
        Arc<ArrayDataProvider<u32, TestRow>>,
        Arc<CountingDataProvider<u32, TestRow>>,
        CachingDataProvider<u32, TestRow>,
    ) {
        let array = Arc::new(ArrayDataProvider::with_rows(rows));
        let counting = Arc::new(CountingDataProvider::new(array.clone()));
        let caching = CachingDataProvider::new(counting.clone());
        (array, counting, caching)
    }

    #[tokio::test]
    async fn test_iteration_feeds_offset_cache() {
        let (_array, counting, caching) = wrapped(40);
        let mut stream = caching.fetch_first(FetchFirstParams::with_size(10));
        while let Some(page) = stream.next().await {
            page.unwrap();
        }
        let result = caching
            .fetch_by_offset(FetchByOffsetParams::new(5, 20))
            .await
            .unwrap();
        assert_eq!(result.results.len(), 20);
        assert_eq!(*result.results[0].key(), 5);
        // All rows were visited by the iteration; no offset call needed.
        assert_eq!(counting.fetch_by_offset_calls(), 0);
    }

    #[tokio::test]
    async fn test_new_iteration_resets_window() {
        let (_array, counting, caching) = wrapped(20);
        let mut stream = caching.fetch_first(FetchFirstParams::with_size(20));
        while let Some(page) = stream.next().await {
            page.unwrap();
        }
        assert_eq!(counting.fetch_by_offset_calls(), 0);

        // Starting another iteration throws the window away.
        let _abandoned = caching.fetch_first(FetchFirstParams::with_size(20));
        caching
            .fetch_by_offset(FetchByOffsetParams::new(0, 5))
            .await
            .unwrap();
        assert_eq!(counting.fetch_by_offset_calls(), 1);
    }

    #[tokio::test]
    async fn test_cached_results_report_done_false() {
        let (_array, _counting, caching) = wrapped(10);
        let first = caching
            .fetch_by_offset(FetchByOffsetParams::new(0, 10))
            .await
            .unwrap();
        let second = caching
            .fetch_by_offset(FetchByOffsetParams::new(0, 10))
            .await
            .unwrap();
        assert!(!first.done);
        assert!(!second.done);
    }

    #[tokio::test]
    async fn test_remove_mutation_splices_cached_window() {
        let (array, counting, caching) = wrapped(10);
        caching
            .fetch_by_offset(FetchByOffsetParams::new(0, 10))
            .await
            .unwrap();
        assert_eq!(counting.fetch_by_offset_calls(), 1);

        array.remove_row(2);
        let result = caching
            .fetch_by_offset(FetchByOffsetParams::new(0, 9))
            .await
            .unwrap();
        // Still served from cache, with the removed row spliced out.
        assert_eq!(counting.fetch_by_offset_calls(), 1);
        let keys: Vec<u32> = result.results.iter().map(|row| *row.key()).collect();
        assert_eq!(keys, vec![0, 1, 3, 4, 5, 6, 7, 8, 9]);
    }

    #[tokio::test]
    async fn test_refresh_event_invalidates_window() {
        let (array, counting, caching) = wrapped(10);
        caching
            .fetch_by_offset(FetchByOffsetParams::new(0, 5))
            .await
            .unwrap();
        assert_eq!(counting.fetch_by_offset_calls(), 1);

        array.refresh(windrow_test_utils::test_rows(10));
        caching
            .fetch_by_offset(FetchByOffsetParams::new(0, 5))
            .await
            .unwrap();
        assert_eq!(counting.fetch_by_offset_calls(), 2);
    }

    #[tokio::test]
    async fn test_destroy_detaches_listener() {
        let (array, _counting, caching) = wrapped(5);
        assert_eq!(array.listener_count(), 1);
        caching.destroy();
        assert_eq!(array.listener_count(), 0);
        // Idempotent.
        caching.destroy();
        assert_eq!(array.listener_count(), 0);
    }

    #[tokio::test]
    async fn test_advertises_visited_offset_caching() {
        let (_array, _counting, caching) = wrapped(5);
        match caching.capability(CapabilityKind::FetchByOffset) {
            Some(Capability::FetchByOffset(cap)) => {
                assert_eq!(cap.caching, CachingLevel::Visited);
            }
            other => panic!("unexpected capability: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_base_error_propagates_unchanged() {
        let array = Arc::new(ArrayDataProvider::with_rows(10));
        array.fail_next_fetch("backend unavailable");
        let caching = CachingDataProvider::new(array);
        let err = caching
            .fetch_by_offset(FetchByOffsetParams::new(0, 5))
            .await
            .unwrap_err();
        assert_eq!(err, ProviderError::fetch_failed("backend unavailable"));
    }
}
