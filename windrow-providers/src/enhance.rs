//! Capability-driven composition
//!
//! `enhance` is the one entry point consumers are expected to call: it
//! compares a [`CapabilityRequest`] against what the provider already
//! advertises and wraps only the gaps, threading a single shared
//! visited-row cache through every layer that needs one. A provider that
//! satisfies the whole request is returned untouched.
//!
//! `enhance_tree` applies the same treatment to hierarchical providers,
//! enhancing each child provider lazily on first access.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};

use async_trait::async_trait;
use windrow_core::{
    advertised_dedup, advertised_event_filtering, advertised_fetch_by_offset,
    advertised_fetch_first, Capability, CapabilityKind, CapabilityRequest, ContainsKeysParams,
    ContainsKeysResult, DataProvider, EventHub, FetchByKeysParams, FetchByKeysResult,
    FetchByOffsetParams, FetchByOffsetResult, FetchFirstParams, IsEmptyStatus, ListenerId,
    PageStream, ProviderEvent, ProviderListener, ProviderResult, RowData, RowKey,
    TreeDataProvider,
};

use crate::caching::CachingDataProvider;
use crate::dedup::DedupDataProvider;
use crate::event_filter::MutateEventFilteringDataProvider;
use crate::iterator_caching::IteratorCachingDataProvider;
use crate::keyed::KeyedResultCache;

/// Wraps `provider` with exactly the layers `request` needs and the
/// provider does not already advertise.
///
/// Layer order, inside out: iteration caching, offset caching, dedup,
/// event filtering. When no layer is required the original `Arc` comes
/// back unchanged.
pub fn enhance<K: RowKey, D: RowData>(
    provider: Arc<dyn DataProvider<K, D>>,
    request: &CapabilityRequest,
) -> Arc<dyn DataProvider<K, D>> {
    let mut current = provider;
    let mut shared: Option<Arc<KeyedResultCache<K, D>>> = None;

    if let Some(wanted) = &request.fetch_first {
        let advertised = advertised_fetch_first(current.as_ref());
        let satisfied = advertised.caching.satisfies(wanted.caching)
            && advertised
                .total_filtered_row_count
                .satisfies(wanted.total_filtered_row_count);
        if wanted.force_local_caching || !satisfied {
            let cache = shared_cache(&mut shared);
            current = Arc::new(IteratorCachingDataProvider::with_shared_cache(
                current, cache,
            ));
        }
    }

    if let Some(wanted) = &request.fetch_by_offset {
        let advertised = advertised_fetch_by_offset(current.as_ref());
        if !advertised.caching.satisfies(wanted.caching) {
            current = Arc::new(CachingDataProvider::new(current));
        }
    }

    if let Some(wanted) = &request.dedup {
        if !advertised_dedup(current.as_ref()).mode.satisfies(wanted.mode) {
            let cache = shared_cache(&mut shared);
            current = Arc::new(DedupDataProvider::with_shared_cache(current, cache));
        }
    }

    if let Some(wanted) = &request.event_filtering {
        let advertised = advertised_event_filtering(current.as_ref());
        if !advertised.mode.satisfies(wanted.mode) {
            let cache = shared_cache(&mut shared);
            current = Arc::new(MutateEventFilteringDataProvider::with_shared_cache(
                current, cache,
            ));
        }
    }

    current
}

fn shared_cache<K: RowKey, D: RowData>(
    slot: &mut Option<Arc<KeyedResultCache<K, D>>>,
) -> Arc<KeyedResultCache<K, D>> {
    Arc::clone(slot.get_or_insert_with(|| Arc::new(KeyedResultCache::new())))
}

/// Enhances a hierarchical provider. The root's own rows go through the
/// same flat stack `enhance` builds; child providers are enhanced lazily
/// on first access and cached per parent key.
pub fn enhance_tree<K: RowKey, D: RowData>(
    provider: Arc<dyn TreeDataProvider<K, D>>,
    request: &CapabilityRequest,
) -> Arc<dyn TreeDataProvider<K, D>> {
    Arc::new(EnhancedTreeDataProvider::new(provider, request.clone()))
}

// =============================================================================
// TREE WRAPPER
// =============================================================================

/// Flat view over a tree provider's own rows. Lets the flat wrapper stack
/// compose over a tree without caring about child providers.
struct TreeHandle<K: RowKey, D: RowData> {
    tree: Arc<dyn TreeDataProvider<K, D>>,
}

#[async_trait]
impl<K: RowKey, D: RowData> DataProvider<K, D> for TreeHandle<K, D> {
    fn fetch_first(&self, params: FetchFirstParams) -> PageStream<K, D> {
        self.tree.fetch_first(params)
    }

    async fn fetch_by_offset(
        &self,
        params: FetchByOffsetParams,
    ) -> ProviderResult<FetchByOffsetResult<K, D>> {
        self.tree.fetch_by_offset(params).await
    }

    async fn fetch_by_keys(
        &self,
        params: FetchByKeysParams<K>,
    ) -> ProviderResult<FetchByKeysResult<K, D>> {
        self.tree.fetch_by_keys(params).await
    }

    async fn contains_keys(
        &self,
        params: ContainsKeysParams<K>,
    ) -> ProviderResult<ContainsKeysResult<K>> {
        self.tree.contains_keys(params).await
    }

    async fn total_size(&self) -> ProviderResult<Option<usize>> {
        self.tree.total_size().await
    }

    async fn is_empty(&self) -> ProviderResult<IsEmptyStatus> {
        self.tree.is_empty().await
    }

    fn capability(&self, kind: CapabilityKind) -> Option<Capability> {
        self.tree.capability(kind)
    }

    fn add_event_listener(&self, listener: ProviderListener<K, D>) -> ListenerId {
        self.tree.add_event_listener(listener)
    }

    fn remove_event_listener(&self, id: ListenerId) -> bool {
        self.tree.remove_event_listener(id)
    }
}

/// A tree provider whose own rows are served by an enhanced flat stack
/// and whose children are enhanced on demand.
///
/// Enhanced children are cached per parent key. A `remove` or `update`
/// naming a parent drops its cached child, `refresh` drops them all; the
/// next `child_provider` call rebuilds from the base tree.
pub struct EnhancedTreeDataProvider<K: RowKey, D: RowData> {
    inner: Arc<TreeInner<K, D>>,
}

type ChildMap<K, D> = Mutex<HashMap<K, Arc<dyn TreeDataProvider<K, D>>>>;

struct TreeInner<K: RowKey, D: RowData> {
    tree: Arc<dyn TreeDataProvider<K, D>>,
    flat: Arc<dyn DataProvider<K, D>>,
    request: CapabilityRequest,
    children: Arc<ChildMap<K, D>>,
    hub: EventHub<K, D>,
    tree_listener: Mutex<Option<ListenerId>>,
    flat_listener: Mutex<Option<ListenerId>>,
}

impl<K: RowKey, D: RowData> EnhancedTreeDataProvider<K, D> {
    pub fn new(tree: Arc<dyn TreeDataProvider<K, D>>, request: CapabilityRequest) -> Self {
        let handle: Arc<dyn DataProvider<K, D>> = Arc::new(TreeHandle {
            tree: Arc::clone(&tree),
        });
        let children: Arc<ChildMap<K, D>> = Arc::new(Mutex::new(HashMap::new()));

        // Invalidation watches the raw tree and registers before the flat
        // stack builds: a stale child is gone before any forwarded event
        // reaches a consumer, and a suppressed event still invalidates.
        let weak_children = Arc::downgrade(&children);
        let tree_id = tree.add_event_listener(Arc::new(move |event| {
            if let Some(children) = weak_children.upgrade() {
                invalidate_children(&children, event);
            }
        }));

        let flat = enhance(handle, &request);
        let inner = Arc::new(TreeInner {
            tree: Arc::clone(&tree),
            flat: Arc::clone(&flat),
            request,
            children,
            hub: EventHub::new(),
            tree_listener: Mutex::new(Some(tree_id)),
            flat_listener: Mutex::new(None),
        });

        // Forwarding watches the flat stack so consumers see the narrowed
        // version of each event.
        let weak = Arc::downgrade(&inner);
        let flat_id = flat.add_event_listener(Arc::new(move |event| {
            if let Some(inner) = weak.upgrade() {
                inner.hub.dispatch(event);
            }
        }));
        *inner
            .flat_listener
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some(flat_id);
        Self { inner }
    }
}

fn invalidate_children<K: RowKey, D: RowData>(
    children: &ChildMap<K, D>,
    event: &ProviderEvent<K, D>,
) {
    let mut children = children.lock().unwrap_or_else(PoisonError::into_inner);
    match event {
        ProviderEvent::Refresh => children.clear(),
        ProviderEvent::Mutate(mutation) => {
            for detail in [&mutation.remove, &mutation.update].into_iter().flatten() {
                for key in &detail.keys {
                    children.remove(key);
                }
            }
        }
    }
}

#[async_trait]
impl<K: RowKey, D: RowData> DataProvider<K, D> for EnhancedTreeDataProvider<K, D> {
    fn fetch_first(&self, params: FetchFirstParams) -> PageStream<K, D> {
        self.inner.flat.fetch_first(params)
    }

    async fn fetch_by_offset(
        &self,
        params: FetchByOffsetParams,
    ) -> ProviderResult<FetchByOffsetResult<K, D>> {
        self.inner.flat.fetch_by_offset(params).await
    }

    async fn fetch_by_keys(
        &self,
        params: FetchByKeysParams<K>,
    ) -> ProviderResult<FetchByKeysResult<K, D>> {
        self.inner.flat.fetch_by_keys(params).await
    }

    async fn contains_keys(
        &self,
        params: ContainsKeysParams<K>,
    ) -> ProviderResult<ContainsKeysResult<K>> {
        self.inner.flat.contains_keys(params).await
    }

    async fn total_size(&self) -> ProviderResult<Option<usize>> {
        self.inner.flat.total_size().await
    }

    async fn is_empty(&self) -> ProviderResult<IsEmptyStatus> {
        self.inner.flat.is_empty().await
    }

    fn capability(&self, kind: CapabilityKind) -> Option<Capability> {
        self.inner.flat.capability(kind)
    }

    fn add_event_listener(&self, listener: ProviderListener<K, D>) -> ListenerId {
        self.inner.hub.add_listener(listener)
    }

    fn remove_event_listener(&self, id: ListenerId) -> bool {
        self.inner.hub.remove_listener(id)
    }
}

impl<K: RowKey, D: RowData> TreeDataProvider<K, D> for EnhancedTreeDataProvider<K, D> {
    fn child_provider(&self, parent: &K) -> Option<Arc<dyn TreeDataProvider<K, D>>> {
        if let Some(child) = self
            .inner
            .children
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(parent)
        {
            return Some(Arc::clone(child));
        }
        // Built outside the lock; on a race the first insert wins.
        let raw = self.inner.tree.child_provider(parent)?;
        let enhanced = enhance_tree(raw, &self.inner.request);
        let mut children = self
            .inner
            .children
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        Some(Arc::clone(
            children.entry(parent.clone()).or_insert(enhanced),
        ))
    }
}

impl<K: RowKey, D: RowData> Drop for EnhancedTreeDataProvider<K, D> {
    fn drop(&mut self) {
        let tree_id = self
            .inner
            .tree_listener
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(id) = tree_id {
            self.inner.tree.remove_event_listener(id);
        }
        let flat_id = self
            .inner
            .flat_listener
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(id) = flat_id {
            self.inner.flat.remove_event_listener(id);
        }
    }
}

// =============================================================================
// TESTS
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use windrow_core::{
        CachingLevel, DedupCapability, DedupMode, DedupRequest, EventFilteringCapability,
        EventFilteringMode, FetchByOffsetCapability, FetchFirstCapability, FetchFirstRequest,
        RowCountPrecision,
    };
    use windrow_test_utils::{
        ArrayDataProvider, ArrayTreeDataProvider, CapabilityStubProvider, EventRecorder, TestRow,
    };

    fn fully_capable_stub() -> Arc<CapabilityStubProvider> {
        Arc::new(
            CapabilityStubProvider::with_rows(10)
                .advertise(Capability::FetchFirst(FetchFirstCapability {
                    caching: CachingLevel::All,
                    total_filtered_row_count: RowCountPrecision::Exact,
                }))
                .advertise(Capability::FetchByOffset(FetchByOffsetCapability {
                    caching: CachingLevel::All,
                }))
                .advertise(Capability::Dedup(DedupCapability {
                    mode: DedupMode::Global,
                }))
                .advertise(Capability::EventFiltering(EventFilteringCapability {
                    mode: EventFilteringMode::Global,
                })),
        )
    }

    #[tokio::test]
    async fn test_satisfied_request_returns_same_arc() {
        let provider: Arc<dyn DataProvider<u32, TestRow>> = fully_capable_stub();
        let enhanced = enhance(
            Arc::clone(&provider),
            &CapabilityRequest::for_virtualized_list(),
        );
        assert!(Arc::ptr_eq(&enhanced, &provider));
    }

    #[tokio::test]
    async fn test_empty_request_never_wraps() {
        let provider: Arc<dyn DataProvider<u32, TestRow>> =
            Arc::new(ArrayDataProvider::with_rows(10));
        let enhanced = enhance(Arc::clone(&provider), &CapabilityRequest::new());
        assert!(Arc::ptr_eq(&enhanced, &provider));
    }

    #[tokio::test]
    async fn test_bare_provider_gets_full_stack() {
        let provider: Arc<dyn DataProvider<u32, TestRow>> =
            Arc::new(ArrayDataProvider::with_rows(10));
        let enhanced = enhance(
            Arc::clone(&provider),
            &CapabilityRequest::for_virtualized_list(),
        );

        assert!(!Arc::ptr_eq(&enhanced, &provider));
        assert_eq!(
            enhanced.capability(CapabilityKind::FetchFirst),
            Some(Capability::FetchFirst(FetchFirstCapability {
                caching: CachingLevel::Visited,
                total_filtered_row_count: RowCountPrecision::Exact,
            }))
        );
        assert_eq!(
            enhanced.capability(CapabilityKind::FetchByOffset),
            Some(Capability::FetchByOffset(FetchByOffsetCapability {
                caching: CachingLevel::Visited,
            }))
        );
        assert_eq!(
            enhanced.capability(CapabilityKind::Dedup),
            Some(Capability::Dedup(DedupCapability {
                mode: DedupMode::Iterator,
            }))
        );
        assert_eq!(
            enhanced.capability(CapabilityKind::EventFiltering),
            Some(Capability::EventFiltering(EventFilteringCapability {
                mode: EventFilteringMode::Iterator,
            }))
        );
    }

    #[tokio::test]
    async fn test_partial_request_wraps_only_the_gap() {
        let provider: Arc<dyn DataProvider<u32, TestRow>> =
            Arc::new(ArrayDataProvider::with_rows(10));
        let enhanced = enhance(
            Arc::clone(&provider),
            &CapabilityRequest::new().with_dedup(DedupRequest {
                mode: DedupMode::Iterator,
            }),
        );

        assert!(!Arc::ptr_eq(&enhanced, &provider));
        assert_eq!(
            enhanced.capability(CapabilityKind::Dedup),
            Some(Capability::Dedup(DedupCapability {
                mode: DedupMode::Iterator,
            }))
        );
        // No caching layer was added, so the base's silence shows through.
        assert_eq!(enhanced.capability(CapabilityKind::FetchFirst), None);
    }

    #[tokio::test]
    async fn test_force_local_caching_overrides_advertisement() {
        let provider: Arc<dyn DataProvider<u32, TestRow>> = fully_capable_stub();
        let enhanced = enhance(
            Arc::clone(&provider),
            &CapabilityRequest::new().with_fetch_first(FetchFirstRequest {
                caching: CachingLevel::Visited,
                total_filtered_row_count: RowCountPrecision::Exact,
                force_local_caching: true,
            }),
        );
        assert!(!Arc::ptr_eq(&enhanced, &provider));
    }

    #[tokio::test]
    async fn test_filtering_layer_sees_rows_cached_by_lower_layers() {
        use futures_util::StreamExt;

        let array = Arc::new(ArrayDataProvider::with_rows(5));
        let enhanced = enhance(
            array.clone() as Arc<dyn DataProvider<u32, TestRow>>,
            &CapabilityRequest::for_virtualized_list(),
        );
        let recorder = EventRecorder::new();
        enhanced.add_event_listener(recorder.listener());

        let mut stream = enhanced.fetch_first(FetchFirstParams::default());
        while let Some(page) = stream.next().await {
            page.unwrap();
        }

        array.dispatch_mutation(
            windrow_core::MutationEvent::default()
                .with_remove(windrow_core::MutationDetail::with_keys(vec![2, 99])),
        );

        assert_eq!(recorder.len(), 1);
        match &recorder.events()[0] {
            ProviderEvent::Mutate(mutation) => {
                assert_eq!(mutation.remove.as_ref().unwrap().keys, vec![2]);
            }
            other => panic!("unexpected event: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_tree_children_enhanced_and_cached() {
        let tree = Arc::new(ArrayTreeDataProvider::with_rows(4));
        tree.add_child(1, Arc::new(ArrayTreeDataProvider::with_rows(3)));
        let enhanced = enhance_tree(
            tree as Arc<dyn TreeDataProvider<u32, TestRow>>,
            &CapabilityRequest::for_virtualized_list(),
        );

        let first = enhanced.child_provider(&1).unwrap();
        let second = enhanced.child_provider(&1).unwrap();
        assert!(Arc::ptr_eq(&first, &second));
        // The child went through the factory too.
        assert_eq!(
            first.capability(CapabilityKind::Dedup),
            Some(Capability::Dedup(DedupCapability {
                mode: DedupMode::Iterator,
            }))
        );
        assert!(enhanced.child_provider(&2).is_none());
    }

    #[tokio::test]
    async fn test_tree_child_invalidated_by_remove() {
        let tree = Arc::new(ArrayTreeDataProvider::with_rows(4));
        tree.add_child(1, Arc::new(ArrayTreeDataProvider::with_rows(3)));
        let enhanced = enhance_tree(
            tree.clone() as Arc<dyn TreeDataProvider<u32, TestRow>>,
            &CapabilityRequest::new(),
        );

        let before = enhanced.child_provider(&1).unwrap();
        tree.dispatch_mutation(
            windrow_core::MutationEvent::default()
                .with_remove(windrow_core::MutationDetail::with_keys(vec![1])),
        );
        let after = enhanced.child_provider(&1).unwrap();
        assert!(!Arc::ptr_eq(&before, &after));
    }

    #[tokio::test]
    async fn test_tree_refresh_drops_every_cached_child() {
        let tree = Arc::new(ArrayTreeDataProvider::with_rows(4));
        tree.add_child(0, Arc::new(ArrayTreeDataProvider::with_rows(2)));
        tree.add_child(1, Arc::new(ArrayTreeDataProvider::with_rows(2)));
        let enhanced = enhance_tree(
            tree.clone() as Arc<dyn TreeDataProvider<u32, TestRow>>,
            &CapabilityRequest::new(),
        );

        let zero = enhanced.child_provider(&0).unwrap();
        let one = enhanced.child_provider(&1).unwrap();
        tree.refresh(windrow_test_utils::test_rows(4));

        assert!(!Arc::ptr_eq(&zero, &enhanced.child_provider(&0).unwrap()));
        assert!(!Arc::ptr_eq(&one, &enhanced.child_provider(&1).unwrap()));
    }

    #[tokio::test]
    async fn test_tree_forwards_base_events() {
        let tree = Arc::new(ArrayTreeDataProvider::with_rows(4));
        let enhanced = enhance_tree(
            tree.clone() as Arc<dyn TreeDataProvider<u32, TestRow>>,
            &CapabilityRequest::new(),
        );
        let recorder = EventRecorder::new();
        enhanced.add_event_listener(recorder.listener());

        tree.dispatch_mutation(
            windrow_core::MutationEvent::default()
                .with_remove(windrow_core::MutationDetail::with_keys(vec![3])),
        );
        assert_eq!(recorder.len(), 1);
    }
}
