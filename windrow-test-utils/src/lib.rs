//! windrow Test Utilities
//!
//! Centralized test infrastructure for the windrow workspace:
//! - Deterministic in-memory providers with full mutation support
//! - Instrumented wrappers for backing-call and event assertions
//! - Scripted providers for paging, stalling, and gating scenarios
//! - Proptest generators for rows and fetch sequences

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError, RwLock};

use async_trait::async_trait;
use tokio::sync::watch;
use windrow_core::{
    Capability, CapabilityKind, ContainsKeysParams, ContainsKeysResult, DataProvider, EventHub,
    FetchByKeysParams, FetchByKeysResult, FetchByOffsetParams, FetchByOffsetResult,
    FetchFirstParams, FetchPage, IsEmptyStatus, ListenerId, MutationDetail, MutationEvent,
    PageStream, ProviderError, ProviderEvent, ProviderListener, ProviderResult, RowData, RowItem,
    RowKey, TreeDataProvider,
};

const DEFAULT_PAGE_SIZE: usize = 25;

// ============================================================================
// FIXTURE ROWS
// ============================================================================

/// The row type most windrow tests run on.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TestRow {
    pub id: u32,
    pub label: String,
}

impl TestRow {
    pub fn new(id: u32, label: impl Into<String>) -> Self {
        Self {
            id,
            label: label.into(),
        }
    }
}

/// `count` rows with ids `0..count` and labels `row-<id>`.
pub fn test_rows(count: usize) -> Vec<TestRow> {
    (0..count as u32)
        .map(|id| TestRow::new(id, format!("row-{id}")))
        .collect()
}

// ============================================================================
// ARRAY PROVIDER
// ============================================================================

/// Deterministic in-memory provider over a row vector and key extractor.
///
/// Implements the whole contract, advertises no optimization capability
/// (so the composition factory always wraps it), and exposes mutation
/// helpers that edit the backing vector and dispatch the matching event.
pub struct ArrayDataProvider<K: RowKey, D: RowData> {
    rows: RwLock<Vec<RowItem<K, D>>>,
    key_of: Box<dyn Fn(&D) -> K + Send + Sync>,
    page_size: usize,
    hub: EventHub<K, D>,
    fail_next: Mutex<Option<String>>,
}

impl<K: RowKey, D: RowData> ArrayDataProvider<K, D> {
    pub fn new(rows: Vec<D>, key_of: impl Fn(&D) -> K + Send + Sync + 'static) -> Self {
        let items = rows
            .into_iter()
            .map(|row| {
                let key = key_of(&row);
                RowItem::new(key, row)
            })
            .collect();
        Self {
            rows: RwLock::new(items),
            key_of: Box::new(key_of),
            page_size: DEFAULT_PAGE_SIZE,
            hub: EventHub::new(),
            fail_next: Mutex::new(None),
        }
    }

    pub fn with_page_size(mut self, size: usize) -> Self {
        self.page_size = size.max(1);
        self
    }

    pub fn len(&self) -> usize {
        self.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn listener_count(&self) -> usize {
        self.hub.len()
    }

    /// Makes the next fetch operation fail once with the given reason.
    pub fn fail_next_fetch(&self, reason: &str) {
        *self
            .fail_next
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some(reason.to_owned());
    }

    /// Removes the row at `index` and dispatches the remove event.
    pub fn remove_row(&self, index: usize) {
        let removed = self.write().remove(index);
        let detail = MutationDetail::with_keys(vec![removed.key().clone()])
            .with_indexes(vec![index]);
        self.dispatch_mutation(MutationEvent::default().with_remove(detail));
    }

    /// Replaces the row at `index` and dispatches the update event.
    pub fn update_row(&self, index: usize, row: D) {
        let key = (self.key_of)(&row);
        self.write()[index] = RowItem::new(key.clone(), row.clone());
        let detail = MutationDetail::with_keys(vec![key])
            .with_data(vec![row])
            .with_indexes(vec![index]);
        self.dispatch_mutation(MutationEvent::default().with_update(detail));
    }

    /// Inserts a row at `index` and dispatches the add event.
    pub fn insert_row(&self, index: usize, row: D) {
        let key = (self.key_of)(&row);
        self.write().insert(index, RowItem::new(key.clone(), row.clone()));
        let detail = MutationDetail::with_keys(vec![key])
            .with_data(vec![row])
            .with_indexes(vec![index]);
        self.dispatch_mutation(MutationEvent::default().with_add(detail));
    }

    /// Replaces the whole backing vector and dispatches `Refresh`.
    pub fn refresh(&self, rows: Vec<D>) {
        let items = rows
            .into_iter()
            .map(|row| {
                let key = (self.key_of)(&row);
                RowItem::new(key, row)
            })
            .collect();
        *self.write() = items;
        self.hub.dispatch(&ProviderEvent::Refresh);
    }

    /// Dispatches an arbitrary mutation event without touching the rows.
    pub fn dispatch_mutation(&self, event: MutationEvent<K, D>) {
        self.hub.dispatch(&ProviderEvent::Mutate(event));
    }

    fn read(&self) -> std::sync::RwLockReadGuard<'_, Vec<RowItem<K, D>>> {
        self.rows.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> std::sync::RwLockWriteGuard<'_, Vec<RowItem<K, D>>> {
        self.rows.write().unwrap_or_else(PoisonError::into_inner)
    }

    fn take_failure(&self) -> Option<ProviderError> {
        self.fail_next
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
            .map(ProviderError::fetch_failed)
    }
}

impl ArrayDataProvider<u32, TestRow> {
    /// `count` sequential [`TestRow`]s keyed by id.
    pub fn with_rows(count: usize) -> Self {
        Self::new(test_rows(count), |row| row.id)
    }
}

#[async_trait]
impl<K: RowKey, D: RowData> DataProvider<K, D> for ArrayDataProvider<K, D> {
    fn fetch_first(&self, params: FetchFirstParams) -> PageStream<K, D> {
        if let Some(err) = self.take_failure() {
            return Box::pin(tokio_stream::iter(vec![Err(err)]));
        }
        let size = params.size.unwrap_or(self.page_size).max(1);
        let rows = self.read().clone();
        let mut pages: Vec<ProviderResult<FetchPage<K, D>>> = rows
            .chunks(size)
            .map(|chunk| Ok(FetchPage::new(chunk.to_vec(), false)))
            .collect();
        match pages.last_mut() {
            Some(Ok(page)) => page.done = true,
            _ => pages.push(Ok(FetchPage::new(Vec::new(), true))),
        }
        Box::pin(tokio_stream::iter(pages))
    }

    async fn fetch_by_offset(
        &self,
        params: FetchByOffsetParams,
    ) -> ProviderResult<FetchByOffsetResult<K, D>> {
        if let Some(err) = self.take_failure() {
            return Err(err);
        }
        let rows = self.read();
        let start = params.offset.min(rows.len());
        let end = params.offset.saturating_add(params.size).min(rows.len());
        let results = rows[start..end].to_vec();
        let done = end >= rows.len();
        drop(rows);
        Ok(FetchByOffsetResult {
            fetch_parameters: params,
            results,
            done,
        })
    }

    async fn fetch_by_keys(
        &self,
        params: FetchByKeysParams<K>,
    ) -> ProviderResult<FetchByKeysResult<K, D>> {
        if let Some(err) = self.take_failure() {
            return Err(err);
        }
        let rows = self.read();
        let mut results = HashMap::new();
        for key in &params.keys {
            if let Some(row) = rows.iter().find(|item| item.key() == key) {
                results.insert(key.clone(), row.clone());
            }
        }
        drop(rows);
        Ok(FetchByKeysResult {
            fetch_parameters: params,
            results,
        })
    }

    async fn total_size(&self) -> ProviderResult<Option<usize>> {
        Ok(Some(self.read().len()))
    }

    async fn is_empty(&self) -> ProviderResult<IsEmptyStatus> {
        Ok(if self.read().is_empty() {
            IsEmptyStatus::Empty
        } else {
            IsEmptyStatus::NotEmpty
        })
    }

    fn add_event_listener(&self, listener: ProviderListener<K, D>) -> ListenerId {
        self.hub.add_listener(listener)
    }

    fn remove_event_listener(&self, id: ListenerId) -> bool {
        self.hub.remove_listener(id)
    }
}

// ============================================================================
// TREE PROVIDER
// ============================================================================

/// In-memory tree provider: an [`ArrayDataProvider`] for its own rows plus
/// an explicit child map.
pub struct ArrayTreeDataProvider {
    rows: ArrayDataProvider<u32, TestRow>,
    children: Mutex<HashMap<u32, Arc<ArrayTreeDataProvider>>>,
}

impl ArrayTreeDataProvider {
    pub fn with_rows(count: usize) -> Self {
        Self {
            rows: ArrayDataProvider::with_rows(count),
            children: Mutex::new(HashMap::new()),
        }
    }

    pub fn add_child(&self, parent: u32, child: Arc<ArrayTreeDataProvider>) {
        self.children
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(parent, child);
    }

    pub fn dispatch_mutation(&self, event: MutationEvent<u32, TestRow>) {
        self.rows.dispatch_mutation(event);
    }

    pub fn refresh(&self, rows: Vec<TestRow>) {
        self.rows.refresh(rows);
    }

    pub fn listener_count(&self) -> usize {
        self.rows.listener_count()
    }
}

#[async_trait]
impl DataProvider<u32, TestRow> for ArrayTreeDataProvider {
    fn fetch_first(&self, params: FetchFirstParams) -> PageStream<u32, TestRow> {
        self.rows.fetch_first(params)
    }

    async fn fetch_by_offset(
        &self,
        params: FetchByOffsetParams,
    ) -> ProviderResult<FetchByOffsetResult<u32, TestRow>> {
        self.rows.fetch_by_offset(params).await
    }

    async fn fetch_by_keys(
        &self,
        params: FetchByKeysParams<u32>,
    ) -> ProviderResult<FetchByKeysResult<u32, TestRow>> {
        self.rows.fetch_by_keys(params).await
    }

    async fn total_size(&self) -> ProviderResult<Option<usize>> {
        self.rows.total_size().await
    }

    async fn is_empty(&self) -> ProviderResult<IsEmptyStatus> {
        DataProvider::is_empty(&self.rows).await
    }

    fn add_event_listener(&self, listener: ProviderListener<u32, TestRow>) -> ListenerId {
        self.rows.add_event_listener(listener)
    }

    fn remove_event_listener(&self, id: ListenerId) -> bool {
        self.rows.remove_event_listener(id)
    }
}

impl TreeDataProvider<u32, TestRow> for ArrayTreeDataProvider {
    fn child_provider(&self, parent: &u32) -> Option<Arc<dyn TreeDataProvider<u32, TestRow>>> {
        self.children
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(parent)
            .cloned()
            .map(|child| child as Arc<dyn TreeDataProvider<u32, TestRow>>)
    }
}

// ============================================================================
// INSTRUMENTED WRAPPERS
// ============================================================================

/// Transparent wrapper counting how often each fetch style reaches the
/// wrapped provider.
pub struct CountingDataProvider<K: RowKey, D: RowData> {
    inner: Arc<dyn DataProvider<K, D>>,
    first_calls: AtomicUsize,
    offset_calls: AtomicUsize,
    keys_calls: AtomicUsize,
}

impl<K: RowKey, D: RowData> CountingDataProvider<K, D> {
    pub fn new(inner: Arc<dyn DataProvider<K, D>>) -> Self {
        Self {
            inner,
            first_calls: AtomicUsize::new(0),
            offset_calls: AtomicUsize::new(0),
            keys_calls: AtomicUsize::new(0),
        }
    }

    pub fn fetch_first_calls(&self) -> usize {
        self.first_calls.load(Ordering::SeqCst)
    }

    pub fn fetch_by_offset_calls(&self) -> usize {
        self.offset_calls.load(Ordering::SeqCst)
    }

    pub fn fetch_by_keys_calls(&self) -> usize {
        self.keys_calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl<K: RowKey, D: RowData> DataProvider<K, D> for CountingDataProvider<K, D> {
    fn fetch_first(&self, params: FetchFirstParams) -> PageStream<K, D> {
        self.first_calls.fetch_add(1, Ordering::SeqCst);
        self.inner.fetch_first(params)
    }

    async fn fetch_by_offset(
        &self,
        params: FetchByOffsetParams,
    ) -> ProviderResult<FetchByOffsetResult<K, D>> {
        self.offset_calls.fetch_add(1, Ordering::SeqCst);
        self.inner.fetch_by_offset(params).await
    }

    async fn fetch_by_keys(
        &self,
        params: FetchByKeysParams<K>,
    ) -> ProviderResult<FetchByKeysResult<K, D>> {
        self.keys_calls.fetch_add(1, Ordering::SeqCst);
        self.inner.fetch_by_keys(params).await
    }

    async fn contains_keys(
        &self,
        params: ContainsKeysParams<K>,
    ) -> ProviderResult<ContainsKeysResult<K>> {
        self.inner.contains_keys(params).await
    }

    async fn total_size(&self) -> ProviderResult<Option<usize>> {
        self.inner.total_size().await
    }

    async fn is_empty(&self) -> ProviderResult<IsEmptyStatus> {
        self.inner.is_empty().await
    }

    fn capability(&self, kind: CapabilityKind) -> Option<Capability> {
        self.inner.capability(kind)
    }

    fn add_event_listener(&self, listener: ProviderListener<K, D>) -> ListenerId {
        self.inner.add_event_listener(listener)
    }

    fn remove_event_listener(&self, id: ListenerId) -> bool {
        self.inner.remove_event_listener(id)
    }
}

/// Collects every event a provider dispatches.
pub struct EventRecorder<K, D> {
    events: Arc<Mutex<Vec<ProviderEvent<K, D>>>>,
}

impl<K: RowKey, D: RowData> EventRecorder<K, D> {
    pub fn new() -> Self {
        Self {
            events: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// A listener that appends every event to this recorder.
    pub fn listener(&self) -> ProviderListener<K, D> {
        let events = Arc::clone(&self.events);
        Arc::new(move |event| {
            events
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .push(event.clone());
        })
    }

    pub fn events(&self) -> Vec<ProviderEvent<K, D>> {
        self.events
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn len(&self) -> usize {
        self.events
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn clear(&self) {
        self.events
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
    }
}

impl<K: RowKey, D: RowData> Default for EventRecorder<K, D> {
    fn default() -> Self {
        Self::new()
    }
}

// ============================================================================
// SCRIPTED PROVIDERS
// ============================================================================

/// Yields exactly the given pages from `fetch_first`, duplicates and all.
/// Offset and key fetches see the concatenation of the pages.
pub struct PagedStubProvider<K: RowKey, D: RowData> {
    pages: Vec<Vec<RowItem<K, D>>>,
    hub: EventHub<K, D>,
}

impl<K: RowKey, D: RowData> PagedStubProvider<K, D> {
    pub fn new(pages: Vec<Vec<RowItem<K, D>>>) -> Self {
        Self {
            pages,
            hub: EventHub::new(),
        }
    }

    fn flat(&self) -> Vec<RowItem<K, D>> {
        self.pages.iter().flatten().cloned().collect()
    }
}

#[async_trait]
impl<K: RowKey, D: RowData> DataProvider<K, D> for PagedStubProvider<K, D> {
    fn fetch_first(&self, _params: FetchFirstParams) -> PageStream<K, D> {
        let last = self.pages.len().saturating_sub(1);
        let mut pages: Vec<ProviderResult<FetchPage<K, D>>> = self
            .pages
            .iter()
            .enumerate()
            .map(|(pos, page)| Ok(FetchPage::new(page.clone(), pos == last)))
            .collect();
        if pages.is_empty() {
            pages.push(Ok(FetchPage::new(Vec::new(), true)));
        }
        Box::pin(tokio_stream::iter(pages))
    }

    async fn fetch_by_offset(
        &self,
        params: FetchByOffsetParams,
    ) -> ProviderResult<FetchByOffsetResult<K, D>> {
        let flat = self.flat();
        let start = params.offset.min(flat.len());
        let end = params.offset.saturating_add(params.size).min(flat.len());
        let done = end >= flat.len();
        Ok(FetchByOffsetResult {
            fetch_parameters: params,
            results: flat[start..end].to_vec(),
            done,
        })
    }

    async fn fetch_by_keys(
        &self,
        params: FetchByKeysParams<K>,
    ) -> ProviderResult<FetchByKeysResult<K, D>> {
        let flat = self.flat();
        let mut results = HashMap::new();
        for key in &params.keys {
            if let Some(row) = flat.iter().find(|item| item.key() == key) {
                results.insert(key.clone(), row.clone());
            }
        }
        Ok(FetchByKeysResult {
            fetch_parameters: params,
            results,
        })
    }

    async fn total_size(&self) -> ProviderResult<Option<usize>> {
        Ok(Some(self.pages.iter().map(Vec::len).sum()))
    }

    async fn is_empty(&self) -> ProviderResult<IsEmptyStatus> {
        Ok(if self.pages.iter().all(Vec::is_empty) {
            IsEmptyStatus::Empty
        } else {
            IsEmptyStatus::NotEmpty
        })
    }

    fn add_event_listener(&self, listener: ProviderListener<K, D>) -> ListenerId {
        self.hub.add_listener(listener)
    }

    fn remove_event_listener(&self, id: ListenerId) -> bool {
        self.hub.remove_listener(id)
    }
}

/// A provider whose fetches never resolve. For abort and cancellation
/// tests; metadata queries still answer so nothing hangs by accident.
pub struct StallingDataProvider<K: RowKey, D: RowData> {
    hub: EventHub<K, D>,
}

impl<K: RowKey, D: RowData> StallingDataProvider<K, D> {
    pub fn new() -> Self {
        Self {
            hub: EventHub::new(),
        }
    }
}

impl<K: RowKey, D: RowData> Default for StallingDataProvider<K, D> {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl<K: RowKey, D: RowData> DataProvider<K, D> for StallingDataProvider<K, D> {
    fn fetch_first(&self, _params: FetchFirstParams) -> PageStream<K, D> {
        Box::pin(futures_util::stream::pending())
    }

    async fn fetch_by_offset(
        &self,
        _params: FetchByOffsetParams,
    ) -> ProviderResult<FetchByOffsetResult<K, D>> {
        std::future::pending().await
    }

    async fn fetch_by_keys(
        &self,
        _params: FetchByKeysParams<K>,
    ) -> ProviderResult<FetchByKeysResult<K, D>> {
        std::future::pending().await
    }

    async fn total_size(&self) -> ProviderResult<Option<usize>> {
        Ok(None)
    }

    async fn is_empty(&self) -> ProviderResult<IsEmptyStatus> {
        Ok(IsEmptyStatus::Unknown)
    }

    fn add_event_listener(&self, listener: ProviderListener<K, D>) -> ListenerId {
        self.hub.add_listener(listener)
    }

    fn remove_event_listener(&self, id: ListenerId) -> bool {
        self.hub.remove_listener(id)
    }
}

/// Holds every `fetch_by_offset` at a gate until [`open`] is called,
/// counting how many began. Lets a test pile up concurrent fetches and
/// assert how many actually reached the backing provider.
///
/// [`open`]: GatedDataProvider::open
pub struct GatedDataProvider<K: RowKey, D: RowData> {
    inner: Arc<dyn DataProvider<K, D>>,
    gate: watch::Sender<bool>,
    started: AtomicUsize,
}

impl<K: RowKey, D: RowData> GatedDataProvider<K, D> {
    pub fn new(inner: Arc<dyn DataProvider<K, D>>) -> Self {
        let (gate, _rx) = watch::channel(false);
        Self {
            inner,
            gate,
            started: AtomicUsize::new(0),
        }
    }

    /// Releases every waiting fetch, and all future ones.
    pub fn open(&self) {
        self.gate.send_replace(true);
    }

    /// Offset fetches that have reached the gate so far.
    pub fn started_fetches(&self) -> usize {
        self.started.load(Ordering::SeqCst)
    }

    async fn wait_open(&self) {
        let mut rx = self.gate.subscribe();
        loop {
            if *rx.borrow_and_update() {
                return;
            }
            if rx.changed().await.is_err() {
                return;
            }
        }
    }
}

#[async_trait]
impl<K: RowKey, D: RowData> DataProvider<K, D> for GatedDataProvider<K, D> {
    fn fetch_first(&self, params: FetchFirstParams) -> PageStream<K, D> {
        self.inner.fetch_first(params)
    }

    async fn fetch_by_offset(
        &self,
        params: FetchByOffsetParams,
    ) -> ProviderResult<FetchByOffsetResult<K, D>> {
        self.started.fetch_add(1, Ordering::SeqCst);
        self.wait_open().await;
        self.inner.fetch_by_offset(params).await
    }

    async fn fetch_by_keys(
        &self,
        params: FetchByKeysParams<K>,
    ) -> ProviderResult<FetchByKeysResult<K, D>> {
        self.inner.fetch_by_keys(params).await
    }

    async fn total_size(&self) -> ProviderResult<Option<usize>> {
        self.inner.total_size().await
    }

    async fn is_empty(&self) -> ProviderResult<IsEmptyStatus> {
        self.inner.is_empty().await
    }

    fn capability(&self, kind: CapabilityKind) -> Option<Capability> {
        self.inner.capability(kind)
    }

    fn add_event_listener(&self, listener: ProviderListener<K, D>) -> ListenerId {
        self.inner.add_event_listener(listener)
    }

    fn remove_event_listener(&self, id: ListenerId) -> bool {
        self.inner.remove_event_listener(id)
    }
}

/// Provider with injectable capability advertisements, for factory
/// decision-table tests. Data operations come from an in-memory array.
pub struct CapabilityStubProvider {
    inner: ArrayDataProvider<u32, TestRow>,
    caps: HashMap<CapabilityKind, Capability>,
}

impl CapabilityStubProvider {
    pub fn with_rows(count: usize) -> Self {
        Self {
            inner: ArrayDataProvider::with_rows(count),
            caps: HashMap::new(),
        }
    }

    /// Stores `cap` under its natural kind.
    pub fn advertise(mut self, cap: Capability) -> Self {
        let kind = match cap {
            Capability::FetchFirst(_) => CapabilityKind::FetchFirst,
            Capability::FetchByOffset(_) => CapabilityKind::FetchByOffset,
            Capability::Fetch(_) => CapabilityKind::Fetch,
            Capability::Dedup(_) => CapabilityKind::Dedup,
            Capability::EventFiltering(_) => CapabilityKind::EventFiltering,
        };
        self.caps.insert(kind, cap);
        self
    }
}

#[async_trait]
impl DataProvider<u32, TestRow> for CapabilityStubProvider {
    fn fetch_first(&self, params: FetchFirstParams) -> PageStream<u32, TestRow> {
        self.inner.fetch_first(params)
    }

    async fn fetch_by_offset(
        &self,
        params: FetchByOffsetParams,
    ) -> ProviderResult<FetchByOffsetResult<u32, TestRow>> {
        self.inner.fetch_by_offset(params).await
    }

    async fn fetch_by_keys(
        &self,
        params: FetchByKeysParams<u32>,
    ) -> ProviderResult<FetchByKeysResult<u32, TestRow>> {
        self.inner.fetch_by_keys(params).await
    }

    async fn total_size(&self) -> ProviderResult<Option<usize>> {
        self.inner.total_size().await
    }

    async fn is_empty(&self) -> ProviderResult<IsEmptyStatus> {
        DataProvider::is_empty(&self.inner).await
    }

    fn capability(&self, kind: CapabilityKind) -> Option<Capability> {
        self.caps.get(&kind).copied()
    }

    fn add_event_listener(&self, listener: ProviderListener<u32, TestRow>) -> ListenerId {
        self.inner.add_event_listener(listener)
    }

    fn remove_event_listener(&self, id: ListenerId) -> bool {
        self.inner.remove_event_listener(id)
    }
}

// ============================================================================
// GENERATORS
// ============================================================================

pub mod generators {
    use proptest::prelude::*;

    use super::TestRow;

    pub fn arb_row_count() -> impl Strategy<Value = usize> {
        0usize..=160
    }

    pub fn arb_test_row() -> impl Strategy<Value = TestRow> {
        (any::<u32>(), "[a-z]{1,12}").prop_map(|(id, label)| TestRow { id, label })
    }

    /// Sequences of `(offset, size)` fetch calls against a source of up to
    /// a few hundred rows.
    pub fn arb_fetch_spans() -> impl Strategy<Value = Vec<(usize, usize)>> {
        prop::collection::vec((0usize..200, 1usize..40), 1..12)
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use futures_util::StreamExt;

    #[tokio::test]
    async fn test_array_provider_pages_with_done_flag() {
        let provider = ArrayDataProvider::with_rows(7).with_page_size(3);
        let mut stream = provider.fetch_first(FetchFirstParams::default());
        let mut sizes = Vec::new();
        let mut done_flags = Vec::new();
        while let Some(page) = stream.next().await {
            let page = page.unwrap();
            sizes.push(page.results.len());
            done_flags.push(page.done);
        }
        assert_eq!(sizes, vec![3, 3, 1]);
        assert_eq!(done_flags, vec![false, false, true]);
    }

    #[tokio::test]
    async fn test_array_provider_empty_yields_single_done_page() {
        let provider = ArrayDataProvider::with_rows(0);
        let mut stream = provider.fetch_first(FetchFirstParams::default());
        let page = stream.next().await.unwrap().unwrap();
        assert!(page.results.is_empty());
        assert!(page.done);
        assert!(stream.next().await.is_none());
    }

    #[tokio::test]
    async fn test_array_provider_offset_clamps_to_len() {
        let provider = ArrayDataProvider::with_rows(10);
        let result = provider
            .fetch_by_offset(FetchByOffsetParams::new(8, 5))
            .await
            .unwrap();
        assert_eq!(result.results.len(), 2);
        assert!(result.done);
    }

    #[tokio::test]
    async fn test_remove_row_dispatches_keyed_event() {
        let provider = ArrayDataProvider::with_rows(5);
        let recorder = EventRecorder::new();
        provider.add_event_listener(recorder.listener());

        provider.remove_row(1);
        assert_eq!(provider.len(), 4);
        match &recorder.events()[0] {
            ProviderEvent::Mutate(mutation) => {
                let remove = mutation.remove.as_ref().unwrap();
                assert_eq!(remove.keys, vec![1]);
                assert_eq!(remove.indexes, Some(vec![1]));
            }
            other => panic!("unexpected event: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_fail_next_fetch_fires_once() {
        let provider = ArrayDataProvider::with_rows(5);
        provider.fail_next_fetch("boom");
        assert!(provider
            .fetch_by_offset(FetchByOffsetParams::new(0, 5))
            .await
            .is_err());
        assert!(provider
            .fetch_by_offset(FetchByOffsetParams::new(0, 5))
            .await
            .is_ok());
    }

    #[tokio::test]
    async fn test_counting_provider_tallies_calls() {
        let array: Arc<dyn DataProvider<u32, TestRow>> =
            Arc::new(ArrayDataProvider::with_rows(5));
        let counting = CountingDataProvider::new(array);

        counting
            .fetch_by_offset(FetchByOffsetParams::new(0, 2))
            .await
            .unwrap();
        counting
            .fetch_by_keys(FetchByKeysParams::new(vec![1]))
            .await
            .unwrap();
        assert_eq!(counting.fetch_by_offset_calls(), 1);
        assert_eq!(counting.fetch_by_keys_calls(), 1);
        assert_eq!(counting.fetch_first_calls(), 0);
    }

    #[tokio::test]
    async fn test_gated_provider_blocks_until_open() {
        let array: Arc<dyn DataProvider<u32, TestRow>> =
            Arc::new(ArrayDataProvider::with_rows(5));
        let gated = Arc::new(GatedDataProvider::new(array));

        let task = {
            let gated = Arc::clone(&gated);
            tokio::spawn(async move {
                gated.fetch_by_offset(FetchByOffsetParams::new(0, 5)).await
            })
        };
        tokio::task::yield_now().await;
        assert_eq!(gated.started_fetches(), 1);
        assert!(!task.is_finished());

        gated.open();
        let result = task.await.unwrap().unwrap();
        assert_eq!(result.results.len(), 5);
    }

    #[tokio::test]
    async fn test_paged_stub_replays_pages_verbatim() {
        let provider = PagedStubProvider::new(vec![
            vec![RowItem::new(1u32, TestRow::new(1, "a"))],
            vec![
                RowItem::new(1u32, TestRow::new(1, "a")),
                RowItem::new(2u32, TestRow::new(2, "b")),
            ],
        ]);
        let mut stream = provider.fetch_first(FetchFirstParams::default());
        let first = stream.next().await.unwrap().unwrap();
        let second = stream.next().await.unwrap().unwrap();
        assert_eq!(first.results.len(), 1);
        assert!(!first.done);
        assert_eq!(second.results.len(), 2);
        assert!(second.done);
        assert_eq!(provider.total_size().await.unwrap(), Some(3));
    }
}
