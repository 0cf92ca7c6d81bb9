//! Provider contracts: fetch surface, row shapes, and the tree extension
//!
//! A [`DataProvider`] is an async, read-oriented view over keyed rows.
//! Consumers reach rows three ways: sequential iteration (`fetch_first`),
//! random access by offset (`fetch_by_offset`), and direct key lookup
//! (`fetch_by_keys`). Implementations are shared as `Arc<dyn DataProvider>`
//! and composed by wrapper providers that add caching, dedup, or event
//! filtering without the consumer noticing.

use std::collections::{HashMap, HashSet};
use std::hash::Hash;
use std::pin::Pin;
use std::sync::Arc;

use async_trait::async_trait;
use futures_util::Stream;

use crate::capability::{Capability, CapabilityKind};
use crate::error::ProviderResult;
use crate::event::{ListenerId, ProviderListener};
use crate::signal::AbortSignal;

// =============================================================================
// BOUNDS
// =============================================================================

/// Bounds every row key must meet. Blanket-implemented; never implement
/// this by hand.
pub trait RowKey: Clone + Eq + Hash + Send + Sync + 'static {}
impl<T> RowKey for T where T: Clone + Eq + Hash + Send + Sync + 'static {}

/// Bounds every row data value must meet. Blanket-implemented.
pub trait RowData: Clone + Send + Sync + 'static {}
impl<T> RowData for T where T: Clone + Send + Sync + 'static {}

// =============================================================================
// ROW SHAPES
// =============================================================================

/// Per-row descriptor. Carries the row key; providers with richer
/// metadata extend their data type instead of this struct.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RowMetadata<K> {
    pub key: K,
}

impl<K> RowMetadata<K> {
    pub fn new(key: K) -> Self {
        Self { key }
    }
}

/// One row as yielded by any fetch operation.
#[derive(Debug, Clone, PartialEq)]
pub struct RowItem<K, D> {
    pub data: D,
    pub metadata: RowMetadata<K>,
}

impl<K, D> RowItem<K, D> {
    pub fn new(key: K, data: D) -> Self {
        Self {
            data,
            metadata: RowMetadata::new(key),
        }
    }

    pub fn key(&self) -> &K {
        &self.metadata.key
    }
}

// =============================================================================
// FETCH PARAMETERS AND RESULTS
// =============================================================================

/// Parameters for [`DataProvider::fetch_first`].
#[derive(Debug, Clone, Default)]
pub struct FetchFirstParams {
    /// Page size hint. Providers may yield shorter final pages.
    pub size: Option<usize>,
    pub signal: Option<AbortSignal>,
}

impl FetchFirstParams {
    pub fn with_size(size: usize) -> Self {
        Self {
            size: Some(size),
            signal: None,
        }
    }

    pub fn with_signal(mut self, signal: AbortSignal) -> Self {
        self.signal = Some(signal);
        self
    }
}

/// One page yielded by a [`PageStream`].
#[derive(Debug, Clone, PartialEq)]
pub struct FetchPage<K, D> {
    pub results: Vec<RowItem<K, D>>,
    /// True when the provider will yield no further pages.
    pub done: bool,
}

impl<K, D> FetchPage<K, D> {
    pub fn new(results: Vec<RowItem<K, D>>, done: bool) -> Self {
        Self { results, done }
    }
}

/// Page stream returned by [`DataProvider::fetch_first`]. Pages arrive in
/// row order; the stream ends after the page flagged `done`.
pub type PageStream<K, D> = Pin<Box<dyn Stream<Item = ProviderResult<FetchPage<K, D>>> + Send>>;

/// Parameters for [`DataProvider::fetch_by_offset`].
#[derive(Debug, Clone)]
pub struct FetchByOffsetParams {
    pub offset: usize,
    pub size: usize,
    pub signal: Option<AbortSignal>,
}

impl FetchByOffsetParams {
    pub fn new(offset: usize, size: usize) -> Self {
        Self {
            offset,
            size,
            signal: None,
        }
    }

    pub fn with_signal(mut self, signal: AbortSignal) -> Self {
        self.signal = Some(signal);
        self
    }

    /// Exclusive end of the requested span, saturating at `usize::MAX`.
    pub fn end(&self) -> usize {
        self.offset.saturating_add(self.size)
    }
}

/// Result of [`DataProvider::fetch_by_offset`]. `results` is shorter than
/// the requested size only when the underlying data ends inside the span.
#[derive(Debug, Clone)]
pub struct FetchByOffsetResult<K, D> {
    pub fetch_parameters: FetchByOffsetParams,
    pub results: Vec<RowItem<K, D>>,
    pub done: bool,
}

/// Parameters for [`DataProvider::fetch_by_keys`].
#[derive(Debug, Clone)]
pub struct FetchByKeysParams<K> {
    pub keys: Vec<K>,
    pub signal: Option<AbortSignal>,
}

impl<K> FetchByKeysParams<K> {
    pub fn new(keys: Vec<K>) -> Self {
        Self { keys, signal: None }
    }

    pub fn with_signal(mut self, signal: AbortSignal) -> Self {
        self.signal = Some(signal);
        self
    }
}

/// Result of [`DataProvider::fetch_by_keys`]. Keys the provider does not
/// know are simply absent from `results`.
#[derive(Debug, Clone)]
pub struct FetchByKeysResult<K, D> {
    pub fetch_parameters: FetchByKeysParams<K>,
    pub results: HashMap<K, RowItem<K, D>>,
}

/// Parameters for [`DataProvider::contains_keys`].
#[derive(Debug, Clone)]
pub struct ContainsKeysParams<K> {
    pub keys: Vec<K>,
}

impl<K> ContainsKeysParams<K> {
    pub fn new(keys: Vec<K>) -> Self {
        Self { keys }
    }
}

/// Result of [`DataProvider::contains_keys`]: the subset of requested
/// keys the provider knows.
#[derive(Debug, Clone)]
pub struct ContainsKeysResult<K> {
    pub contains: HashSet<K>,
}

/// Three-valued emptiness report.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IsEmptyStatus {
    Empty,
    NotEmpty,
    /// The provider cannot answer without a full scan.
    Unknown,
}

// =============================================================================
// PROVIDER TRAITS
// =============================================================================

/// Async read interface over keyed rows.
///
/// All methods take `&self`; implementations carry interior state behind
/// `Arc`s so one provider can serve concurrent consumers. Fetch errors
/// propagate unchanged through wrapper layers.
#[async_trait]
pub trait DataProvider<K, D>: Send + Sync
where
    K: RowKey,
    D: RowData,
{
    /// Starts a sequential iteration and returns its page stream. The
    /// stream owns everything it needs; dropping it abandons the
    /// iteration without side effects.
    fn fetch_first(&self, params: FetchFirstParams) -> PageStream<K, D>;

    /// Fetches the contiguous span `[offset, offset + size)`. A short or
    /// empty result means the data ends inside the span, not an error.
    async fn fetch_by_offset(
        &self,
        params: FetchByOffsetParams,
    ) -> ProviderResult<FetchByOffsetResult<K, D>>;

    /// Fetches rows for the given keys. Unknown keys are omitted from the
    /// result map.
    async fn fetch_by_keys(
        &self,
        params: FetchByKeysParams<K>,
    ) -> ProviderResult<FetchByKeysResult<K, D>>;

    /// Reports which of the given keys the provider knows. The default
    /// implementation derives the answer from [`Self::fetch_by_keys`].
    async fn contains_keys(
        &self,
        params: ContainsKeysParams<K>,
    ) -> ProviderResult<ContainsKeysResult<K>> {
        let fetched = self
            .fetch_by_keys(FetchByKeysParams::new(params.keys))
            .await?;
        Ok(ContainsKeysResult {
            contains: fetched.results.into_keys().collect(),
        })
    }

    /// Total row count, or `None` when unknown.
    async fn total_size(&self) -> ProviderResult<Option<usize>>;

    /// Whether the provider currently holds any rows.
    async fn is_empty(&self) -> ProviderResult<IsEmptyStatus>;

    /// The advertisement for one capability surface, or `None` when the
    /// provider does not recognize or support it.
    fn capability(&self, kind: CapabilityKind) -> Option<Capability> {
        let _ = kind;
        None
    }

    /// Registers a listener for mutation and refresh events. Listeners
    /// run synchronously on the dispatching call stack.
    fn add_event_listener(&self, listener: ProviderListener<K, D>) -> ListenerId;

    /// Removes a previously registered listener.
    fn remove_event_listener(&self, id: ListenerId) -> bool;
}

/// A [`DataProvider`] whose rows may have children, each subtree exposed
/// as its own provider.
pub trait TreeDataProvider<K, D>: DataProvider<K, D>
where
    K: RowKey,
    D: RowData,
{
    /// The provider for `parent`'s children, or `None` for a leaf row.
    fn child_provider(&self, parent: &K) -> Option<Arc<dyn TreeDataProvider<K, D>>>;
}

// =============================================================================
// TESTS
// =============================================================================
