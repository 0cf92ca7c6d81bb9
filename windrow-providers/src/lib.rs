//! windrow Providers - Wrapper Stack
//!
//! The optimization layers that compose over any [`windrow_core::DataProvider`]:
//! offset-window caching with eviction and prefetch, iteration result
//! caching, duplicate suppression, and mutation event narrowing, plus the
//! `enhance`/`enhance_tree` factory that assembles exactly the stack a
//! capability request calls for.

pub mod caching;
pub mod dedup;
pub mod enhance;
pub mod event_filter;
pub mod iterator_caching;
pub mod keyed;
pub mod window;

pub use caching::CachingDataProvider;
pub use dedup::DedupDataProvider;
pub use enhance::{enhance, enhance_tree, EnhancedTreeDataProvider};
pub use event_filter::MutateEventFilteringDataProvider;
pub use iterator_caching::IteratorCachingDataProvider;
pub use keyed::{KeyedCacheStats, KeyedResultCache};
pub use window::{CacheOptions, EvictionStrategy};
