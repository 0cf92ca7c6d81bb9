//! windrow Core - Provider Contracts
//!
//! Defines the async data provider abstraction the rest of the workspace
//! builds on: fetch parameter and result shapes, mutation events with a
//! synchronous listener hub, typed capability negotiation, and abort
//! signalling. This crate contains contracts and small shared types only;
//! the wrapper providers live in windrow-providers.

pub mod capability;
pub mod error;
pub mod event;
pub mod provider;
pub mod signal;

pub use error::{CacheError, FetchError, ProviderError, ProviderResult};

pub use provider::{
    ContainsKeysParams, ContainsKeysResult, DataProvider, FetchByKeysParams, FetchByKeysResult,
    FetchByOffsetParams, FetchByOffsetResult, FetchFirstParams, FetchPage, IsEmptyStatus,
    PageStream, RowData, RowItem, RowKey, RowMetadata, TreeDataProvider,
};

pub use event::{
    EventHub, ListenerId, MutationDetail, MutationEvent, ProviderEvent, ProviderListener,
};

pub use capability::{
    advertised_dedup, advertised_event_filtering, advertised_fetch_by_offset,
    advertised_fetch_first, CachingLevel, Capability, CapabilityKind, CapabilityRequest,
    DedupCapability, DedupMode, DedupRequest, EventFilteringCapability, EventFilteringMode,
    EventFilteringRequest, FetchByOffsetCapability, FetchByOffsetRequest, FetchCapability,
    FetchFirstCapability, FetchFirstRequest, RowCountPrecision,
};

pub use signal::{AbortController, AbortSignal};
