//! Capability advertisement and negotiation types
//!
//! Providers advertise what they already do well (caching, exact counts,
//! dedup, event filtering) as closed tagged values. Consumers describe what
//! they need with a [`CapabilityRequest`]. The two sides are compared once,
//! at composition time; there is no runtime downcasting or provider
//! sniffing anywhere in the negotiation.

use serde::{Deserialize, Serialize};

use crate::provider::{DataProvider, RowData, RowKey};

// =============================================================================
// CAPABILITY VALUES
// =============================================================================

/// How much fetched data a provider retains across calls.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CachingLevel {
    /// Nothing is retained; every fetch hits the underlying source.
    #[default]
    None,
    /// Rows already visited by an iteration sequence are retained.
    Visited,
    /// The provider retains everything it has ever produced.
    All,
}

impl CachingLevel {
    /// Whether this advertised level satisfies a requested level.
    /// `All` satisfies any request; otherwise the levels must match.
    pub fn satisfies(self, requested: CachingLevel) -> bool {
        match requested {
            CachingLevel::None => true,
            _ => matches!(self, CachingLevel::All) || self == requested,
        }
    }
}

/// Quality of the row count a provider can report.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RowCountPrecision {
    #[default]
    None,
    Estimate,
    Exact,
}

impl RowCountPrecision {
    /// `Exact` satisfies any request; otherwise the precisions must match.
    pub fn satisfies(self, requested: RowCountPrecision) -> bool {
        match requested {
            RowCountPrecision::None => true,
            _ => matches!(self, RowCountPrecision::Exact) || self == requested,
        }
    }
}

/// Scope at which duplicate rows are suppressed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DedupMode {
    #[default]
    None,
    /// Duplicates are suppressed within one iteration sequence.
    Iterator,
    /// Duplicates are suppressed across the provider's whole lifetime.
    Global,
}

impl DedupMode {
    /// `Global` satisfies any request; otherwise the modes must match.
    pub fn satisfies(self, requested: DedupMode) -> bool {
        match requested {
            DedupMode::None => true,
            _ => matches!(self, DedupMode::Global) || self == requested,
        }
    }
}

/// Scope at which mutation events are narrowed to fetched rows.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventFilteringMode {
    #[default]
    None,
    /// Events are narrowed to rows yielded by the current iterator.
    Iterator,
    /// Events are narrowed against everything the provider ever served.
    Global,
}

impl EventFilteringMode {
    /// `Global` satisfies any request; otherwise the modes must match.
    pub fn satisfies(self, requested: EventFilteringMode) -> bool {
        match requested {
            EventFilteringMode::None => true,
            _ => matches!(self, EventFilteringMode::Global) || self == requested,
        }
    }
}

// =============================================================================
// ADVERTISEMENTS
// =============================================================================

/// Capability advertised for `fetch_first`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FetchFirstCapability {
    pub caching: CachingLevel,
    pub total_filtered_row_count: RowCountPrecision,
}

/// Capability advertised for `fetch_by_offset`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FetchByOffsetCapability {
    pub caching: CachingLevel,
}

/// Combined fallback advertisement covering both fetch styles. Consulted
/// only when the style-specific advertisement is absent.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FetchCapability {
    pub caching: CachingLevel,
}

/// Capability advertised for duplicate suppression.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DedupCapability {
    pub mode: DedupMode,
}

/// Capability advertised for mutation event filtering.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventFilteringCapability {
    pub mode: EventFilteringMode,
}

/// Names one capability surface a provider can be asked about.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CapabilityKind {
    FetchFirst,
    FetchByOffset,
    /// The combined fallback consulted when a style-specific kind is absent.
    Fetch,
    Dedup,
    EventFiltering,
}

/// One capability advertisement. Unrecognized kinds simply return `None`
/// from [`DataProvider::capability`], which consumers treat as "provider
/// does not do this".
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Capability {
    FetchFirst(FetchFirstCapability),
    FetchByOffset(FetchByOffsetCapability),
    Fetch(FetchCapability),
    Dedup(DedupCapability),
    EventFiltering(EventFilteringCapability),
}

// =============================================================================
// RESOLUTION
// =============================================================================

/// Effective `fetch_first` advertisement: the specific one, else the
/// combined fallback (which carries no row count precision), else defaults.
pub fn advertised_fetch_first<K: RowKey, D: RowData>(
    provider: &dyn DataProvider<K, D>,
) -> FetchFirstCapability {
    match provider.capability(CapabilityKind::FetchFirst) {
        Some(Capability::FetchFirst(cap)) => cap,
        _ => match provider.capability(CapabilityKind::Fetch) {
            Some(Capability::Fetch(cap)) => FetchFirstCapability {
                caching: cap.caching,
                total_filtered_row_count: RowCountPrecision::None,
            },
            _ => FetchFirstCapability::default(),
        },
    }
}

/// Effective `fetch_by_offset` advertisement, with the same fallback rule.
pub fn advertised_fetch_by_offset<K: RowKey, D: RowData>(
    provider: &dyn DataProvider<K, D>,
) -> FetchByOffsetCapability {
    match provider.capability(CapabilityKind::FetchByOffset) {
        Some(Capability::FetchByOffset(cap)) => cap,
        _ => match provider.capability(CapabilityKind::Fetch) {
            Some(Capability::Fetch(cap)) => FetchByOffsetCapability {
                caching: cap.caching,
            },
            _ => FetchByOffsetCapability::default(),
        },
    }
}

/// Effective dedup advertisement. No combined fallback exists for dedup.
pub fn advertised_dedup<K: RowKey, D: RowData>(
    provider: &dyn DataProvider<K, D>,
) -> DedupCapability {
    match provider.capability(CapabilityKind::Dedup) {
        Some(Capability::Dedup(cap)) => cap,
        _ => DedupCapability::default(),
    }
}

/// Effective event filtering advertisement. No combined fallback exists.
pub fn advertised_event_filtering<K: RowKey, D: RowData>(
    provider: &dyn DataProvider<K, D>,
) -> EventFilteringCapability {
    match provider.capability(CapabilityKind::EventFiltering) {
        Some(Capability::EventFiltering(cap)) => cap,
        _ => EventFilteringCapability::default(),
    }
}

// =============================================================================
// REQUESTS
// =============================================================================

/// Requested `fetch_first` behavior.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct FetchFirstRequest {
    pub caching: CachingLevel,
    pub total_filtered_row_count: RowCountPrecision,
    /// Forces a local iteration cache even when the provider's own
    /// advertisement would satisfy the request.
    pub force_local_caching: bool,
}

/// Requested `fetch_by_offset` behavior.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct FetchByOffsetRequest {
    pub caching: CachingLevel,
}

/// Requested duplicate suppression.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DedupRequest {
    pub mode: DedupMode,
}

/// Requested mutation event filtering.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EventFilteringRequest {
    pub mode: EventFilteringMode,
}

/// Declarative description of the optimizations a consumer needs from a
/// provider. Absent fields mean "no requirement". Deserializable so hosts
/// can ship capability configurations as data.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CapabilityRequest {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub fetch_first: Option<FetchFirstRequest>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub fetch_by_offset: Option<FetchByOffsetRequest>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub dedup: Option<DedupRequest>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub event_filtering: Option<EventFilteringRequest>,
}

impl CapabilityRequest {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_fetch_first(mut self, request: FetchFirstRequest) -> Self {
        self.fetch_first = Some(request);
        self
    }

    pub fn with_fetch_by_offset(mut self, request: FetchByOffsetRequest) -> Self {
        self.fetch_by_offset = Some(request);
        self
    }

    pub fn with_dedup(mut self, request: DedupRequest) -> Self {
        self.dedup = Some(request);
        self
    }

    pub fn with_event_filtering(mut self, request: EventFilteringRequest) -> Self {
        self.event_filtering = Some(request);
        self
    }

    /// The request a virtualized list consumer typically needs: visited-row
    /// caching with exact counts, offset caching, dedup, and event
    /// filtering, all at iterator scope.
    pub fn for_virtualized_list() -> Self {
        Self::new()
            .with_fetch_first(FetchFirstRequest {
                caching: CachingLevel::Visited,
                total_filtered_row_count: RowCountPrecision::Exact,
                force_local_caching: false,
            })
            .with_fetch_by_offset(FetchByOffsetRequest {
                caching: CachingLevel::Visited,
            })
            .with_dedup(DedupRequest {
                mode: DedupMode::Iterator,
            })
            .with_event_filtering(EventFilteringRequest {
                mode: EventFilteringMode::Iterator,
            })
    }
}

// =============================================================================
// TESTS
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_caching_level_satisfies() {
        assert!(CachingLevel::All.satisfies(CachingLevel::Visited));
        assert!(CachingLevel::All.satisfies(CachingLevel::All));
        assert!(CachingLevel::Visited.satisfies(CachingLevel::Visited));
        assert!(!CachingLevel::Visited.satisfies(CachingLevel::All));
        assert!(!CachingLevel::None.satisfies(CachingLevel::Visited));
        assert!(CachingLevel::None.satisfies(CachingLevel::None));
    }

    #[test]
    fn test_row_count_precision_satisfies() {
        assert!(RowCountPrecision::Exact.satisfies(RowCountPrecision::Estimate));
        assert!(RowCountPrecision::Estimate.satisfies(RowCountPrecision::Estimate));
        assert!(!RowCountPrecision::Estimate.satisfies(RowCountPrecision::Exact));
        assert!(!RowCountPrecision::None.satisfies(RowCountPrecision::Exact));
    }

    #[test]
    fn test_dedup_and_filtering_modes_satisfy() {
        assert!(DedupMode::Global.satisfies(DedupMode::Iterator));
        assert!(!DedupMode::Iterator.satisfies(DedupMode::Global));
        assert!(EventFilteringMode::Global.satisfies(EventFilteringMode::Iterator));
        assert!(!EventFilteringMode::None.satisfies(EventFilteringMode::Iterator));
    }

    #[test]
    fn test_capability_request_deserializes_with_defaults() {
        let request: CapabilityRequest =
            serde_json::from_str(r#"{"fetch_first": {"caching": "visited"}}"#).unwrap();
        let fetch_first = request.fetch_first.unwrap();
        assert_eq!(fetch_first.caching, CachingLevel::Visited);
        assert_eq!(
            fetch_first.total_filtered_row_count,
            RowCountPrecision::None
        );
        assert!(!fetch_first.force_local_caching);
        assert!(request.fetch_by_offset.is_none());
        assert!(request.dedup.is_none());
    }

    #[test]
    fn test_capability_request_round_trips() {
        let request = CapabilityRequest::for_virtualized_list();
        let json = serde_json::to_string(&request).unwrap();
        let back: CapabilityRequest = serde_json::from_str(&json).unwrap();
        assert_eq!(request, back);
    }
}

#[cfg(test)]
mod prop_tests {
    use super::*;
    use proptest::prelude::*;
    use proptest::test_runner::TestCaseError;

    fn arb_caching_level() -> impl Strategy<Value = CachingLevel> {
        prop_oneof![
            Just(CachingLevel::None),
            Just(CachingLevel::Visited),
            Just(CachingLevel::All),
        ]
    }

    fn arb_precision() -> impl Strategy<Value = RowCountPrecision> {
        prop_oneof![
            Just(RowCountPrecision::None),
            Just(RowCountPrecision::Estimate),
            Just(RowCountPrecision::Exact),
        ]
    }

    fn arb_dedup_mode() -> impl Strategy<Value = DedupMode> {
        prop_oneof![
            Just(DedupMode::None),
            Just(DedupMode::Iterator),
            Just(DedupMode::Global),
        ]
    }

    fn arb_filtering_mode() -> impl Strategy<Value = EventFilteringMode> {
        prop_oneof![
            Just(EventFilteringMode::None),
            Just(EventFilteringMode::Iterator),
            Just(EventFilteringMode::Global),
        ]
    }

    /// The laws every capability scale shares: self-satisfaction, the top
    /// value satisfying anything, the bottom request being satisfied by
    /// anything, and exact match everywhere else.
    fn check_laws<T: Copy + PartialEq>(
        advertised: T,
        requested: T,
        top: T,
        bottom: T,
        satisfies: impl Fn(T, T) -> bool,
    ) -> Result<(), TestCaseError> {
        prop_assert!(satisfies(advertised, advertised));
        prop_assert!(satisfies(top, requested));
        prop_assert!(satisfies(advertised, bottom));
        if requested != bottom && advertised != top {
            prop_assert_eq!(satisfies(advertised, requested), advertised == requested);
        }
        Ok(())
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(200))]

        /// Every capability scale obeys the same ordering laws.
        #[test]
        fn prop_satisfies_laws_hold_on_every_scale(
            caching in arb_caching_level(),
            caching_req in arb_caching_level(),
            precision in arb_precision(),
            precision_req in arb_precision(),
            dedup in arb_dedup_mode(),
            dedup_req in arb_dedup_mode(),
            filtering in arb_filtering_mode(),
            filtering_req in arb_filtering_mode(),
        ) {
            check_laws(
                caching,
                caching_req,
                CachingLevel::All,
                CachingLevel::None,
                CachingLevel::satisfies,
            )?;
            check_laws(
                precision,
                precision_req,
                RowCountPrecision::Exact,
                RowCountPrecision::None,
                RowCountPrecision::satisfies,
            )?;
            check_laws(
                dedup,
                dedup_req,
                DedupMode::Global,
                DedupMode::None,
                DedupMode::satisfies,
            )?;
            check_laws(
                filtering,
                filtering_req,
                EventFilteringMode::Global,
                EventFilteringMode::None,
                EventFilteringMode::satisfies,
            )?;
        }
    }
}
