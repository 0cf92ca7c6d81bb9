//! Scroll-position-driven fetch state machine.
//!
//! The embedder reports viewport geometry after every scroll or layout
//! change; the scroller decides when the next span of rows is worth
//! fetching and performs the fetch against the provider it was built
//! over. One fetch runs at a time; a trigger recomputed on every
//! max-scroll change keeps fetch frequency proportional to remaining
//! scroll distance.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use windrow_core::{
    DataProvider, FetchByOffsetParams, ListenerId, ProviderEvent, ProviderResult, RowData,
    RowItem, RowKey,
};

/// Tuning knobs for a [`ViewportScroller`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ScrollerOptions {
    /// Rows fetched per increment.
    pub fetch_size: usize,
    /// Hard cap on total fetched rows.
    pub max_row_count: usize,
    /// Rows the embedder had already rendered when the scroller attached.
    pub initial_row_count: usize,
}

impl Default for ScrollerOptions {
    fn default() -> Self {
        Self {
            fetch_size: 25,
            max_row_count: 500,
            initial_row_count: 0,
        }
    }
}

impl ScrollerOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_fetch_size(mut self, size: usize) -> Self {
        self.fetch_size = size.max(1);
        self
    }

    pub fn with_max_row_count(mut self, count: usize) -> Self {
        self.max_row_count = count;
        self
    }

    pub fn with_initial_row_count(mut self, count: usize) -> Self {
        self.initial_row_count = count;
        self
    }
}

/// Scroll geometry as measured by the embedder. Units are whatever the
/// embedder scrolls in; only ratios and differences matter here.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Viewport {
    /// Current scroll offset.
    pub offset: f64,
    /// Visible extent.
    pub viewport_extent: f64,
    /// Maximum scrollable offset. Zero means the content does not
    /// overflow the viewport yet.
    pub max_scroll: f64,
}

/// How the latest scroll came about. Recorded for caller telemetry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InputKind {
    Wheel,
    Pointer,
    Programmatic,
}

/// A fetch the embedder should run to fill its viewport.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FetchPlan {
    pub offset: usize,
    pub size: usize,
}

/// Outcome of a triggered fetch.
#[derive(Debug, Clone, PartialEq)]
pub enum ScrollFetchResult<K, D> {
    /// Rows for the embedder to append at `offset`. `done` is set once
    /// no further fetch will ever be issued.
    Fetched {
        offset: usize,
        results: Vec<RowItem<K, D>>,
        done: bool,
    },
    /// The row cap was reached or the provider ran out of rows.
    Done,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Idle,
    Fetching,
}

struct ScrollState {
    phase: Phase,
    /// Rows fetched so far; the absolute offset of the next fetch.
    row_count: usize,
    exhausted: bool,
    /// Distance from the end below which a fetch fires.
    fetch_trigger: f64,
    last_max_scroll: f64,
    viewport: Option<Viewport>,
    last_input: InputKind,
}

/// Headless infinite-scroll driver over a [`DataProvider`].
pub struct ViewportScroller<K: RowKey, D: RowData> {
    inner: Arc<ScrollerInner<K, D>>,
}

struct ScrollerInner<K: RowKey, D: RowData> {
    provider: Arc<dyn DataProvider<K, D>>,
    options: ScrollerOptions,
    state: Mutex<ScrollState>,
    listener: Mutex<Option<ListenerId>>,
}

impl<K: RowKey, D: RowData> ViewportScroller<K, D> {
    pub fn new(provider: Arc<dyn DataProvider<K, D>>, options: ScrollerOptions) -> Self {
        let inner = Arc::new(ScrollerInner {
            provider: Arc::clone(&provider),
            options,
            state: Mutex::new(ScrollState {
                phase: Phase::Idle,
                row_count: options.initial_row_count,
                exhausted: false,
                fetch_trigger: 0.0,
                // NaN so the first viewport always recomputes the trigger.
                last_max_scroll: f64::NAN,
                viewport: None,
                last_input: InputKind::Programmatic,
            }),
            listener: Mutex::new(None),
        });
        let weak = Arc::downgrade(&inner);
        let id = provider.add_event_listener(Arc::new(move |event| {
            if let Some(inner) = weak.upgrade() {
                inner.on_provider_event(event);
            }
        }));
        *inner
            .listener
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some(id);
        Self { inner }
    }

    /// Records which input produced the scroll being reported next.
    pub fn note_input(&self, kind: InputKind) {
        self.inner.state().last_input = kind;
    }

    pub fn last_input_kind(&self) -> InputKind {
        self.inner.state().last_input
    }

    /// Rows fetched so far, as adjusted by mutation bookkeeping.
    pub fn row_count(&self) -> usize {
        self.inner.state().row_count
    }

    /// Whether the content overflows the viewport the embedder last
    /// reported. Before any report this is false.
    pub fn is_overflow(&self) -> bool {
        let state = self.inner.state();
        state
            .viewport
            .map(|viewport| viewport.max_scroll > 0.0)
            .unwrap_or(false)
    }

    /// Feeds new scroll geometry and returns whether the fetch trigger
    /// is now crossed. Recomputes the trigger whenever the maximum
    /// scroll position changes, at half the remaining distance.
    pub fn on_scroll(&self, viewport: Viewport) -> bool {
        let mut state = self.inner.state();
        if viewport.max_scroll != state.last_max_scroll {
            state.fetch_trigger = ((viewport.max_scroll - viewport.offset) / 2.0).max(0.0);
            state.last_max_scroll = viewport.max_scroll;
        }
        state.viewport = Some(viewport);
        let remaining = (viewport.max_scroll - viewport.offset).max(0.0);
        remaining <= state.fetch_trigger
    }

    /// [`on_scroll`] plus the fetch it calls for: when the trigger is
    /// crossed, fetches the next span of rows. Returns `None` when no
    /// fetch was due or one is already running.
    ///
    /// [`on_scroll`]: ViewportScroller::on_scroll
    pub async fn handle_scroll(
        &self,
        viewport: Viewport,
    ) -> ProviderResult<Option<ScrollFetchResult<K, D>>> {
        if !self.on_scroll(viewport) {
            return Ok(None);
        }
        self.fetch_next().await
    }

    /// Fetches the next span unconditionally (viewport fill, retry).
    /// One fetch runs at a time; a call that finds another in flight
    /// returns `None`.
    pub async fn fetch_next(&self) -> ProviderResult<Option<ScrollFetchResult<K, D>>> {
        let (offset, size) = {
            let mut state = self.inner.state();
            if state.phase == Phase::Fetching {
                return Ok(None);
            }
            if state.exhausted || state.row_count >= self.inner.options.max_row_count {
                return Ok(Some(ScrollFetchResult::Done));
            }
            let offset = state.row_count;
            let size = self
                .inner
                .options
                .fetch_size
                .min(self.inner.options.max_row_count - state.row_count);
            state.phase = Phase::Fetching;
            (offset, size)
        };

        tracing::debug!(offset, size, "issuing scroll fetch");
        let outcome = self
            .inner
            .provider
            .fetch_by_offset(FetchByOffsetParams::new(offset, size))
            .await;

        let mut state = self.inner.state();
        state.phase = Phase::Idle;
        let result = outcome?;
        state.row_count += result.results.len();
        if result.done || result.results.len() < size {
            state.exhausted = true;
        }
        let done = state.exhausted || state.row_count >= self.inner.options.max_row_count;
        Ok(Some(ScrollFetchResult::Fetched {
            offset,
            results: result.results,
            done,
        }))
    }

    /// Synchronous fill check: the fetch the embedder should run next to
    /// make its content overflow the viewport, or `None` when it already
    /// does (or nothing more can be fetched).
    pub fn check_viewport(&self) -> Option<FetchPlan> {
        let state = self.inner.state();
        if state.phase == Phase::Fetching {
            return None;
        }
        if state.exhausted || state.row_count >= self.inner.options.max_row_count {
            return None;
        }
        let overflows = state
            .viewport
            .map(|viewport| viewport.max_scroll > 0.0)
            .unwrap_or(false);
        if overflows {
            return None;
        }
        Some(FetchPlan {
            offset: state.row_count,
            size: self
                .inner
                .options
                .fetch_size
                .min(self.inner.options.max_row_count - state.row_count),
        })
    }

    /// Detaches the provider mutation listener. Idempotent; also runs on
    /// drop.
    pub fn destroy(&self) {
        let id = self
            .inner
            .listener
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(id) = id {
            self.inner.provider.remove_event_listener(id);
        }
    }
}

impl<K: RowKey, D: RowData> ScrollerInner<K, D> {
    fn state(&self) -> MutexGuard<'_, ScrollState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Keeps the fetched-row ledger aligned with the backing data.
    /// Indexes inside the fetched span move the count; a remove without
    /// indexes is assumed to name fetched rows (upstream filtering only
    /// forwards events about rows the consumer saw), an add without
    /// indexes lands beyond the span.
    fn on_provider_event(&self, event: &ProviderEvent<K, D>) {
        let mut state = self.state();
        match event {
            ProviderEvent::Refresh => {
                state.row_count = self.options.initial_row_count;
                state.exhausted = false;
            }
            ProviderEvent::Mutate(mutation) => {
                if let Some(remove) = &mutation.remove {
                    let inside = match &remove.indexes {
                        Some(indexes) => {
                            indexes.iter().filter(|&&idx| idx < state.row_count).count()
                        }
                        None => remove.keys.len(),
                    };
                    state.row_count = state.row_count.saturating_sub(inside);
                    state.exhausted = false;
                }
                if let Some(add) = &mutation.add {
                    let inside = match &add.indexes {
                        Some(indexes) => {
                            indexes.iter().filter(|&&idx| idx < state.row_count).count()
                        }
                        None => 0,
                    };
                    state.row_count += inside;
                }
            }
        }
    }
}

impl<K: RowKey, D: RowData> Drop for ViewportScroller<K, D> {
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
    use windrow_test_utils::{ArrayDataProvider, GatedDataProvider, TestRow};

    fn viewport(offset: f64, max_scroll: f64) -> Viewport {
        Viewport {
            offset,
            viewport_extent: 200.0,
            max_scroll,
        }
    }

    fn scroller(rows: usize, options: ScrollerOptions) -> ViewportScroller<u32, TestRow> {
        ViewportScroller::new(Arc::new(ArrayDataProvider::with_rows(rows)), options)
    }

    #[tokio::test]
    async fn test_trigger_is_half_the_remaining_distance() {
        let scroller = scroller(100, ScrollerOptions::default());

        // 1000 to go, trigger at 500: not crossed at the top.
        assert!(!scroller.on_scroll(viewport(0.0, 1000.0)));
        // Same max-scroll, now 400 from the end: crossed.
        assert!(scroller.on_scroll(viewport(600.0, 1000.0)));
    }

    #[tokio::test]
    async fn test_trigger_recomputes_when_max_scroll_changes() {
        let scroller = scroller(100, ScrollerOptions::default());
        scroller.on_scroll(viewport(0.0, 1000.0));
        assert!(scroller.on_scroll(viewport(600.0, 1000.0)));
        // New content grew the scroll range; trigger moves to
        // (2000 - 600) / 2 = 700, and 1400 remaining is not crossed.
        assert!(!scroller.on_scroll(viewport(600.0, 2000.0)));
    }

    #[tokio::test]
    async fn test_crossing_fetches_next_span() {
        let scroller = scroller(100, ScrollerOptions::default());
        scroller.on_scroll(viewport(0.0, 1000.0));
        let result = scroller
            .handle_scroll(viewport(600.0, 1000.0))
            .await
            .unwrap();
        match result {
            Some(ScrollFetchResult::Fetched {
                offset,
                results,
                done,
            }) => {
                assert_eq!(offset, 0);
                assert_eq!(results.len(), 25);
                assert!(!done);
            }
            other => panic!("unexpected outcome: {other:?}"),
        }
        assert_eq!(scroller.row_count(), 25);
    }

    #[tokio::test]
    async fn test_scroll_without_crossing_fetches_nothing() {
        let scroller = scroller(100, ScrollerOptions::default());
        let result = scroller.handle_scroll(viewport(0.0, 1000.0)).await.unwrap();
        assert!(result.is_none());
        assert_eq!(scroller.row_count(), 0);
    }

    #[tokio::test]
    async fn test_concurrent_fetch_is_suppressed() {
        let array: Arc<dyn DataProvider<u32, TestRow>> =
            Arc::new(ArrayDataProvider::with_rows(100));
        let gated = Arc::new(GatedDataProvider::new(array));
        let scroller = Arc::new(ViewportScroller::new(
            gated.clone() as Arc<dyn DataProvider<u32, TestRow>>,
            ScrollerOptions::default(),
        ));

        let task = {
            let scroller = Arc::clone(&scroller);
            tokio::spawn(async move { scroller.fetch_next().await })
        };
        tokio::task::yield_now().await;
        assert_eq!(gated.started_fetches(), 1);

        // Second caller finds the fetch in flight and bows out.
        assert!(scroller.fetch_next().await.unwrap().is_none());

        gated.open();
        let result = task.await.unwrap().unwrap();
        assert!(matches!(result, Some(ScrollFetchResult::Fetched { .. })));
        assert_eq!(gated.started_fetches(), 1);
    }

    #[tokio::test]
    async fn test_row_cap_limits_fetching() {
        let options = ScrollerOptions::default()
            .with_fetch_size(30)
            .with_max_row_count(50);
        let scroller = scroller(100, options);

        match scroller.fetch_next().await.unwrap() {
            Some(ScrollFetchResult::Fetched { results, done, .. }) => {
                assert_eq!(results.len(), 30);
                assert!(!done);
            }
            other => panic!("unexpected outcome: {other:?}"),
        }
        // Pinched to the 20 rows left under the cap.
        match scroller.fetch_next().await.unwrap() {
            Some(ScrollFetchResult::Fetched { results, done, .. }) => {
                assert_eq!(results.len(), 20);
                assert!(done);
            }
            other => panic!("unexpected outcome: {other:?}"),
        }
        assert_eq!(
            scroller.fetch_next().await.unwrap(),
            Some(ScrollFetchResult::Done)
        );
    }

    #[tokio::test]
    async fn test_short_result_marks_exhaustion() {
        let scroller = scroller(10, ScrollerOptions::default());
        match scroller.fetch_next().await.unwrap() {
            Some(ScrollFetchResult::Fetched { results, done, .. }) => {
                assert_eq!(results.len(), 10);
                assert!(done);
            }
            other => panic!("unexpected outcome: {other:?}"),
        }
        assert_eq!(
            scroller.fetch_next().await.unwrap(),
            Some(ScrollFetchResult::Done)
        );
    }

    #[tokio::test]
    async fn test_check_viewport_plans_until_overflow() {
        let scroller = scroller(100, ScrollerOptions::default());
        // Nothing rendered yet: fill.
        assert_eq!(
            scroller.check_viewport(),
            Some(FetchPlan {
                offset: 0,
                size: 25
            })
        );
        scroller.fetch_next().await.unwrap();
        // Still no overflow reported: keep filling from the new offset.
        assert_eq!(
            scroller.check_viewport(),
            Some(FetchPlan {
                offset: 25,
                size: 25
            })
        );
        // Content overflows now; the scroll trigger takes over.
        scroller.on_scroll(viewport(0.0, 800.0));
        assert!(scroller.check_viewport().is_none());
        assert!(scroller.is_overflow());
    }

    #[tokio::test]
    async fn test_mutations_adjust_row_ledger() {
        let array = Arc::new(ArrayDataProvider::with_rows(100));
        let scroller = ViewportScroller::new(
            array.clone() as Arc<dyn DataProvider<u32, TestRow>>,
            ScrollerOptions::default(),
        );
        scroller.fetch_next().await.unwrap();
        assert_eq!(scroller.row_count(), 25);

        // Inside the fetched span.
        array.remove_row(3);
        assert_eq!(scroller.row_count(), 24);
        array.insert_row(10, TestRow::new(900, "inserted"));
        assert_eq!(scroller.row_count(), 25);
        // Beyond it: no change.
        array.insert_row(80, TestRow::new(901, "far"));
        assert_eq!(scroller.row_count(), 25);
    }

    #[tokio::test]
    async fn test_refresh_resets_ledger() {
        let array = Arc::new(ArrayDataProvider::with_rows(40));
        let scroller = ViewportScroller::new(
            array.clone() as Arc<dyn DataProvider<u32, TestRow>>,
            ScrollerOptions::default(),
        );
        scroller.fetch_next().await.unwrap();
        assert_eq!(scroller.row_count(), 25);

        array.refresh(windrow_test_utils::test_rows(40));
        assert_eq!(scroller.row_count(), 0);
        match scroller.fetch_next().await.unwrap() {
            Some(ScrollFetchResult::Fetched { offset, .. }) => assert_eq!(offset, 0),
            other => panic!("unexpected outcome: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_destroy_detaches_listener() {
        let array = Arc::new(ArrayDataProvider::with_rows(10));
        let scroller = ViewportScroller::new(
            array.clone() as Arc<dyn DataProvider<u32, TestRow>>,
            ScrollerOptions::default(),
        );
        assert_eq!(array.listener_count(), 1);
        scroller.destroy();
        assert_eq!(array.listener_count(), 0);
        scroller.destroy();
        assert_eq!(array.listener_count(), 0);
    }

    #[tokio::test]
    async fn test_input_kind_is_recorded() {
        let scroller = scroller(10, ScrollerOptions::default());
        assert_eq!(scroller.last_input_kind(), InputKind::Programmatic);
        scroller.note_input(InputKind::Wheel);
        assert_eq!(scroller.last_input_kind(), InputKind::Wheel);
    }
}
