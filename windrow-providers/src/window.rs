//! Windowed row cache and range ledger
//!
//! Backing store for the offset-caching provider: two parallel arrays over
//! a contiguous logical window of rows, plus a ledger of every span ever
//! fetched. The ledger drives eviction and prefetch; the arrays answer
//! coverage checks and slicing. `None` slots are purged-or-unknown rows
//! and always read as cache misses.

use windrow_core::{MutationDetail, RowData, RowItem, RowKey, RowMetadata};

// =============================================================================
// CONFIGURATION
// =============================================================================

/// When cached rows may be discarded.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum EvictionStrategy {
    /// Keep everything for the cache's lifetime.
    #[default]
    Never,
    /// Purge cold, repeatedly missed ranges far from the current request.
    Lru,
}

/// Tuning for the offset-caching provider.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CacheOptions {
    pub eviction: EvictionStrategy,
    /// Misses a range must accumulate before it becomes evictable.
    pub miss_threshold: u32,
    /// Refill gaps near the scroll boundary in the background.
    pub prefetch: bool,
}

impl Default for CacheOptions {
    fn default() -> Self {
        Self {
            eviction: EvictionStrategy::Never,
            miss_threshold: 5,
            prefetch: false,
        }
    }
}

impl CacheOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_eviction(mut self, eviction: EvictionStrategy) -> Self {
        self.eviction = eviction;
        self
    }

    pub fn with_miss_threshold(mut self, threshold: u32) -> Self {
        self.miss_threshold = threshold;
        self
    }

    pub fn with_prefetch(mut self, prefetch: bool) -> Self {
        self.prefetch = prefetch;
        self
    }
}

/// Movement direction of consecutive offset fetches.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum FetchDirection {
    Up,
    Down,
}

// =============================================================================
// RANGE LEDGER
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum RangeStatus {
    Ready,
    Fetching,
    Purged,
}

/// One contiguous region recorded by a completed fetch. Entries are
/// appended as fetched; overlapping entries are never merged.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct RangeEntry {
    pub start: usize,
    pub end: usize,
    pub miss_count: u32,
    pub status: RangeStatus,
}

impl RangeEntry {
    fn ready(start: usize, end: usize) -> Self {
        Self {
            start,
            end,
            miss_count: 0,
            status: RangeStatus::Ready,
        }
    }

    fn overlaps(&self, start: usize, end: usize) -> bool {
        self.start < end && start < self.end
    }

    fn contains(&self, pos: usize) -> bool {
        self.start <= pos && pos < self.end
    }
}

// =============================================================================
// WINDOW CACHE
// =============================================================================

/// Contiguous cached window over a provider's rows.
///
/// Invariants: `data.len() == metadata.len()`; slot `i` holds the row at
/// logical offset `start_index + i`; a `None` slot means the row is not
/// cached (never fetched, purged, or delivered without data).
pub(crate) struct WindowCache<K, D> {
    data: Vec<Option<D>>,
    metadata: Vec<Option<RowMetadata<K>>>,
    start_index: usize,
    done: bool,
    ranges: Vec<RangeEntry>,
    /// Distance unit for eviction, learned from the first fetch size.
    proximity: Option<usize>,
}

impl<K: RowKey, D: RowData> WindowCache<K, D> {
    pub(crate) fn new() -> Self {
        Self {
            data: Vec::new(),
            metadata: Vec::new(),
            start_index: 0,
            done: false,
            ranges: Vec::new(),
            proximity: None,
        }
    }

    pub(crate) fn len(&self) -> usize {
        self.data.len()
    }

    pub(crate) fn start_index(&self) -> usize {
        self.start_index
    }

    /// Exclusive end of the logical window.
    pub(crate) fn end_index(&self) -> usize {
        self.start_index + self.data.len()
    }

    pub(crate) fn is_done(&self) -> bool {
        self.done
    }

    pub(crate) fn set_done(&mut self) {
        self.done = true;
    }

    pub(crate) fn ranges(&self) -> &[RangeEntry] {
        &self.ranges
    }

    /// Drops all cached content and ledger state. The learned proximity
    /// window survives; it describes the consumer, not the data.
    pub(crate) fn reset(&mut self) {
        self.data.clear();
        self.metadata.clear();
        self.start_index = 0;
        self.done = false;
        self.ranges.clear();
    }

    /// Records the fetch size once; later calls are no-ops.
    pub(crate) fn note_fetch_size(&mut self, size: usize) {
        if self.proximity.is_none() && size > 0 {
            self.proximity = Some(size);
        }
    }

    /// Whether `[start, end)` can be served entirely from cache: inside
    /// the window with every slot present. Purged and never-written slots
    /// both fail the scan, so partially covered spans read as misses.
    pub(crate) fn is_in_cache(&self, start: usize, end: usize) -> bool {
        if start < self.start_index || end > self.end_index() {
            return false;
        }
        (start..end).all(|abs| {
            let rel = abs - self.start_index;
            self.data[rel].is_some() && self.metadata[rel].is_some()
        })
    }

    /// Hit bookkeeping: every range not overlapping the served span takes
    /// a miss.
    pub(crate) fn note_hit(&mut self, start: usize, end: usize) {
        for range in &mut self.ranges {
            if !range.overlaps(start, end) {
                range.miss_count += 1;
            }
        }
    }

    /// Miss bookkeeping: overlapping ranges go FETCHING, the rest take a
    /// miss.
    pub(crate) fn note_miss(&mut self, start: usize, end: usize) {
        for range in &mut self.ranges {
            if range.overlaps(start, end) {
                range.status = RangeStatus::Fetching;
            } else {
                range.miss_count += 1;
            }
        }
    }

    /// Writes fetched rows at their absolute positions, flips every
    /// overlapping ledger entry back to READY with its misses cleared,
    /// and appends a READY entry for the fetched span.
    pub(crate) fn commit(&mut self, offset: usize, rows: &[RowItem<K, D>]) {
        self.write_range(offset, rows);
        let end = offset + rows.len();
        for range in &mut self.ranges {
            if range.overlaps(offset, end) {
                range.status = RangeStatus::Ready;
                range.miss_count = 0;
            }
        }
        if !rows.is_empty() {
            self.ranges.push(RangeEntry::ready(offset, end));
        }
    }

    /// Releases FETCHING entries overlapping a span whose fetch settled.
    /// Needed separately from [`Self::commit`] because a short or empty
    /// result covers less than the span that was marked.
    pub(crate) fn finish_span(&mut self, start: usize, end: usize) {
        for range in &mut self.ranges {
            if range.status == RangeStatus::Fetching && range.overlaps(start, end) {
                range.status = RangeStatus::Ready;
                range.miss_count = 0;
            }
        }
    }

    /// Appends one iterator page at the window's end.
    pub(crate) fn append_page(&mut self, rows: &[RowItem<K, D>], done: bool) {
        let offset = self.end_index();
        self.commit(offset, rows);
        if done {
            self.done = true;
        }
    }

    /// Copies up to `size` contiguous rows starting at `offset`, stopping
    /// at the first hole or window edge.
    pub(crate) fn slice(&self, offset: usize, size: usize) -> Vec<RowItem<K, D>> {
        let mut out = Vec::with_capacity(size);
        for abs in offset..offset + size {
            let Some(rel) = abs.checked_sub(self.start_index) else {
                break;
            };
            match (self.data.get(rel), self.metadata.get(rel)) {
                (Some(Some(data)), Some(Some(metadata))) => out.push(RowItem {
                    data: data.clone(),
                    metadata: metadata.clone(),
                }),
                _ => break,
            }
        }
        out
    }

    fn write_range(&mut self, offset: usize, rows: &[RowItem<K, D>]) {
        if rows.is_empty() {
            return;
        }
        // A cold cache anchors its window at the first fetched offset.
        if self.data.is_empty() && self.ranges.is_empty() && self.start_index == 0 {
            self.start_index = offset;
        }
        if offset < self.start_index {
            let deficit = self.start_index - offset;
            self.data
                .splice(0..0, std::iter::repeat_with(|| None).take(deficit));
            self.metadata
                .splice(0..0, std::iter::repeat_with(|| None).take(deficit));
            self.start_index = offset;
        }
        let end = offset + rows.len();
        if end > self.end_index() {
            let len = end - self.start_index;
            self.data.resize_with(len, || None);
            self.metadata.resize_with(len, || None);
        }
        for (i, row) in rows.iter().enumerate() {
            let rel = offset + i - self.start_index;
            self.data[rel] = Some(row.data.clone());
            self.metadata[rel] = Some(row.metadata.clone());
        }
    }

    /// Absolute offset of the cached row with `key`, if present.
    fn position_of_key(&self, key: &K) -> Option<usize> {
        self.metadata
            .iter()
            .position(|slot| slot.as_ref().map_or(false, |metadata| metadata.key == *key))
            .map(|rel| self.start_index + rel)
    }

    // =========================================================================
    // MUTATIONS
    // =========================================================================

    /// Splices added rows into the window. Adds carry final absolute
    /// indexes; entries without an index cannot be placed and are ignored.
    pub(crate) fn apply_add(&mut self, detail: &MutationDetail<K, D>) {
        let mut placed: Vec<(usize, usize)> = detail
            .keys
            .iter()
            .enumerate()
            .filter_map(|(pos, _)| detail.index_at(pos).map(|abs| (abs, pos)))
            .collect();
        placed.sort_unstable_by_key(|&(abs, _)| abs);
        for (abs, pos) in placed {
            if abs < self.start_index {
                self.start_index += 1;
            } else if abs <= self.end_index() {
                let rel = abs - self.start_index;
                let data = detail.data.as_ref().map(|rows| rows[pos].clone());
                let metadata = detail
                    .metadata
                    .as_ref()
                    .map(|rows| rows[pos].clone())
                    .unwrap_or_else(|| RowMetadata::new(detail.keys[pos].clone()));
                self.data.insert(rel, data);
                self.metadata.insert(rel, Some(metadata));
            }
            // Beyond the window: nothing to splice.
        }
    }

    /// Splices removed rows out of the window; removals before the window
    /// shift it left. Index resolution prefers event indexes and falls
    /// back to key lookup.
    pub(crate) fn apply_remove(&mut self, detail: &MutationDetail<K, D>) {
        let mut positions: Vec<usize> = detail
            .keys
            .iter()
            .enumerate()
            .filter_map(|(pos, key)| {
                detail
                    .index_at(pos)
                    .or_else(|| self.position_of_key(key))
            })
            .collect();
        positions.sort_unstable();
        positions.dedup();
        // Highest first so earlier removals don't shift later targets.
        for &abs in positions.iter().rev() {
            if abs < self.start_index {
                self.start_index -= 1;
            } else if abs < self.end_index() {
                let rel = abs - self.start_index;
                self.data.remove(rel);
                self.metadata.remove(rel);
            }
        }
    }

    /// Overwrites updated rows in place. An update without row data clears
    /// the slot, forcing a refetch on next access.
    pub(crate) fn apply_update(&mut self, detail: &MutationDetail<K, D>) {
        for (pos, key) in detail.keys.iter().enumerate() {
            let Some(abs) = detail
                .index_at(pos)
                .or_else(|| self.position_of_key(key))
            else {
                continue;
            };
            if abs < self.start_index || abs >= self.end_index() {
                continue;
            }
            let rel = abs - self.start_index;
            self.data[rel] = detail.data.as_ref().map(|rows| rows[pos].clone());
            self.metadata[rel] = Some(
                detail
                    .metadata
                    .as_ref()
                    .map(|rows| rows[pos].clone())
                    .unwrap_or_else(|| RowMetadata::new(key.clone())),
            );
        }
    }

    // =========================================================================
    // EVICTION AND PREFETCH
    // =========================================================================

    /// Purges READY ranges that have missed at least `threshold` times and
    /// sit farther from the request span than one proximity window.
    /// Returns the number of ranges purged.
    pub(crate) fn evict_distant(
        &mut self,
        span_start: usize,
        span_end: usize,
        threshold: u32,
    ) -> usize {
        let Some(proximity) = self.proximity else {
            return 0;
        };
        let lower = span_start.saturating_sub(proximity);
        let upper = span_end.saturating_add(proximity);
        let start_index = self.start_index;
        let window_end = self.start_index + self.data.len();
        let mut purged = 0;
        for range in &mut self.ranges {
            let distant = range.end <= lower || range.start >= upper;
            if range.status != RangeStatus::Ready || range.miss_count < threshold || !distant {
                continue;
            }
            let from = range.start.max(start_index);
            let to = range.end.min(window_end);
            for abs in from..to {
                let rel = abs - start_index;
                self.data[rel] = None;
                self.metadata[rel] = None;
            }
            range.status = RangeStatus::Purged;
            purged += 1;
        }
        purged
    }

    /// Picks the gap to refill ahead of the consumer's movement: the first
    /// ledger entry straddling the boundary (span start moving Up, span
    /// end moving Down) that is purged or holey. Marks it FETCHING and
    /// returns the exact gap as `(offset, size)`.
    pub(crate) fn plan_prefetch(
        &mut self,
        span_start: usize,
        span_end: usize,
        direction: FetchDirection,
    ) -> Option<(usize, usize)> {
        let boundary = match direction {
            FetchDirection::Up => span_start,
            FetchDirection::Down => span_end,
        };
        let gap_of = |range: &RangeEntry| match direction {
            FetchDirection::Up => (range.start, boundary),
            FetchDirection::Down => (boundary, range.end),
        };
        let idx = self.ranges.iter().position(|range| {
            if !range.contains(boundary) {
                return false;
            }
            let (gap_start, gap_end) = gap_of(range);
            if gap_start >= gap_end {
                return false;
            }
            match range.status {
                RangeStatus::Fetching => false,
                RangeStatus::Purged => true,
                RangeStatus::Ready => !self.is_in_cache(gap_start, gap_end),
            }
        })?;
        let (gap_start, gap_end) = gap_of(&self.ranges[idx]);
        self.ranges[idx].status = RangeStatus::Fetching;
        Some((gap_start, gap_end - gap_start))
    }
}

// =============================================================================
// TESTS
// =============================================================================
