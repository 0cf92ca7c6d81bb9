//! windrow Scroll - Viewport-Driven Fetching
//!
//! A headless high-water-mark fetcher: the embedding surface feeds scroll
//! geometry in, fetch decisions and fetched rows come out. No rendering
//! assumptions; "viewport" is whatever the embedder measures.
//!
//! The scroller keeps a fetch trigger at half the remaining scroll
//! distance so a long fling issues one fetch, not one per scroll tick,
//! and caps total fetched rows at a configured maximum.

mod scroller;

pub use scroller::{
    FetchPlan, InputKind, ScrollFetchResult, ScrollerOptions, Viewport, ViewportScroller,
};
