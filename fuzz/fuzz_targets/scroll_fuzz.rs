//! Fuzz test for the viewport scroller's trigger geometry
//!
//! This fuzz target feeds arbitrary f64 scroll reports to find:
//! - Panics or crashes on NaN or infinite geometry
//! - Fetch plans outside the configured bounds
//! - Fetches past the row cap
//!
//! Run with: cargo +nightly fuzz run scroll_fuzz -- -max_total_time=60

#![no_main]

use std::sync::Arc;

use libfuzzer_sys::fuzz_target;
use windrow_scroll::{ScrollFetchResult, ScrollerOptions, Viewport, ViewportScroller};
use windrow_test_utils::ArrayDataProvider;

fuzz_target!(|data: &[u8]| {
    let rt = tokio::runtime::Builder::new_current_thread()
        .build()
        .unwrap();
    let provider = Arc::new(ArrayDataProvider::with_rows(64));
    let options = ScrollerOptions::new()
        .with_fetch_size(16)
        .with_max_row_count(64);
    let scroller = ViewportScroller::new(provider, options);

    let mut saw_done = false;
    for chunk in data.chunks_exact(24) {
        let offset = f64::from_le_bytes(chunk[0..8].try_into().unwrap());
        let viewport_extent = f64::from_le_bytes(chunk[8..16].try_into().unwrap());
        let max_scroll = f64::from_le_bytes(chunk[16..24].try_into().unwrap());
        let viewport = Viewport {
            offset,
            viewport_extent,
            max_scroll,
        };

        let crossed = scroller.on_scroll(viewport);

        // A report scrolled to (or past) the end always crosses the trigger.
        if max_scroll <= offset {
            assert!(crossed, "end-of-scroll report must cross the trigger");
        }

        // Overflow mirrors the report exactly; NaN never counts as overflow.
        assert_eq!(scroller.is_overflow(), max_scroll > 0.0);

        if crossed {
            let at = scroller.row_count();
            match rt.block_on(scroller.fetch_next()) {
                Ok(Some(ScrollFetchResult::Fetched {
                    offset: fetch_offset,
                    results,
                    done,
                })) => {
                    assert_eq!(fetch_offset, at, "fetches must append at the high-water mark");
                    assert!(results.len() <= 16, "fetch must not exceed the fetch size");
                    assert!(fetch_offset + results.len() <= 64, "fetch past the row cap");
                    if done {
                        saw_done = true;
                    }
                }
                Ok(Some(ScrollFetchResult::Done)) => saw_done = true,
                Ok(None) => {}
                Err(_) => unreachable!("array provider never fails"),
            }
        }

        if saw_done {
            assert!(
                scroller.check_viewport().is_none(),
                "no fill plan after the scroller reported done"
            );
        } else if let Some(plan) = scroller.check_viewport() {
            assert!(plan.size >= 1, "fill plan must fetch at least one row");
            assert!(plan.size <= 16, "fill plan must not exceed the fetch size");
            assert_eq!(
                plan.offset,
                scroller.row_count(),
                "fill plan must start at the high-water mark"
            );
        }
    }
});
