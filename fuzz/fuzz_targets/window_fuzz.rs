//! Fuzz test for the offset window cache under interleaved mutations
//!
//! This fuzz target replays arbitrary fetch/mutate sequences to find:
//! - Panics or crashes in window splicing
//! - Cached results diverging from the backing store
//! - Eviction dropping rows it should have refetched
//!
//! Run with: cargo +nightly fuzz run window_fuzz -- -max_total_time=60

#![no_main]

use std::sync::Arc;

use libfuzzer_sys::fuzz_target;
use windrow_core::{DataProvider, FetchByOffsetParams};
use windrow_providers::{CacheOptions, CachingDataProvider, EvictionStrategy};
use windrow_test_utils::{test_rows, ArrayDataProvider, TestRow};

fuzz_target!(|data: &[u8]| {
    let rt = tokio::runtime::Builder::new_current_thread()
        .build()
        .unwrap();
    rt.block_on(async {
        let array = Arc::new(ArrayDataProvider::with_rows(48));
        let caching = CachingDataProvider::with_options(
            array.clone(),
            CacheOptions::new()
                .with_eviction(EvictionStrategy::Lru)
                .with_miss_threshold(1),
        );

        let mut next_id = 1000u32;
        for chunk in data.chunks_exact(3) {
            let (op, a, b) = (chunk[0], chunk[1] as usize, chunk[2] as usize);
            match op % 5 {
                0 => {
                    let params = FetchByOffsetParams::new(a, (b % 16) + 1);
                    let cached = caching.fetch_by_offset(params.clone()).await.unwrap();
                    let direct = array.fetch_by_offset(params).await.unwrap();
                    assert_eq!(
                        cached.results, direct.results,
                        "cached fetch diverged from the backing store"
                    );
                }
                1 => {
                    if array.len() > 0 {
                        array.remove_row(a % array.len());
                    }
                }
                2 => {
                    array.insert_row(a % (array.len() + 1), TestRow::new(next_id, "fuzzed"));
                    next_id += 1;
                }
                3 => {
                    if array.len() > 0 {
                        array.update_row(a % array.len(), TestRow::new(next_id, "fuzzed"));
                        next_id += 1;
                    }
                }
                _ => array.refresh(test_rows(b % 48)),
            }
        }
    });
});
