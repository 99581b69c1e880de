//! Property tests for the invariants spec.md §8 lists as testable.

use proptest::collection::{hash_set, vec as pvec};
use proptest::prelude::*;

use racoherence::cl_group::{ClGroup, ClGroupKind};
use racoherence::config::{CACHE_LINE_SHIFT, GROUP_SHIFT};
use racoherence::log_manager::LogManager;
use racoherence::tracker::ClTracker;

fn arb_cl_addr() -> impl Strategy<Value = u64> {
    (0u64..4096).prop_map(|line| line << CACHE_LINE_SHIFT)
}

proptest! {
    /// Invariant 1: mark/clear round-trips to "not dirty", and both
    /// operations are idempotent.
    #[test]
    fn tracker_mark_clear_round_trip(addrs in hash_set(arb_cl_addr(), 1..64)) {
        let tracker = ClTracker::new();
        for &a in &addrs {
            tracker.mark_dirty(a);
            tracker.mark_dirty(a);
        }
        for &a in &addrs {
            prop_assert!(tracker.is_dirty(a));
        }
        for &a in &addrs {
            tracker.clear_dirty(a);
            tracker.clear_dirty(a);
        }
        for &a in &addrs {
            prop_assert!(!tracker.is_dirty(a));
        }
    }

    /// Invariant 2 (length-based): iterating a `(g, n)` entry yields the
    /// n group base addresses `g, g+2^10, ..., g+(n-1)*2^10`, in order.
    #[test]
    fn length_based_group_iteration_is_contiguous_and_ordered(
        group_index in 0u64..(1u64 << 20),
        length in 1u64..64,
    ) {
        let entry = ClGroup::from_length(group_index, length);
        let base = group_index << GROUP_SHIFT;
        let expect: Vec<u64> = (0..length).map(|i| base + (i << GROUP_SHIFT)).collect();
        let got: Vec<u64> = entry.iter().collect();
        prop_assert_eq!(got, expect);
    }

    /// Invariant 2 (mask-based): iterating a `(g, m)` entry yields exactly
    /// the set bits of `m`, in ascending order.
    #[test]
    fn mask_based_group_iteration_yields_set_bits_ascending(
        group_index in 0u64..(1u64 << 20),
        mask in 0u64..0x10000,
    ) {
        let entry = ClGroup::from_mask(group_index, mask);
        prop_assert_eq!(entry.classify(), ClGroupKind::Mask(group_index, mask));
        let base = group_index << GROUP_SHIFT;
        let expect: Vec<u64> = (0..16u64)
            .filter(|b| mask & (1 << b) != 0)
            .map(|b| base + (b << CACHE_LINE_SHIFT))
            .collect();
        let got: Vec<u64> = entry.iter().collect();
        prop_assert_eq!(got, expect);
    }

    /// Invariant 4: for a single publisher, successive release logs carry
    /// strictly increasing `rel_clk`; non-release logs carry 0.
    #[test]
    fn release_clock_strictly_increases_across_releases(
        releases in pvec(any::<bool>(), 1..40),
    ) {
        let lm = LogManager::new(0, 1, 64, 4);
        let mut last_rel_clk = 0u32;
        for is_release in releases {
            let handle = lm.get_new_log().expect("ring large enough for this test");
            let rel_clk = handle.produce_tail(is_release);
            if is_release {
                prop_assert!(rel_clk > last_rel_clk);
                last_rel_clk = rel_clk;
            } else {
                prop_assert_eq!(rel_clk, 0);
            }
        }
    }

    /// Invariant 8: `invalidate_range_if_dirty([b, e))` returns true iff
    /// any bit in range was set, and clears exactly those bits.
    #[test]
    fn invalidate_range_reports_and_clears_exactly_the_dirty_bits_in_range(
        dirty_lines in hash_set(0u64..256, 0..20),
        range_start in 0u64..256,
        range_len in 1u64..64,
    ) {
        let tracker = ClTracker::new();
        let base = 0x10_0000u64;
        for &line in &dirty_lines {
            tracker.mark_dirty(base + (line << CACHE_LINE_SHIFT));
        }

        let begin = base + (range_start << CACHE_LINE_SHIFT);
        let end = begin + (range_len << CACHE_LINE_SHIFT);

        let expect_any = dirty_lines
            .iter()
            .any(|&line| line >= range_start && line < range_start + range_len);

        let got_any = tracker.invalidate_range_if_dirty(begin, end);
        prop_assert_eq!(got_any, expect_any);

        for &line in &dirty_lines {
            let addr = base + (line << CACHE_LINE_SHIFT);
            let in_range = line >= range_start && line < range_start + range_len;
            prop_assert_eq!(tracker.is_dirty(addr), !in_range);
        }
    }
}
