//! End-to-end scenarios from spec.md §8, parameterized with
//! `NODE_COUNT=2, WORKER_PER_NODE=1, LOG_SIZE=4, LOG_BUF_SIZE=4` via
//! [`RuntimeConfig::scenario_default`].

use racoherence::config::RuntimeConfig;
use racoherence::runtime::Runtime;

fn wait_until(mut cond: impl FnMut() -> bool) {
    let mut spins = 0;
    while !cond() {
        std::thread::yield_now();
        spins += 1;
        assert!(spins < 1_000_000, "condition never became true");
    }
}

/// S1: single release, node 1 spins on an acquire-load, then reads the
/// lines node 0 dirtied.
#[test]
fn s1_single_release_is_observed_after_acquire() {
    let rt = Runtime::new(RuntimeConfig::scenario_default()).unwrap();

    let mut writer = rt.new_thread_ops(0);
    writer.log_store(0x40);
    writer.log_store(0xC0);
    let rel_clk = writer.thread_release();

    let mut target = racoherence::VectorClock::new(2);
    target.set(0, rel_clk);

    let mut reader = rt.new_thread_ops(1);
    reader.thread_acquire(&target);

    assert!(reader.thread_clock().get(0) >= rel_clk);
    let info = rt.cache_info(1);
    wait_until(|| info.tracker().is_dirty(0x40) && info.tracker().is_dirty(0xC0));

    rt.shutdown();
}

/// S2: node 0 dirties `LOG_SIZE * 2 = 8` distinct groups then releases.
/// With `LOG_SIZE=4`, the 8 entries fill exactly two logs; the first is
/// published as a non-release log once full, the second becomes the
/// release log. Expect 2 published logs total and `rel_clk = 1`.
#[test]
fn s2_overflow_drain_publishes_multiple_logs_before_release() {
    let config = RuntimeConfig::scenario_default();
    let rt = Runtime::new(config.clone()).unwrap();

    let mut writer = rt.new_thread_ops(0);
    for g in 0..(config.log_size as u64 * 2) {
        writer.log_store(g << racoherence::config::GROUP_SHIFT);
    }
    let rel_clk = writer.thread_release();
    assert_eq!(rel_clk, 1);

    let info = rt.cache_info(1);
    wait_until(|| info.logs_consumed() >= 2);
    assert_eq!(info.logs_consumed(), 2);

    rt.shutdown();
}

/// S3: node 0 performs `LOG_BUF_SIZE + 2` releases while node 1 never
/// acquires; the ring must apply backpressure, and once node 1 catches up
/// its cached clock for node 0 reaches the final `rel_clk`.
#[test]
fn s3_ring_pressure_eventually_drains_once_consumer_catches_up() {
    let config = RuntimeConfig::scenario_default();
    let rt = Runtime::new(config.clone()).unwrap();

    let mut writer = rt.new_thread_ops(0);
    let mut last_rel_clk = 0;
    for i in 0..(config.log_buf_size + 2) {
        writer.log_store((i as u64) << racoherence::config::GROUP_SHIFT);
        last_rel_clk = writer.thread_release();
    }

    let info = rt.cache_info(1);
    wait_until(|| info.cached_clock(0) == last_rel_clk);

    rt.shutdown();
}

/// S4: two workers on node 0 alternate releases to the same node; a
/// worker on node 1 eventually observes the final release clock.
#[test]
fn s4_contended_releases_from_one_node_converge() {
    let config = RuntimeConfig::scenario_default();
    let rt = Runtime::new(config).unwrap();

    let mut worker_a = rt.new_thread_ops(0);
    let mut worker_b = rt.new_thread_ops(0);

    let mut last = 0;
    for i in 0..10 {
        last = if i % 2 == 0 {
            worker_a.log_store(i << racoherence::config::GROUP_SHIFT);
            worker_a.thread_release()
        } else {
            worker_b.log_store(i << racoherence::config::GROUP_SHIFT);
            worker_b.thread_release()
        };
    }

    let info = rt.cache_info(1);
    wait_until(|| info.cached_clock(0) == last);

    rt.shutdown();
}

/// S5: a 4 KiB range store, released; node 1 invalidates the whole range
/// before its next load.
#[test]
fn s5_range_store_publishes_a_length_based_entry_covering_the_range() {
    let config = RuntimeConfig::scenario_default();
    let rt = Runtime::new(config).unwrap();

    let mut writer = rt.new_thread_ops(0);
    let begin_cl = 0u64;
    let end_cl = 4096 / 64; // 4 KiB / 64-byte lines
    writer.log_range_store(begin_cl, end_cl);
    let rel_clk = writer.thread_release();

    let info = rt.cache_info(1);
    wait_until(|| info.cached_clock(0) == rel_clk);
    for line in 0..end_cl {
        assert!(!info.tracker().is_dirty(line << 6), "line {line} should already be invalidated");
    }

    rt.shutdown();
}

/// S6: an acquire then a release with nothing stored in between publishes
/// no log at all, and the thread's own clock component stays unchanged.
#[test]
fn s6_noop_release_only_merges_clocks() {
    let config = RuntimeConfig::scenario_default();
    let rt = Runtime::new(config).unwrap();

    let mut node0 = rt.new_thread_ops(0);
    let zero_target = racoherence::VectorClock::new(2);
    node0.thread_acquire(&zero_target);
    let rel_clk = node0.thread_release();

    assert_eq!(rel_clk, 0);
    assert_eq!(node0.thread_clock().get(0), 0);

    let info = rt.cache_info(1);
    assert_eq!(info.logs_consumed(), 0, "a no-op release must not publish a log");

    rt.shutdown();
}
