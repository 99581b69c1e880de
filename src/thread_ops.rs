//! Per-thread release/acquire glue: the interposition layer's only
//! customer. Coalesces dirtied cache lines into a [`LocalClTable`], drains
//! them into a node's [`LogManager`] at release, and brings a thread's
//! view of peer clocks up to date at acquire.
//!
//! Grounded on `original_source/include/threadOps.hpp`.

use std::sync::Arc;

use crate::cache_agent::{drain_one_log, CacheInfo, ConsumePolicy};
use crate::cl_group::ClGroup;
use crate::clock::VectorClock;
use crate::config::RuntimeConfig;
use crate::local_table::{InsertOutcome, LocalClTable};
use crate::log_manager::{LogHandle, LogManager};

/// Per-thread state tying one worker to its node's coherence machinery.
///
/// Not `Sync`: exactly one thread drives a given `ThreadOps`, matching the
/// original's thread-local `threadOps` instance.
pub struct ThreadOps<'a> {
    node_id: usize,
    table: LocalClTable,
    thread_clock: VectorClock,
    log_mgrs: &'a [LogManager],
    cache_infos: &'a [Arc<CacheInfo>],
    curr_log: Option<LogHandle<'a>>,
    config: RuntimeConfig,
    /// Cl-unit index of the last line this thread stored to, or 0 if
    /// nothing has been stored since the last release. Lets a tight loop
    /// storing to the same line repeatedly skip the table insert, and
    /// lets `thread_release` tell a genuinely empty release apart from
    /// one with buffered writes.
    recent_cl: u64,
}

impl<'a> ThreadOps<'a> {
    pub fn new(
        node_id: usize,
        log_mgrs: &'a [LogManager],
        cache_infos: &'a [Arc<CacheInfo>],
        config: RuntimeConfig,
    ) -> Self {
        ThreadOps {
            node_id,
            table: LocalClTable::new(config.local_cl_table_buffer),
            thread_clock: VectorClock::new(config.node_count),
            log_mgrs,
            cache_infos,
            curr_log: None,
            config,
            recent_cl: 0,
        }
    }

    pub fn thread_clock(&self) -> &VectorClock {
        &self.thread_clock
    }

    fn log_mgr(&self) -> &'a LogManager {
        &self.log_mgrs[self.node_id]
    }

    /// Record a single dirtied cache line. Drains the write-set table into
    /// the log on overflow and retries (spec.md §4.2). Under `eager_flush`
    /// the line is written back to the shared region immediately instead
    /// of waiting for this entry to reach a published log.
    pub fn log_store(&mut self, cl_addr: u64) {
        if self.config.protocol_off {
            return;
        }
        // Line 0 aliases the "nothing stored" sentinel, same simplification
        // the original makes with `recent_cl`.
        let line = cl_addr >> crate::config::CACHE_LINE_SHIFT;
        if line == self.recent_cl {
            return;
        }
        self.recent_cl = line;
        loop {
            match self.table.insert(cl_addr) {
                InsertOutcome::Ok => break,
                InsertOutcome::Overflow => self.drain_table_to_log(),
            }
        }
        if self.config.eager_flush {
            crate::flush::do_flush(cl_addr);
            crate::flush::flush_fence();
        }
    }

    /// Record a `[begin, end)` run of dirtied cl-unit addresses.
    pub fn log_range_store(&mut self, begin_cl: u64, end_cl: u64) {
        if self.config.protocol_off {
            return;
        }
        self.recent_cl = end_cl;
        loop {
            match self.table.range_insert(begin_cl, end_cl) {
                InsertOutcome::Ok => break,
                InsertOutcome::Overflow => self.drain_table_to_log(),
            }
        }
        if self.config.eager_flush {
            let mut addr = begin_cl;
            while addr < end_cl {
                crate::flush::do_flush(addr << crate::config::CACHE_LINE_SHIFT);
                addr += 1;
            }
            crate::flush::flush_fence();
        }
    }

    fn drain_table_to_log(&mut self) {
        if self.table.has_buffered_ranges() {
            while self.table.dump_buffer_to_table() == InsertOutcome::Overflow {
                self.flush_table_entries();
            }
        }
        self.flush_table_entries();
    }

    fn flush_table_entries(&mut self) {
        let entries: Vec<ClGroup> = self.table.iter().collect();
        for entry in entries {
            self.write_to_log(entry);
        }
        self.table.clear();
    }

    /// Append one cl-group entry to this thread's in-flight log, claiming
    /// a fresh one as needed. Under `delay_publish`, a log is kept open
    /// across calls and only published (non-release) once full; without
    /// it, every entry gets its own eagerly-published log (spec.md §9
    /// `DELAY_PUBLISH`).
    pub fn write_to_log(&mut self, entry: ClGroup) {
        if !self.config.delay_publish {
            let handle = self.claim_log();
            handle.write(entry);
            handle.produce_tail(false);
            return;
        }

        loop {
            if self.curr_log.is_none() {
                self.curr_log = Some(self.claim_log());
            }
            let handle = self.curr_log.as_ref().unwrap();
            if handle.write(entry) {
                return;
            }
            let full = self.curr_log.take().unwrap();
            full.produce_tail(false);
        }
    }

    fn claim_log(&self) -> LogHandle<'a> {
        loop {
            if let Some(handle) = self.log_mgr().get_new_log() {
                return handle;
            }
            std::thread::yield_now();
        }
    }

    /// Flush this thread's write set, publish the accumulated (or a fresh,
    /// empty) log as a release, and record the resulting release clock as
    /// this thread's own component. A release with no stores since the
    /// last one (`recent_cl == 0`) publishes nothing and returns the
    /// thread's clock unchanged.
    pub fn thread_release(&mut self) -> u32 {
        if self.config.protocol_off {
            return 0;
        }
        if self.recent_cl == 0 {
            return self.thread_clock.get(self.node_id);
        }
        self.recent_cl = 0;
        self.drain_table_to_log();
        let handle = match self.curr_log.take() {
            Some(h) => h,
            None => self.claim_log(),
        };
        let rel_clk = handle.produce_tail(true);
        self.thread_clock.set(self.node_id, rel_clk);
        tracing::debug!(node = self.node_id, rel_clk, "thread release");
        rel_clk
    }

    /// Bring this thread's clock up to date with `target` before
    /// proceeding past an acquire. `target` is the release clock read from
    /// the acquired location.
    pub fn thread_acquire(&mut self, target: &VectorClock) {
        if self.config.protocol_off {
            return;
        }
        if self.config.help_consume {
            self.help_consume(target);
        } else {
            self.wait_for_consume(target);
        }
        self.pull_cached_clocks();
    }

    fn pull_cached_clocks(&mut self) {
        for peer in 0..self.log_mgrs.len() {
            if peer == self.node_id {
                continue;
            }
            let peer_clk = self.cache_infos[self.node_id].cached_clock(peer);
            self.thread_clock.merge_at(peer, peer_clk);
        }
    }

    fn caught_up_with(&self, target: &VectorClock) -> bool {
        let info = &self.cache_infos[self.node_id];
        (0..self.log_mgrs.len()).all(|peer| {
            peer == self.node_id || info.cached_clock(peer) >= target.get(peer)
        })
    }

    /// Actively drain peer logs on the calling thread instead of waiting
    /// for the background cache agent (`USER_HELP_CONSUME`).
    fn help_consume(&mut self, target: &VectorClock) {
        let policy = ConsumePolicy {
            eager_invalidate: self.config.eager_invalidate,
            wbinvd_path: self.config.wbinvd_path,
            wbinvd_threshold: self.config.wbinvd_threshold,
        };
        while !self.caught_up_with(target) {
            let mut progressed = false;
            for peer in 0..self.log_mgrs.len() {
                if peer == self.node_id {
                    continue;
                }
                if drain_one_log(self.node_id, peer, self.log_mgrs, &self.cache_infos[self.node_id], policy) {
                    progressed = true;
                }
            }
            if !progressed {
                std::thread::yield_now();
            }
        }
    }

    /// Spin/park until the background cache agent has caught this node up
    /// to `target`.
    fn wait_for_consume(&mut self, target: &VectorClock) {
        while !self.caught_up_with(target) {
            std::thread::yield_now();
        }
    }
}
