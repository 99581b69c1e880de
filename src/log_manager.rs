//! Per-publishing-node log manager: a bounded SPMC ring of [`Log`]s with a
//! release-indexed clock.
//!
//! Grounded on `original_source/include/logManager.hpp`, implementing the
//! `alloc_tail + bound` ring variant (the freelist-based and
//! generation-parity variants in the original are documented
//! alternatives, not built here).
//!
//! # Safety
//!
//! Log slots are stored in `UnsafeCell`s, not `Mutex`es: the ring's index
//! arithmetic (`alloc_tail`, `bound`, `tail`, `heads`) already serializes
//! access to each slot so that at most one thread ever holds it in the
//! WRITING state, and a slot is only readable by consumers once `tail`'s
//! release store has made it PUBLISHED. The happens-before argument is the
//! same shape as a one-shot channel built on an `UnsafeCell`: a release
//! store on the producer side paired with an acquire load on the consumer
//! side stands in for a lock.

use std::cell::UnsafeCell;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Mutex;

use crossbeam_utils::CachePadded;

use crate::cl_group::ClGroup;
use crate::clock::ClockValue;
use crate::log::Log;

/// Ring index with a parity bit so index comparisons stay cheap and
/// wrap-aware (spec.md §9: `{generation_parity:1, index:log2(LOG_BUF_SIZE)}`).
pub type ParIdx = u32;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TakeHeadResult {
    Log(ParIdx),
    None,
}

struct Ring {
    par_bit: u32,
    size_mask: u32,
}

impl Ring {
    fn new(log_buf_size: usize) -> Self {
        assert!(
            log_buf_size >= 2 && (log_buf_size & (log_buf_size - 1)) == 0,
            "LOG_BUF_SIZE must be a power of two >= 2"
        );
        Ring {
            par_bit: (log_buf_size as u32) << 1,
            size_mask: log_buf_size as u32 - 1,
        }
    }

    fn next(&self, idx: ParIdx) -> ParIdx {
        (idx + 1) & (self.par_bit - 1)
    }

    fn flip(&self, idx: ParIdx) -> ParIdx {
        idx ^ (self.size_mask + 1)
    }

    fn get_idx(&self, idx: ParIdx) -> usize {
        (idx & self.size_mask) as usize
    }

    /// Cyclic position of `h` relative to `from`, in ring order: how many
    /// `next()` steps from `from` reach `h`. Used to find the minimum head
    /// "starting from the current bound" (spec.md §4.5 GC algorithm).
    fn distance_from(&self, from: ParIdx, h: ParIdx) -> u32 {
        (h.wrapping_sub(from)) & (self.par_bit - 1)
    }
}

/// Per-publishing-node bounded SPMC ring of logs.
pub struct LogManager {
    ring: Ring,
    logs: Box<[UnsafeCell<Log>]>,
    log_buf_size: usize,

    tail_mtx: Mutex<()>,
    tail: AtomicU32,
    alloc_tail: AtomicU32,
    bound: AtomicU32,
    rel_clk: AtomicU32,

    gc_mtx: Mutex<()>,
    heads: Box<[CachePadded<AtomicU32>]>,
    head_mtxs: Box<[CachePadded<Mutex<()>>]>,
    subscribed: Box<[bool]>,

    node_count: usize,
    self_node: usize,
}

// Safety: see module doc. Each slot's WRITING state is exclusive to the
// thread that won the `alloc_tail` CAS; PUBLISHED slots are read-only and
// their contents are made visible by `tail`'s release store paired with
// an acquire load in `take_head`.
unsafe impl Sync for LogManager {}

impl LogManager {
    pub fn new(self_node: usize, node_count: usize, log_buf_size: usize, log_size: usize) -> Self {
        let ring = Ring::new(log_buf_size);
        let mut logs = Vec::with_capacity(log_buf_size);
        for _ in 0..log_buf_size {
            logs.push(UnsafeCell::new(Log::new(log_size)));
        }
        let mut heads = Vec::with_capacity(node_count);
        let mut head_mtxs = Vec::with_capacity(node_count);
        for _ in 0..node_count {
            heads.push(CachePadded::new(AtomicU32::new(0)));
            head_mtxs.push(CachePadded::new(Mutex::new(())));
        }

        LogManager {
            bound: AtomicU32::new(ring.flip(0)),
            ring,
            logs: logs.into_boxed_slice(),
            log_buf_size,
            tail_mtx: Mutex::new(()),
            tail: AtomicU32::new(0),
            alloc_tail: AtomicU32::new(0),
            rel_clk: AtomicU32::new(0),
            gc_mtx: Mutex::new(()),
            heads: heads.into_boxed_slice(),
            head_mtxs: head_mtxs.into_boxed_slice(),
            subscribed: vec![true; node_count].into_boxed_slice(),
            node_count,
            self_node,
        }
    }

    pub fn is_subscribed(&self, consumer_id: usize) -> bool {
        self.subscribed[consumer_id]
    }

    pub fn set_subscribed(&mut self, consumer_id: usize, value: bool) {
        self.subscribed[consumer_id] = value;
    }

    pub fn get_head_mutex(&self, consumer_id: usize) -> &Mutex<()> {
        &self.head_mtxs[consumer_id]
    }

    /// GC: compute `new_bound` as the minimum, in ring order starting from
    /// the current `bound`, of every subscribed consumer's head (other
    /// than this publisher's own index). Must be called with `gc_mtx`
    /// held.
    fn perform_gc(&self) {
        let bound = self.bound.load(Ordering::Relaxed);
        let mut new_bound: Option<ParIdx> = None;
        for c in 0..self.node_count {
            if c == self.self_node || !self.subscribed[c] {
                continue;
            }
            let h = self.ring.flip(self.heads[c].load(Ordering::Relaxed));
            new_bound = Some(match new_bound {
                None => h,
                Some(best) => {
                    if self.ring.distance_from(bound, h) < self.ring.distance_from(bound, best) {
                        h
                    } else {
                        best
                    }
                }
            });
        }
        if let Some(nb) = new_bound {
            self.bound.store(nb, Ordering::Relaxed);
            tracing::debug!(node = self.self_node, new_bound = nb, "log manager GC advanced bound");
        }
    }

    /// Claim a fresh WRITING slot. Returns `None` if the ring is still
    /// full after attempting GC (spec.md §4.5).
    pub fn get_new_log(&self) -> Option<LogHandle<'_>> {
        loop {
            let at = self.alloc_tail.load(Ordering::Relaxed);
            let bound = self.bound.load(Ordering::Relaxed);
            let used = self.ring.distance_from(bound, at);
            if (used as usize) < self.log_buf_size {
                let next = self.ring.next(at);
                if self
                    .alloc_tail
                    .compare_exchange(at, next, Ordering::Relaxed, Ordering::Relaxed)
                    .is_ok()
                {
                    let idx = self.ring.get_idx(at);
                    // Safety: this thread exclusively owns slot `idx` in
                    // the WRITING state until `produce_tail` is called.
                    unsafe { &mut *self.logs[idx].get() }.reset();
                    return Some(LogHandle {
                        manager: self,
                        claimed: at,
                    });
                }
                continue;
            }

            // Ring looks full from this thread's point of view; try to
            // reclaim space cooperatively.
            match self.gc_mtx.try_lock() {
                Ok(_guard) => {
                    self.perform_gc();
                }
                Err(_) => return None,
            }
            // Loop back around and re-check; another get_new_log racer
            // may also have made progress.
            let at2 = self.alloc_tail.load(Ordering::Relaxed);
            let bound2 = self.bound.load(Ordering::Relaxed);
            if (self.ring.distance_from(bound2, at2) as usize) >= self.log_buf_size {
                return None;
            }
        }
    }

    /// Publish a claimed log, returning the release clock value
    /// (post-incremented if `is_release`).
    fn produce_tail(&self, claimed: ParIdx, is_release: bool) -> ClockValue {
        let _guard = self.tail_mtx.lock().unwrap();
        let idx = self.ring.get_idx(claimed);
        let rel_clk = if is_release {
            self.rel_clk.fetch_add(1, Ordering::Relaxed) + 1
        } else {
            self.rel_clk.load(Ordering::Relaxed)
        };
        let rel_clk_for_log = if is_release { rel_clk } else { 0 };
        // Safety: exclusive WRITING access to this slot ends here.
        unsafe { &mut *self.logs[idx].get() }.set_release(is_release, rel_clk_for_log);

        let t = self.tail.load(Ordering::Relaxed);
        debug_assert_eq!(t, claimed, "logs must publish in claim order");
        self.tail.store(self.ring.next(t), Ordering::Release);
        tracing::debug!(node = self.self_node, rel_clk, is_release, "published log");
        rel_clk_for_log
    }

    /// Non-blocking read of the next unconsumed log for `consumer_id`.
    pub fn take_head(&self, consumer_id: usize) -> Option<LogRef<'_>> {
        let h = self.heads[consumer_id].load(Ordering::Relaxed);
        let t = self.tail.load(Ordering::Acquire);
        if h == t {
            return None;
        }
        let idx = self.ring.get_idx(h);
        // Safety: `tail`'s acquire load happens-after the producer's
        // release store in `produce_tail`, so the slot's contents (written
        // before that release) are visible here.
        let log_ref = unsafe { &*self.logs[idx].get() };
        Some(LogRef { log: log_ref, head: h })
    }

    /// Advance this consumer's head past the log it just processed.
    pub fn consume_head(&self, consumer_id: usize) {
        let h = self.heads[consumer_id].load(Ordering::Relaxed);
        self.heads[consumer_id].store(self.ring.next(h), Ordering::Relaxed);
    }
}

/// A claimed, exclusively-owned WRITING slot.
pub struct LogHandle<'a> {
    manager: &'a LogManager,
    claimed: ParIdx,
}

impl<'a> LogHandle<'a> {
    pub fn write(&self, entry: ClGroup) -> bool {
        let idx = self.manager.ring.get_idx(self.claimed);
        // Safety: see `LogManager`'s Sync justification; exclusive until
        // `produce_tail` is called (which consumes `self`).
        unsafe { &mut *self.manager.logs[idx].get() }.write(entry)
    }

    pub fn is_full(&self) -> bool {
        let idx = self.manager.ring.get_idx(self.claimed);
        unsafe { &*self.manager.logs[idx].get() }.is_full()
    }

    /// Publish this log, returning the release clock value.
    pub fn produce_tail(self, is_release: bool) -> ClockValue {
        self.manager.produce_tail(self.claimed, is_release)
    }
}

/// A read-only view of a published log, valid until the caller advances
/// the head past it via [`LogManager::consume_head`].
pub struct LogRef<'a> {
    log: &'a Log,
    head: ParIdx,
}

impl<'a> LogRef<'a> {
    pub fn log(&self) -> &Log {
        self.log
    }

    pub fn head(&self) -> ParIdx {
        self.head
    }
}
