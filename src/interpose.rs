//! Interposition entry points: the functions a compile-time instrumentation
//! pass would call at every load/store against the shared region.
//!
//! A real instrumentation pass is out of scope (spec.md Non-goals); this
//! module models its call sites directly against a `RaRegion` test double
//! so unit and integration tests can drive the engine without one.
//! Grounded on spec.md §4.9 and `original_source/include/threadOps.hpp`'s
//! `on_load`/`on_store` shape.

use std::sync::Arc;

use crate::cache_agent::CacheInfo;
use crate::thread_ops::ThreadOps;

/// Remembers the last cache line this thread invalidated-on-load, so a
/// tight loop reading the same line repeatedly doesn't re-check the
/// tracker on every iteration (spec.md §4.9 recency filter).
#[derive(Default)]
pub struct RecentCl {
    last: Option<u64>,
}

impl RecentCl {
    pub fn new() -> Self {
        RecentCl { last: None }
    }

    /// True if `cl_addr` is the same line we last saw (and can skip the
    /// tracker check for).
    fn is_recent(&self, cl_addr: u64) -> bool {
        self.last == Some(cl_addr)
    }

    fn remember(&mut self, cl_addr: u64) {
        self.last = Some(cl_addr);
    }

    fn forget(&mut self) {
        self.last = None;
    }
}

/// Invalidate `cl_addr` if a peer has dirtied it since this node last
/// looked, honoring the recency filter.
fn maybe_invalidate(info: &CacheInfo, recent: &mut RecentCl, cl_addr: u64) {
    if recent.is_recent(cl_addr) {
        return;
    }
    if info.tracker().invalidate_if_dirty(cl_addr) {
        recent.forget();
    } else {
        recent.remember(cl_addr);
    }
}

// Called before a load from the shared region: invalidate the line if a
// peer has dirtied it, then read.
macro_rules! on_load_n {
    ($name:ident, $ty:ty) => {
        pub fn $name(info: &CacheInfo, recent: &mut RecentCl, addr: *const $ty) -> $ty {
            let cl_addr = addr as u64 & !(crate::config::CACHE_LINE_SIZE - 1);
            maybe_invalidate(info, recent, cl_addr);
            unsafe { std::ptr::read_volatile(addr) }
        }
    };
}

// Called after a store into the shared region: write through, then record
// the line as dirtied in this thread's write-set.
macro_rules! on_store_n {
    ($name:ident, $ty:ty) => {
        pub fn $name(ops: &mut ThreadOps<'_>, addr: *mut $ty, value: $ty) {
            unsafe { std::ptr::write_volatile(addr, value) };
            let cl_addr = addr as u64 & !(crate::config::CACHE_LINE_SIZE - 1);
            ops.log_store(cl_addr);
        }
    };
}

on_load_n!(on_load_8, u8);
on_load_n!(on_load_16, u16);
on_load_n!(on_load_32, u32);
on_load_n!(on_load_64, u64);

on_store_n!(on_store_8, u8);
on_store_n!(on_store_16, u16);
on_store_n!(on_store_32, u32);
on_store_n!(on_store_64, u64);

/// Called before a load spanning `[addr, addr + len)`: invalidate every
/// dirtied line in range, then read.
pub fn on_range_load(info: &CacheInfo, addr: *const u8, len: usize) {
    let begin = addr as u64;
    let end = begin + len as u64;
    info.tracker().invalidate_range_if_dirty(begin, end);
}

/// Invalidate the first and last cache line of `[begin, end)` before a
/// bulk range store. Interior lines are fully overwritten by the copy
/// that follows, but a line only partially covered by the range could
/// still carry a peer's dirty bytes in the portion the copy leaves alone
/// — grounded on `original_source/src/instrumentLib.cpp`'s
/// `invalidate_boundaries(dst_begin, dst_end)`, called before every
/// `memcpy`/`memmove`/`memset` into the shared region.
fn invalidate_boundaries(info: &CacheInfo, begin: u64, end: u64) {
    let first_line = begin & !(crate::config::CACHE_LINE_SIZE - 1);
    let last_line = (end - 1) & !(crate::config::CACHE_LINE_SIZE - 1);
    info.tracker().invalidate_if_dirty(first_line);
    if last_line != first_line {
        info.tracker().invalidate_if_dirty(last_line);
    }
}

/// Called around a store spanning `[dst, dst + len)` sourced from `src`
/// (the destination side of a `memcpy`/`memmove`/`memset`-style bulk
/// write): invalidate the boundary lines a peer may have partially
/// dirtied, perform the copy, then record the whole range as dirtied in
/// this thread's write-set.
pub fn on_range_store(info: &CacheInfo, ops: &mut ThreadOps<'_>, dst: *mut u8, src: *const u8, len: usize) {
    let begin = dst as u64;
    let end = begin + len as u64;
    invalidate_boundaries(info, begin, end);

    unsafe {
        for i in 0..len {
            std::ptr::write_volatile(dst.add(i), std::ptr::read_volatile(src.add(i)));
        }
    }

    let begin_cl = begin >> crate::config::CACHE_LINE_SHIFT;
    let end_cl = (end + crate::config::CACHE_LINE_SIZE - 1) >> crate::config::CACHE_LINE_SHIFT;
    ops.log_range_store(begin_cl, end_cl);
}

/// Convenience wrapper pairing a [`ThreadOps`] with the [`RecentCl`]
/// filter its loads use, mirroring the original's combined thread-local
/// state.
pub struct InterposeCtx<'a> {
    pub ops: ThreadOps<'a>,
    pub info: Arc<CacheInfo>,
    pub recent: RecentCl,
}

impl<'a> InterposeCtx<'a> {
    pub fn new(ops: ThreadOps<'a>, info: Arc<CacheInfo>) -> Self {
        InterposeCtx {
            ops,
            info,
            recent: RecentCl::new(),
        }
    }

    pub fn load_64(&mut self, addr: *const u64) -> u64 {
        on_load_64(&self.info, &mut self.recent, addr)
    }

    pub fn store_64(&mut self, addr: *mut u64, value: u64) {
        on_store_64(&mut self.ops, addr, value)
    }

    pub fn range_store(&mut self, dst: *mut u8, src: *const u8, len: usize) {
        on_range_store(&self.info, &mut self.ops, dst, src, len)
    }

    pub fn release(&mut self) -> u32 {
        self.ops.thread_release()
    }

    pub fn acquire(&mut self, target: &crate::clock::VectorClock) {
        self.ops.thread_acquire(target)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RuntimeConfig;
    use crate::log_manager::LogManager;

    #[test]
    fn recent_cl_skips_repeat_same_line_checks() {
        let mut recent = RecentCl::new();
        assert!(!recent.is_recent(0x1000));
        recent.remember(0x1000);
        assert!(recent.is_recent(0x1000));
        recent.forget();
        assert!(!recent.is_recent(0x1000));
    }

    #[test]
    fn on_store_then_on_load_round_trip_through_shared_memory() {
        let config = RuntimeConfig::scenario_default();
        let log_mgrs: Vec<LogManager> = (0..config.node_count)
            .map(|n| LogManager::new(n, config.node_count, config.log_buf_size, config.log_size))
            .collect();
        let cache_infos: Vec<Arc<CacheInfo>> =
            (0..config.node_count).map(|_| Arc::new(CacheInfo::new(config.node_count))).collect();

        let mut cell: u64 = 0;
        let ptr = &mut cell as *mut u64;

        let mut ctx = InterposeCtx::new(ThreadOps::new(0, &log_mgrs, &cache_infos, config), cache_infos[0].clone());
        on_store_64(&mut ctx.ops, ptr, 42);
        assert_eq!(unsafe { *ptr }, 42);

        let mut recent = RecentCl::new();
        let read = on_load_64(&cache_infos[0], &mut recent, ptr as *const u64);
        assert_eq!(read, 42);
    }

    #[test]
    fn on_range_store_copies_bytes_and_invalidates_boundary_lines() {
        let config = RuntimeConfig::scenario_default();
        let log_mgrs: Vec<LogManager> = (0..config.node_count)
            .map(|n| LogManager::new(n, config.node_count, config.log_buf_size, config.log_size))
            .collect();
        let cache_infos: Vec<Arc<CacheInfo>> =
            (0..config.node_count).map(|_| Arc::new(CacheInfo::new(config.node_count))).collect();

        let mut dst = [0u8; 96];
        let src = [7u8; 96];
        let dst_ptr = dst.as_mut_ptr();
        // A peer previously dirtied the line covering the tail of the
        // range; the copy should leave that tail invalidated even though
        // it only partially overlaps the destination.
        let base = dst_ptr as u64;
        cache_infos[0].tracker().mark_dirty(base);
        cache_infos[0].tracker().mark_dirty((base + 64) & !63);

        let mut ops = ThreadOps::new(0, &log_mgrs, &cache_infos, config);
        on_range_store(&cache_infos[0], &mut ops, dst_ptr, src.as_ptr(), dst.len());

        assert_eq!(&dst[..], &src[..]);
        assert!(!cache_infos[0].tracker().is_dirty(base));
        assert!(!cache_infos[0].tracker().is_dirty((base + 64) & !63));
    }
}
