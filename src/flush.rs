//! Platform cache-flush and invalidate primitives.
//!
//! Grounded on `original_source/include/flushUtils.hpp` and, for the Rust
//! `core::arch::asm!` shape, `other_examples`' kernel cache-control code
//! (`.../hal/cache.rs`). The `CLFLUSH`/`CLWB`/fence instructions only make
//! sense against memory the caller actually owns (the shared region); by
//! default this module only provides the *ordering* half (a compiler/CPU
//! fence) so the engine is safe to exercise against synthetic test
//! addresses. The real cache-line instructions are behind the
//! `hardware-flush` feature for deployments that run against a real
//! fabric-attached region.

use std::sync::atomic::{fence, Ordering};

use crate::config::CACHE_LINE_SIZE;

#[inline]
fn line_aligned(addr: u64) -> u64 {
    addr & !(CACHE_LINE_SIZE - 1)
}

/// Write back (and on some paths invalidate) the cache line containing
/// `addr`.
#[inline]
pub fn do_flush(addr: u64) {
    let _ = line_aligned(addr);
    #[cfg(all(target_arch = "x86_64", feature = "hardware-flush"))]
    {
        let ptr = line_aligned(addr) as *const u8;
        unsafe {
            std::arch::asm!("clflush [{0}]", in(reg) ptr, options(nostack, preserves_flags));
        }
    }
}

/// Invalidate the cache line containing `addr` so a subsequent local load
/// re-fetches from memory.
#[inline]
pub fn do_invalidate(addr: u64) {
    let _ = line_aligned(addr);
    #[cfg(all(target_arch = "x86_64", feature = "hardware-flush"))]
    {
        let ptr = line_aligned(addr) as *const u8;
        unsafe {
            std::arch::asm!("clflush [{0}]", in(reg) ptr, options(nostack, preserves_flags));
        }
    }
}

/// Fence ordering flushes relative to later loads/stores.
#[inline]
pub fn flush_fence() {
    fence(Ordering::Release);
    #[cfg(all(target_arch = "x86_64", feature = "hardware-flush"))]
    unsafe {
        std::arch::asm!("sfence", options(nostack, preserves_flags));
    }
}

/// Fence ordering invalidates relative to later loads/stores.
#[inline]
pub fn invalidate_fence() {
    fence(Ordering::Acquire);
    #[cfg(all(target_arch = "x86_64", feature = "hardware-flush"))]
    unsafe {
        std::arch::asm!("mfence", options(nostack, preserves_flags));
    }
}

/// Whole-cache invalidate, used by the `WBINVD_PATH` short-circuit when a
/// release log's run of cl-groups exceeds `wbinvd_threshold`.
#[inline]
pub fn wbinvd() {
    fence(Ordering::SeqCst);
    #[cfg(all(target_arch = "x86_64", feature = "hardware-flush"))]
    unsafe {
        std::arch::asm!("wbinvd", options(nostack));
    }
}
