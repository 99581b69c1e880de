//! Compile-time-ish tunables for the coherence engine.
//!
//! The original C++ source (`config.hpp`) bakes these into `constexpr`s and
//! preprocessor `#define`s because `NODE_COUNT` sizes `std::array`s. Rust
//! can't parameterize a type by a runtime value the same way, so the
//! per-node containers here (`Vec`-backed) are sized at `Runtime`
//! construction time from [`RuntimeConfig::node_count`] instead, and the
//! protocol knobs that used to be `#ifdef`s become plain fields.

use serde::{Deserialize, Serialize};

/// Cache line size in bytes. Fixed: the sparse tracker's bit layout and
/// the cl-group encoding both assume 64-byte lines.
pub const CACHE_LINE_SIZE: u64 = 64;
pub const CACHE_LINE_SHIFT: u32 = 6;

/// 16 consecutive cache lines form a cl-group (1 KiB).
pub const GROUP_SIZE_SHIFT: u32 = 4;
pub const GROUP_SIZE: u64 = 1 << GROUP_SIZE_SHIFT;
pub const FULL_MASK: u64 = (1u64 << GROUP_SIZE) - 1;
pub const GROUP_SHIFT: u32 = CACHE_LINE_SHIFT + GROUP_SIZE_SHIFT;

/// Virtual address space of the shared region is assumed 48-bit.
pub const VIRTUAL_ADDRESS_BITS: u32 = 48;
pub const GROUP_INDEX_SHIFT: u32 = VIRTUAL_ADDRESS_BITS as u32 - GROUP_SHIFT;
pub const GROUP_INDEX_MASK: u64 = (1u64 << GROUP_INDEX_SHIFT) - 1;
pub const GROUP_LEN_MAX: u64 = (1u64 << 25) - 1;

/// 4 KiB page, 64 cache lines per page.
pub const PAGE_SIZE: u64 = 1 << 12;
pub const CACHE_LINES_PER_PAGE: u64 = PAGE_SIZE / CACHE_LINE_SIZE;

/// Local write-set table sizing, from `localCLTable.hpp`.
pub const TABLE_ENTRIES: usize = 1 << 6;
pub const SEARCH_ITERS: usize = 6;

/// Sparse dirty tracker level sizes, from `clTracker.hpp`.
pub const L1_BITS: u32 = 19;
pub const L2_BITS: u32 = 8;
pub const L1_ENTRIES: usize = 1 << L1_BITS;
pub const L2_ENTRIES: usize = 1 << L2_BITS;

/// Default log capacity and ring size. Overridable per-`Runtime` via
/// [`RuntimeConfig`] (the scenarios in spec.md §8 use much smaller values).
pub const DEFAULT_LOG_SIZE: usize = 64;
pub const DEFAULT_LOG_BUF_SIZE: usize = 1024;

/// How many logs a cache agent drains from one publisher before moving on.
pub const DEFAULT_LOG_MAX_BATCH: usize = 16;

/// Runtime-tunable protocol knobs. In the original these are compile-time
/// `#define`s (`EAGER_INVALIDATE`, `USER_HELP_CONSUME`, ...); here they are
/// plain fields so integration tests can exercise each policy without a
/// recompile, matching spec.md §6 "CLI and config".
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuntimeConfig {
    pub node_count: usize,
    pub workers_per_node: usize,
    pub log_size: usize,
    pub log_buf_size: usize,
    pub log_max_batch: usize,

    /// Cache agent invalidates cache lines eagerly instead of recording
    /// them into the sparse dirty tracker for lazy invalidation.
    pub eager_invalidate: bool,
    /// Flush touched cache lines as they are written into the local
    /// write-set table, rather than once at publish time.
    pub eager_flush: bool,
    /// An acquiring thread may drain peer logs itself instead of waiting
    /// for the cache agent (`USER_HELP_CONSUME`).
    pub help_consume: bool,
    /// Location clocks merge with the thread clock instead of being
    /// overwritten by it (`LOCATION_CLOCK_MERGE`).
    pub location_clock_merge: bool,
    /// Bypass the protocol entirely: raw stores/loads, no logs, no
    /// tracker (`PROTOCOL_OFF`).
    pub protocol_off: bool,
    /// Defer claiming a new log across multiple non-release `write_to_log`
    /// calls within one release (`DELAY_PUBLISH`).
    pub delay_publish: bool,
    /// Range inserts stage into a small buffer before the local table
    /// (`LOCAL_CL_TABLE_BUFFER`).
    pub local_cl_table_buffer: bool,
    /// Cache agent short-circuits to a whole-cache invalidate above a
    /// length threshold (`WBINVD_PATH`).
    pub wbinvd_path: bool,
    pub wbinvd_threshold: u64,
    /// Number of cache lines one virtual "cl unit" covers (tests can
    /// shrink the model without changing `CACHE_LINE_SIZE`).
    pub cl_unit_granularity: u64,
    /// How long a cache agent parks when a sweep over every peer's log
    /// manager found nothing to consume, in milliseconds.
    pub cache_agent_idle_backoff_ms: u64,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        RuntimeConfig {
            node_count: 4,
            workers_per_node: 4,
            log_size: DEFAULT_LOG_SIZE,
            log_buf_size: DEFAULT_LOG_BUF_SIZE,
            log_max_batch: DEFAULT_LOG_MAX_BATCH,
            eager_invalidate: true,
            eager_flush: true,
            help_consume: false,
            location_clock_merge: false,
            protocol_off: false,
            delay_publish: true,
            local_cl_table_buffer: false,
            wbinvd_path: false,
            wbinvd_threshold: 1 << 10,
            cl_unit_granularity: 1,
            cache_agent_idle_backoff_ms: 1,
        }
    }
}

impl RuntimeConfig {
    /// The small configuration used by the end-to-end scenarios in
    /// spec.md §8 (`NODE_COUNT=2, WORKER_PER_NODE=1, LOG_SIZE=4,
    /// LOG_BUF_SIZE=4`).
    pub fn scenario_default() -> Self {
        RuntimeConfig {
            node_count: 2,
            workers_per_node: 1,
            log_size: 4,
            log_buf_size: 4,
            log_max_batch: 4,
            ..RuntimeConfig::default()
        }
    }
}
