//! Per-node cache agent: a background consumer that drains peer logs into
//! this node's dirty tracker and advances its cached view of peer clocks.
//!
//! Grounded on `original_source/src/cacheAgent.cpp` and
//! `include/cacheInfo.hpp`. `CacheInfo` (clock array + tracker + counters)
//! is folded into [`CacheAgent`] here rather than split into its own
//! module: nothing else in this crate needs to reach the clock/tracker
//! pair without going through the agent that owns them.

use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crate::config::RuntimeConfig;
use crate::log_manager::LogManager;
use crate::tracker::ClTracker;

/// Per-node coherence state: cached view of every peer's release clock,
/// plus the dirty-line tracker peer stores feed into.
pub struct CacheInfo {
    /// `cached_clocks[p]` is this node's last-observed release clock for
    /// peer `p` (`clock[NODE_COUNT]`, advanced with relaxed ordering). Only
    /// the diagonal entry for each peer is ever meaningful: a node only
    /// ever learns peer `p`'s own component of its clock, from `p`'s
    /// release log, never `p`'s view of some third node.
    cached_clocks: Vec<AtomicU32>,
    tracker: ClTracker,
    logs_consumed: AtomicU64,
}

impl CacheInfo {
    pub fn new(node_count: usize) -> Self {
        CacheInfo {
            cached_clocks: (0..node_count).map(|_| AtomicU32::new(0)).collect(),
            tracker: ClTracker::new(),
            logs_consumed: AtomicU64::new(0),
        }
    }

    pub fn tracker(&self) -> &ClTracker {
        &self.tracker
    }

    /// This node's cached release clock for peer `peer`.
    pub fn cached_clock(&self, peer: usize) -> u32 {
        self.cached_clocks[peer].load(Ordering::Relaxed)
    }

    fn bump_cached_clock(&self, peer: usize, value: u32) {
        self.cached_clocks[peer].fetch_max(value, Ordering::Relaxed);
    }

    pub fn logs_consumed(&self) -> u64 {
        self.logs_consumed.load(Ordering::Relaxed)
    }
}

/// Background consumer for one node, draining every peer's [`LogManager`]
/// into this node's [`CacheInfo`].
pub struct CacheAgent {
    self_node: usize,
    info: Arc<CacheInfo>,
    log_mgrs: Arc<Vec<LogManager>>,
    complete: Arc<AtomicBool>,
    idle_backoff: Duration,
    policy: ConsumePolicy,
}

/// The subset of [`RuntimeConfig`] that changes how a published log is
/// applied to a [`CacheInfo`] (spec.md `EAGER_INVALIDATE`, `WBINVD_PATH`).
#[derive(Debug, Clone, Copy)]
pub(crate) struct ConsumePolicy {
    pub eager_invalidate: bool,
    pub wbinvd_path: bool,
    pub wbinvd_threshold: u64,
}

impl From<&RuntimeConfig> for ConsumePolicy {
    fn from(config: &RuntimeConfig) -> Self {
        ConsumePolicy {
            eager_invalidate: config.eager_invalidate,
            wbinvd_path: config.wbinvd_path,
            wbinvd_threshold: config.wbinvd_threshold,
        }
    }
}

impl CacheAgent {
    pub fn new(
        self_node: usize,
        info: Arc<CacheInfo>,
        log_mgrs: Arc<Vec<LogManager>>,
        complete: Arc<AtomicBool>,
        config: &RuntimeConfig,
    ) -> Self {
        CacheAgent {
            self_node,
            info,
            log_mgrs,
            complete,
            idle_backoff: Duration::from_millis(config.cache_agent_idle_backoff_ms),
            policy: ConsumePolicy::from(config),
        }
    }

    pub fn info(&self) -> &Arc<CacheInfo> {
        &self.info
    }

    /// Run the consumer loop until `complete` is signalled. Each round
    /// sweeps every peer's log manager once; an all-empty round backs off
    /// briefly before the next sweep (spec.md §4.6 idle heuristic).
    pub fn run(&self) {
        while !self.complete.load(Ordering::Relaxed) {
            let mut made_progress = false;
            for peer in 0..self.log_mgrs.len() {
                if peer == self.self_node {
                    continue;
                }
                while self.process_one(peer) {
                    made_progress = true;
                }
            }
            if !made_progress {
                std::thread::park_timeout(self.idle_backoff);
            }
        }
        // Drain whatever remains once told to stop, so a shutdown never
        // strands logs a peer is still blocked waiting on.
        for peer in 0..self.log_mgrs.len() {
            if peer != self.self_node {
                while self.process_one(peer) {}
            }
        }
    }

    /// Consume and apply at most one published log from `peer`'s log
    /// manager. Returns whether a log was actually processed.
    fn process_one(&self, peer: usize) -> bool {
        drain_one_log(self.self_node, peer, &self.log_mgrs, &self.info, self.policy)
    }
}

/// Consume and apply at most one published log from `peer`'s log manager
/// into `info`, on behalf of `self_node`. Shared between [`CacheAgent`]'s
/// background loop and a worker thread helping out under the
/// `help_consume` policy (spec.md §4.7).
pub(crate) fn drain_one_log(
    self_node: usize,
    peer: usize,
    log_mgrs: &[LogManager],
    info: &CacheInfo,
    policy: ConsumePolicy,
) -> bool {
    let mgr = &log_mgrs[peer];
    let _guard = mgr.get_head_mutex(self_node).lock().unwrap();
    let Some(log_ref) = mgr.take_head(self_node) else {
        return false;
    };
    apply_log(self_node, peer, log_ref.log(), info, policy);
    mgr.consume_head(self_node);
    info.logs_consumed.fetch_add(1, Ordering::Relaxed);
    true
}

fn apply_log(self_node: usize, peer: usize, log: &crate::log::Log, info: &CacheInfo, policy: ConsumePolicy) {
    if policy.wbinvd_path && log.iter().any(|e| {
        matches!(e.classify(), crate::cl_group::ClGroupKind::Length(_, length) if length >= policy.wbinvd_threshold)
    }) {
        crate::flush::wbinvd();
    } else {
        for entry in log.iter() {
            apply_entry(entry, info, policy.eager_invalidate);
        }
    }
    if log.is_release() {
        info.bump_cached_clock(peer, log.rel_clk());
        tracing::trace!(node = self_node, peer, rel_clk = log.rel_clk(), "observed release");
    }
}

fn apply_entry(entry: crate::cl_group::ClGroup, info: &CacheInfo, eager_invalidate: bool) {
    let mut addrs: Box<dyn Iterator<Item = u64>>;
    match entry.classify() {
        crate::cl_group::ClGroupKind::Length(group_index, length) => {
            let begin = group_index << crate::config::GROUP_SHIFT;
            let end = begin + (length << crate::config::GROUP_SHIFT);
            addrs = Box::new(
                (begin..end)
                    .step_by(crate::config::CACHE_LINE_SIZE as usize),
            );
        }
        crate::cl_group::ClGroupKind::Mask(..) => {
            addrs = Box::new(entry.iter());
        }
    }
    if eager_invalidate {
        let mut any = false;
        for addr in &mut addrs {
            crate::flush::do_invalidate(addr);
            any = true;
        }
        if any {
            crate::flush::invalidate_fence();
        }
    } else {
        for addr in addrs {
            info.tracker.mark_dirty(addr);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cl_group::ClGroup;
    use crate::config::RuntimeConfig;

    fn single_step_publish(mgr: &LogManager, entry: ClGroup, is_release: bool) -> u32 {
        let h = mgr.get_new_log().unwrap();
        h.write(entry);
        h.produce_tail(is_release)
    }

    #[test]
    fn process_one_marks_tracker_dirty_and_advances_cached_clock() {
        let config = RuntimeConfig {
            node_count: 2,
            eager_invalidate: false,
            ..RuntimeConfig::default()
        };
        let log_mgrs = Arc::new(vec![
            LogManager::new(0, 2, config.log_buf_size, config.log_size),
            LogManager::new(1, 2, config.log_buf_size, config.log_size),
        ]);
        let info = Arc::new(CacheInfo::new(2));
        let complete = Arc::new(AtomicBool::new(false));
        let agent = CacheAgent::new(1, info.clone(), log_mgrs.clone(), complete, &config);

        let rel_clk = single_step_publish(&log_mgrs[0], ClGroup::from_mask(3, 0b1), true);
        assert!(agent.process_one(0));

        assert!(info.tracker().is_dirty(3u64 << crate::config::GROUP_SHIFT));
        assert_eq!(info.cached_clock(0), rel_clk);
        assert!(!agent.process_one(0));
    }

    #[test]
    fn process_one_returns_false_when_nothing_published() {
        let config = RuntimeConfig {
            node_count: 2,
            ..RuntimeConfig::default()
        };
        let log_mgrs = Arc::new(vec![
            LogManager::new(0, 2, config.log_buf_size, config.log_size),
            LogManager::new(1, 2, config.log_buf_size, config.log_size),
        ]);
        let info = Arc::new(CacheInfo::new(2));
        let complete = Arc::new(AtomicBool::new(false));
        let agent = CacheAgent::new(1, info, log_mgrs, complete, &config);

        assert!(!agent.process_one(0));
    }
}
