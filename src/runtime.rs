//! Runtime: owns the per-node log managers and cache infos, and spawns
//! the background cache agent thread for each node.
//!
//! Grounded on `original_source/src/runtime.cpp`: construct N log
//! managers and N cache infos, spawn N cache-agent threads, tear down
//! cooperatively via a `complete` flag.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;

use crate::cache_agent::{CacheAgent, CacheInfo};
use crate::config::RuntimeConfig;
use crate::error::RacError;
use crate::log_manager::LogManager;
use crate::thread_ops::ThreadOps;

pub struct Runtime {
    config: RuntimeConfig,
    log_mgrs: Arc<Vec<LogManager>>,
    cache_infos: Vec<Arc<CacheInfo>>,
    complete: Arc<AtomicBool>,
    agent_handles: Vec<JoinHandle<()>>,
}

impl Runtime {
    pub fn new(config: RuntimeConfig) -> Result<Self, RacError> {
        validate(&config)?;

        let log_mgrs = Arc::new(
            (0..config.node_count)
                .map(|n| LogManager::new(n, config.node_count, config.log_buf_size, config.log_size))
                .collect::<Vec<_>>(),
        );
        let cache_infos: Vec<Arc<CacheInfo>> = (0..config.node_count)
            .map(|_| Arc::new(CacheInfo::new(config.node_count)))
            .collect();
        let complete = Arc::new(AtomicBool::new(false));

        let agent_handles = (0..config.node_count)
            .map(|node| {
                let agent = CacheAgent::new(
                    node,
                    cache_infos[node].clone(),
                    log_mgrs.clone(),
                    complete.clone(),
                    &config,
                );
                std::thread::Builder::new()
                    .name(format!("racoherence-cache-agent-{node}"))
                    .spawn(move || agent.run())
                    .expect("failed to spawn cache agent thread")
            })
            .collect();

        tracing::info!(
            node_count = config.node_count,
            log_buf_size = config.log_buf_size,
            log_size = config.log_size,
            "runtime started"
        );

        Ok(Runtime {
            config,
            log_mgrs,
            cache_infos,
            complete,
            agent_handles,
        })
    }

    pub fn config(&self) -> &RuntimeConfig {
        &self.config
    }

    pub fn cache_info(&self, node: usize) -> &Arc<CacheInfo> {
        &self.cache_infos[node]
    }

    /// Construct a fresh per-thread handle bound to `node`'s log manager
    /// and every node's cache info. The caller is responsible for keeping
    /// one `ThreadOps` per worker thread, never sharing it (spec.md §4.7).
    pub fn new_thread_ops(&self, node: usize) -> ThreadOps<'_> {
        ThreadOps::new(node, &self.log_mgrs, &self.cache_infos, self.config.clone())
    }

    /// Signal every cache agent to stop after draining whatever is
    /// already published, then join them.
    pub fn shutdown(mut self) {
        self.complete.store(true, Ordering::Relaxed);
        for handle in self.agent_handles.drain(..) {
            let _ = handle.join();
        }
        tracing::info!("runtime shut down");
    }
}

fn validate(config: &RuntimeConfig) -> Result<(), RacError> {
    if config.node_count == 0 {
        return Err(RacError::InvalidConfig("node_count must be >= 1".into()));
    }
    if config.workers_per_node == 0 {
        return Err(RacError::InvalidConfig("workers_per_node must be >= 1".into()));
    }
    if config.log_size == 0 {
        return Err(RacError::InvalidConfig("log_size must be >= 1".into()));
    }
    if config.log_buf_size < 2 || !config.log_buf_size.is_power_of_two() {
        return Err(RacError::InvalidConfig(
            "log_buf_size must be a power of two >= 2".into(),
        ));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_zero_node_count() {
        let config = RuntimeConfig {
            node_count: 0,
            ..RuntimeConfig::scenario_default()
        };
        assert!(matches!(Runtime::new(config), Err(RacError::InvalidConfig(_))));
    }

    #[test]
    fn rejects_non_power_of_two_log_buf_size() {
        let config = RuntimeConfig {
            log_buf_size: 3,
            ..RuntimeConfig::scenario_default()
        };
        assert!(matches!(Runtime::new(config), Err(RacError::InvalidConfig(_))));
    }

    #[test]
    fn starts_and_shuts_down_cleanly() {
        let rt = Runtime::new(RuntimeConfig::scenario_default()).unwrap();
        assert_eq!(rt.config().node_count, 2);
        rt.shutdown();
    }

    #[test]
    fn release_on_one_node_is_observed_by_the_other_nodes_agent() {
        let rt = Runtime::new(RuntimeConfig::scenario_default()).unwrap();
        let mut writer = rt.new_thread_ops(0);
        writer.log_store(0x20_0000);
        writer.thread_release();

        // Give the background cache agent a moment to drain the log.
        let info = rt.cache_info(1);
        let mut waited = 0;
        while info.logs_consumed() == 0 && waited < 1000 {
            std::thread::yield_now();
            waited += 1;
        }
        assert!(info.logs_consumed() > 0);
        rt.shutdown();
    }
}
