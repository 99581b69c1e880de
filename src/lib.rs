//! RACoherence: a software-emulated release/acquire cache coherence
//! runtime for a fabric-attached multi-node shared-memory region.
//!
//! See `SPEC_FULL.md` at the repository root for the full module map.
//! The short version: threads dirty cache lines through [`thread_ops`],
//! which coalesces them in [`local_table`] and drains them through a
//! per-node [`log_manager`]; each node's [`cache_agent`] drains its
//! peers' logs into a [`tracker`] and a cached clock; [`sync`] builds
//! release/acquire primitives on top; [`runtime`] wires it all together.

pub mod cache_agent;
pub mod cl_group;
pub mod clock;
pub mod config;
pub mod error;
pub mod flush;
pub mod interpose;
pub mod local_table;
pub mod log;
pub mod log_manager;
pub mod runtime;
pub mod sync;
pub mod thread_ops;
pub mod tracker;

pub use cache_agent::{CacheAgent, CacheInfo};
pub use clock::VectorClock;
pub use config::RuntimeConfig;
pub use error::RacError;
pub use runtime::Runtime;
pub use sync::{ClhLock, CxlAtomic, CxlBarrier, CxlMutex};
pub use thread_ops::ThreadOps;
