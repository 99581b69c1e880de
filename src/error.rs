//! Error types for the coherence engine's API boundary.
//!
//! Most of the conditions spec.md §7 lists are recoverable control flow
//! internal to the protocol (ring-full, table-overflow, take-head-none) and
//! are represented as `Option`/enum return values rather than `Result`s —
//! see the module docs on `log_manager` and `local_table`. `RacError` is
//! reserved for the handful of failures that cross an API boundary as a
//! genuine `Result`, grounded on `harborgrid-justin-rusty-db/src/error.rs`'s
//! use of `thiserror`.

use thiserror::Error;

#[derive(Error, Debug)]
pub enum RacError {
    #[error("invalid runtime configuration: {0}")]
    InvalidConfig(String),

    #[error("coherence protocol invariant violated: {0}")]
    InvariantViolation(String),
}
