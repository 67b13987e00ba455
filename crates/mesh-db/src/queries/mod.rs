//! Row-level query functions, one module per table family.
//!
//! Every mutation of store state goes through these functions; no other
//! crate issues SQL. Multi-statement operations own their transaction and
//! are safe to wrap in [`crate::retry::with_busy_retry`].

pub mod agents;
pub mod attempts;
pub mod claims;
pub mod episodes;
pub mod gc;
pub mod spawns;
pub mod tasks;
pub mod waiters;
pub mod weave;
