//! Coordination and evidence kernel for multi-agent working trees.
//!
//! Components, leaves first: canonical hashing ([`canon`]), the two
//! ledgers ([`eventlog`], [`weave`]), the claim arbiter ([`arbiter`]), the
//! task state machine ([`machine`]), the worker spawn supervisor
//! ([`spawner`]), the liveness watchdog ([`watchdog`]), and the post-run
//! audit ([`alpha_gate`]). The store itself lives in `mesh-db`.

pub mod adapter;
pub mod alpha_gate;
pub mod arbiter;
pub mod bridge;
pub mod canon;
pub mod control;
pub mod episode;
pub mod eventlog;
pub mod gitbridge;
pub mod machine;
pub mod policy;
pub mod spawner;
pub mod watchdog;
pub mod weave;
