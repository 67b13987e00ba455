//! SQLite-backed coordination store for AgentMesh.
//!
//! The store owns every durable row: agents, claims, waiters, tasks,
//! attempts, spawns, weave events, and episodes. All other crates mutate
//! state exclusively through the query functions in [`queries`].

pub mod config;
pub mod models;
pub mod pool;
pub mod queries;
pub mod retry;
pub mod tx;
