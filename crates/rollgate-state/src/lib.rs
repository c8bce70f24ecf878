//! rollgate-state — durable rollout records for Rollgate.
//!
//! Backed by [redb](https://docs.rs/redb), provides persistent and in-memory
//! storage for rollout state and per-workload records.
//!
//! # Architecture
//!
//! All records are JSON-serialized into redb's `&[u8]` value columns.
//! Rollouts are keyed by rollout id, workloads by workload name.
//!
//! A rollout record is written after every state-machine transition, so
//! a restarted controller resumes from the last durable phase and step.
//! The `StateStore` is `Clone` + `Send` + `Sync` (backed by `Arc<Database>`)
//! and can be shared across async tasks.

pub mod error;
pub mod store;
pub mod tables;
pub mod types;

pub use error::{StateError, StateResult};
pub use store::StateStore;
pub use types::*;
