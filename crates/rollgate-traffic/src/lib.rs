//! rollgate-traffic — moves live traffic between a workload's stable and
//! canary cohorts.
//!
//! The state machine only sees the [`TrafficSplitter`] trait. Weight
//! writes are idempotent and are serialized per rollout by
//! [`SingleFlight`], so a crash-and-resume can safely re-apply the last
//! mandated weight.
//!
//! # Components
//!
//! - **`splitter`** — `TrafficSplitter` / `SplitterProvider` traits and the
//!   single-flight write wrapper
//! - **`router`** — in-process weighted router with stable/canary backend
//!   pools per service

pub mod error;
pub mod router;
pub mod splitter;

pub use error::TrafficError;
pub use router::{Backend, RouteDecision, WeightedRouter};
pub use splitter::{SingleFlight, SplitterProvider, TrafficSplitter};
