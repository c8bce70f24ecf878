//! redb table definitions for the Rollgate state store.
//!
//! Each table uses `&str` keys and `&[u8]` values (JSON-serialized records).

use redb::TableDefinition;

/// Rollout state keyed by rollout id.
pub const ROLLOUTS: TableDefinition<&str, &[u8]> = TableDefinition::new("rollouts");

/// Workload records keyed by workload name.
pub const WORKLOADS: TableDefinition<&str, &[u8]> = TableDefinition::new("workloads");
