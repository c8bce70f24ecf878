//! StateStore — redb-backed persistence for rollouts and workloads.
//!
//! All values are JSON-serialized into redb's `&[u8]` value columns. The
//! store supports both on-disk and in-memory backends (the latter for
//! testing).

use std::path::Path;
use std::sync::Arc;

use redb::{Database, ReadableDatabase, ReadableTable, TableDefinition};
use serde::Serialize;
use serde::de::DeserializeOwned;
use tracing::debug;

use crate::error::{StateError, StateResult};
use crate::tables::*;
use crate::types::*;

/// Convert any `Display` error into a `StateError` variant via a closure factory.
macro_rules! map_err {
    ($variant:ident) => {
        |e| StateError::$variant(e.to_string())
    };
}

type Table = TableDefinition<'static, &'static str, &'static [u8]>;

/// Thread-safe state store backed by redb.
#[derive(Clone)]
pub struct StateStore {
    db: Arc<Database>,
}

impl StateStore {
    /// Open (or create) a persistent state store at the given path.
    pub fn open(path: &Path) -> StateResult<Self> {
        let db = Database::create(path).map_err(map_err!(Open))?;
        let store = Self { db: Arc::new(db) };
        store.ensure_tables()?;
        debug!(?path, "state store opened");
        Ok(store)
    }

    /// Create an ephemeral in-memory state store (for testing).
    pub fn open_in_memory() -> StateResult<Self> {
        let backend = redb::backends::InMemoryBackend::new();
        let db = Database::builder()
            .create_with_backend(backend)
            .map_err(map_err!(Open))?;
        let store = Self { db: Arc::new(db) };
        store.ensure_tables()?;
        debug!("in-memory state store opened");
        Ok(store)
    }

    /// Create all tables if they don't exist yet.
    fn ensure_tables(&self) -> StateResult<()> {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        // Opening a table in a write transaction creates it if absent.
        txn.open_table(ROLLOUTS).map_err(map_err!(Table))?;
        txn.open_table(WORKLOADS).map_err(map_err!(Table))?;
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(())
    }

    // ── Rollouts ───────────────────────────────────────────────────

    /// Insert or update a rollout record.
    pub fn put_rollout(&self, state: &RolloutState) -> StateResult<()> {
        let key = state.table_key();
        self.put_json(ROLLOUTS, &key, state)?;
        debug!(rollout = %key, phase = %state.phase, "rollout stored");
        Ok(())
    }

    /// Get a rollout by id.
    pub fn get_rollout(&self, id: &str) -> StateResult<Option<RolloutState>> {
        self.get_json(ROLLOUTS, id)
    }

    /// List all rollouts, terminal ones included.
    pub fn list_rollouts(&self) -> StateResult<Vec<RolloutState>> {
        self.list_json(ROLLOUTS)
    }

    /// List rollouts that have not reached a terminal phase.
    pub fn list_unfinished_rollouts(&self) -> StateResult<Vec<RolloutState>> {
        Ok(self
            .list_rollouts()?
            .into_iter()
            .filter(|r| !r.is_terminal())
            .collect())
    }

    /// Delete a rollout by id. Returns true if it existed.
    pub fn delete_rollout(&self, id: &str) -> StateResult<bool> {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        let existed;
        {
            let mut table = txn.open_table(ROLLOUTS).map_err(map_err!(Table))?;
            existed = table.remove(id).map_err(map_err!(Write))?.is_some();
        }
        txn.commit().map_err(map_err!(Transaction))?;
        debug!(rollout = %id, existed, "rollout deleted");
        Ok(existed)
    }

    // ── Workloads ──────────────────────────────────────────────────

    /// Insert or update a workload record.
    pub fn put_workload(&self, record: &WorkloadRecord) -> StateResult<()> {
        self.put_json(WORKLOADS, &record.table_key(), record)
    }

    /// Get a workload record by name.
    pub fn get_workload(&self, workload: &str) -> StateResult<Option<WorkloadRecord>> {
        self.get_json(WORKLOADS, workload)
    }

    /// List all workload records.
    pub fn list_workloads(&self) -> StateResult<Vec<WorkloadRecord>> {
        self.list_json(WORKLOADS)
    }

    /// Atomically claim a workload for a rollout.
    ///
    /// Fails with `StateError::Claimed` if another rollout holds the claim.
    /// Re-claiming with the same rollout id succeeds.
    pub fn claim_workload(
        &self,
        workload: &str,
        rollout_id: &str,
        stable_version: &str,
        now: u64,
    ) -> StateResult<WorkloadRecord> {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        let record = {
            let mut table = txn.open_table(WORKLOADS).map_err(map_err!(Table))?;
            let existing: Option<WorkloadRecord> = match table.get(workload).map_err(map_err!(Read))? {
                Some(guard) => {
                    Some(serde_json::from_slice(guard.value()).map_err(map_err!(Deserialize))?)
                }
                None => None,
            };

            let mut record = existing.unwrap_or_else(|| WorkloadRecord {
                workload: workload.to_string(),
                stable_version: stable_version.to_string(),
                active_rollout: None,
                updated_at: now,
            });
            if let Some(holder) = &record.active_rollout {
                if holder != rollout_id {
                    return Err(StateError::Claimed {
                        workload: workload.to_string(),
                        holder: holder.clone(),
                    });
                }
            }
            record.active_rollout = Some(rollout_id.to_string());
            record.updated_at = now;

            let value = serde_json::to_vec(&record).map_err(map_err!(Serialize))?;
            table
                .insert(workload, value.as_slice())
                .map_err(map_err!(Write))?;
            record
        };
        txn.commit().map_err(map_err!(Transaction))?;
        debug!(%workload, rollout = %rollout_id, "workload claimed");
        Ok(record)
    }

    /// Release a workload claim held by `rollout_id`, optionally recording
    /// a new stable version. A claim held by another rollout is left alone.
    pub fn release_workload(
        &self,
        workload: &str,
        rollout_id: &str,
        new_stable: Option<&str>,
        now: u64,
    ) -> StateResult<()> {
        let Some(mut record) = self.get_workload(workload)? else {
            return Ok(());
        };
        if record.active_rollout.as_deref() == Some(rollout_id) {
            record.active_rollout = None;
        }
        if let Some(version) = new_stable {
            record.stable_version = version.to_string();
        }
        record.updated_at = now;
        self.put_workload(&record)?;
        debug!(%workload, rollout = %rollout_id, stable = %record.stable_version, "workload released");
        Ok(())
    }

    // ── JSON helpers ───────────────────────────────────────────────

    fn put_json<T: Serialize>(&self, def: Table, key: &str, value: &T) -> StateResult<()> {
        let value = serde_json::to_vec(value).map_err(map_err!(Serialize))?;
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        {
            let mut table = txn.open_table(def).map_err(map_err!(Table))?;
            table
                .insert(key, value.as_slice())
                .map_err(map_err!(Write))?;
        }
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(())
    }

    fn get_json<T: DeserializeOwned>(&self, def: Table, key: &str) -> StateResult<Option<T>> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(def).map_err(map_err!(Table))?;
        match table.get(key).map_err(map_err!(Read))? {
            Some(guard) => {
                let value: T =
                    serde_json::from_slice(guard.value()).map_err(map_err!(Deserialize))?;
                Ok(Some(value))
            }
            None => Ok(None),
        }
    }

    fn list_json<T: DeserializeOwned>(&self, def: Table) -> StateResult<Vec<T>> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(def).map_err(map_err!(Table))?;
        let mut results = Vec::new();
        for entry in table.iter().map_err(map_err!(Read))? {
            let (_, value) = entry.map_err(map_err!(Read))?;
            let item: T =
                serde_json::from_slice(value.value()).map_err(map_err!(Deserialize))?;
            results.push(item);
        }
        Ok(results)
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use rollgate_core::{RolloutSpec, Step};

    fn test_spec(workload: &str) -> RolloutSpec {
        RolloutSpec {
            workload: workload.to_string(),
            stable_version: "1.0.0".to_string(),
            canary_version: "1.1.0".to_string(),
            steps: vec![
                Step {
                    weight_percent: 10,
                    pause: Duration::from_secs(30),
                },
                Step {
                    weight_percent: 100,
                    pause: Duration::from_secs(30),
                },
            ],
            checks: vec![],
            rollback_thresholds: vec![],
            promotion_window: None,
        }
    }

    fn test_rollout(id: &str, workload: &str) -> RolloutState {
        RolloutState::new(id, test_spec(workload), 1000)
    }

    // ── Rollouts ───────────────────────────────────────────────────

    #[test]
    fn rollout_put_and_get() {
        let store = StateStore::open_in_memory().unwrap();
        let state = test_rollout("r-1", "api");
        store.put_rollout(&state).unwrap();

        let got = store.get_rollout("r-1").unwrap().unwrap();
        assert_eq!(got, state);
    }

    #[test]
    fn rollout_get_nonexistent_returns_none() {
        let store = StateStore::open_in_memory().unwrap();
        assert!(store.get_rollout("nope").unwrap().is_none());
    }

    #[test]
    fn rollout_update_in_place() {
        let store = StateStore::open_in_memory().unwrap();
        let mut state = test_rollout("r-1", "api");
        store.put_rollout(&state).unwrap();

        state.phase = Phase::Paused;
        state.applied_weight = 10;
        store.put_rollout(&state).unwrap();

        let got = store.get_rollout("r-1").unwrap().unwrap();
        assert_eq!(got.phase, Phase::Paused);
        assert_eq!(got.applied_weight, 10);
        assert_eq!(store.list_rollouts().unwrap().len(), 1);
    }

    #[test]
    fn unfinished_excludes_terminal() {
        let store = StateStore::open_in_memory().unwrap();
        let mut done = test_rollout("r-1", "api");
        done.phase = Phase::Succeeded;
        let mut aborting = test_rollout("r-2", "web");
        aborting.phase = Phase::Aborting;
        store.put_rollout(&done).unwrap();
        store.put_rollout(&aborting).unwrap();

        let unfinished = store.list_unfinished_rollouts().unwrap();
        assert_eq!(unfinished.len(), 1);
        assert_eq!(unfinished[0].id, "r-2");
    }

    #[test]
    fn rollout_delete() {
        let store = StateStore::open_in_memory().unwrap();
        store.put_rollout(&test_rollout("r-1", "api")).unwrap();
        assert!(store.delete_rollout("r-1").unwrap());
        assert!(!store.delete_rollout("r-1").unwrap());
    }

    // ── Workloads ──────────────────────────────────────────────────

    #[test]
    fn claim_is_exclusive() {
        let store = StateStore::open_in_memory().unwrap();
        store.claim_workload("api", "r-1", "1.0.0", 1000).unwrap();

        let err = store.claim_workload("api", "r-2", "1.0.0", 1001).unwrap_err();
        assert!(matches!(err, StateError::Claimed { ref holder, .. } if holder == "r-1"));

        // Same holder may re-claim (restart recovery).
        store.claim_workload("api", "r-1", "1.0.0", 1002).unwrap();
    }

    #[test]
    fn release_records_new_stable() {
        let store = StateStore::open_in_memory().unwrap();
        store.claim_workload("api", "r-1", "1.0.0", 1000).unwrap();
        store.release_workload("api", "r-1", Some("1.1.0"), 2000).unwrap();

        let record = store.get_workload("api").unwrap().unwrap();
        assert_eq!(record.stable_version, "1.1.0");
        assert!(record.active_rollout.is_none());

        store.claim_workload("api", "r-2", "1.1.0", 3000).unwrap();
    }

    #[test]
    fn release_by_non_holder_keeps_claim() {
        let store = StateStore::open_in_memory().unwrap();
        store.claim_workload("api", "r-1", "1.0.0", 1000).unwrap();
        store.release_workload("api", "r-9", None, 2000).unwrap();

        let record = store.get_workload("api").unwrap().unwrap();
        assert_eq!(record.active_rollout.as_deref(), Some("r-1"));
    }

    #[test]
    fn persistence_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let db_path = dir.path().join("test.redb");

        {
            let store = StateStore::open(&db_path).unwrap();
            let mut state = test_rollout("r-1", "api");
            state.phase = Phase::Paused;
            state.current_step_index = 1;
            store.put_rollout(&state).unwrap();
        }

        // Reopen the same database file.
        let store = StateStore::open(&db_path).unwrap();
        let state = store.get_rollout("r-1").unwrap().unwrap();
        assert_eq!(state.phase, Phase::Paused);
        assert_eq!(state.current_step_index, 1);
    }

    #[test]
    fn empty_store_operations() {
        let store = StateStore::open_in_memory().unwrap();

        assert!(store.list_rollouts().unwrap().is_empty());
        assert!(store.list_workloads().unwrap().is_empty());
        assert!(store.get_workload("any").unwrap().is_none());
        store.release_workload("any", "r-1", None, 1000).unwrap();
    }
}
