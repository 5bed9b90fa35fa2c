//! StateStore — redb-backed state persistence for Rudder.
//!
//! Provides typed operations over applications, deployments, active
//! markers and evaluation markers. All values are JSON-serialized
//! [`Versioned`] envelopes in redb's `&[u8]` value columns. The store
//! supports both on-disk and in-memory backends (the latter for testing).

use std::path::Path;
use std::sync::Arc;
#[cfg(any(test, feature = "test-util"))]
use std::sync::atomic::{AtomicUsize, Ordering};

use redb::{Database, ReadableDatabase, ReadableTable, WriteTransaction};
use rudder_core::{ActiveMarker, Application, Deployment, EvaluationRecord, Lease};
use serde::Serialize;
use serde::de::DeserializeOwned;
use tracing::debug;

use crate::error::{StateError, StateResult};
use crate::tables::*;
use crate::types::{CreateOutcome, Versioned};

/// Convert any `Display` error into a `StateError` variant via a closure factory.
macro_rules! map_err {
    ($variant:ident) => {
        |e| StateError::$variant(e.to_string())
    };
}

/// Thread-safe state store backed by redb.
#[derive(Clone)]
pub struct StateStore {
    db: Arc<Database>,
    /// Compare-and-swap writes left to fail.
    #[cfg(any(test, feature = "test-util"))]
    failing_writes: Arc<AtomicUsize>,
}

impl StateStore {
    /// Open (or create) a persistent state store at the given path.
    pub fn open(path: &Path) -> StateResult<Self> {
        let db = Database::create(path).map_err(map_err!(Open))?;
        let store = Self::wrap(db);
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
        let store = Self::wrap(db);
        store.ensure_tables()?;
        debug!("in-memory state store opened");
        Ok(store)
    }

    fn wrap(db: Database) -> Self {
        Self {
            db: Arc::new(db),
            #[cfg(any(test, feature = "test-util"))]
            failing_writes: Arc::default(),
        }
    }

    /// Make the next `count` compare-and-swap writes fail with
    /// [`StateError::Write`].
    #[cfg(any(test, feature = "test-util"))]
    pub fn fail_next_writes(&self, count: usize) {
        self.failing_writes.store(count, Ordering::SeqCst);
    }

    #[cfg(any(test, feature = "test-util"))]
    fn injected_failure(&self) -> StateResult<()> {
        match self
            .failing_writes
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
        {
            Ok(_) => Err(StateError::Write("injected write failure".to_string())),
            Err(_) => Ok(()),
        }
    }

    /// Create all tables if they don't exist yet.
    fn ensure_tables(&self) -> StateResult<()> {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        // Opening a table in a write transaction creates it if absent.
        txn.open_table(APPLICATIONS).map_err(map_err!(Table))?;
        txn.open_table(DEPLOYMENTS).map_err(map_err!(Table))?;
        txn.open_table(ACTIVE).map_err(map_err!(Table))?;
        txn.open_table(EVALUATIONS).map_err(map_err!(Table))?;
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(())
    }

    // ── Generic record access ──────────────────────────────────────

    fn get<T: DeserializeOwned>(
        &self,
        table: JsonTable,
        key: &str,
    ) -> StateResult<Option<Versioned<T>>> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(table).map_err(map_err!(Table))?;
        match table.get(key).map_err(map_err!(Read))? {
            Some(guard) => Ok(Some(
                serde_json::from_slice(guard.value()).map_err(map_err!(Deserialize))?,
            )),
            None => Ok(None),
        }
    }

    fn list<T: DeserializeOwned>(&self, table: JsonTable) -> StateResult<Vec<Versioned<T>>> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(table).map_err(map_err!(Table))?;
        let mut results = Vec::new();
        for entry in table.iter().map_err(map_err!(Read))? {
            let (_, value) = entry.map_err(map_err!(Read))?;
            results.push(serde_json::from_slice(value.value()).map_err(map_err!(Deserialize))?);
        }
        Ok(results)
    }

    /// Current version of `key` inside an open write transaction.
    fn version_in(txn: &WriteTransaction, table: JsonTable, key: &str) -> StateResult<Option<u64>> {
        let table = txn.open_table(table).map_err(map_err!(Table))?;
        let current = match table.get(key).map_err(map_err!(Read))? {
            Some(guard) => {
                let header: Versioned<serde::de::IgnoredAny> =
                    serde_json::from_slice(guard.value()).map_err(map_err!(Deserialize))?;
                Some(header.version)
            }
            None => None,
        };
        Ok(current)
    }

    fn write_in<T: Serialize>(
        txn: &WriteTransaction,
        table: JsonTable,
        key: &str,
        version: u64,
        record: &T,
    ) -> StateResult<()> {
        let value = serde_json::to_vec(&Versioned::new(version, record))
            .map_err(map_err!(Serialize))?;
        let mut table = txn.open_table(table).map_err(map_err!(Table))?;
        table
            .insert(key, value.as_slice())
            .map_err(map_err!(Write))?;
        Ok(())
    }

    /// Write `record` only if the stored version still equals `expected`
    /// (`None`: the key must be absent). Returns the new version, or
    /// `None` on a version mismatch.
    fn compare_and_swap<T: Serialize>(
        &self,
        table: JsonTable,
        key: &str,
        expected: Option<u64>,
        record: &T,
    ) -> StateResult<Option<u64>> {
        #[cfg(any(test, feature = "test-util"))]
        self.injected_failure()?;
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        let current = Self::version_in(&txn, table, key)?;
        if current != expected {
            txn.abort().map_err(map_err!(Transaction))?;
            debug!(%key, ?expected, ?current, "compare-and-swap version mismatch");
            return Ok(None);
        }
        let next = expected.map_or(1, |v| v + 1);
        Self::write_in(&txn, table, key, next, record)?;
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(Some(next))
    }

    // ── Applications ───────────────────────────────────────────────

    pub fn get_application(&self, id: &str) -> StateResult<Option<Versioned<Application>>> {
        self.get(APPLICATIONS, id)
    }

    pub fn list_applications(&self) -> StateResult<Vec<Versioned<Application>>> {
        self.list(APPLICATIONS)
    }

    /// Insert or replace an application, overwriting whatever version is
    /// stored. Returns the new version.
    pub fn put_application(&self, app: &Application) -> StateResult<u64> {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        let next = Self::version_in(&txn, APPLICATIONS, &app.id)?.map_or(1, |v| v + 1);
        Self::write_in(&txn, APPLICATIONS, &app.id, next, app)?;
        txn.commit().map_err(map_err!(Transaction))?;
        debug!(application = %app.id, version = next, "application stored");
        Ok(next)
    }

    // ── Deployments ────────────────────────────────────────────────

    pub fn get_deployment(&self, id: &str) -> StateResult<Option<Versioned<Deployment>>> {
        self.get(DEPLOYMENTS, id)
    }

    /// List all deployments, oldest first.
    pub fn list_deployments(&self) -> StateResult<Vec<Versioned<Deployment>>> {
        let mut all: Vec<Versioned<Deployment>> = self.list(DEPLOYMENTS)?;
        all.sort_by(|a, b| {
            (a.record.created_at, &a.record.id).cmp(&(b.record.created_at, &b.record.id))
        });
        Ok(all)
    }

    /// List the deployments of one application, oldest first.
    pub fn list_deployments_for_application(
        &self,
        application_id: &str,
    ) -> StateResult<Vec<Versioned<Deployment>>> {
        Ok(self
            .list_deployments()?
            .into_iter()
            .filter(|d| d.record.application_id == application_id)
            .collect())
    }

    /// Deployments that still need a controller (non-terminal, or with a
    /// rollback sequence left to run).
    pub fn list_unfinished_deployments(&self) -> StateResult<Vec<Versioned<Deployment>>> {
        Ok(self
            .list_deployments()?
            .into_iter()
            .filter(|d| d.record.needs_driving())
            .collect())
    }

    /// Persist a new version of an existing deployment. Returns the new
    /// version, or `None` if the stored version is no longer `expected`.
    pub fn update_deployment(
        &self,
        expected: u64,
        deployment: &Deployment,
    ) -> StateResult<Option<u64>> {
        self.compare_and_swap(DEPLOYMENTS, &deployment.id, Some(expected), deployment)
    }

    /// Store a new deployment and claim its application's active marker in
    /// a single transaction.
    ///
    /// `marker_version` is the version of the marker the caller read
    /// (`None` if it had no marker record). `lease` is stored on the
    /// claimed marker.
    pub fn create_deployment(
        &self,
        deployment: &Deployment,
        marker_version: Option<u64>,
        lease: Option<Lease>,
    ) -> StateResult<CreateOutcome> {
        let app = deployment.application_id.as_str();
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;

        let stored: Option<Versioned<ActiveMarker>> = {
            let table = txn.open_table(ACTIVE).map_err(map_err!(Table))?;
            match table.get(app).map_err(map_err!(Read))? {
                Some(guard) => Some(
                    serde_json::from_slice(guard.value()).map_err(map_err!(Deserialize))?,
                ),
                None => None,
            }
        };

        if stored.as_ref().map(|m| m.version) != marker_version {
            txn.abort().map_err(map_err!(Transaction))?;
            return Ok(CreateOutcome::Conflict);
        }
        if let Some(active) = stored.as_ref().and_then(|m| m.record.deployment_id.clone()) {
            txn.abort().map_err(map_err!(Transaction))?;
            return Ok(CreateOutcome::Occupied(active));
        }
        if Self::version_in(&txn, DEPLOYMENTS, &deployment.id)?.is_some() {
            txn.abort().map_err(map_err!(Transaction))?;
            return Ok(CreateOutcome::Conflict);
        }

        let marker = ActiveMarker {
            application_id: app.to_string(),
            deployment_id: Some(deployment.id.clone()),
            lease,
        };
        Self::write_in(&txn, DEPLOYMENTS, &deployment.id, 1, deployment)?;
        Self::write_in(&txn, ACTIVE, app, marker_version.map_or(1, |v| v + 1), &marker)?;
        txn.commit().map_err(map_err!(Transaction))?;
        debug!(deployment = %deployment.id, application = %app, "deployment created");
        Ok(CreateOutcome::Created)
    }

    // ── Active markers ─────────────────────────────────────────────

    pub fn get_active_marker(
        &self,
        application_id: &str,
    ) -> StateResult<Option<Versioned<ActiveMarker>>> {
        self.get(ACTIVE, application_id)
    }

    /// Replace the active marker if its version is still `expected`.
    pub fn cas_active_marker(
        &self,
        expected: Option<u64>,
        marker: &ActiveMarker,
    ) -> StateResult<bool> {
        Ok(self
            .compare_and_swap(ACTIVE, &marker.application_id, expected, marker)?
            .is_some())
    }

    // ── Evaluation markers ─────────────────────────────────────────

    pub fn get_evaluation(
        &self,
        application_id: &str,
    ) -> StateResult<Option<Versioned<EvaluationRecord>>> {
        self.get(EVALUATIONS, application_id)
    }

    /// Replace the evaluation marker if its version is still `expected`.
    pub fn cas_evaluation(
        &self,
        expected: Option<u64>,
        record: &EvaluationRecord,
    ) -> StateResult<bool> {
        Ok(self
            .compare_and_swap(EVALUATIONS, &record.application_id, expected, record)?
            .is_some())
    }
}
