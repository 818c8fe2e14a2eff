//! Cluster-control collaborator interface.
//!
//! The controller consumes a small surface from whatever manages the
//! cluster: the current tester endpoints, a database handle, quiescence
//! waits, and datacenter repair. [`LocalCluster`] implements it for
//! in-process runs (one tester per slot over an in-memory database),
//! which also backs the test suite.

use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tracing::debug;

use crate::db::memory::MemoryDb;
use crate::db::Db;
use crate::error::HarnessResult;
use crate::runner::{TesterHandle, spawn_tester};
use crate::spec::BackupAgentHint;

/// Advisory simulation hints folded from the spec list and forwarded
/// verbatim; only simulation-aware cluster implementations act on them.
#[derive(Debug, Clone, Default)]
pub struct SimulationHints {
    pub check_relocation_duration: bool,
    pub connection_failures_disable_duration: f64,
    pub backup_agents: BackupAgentHint,
    pub dr_agents: BackupAgentHint,
    pub enable_data_distribution: bool,
}

/// What the controller needs from cluster management.
#[async_trait]
pub trait ClusterControl: Send + Sync {
    /// Handle to the database under test.
    fn open_database(&self) -> Db;

    /// Current tester endpoints; `tester_class_only` restricts the list
    /// to tester-tagged workers.
    async fn testers(&self, tester_class_only: bool) -> HarnessResult<Vec<TesterHandle>>;

    /// Resolves when cluster membership may have changed, prompting a
    /// recruitment re-query.
    async fn membership_changed(&self);

    /// Wait until no background work (data movement, recovery) is ongoing.
    async fn quiet_database(&self, phase: &str) -> HarnessResult<()>;

    async fn repair_dead_datacenter(&self, context: &str) -> HarnessResult<()>;

    /// Receive the folded simulation hints for this run.
    fn apply_simulation_hints(&self, hints: &SimulationHints);
}

/// In-process cluster: an in-memory database plus N spawned testers.
pub struct LocalCluster {
    db: Db,
    mem: MemoryDb,
    testers: Mutex<Vec<TesterHandle>>,
}

impl LocalCluster {
    pub fn new(tester_count: usize) -> Arc<Self> {
        let (db, mem) = MemoryDb::shared();
        Self::with_database(db, mem, tester_count)
    }

    pub fn with_database(db: Db, mem: MemoryDb, tester_count: usize) -> Arc<Self> {
        let testers = (0..tester_count).map(|_| spawn_tester(db.clone())).collect();
        Arc::new(Self {
            db,
            mem,
            testers: Mutex::new(testers),
        })
    }

    /// The raw in-memory database, exposing failure-injection knobs.
    pub fn memory(&self) -> &MemoryDb {
        &self.mem
    }

    /// Add one more in-process tester to the pool.
    pub fn add_tester(&self) -> TesterHandle {
        let tester = spawn_tester(self.db.clone());
        self.testers
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .push(tester.clone());
        tester
    }
}

#[async_trait]
impl ClusterControl for LocalCluster {
    fn open_database(&self) -> Db {
        self.db.clone()
    }

    async fn testers(&self, _tester_class_only: bool) -> HarnessResult<Vec<TesterHandle>> {
        Ok(self
            .testers
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone())
    }

    async fn membership_changed(&self) {
        // Local membership never changes on its own.
        std::future::pending::<()>().await;
    }

    async fn quiet_database(&self, phase: &str) -> HarnessResult<()> {
        debug!(phase, "local cluster is always quiescent");
        Ok(())
    }

    async fn repair_dead_datacenter(&self, context: &str) -> HarnessResult<()> {
        debug!(context, "local cluster has no datacenters to repair");
        Ok(())
    }

    fn apply_simulation_hints(&self, hints: &SimulationHints) {
        debug!(?hints, "ignoring simulation hints on local cluster");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn local_cluster_exposes_testers_and_database() {
        let cluster = LocalCluster::new(2);
        let testers = cluster.testers(false).await.unwrap();
        assert_eq!(testers.len(), 2);

        cluster.add_tester();
        let testers = cluster.testers(true).await.unwrap();
        assert_eq!(testers.len(), 3);

        cluster.quiet_database("start").await.unwrap();
        cluster.repair_dead_datacenter("test").await.unwrap();
    }
}
