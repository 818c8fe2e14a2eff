//! Built-in workloads and registry population.

pub mod change_config;
pub mod consistency;
pub mod tpcc;

use std::collections::HashMap;

use async_trait::async_trait;

use crate::db::Db;
use crate::error::HarnessResult;
use crate::metrics::PerfMetric;
use crate::workload::{Workload, WorkloadConstructor, WorkloadContext};

/// Register every built-in workload. Called once when the registry is
/// first touched.
pub(crate) fn register_builtin(registry: &mut HashMap<String, WorkloadConstructor>) {
    registry.insert("Noop".to_string(), noop as WorkloadConstructor);
    registry.insert("TPCC".to_string(), tpcc::construct as WorkloadConstructor);
    registry.insert(
        "ChangeConfig".to_string(),
        change_config::construct as WorkloadConstructor,
    );
    registry.insert(
        "ConsistencyCheck".to_string(),
        consistency::construct as WorkloadConstructor,
    );
}

/// A workload that does nothing and passes its check. Useful as a
/// harness smoke test and as the simplest spec-file example.
#[derive(Debug)]
struct NoopWorkload;

fn noop(_ctx: &mut WorkloadContext) -> HarnessResult<Box<dyn Workload>> {
    Ok(Box::new(NoopWorkload))
}

#[async_trait]
impl Workload for NoopWorkload {
    fn description(&self) -> String {
        "Noop".to_string()
    }

    async fn setup(&self, _db: &Db) -> HarnessResult<()> {
        Ok(())
    }

    async fn start(&self, _db: &Db) -> HarnessResult<()> {
        Ok(())
    }

    async fn check(&self, _db: &Db) -> HarnessResult<bool> {
        Ok(true)
    }

    fn get_metrics(&self, _out: &mut Vec<PerfMetric>) {}
}
