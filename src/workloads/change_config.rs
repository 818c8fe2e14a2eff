//! Configuration-change workload.
//!
//! Synthesized by the controller when a run starts with a non-empty
//! starting configuration. Writes the requested configuration mode into
//! the database's configuration key, which the cluster under test
//! interprets; only client 0 performs the write.

use async_trait::async_trait;
use tracing::{info, warn};

use crate::db::Db;
use crate::error::{HarnessError, HarnessResult};
use crate::metrics::PerfMetric;
use crate::workload::{Workload, WorkloadContext};

const CONFIG_MODE_KEY: &[u8] = b"\xff/conf/mode";

#[derive(Debug)]
pub struct ChangeConfigWorkload {
    client_id: usize,
    config_mode: String,
}

pub fn construct(ctx: &mut WorkloadContext) -> HarnessResult<Box<dyn Workload>> {
    let config_mode = ctx.options.take_str("configMode", "");
    Ok(Box::new(ChangeConfigWorkload {
        client_id: ctx.client_id,
        config_mode,
    }))
}

#[async_trait]
impl Workload for ChangeConfigWorkload {
    fn description(&self) -> String {
        "ChangeConfig".to_string()
    }

    async fn setup(&self, _db: &Db) -> HarnessResult<()> {
        Ok(())
    }

    async fn start(&self, db: &Db) -> HarnessResult<()> {
        if self.client_id != 0 || self.config_mode.is_empty() {
            return Ok(());
        }
        let mut tr = db.begin().await.map_err(HarnessError::from)?;
        loop {
            tr.set(CONFIG_MODE_KEY, self.config_mode.as_bytes());
            match tr.commit().await {
                Ok(()) => {
                    info!(config_mode = %self.config_mode, "configuration change committed");
                    return Ok(());
                }
                Err(err) => {
                    warn!(%err, "configuration change failed, retrying");
                    tr.on_error(err).await.map_err(HarnessError::from)?;
                }
            }
        }
    }

    async fn check(&self, _db: &Db) -> HarnessResult<bool> {
        Ok(true)
    }

    fn get_metrics(&self, _out: &mut Vec<PerfMetric>) {}
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::memory::MemoryDb;
    use crate::options::OptionBlock;
    use crate::workload::build_workload;

    #[tokio::test]
    async fn client_zero_writes_the_configuration_key() {
        let mut block = OptionBlock::new();
        block.push("testName", "ChangeConfig");
        block.push("configMode", "triple");
        let workload = build_workload(&[block], 0, 2, 0).unwrap();

        let (db, handle) = MemoryDb::shared();
        workload.start(&db).await.unwrap();
        assert!(workload.check(&db).await.unwrap());
        assert_eq!(
            handle.snapshot().get(CONFIG_MODE_KEY).cloned(),
            Some(b"triple".to_vec())
        );
    }

    #[tokio::test]
    async fn other_clients_do_not_write() {
        let mut block = OptionBlock::new();
        block.push("testName", "ChangeConfig");
        block.push("configMode", "triple");
        let workload = build_workload(&[block], 1, 2, 0).unwrap();

        let (db, handle) = MemoryDb::shared();
        workload.start(&db).await.unwrap();
        assert!(handle.is_empty());
    }
}
