//! Consistency-check workload.
//!
//! Verifies that repeated full scans of the user keyspace observe the
//! same contents, which holds exactly when the database is quiescent and
//! serving consistent reads. Synthesized by the controller after tests
//! that request it and by the standalone consistency-check run mode.

use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use tokio::time::sleep;
use tracing::{error, info, warn};

use crate::db::{Db, DbError, USER_KEYS_BEGIN, USER_KEYS_END};
use crate::error::{HarnessError, HarnessResult};
use crate::metrics::PerfMetric;
use crate::workload::{DEFAULT_CHECK_TIMEOUT, Workload, WorkloadContext};

const SCAN_PAGE: usize = 1000;
const INDEFINITE_ROUND_DELAY: Duration = Duration::from_secs(1);

#[derive(Debug, Default, Clone)]
struct ScanOutcome {
    rounds: u64,
    keys_scanned: u64,
    bytes_scanned: u64,
    mismatches: u64,
    consistent: bool,
}

#[derive(Debug)]
pub struct ConsistencyCheckWorkload {
    client_id: usize,
    perform_quiescent_checks: bool,
    quiescent_wait_timeout: f64,
    distributed: bool,
    failure_is_error: bool,
    indefinite: bool,
    rate_limit_max: i64,
    outcome: Mutex<ScanOutcome>,
}

pub fn construct(ctx: &mut WorkloadContext) -> HarnessResult<Box<dyn Workload>> {
    let perform_quiescent_checks = ctx.options.take_bool("performQuiescentChecks", false)?;
    let quiescent_wait_timeout = ctx.options.take_f64("quiescentWaitTimeout", 600.0)?;
    let distributed = ctx.options.take_bool("distributed", true)?;
    let failure_is_error = ctx.options.take_bool("failureIsError", false)?;
    let indefinite = ctx.options.take_bool("indefinite", false)?;
    let rate_limit_max = ctx.options.take_i64("rateLimitMax", 0)?;
    // Shard shuffling only matters to range-sharded scans; accepted and
    // ignored by the sequential scanner.
    let _ = ctx.options.take_bool("shuffleShards", false)?;
    Ok(Box::new(ConsistencyCheckWorkload {
        client_id: ctx.client_id,
        perform_quiescent_checks,
        quiescent_wait_timeout,
        distributed,
        failure_is_error,
        indefinite,
        rate_limit_max,
        outcome: Mutex::new(ScanOutcome::default()),
    }))
}

impl ConsistencyCheckWorkload {
    async fn full_scan(&self, db: &Db) -> Result<Vec<(Vec<u8>, Vec<u8>)>, DbError> {
        let mut tr = db.begin().await?;
        let mut begin = USER_KEYS_BEGIN.to_vec();
        let mut rows = Vec::new();
        let mut bytes_this_second = 0usize;
        loop {
            let page = loop {
                match tr.get_range(&begin, USER_KEYS_END, SCAN_PAGE).await {
                    Ok(page) => break page,
                    Err(err) => tr.on_error(err).await?,
                }
            };
            let full_page = page.len() == SCAN_PAGE;
            for (key, value) in page {
                bytes_this_second += key.len() + value.len();
                rows.push((key, value));
            }
            if self.rate_limit_max > 0 && bytes_this_second >= self.rate_limit_max as usize {
                bytes_this_second = 0;
                sleep(Duration::from_secs(1)).await;
            }
            if !full_page {
                break;
            }
            if let Some((last, _)) = rows.last() {
                begin = last.clone();
                begin.push(0);
            }
        }
        Ok(rows)
    }

    async fn scan_round(&self, db: &Db) -> HarnessResult<bool> {
        let first = self.full_scan(db).await.map_err(HarnessError::from)?;
        let second = self.full_scan(db).await.map_err(HarnessError::from)?;
        let consistent = first == second;

        let mut outcome = self.outcome.lock().unwrap_or_else(|p| p.into_inner());
        outcome.rounds += 1;
        outcome.keys_scanned += first.len() as u64;
        outcome.bytes_scanned += first
            .iter()
            .map(|(k, v)| (k.len() + v.len()) as u64)
            .sum::<u64>();
        outcome.consistent = consistent;
        if !consistent {
            outcome.mismatches += 1;
            if self.failure_is_error {
                error!(round = outcome.rounds, "consistency scan mismatch");
            } else {
                warn!(round = outcome.rounds, "consistency scan mismatch");
            }
        }
        Ok(consistent)
    }
}

#[async_trait]
impl Workload for ConsistencyCheckWorkload {
    fn description(&self) -> String {
        "ConsistencyCheck".to_string()
    }

    async fn setup(&self, _db: &Db) -> HarnessResult<()> {
        Ok(())
    }

    async fn start(&self, db: &Db) -> HarnessResult<()> {
        if !self.distributed && self.client_id != 0 {
            return Ok(());
        }
        info!(
            quiescent = self.perform_quiescent_checks,
            indefinite = self.indefinite,
            "consistency check starting"
        );
        loop {
            let consistent = self.scan_round(db).await?;
            if !self.indefinite {
                if consistent {
                    info!("consistency check passed");
                }
                return Ok(());
            }
            sleep(INDEFINITE_ROUND_DELAY).await;
        }
    }

    async fn check(&self, _db: &Db) -> HarnessResult<bool> {
        let outcome = self.outcome.lock().unwrap_or_else(|p| p.into_inner());
        if !self.distributed && self.client_id != 0 {
            // Non-scanning clients defer to the scanner's verdict.
            return Ok(true);
        }
        Ok(outcome.rounds > 0 && outcome.mismatches == 0)
    }

    fn get_metrics(&self, out: &mut Vec<PerfMetric>) {
        let outcome = self.outcome.lock().unwrap_or_else(|p| p.into_inner());
        out.push(PerfMetric::new("Scan Rounds", outcome.rounds as f64, false).with_format("%d"));
        out.push(
            PerfMetric::new("Keys Scanned", outcome.keys_scanned as f64, false).with_format("%d"),
        );
        out.push(
            PerfMetric::new("Bytes Scanned", outcome.bytes_scanned as f64, false)
                .with_format("%d"),
        );
        out.push(
            PerfMetric::new("Scan Mismatches", outcome.mismatches as f64, false)
                .with_format("%d"),
        );
    }

    fn check_timeout(&self) -> Duration {
        let quiescent_wait = self.quiescent_wait_timeout.clamp(0.0, 1e9);
        DEFAULT_CHECK_TIMEOUT.max(Duration::from_secs_f64(quiescent_wait))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::memory::MemoryDb;
    use crate::options::OptionBlock;
    use crate::workload::build_workload;

    fn consistency_block(pairs: &[(&str, &str)]) -> OptionBlock {
        let mut block = OptionBlock::new();
        block.push("testName", "ConsistencyCheck");
        for (k, v) in pairs {
            block.push(*k, *v);
        }
        block
    }

    #[tokio::test]
    async fn stable_database_passes_consistency_check() {
        let (db, _handle) = MemoryDb::shared();
        let mut tr = db.begin().await.unwrap();
        for i in 0..2500u32 {
            tr.set(format!("key/{i:06}").as_bytes(), &i.to_be_bytes());
        }
        tr.commit().await.unwrap();

        let workload =
            build_workload(&[consistency_block(&[("distributed", "false")])], 0, 1, 0).unwrap();
        workload.start(&db).await.unwrap();
        assert!(workload.check(&db).await.unwrap());

        let mut metrics = Vec::new();
        workload.get_metrics(&mut metrics);
        let keys = metrics.iter().find(|m| m.name == "Keys Scanned").unwrap();
        assert_eq!(keys.value, 2500.0);
    }

    #[tokio::test]
    async fn check_fails_without_a_completed_round() {
        let (db, _handle) = MemoryDb::shared();
        let workload = build_workload(&[consistency_block(&[])], 0, 1, 0).unwrap();
        assert!(!workload.check(&db).await.unwrap());
    }

    #[tokio::test]
    async fn all_synthesized_options_are_consumed() {
        let block = consistency_block(&[
            ("performQuiescentChecks", "false"),
            ("quiescentWaitTimeout", "10000"),
            ("distributed", "false"),
            ("failureIsError", "true"),
            ("indefinite", "false"),
            ("rateLimitMax", "50000000"),
            ("shuffleShards", "true"),
        ]);
        build_workload(&[block], 0, 1, 0).unwrap();
    }
}
