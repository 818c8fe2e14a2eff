//! Distributed test controller.
//!
//! Drives each parsed test through the four-phase lifecycle across every
//! recruited tester: fan a phase request out to all workload handles,
//! wait for every reply inside a per-tester failure window, aggregate
//! check verdicts and metrics, then run the between-test actions the spec
//! asks for (quiescence waits, consistency check, database dump, clear).

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures::future::join_all;
use rand::Rng;
use tokio::sync::oneshot;
use tokio::time::{sleep, timeout};
use tracing::{error, info, warn};

use crate::cluster::ClusterControl;
use crate::db::{Db, DbError, USER_KEYS_BEGIN, USER_KEYS_END};
use crate::error::{HarnessError, HarnessResult};
use crate::liveness::database_liveness;
use crate::metrics::{PerfMetric, aggregate_metrics, log_metrics};
use crate::options::OptionBlock;
use crate::runner::{TesterHandle, WorkloadRequest, spawn_tester};
use crate::spec::{Phases, TestSpec, read_test_specs};

/// How long the controller waits for testers to show up.
const TESTER_RECRUITMENT_TIMEOUT: Duration = Duration::from_secs(600);
/// Delay between tester list polls during recruitment.
const WORKER_POLL_DELAY: Duration = Duration::from_secs(1);
/// Settle time between check and metrics when the test used the DB.
const DB_SETTLE: Duration = Duration::from_secs(3);
/// Bound on the synthesized starting-configuration change.
const CHANGE_CONFIG_TIMEOUT: Duration = Duration::from_secs(2000);
/// Bound on one database dump.
const DUMP_TIMEOUT: Duration = Duration::from_secs(30);
/// Overall bound on the post-test consistency check, including retries.
const CONSISTENCY_CHECK_TIMEOUT: Duration = Duration::from_secs(20_000);
/// Wall-clock limit before the consistency check escalates failures.
const CONSISTENCY_SOFT_TIME_LIMIT: Duration = Duration::from_secs(18_000);
/// Quiescent wait forwarded to the consistency check workload.
const CONSISTENCY_QUIESCENT_WAIT: f64 = 10_000.0;
/// Bound on clearing the user keyspace after a test.
const CLEAR_DATA_TIMEOUT: Duration = Duration::from_secs(1000);
/// Bound on the end-of-run quiescence wait.
const QUIESCENCE_END_TIMEOUT: Duration = Duration::from_secs(2_000_000);
/// Rate limit handed to the standalone consistency-check mode.
const CONSISTENCY_CHECK_RATE_LIMIT_MAX: i64 = 50_000_000;

/// Which tests to run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TestType {
    /// Read a spec file and run every test in it.
    FromFile,
    /// Synthesize a single standalone consistency check; no file read.
    ConsistencyCheck,
}

/// Where workloads run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TestLocation {
    /// One in-process tester.
    Here,
    /// Any recruited worker.
    OnServers,
    /// Only tester-tagged workers.
    OnTesters,
}

/// Controller tunables; defaults match production settings.
#[derive(Debug, Clone)]
pub struct ControllerConfig {
    /// Window within which each per-tester phase reply must arrive.
    pub reply_failure_window: Duration,
    pub min_testers_expected: usize,
    /// Starting database configuration applied before the first test.
    pub starting_configuration: Option<String>,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            reply_failure_window: Duration::from_secs(60),
            min_testers_expected: 1,
            starting_configuration: None,
        }
    }
}

impl ControllerConfig {
    /// Simulation runs allow a full day for a reply before declaring the
    /// tester failed.
    pub fn simulation() -> Self {
        Self {
            reply_failure_window: Duration::from_secs(24 * 60 * 60),
            ..Self::default()
        }
    }
}

/// Per-test verdict and aggregated metrics.
#[derive(Debug, Clone, Default)]
pub struct DistributedTestResults {
    pub metrics: Vec<PerfMetric>,
    pub successes: usize,
    pub failures: usize,
}

impl DistributedTestResults {
    pub fn ok(&self) -> bool {
        self.successes > 0 && self.failures == 0
    }
}

/// Run-wide verdict counters, owned by the controller.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TestSummary {
    pub pass_count: usize,
    pub fail_count: usize,
}

impl TestSummary {
    /// The run finishes ok iff every executed test's check passed
    /// unanimously.
    pub fn all_passed(&self) -> bool {
        self.fail_count == 0
    }
}

/// Await one phase reply within the failure window. A missing reply --
/// window elapsed or runner gone -- is a per-client failure, not an
/// abort of the other clients.
async fn reply_or_failure<T>(
    rx: oneshot::Receiver<HarnessResult<T>>,
    window: Duration,
) -> HarnessResult<T> {
    match timeout(window, rx).await {
        Ok(Ok(result)) => result,
        Ok(Err(_closed)) => Err(HarnessError::OperationFailed),
        Err(_elapsed) => Err(HarnessError::OperationFailed),
    }
}

/// Fail the whole test on the first per-client error of a phase.
fn throw_if_error<T>(results: &[HarnessResult<T>], phase: &str, title: &str) -> HarnessResult<()> {
    for result in results {
        if let Err(err) = result {
            metrics::counter!("drover_phase_failures_total").increment(1);
            error!(title, phase, %err, "phase failed for workload");
            return Err(err.clone());
        }
    }
    Ok(())
}

/// Drive one spec through its phases on the given testers.
pub async fn run_workload(
    testers: &[TesterHandle],
    spec: &TestSpec,
    config: &ControllerConfig,
) -> HarnessResult<DistributedTestResults> {
    info!(
        title = %spec.title,
        tester_count = testers.len(),
        timeout_secs = spec.timeout_secs,
        "test running"
    );

    let shared_random = rand::thread_rng().gen_range(0..u64::MAX);
    let mut recruit_replies = Vec::with_capacity(testers.len());
    for (client_id, tester) in testers.iter().enumerate() {
        let (reply_tx, reply_rx) = oneshot::channel();
        tester
            .send_request(WorkloadRequest {
                title: spec.title.clone(),
                options: spec.options.clone(),
                use_db: spec.use_db,
                timeout: (spec.timeout_secs > 0).then(|| Duration::from_secs(spec.timeout_secs)),
                database_ping_delay: spec.database_ping_delay,
                client_id,
                client_count: testers.len(),
                shared_random,
                reply: reply_tx,
            })
            .await?;
        recruit_replies.push(reply_rx);
    }

    let mut workloads = Vec::with_capacity(recruit_replies.len());
    for reply_rx in recruit_replies {
        let handle = reply_rx
            .await
            .map_err(|_| HarnessError::OperationFailed)??;
        workloads.push(handle);
    }

    let window = config.reply_failure_window;
    let mut successes = 0;
    let mut failures = 0;
    let mut metrics_results = Vec::new();

    if spec.phases.contains(Phases::SETUP) {
        info!(title = %spec.title, "test setup start");
        let results = join_all(workloads.iter().map(|w| async {
            reply_or_failure(w.request_setup().await, window).await
        }))
        .await;
        throw_if_error(&results, "setup", &spec.title)?;
        info!(title = %spec.title, "test setup complete");
    }

    if spec.phases.contains(Phases::EXECUTION) {
        info!(title = %spec.title, "test starting");
        let results = join_all(workloads.iter().map(|w| async {
            reply_or_failure(w.request_start().await, window).await
        }))
        .await;
        throw_if_error(&results, "start", &spec.title)?;
        info!(title = %spec.title, "test execution complete");
    }

    if spec.phases.contains(Phases::CHECK) {
        info!(title = %spec.title, "checking results");
        let results = join_all(workloads.iter().map(|w| async {
            reply_or_failure(w.request_check().await, window).await
        }))
        .await;
        throw_if_error(&results, "check", &spec.title)?;
        for result in &results {
            match result {
                Ok(reply) if reply.value => successes += 1,
                _ => failures += 1,
            }
        }
    }

    if spec.phases.contains(Phases::METRICS) {
        // Let the database settle between the check and metrics phases.
        if spec.use_db && spec.phases.contains(Phases::EXECUTION) {
            sleep(DB_SETTLE).await;
        }
        info!(title = %spec.title, "fetching metrics");
        let results = join_all(workloads.iter().map(|w| async {
            reply_or_failure(w.request_metrics().await, window).await
        }))
        .await;
        throw_if_error(&results, "metrics", &spec.title)?;
        for result in results {
            if let Ok(metrics) = result {
                metrics_results.push(metrics);
            }
        }
    }

    // Stopping is fire-and-forget; runners also die by their own timeout.
    for workload in &workloads {
        workload.stop();
    }

    Ok(DistributedTestResults {
        metrics: aggregate_metrics(metrics_results),
        successes,
        failures,
    })
}

/// Apply a database configuration by running the ChangeConfig workload.
async fn change_configuration(
    testers: &[TesterHandle],
    config: &ControllerConfig,
    config_mode: &str,
) -> HarnessResult<()> {
    let mut options = OptionBlock::new();
    options.push("testName", "ChangeConfig");
    options.push("configMode", config_mode);
    let spec = TestSpec {
        title: "ChangeConfig".to_string(),
        options: vec![options],
        ..TestSpec::default()
    };
    run_workload(testers, &spec, config).await.map(|_| ())
}

/// Run the consistency-check workload, retrying after datacenter repair
/// until it passes or the soft time limit escalates failures to errors.
async fn check_consistency(
    cluster: &Arc<dyn ClusterControl>,
    testers: &[TesterHandle],
    do_quiescent_check: bool,
    database_ping_delay: f64,
    config: &ControllerConfig,
) -> HarnessResult<()> {
    let mut options = OptionBlock::new();
    options.push("testName", "ConsistencyCheck");
    options.push(
        "performQuiescentChecks",
        if do_quiescent_check { "true" } else { "false" },
    );
    options.push("quiescentWaitTimeout", format!("{CONSISTENCY_QUIESCENT_WAIT}"));
    options.push("distributed", "false");
    let mut spec = TestSpec {
        title: "ConsistencyCheck".to_string(),
        options: vec![options],
        database_ping_delay,
        timeout_secs: 32_000,
        ..TestSpec::default()
    };

    let started = Instant::now();
    let mut last_run = false;
    loop {
        let results = run_workload(testers, &spec, config).await?;
        if results.ok() || last_run {
            return Ok(());
        }
        if started.elapsed() > CONSISTENCY_SOFT_TIME_LIMIT {
            spec.options[0].push("failureIsError", "true");
            last_run = true;
        }
        cluster.repair_dead_datacenter("ConsistencyCheck").await?;
    }
}

/// Clear the entire user keyspace with one self-conflicting commit.
async fn clear_data(db: &Db) -> HarnessResult<()> {
    let mut tr = db.begin().await.map_err(HarnessError::from)?;
    loop {
        tr.clear_range(USER_KEYS_BEGIN, USER_KEYS_END);
        tr.make_self_conflicting();
        match tr.commit().await {
            Ok(()) => {
                info!(version = ?tr.committed_version(), "cleared database after test");
                return Ok(());
            }
            Err(err) => {
                warn!(%err, "error clearing database, retrying");
                tr.on_error(err).await.map_err(HarnessError::from)?;
            }
        }
    }
}

/// Dump the user keyspace to an HTML table file.
async fn dump_database(db: &Db, path: &Path) -> HarnessResult<()> {
    const PAGE: usize = 1000;
    let mut tr = db.begin().await.map_err(HarnessError::from)?;
    let mut begin = USER_KEYS_BEGIN.to_vec();
    let mut rows = String::new();
    loop {
        let page = loop {
            match tr.get_range(&begin, USER_KEYS_END, PAGE).await {
                Ok(page) => break page,
                Err(err) => tr.on_error(err).await.map_err(HarnessError::from)?,
            }
        };
        for (key, value) in &page {
            rows.push_str(&format!(
                "<tr><td>{}</td><td>{}</td></tr>\n",
                html_escape(&String::from_utf8_lossy(key)),
                html_escape(&String::from_utf8_lossy(value)),
            ));
        }
        if page.len() < PAGE {
            break;
        }
        // Resume just past the last key of the page.
        begin = page.last().map(|(k, _)| k.clone()).unwrap_or(begin);
        begin.push(0);
    }
    let html = format!(
        "<html><body><table border=\"1\">\n<tr><th>Key</th><th>Value</th></tr>\n{rows}</table></body></html>\n"
    );
    tokio::fs::write(path, html)
        .await
        .map_err(|err| HarnessError::Db(DbError::Failed(format!("dump write failed: {err}"))))
}

fn html_escape(input: &str) -> String {
    input
        .replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
}

/// Run one test plus its post-test actions; updates the summary and
/// returns the verdict. Only reboot-class and cancellation errors
/// propagate; everything else is a failed test and the run continues.
pub async fn run_test(
    cluster: &Arc<dyn ClusterControl>,
    db: &Db,
    testers: &[TesterHandle],
    spec: &TestSpec,
    config: &ControllerConfig,
    summary: &mut TestSummary,
) -> HarnessResult<bool> {
    let bounded = async {
        match (spec.timeout_secs > 0).then(|| Duration::from_secs(spec.timeout_secs)) {
            Some(bound) => match timeout(bound, run_workload(testers, spec, config)).await {
                Ok(result) => result,
                Err(_) => Err(HarnessError::TimedOut),
            },
            None => run_workload(testers, spec, config).await,
        }
    };

    let results = match bounded.await {
        Ok(results) => {
            log_metrics(&results.metrics);
            results
        }
        Err(HarnessError::TimedOut) => {
            error!(
                title = %spec.title,
                reason = "Test timed out",
                timeout_secs = spec.timeout_secs,
                "test failure"
            );
            DistributedTestResults {
                metrics: Vec::new(),
                successes: 0,
                failures: testers.len(),
            }
        }
        Err(err) if !err.is_catchable() => return Err(err),
        Err(err) => {
            error!(title = %spec.title, %err, "test failure");
            DistributedTestResults {
                metrics: Vec::new(),
                successes: 0,
                failures: testers.len(),
            }
        }
    };

    let mut ok = results.ok();

    if spec.use_db {
        if spec.dump_after_test {
            let path = PathBuf::from(format!("dump after {}.html", spec.title));
            match timeout(DUMP_TIMEOUT, dump_database(db, &path)).await {
                Ok(Ok(())) => {}
                Ok(Err(err)) => {
                    error!(title = %spec.title, %err, reason = "Unable to dump database", "test failure");
                    ok = false;
                }
                Err(_) => {
                    error!(title = %spec.title, reason = "Unable to dump database", "test failure");
                    ok = false;
                }
            }
            sleep(Duration::from_secs(1)).await;
        }

        if spec.run_consistency_check {
            let quiescent = spec.wait_for_quiescence_end;
            let checked = timeout(
                CONSISTENCY_CHECK_TIMEOUT,
                check_consistency(
                    cluster,
                    testers,
                    quiescent,
                    spec.database_ping_delay,
                    config,
                ),
            )
            .await;
            match checked {
                Ok(Ok(())) => {}
                Ok(Err(err)) if !err.is_catchable() => return Err(err),
                Ok(Err(err)) => {
                    error!(title = %spec.title, %err, reason = "Unable to perform consistency check", "test failure");
                    ok = false;
                }
                Err(_) => {
                    error!(title = %spec.title, reason = "Unable to perform consistency check", "test failure");
                    ok = false;
                }
            }
        }
    }

    if ok {
        summary.pass_count += 1;
        info!(title = %spec.title, passed = true, "test results");
    } else {
        summary.fail_count += 1;
        warn!(title = %spec.title, passed = false, "test results");
    }
    info!(
        title = %spec.title,
        clients_passed = results.successes,
        clients_failed = results.failures,
        "per-client verdicts"
    );

    if spec.use_db && spec.clear_after_test {
        match timeout(CLEAR_DATA_TIMEOUT, clear_data(db)).await {
            Ok(Ok(())) => {}
            Ok(Err(err)) => {
                error!(%err, "error clearing database after test");
                // Later tests must not run against a dirty database.
                return Err(err);
            }
            Err(_) => {
                error!("timed out clearing database after test");
                return Err(HarnessError::TimedOut);
            }
        }
        sleep(Duration::from_secs(1)).await;
    }

    Ok(ok)
}

/// Wait for database quiescence, racing the liveness prober.
async fn quiet_database_racing_liveness(
    cluster: &Arc<dyn ClusterControl>,
    db: &Db,
    phase: &'static str,
    bound: Duration,
    database_ping_delay: f64,
    start_delay: Duration,
) -> HarnessResult<()> {
    let quiet = async {
        match timeout(bound, cluster.quiet_database(phase)).await {
            Ok(result) => result,
            Err(_) => Err(HarnessError::TimedOut),
        }
    };
    if database_ping_delay > 0.0 {
        tokio::select! {
            result = quiet => result,
            err = database_liveness(
                db.clone(),
                Duration::from_secs_f64(database_ping_delay),
                phase,
                start_delay,
            ) => Err(err),
        }
    } else {
        quiet.await
    }
}

/// The full run over a list of specs: fold run-wide attributes, apply the
/// starting configuration, wait for initial quiescence, run every test,
/// and wait for final quiescence.
pub async fn run_tests(
    cluster: Arc<dyn ClusterControl>,
    testers: Vec<TesterHandle>,
    mut specs: Vec<TestSpec>,
    config: ControllerConfig,
) -> HarnessResult<TestSummary> {
    let mut use_db = specs.is_empty();
    let mut wait_for_quiescence_begin = false;
    let mut wait_for_quiescence_end = false;
    let mut start_delay = 0.0f64;
    let mut database_ping_delay = f64::INFINITY;
    let mut hints = crate::cluster::SimulationHints::default();

    for spec in &mut specs {
        use_db |= spec.use_db;
        wait_for_quiescence_begin |= spec.wait_for_quiescence_begin;
        wait_for_quiescence_end |= spec.wait_for_quiescence_end;
        start_delay = start_delay.max(spec.start_delay);
        database_ping_delay = database_ping_delay.min(spec.database_ping_delay);
        hints.check_relocation_duration |= spec.sim_check_relocation_duration;
        if spec.sim_connection_failures_disable_duration > 0.0 {
            hints.connection_failures_disable_duration =
                spec.sim_connection_failures_disable_duration;
        }
        if spec.sim_backup_agents != crate::spec::BackupAgentHint::None {
            hints.backup_agents = spec.sim_backup_agents;
        }
        if spec.sim_dr_agents != crate::spec::BackupAgentHint::None {
            hints.dr_agents = spec.sim_dr_agents;
        }
        if let Some(block) = spec.options.first_mut() {
            hints.enable_data_distribution |= block.take_bool("enableDD", false)?;
        }
    }

    if !use_db {
        database_ping_delay = 0.0;
    } else if !database_ping_delay.is_finite() {
        database_ping_delay = 0.0;
    }

    cluster.apply_simulation_hints(&hints);
    let db = cluster.open_database();

    if use_db {
        if let Some(config_mode) = config.starting_configuration.clone() {
            info!(config_mode = %config_mode, "applying starting configuration");
            let applied = timeout(
                CHANGE_CONFIG_TIMEOUT,
                change_configuration(&testers, &config, &config_mode),
            )
            .await;
            match applied {
                Ok(Ok(())) => {}
                Ok(Err(err)) if !err.is_catchable() => return Err(err),
                Ok(Err(err)) => {
                    error!(%err, reason = "Unable to set starting configuration", "test failure");
                }
                Err(_) => {
                    error!(reason = "Unable to set starting configuration", "test failure");
                }
            }
        }
    }

    if use_db && wait_for_quiescence_begin {
        info!(
            database_ping_delay,
            start_delay, "waiting for pre-test quiescence"
        );
        quiet_database_racing_liveness(
            &cluster,
            &db,
            "quiet_database_start",
            QUIESCENCE_END_TIMEOUT,
            database_ping_delay,
            Duration::from_secs_f64(start_delay),
        )
        .await?;
    }

    info!(count = specs.len(), "tests expected to pass");
    let mut summary = TestSummary::default();
    for spec in &specs {
        info!(title = %spec.title, "run test start");
        run_test(&cluster, &db, &testers, spec, &config, &mut summary).await?;
        info!(title = %spec.title, "run test done");
    }

    info!(
        pass_count = summary.pass_count,
        fail_count = summary.fail_count,
        "test run complete"
    );

    if (specs.is_empty() || use_db) && wait_for_quiescence_end {
        info!("waiting for post-run quiescence");
        quiet_database_racing_liveness(
            &cluster,
            &db,
            "quiet_database_end",
            QUIESCENCE_END_TIMEOUT,
            database_ping_delay,
            Duration::ZERO,
        )
        .await?;
    }

    Ok(summary)
}

/// Fetch tester endpoints from the cluster until enough are available,
/// re-querying on membership change and bounded by the recruitment
/// timeout.
pub async fn recruit_testers(
    cluster: &Arc<dyn ClusterControl>,
    location: TestLocation,
    min_testers_expected: usize,
) -> HarnessResult<Vec<TesterHandle>> {
    let tester_class_only = matches!(location, TestLocation::OnTesters);
    let recruit = async {
        loop {
            let testers = cluster.testers(tester_class_only).await?;
            if testers.len() >= min_testers_expected {
                return Ok(testers);
            }
            tokio::select! {
                _ = sleep(WORKER_POLL_DELAY) => {}
                _ = cluster.membership_changed() => {}
            }
        }
    };
    match timeout(TESTER_RECRUITMENT_TIMEOUT, recruit).await {
        Ok(result) => result,
        Err(_) => {
            error!("tester recruitment timeout");
            Err(HarnessError::TimedOut)
        }
    }
}

/// The synthesized spec used by [`TestType::ConsistencyCheck`].
fn consistency_check_spec() -> TestSpec {
    let mut options = OptionBlock::new();
    options.push("testName", "ConsistencyCheck");
    options.push("performQuiescentChecks", "false");
    options.push("distributed", "false");
    options.push("failureIsError", "true");
    options.push("indefinite", "true");
    options.push("rateLimitMax", format!("{CONSISTENCY_CHECK_RATE_LIMIT_MAX}"));
    options.push("shuffleShards", "true");
    TestSpec {
        title: "ConsistencyCheck".to_string(),
        options: vec![options],
        database_ping_delay: 0.0,
        timeout_secs: 0,
        wait_for_quiescence_begin: false,
        wait_for_quiescence_end: false,
        ..TestSpec::default()
    }
}

/// Top-level entry: resolve the spec list for the run mode, recruit or
/// spawn testers, and drive the whole run.
pub async fn run_test_suite(
    cluster: Arc<dyn ClusterControl>,
    test_type: TestType,
    location: TestLocation,
    spec_file: Option<&Path>,
    config: ControllerConfig,
) -> HarnessResult<TestSummary> {
    let specs = match test_type {
        TestType::ConsistencyCheck => vec![consistency_check_spec()],
        TestType::FromFile => {
            let path = spec_file.ok_or_else(|| {
                HarnessError::SpecInvalid("no spec file provided for file-based run".to_string())
            })?;
            read_test_specs(path)?
        }
    };

    let testers = match location {
        TestLocation::Here => vec![spawn_tester(cluster.open_database())],
        TestLocation::OnServers | TestLocation::OnTesters => {
            recruit_testers(&cluster, location, config.min_testers_expected).await?
        }
    };

    run_tests(cluster, testers, specs, config).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cluster::LocalCluster;
    use crate::spec::parse_test_specs;

    fn noop_spec(title: &str, timeout_secs: u64) -> TestSpec {
        let input = format!(
            "testTitle={title}\ntimeout={timeout_secs}\nuseDB=false\ntestName=Noop\n"
        );
        parse_test_specs(&input).unwrap().remove(0)
    }

    #[tokio::test]
    async fn single_noop_test_passes() {
        let cluster = LocalCluster::new(1);
        let control: Arc<dyn ClusterControl> = cluster.clone();
        let testers = control.testers(false).await.unwrap();
        let summary = run_tests(
            control,
            testers,
            vec![noop_spec("T1", 60)],
            ControllerConfig::default(),
        )
        .await
        .unwrap();
        assert_eq!(summary.pass_count, 1);
        assert_eq!(summary.fail_count, 0);
        assert!(summary.all_passed());
    }

    #[tokio::test]
    async fn check_verdicts_are_counted_per_tester() {
        let cluster = LocalCluster::new(3);
        let control: Arc<dyn ClusterControl> = cluster.clone();
        let testers = control.testers(false).await.unwrap();
        let results = run_workload(
            &testers,
            &noop_spec("T1", 60),
            &ControllerConfig::default(),
        )
        .await
        .unwrap();
        assert_eq!(results.successes, 3);
        assert_eq!(results.failures, 0);
        assert!(results.ok());
        let reporting = results
            .metrics
            .iter()
            .find(|m| m.name == "Reporting Clients")
            .unwrap();
        assert_eq!(reporting.value, 3.0);
    }

    #[tokio::test]
    async fn unknown_workload_fails_test_and_run_continues() {
        let cluster = LocalCluster::new(1);
        let control: Arc<dyn ClusterControl> = cluster.clone();
        let testers = control.testers(false).await.unwrap();
        let specs = parse_test_specs(
            "testTitle=Bad\ntimeout=60\nuseDB=false\ntestName=DoesNotExist\n\
             testTitle=Good\ntimeout=60\nuseDB=false\ntestName=Noop\n",
        )
        .unwrap();
        let summary = run_tests(control, testers, specs, ControllerConfig::default())
            .await
            .unwrap();
        assert_eq!(summary.fail_count, 1);
        assert_eq!(summary.pass_count, 1);
    }

    #[tokio::test]
    async fn recruitment_returns_available_testers() {
        let cluster = LocalCluster::new(2);
        let control: Arc<dyn ClusterControl> = cluster;
        let testers = recruit_testers(&control, TestLocation::OnServers, 2)
            .await
            .unwrap();
        assert_eq!(testers.len(), 2);
    }
}
