//! Per-tester workload runner.
//!
//! A tester server loops on a recruitment channel, spawning one runner
//! per workload request. The runner constructs the workload, announces
//! readiness by sending a [`WorkloadHandle`] back to the controller, and
//! then serves phase requests from a select loop: each phase runs at most
//! once, its result is memoized, and repeated requests are answered from
//! the memo. A liveness prober races every phase when the spec asks for
//! one, and the whole runner is bounded by the spec's overall timeout.

use std::future::{Future, pending};
use std::pin::Pin;
use std::time::Duration;

use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinSet;
use tokio::time::{sleep, timeout};
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::db::Db;
use crate::error::{HarnessError, HarnessResult};
use crate::liveness::database_liveness;
use crate::metrics::PerfMetric;
use crate::options::OptionBlock;
use crate::workload::{Workload, build_workload};

const RECRUITMENT_QUEUE: usize = 16;
const PHASE_QUEUE: usize = 4;
const DB_WARMUP: Duration = Duration::from_secs(1);

/// Reply to a check request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CheckReply {
    pub value: bool,
}

type PhaseReply<T> = oneshot::Sender<HarnessResult<T>>;

/// Controller-to-tester request to host one workload for one test.
pub struct WorkloadRequest {
    pub title: String,
    pub options: Vec<OptionBlock>,
    pub use_db: bool,
    /// Overall runner bound; `None` disables the wall clock.
    pub timeout: Option<Duration>,
    /// Liveness ping period in seconds; 0 disables the prober.
    pub database_ping_delay: f64,
    pub client_id: usize,
    pub client_count: usize,
    pub shared_random: u64,
    pub reply: oneshot::Sender<HarnessResult<WorkloadHandle>>,
}

/// The tester's reply to a recruitment: one request channel per phase.
/// Each phase channel serves a request and answers on a one-shot reply.
#[derive(Debug)]
pub struct WorkloadHandle {
    pub id: Uuid,
    setup_tx: mpsc::Sender<PhaseReply<()>>,
    start_tx: mpsc::Sender<PhaseReply<()>>,
    check_tx: mpsc::Sender<PhaseReply<CheckReply>>,
    metrics_tx: mpsc::Sender<PhaseReply<Vec<PerfMetric>>>,
    stop_tx: mpsc::Sender<oneshot::Sender<()>>,
}

struct PhaseChannels {
    setup_rx: mpsc::Receiver<PhaseReply<()>>,
    start_rx: mpsc::Receiver<PhaseReply<()>>,
    check_rx: mpsc::Receiver<PhaseReply<CheckReply>>,
    metrics_rx: mpsc::Receiver<PhaseReply<Vec<PerfMetric>>>,
    stop_rx: mpsc::Receiver<oneshot::Sender<()>>,
}

impl WorkloadHandle {
    fn new(id: Uuid) -> (Self, PhaseChannels) {
        let (setup_tx, setup_rx) = mpsc::channel(PHASE_QUEUE);
        let (start_tx, start_rx) = mpsc::channel(PHASE_QUEUE);
        let (check_tx, check_rx) = mpsc::channel(PHASE_QUEUE);
        let (metrics_tx, metrics_rx) = mpsc::channel(PHASE_QUEUE);
        let (stop_tx, stop_rx) = mpsc::channel(PHASE_QUEUE);
        (
            Self {
                id,
                setup_tx,
                start_tx,
                check_tx,
                metrics_tx,
                stop_tx,
            },
            PhaseChannels {
                setup_rx,
                start_rx,
                check_rx,
                metrics_rx,
                stop_rx,
            },
        )
    }

    /// Issue a setup request; the receiver resolves with the phase result
    /// or errors if the runner is gone.
    pub async fn request_setup(&self) -> oneshot::Receiver<HarnessResult<()>> {
        let (tx, rx) = oneshot::channel();
        let _ = self.setup_tx.send(tx).await;
        rx
    }

    pub async fn request_start(&self) -> oneshot::Receiver<HarnessResult<()>> {
        let (tx, rx) = oneshot::channel();
        let _ = self.start_tx.send(tx).await;
        rx
    }

    pub async fn request_check(&self) -> oneshot::Receiver<HarnessResult<CheckReply>> {
        let (tx, rx) = oneshot::channel();
        let _ = self.check_tx.send(tx).await;
        rx
    }

    pub async fn request_metrics(&self) -> oneshot::Receiver<HarnessResult<Vec<PerfMetric>>> {
        let (tx, rx) = oneshot::channel();
        let _ = self.metrics_tx.send(tx).await;
        rx
    }

    /// Fire-and-forget stop; the runner acknowledges and exits but the
    /// reply is not waited on.
    pub fn stop(&self) {
        let (tx, _rx) = oneshot::channel();
        let _ = self.stop_tx.try_send(tx);
    }
}

/// Endpoint of one tester process.
#[derive(Clone)]
pub struct TesterHandle {
    pub id: Uuid,
    recruit_tx: mpsc::Sender<WorkloadRequest>,
}

impl TesterHandle {
    /// Submit a workload request; delivery failure means the tester died.
    pub async fn send_request(&self, request: WorkloadRequest) -> HarnessResult<()> {
        self.recruit_tx
            .send(request)
            .await
            .map_err(|_| HarnessError::OperationFailed)
    }
}

/// Spawn an in-process tester server over the given database handle.
pub fn spawn_tester(db: Db) -> TesterHandle {
    let (recruit_tx, recruit_rx) = mpsc::channel(RECRUITMENT_QUEUE);
    let id = Uuid::new_v4();
    tokio::spawn(tester_server(id, db, recruit_rx));
    TesterHandle { id, recruit_tx }
}

/// Serve recruitments until the channel closes or a workload surfaces a
/// fatal error. Reboot-class errors stop the server so the host process
/// manager can restart the tester.
async fn tester_server(id: Uuid, db: Db, mut recruit_rx: mpsc::Receiver<WorkloadRequest>) {
    info!(tester = %id, "starting tester server");
    let mut workloads = JoinSet::new();
    loop {
        tokio::select! {
            request = recruit_rx.recv() => match request {
                Some(request) => {
                    workloads.spawn(run_tester_workload(request, db.clone()));
                }
                None => break,
            },
            Some(joined) = workloads.join_next(), if !workloads.is_empty() => {
                match joined {
                    Ok(Ok(())) => {}
                    Ok(Err(err)) if err.is_cancelled() => {}
                    Ok(Err(err)) if err.is_reboot() => {
                        error!(tester = %id, %err, "tester requesting process restart");
                        break;
                    }
                    Ok(Err(err)) => {
                        error!(tester = %id, %err, "fatal workload error, stopping tester");
                        break;
                    }
                    Err(join_err) if join_err.is_cancelled() => {}
                    Err(join_err) => {
                        error!(tester = %id, %join_err, "workload task panicked, stopping tester");
                        break;
                    }
                }
            }
        }
    }
    info!(tester = %id, "tester server stopped");
}

/// Host one workload for one test: construct, announce readiness, serve
/// phases under the spec's overall timeout.
async fn run_tester_workload(request: WorkloadRequest, db: Db) -> HarnessResult<()> {
    let workload_id = Uuid::new_v4();
    info!(
        workload = %workload_id,
        title = %request.title,
        client_id = request.client_id,
        client_count = request.client_count,
        "workload received"
    );

    if request.use_db {
        sleep(DB_WARMUP).await;
    }

    let workload = match build_workload(
        &request.options,
        request.client_id,
        request.client_count,
        request.shared_random,
    ) {
        Ok(workload) => workload,
        Err(err) => {
            error!(workload = %workload_id, title = %request.title, %err, "workload creation failed");
            let reply_err = match &err {
                HarnessError::SpecInvalid(_) => err.clone(),
                _ => HarnessError::OperationFailed,
            };
            let _ = request.reply.send(Err(reply_err));
            return match err {
                err if err.is_reboot() => Err(err),
                HarnessError::SpecInvalid(_) | HarnessError::TimedOut => Ok(()),
                err => Err(err),
            };
        }
    };

    let (handle, channels) = WorkloadHandle::new(workload_id);
    let serve = serve_workload(
        db,
        channels,
        workload,
        request.database_ping_delay,
        workload_id,
    );
    if request.reply.send(Ok(handle)).is_err() {
        // Controller gave up before readiness; nothing left to serve.
        return Ok(());
    }

    let result = match request.timeout {
        Some(bound) => match timeout(bound, serve).await {
            Ok(result) => result,
            Err(_) => Err(HarnessError::TimedOut),
        },
        None => serve.await,
    };

    match result {
        Ok(()) => {
            info!(workload = %workload_id, title = %request.title, "workload complete");
            Ok(())
        }
        Err(err) if err.is_reboot() => Err(err),
        Err(HarnessError::TimedOut) => {
            // Unfinished phases surface to the controller as dropped reply
            // channels, which it records as per-client failures.
            warn!(workload = %workload_id, title = %request.title, "workload timed out");
            Ok(())
        }
        Err(HarnessError::SpecInvalid(_)) => Ok(()),
        Err(err) => Err(err),
    }
}

type LivenessFuture = Pin<Box<dyn Future<Output = HarnessError> + Send>>;

/// Race one phase against the liveness prober. After the prober fires it
/// is replaced with a pending future so later phases fail fast on the
/// memoized error instead of re-polling a finished task.
async fn race_liveness<T>(
    work: impl Future<Output = HarnessResult<T>>,
    liveness: &mut LivenessFuture,
) -> HarnessResult<T> {
    tokio::select! {
        result = work => result,
        err = liveness.as_mut() => {
            *liveness = Box::pin(pending());
            Err(err)
        }
    }
}

async fn serve_workload(
    db: Db,
    mut channels: PhaseChannels,
    workload: Box<dyn Workload>,
    database_ping_delay: f64,
    workload_id: Uuid,
) -> HarnessResult<()> {
    let description = workload.description();
    info!(
        workload = %workload_id,
        description = %description,
        database_ping_delay,
        "test begin"
    );

    let mut liveness: LivenessFuture = if database_ping_delay > 0.0 {
        Box::pin(database_liveness(
            db.clone(),
            Duration::from_secs_f64(database_ping_delay),
            "workload_runner",
            Duration::ZERO,
        ))
    } else {
        Box::pin(pending())
    };

    let mut setup_result: Option<HarnessResult<()>> = None;
    let mut start_result: Option<HarnessResult<()>> = None;
    let mut check_result: Option<HarnessResult<CheckReply>> = None;

    loop {
        tokio::select! {
            Some(reply) = channels.setup_rx.recv() => {
                if setup_result.is_none() {
                    info!(workload = %workload_id, description = %description, "test setup beginning");
                    let result = race_liveness(workload.setup(&db), &mut liveness).await;
                    setup_result = Some(match result {
                        Ok(()) => {
                            info!(workload = %workload_id, description = %description, "test setup complete");
                            Ok(())
                        }
                        Err(err) if !err.is_catchable() => return Err(err),
                        Err(err) => {
                            error!(workload = %workload_id, description = %description, %err, "test setup error");
                            Err(HarnessError::OperationFailed)
                        }
                    });
                }
                let _ = reply.send(setup_result.clone().unwrap_or(Err(HarnessError::OperationFailed)));
            }
            Some(reply) = channels.start_rx.recv() => {
                if start_result.is_none() {
                    info!(workload = %workload_id, description = %description, "test starting");
                    let result = race_liveness(workload.start(&db), &mut liveness).await;
                    start_result = Some(match result {
                        Ok(()) => Ok(()),
                        Err(err) if !err.is_catchable() => return Err(err),
                        Err(err) => {
                            error!(
                                workload = %workload_id,
                                description = %description,
                                %err,
                                reason = "error starting workload",
                                "test failure"
                            );
                            Err(HarnessError::OperationFailed)
                        }
                    });
                    info!(
                        workload = %workload_id,
                        description = %description,
                        ok = start_result.as_ref().is_some_and(|r| r.is_ok()),
                        "test complete"
                    );
                }
                let _ = reply.send(start_result.clone().unwrap_or(Err(HarnessError::OperationFailed)));
            }
            Some(reply) = channels.check_rx.recv() => {
                if check_result.is_none() {
                    let bound = workload.check_timeout();
                    let checked = race_liveness(
                        async {
                            match timeout(bound, workload.check(&db)).await {
                                Ok(result) => result,
                                Err(_) => Err(HarnessError::TimedOut),
                            }
                        },
                        &mut liveness,
                    )
                    .await;
                    check_result = Some(match checked {
                        Ok(value) => {
                            // A test whose body errored cannot pass its check.
                            let started_ok =
                                start_result.as_ref().map(|r| r.is_ok()).unwrap_or(true);
                            Ok(CheckReply { value: started_ok && value })
                        }
                        Err(err) if !err.is_catchable() => return Err(err),
                        Err(err) => {
                            error!(
                                workload = %workload_id,
                                description = %description,
                                %err,
                                reason = "error checking workload",
                                "test failure"
                            );
                            Err(HarnessError::OperationFailed)
                        }
                    });
                }
                let _ = reply.send(check_result.clone().unwrap_or(Err(HarnessError::OperationFailed)));
            }
            Some(reply) = channels.metrics_rx.recv() => {
                let mut metrics = Vec::new();
                workload.get_metrics(&mut metrics);
                info!(workload = %workload_id, count = metrics.len(), "workload sending metrics");
                let _ = reply.send(Ok(metrics));
            }
            Some(ack) = channels.stop_rx.recv() => {
                let _ = ack.send(());
                break;
            }
            else => break,
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::memory::MemoryDb;
    use crate::workload::WorkloadContext;
    use crate::workload::register_workload;
    use async_trait::async_trait;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    static SETUP_RUNS: AtomicUsize = AtomicUsize::new(0);

    #[derive(Debug)]
    struct Counting;

    #[async_trait]
    impl Workload for Counting {
        fn description(&self) -> String {
            "Counting".to_string()
        }

        async fn setup(&self, _db: &Db) -> HarnessResult<()> {
            SETUP_RUNS.fetch_add(1, Ordering::SeqCst);
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

    fn counting_ctor(_ctx: &mut WorkloadContext) -> HarnessResult<Box<dyn Workload>> {
        Ok(Box::new(Counting))
    }

    #[derive(Debug)]
    struct FailingStart;

    #[async_trait]
    impl Workload for FailingStart {
        fn description(&self) -> String {
            "FailingStart".to_string()
        }

        async fn setup(&self, _db: &Db) -> HarnessResult<()> {
            Ok(())
        }

        async fn start(&self, _db: &Db) -> HarnessResult<()> {
            Err(HarnessError::OperationFailed)
        }

        async fn check(&self, _db: &Db) -> HarnessResult<bool> {
            Ok(true)
        }

        fn get_metrics(&self, _out: &mut Vec<PerfMetric>) {}
    }

    fn failing_start_ctor(_ctx: &mut WorkloadContext) -> HarnessResult<Box<dyn Workload>> {
        Ok(Box::new(FailingStart))
    }

    async fn recruit(tester: &TesterHandle, name: &str, use_db: bool) -> WorkloadHandle {
        let (tx, rx) = oneshot::channel();
        let mut block = OptionBlock::new();
        block.push("testName", name);
        tester
            .send_request(WorkloadRequest {
                title: "t".into(),
                options: vec![block],
                use_db,
                timeout: Some(Duration::from_secs(30)),
                database_ping_delay: 0.0,
                client_id: 0,
                client_count: 1,
                shared_random: 0,
                reply: tx,
            })
            .await
            .unwrap();
        rx.await.unwrap().unwrap()
    }

    #[tokio::test]
    async fn phase_results_are_memoized() {
        register_workload("CountingFixture", counting_ctor);
        SETUP_RUNS.store(0, Ordering::SeqCst);

        let (db, _) = MemoryDb::shared();
        let tester = spawn_tester(db);
        let handle = recruit(&tester, "CountingFixture", false).await;

        let first = handle.request_setup().await.await.unwrap();
        let second = handle.request_setup().await.await.unwrap();
        assert!(first.is_ok());
        assert!(second.is_ok());
        assert_eq!(SETUP_RUNS.load(Ordering::SeqCst), 1);
        handle.stop();
    }

    #[tokio::test]
    async fn check_is_false_after_start_failure() {
        register_workload("FailingStartFixture", failing_start_ctor);

        let (db, _) = MemoryDb::shared();
        let tester = spawn_tester(db);
        let handle = recruit(&tester, "FailingStartFixture", false).await;

        let start = handle.request_start().await.await.unwrap();
        assert!(start.is_err());

        let check = handle.request_check().await.await.unwrap().unwrap();
        assert!(!check.value, "check must not pass after a failed start");
        handle.stop();
    }

    #[tokio::test]
    async fn unknown_workload_replies_spec_invalid() {
        let (db, _) = MemoryDb::shared();
        let tester = spawn_tester(db);
        let (tx, rx) = oneshot::channel();
        let mut block = OptionBlock::new();
        block.push("testName", "NoSuchWorkload");
        tester
            .send_request(WorkloadRequest {
                title: "t".into(),
                options: vec![block],
                use_db: false,
                timeout: None,
                database_ping_delay: 0.0,
                client_id: 0,
                client_count: 1,
                shared_random: 0,
                reply: tx,
            })
            .await
            .unwrap();
        let err = rx.await.unwrap().unwrap_err();
        assert!(matches!(err, HarnessError::SpecInvalid(_)));
    }

    #[tokio::test]
    async fn stop_is_acknowledged_and_runner_exits() {
        register_workload("CountingFixture2", counting_ctor);
        let (db, _) = MemoryDb::shared();
        let tester = spawn_tester(db);
        let handle = recruit(&tester, "CountingFixture2", false).await;

        handle.stop();
        // After stop, further phase requests find a closed channel.
        tokio::time::sleep(Duration::from_millis(50)).await;
        let rx = handle.request_setup().await;
        assert!(rx.await.is_err());
    }
}
