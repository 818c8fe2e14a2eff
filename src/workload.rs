//! Workload lifecycle contract, the construction registry, and
//! compound-workload fan-out.
//!
//! A workload is a named, parameterized test body with four phases:
//! setup, start (the execution body), check, and a metrics snapshot. The
//! process-wide registry maps workload names to constructors; a test spec
//! with more than one option block builds a compound workload that drives
//! every child through each phase in parallel.

use std::collections::HashMap;
use std::sync::RwLock;
use std::time::Duration;

use async_trait::async_trait;
use futures::future::join_all;
use once_cell::sync::Lazy;

use crate::db::Db;
use crate::error::{HarnessError, HarnessResult};
use crate::metrics::PerfMetric;
use crate::options::OptionBlock;

/// Default bound on a workload's check phase.
pub const DEFAULT_CHECK_TIMEOUT: Duration = Duration::from_secs(3000);

/// Per-client construction context, passed by value into a constructor.
///
/// `shared_random` is identical across all clients of one test so they
/// can deterministically partition work among themselves.
#[derive(Debug, Clone)]
pub struct WorkloadContext {
    pub client_id: usize,
    pub client_count: usize,
    pub shared_random: u64,
    pub options: OptionBlock,
}

/// The four-phase lifecycle every test body implements.
#[async_trait]
pub trait Workload: Send + Sync + std::fmt::Debug {
    /// Stable name used in logs and compound metric prefixes.
    fn description(&self) -> String;

    /// Idempotent preparation; called at most once per test.
    async fn setup(&self, db: &Db) -> HarnessResult<()>;

    /// The main body; may spawn its own concurrent clients.
    async fn start(&self, db: &Db) -> HarnessResult<()>;

    /// Verifier, bounded by [`Workload::check_timeout`].
    async fn check(&self, db: &Db) -> HarnessResult<bool>;

    /// Pure snapshot of this client's metrics.
    fn get_metrics(&self, out: &mut Vec<PerfMetric>);

    fn check_timeout(&self) -> Duration {
        DEFAULT_CHECK_TIMEOUT
    }
}

/// Constructor registered for a workload name. Takes the context by
/// mutable reference so the factory can inspect unconsumed options after
/// construction.
pub type WorkloadConstructor = fn(&mut WorkloadContext) -> HarnessResult<Box<dyn Workload>>;

static REGISTRY: Lazy<RwLock<HashMap<String, WorkloadConstructor>>> = Lazy::new(|| {
    let mut registry = HashMap::new();
    crate::workloads::register_builtin(&mut registry);
    RwLock::new(registry)
});

/// Register a workload constructor under a name. Built-in workloads are
/// registered before the first lookup; callers may add their own ahead of
/// running the controller.
pub fn register_workload(name: impl Into<String>, constructor: WorkloadConstructor) {
    REGISTRY
        .write()
        .unwrap_or_else(|poisoned| poisoned.into_inner())
        .insert(name.into(), constructor);
}

fn lookup_constructor(name: &str) -> Option<WorkloadConstructor> {
    REGISTRY
        .read()
        .unwrap_or_else(|poisoned| poisoned.into_inner())
        .get(name)
        .copied()
}

/// Names currently registered, for diagnostics.
pub fn registered_workloads() -> Vec<String> {
    let mut names: Vec<String> = REGISTRY
        .read()
        .unwrap_or_else(|poisoned| poisoned.into_inner())
        .keys()
        .cloned()
        .collect();
    names.sort();
    names
}

/// Build the workload for one tester from the spec's option blocks.
///
/// One block builds the named workload directly; several build a
/// [`CompoundWorkload`] over all of them. Construction fails with
/// `SpecInvalid` for a missing name or for options no accessor consumed.
pub fn build_workload(
    blocks: &[OptionBlock],
    client_id: usize,
    client_count: usize,
    shared_random: u64,
) -> HarnessResult<Box<dyn Workload>> {
    if blocks.is_empty() {
        return Err(HarnessError::SpecInvalid(
            "no options were provided for workload".to_string(),
        ));
    }
    if blocks.len() == 1 {
        return build_one(blocks[0].clone(), client_id, client_count, shared_random);
    }
    let mut children = Vec::with_capacity(blocks.len());
    for block in blocks {
        children.push(build_one(
            block.clone(),
            client_id,
            client_count,
            shared_random,
        )?);
    }
    Ok(Box::new(CompoundWorkload { children }))
}

fn build_one(
    options: OptionBlock,
    client_id: usize,
    client_count: usize,
    shared_random: u64,
) -> HarnessResult<Box<dyn Workload>> {
    let mut ctx = WorkloadContext {
        client_id,
        client_count,
        shared_random,
        options,
    };
    let name = ctx.options.take_str("testName", "no-test-specified");
    let constructor = lookup_constructor(&name).ok_or_else(|| {
        HarnessError::SpecInvalid(format!("'{name}' is not a registered workload"))
    })?;
    let workload = constructor(&mut ctx)?;
    ctx.options.check_all_consumed()?;
    Ok(workload)
}

/// A workload composed of several children driven in parallel.
#[derive(Debug)]
pub struct CompoundWorkload {
    children: Vec<Box<dyn Workload>>,
}

impl CompoundWorkload {
    fn first_error<T>(results: Vec<HarnessResult<T>>) -> HarnessResult<Vec<T>> {
        let mut values = Vec::with_capacity(results.len());
        let mut first_error = None;
        for result in results {
            match result {
                Ok(value) => values.push(value),
                Err(err) if err.is_reboot() => return Err(err),
                Err(err) => {
                    first_error.get_or_insert(err);
                }
            }
        }
        match first_error {
            Some(err) => Err(err),
            None => Ok(values),
        }
    }
}

#[async_trait]
impl Workload for CompoundWorkload {
    fn description(&self) -> String {
        self.children
            .iter()
            .map(|child| child.description())
            .collect::<Vec<_>>()
            .join(";")
    }

    async fn setup(&self, db: &Db) -> HarnessResult<()> {
        let results = join_all(self.children.iter().map(|child| child.setup(db))).await;
        Self::first_error(results).map(|_| ())
    }

    async fn start(&self, db: &Db) -> HarnessResult<()> {
        let results = join_all(self.children.iter().map(|child| child.start(db))).await;
        Self::first_error(results).map(|_| ())
    }

    async fn check(&self, db: &Db) -> HarnessResult<bool> {
        let results = join_all(self.children.iter().map(|child| child.check(db))).await;
        let values = Self::first_error(results)?;
        Ok(values.into_iter().all(|ok| ok))
    }

    fn get_metrics(&self, out: &mut Vec<PerfMetric>) {
        for child in &self.children {
            let prefix = format!("{}.", child.description());
            let mut child_metrics = Vec::new();
            child.get_metrics(&mut child_metrics);
            out.extend(
                child_metrics
                    .into_iter()
                    .map(|metric| metric.with_prefix(&prefix)),
            );
        }
    }

    fn check_timeout(&self) -> Duration {
        self.children
            .iter()
            .map(|child| child.check_timeout())
            .max()
            .unwrap_or(DEFAULT_CHECK_TIMEOUT)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::memory::MemoryDb;
    use std::sync::atomic::{AtomicBool, Ordering};

    #[derive(Debug)]
    struct Fixed {
        name: &'static str,
        check_value: bool,
        metric: f64,
        timeout: Duration,
    }

    #[async_trait]
    impl Workload for Fixed {
        fn description(&self) -> String {
            self.name.to_string()
        }

        async fn setup(&self, _db: &Db) -> HarnessResult<()> {
            Ok(())
        }

        async fn start(&self, _db: &Db) -> HarnessResult<()> {
            Ok(())
        }

        async fn check(&self, _db: &Db) -> HarnessResult<bool> {
            Ok(self.check_value)
        }

        fn get_metrics(&self, out: &mut Vec<PerfMetric>) {
            out.push(PerfMetric::new("m", self.metric, false));
        }

        fn check_timeout(&self) -> Duration {
            self.timeout
        }
    }

    fn compound(children: Vec<Box<dyn Workload>>) -> CompoundWorkload {
        CompoundWorkload { children }
    }

    fn fixed(name: &'static str, check_value: bool, metric: f64, timeout_secs: u64) -> Box<dyn Workload> {
        Box::new(Fixed {
            name,
            check_value,
            metric,
            timeout: Duration::from_secs(timeout_secs),
        })
    }

    #[test]
    fn compound_description_joins_children() {
        let w = compound(vec![fixed("A", true, 0.0, 1), fixed("B", true, 0.0, 1)]);
        assert_eq!(w.description(), "A;B");
    }

    #[tokio::test]
    async fn compound_check_is_conjunction() {
        let (db, _) = MemoryDb::shared();
        let all_true = compound(vec![fixed("A", true, 0.0, 1), fixed("B", true, 0.0, 1)]);
        assert!(all_true.check(&db).await.unwrap());

        let one_false = compound(vec![fixed("A", true, 0.0, 1), fixed("B", false, 0.0, 1)]);
        assert!(!one_false.check(&db).await.unwrap());
    }

    #[test]
    fn compound_metrics_are_prefixed_by_child_description() {
        let w = compound(vec![fixed("A", true, 1.0, 1), fixed("B", true, 2.0, 1)]);
        let mut metrics = Vec::new();
        w.get_metrics(&mut metrics);
        assert_eq!(metrics.len(), 2);
        assert_eq!(metrics[0].name, "A.m");
        assert_eq!(metrics[1].name, "B.m");
        assert_eq!(metrics[1].value, 2.0);
    }

    #[test]
    fn compound_check_timeout_is_the_max() {
        let w = compound(vec![fixed("A", true, 0.0, 5), fixed("B", true, 0.0, 60)]);
        assert_eq!(w.check_timeout(), Duration::from_secs(60));
    }

    #[test]
    fn unknown_workload_is_spec_invalid() {
        let mut block = OptionBlock::new();
        block.push("testName", "DoesNotExist");
        let err = build_workload(&[block], 0, 1, 0).unwrap_err();
        assert!(matches!(err, HarnessError::SpecInvalid(_)));
    }

    #[test]
    fn unconsumed_option_is_spec_invalid_and_named() {
        let mut block = OptionBlock::new();
        block.push("testName", "Noop");
        block.push("bogus", "1");
        let err = build_workload(&[block], 0, 1, 0).unwrap_err();
        let msg = err.to_string();
        assert!(msg.contains("bogus"), "message should name the key: {msg}");
    }

    #[test]
    fn custom_registrations_are_visible() {
        static BUILT: AtomicBool = AtomicBool::new(false);

        fn ctor(_ctx: &mut WorkloadContext) -> HarnessResult<Box<dyn Workload>> {
            BUILT.store(true, Ordering::SeqCst);
            Ok(Box::new(Fixed {
                name: "Custom",
                check_value: true,
                metric: 0.0,
                timeout: Duration::from_secs(1),
            }))
        }

        register_workload("CustomFixture", ctor);
        let mut block = OptionBlock::new();
        block.push("testName", "CustomFixture");
        let workload = build_workload(&[block], 0, 1, 0).unwrap();
        assert!(BUILT.load(Ordering::SeqCst));
        assert_eq!(workload.description(), "Custom");
    }
}
