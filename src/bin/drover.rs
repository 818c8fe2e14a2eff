//! Command-line front-end for the harness.
//!
//! Runs a spec file (or the standalone consistency check) against an
//! in-process local cluster. Remote deployments construct their own
//! `ClusterControl` and call into the library instead.

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, ValueEnum};
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use drover::cluster::{ClusterControl, LocalCluster};
use drover::controller::{ControllerConfig, TestLocation, TestType, run_test_suite};

#[derive(Parser, Debug)]
#[command(
    name = "drover",
    about = "Drive declarative workload tests against a transactional key-value store"
)]
struct Args {
    /// Test spec file to run; required unless --consistency-check.
    #[arg(value_name = "SPEC_FILE")]
    spec_file: Option<PathBuf>,

    /// Run the standalone consistency check instead of a spec file.
    #[arg(long, default_value_t = false)]
    consistency_check: bool,

    /// Where workloads run.
    #[arg(long, value_enum, default_value = "here")]
    location: LocationArg,

    /// Number of in-process testers to spawn for local runs.
    #[arg(long, default_value_t = 1)]
    testers: usize,

    /// Minimum testers that must be available before the run starts.
    #[arg(long, default_value_t = 1)]
    min_testers: usize,

    /// Database configuration applied before the first test.
    #[arg(long)]
    starting_configuration: Option<String>,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum LocationArg {
    Here,
    OnServers,
    OnTesters,
}

impl From<LocationArg> for TestLocation {
    fn from(value: LocationArg) -> Self {
        match value {
            LocationArg::Here => TestLocation::Here,
            LocationArg::OnServers => TestLocation::OnServers,
            LocationArg::OnTesters => TestLocation::OnTesters,
        }
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    match run(Args::parse()).await {
        Ok(true) => ExitCode::SUCCESS,
        Ok(false) => ExitCode::FAILURE,
        Err(err) => {
            error!(%err, "test run aborted");
            ExitCode::FAILURE
        }
    }
}

async fn run(args: Args) -> Result<bool> {
    let test_type = if args.consistency_check {
        TestType::ConsistencyCheck
    } else {
        TestType::FromFile
    };
    if test_type == TestType::FromFile && args.spec_file.is_none() {
        anyhow::bail!("a spec file is required unless --consistency-check is set");
    }

    let cluster: Arc<dyn ClusterControl> = LocalCluster::new(args.testers.max(1));
    let config = ControllerConfig {
        min_testers_expected: args.min_testers,
        starting_configuration: args.starting_configuration.clone(),
        ..ControllerConfig::default()
    };

    let summary = run_test_suite(
        cluster,
        test_type,
        args.location.into(),
        args.spec_file.as_deref(),
        config,
    )
    .await
    .context("test suite failed")?;

    info!(
        pass_count = summary.pass_count,
        fail_count = summary.fail_count,
        ok = summary.all_passed(),
        "run finished"
    );
    Ok(summary.all_passed())
}
