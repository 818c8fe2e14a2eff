//! Drover - a distributed workload-driving test harness for transactional
//! key-value stores.
//!
//! The harness reads declarative test specs, recruits a fleet of tester
//! processes, asks each to instantiate one or more parameterized
//! workloads, drives every workload through a four-phase lifecycle
//! (setup, execution, check, metrics), and aggregates per-client results
//! into a single verdict. The key components are:
//!
//! ## Controller side
//!
//! - [`spec`]: the line-oriented spec-file parser and [`spec::TestSpec`]
//! - [`controller`]: phase fan-out, verdict aggregation, between-test actions
//! - [`cluster`]: the cluster-control collaborator interface
//!
//! ## Tester side
//!
//! - [`runner`]: the per-tester request/reply workload runner
//! - [`workload`]: the four-phase workload contract and registry
//! - [`liveness`]: the background database liveness prober
//! - [`workloads`]: built-in workloads, including the TPC-C-style benchmark
//!
//! ## Shared
//!
//! - [`db`]: the database client interface and in-memory backend
//! - [`metrics`]: performance metric aggregation and latency reservoirs
//! - [`error`]: the error taxonomy shared across components

pub mod cluster;
pub mod controller;
pub mod db;
pub mod error;
pub mod liveness;
pub mod metrics;
pub mod options;
pub mod runner;
pub mod spec;
pub mod workload;
pub mod workloads;

// Error taxonomy
pub use error::{HarnessError, HarnessResult};

// Spec model and parser
pub use spec::{
    BackupAgentHint, Phases, TestSpec, emit_test_specs, parse_test_specs, read_test_specs,
};

// Options
pub use options::OptionBlock;

// Metrics
pub use metrics::{DEFAULT_RESERVOIR_SIZE, LatencyReservoir, PerfMetric, aggregate_metrics};

// Database interface
pub use db::{Db, DbError, KvDatabase, KvTransaction, memory::MemoryDb};

// Workload contract
pub use workload::{
    CompoundWorkload, Workload, WorkloadConstructor, WorkloadContext, build_workload,
    register_workload, registered_workloads,
};

// Runner and tester endpoints
pub use runner::{CheckReply, TesterHandle, WorkloadHandle, WorkloadRequest, spawn_tester};

// Controller
pub use controller::{
    ControllerConfig, DistributedTestResults, TestLocation, TestSummary, TestType,
    recruit_testers, run_test_suite, run_tests, run_workload,
};

// Cluster collaborator
pub use cluster::{ClusterControl, LocalCluster, SimulationHints};
