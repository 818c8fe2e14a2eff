//! Test-spec model and the line-oriented spec file parser.
//!
//! A spec file is a sequence of `key = value` lines. `testTitle` opens a
//! new test, `testName` opens a new workload option block within the
//! current test (a second occurrence makes the test compound), recognized
//! attributes configure the test itself, and everything else passes
//! through to the workload as an option. The parser fails only on
//! semantic contradictions; unknown keys are workload options by design.

use std::fmt::Write as _;
use std::path::Path;

use tracing::debug;

use crate::error::{HarnessError, HarnessResult};
use crate::options::OptionBlock;

/// The subset of lifecycle phases a test runs, encoded as a bitmask.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Phases(u8);

impl Phases {
    pub const SETUP: Phases = Phases(1 << 0);
    pub const EXECUTION: Phases = Phases(1 << 1);
    pub const CHECK: Phases = Phases(1 << 2);
    pub const METRICS: Phases = Phases(1 << 3);
    pub const ALL: Phases = Phases(0b1111);

    pub fn empty() -> Phases {
        Phases(0)
    }

    pub fn contains(self, other: Phases) -> bool {
        self.0 & other.0 == other.0
    }

    #[must_use]
    pub fn with(self, other: Phases) -> Phases {
        Phases(self.0 | other.0)
    }

    #[must_use]
    pub fn without(self, other: Phases) -> Phases {
        Phases(self.0 & !other.0)
    }
}

impl Default for Phases {
    fn default() -> Self {
        Phases::ALL
    }
}

/// Advisory backup-agent hint forwarded verbatim to simulation collaborators.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum BackupAgentHint {
    #[default]
    None,
    ToFile,
    ToDatabase,
}

/// One parsed test. Immutable after parsing.
#[derive(Debug, Clone, PartialEq)]
pub struct TestSpec {
    pub title: String,
    /// One option block per workload; more than one makes the test compound.
    pub options: Vec<OptionBlock>,
    /// Overall test timeout in seconds; 0 disables the wall clock.
    pub timeout_secs: u64,
    /// Liveness ping period in seconds; 0 disables the prober.
    pub database_ping_delay: f64,
    pub phases: Phases,
    pub use_db: bool,
    pub dump_after_test: bool,
    pub clear_after_test: bool,
    pub run_consistency_check: bool,
    pub wait_for_quiescence_begin: bool,
    pub wait_for_quiescence_end: bool,
    /// Seconds to wait before pre-test quiescence.
    pub start_delay: f64,
    pub sim_check_relocation_duration: bool,
    pub sim_connection_failures_disable_duration: f64,
    pub sim_backup_agents: BackupAgentHint,
    pub sim_dr_agents: BackupAgentHint,
    pub stderr_severity: Option<String>,
    pub client_info_logging: bool,
}

impl Default for TestSpec {
    fn default() -> Self {
        Self {
            title: String::new(),
            options: Vec::new(),
            timeout_secs: 600,
            database_ping_delay: 0.0,
            phases: Phases::ALL,
            use_db: true,
            dump_after_test: false,
            clear_after_test: false,
            run_consistency_check: false,
            wait_for_quiescence_begin: false,
            wait_for_quiescence_end: false,
            start_delay: 0.0,
            sim_check_relocation_duration: false,
            sim_connection_failures_disable_duration: 0.0,
            sim_backup_agents: BackupAgentHint::None,
            sim_dr_agents: BackupAgentHint::None,
            stderr_severity: None,
            client_info_logging: true,
        }
    }
}

impl TestSpec {
    /// A test with more than one option block fans out to a compound workload.
    pub fn is_compound(&self) -> bool {
        self.options.len() > 1
    }
}

/// Parse a spec file's contents into an ordered list of tests.
pub fn parse_test_specs(input: &str) -> HarnessResult<Vec<TestSpec>> {
    let mut result = Vec::new();
    let mut spec = TestSpec::default();
    let mut block = OptionBlock::new();

    for raw_line in input.lines() {
        let line = raw_line.trim();
        if line.is_empty() || line.starts_with(';') {
            continue;
        }
        let Some(eq) = line.find('=') else {
            debug!(line, "skipping spec line without '='");
            continue;
        };
        let attrib = line[..eq].trim();
        let value = line[eq + 1..].trim();

        match attrib {
            "testTitle" => {
                if !block.is_empty() {
                    spec.options.push(std::mem::take(&mut block));
                }
                if !spec.options.is_empty() && !spec.title.is_empty() {
                    result.push(std::mem::replace(&mut spec, TestSpec::default()));
                }
                spec.title = value.to_string();
            }
            "timeout" => {
                let timeout: i64 = parse_value(attrib, value)?;
                if timeout <= 0 {
                    return Err(HarnessError::SpecInvalid(format!(
                        "timeout must be positive, got {timeout}"
                    )));
                }
                spec.timeout_secs = timeout as u64;
            }
            "databasePingDelay" => {
                let delay: f64 = parse_value(attrib, value)?;
                if delay < 0.0 {
                    return Err(HarnessError::SpecInvalid(format!(
                        "databasePingDelay must be >= 0, got {delay}"
                    )));
                }
                if !spec.use_db && delay > 0.0 {
                    return Err(HarnessError::SpecInvalid(
                        "cannot have a non-zero ping delay on a test that does not use the database"
                            .to_string(),
                    ));
                }
                spec.database_ping_delay = delay;
            }
            "runSetup" => {
                spec.phases = Phases::EXECUTION.with(Phases::CHECK).with(Phases::METRICS);
                if parse_bool(attrib, value)? {
                    spec.phases = spec.phases.with(Phases::SETUP);
                }
            }
            "checkOnly" => {
                if parse_bool(attrib, value)? {
                    spec.phases = Phases::CHECK;
                }
            }
            "dumpAfterTest" => spec.dump_after_test = parse_bool(attrib, value)?,
            "clearAfterTest" => spec.clear_after_test = parse_bool(attrib, value)?,
            "useDB" => {
                spec.use_db = parse_bool(attrib, value)?;
                if !spec.use_db {
                    spec.database_ping_delay = 0.0;
                }
            }
            "startDelay" => spec.start_delay = parse_value(attrib, value)?,
            "runConsistencyCheck" => spec.run_consistency_check = parse_bool(attrib, value)?,
            "waitForQuiescence" => {
                let wait = parse_bool(attrib, value)?;
                spec.wait_for_quiescence_begin = wait;
                spec.wait_for_quiescence_end = wait;
            }
            "waitForQuiescenceBegin" => {
                spec.wait_for_quiescence_begin = parse_bool(attrib, value)?
            }
            "waitForQuiescenceEnd" => spec.wait_for_quiescence_end = parse_bool(attrib, value)?,
            "simCheckRelocationDuration" => {
                spec.sim_check_relocation_duration = parse_bool(attrib, value)?
            }
            "connectionFailuresDisableDuration" => {
                let duration: f64 = parse_value(attrib, value)?;
                if duration < 0.0 {
                    return Err(HarnessError::SpecInvalid(format!(
                        "connectionFailuresDisableDuration must be >= 0, got {duration}"
                    )));
                }
                spec.sim_connection_failures_disable_duration = duration;
            }
            "simBackupAgents" => {
                spec.sim_backup_agents = match value {
                    "BackupToFile" | "BackupToFileAndDB" => BackupAgentHint::ToFile,
                    _ => BackupAgentHint::None,
                };
                spec.sim_dr_agents = match value {
                    "BackupToDB" | "BackupToFileAndDB" => BackupAgentHint::ToDatabase,
                    _ => BackupAgentHint::None,
                };
            }
            "StderrSeverity" => spec.stderr_severity = Some(value.to_string()),
            "ClientInfoLogging" => spec.client_info_logging = parse_bool(attrib, value)?,
            "testName" => {
                if !block.is_empty() {
                    debug!(title = %spec.title, "flushing option block for compound test");
                    spec.options.push(std::mem::take(&mut block));
                }
                block.push(attrib, value);
            }
            _ => {
                // Unrecognized attributes are workload options by design.
                block.push(attrib, value);
            }
        }
    }

    if !block.is_empty() {
        spec.options.push(block);
    }
    if !spec.options.is_empty() && !spec.title.is_empty() {
        result.push(spec);
    }

    Ok(result)
}

/// Read and parse a spec file from disk.
pub fn read_test_specs(path: &Path) -> HarnessResult<Vec<TestSpec>> {
    let contents = std::fs::read_to_string(path).map_err(|err| {
        HarnessError::SpecInvalid(format!("could not read spec file {}: {err}", path.display()))
    })?;
    parse_test_specs(&contents)
}

/// Re-emit parsed specs as a spec file that parses back to an equal list.
pub fn emit_test_specs(specs: &[TestSpec]) -> String {
    let mut out = String::new();
    for spec in specs {
        let _ = writeln!(out, "testTitle={}", spec.title);
        if spec.timeout_secs > 0 {
            let _ = writeln!(out, "timeout={}", spec.timeout_secs);
        }
        let _ = writeln!(out, "useDB={}", spec.use_db);
        if spec.database_ping_delay > 0.0 {
            let _ = writeln!(out, "databasePingDelay={}", spec.database_ping_delay);
        }
        if spec.phases == Phases::CHECK {
            let _ = writeln!(out, "checkOnly=true");
        } else if !spec.phases.contains(Phases::SETUP) {
            let _ = writeln!(out, "runSetup=false");
        }
        if spec.dump_after_test {
            let _ = writeln!(out, "dumpAfterTest=true");
        }
        if spec.clear_after_test {
            let _ = writeln!(out, "clearAfterTest=true");
        }
        if spec.run_consistency_check {
            let _ = writeln!(out, "runConsistencyCheck=true");
        }
        if spec.wait_for_quiescence_begin {
            let _ = writeln!(out, "waitForQuiescenceBegin=true");
        }
        if spec.wait_for_quiescence_end {
            let _ = writeln!(out, "waitForQuiescenceEnd=true");
        }
        if spec.start_delay != 0.0 {
            let _ = writeln!(out, "startDelay={}", spec.start_delay);
        }
        if spec.sim_check_relocation_duration {
            let _ = writeln!(out, "simCheckRelocationDuration=true");
        }
        if spec.sim_connection_failures_disable_duration != 0.0 {
            let _ = writeln!(
                out,
                "connectionFailuresDisableDuration={}",
                spec.sim_connection_failures_disable_duration
            );
        }
        match (spec.sim_backup_agents, spec.sim_dr_agents) {
            (BackupAgentHint::ToFile, BackupAgentHint::None) => {
                let _ = writeln!(out, "simBackupAgents=BackupToFile");
            }
            (BackupAgentHint::None, BackupAgentHint::ToDatabase) => {
                let _ = writeln!(out, "simBackupAgents=BackupToDB");
            }
            (BackupAgentHint::ToFile, BackupAgentHint::ToDatabase) => {
                let _ = writeln!(out, "simBackupAgents=BackupToFileAndDB");
            }
            _ => {}
        }
        if let Some(severity) = &spec.stderr_severity {
            let _ = writeln!(out, "StderrSeverity={severity}");
        }
        if !spec.client_info_logging {
            let _ = writeln!(out, "ClientInfoLogging=false");
        }
        for option_block in &spec.options {
            for (key, value) in option_block.iter() {
                let _ = writeln!(out, "{key}={value}");
            }
        }
        let _ = writeln!(out);
    }
    out
}

fn parse_value<T: std::str::FromStr>(attrib: &str, value: &str) -> HarnessResult<T> {
    value.parse::<T>().map_err(|_| {
        HarnessError::SpecInvalid(format!("invalid value '{value}' for attribute '{attrib}'"))
    })
}

fn parse_bool(attrib: &str, value: &str) -> HarnessResult<bool> {
    match value {
        "true" => Ok(true),
        "false" => Ok(false),
        other => Err(HarnessError::SpecInvalid(format!(
            "invalid boolean '{other}' for attribute '{attrib}'"
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn parses_single_simple_spec() {
        let specs = parse_test_specs(
            "; comment\n\ntestTitle=T1\ntimeout=60\ntestName=Noop\n",
        )
        .unwrap();
        assert_eq!(specs.len(), 1);
        assert_eq!(specs[0].title, "T1");
        assert_eq!(specs[0].timeout_secs, 60);
        assert_eq!(specs[0].options.len(), 1);
        assert_eq!(specs[0].phases, Phases::ALL);
        assert!(!specs[0].is_compound());
    }

    #[test]
    fn second_test_name_opens_new_block() {
        let specs = parse_test_specs(
            "testTitle=T\ntestName=A\nfoo=1\ntestName=B\nbar=2\n",
        )
        .unwrap();
        assert_eq!(specs.len(), 1);
        assert_eq!(specs[0].options.len(), 2);
        assert!(specs[0].is_compound());
        let first: Vec<_> = specs[0].options[0].iter().collect();
        assert_eq!(first, vec![("testName", "A"), ("foo", "1")]);
        let second: Vec<_> = specs[0].options[1].iter().collect();
        assert_eq!(second, vec![("testName", "B"), ("bar", "2")]);
    }

    #[test]
    fn test_title_flushes_previous_spec() {
        let specs =
            parse_test_specs("testTitle=A\ntestName=X\ntestTitle=B\ntestName=Y\n").unwrap();
        assert_eq!(specs.len(), 2);
        assert_eq!(specs[0].title, "A");
        assert_eq!(specs[1].title, "B");
    }

    #[test]
    fn run_setup_false_removes_setup_phase() {
        let specs = parse_test_specs("testTitle=T\nrunSetup=false\ntestName=X\n").unwrap();
        let phases = specs[0].phases;
        assert!(!phases.contains(Phases::SETUP));
        assert!(phases.contains(Phases::EXECUTION));
        assert!(phases.contains(Phases::CHECK));
        assert!(phases.contains(Phases::METRICS));
    }

    #[test]
    fn check_only_resets_phases() {
        let specs = parse_test_specs("testTitle=T\ncheckOnly=true\ntestName=X\n").unwrap();
        assert_eq!(specs[0].phases, Phases::CHECK);
    }

    #[test]
    fn wait_for_quiescence_sets_both_and_narrow_flags_override() {
        let specs = parse_test_specs(
            "testTitle=T\nwaitForQuiescence=true\nwaitForQuiescenceEnd=false\ntestName=X\n",
        )
        .unwrap();
        assert!(specs[0].wait_for_quiescence_begin);
        assert!(!specs[0].wait_for_quiescence_end);
    }

    #[test]
    fn ping_delay_without_db_is_rejected() {
        let err = parse_test_specs(
            "testTitle=T\nuseDB=false\ndatabasePingDelay=2\ntestName=X\n",
        )
        .unwrap_err();
        assert!(matches!(err, HarnessError::SpecInvalid(_)));
    }

    #[test]
    fn use_db_false_zeroes_ping_delay() {
        let specs = parse_test_specs(
            "testTitle=T\ndatabasePingDelay=2\nuseDB=false\ntestName=X\n",
        )
        .unwrap();
        assert!(!specs[0].use_db);
        assert_eq!(specs[0].database_ping_delay, 0.0);
    }

    #[test]
    fn non_positive_timeout_is_rejected() {
        assert!(parse_test_specs("testTitle=T\ntimeout=0\ntestName=X\n").is_err());
        assert!(parse_test_specs("testTitle=T\ntimeout=-5\ntestName=X\n").is_err());
    }

    #[test]
    fn backup_agent_values_map_to_hints() {
        let specs = parse_test_specs(
            "testTitle=T\nsimBackupAgents=BackupToFileAndDB\ntestName=X\n",
        )
        .unwrap();
        assert_eq!(specs[0].sim_backup_agents, BackupAgentHint::ToFile);
        assert_eq!(specs[0].sim_dr_agents, BackupAgentHint::ToDatabase);
    }

    #[test]
    fn unknown_attribute_becomes_workload_option() {
        let specs = parse_test_specs("testTitle=T\ntestName=X\nnodeCount=100\n").unwrap();
        let entries: Vec<_> = specs[0].options[0].iter().collect();
        assert_eq!(entries, vec![("testName", "X"), ("nodeCount", "100")]);
    }

    #[test]
    fn emit_round_trips_a_representative_file() {
        let input = "testTitle=First\n\
                     timeout=120\n\
                     clearAfterTest=true\n\
                     waitForQuiescence=true\n\
                     testName=A\n\
                     foo=1\n\
                     testName=B\n\
                     testTitle=Second\n\
                     runSetup=false\n\
                     startDelay=2.5\n\
                     testName=C\n";
        let parsed = parse_test_specs(input).unwrap();
        let emitted = emit_test_specs(&parsed);
        let reparsed = parse_test_specs(&emitted).unwrap();
        assert_eq!(parsed, reparsed);
    }

    prop_compose! {
        fn arb_option()(key in "opt[a-zA-Z0-9]{0,8}", value in "[a-zA-Z0-9.]{1,8}") -> (String, String) {
            (key, value)
        }
    }

    proptest! {
        #[test]
        fn parser_round_trip(
            titles in prop::collection::vec("[A-Z][a-zA-Z0-9]{0,8}", 1..4),
            timeouts in prop::collection::vec(1u64..10_000, 1..4),
            opts in prop::collection::vec(prop::collection::vec(arb_option(), 0..4), 1..4),
        ) {
            let mut input = String::new();
            for (i, title) in titles.iter().enumerate() {
                input.push_str(&format!("testTitle={title}\n"));
                input.push_str(&format!("timeout={}\n", timeouts[i % timeouts.len()]));
                input.push_str(&format!("testName=W{i}\n"));
                for (k, v) in &opts[i % opts.len()] {
                    input.push_str(&format!("{k}={v}\n"));
                }
            }
            let parsed = parse_test_specs(&input).unwrap();
            let emitted = emit_test_specs(&parsed);
            let reparsed = parse_test_specs(&emitted).unwrap();
            prop_assert_eq!(parsed, reparsed);
        }
    }
}
