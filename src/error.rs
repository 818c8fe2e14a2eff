//! Error taxonomy shared by the controller, runner, and workloads.
//!
//! Every failure that crosses a request/reply channel is one of these
//! kinds, so both sides of the channel can apply the same policy: spec
//! problems fail the affected test, reboot requests bypass the runner's
//! catch entirely, and cancellation is propagated without being recorded
//! as a test failure.

use thiserror::Error;

use crate::db::DbError;

/// Result alias used throughout the harness core.
pub type HarnessResult<T> = Result<T, HarnessError>;

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum HarnessError {
    /// Malformed spec file, unknown workload name, or unconsumed options.
    #[error("test specification invalid: {0}")]
    SpecInvalid(String),

    /// Generic "this phase or probe did not succeed".
    #[error("operation failed")]
    OperationFailed,

    /// A per-phase or per-test deadline elapsed.
    #[error("operation timed out")]
    TimedOut,

    /// The host process manager should restart this tester.
    #[error("process requested reboot")]
    PleaseReboot,

    /// Like [`HarnessError::PleaseReboot`], but data files must be wiped.
    #[error("process requested reboot and data deletion")]
    PleaseRebootDelete,

    /// Structured cancellation; never reported as a test failure.
    #[error("task cancelled")]
    Cancelled,

    /// Database client error that was not retried away by `on_error`.
    #[error(transparent)]
    Db(#[from] DbError),
}

impl HarnessError {
    /// Reboot-class errors are not caught by phase handlers; they reach
    /// the host process boundary unchanged.
    pub fn is_reboot(&self) -> bool {
        matches!(
            self,
            HarnessError::PleaseReboot | HarnessError::PleaseRebootDelete
        )
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, HarnessError::Cancelled)
    }

    /// Whether a runner phase handler may catch and memoize this error.
    /// Reboot requests and cancellation must propagate instead.
    pub fn is_catchable(&self) -> bool {
        !self.is_reboot() && !self.is_cancelled()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reboot_kinds_are_not_catchable() {
        assert!(!HarnessError::PleaseReboot.is_catchable());
        assert!(!HarnessError::PleaseRebootDelete.is_catchable());
        assert!(!HarnessError::Cancelled.is_catchable());
        assert!(HarnessError::OperationFailed.is_catchable());
        assert!(HarnessError::TimedOut.is_catchable());
        assert!(HarnessError::SpecInvalid("x".into()).is_catchable());
    }
}
