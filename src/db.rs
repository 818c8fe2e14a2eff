//! Database client interface.
//!
//! The harness core never implements database semantics; it drives a
//! client that exposes `begin -> get/get_range/set/clear -> commit` with
//! an `on_error` retry helper. The [`memory`] backend implements the
//! interface over a process-local map for local runs and the test suite.

pub mod memory;

use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;

/// Shared handle to a database client.
pub type Db = Arc<dyn KvDatabase>;

/// First key of the user keyspace.
pub const USER_KEYS_BEGIN: &[u8] = b"";
/// First key past the user keyspace; system keys live above it.
pub const USER_KEYS_END: &[u8] = b"\xff";

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum DbError {
    /// The transaction conflicted with another; retry via `on_error`.
    #[error("transaction conflict")]
    Conflict,

    /// The database could not be reached; usually transient.
    #[error("database unavailable: {0}")]
    Unavailable(String),

    /// The commit may or may not have applied.
    #[error("commit result unknown")]
    CommitUnknown,

    /// Non-retryable client failure.
    #[error("database operation failed: {0}")]
    Failed(String),
}

impl DbError {
    /// Whether `on_error` will reset the transaction for another attempt.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            DbError::Conflict | DbError::Unavailable(_) | DbError::CommitUnknown
        )
    }
}

/// One transaction attempt. Reads and writes buffer until `commit`.
#[async_trait]
pub trait KvTransaction: Send {
    async fn get(&mut self, key: &[u8]) -> Result<Option<Vec<u8>>, DbError>;

    /// Keys in `[begin, end)`, at most `limit` pairs, in key order.
    async fn get_range(
        &mut self,
        begin: &[u8],
        end: &[u8],
        limit: usize,
    ) -> Result<Vec<(Vec<u8>, Vec<u8>)>, DbError>;

    fn set(&mut self, key: &[u8], value: &[u8]);

    fn clear(&mut self, key: &[u8]);

    fn clear_range(&mut self, begin: &[u8], end: &[u8]);

    async fn commit(&mut self) -> Result<(), DbError>;

    /// Version assigned by the last successful `commit`, if any.
    fn committed_version(&self) -> Option<u64>;

    /// Reset the transaction for a retry if `err` is retryable, applying
    /// the client's backoff; otherwise return the error to the caller.
    async fn on_error(&mut self, err: DbError) -> Result<(), DbError>;

    fn set_priority_system_immediate(&mut self);

    fn set_lock_aware(&mut self);

    /// Make the transaction conflict with itself so the commit proves the
    /// database is accepting writes without disturbing other traffic.
    fn make_self_conflicting(&mut self);
}

/// A connected database client; cheap to clone through [`Db`].
#[async_trait]
pub trait KvDatabase: Send + Sync {
    async fn begin(&self) -> Result<Box<dyn KvTransaction>, DbError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retryable_classification() {
        assert!(DbError::Conflict.is_retryable());
        assert!(DbError::Unavailable("net".into()).is_retryable());
        assert!(DbError::CommitUnknown.is_retryable());
        assert!(!DbError::Failed("bad".into()).is_retryable());
    }
}
