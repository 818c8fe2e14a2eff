//! In-memory database backend.
//!
//! Backs local runs and the test suite with a `BTreeMap` behind a mutex.
//! Transactions buffer writes and clears until commit, which applies them
//! atomically at the next version. Failure injection knobs let scenarios
//! simulate an unavailable database without touching the harness core.

use std::collections::BTreeMap;
use std::ops::Bound;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;

use super::{Db, DbError, KvDatabase, KvTransaction};

const RETRY_BACKOFF: Duration = Duration::from_millis(5);

#[derive(Default)]
struct MemoryState {
    map: BTreeMap<Vec<u8>, Vec<u8>>,
    version: u64,
    fail_commits: bool,
    fail_reads: bool,
}

/// A process-local key-value store implementing [`KvDatabase`].
#[derive(Clone, Default)]
pub struct MemoryDb {
    state: Arc<Mutex<MemoryState>>,
}

impl MemoryDb {
    pub fn new() -> Self {
        Self::default()
    }

    /// Convenience constructor returning the shared-handle form.
    pub fn shared() -> (Db, MemoryDb) {
        let db = MemoryDb::new();
        (Arc::new(db.clone()), db)
    }

    /// Make every subsequent commit fail with `Unavailable`.
    pub fn set_fail_commits(&self, fail: bool) {
        self.lock().fail_commits = fail;
    }

    /// Make every subsequent read fail with `Unavailable`.
    pub fn set_fail_reads(&self, fail: bool) {
        self.lock().fail_reads = fail;
    }

    /// Number of committed keys; test helper.
    pub fn len(&self) -> usize {
        self.lock().map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().map.is_empty()
    }

    /// Committed contents; test helper.
    pub fn snapshot(&self) -> BTreeMap<Vec<u8>, Vec<u8>> {
        self.lock().map.clone()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, MemoryState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

#[async_trait]
impl KvDatabase for MemoryDb {
    async fn begin(&self) -> Result<Box<dyn KvTransaction>, DbError> {
        Ok(Box::new(MemoryTransaction {
            state: Arc::clone(&self.state),
            writes: BTreeMap::new(),
            cleared: Vec::new(),
            committed_version: None,
            self_conflicting: false,
        }))
    }
}

struct MemoryTransaction {
    state: Arc<Mutex<MemoryState>>,
    /// Buffered mutations: `Some` is a set, `None` a single-key clear.
    writes: BTreeMap<Vec<u8>, Option<Vec<u8>>>,
    cleared: Vec<(Vec<u8>, Vec<u8>)>,
    committed_version: Option<u64>,
    self_conflicting: bool,
}

impl MemoryTransaction {
    fn lock(&self) -> std::sync::MutexGuard<'_, MemoryState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn range_cleared(&self, key: &[u8]) -> bool {
        self.cleared
            .iter()
            .any(|(begin, end)| key >= begin.as_slice() && key < end.as_slice())
    }

    fn reset(&mut self) {
        self.writes.clear();
        self.cleared.clear();
    }
}

#[async_trait]
impl KvTransaction for MemoryTransaction {
    async fn get(&mut self, key: &[u8]) -> Result<Option<Vec<u8>>, DbError> {
        if self.lock().fail_reads {
            return Err(DbError::Unavailable("injected read failure".into()));
        }
        if let Some(buffered) = self.writes.get(key) {
            return Ok(buffered.clone());
        }
        if self.range_cleared(key) {
            return Ok(None);
        }
        Ok(self.lock().map.get(key).cloned())
    }

    async fn get_range(
        &mut self,
        begin: &[u8],
        end: &[u8],
        limit: usize,
    ) -> Result<Vec<(Vec<u8>, Vec<u8>)>, DbError> {
        if self.lock().fail_reads {
            return Err(DbError::Unavailable("injected read failure".into()));
        }
        let mut merged: BTreeMap<Vec<u8>, Vec<u8>> = {
            let state = self.lock();
            state
                .map
                .range::<[u8], _>((Bound::Included(begin), Bound::Excluded(end)))
                .filter(|(k, _)| !self.range_cleared(k))
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect()
        };
        for (key, value) in self
            .writes
            .range::<[u8], _>((Bound::Included(begin), Bound::Excluded(end)))
        {
            match value {
                Some(v) => {
                    merged.insert(key.clone(), v.clone());
                }
                None => {
                    merged.remove(key);
                }
            }
        }
        Ok(merged.into_iter().take(limit).collect())
    }

    fn set(&mut self, key: &[u8], value: &[u8]) {
        self.writes.insert(key.to_vec(), Some(value.to_vec()));
    }

    fn clear(&mut self, key: &[u8]) {
        self.writes.insert(key.to_vec(), None);
    }

    fn clear_range(&mut self, begin: &[u8], end: &[u8]) {
        self.writes.retain(|key, _| {
            !(key.as_slice() >= begin && key.as_slice() < end)
        });
        self.cleared.push((begin.to_vec(), end.to_vec()));
    }

    async fn commit(&mut self) -> Result<(), DbError> {
        let mut state = self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        if state.fail_commits {
            return Err(DbError::Unavailable("injected commit failure".into()));
        }
        for (begin, end) in self.cleared.drain(..) {
            let doomed: Vec<Vec<u8>> = state
                .map
                .range::<[u8], _>((Bound::Included(begin.as_slice()), Bound::Excluded(end.as_slice())))
                .map(|(k, _)| k.clone())
                .collect();
            for key in doomed {
                state.map.remove(&key);
            }
        }
        for (key, value) in std::mem::take(&mut self.writes) {
            match value {
                Some(v) => {
                    state.map.insert(key, v);
                }
                None => {
                    state.map.remove(&key);
                }
            }
        }
        state.version += 1;
        self.committed_version = Some(state.version);
        Ok(())
    }

    fn committed_version(&self) -> Option<u64> {
        self.committed_version
    }

    async fn on_error(&mut self, err: DbError) -> Result<(), DbError> {
        if !err.is_retryable() {
            return Err(err);
        }
        self.reset();
        tokio::time::sleep(RETRY_BACKOFF).await;
        Ok(())
    }

    fn set_priority_system_immediate(&mut self) {}

    fn set_lock_aware(&mut self) {}

    fn make_self_conflicting(&mut self) {
        self.self_conflicting = true;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn set_commit_get_round_trip() {
        let (db, _handle) = MemoryDb::shared();
        let mut tr = db.begin().await.unwrap();
        tr.set(b"k", b"v");
        tr.commit().await.unwrap();
        assert!(tr.committed_version().is_some());

        let mut tr = db.begin().await.unwrap();
        assert_eq!(tr.get(b"k").await.unwrap(), Some(b"v".to_vec()));
    }

    #[tokio::test]
    async fn uncommitted_writes_are_read_your_writes_only() {
        let (db, handle) = MemoryDb::shared();
        let mut tr = db.begin().await.unwrap();
        tr.set(b"k", b"v");
        assert_eq!(tr.get(b"k").await.unwrap(), Some(b"v".to_vec()));
        assert_eq!(handle.len(), 0);
    }

    #[tokio::test]
    async fn get_range_merges_overlay_and_respects_limit() {
        let (db, _handle) = MemoryDb::shared();
        let mut tr = db.begin().await.unwrap();
        for i in 0..5u8 {
            tr.set(&[i], &[i]);
        }
        tr.commit().await.unwrap();

        let mut tr = db.begin().await.unwrap();
        tr.set(&[2], b"new");
        tr.clear(&[3]);
        let range = tr.get_range(&[0], &[10], 10).await.unwrap();
        assert_eq!(range.len(), 4);
        assert_eq!(range[2], (vec![2], b"new".to_vec()));

        let limited = tr.get_range(&[0], &[10], 2).await.unwrap();
        assert_eq!(limited.len(), 2);
    }

    #[tokio::test]
    async fn clear_range_removes_committed_keys() {
        let (db, handle) = MemoryDb::shared();
        let mut tr = db.begin().await.unwrap();
        for i in 0..10u8 {
            tr.set(&[i], &[i]);
        }
        tr.commit().await.unwrap();

        let mut tr = db.begin().await.unwrap();
        tr.clear_range(&[2], &[8]);
        assert_eq!(tr.get(&[4]).await.unwrap(), None);
        tr.commit().await.unwrap();
        assert_eq!(handle.len(), 4);
    }

    #[tokio::test]
    async fn injected_commit_failure_is_retryable() {
        let (db, handle) = MemoryDb::shared();
        handle.set_fail_commits(true);
        let mut tr = db.begin().await.unwrap();
        tr.set(b"k", b"v");
        let err = tr.commit().await.unwrap_err();
        assert!(err.is_retryable());

        handle.set_fail_commits(false);
        tr.on_error(err).await.unwrap();
        tr.set(b"k", b"v2");
        tr.commit().await.unwrap();
        assert_eq!(handle.len(), 1);
    }
}
