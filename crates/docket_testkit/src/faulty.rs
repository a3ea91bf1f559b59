//! A backend wrapper that fails on demand.

use docket_storage::{BatchOp, KvBackend, StorageError, StorageResult, WriteBatch};
use std::io;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

/// Wraps a backend and injects failures.
///
/// Failed commits leave the inner backend untouched, as a backend that
/// honours atomic batches must.
pub struct FaultyBackend {
    inner: Arc<dyn KvBackend>,
    commits_left: AtomicUsize,
    fail_reads: AtomicBool,
    fail_prefix_deletes: AtomicBool,
    commits: AtomicUsize,
    failures: AtomicUsize,
}

impl FaultyBackend {
    /// Wraps `inner` with no failures armed.
    pub fn new(inner: Arc<dyn KvBackend>) -> Self {
        Self {
            inner,
            commits_left: AtomicUsize::new(usize::MAX),
            fail_reads: AtomicBool::new(false),
            fail_prefix_deletes: AtomicBool::new(false),
            commits: AtomicUsize::new(0),
            failures: AtomicUsize::new(0),
        }
    }

    /// Lets `count` more commits through, then fails every commit.
    pub fn fail_commits_after(&self, count: usize) {
        self.commits_left.store(count, Ordering::SeqCst);
    }

    /// Fails every `get` and `scan_prefix`.
    pub fn set_fail_reads(&self, fail: bool) {
        self.fail_reads.store(fail, Ordering::SeqCst);
    }

    /// Fails commits containing a prefix delete, as a wipe issues.
    pub fn set_fail_prefix_deletes(&self, fail: bool) {
        self.fail_prefix_deletes.store(fail, Ordering::SeqCst);
    }

    /// Disarms every failure.
    pub fn heal(&self) {
        self.commits_left.store(usize::MAX, Ordering::SeqCst);
        self.fail_reads.store(false, Ordering::SeqCst);
        self.fail_prefix_deletes.store(false, Ordering::SeqCst);
    }

    /// Returns the number of successful commits.
    pub fn commit_count(&self) -> usize {
        self.commits.load(Ordering::SeqCst)
    }

    /// Returns the number of injected failures so far.
    pub fn failure_count(&self) -> usize {
        self.failures.load(Ordering::SeqCst)
    }

    /// Returns the wrapped backend.
    pub fn inner(&self) -> &Arc<dyn KvBackend> {
        &self.inner
    }

    fn injected(&self, what: &str) -> StorageError {
        self.failures.fetch_add(1, Ordering::SeqCst);
        StorageError::Io(io::Error::other(format!("injected {what} failure")))
    }

    fn check_reads(&self) -> StorageResult<()> {
        if self.fail_reads.load(Ordering::SeqCst) {
            Err(self.injected("read"))
        } else {
            Ok(())
        }
    }
}

impl KvBackend for FaultyBackend {
    fn get(&self, key: &str) -> StorageResult<Option<Vec<u8>>> {
        self.check_reads()?;
        self.inner.get(key)
    }

    fn scan_prefix(&self, prefix: &str) -> StorageResult<Vec<(String, Vec<u8>)>> {
        self.check_reads()?;
        self.inner.scan_prefix(prefix)
    }

    fn commit(&self, batch: WriteBatch) -> StorageResult<()> {
        if self.fail_prefix_deletes.load(Ordering::SeqCst)
            && batch.ops().iter().any(|op| matches!(op, BatchOp::DeletePrefix { .. }))
        {
            return Err(self.injected("prefix delete"));
        }
        if self
            .commits_left
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_err()
        {
            return Err(self.injected("commit"));
        }
        self.inner.commit(batch)?;
        self.commits.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn flush(&self) -> StorageResult<()> {
        self.inner.flush()
    }

    fn key_count(&self) -> StorageResult<usize> {
        self.inner.key_count()
    }
}
