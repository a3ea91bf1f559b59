//! Background drain of the sync queue.
//!
//! The worker pushes due items with bounded concurrency. Items of
//! distinct entities run side by side; the queue never hands out two
//! items of one entity at once, so per-entity order is the commit order.
//!
//! Outcomes:
//! - accepted: the item is removed and the entity marked synced
//! - transient failure: retried with backoff until the retry ceiling,
//!   then dead-lettered
//! - rejection: dead-lettered at once
//!
//! A failure for a version the store already knows is acknowledged (a
//! newer remote state was reconciled meanwhile) drops the item silently.

use crate::config::{RetryConfig, WorkerConfig};
use crate::error::SyncResult;
use crate::notice::{Notifier, SyncNotice};
use crate::queue::{QueueItem, SyncQueue};
use crate::remote::{RemoteBackend, RemoteError};
use docket_core::{now_millis, LocalStore, TenantId};
use docket_sync_protocol::PushAck;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, Notify};
use tokio::task::{JoinError, JoinHandle, JoinSet};
use tracing::{debug, error, info, warn};

/// Counts of one drain.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DrainReport {
    /// Items the remote accepted.
    pub pushed: usize,
    /// Items scheduled for another attempt.
    pub retried: usize,
    /// Items moved to the dead letters.
    pub dead_lettered: usize,
    /// Items dropped because a newer state was already acknowledged.
    pub superseded: usize,
}

type PushOutcome = (QueueItem, Result<PushAck, RemoteError>);

/// Everything a drain needs from the session.
#[derive(Clone)]
pub struct WorkerContext {
    store: Arc<LocalStore>,
    queue: Arc<SyncQueue>,
    remote: Arc<dyn RemoteBackend>,
    retry: RetryConfig,
    config: WorkerConfig,
    notifier: Notifier,
}

impl WorkerContext {
    /// Creates a context over a session's store and queue.
    pub fn new(
        store: Arc<LocalStore>,
        queue: Arc<SyncQueue>,
        remote: Arc<dyn RemoteBackend>,
        retry: RetryConfig,
        config: WorkerConfig,
        notifier: Notifier,
    ) -> Self {
        Self {
            store,
            queue,
            remote,
            retry,
            config,
            notifier,
        }
    }

    fn tenant(&self) -> &TenantId {
        self.store.tenant()
    }

    /// Spawns pushes for due items until the concurrency bound is reached.
    /// Items in `skip` are handed back to the queue untouched.
    fn fill(&self, tasks: &mut JoinSet<PushOutcome>, skip: &HashSet<u64>) -> Vec<u64> {
        let room = self.config.max_concurrency.saturating_sub(tasks.len());
        if room == 0 {
            return Vec::new();
        }
        let mut started = Vec::new();
        for item in self.queue.take_ready(now_millis(), room) {
            if skip.contains(&item.op_id) {
                self.queue.release(item.op_id);
                continue;
            }
            started.push(item.op_id);
            let remote = Arc::clone(&self.remote);
            let op = item.to_op(self.tenant().as_str());
            debug!(tenant = %self.tenant(), op_id = item.op_id, entity = %item.key, attempt = item.attempts + 1, "pushing");
            tasks.spawn(async move {
                let result = remote.push(&op).await;
                (item, result)
            });
        }
        started
    }

    fn finish(&self, joined: Result<PushOutcome, JoinError>, report: &mut DrainReport) {
        let (item, result) = match joined {
            Ok(outcome) => outcome,
            Err(e) => {
                error!(tenant = %self.tenant(), error = %e, "push task failed");
                return;
            }
        };
        if let Err(e) = self.settle(&item, result, report) {
            // The item stays queued and is retried after a restart.
            error!(tenant = %self.tenant(), op_id = item.op_id, error = %e, "could not record push outcome");
            self.queue.release(item.op_id);
        }
    }

    fn settle(&self, item: &QueueItem, result: Result<PushAck, RemoteError>, report: &mut DrainReport) -> SyncResult<()> {
        let tenant = self.tenant();
        match result {
            Ok(ack) => {
                // Clear the dirty state before the queue item, so a failure
                // in between leaves a repeat push rather than a stuck entity.
                self.store.mark_synced(tenant, &item.key, item.version)?;
                self.queue.complete(item.op_id)?;
                report.pushed += 1;
                debug!(tenant = %tenant, op_id = item.op_id, entity = %item.key, version = item.version, remote = ack.version, "push acknowledged");
            }
            Err(e) if self.is_superseded(item) => {
                self.queue.complete(item.op_id)?;
                report.superseded += 1;
                debug!(tenant = %tenant, op_id = item.op_id, entity = %item.key, error = %e, "push superseded by acknowledged state");
            }
            Err(RemoteError::Rejected(reason)) => {
                self.park(item, &reason)?;
                report.dead_lettered += 1;
            }
            Err(e) => {
                let attempts = item.attempts + 1;
                if self.retry.allows_retry(attempts) {
                    let delay = self.retry.delay_for_attempt(attempts);
                    let due = now_millis().saturating_add(u64::try_from(delay.as_millis()).unwrap_or(u64::MAX));
                    self.queue.record_failure(item.op_id, &e.to_string(), due)?;
                    report.retried += 1;
                    warn!(tenant = %tenant, op_id = item.op_id, entity = %item.key, attempt = attempts, ?delay, error = %e, "push failed, will retry");
                } else {
                    self.park(item, &format!("gave up after {attempts} attempts: {e}"))?;
                    report.dead_lettered += 1;
                }
            }
        }
        Ok(())
    }

    fn is_superseded(&self, item: &QueueItem) -> bool {
        self.store
            .version_record(self.tenant(), &item.key)
            .ok()
            .flatten()
            .is_some_and(|versions| versions.synced_version >= item.version)
    }

    fn park(&self, item: &QueueItem, reason: &str) -> SyncResult<()> {
        if self.queue.dead_letter(item.op_id, reason)?.is_some() {
            error!(tenant = %self.tenant(), op_id = item.op_id, entity = %item.key, reason, "push dead-lettered");
            self.notifier.send(SyncNotice::DeadLettered {
                tenant: self.tenant().clone(),
                op_id: item.op_id,
                key: item.key.clone(),
                reason: reason.to_string(),
            });
        }
        Ok(())
    }

    fn idle_delay(&self) -> Duration {
        let poll = self.config.idle_poll;
        match self.queue.next_due() {
            Some(due) => Duration::from_millis(due.saturating_sub(now_millis())).min(poll),
            None => poll,
        }
    }
}

/// Pushes every item that is due now, waiting for all of them to settle.
///
/// Each item is attempted at most once per call; items that fail
/// transiently are rescheduled for a later drain.
pub async fn drain_once(ctx: &WorkerContext) -> DrainReport {
    let mut tasks = JoinSet::new();
    let mut report = DrainReport::default();
    let mut attempted = HashSet::new();
    loop {
        let started = ctx.fill(&mut tasks, &attempted);
        attempted.extend(started);
        match tasks.join_next().await {
            Some(joined) => ctx.finish(joined, &mut report),
            None => break,
        }
    }
    report
}

/// A running queue worker.
pub struct SyncWorker {
    handle: JoinHandle<()>,
    shutdown: watch::Sender<bool>,
    wake: Arc<Notify>,
}

impl SyncWorker {
    /// Starts draining in the background. Notifying `wake` makes the
    /// worker look at the queue before its idle poll is up.
    pub fn spawn(ctx: WorkerContext, wake: Arc<Notify>) -> Self {
        let (shutdown, rx) = watch::channel(false);
        let handle = tokio::spawn(run(ctx, rx, Arc::clone(&wake)));
        Self { handle, shutdown, wake }
    }

    /// Wakes the worker.
    pub fn wake(&self) {
        self.wake.notify_one();
    }

    /// Stops the worker. Pushes in flight get the configured grace period;
    /// anything unfinished stays queued.
    pub async fn stop(self) {
        let _ = self.shutdown.send(true);
        if let Err(e) = self.handle.await {
            error!(error = %e, "sync worker ended abnormally");
        }
    }
}

async fn run(ctx: WorkerContext, mut shutdown: watch::Receiver<bool>, wake: Arc<Notify>) {
    info!(tenant = %ctx.tenant(), concurrency = ctx.config.max_concurrency, "sync worker started");
    let mut tasks = JoinSet::new();
    let mut report = DrainReport::default();

    loop {
        if *shutdown.borrow() {
            break;
        }
        ctx.fill(&mut tasks, &HashSet::new());
        let idle = if tasks.len() >= ctx.config.max_concurrency {
            ctx.config.idle_poll
        } else {
            ctx.idle_delay()
        };
        tokio::select! {
            _ = shutdown.changed() => break,
            Some(joined) = tasks.join_next(), if !tasks.is_empty() => ctx.finish(joined, &mut report),
            () = wake.notified() => {}
            () = tokio::time::sleep(idle) => {}
        }
    }

    let grace = ctx.config.shutdown_grace;
    let settled = tokio::time::timeout(grace, async {
        while let Some(joined) = tasks.join_next().await {
            ctx.finish(joined, &mut report);
        }
    })
    .await;
    if settled.is_err() {
        warn!(tenant = %ctx.tenant(), in_flight = tasks.len(), "pushes still running after grace period, abandoning");
        tasks.abort_all();
    }
    ctx.queue.release_all();
    info!(
        tenant = %ctx.tenant(),
        pushed = report.pushed,
        retried = report.retried,
        dead_lettered = report.dead_lettered,
        "sync worker stopped"
    );
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::remote::MockRemote;
    use docket_core::{ChangeFeed, DeviceId, EntityKey, InitGate, Keyspace, StoreConfig, Table};
    use docket_storage::{KvBackend, MemoryBackend};
    use docket_sync_protocol::OpType;
    use serde_json::json;

    struct Fixture {
        store: Arc<LocalStore>,
        queue: Arc<SyncQueue>,
        remote: Arc<MockRemote>,
        gate: Arc<InitGate>,
        ctx: WorkerContext,
        notices: tokio::sync::broadcast::Receiver<SyncNotice>,
    }

    fn fixture(retry: RetryConfig) -> Fixture {
        let backend: Arc<dyn KvBackend> = Arc::new(MemoryBackend::new());
        let keys = Keyspace::new(&DeviceId::new("laptop")).tenant(&acme());
        let gate = Arc::new(InitGate::new());
        gate.begin_opening().unwrap();
        let (store, _) = LocalStore::load(
            Arc::clone(&backend),
            keys.clone(),
            Arc::clone(&gate),
            Arc::new(ChangeFeed::new()),
            StoreConfig::default(),
        )
        .unwrap();
        gate.mark_ready().unwrap();
        let store = Arc::new(store);
        let queue = Arc::new(SyncQueue::open(backend, keys).unwrap());
        let remote = Arc::new(MockRemote::new());
        let notifier = Notifier::default();
        let notices = notifier.subscribe();
        let ctx = WorkerContext::new(
            Arc::clone(&store),
            Arc::clone(&queue),
            Arc::clone(&remote) as Arc<dyn RemoteBackend>,
            retry,
            WorkerConfig::default().idle_poll(Duration::from_millis(10)),
            notifier,
        );
        Fixture {
            store,
            queue,
            remote,
            gate,
            ctx,
            notices,
        }
    }

    fn fast_retry(max_attempts: u32) -> RetryConfig {
        RetryConfig::new(max_attempts)
            .with_initial_delay(Duration::ZERO)
            .with_jitter(false)
    }

    fn acme() -> TenantId {
        TenantId::new("acme")
    }

    fn write(f: &Fixture, id: &str, title: &str) -> u64 {
        let version = f.store.write(&acme(), Table::Tasks, id, json!({ "title": title })).unwrap();
        let op = if version == 1 { OpType::Create } else { OpType::Update };
        f.queue
            .enqueue(EntityKey::new(Table::Tasks, id), op, Some(json!({ "title": title })), version, 0)
            .unwrap();
        version
    }

    #[tokio::test]
    async fn accepted_push_marks_synced() {
        let f = fixture(fast_retry(3));
        write(&f, "task-1", "Draft complaint");

        let report = drain_once(&f.ctx).await;

        assert_eq!(report.pushed, 1);
        assert!(f.queue.is_empty());
        assert!(!f.store.is_dirty(&acme(), &EntityKey::new(Table::Tasks, "task-1")).unwrap());
    }

    #[tokio::test]
    async fn acknowledged_push_stays_queued_until_synced_is_recorded() {
        let f = fixture(fast_retry(3));
        write(&f, "task-1", "Draft complaint");

        // The store closes while the push is out, so the synced mark fails
        f.gate.reset();
        let report = drain_once(&f.ctx).await;
        assert_eq!(report.pushed, 0);
        assert_eq!(f.remote.accepted().len(), 1);
        assert_eq!(f.queue.len(), 1);

        f.gate.begin_opening().unwrap();
        f.gate.mark_ready().unwrap();
        let key = EntityKey::new(Table::Tasks, "task-1");
        assert!(f.store.is_dirty(&acme(), &key).unwrap());

        // The repeat push is acknowledged and both sides settle
        let report = drain_once(&f.ctx).await;
        assert_eq!(report.pushed, 1);
        assert!(f.queue.is_empty());
        assert!(!f.store.is_dirty(&acme(), &key).unwrap());
        assert_eq!(f.remote.accepted()[0].op_type, OpType::Create);
    }

    #[tokio::test]
    async fn transient_failures_back_off_then_dead_letter() {
        let mut f = fixture(fast_retry(2));
        write(&f, "task-1", "Draft complaint");
        f.remote.set_offline(true);

        let first = drain_once(&f.ctx).await;
        assert_eq!(first.retried, 1);
        assert_eq!(f.queue.items()[0].attempts, 1);

        let second = drain_once(&f.ctx).await;
        assert_eq!(second.dead_lettered, 1);
        assert!(f.queue.is_empty());
        assert_eq!(f.queue.dead_letters().len(), 1);
        assert!(f.store.is_dirty(&acme(), &EntityKey::new(Table::Tasks, "task-1")).unwrap());
        assert!(matches!(f.notices.try_recv().unwrap(), SyncNotice::DeadLettered { .. }));
    }

    #[tokio::test]
    async fn rejection_dead_letters_at_once() {
        let f = fixture(fast_retry(8));
        write(&f, "task-1", "");
        f.remote.script_push(Err(RemoteError::Rejected("title is required".into())));

        let report = drain_once(&f.ctx).await;

        assert_eq!(report.dead_lettered, 1);
        assert_eq!(f.queue.dead_letters()[0].reason, "title is required");
        assert_eq!(f.remote.attempts().len(), 1);
    }

    #[tokio::test]
    async fn failure_after_newer_ack_is_dropped() {
        let f = fixture(fast_retry(8));
        write(&f, "task-1", "Draft");
        let key = EntityKey::new(Table::Tasks, "task-1");
        f.store.mark_synced(&acme(), &key, 1).unwrap();
        f.remote.script_push(Err(RemoteError::Rejected("stale".into())));

        let report = drain_once(&f.ctx).await;

        assert_eq!(report.superseded, 1);
        assert!(f.queue.dead_letters().is_empty());
    }

    #[tokio::test]
    async fn distinct_entities_push_concurrently() {
        let f = fixture(fast_retry(3));
        f.remote.set_push_delay(Duration::from_millis(50));
        for n in 0..8 {
            write(&f, &format!("task-{n}"), "x");
        }

        let report = drain_once(&f.ctx).await;

        assert_eq!(report.pushed, 8);
        assert!(f.remote.max_concurrent_pushes() > 1);
        assert!(f.remote.max_concurrent_pushes() <= 4);
    }

    #[tokio::test]
    async fn one_entity_pushes_in_commit_order() {
        let f = fixture(fast_retry(3));
        write(&f, "task-1", "first");
        let in_flight = f.queue.take_ready(u64::MAX, 1);
        write(&f, "task-1", "second");
        f.queue.release(in_flight[0].op_id);

        drain_once(&f.ctx).await;

        let versions: Vec<u64> = f.remote.accepted().iter().map(|op| op.version).collect();
        assert_eq!(versions, vec![1, 2]);
    }

    #[tokio::test]
    async fn background_worker_drains_and_stops() {
        let f = fixture(fast_retry(3));
        let worker = SyncWorker::spawn(f.ctx.clone(), Arc::new(Notify::new()));
        write(&f, "task-1", "Draft");
        worker.wake();

        for _ in 0..100 {
            if f.queue.is_empty() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(f.queue.is_empty());
        worker.stop().await;

        write(&f, "task-2", "After stop");
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(f.queue.len(), 1, "a stopped worker keeps items queued");
    }
}
