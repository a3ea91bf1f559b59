//! Realtime bridge: remote change feed into reconciliation.
//!
//! One task per subscribed table. Each task subscribes, then runs a
//! reconciliation pass over the remote's snapshot of the table (a fresh
//! subscription does not replay what was missed while disconnected),
//! then feeds live events to the [`Reconciler`]. When the subscription
//! ends it resubscribes with backoff. Subscribing before taking the
//! snapshot means no change can fall between the two.

use crate::config::BridgeConfig;
use crate::error::SyncError;
use crate::notice::{Notifier, SyncNotice};
use crate::reconcile::Reconciler;
use crate::remote::RemoteBackend;
use docket_core::{CoreError, Table, TenantId};
use docket_sync_protocol::RemoteEvent;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// Running subscriptions of one tenant session.
pub struct RealtimeBridge {
    tenant: TenantId,
    tasks: Vec<JoinHandle<()>>,
    shutdown: watch::Sender<bool>,
}

struct Subscription {
    tenant: TenantId,
    table: Table,
    remote: Arc<dyn RemoteBackend>,
    reconciler: Arc<Reconciler>,
    config: BridgeConfig,
    notifier: Notifier,
}

impl RealtimeBridge {
    /// Starts one subscription per configured table.
    pub fn start(
        tenant: TenantId,
        remote: Arc<dyn RemoteBackend>,
        reconciler: Arc<Reconciler>,
        config: BridgeConfig,
        notifier: Notifier,
    ) -> Self {
        let (shutdown, rx) = watch::channel(false);
        let tasks = config
            .tables
            .iter()
            .map(|table| {
                let subscription = Subscription {
                    tenant: tenant.clone(),
                    table: *table,
                    remote: Arc::clone(&remote),
                    reconciler: Arc::clone(&reconciler),
                    config: config.clone(),
                    notifier: notifier.clone(),
                };
                tokio::spawn(subscription.run(rx.clone()))
            })
            .collect::<Vec<_>>();
        info!(tenant = %tenant, tables = tasks.len(), "realtime bridge started");
        Self {
            tenant,
            tasks,
            shutdown,
        }
    }

    /// Returns the number of subscription tasks.
    pub fn subscription_count(&self) -> usize {
        self.tasks.len()
    }

    /// Ends every subscription and waits for the tasks to finish.
    pub async fn stop(self) {
        let _ = self.shutdown.send(true);
        for task in self.tasks {
            if let Err(e) = task.await {
                error!(tenant = %self.tenant, error = %e, "bridge task ended abnormally");
            }
        }
        info!(tenant = %self.tenant, "realtime bridge stopped");
    }
}

impl Subscription {
    async fn run(self, mut shutdown: watch::Receiver<bool>) {
        let mut failures = 0u32;
        let mut was_connected = false;

        loop {
            if *shutdown.borrow() {
                return;
            }

            let subscribed = tokio::select! {
                _ = shutdown.changed() => return,
                result = self.remote.subscribe(
                    self.tenant.as_str(),
                    self.table.as_str(),
                    self.config.channel_capacity,
                ) => result,
            };
            let mut events = match subscribed {
                Ok(events) => events,
                Err(e) => {
                    failures = failures.saturating_add(1);
                    warn!(tenant = %self.tenant, table = %self.table, attempt = failures, error = %e, "subscribe failed");
                    if !self.backoff(failures, &mut shutdown).await {
                        return;
                    }
                    continue;
                }
            };

            let snapshot = tokio::select! {
                _ = shutdown.changed() => return,
                result = self.remote.snapshot(self.tenant.as_str(), self.table.as_str()) => result,
            };
            match snapshot {
                Ok(rows) => {
                    if let Err(e) = self.reconciler.reconcile_rows(self.table, rows) {
                        warn!(tenant = %self.tenant, table = %self.table, error = %e, "reconciliation pass failed");
                    }
                }
                Err(e) => {
                    failures = failures.saturating_add(1);
                    warn!(tenant = %self.tenant, table = %self.table, attempt = failures, error = %e, "snapshot failed");
                    if !self.backoff(failures, &mut shutdown).await {
                        return;
                    }
                    continue;
                }
            }

            if was_connected {
                info!(tenant = %self.tenant, table = %self.table, "subscription restored");
                self.notifier.send(SyncNotice::BridgeReconnected {
                    tenant: self.tenant.clone(),
                    table: self.table,
                });
            } else {
                debug!(tenant = %self.tenant, table = %self.table, "subscribed");
            }
            was_connected = true;
            failures = 0;

            loop {
                tokio::select! {
                    _ = shutdown.changed() => return,
                    change = events.recv() => match change {
                        Some(change) => self.handle(RemoteEvent::from_change(change)),
                        None => break,
                    },
                }
            }

            warn!(tenant = %self.tenant, table = %self.table, "subscription lost");
            if !self.backoff(1, &mut shutdown).await {
                return;
            }
        }
    }

    fn handle(&self, event: RemoteEvent) {
        if event.tenant_id != self.tenant.as_str() || event.table != self.table.as_str() {
            error!(
                tenant = %self.tenant,
                table = %self.table,
                event_tenant = %event.tenant_id,
                event_table = %event.table,
                "remote delivered an event outside the subscription"
            );
            return;
        }
        match self.reconciler.reconcile(&event) {
            Ok(decision) => {
                debug!(tenant = %self.tenant, entity = %event.entity_id, version = event.remote_version, ?decision, "remote event reconciled");
            }
            Err(SyncError::Core(CoreError::NotReady)) => {
                debug!(tenant = %self.tenant, entity = %event.entity_id, "store closing, event dropped");
            }
            Err(e) => {
                warn!(tenant = %self.tenant, entity = %event.entity_id, error = %e, "remote event not reconciled");
            }
        }
    }

    /// Sleeps before the next attempt. Returns false if shut down meanwhile
    /// or the retry budget is spent.
    async fn backoff(&self, attempt: u32, shutdown: &mut watch::Receiver<bool>) -> bool {
        if !self.config.reconnect.allows_retry(attempt) {
            error!(tenant = %self.tenant, table = %self.table, attempts = attempt, "giving up on subscription");
            return false;
        }
        let delay = self
            .config
            .reconnect
            .delay_for_attempt(attempt)
            .max(Duration::from_millis(1));
        tokio::select! {
            _ = shutdown.changed() => false,
            () = tokio::time::sleep(delay) => true,
        }
    }
}
