//! Sync Coordinator.
//!
//! Drives the [`SyncMachine`] against a real remote store: probes it, flushes
//! the mutation queue in per-entity groups and applies the remote change
//! feed to the local store. One coordinator runs per data service, and only
//! in cloud mode.
//!
//! A cycle runs when the flush interval elapses, when a write nudges an
//! online coordinator, or on [`SyncCoordinator::force_sync_now`]. While
//! offline the next cycle waits out the backoff delay instead.

use crate::bus::EventBus;
use crate::config::SyncConfig;
use crate::diagnostics::DiagnosticsLog;
use crate::error::{RemoteError, Result};
use crate::local::{LocalStore, Table};
use crate::queue::DurableQueue;
use crate::remote::{bounded, ChangeSubscription, RemoteRow, RemoteStore, RemoteWrite};
use crate::writer::{read_version, record_version};
use futures::stream::{self, StreamExt};
use rollcall_engine::{
    Backoff, Clock, CycleEnd, DomainEvent, FailOutcome, FlushGroup, MutationOp, MutationRecord,
    Origin, Query, Schema, SyncMachine, SyncState, SyncStatus,
};
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use tokio::sync::{mpsc, watch, Notify};
use tokio::task::JoinHandle;

/// Everything a coordinator needs from the data service.
#[derive(Clone)]
pub(crate) struct SyncContext {
    pub local: Arc<dyn LocalStore>,
    pub remote: Arc<dyn RemoteStore>,
    pub queue: Arc<DurableQueue>,
    pub bus: Arc<EventBus>,
    pub schema: Arc<Schema>,
    pub clock: Arc<dyn Clock>,
    pub config: SyncConfig,
    pub status: Arc<watch::Sender<SyncState>>,
    pub diagnostics: Arc<DiagnosticsLog>,
}

struct Shared {
    ctx: SyncContext,
    machine: Mutex<SyncMachine>,
    trigger: Notify,
    shutdown: Notify,
    stopped: AtomicBool,
    /// Serializes cycles between the run loop and `force_sync_now`.
    cycle_lock: tokio::sync::Mutex<()>,
    feed: Mutex<Option<ChangeSubscription>>,
    ingest_tx: mpsc::UnboundedSender<RemoteRow>,
}

pub struct SyncCoordinator {
    shared: Arc<Shared>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl fmt::Debug for SyncCoordinator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SyncCoordinator")
            .field("status", &self.status())
            .field("stopped", &self.is_stopped())
            .finish()
    }
}

impl SyncCoordinator {
    /// Start the run loop and the change-feed ingestion task.
    pub(crate) fn start(ctx: SyncContext) -> Self {
        let backoff = Backoff::new(ctx.config.backoff_base, ctx.config.backoff_max);
        let (ingest_tx, ingest_rx) = mpsc::unbounded_channel();

        let shared = Arc::new(Shared {
            machine: Mutex::new(SyncMachine::new(backoff)),
            ctx,
            trigger: Notify::new(),
            shutdown: Notify::new(),
            stopped: AtomicBool::new(false),
            cycle_lock: tokio::sync::Mutex::new(()),
            feed: Mutex::new(None),
            ingest_tx,
        });
        shared.publish_state();

        tokio::spawn(ingest_loop(ingest_rx, Arc::downgrade(&shared)));
        let task = tokio::spawn(run_loop(shared.clone()));
        tracing::info!("sync coordinator started");

        Self {
            shared,
            task: Mutex::new(Some(task)),
        }
    }

    pub fn status(&self) -> SyncStatus {
        self.shared.machine().status()
    }

    pub fn state(&self) -> SyncState {
        self.shared.machine().state().clone()
    }

    pub fn is_stopped(&self) -> bool {
        self.shared.stopped.load(Ordering::SeqCst)
    }

    /// Run one cycle now, ignoring any backoff, and return the state it
    /// left behind.
    pub async fn force_sync_now(&self) -> SyncState {
        self.shared.run_cycle().await;
        self.state()
    }

    /// Ask for a cycle soon. Ignored while offline so writes do not defeat
    /// the backoff.
    pub fn nudge(&self) {
        if self.status() == SyncStatus::Online {
            self.shared.trigger.notify_one();
        }
    }

    /// Re-read the queue depth into the observable state.
    pub fn refresh_pending(&self) {
        self.shared.publish_state();
    }

    /// Apply one remote row to the local store.
    pub(crate) fn ingest(&self, row: RemoteRow) -> Result<bool> {
        self.shared.ingest(row)
    }

    /// Stop syncing. Takes effect immediately and is safe to call twice; a
    /// cycle in progress finishes the mutation it is sending and stops.
    pub fn stop(&self) {
        if self.shared.stopped.swap(true, Ordering::SeqCst) {
            return;
        }
        self.shared.shutdown.notify_one();
        self.shared.shutdown.notify_waiters();
        if let Some(mut feed) = self.shared.feed().take() {
            feed.unsubscribe();
        }
        tracing::info!("sync coordinator stopped");
    }

    /// Wait for the run loop to exit after [`stop`](Self::stop), then put
    /// anything it left in flight back in line.
    pub async fn join(&self) {
        let task = self
            .task
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();
        if let Some(task) = task {
            if let Err(e) = task.await {
                tracing::error!(error = %e, "sync loop panicked");
            }
        }
        // Wait out a force_sync_now still running.
        let _cycle = self.shared.cycle_lock.lock().await;
        match self.shared.ctx.queue.release_all() {
            Ok(0) => {}
            Ok(n) => tracing::debug!(released = n, "returned in-flight mutations to queue"),
            Err(e) => tracing::error!(error = %e, "failed to release in-flight mutations"),
        }
    }
}

impl Drop for SyncCoordinator {
    fn drop(&mut self) {
        self.stop();
    }
}

async fn run_loop(shared: Arc<Shared>) {
    loop {
        if shared.stopped.load(Ordering::SeqCst) {
            break;
        }
        let wake = shared.machine().next_wake(shared.ctx.config.flush_interval);
        tokio::select! {
            _ = shared.shutdown.notified() => break,
            _ = shared.trigger.notified() => {}
            _ = tokio::time::sleep(wake) => {}
        }
        shared.run_cycle().await;
    }
    tracing::debug!("sync loop exited");
}

async fn ingest_loop(mut rx: mpsc::UnboundedReceiver<RemoteRow>, shared: Weak<Shared>) {
    while let Some(row) = rx.recv().await {
        let Some(shared) = shared.upgrade() else {
            break;
        };
        if shared.stopped.load(Ordering::SeqCst) {
            continue;
        }
        let (entity_type, entity_id) = (row.entity_type, row.entity_id.clone());
        if let Err(e) = shared.ingest(row) {
            tracing::error!(
                entity_type = %entity_type,
                entity_id = %entity_id,
                error = %e,
                "failed to apply remote change"
            );
        }
    }
}

impl Shared {
    fn machine(&self) -> MutexGuard<'_, SyncMachine> {
        self.machine.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn feed(&self) -> MutexGuard<'_, Option<ChangeSubscription>> {
        self.feed.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn publish_state(&self) {
        let state = {
            let mut machine = self.machine();
            machine.set_pending(self.ctx.queue.pending_count());
            machine.state().clone()
        };
        self.ctx.status.send_if_modified(|current| {
            if *current == state {
                false
            } else {
                *current = state;
                true
            }
        });
    }

    async fn run_cycle(&self) {
        let _cycle = self.cycle_lock.lock().await;
        if self.stopped.load(Ordering::SeqCst) {
            return;
        }
        if !self.machine().begin_cycle() {
            return;
        }
        self.publish_state();

        let timeout = self.ctx.config.remote_timeout;
        if let Err(e) = bounded(timeout, self.ctx.remote.probe()).await {
            tracing::warn!(error = %e, "remote probe failed");
            self.machine().probe_failed(e.to_string());
            self.publish_state();
            return;
        }

        self.ensure_feed().await;

        let groups = self.ctx.queue.plan();
        let lost: Mutex<Option<String>> = Mutex::new(None);
        if !groups.is_empty() {
            tracing::debug!(groups = groups.len(), "flushing mutation queue");
        }
        stream::iter(groups)
            .for_each_concurrent(self.ctx.config.flush_workers, |group| {
                self.flush_group(group, &lost)
            })
            .await;

        let lost = lost.into_inner().unwrap_or_else(|e| e.into_inner());
        let end = match lost {
            Some(error) => {
                tracing::warn!(error = %error, "connectivity lost during flush");
                CycleEnd::ConnectivityLost(error)
            }
            None => CycleEnd::Reachable,
        };
        self.machine().cycle_completed(end, self.ctx.clock.now());
        self.publish_state();

        let state = self.machine().state().clone();
        tracing::debug!(
            status = %state.status,
            pending = state.pending_count,
            "sync cycle finished"
        );
    }

    /// Subscribe to the remote change feed if not already subscribed.
    async fn ensure_feed(&self) {
        if self.feed().as_ref().is_some_and(ChangeSubscription::is_active) {
            return;
        }
        let tx = self.ingest_tx.clone();
        let callback = Arc::new(move |row: RemoteRow| {
            let _ = tx.send(row);
        });
        let subscribed = bounded(
            self.ctx.config.remote_timeout,
            self.ctx
                .remote
                .subscribe_to_changes(None, Query::all(), callback),
        )
        .await;

        match subscribed {
            Ok(subscription) => {
                // stop() may have run while we were subscribing.
                if self.stopped.load(Ordering::SeqCst) {
                    drop(subscription);
                    return;
                }
                *self.feed() = Some(subscription);
                tracing::info!("subscribed to remote change feed");
            }
            Err(e) => tracing::warn!(error = %e, "could not subscribe to change feed"),
        }
    }

    /// Send one entity's mutations in order, stopping at the first one that
    /// must be retried.
    async fn flush_group(&self, group: FlushGroup, lost: &Mutex<Option<String>>) {
        let queue = &self.ctx.queue;
        for mutation in group.mutations {
            if self.stopped.load(Ordering::SeqCst)
                || lost.lock().unwrap_or_else(|e| e.into_inner()).is_some()
            {
                break;
            }

            let record = match queue.begin(&mutation.id) {
                Ok(record) => record,
                Err(e) => {
                    tracing::error!(mutation_id = %mutation.id, error = %e, "could not start mutation");
                    break;
                }
            };

            let sent = bounded(self.ctx.config.remote_timeout, self.ctx.remote.apply(&record)).await;
            let proceed = match sent {
                Ok(write) => self.confirmed(&record, write),
                Err(e) if e.is_connectivity() => {
                    if let Err(err) = queue.release(&record.id) {
                        tracing::error!(mutation_id = %record.id, error = %err, "could not release mutation");
                    }
                    *lost.lock().unwrap_or_else(|e| e.into_inner()) = Some(e.to_string());
                    false
                }
                Err(e @ (RemoteError::Validation(_) | RemoteError::Decode(_))) => {
                    self.rejected(&record, &e)
                }
                Err(e) => self.failed(&record, &e),
            };
            self.publish_state();
            if !proceed {
                break;
            }
        }
    }

    fn confirmed(&self, record: &MutationRecord, write: RemoteWrite) -> bool {
        if let Err(e) = self.ctx.queue.complete(&record.id) {
            tracing::error!(mutation_id = %record.id, error = %e, "could not complete mutation");
            return false;
        }

        let local = self.ctx.local.as_ref();
        let newer = read_version(local, record.entity_type, &record.entity_id)
            .map_or(true, |known| write.server_ts > known);
        if newer {
            if let Err(e) = record_version(local, record.entity_type, &record.entity_id, write.server_ts) {
                tracing::warn!(entity_id = %record.entity_id, error = %e, "could not record server version");
            }
        }

        if write.conflicted {
            tracing::warn!(
                mutation_id = %record.id,
                entity_type = %record.entity_type,
                entity_id = %record.entity_id,
                "overwrote a remote change (last write wins)"
            );
            self.ctx.diagnostics.record_conflict(record, write.server_ts);
        }

        tracing::debug!(
            mutation_id = %record.id,
            entity_id = %record.entity_id,
            server_ts = %write.server_ts,
            "mutation confirmed"
        );
        true
    }

    fn rejected(&self, record: &MutationRecord, error: &RemoteError) -> bool {
        let reason = error.to_string();
        if let Err(e) = self.ctx.queue.reject(&record.id, &reason) {
            tracing::error!(mutation_id = %record.id, error = %e, "could not drop rejected mutation");
            return false;
        }
        tracing::error!(
            mutation_id = %record.id,
            entity_type = %record.entity_type,
            entity_id = %record.entity_id,
            error = %reason,
            "remote rejected mutation"
        );
        self.ctx
            .diagnostics
            .record_rejection(record, &reason, self.ctx.clock.now());
        true
    }

    fn failed(&self, record: &MutationRecord, error: &RemoteError) -> bool {
        match self.ctx.queue.fail(&record.id, &error.to_string()) {
            Ok(FailOutcome::WillRetry { attempt }) => {
                tracing::warn!(
                    mutation_id = %record.id,
                    entity_id = %record.entity_id,
                    attempt,
                    error = %error,
                    "mutation failed, will retry"
                );
                false
            }
            Ok(FailOutcome::DeadLettered { attempt }) => {
                tracing::error!(
                    mutation_id = %record.id,
                    entity_type = %record.entity_type,
                    entity_id = %record.entity_id,
                    attempt,
                    error = %error,
                    "mutation dead-lettered"
                );
                true
            }
            Err(e) => {
                tracing::error!(mutation_id = %record.id, error = %e, "could not record failure");
                false
            }
        }
    }

    /// Apply a remote row locally, last write wins by server timestamp.
    ///
    /// Rows for entities with unsynced local writes are skipped: the local
    /// write is newer and will overwrite the remote row when flushed.
    fn ingest(&self, row: RemoteRow) -> Result<bool> {
        let (entity_type, entity_id) = (row.entity_type, row.entity_id.as_str());
        if self.ctx.queue.has_unsynced(entity_type, entity_id) {
            tracing::debug!(entity_type = %entity_type, entity_id = %entity_id, "remote change deferred to queued local write");
            return Ok(false);
        }
        let local = self.ctx.local.as_ref();
        if read_version(local, entity_type, entity_id).is_some_and(|known| known >= row.server_ts) {
            return Ok(false);
        }

        let table = Table::Entity(entity_type);
        let existed = local.get(table, entity_id)?.is_some();
        let change = if row.deleted {
            local.delete(table, entity_id)?;
            MutationOp::Delete
        } else {
            if let Err(e) = self.ctx.schema.validate(entity_type, entity_id, &row.payload) {
                tracing::warn!(entity_type = %entity_type, entity_id = %entity_id, error = %e, "dropping invalid remote row");
                return Ok(false);
            }
            local.put(table, entity_id, row.payload.clone())?;
            if existed {
                MutationOp::Update
            } else {
                MutationOp::Create
            }
        };
        record_version(local, entity_type, entity_id, row.server_ts)?;

        let event_id = row.mutation_id.clone().unwrap_or_else(|| {
            format!("{}/{}@{}", entity_type, entity_id, row.server_ts.to_rfc3339())
        });
        self.ctx.bus.publish(DomainEvent::for_write(
            event_id,
            entity_type,
            change,
            entity_id,
            row.payload,
            row.server_ts,
            Origin::Remote,
        ))?;
        tracing::debug!(entity_type = %entity_type, entity_id = %entity_id, change = ?change, "applied remote change");
        Ok(true)
    }
}
