//! Realtime Event Bus.
//!
//! Delivers each [`DomainEvent`] to every matching subscription exactly once.
//! Publishing first records the event id in the durable dedup log; an id
//! already there is dropped. Accepted events are handed to a dispatch task
//! over a channel, so a slow subscriber never holds up the writer or the
//! change feed that published.
//!
//! `unsubscribe` is synchronous: once it returns, the callback will not run
//! again. If the dispatch task is inside that callback at the time,
//! `unsubscribe` waits for it to finish, unless it is the callback itself
//! unsubscribing.

use crate::error::StorageError;
use crate::local::{LocalStore, Table};
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use rollcall_engine::{Admission, Clock, DedupLog, DomainEvent, EventFilter};
use serde::{Deserialize, Serialize};
use std::cell::Cell;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::{mpsc, oneshot};

/// Callback invoked for each delivered event.
pub type EventCallback = Arc<dyn Fn(&DomainEvent) + Send + Sync>;

static NEXT_GATE: AtomicU64 = AtomicU64::new(1);

thread_local! {
    /// Gate whose callback is running on this thread, if any.
    static RUNNING_GATE: Cell<Option<u64>> = const { Cell::new(None) };
}

/// Serializes a callback against its own cancellation.
#[derive(Debug)]
pub(crate) struct Gate {
    id: u64,
    open: AtomicBool,
    running: Mutex<()>,
}

impl Gate {
    pub(crate) fn new() -> Self {
        Self {
            id: NEXT_GATE.fetch_add(1, Ordering::Relaxed),
            open: AtomicBool::new(true),
            running: Mutex::new(()),
        }
    }

    /// Run `f` unless the gate has been closed.
    pub(crate) fn run(&self, f: impl FnOnce()) {
        let _running = self.running.lock().unwrap_or_else(|e| e.into_inner());
        if !self.open.load(Ordering::SeqCst) {
            return;
        }
        let previous = RUNNING_GATE.with(|g| g.replace(Some(self.id)));
        f();
        RUNNING_GATE.with(|g| g.set(previous));
    }

    /// Close the gate and wait out a callback already running elsewhere.
    pub(crate) fn close(&self) {
        self.open.store(false, Ordering::SeqCst);
        if RUNNING_GATE.with(|g| g.get()) == Some(self.id) {
            return;
        }
        drop(self.running.lock().unwrap_or_else(|e| e.into_inner()));
    }

    pub(crate) fn is_open(&self) -> bool {
        self.open.load(Ordering::SeqCst)
    }
}

/// Handle to a subscription. Dropping it unsubscribes.
#[must_use = "dropping the subscription cancels it"]
pub struct Subscription {
    cancel: Option<Box<dyn FnOnce() + Send + Sync>>,
}

impl Subscription {
    pub(crate) fn new(cancel: impl FnOnce() + Send + Sync + 'static) -> Self {
        Self {
            cancel: Some(Box::new(cancel)),
        }
    }

    /// Stop delivery. No callback runs after this returns. Idempotent.
    pub fn unsubscribe(&mut self) {
        if let Some(cancel) = self.cancel.take() {
            cancel();
        }
    }

    pub fn is_active(&self) -> bool {
        self.cancel.is_some()
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.unsubscribe();
    }
}

impl fmt::Debug for Subscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscription")
            .field("active", &self.is_active())
            .finish()
    }
}

struct Subscriber {
    filter: EventFilter,
    callback: EventCallback,
    gate: Arc<Gate>,
}

type Subscribers = DashMap<u64, Arc<Subscriber>>;

enum Dispatch {
    Event(DomainEvent),
    Barrier(oneshot::Sender<()>),
}

/// Row of the `delivered_events` table.
#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct DeliveredEvent {
    id: String,
    delivered_at: DateTime<Utc>,
}

pub struct EventBus {
    store: Arc<dyn LocalStore>,
    clock: Arc<dyn Clock>,
    dedup: Mutex<DedupLog>,
    subscribers: Arc<Subscribers>,
    next_id: AtomicU64,
    tx: mpsc::UnboundedSender<Dispatch>,
}

impl fmt::Debug for EventBus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventBus")
            .field("subscribers", &self.subscribers.len())
            .field("delivered", &self.delivered_count())
            .finish()
    }
}

impl EventBus {
    /// Restore the dedup log and start the dispatch task.
    ///
    /// Must be called inside a Tokio runtime.
    pub fn open(
        store: Arc<dyn LocalStore>,
        clock: Arc<dyn Clock>,
        retention: chrono::Duration,
        capacity: usize,
    ) -> Result<Self, StorageError> {
        let mut entries = Vec::new();
        for value in store.scan(Table::DeliveredEvents)? {
            let row: DeliveredEvent = serde_json::from_value(value)?;
            entries.push((row.delivered_at, row.id));
        }
        let dedup = DedupLog::restore(entries, retention, capacity);

        let subscribers: Arc<Subscribers> = Arc::new(DashMap::new());
        let (tx, rx) = mpsc::unbounded_channel();
        tokio::spawn(dispatch_loop(rx, subscribers.clone()));

        Ok(Self {
            store,
            clock,
            dedup: Mutex::new(dedup),
            subscribers,
            next_id: AtomicU64::new(1),
            tx,
        })
    }

    fn dedup(&self) -> MutexGuard<'_, DedupLog> {
        self.dedup.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Publish an event. Returns `false` if its id was already delivered.
    ///
    /// The id is durable before any subscriber sees the event, so a restart
    /// cannot cause a second delivery.
    pub fn publish(&self, event: DomainEvent) -> Result<bool, StorageError> {
        let now = self.clock.now();
        {
            let mut dedup = self.dedup();
            if dedup.contains(&event.id) {
                tracing::debug!(event_id = %event.id, origin = ?event.origin, "suppressed duplicate event");
                return Ok(false);
            }

            let row = serde_json::to_value(DeliveredEvent {
                id: event.id.clone(),
                delivered_at: now,
            })?;
            self.store.put(Table::DeliveredEvents, &event.id, row)?;

            if let Admission::Fresh { evicted } = dedup.admit(&event.id, now) {
                for id in evicted {
                    if let Err(e) = self.store.delete(Table::DeliveredEvents, &id) {
                        tracing::warn!(event_id = %id, error = %e, "failed to prune delivered event");
                    }
                }
            }
        }

        tracing::debug!(
            event_id = %event.id,
            kind = %event.kind,
            entity_id = %event.entity_id,
            origin = ?event.origin,
            "publishing event"
        );
        if self.tx.send(Dispatch::Event(event)).is_err() {
            tracing::warn!("event dispatch loop has stopped");
        }
        Ok(true)
    }

    /// Deliver matching events to `callback` until the returned handle is
    /// unsubscribed or dropped.
    pub fn subscribe(
        &self,
        filter: EventFilter,
        callback: impl Fn(&DomainEvent) + Send + Sync + 'static,
    ) -> Subscription {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let gate = Arc::new(Gate::new());
        self.subscribers.insert(
            id,
            Arc::new(Subscriber {
                filter,
                callback: Arc::new(callback),
                gate: gate.clone(),
            }),
        );
        tracing::debug!(subscription = id, "subscribed to events");

        let subscribers = Arc::downgrade(&self.subscribers);
        Subscription::new(move || {
            if let Some(subscribers) = subscribers.upgrade() {
                subscribers.remove(&id);
            }
            gate.close();
            tracing::debug!(subscription = id, "unsubscribed from events");
        })
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers.len()
    }

    /// Event ids currently remembered.
    pub fn delivered_count(&self) -> usize {
        self.dedup().len()
    }

    pub fn was_delivered(&self, id: &str) -> bool {
        self.dedup().contains(id)
    }

    /// Wait until every event published so far has been dispatched.
    pub async fn flushed(&self) {
        let (tx, rx) = oneshot::channel();
        if self.tx.send(Dispatch::Barrier(tx)).is_ok() {
            let _ = rx.await;
        }
    }
}

async fn dispatch_loop(mut rx: mpsc::UnboundedReceiver<Dispatch>, subscribers: Arc<Subscribers>) {
    while let Some(message) = rx.recv().await {
        match message {
            Dispatch::Event(event) => {
                let targets: Vec<Arc<Subscriber>> = subscribers
                    .iter()
                    .filter(|s| s.filter.matches(&event))
                    .map(|s| s.value().clone())
                    .collect();
                for subscriber in targets {
                    subscriber.gate.run(|| (subscriber.callback)(&event));
                }
            }
            Dispatch::Barrier(done) => {
                let _ = done.send(());
            }
        }
    }
    tracing::debug!("event dispatch loop stopped");
}
