//! The single write path.
//!
//! Every change a caller makes goes through [`Writer::write`]: validate,
//! commit locally, queue for the remote store when in cloud mode, then
//! publish the domain event. Routing all writers through here is what keeps
//! the mutation queue aware of every change.

use crate::bus::EventBus;
use crate::config::Mode;
use crate::coordinator::SyncCoordinator;
use crate::error::{Error, Result};
use crate::local::{version_key, LocalStore, Table};
use crate::queue::DurableQueue;
use chrono::{DateTime, Utc};
use rollcall_engine::{
    Clock, DomainEvent, EntityType, EventId, MutationId, MutationOp, MutationRecord, Origin,
    Schema,
};
use serde::Serialize;
use std::sync::{Arc, RwLock};

/// What a committed write produced.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Committed {
    /// Queued mutation, in cloud mode.
    pub mutation_id: Option<MutationId>,
    pub event_id: EventId,
    /// Whether the event reached subscribers (false if it was a duplicate).
    pub published: bool,
}

#[derive(Debug)]
pub(crate) struct Writer {
    pub local: Arc<dyn LocalStore>,
    pub queue: Arc<DurableQueue>,
    pub bus: Arc<EventBus>,
    pub schema: Arc<Schema>,
    pub clock: Arc<dyn Clock>,
    mode: RwLock<Mode>,
    coordinator: RwLock<Option<Arc<SyncCoordinator>>>,
}

impl Writer {
    pub fn new(
        local: Arc<dyn LocalStore>,
        queue: Arc<DurableQueue>,
        bus: Arc<EventBus>,
        schema: Arc<Schema>,
        clock: Arc<dyn Clock>,
        mode: Mode,
    ) -> Self {
        Self {
            local,
            queue,
            bus,
            schema,
            clock,
            mode: RwLock::new(mode),
            coordinator: RwLock::new(None),
        }
    }

    pub fn mode(&self) -> Mode {
        *self.mode.read().unwrap_or_else(|e| e.into_inner())
    }

    pub fn set_mode(&self, mode: Mode) {
        *self.mode.write().unwrap_or_else(|e| e.into_inner()) = mode;
    }

    pub fn coordinator(&self) -> Option<Arc<SyncCoordinator>> {
        self.coordinator
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    /// Install or remove the running coordinator, returning the old one.
    pub fn replace_coordinator(
        &self,
        coordinator: Option<Arc<SyncCoordinator>>,
    ) -> Option<Arc<SyncCoordinator>> {
        std::mem::replace(
            &mut *self.coordinator.write().unwrap_or_else(|e| e.into_inner()),
            coordinator,
        )
    }

    /// Commit a change locally and hand it to sync and subscribers.
    ///
    /// Fails without side effects on a validation error. A storage error
    /// while committing or queueing is returned and the local row is put
    /// back as it was.
    pub fn write(
        &self,
        entity_type: EntityType,
        entity_id: &str,
        operation: MutationOp,
        payload: serde_json::Value,
    ) -> Result<Committed> {
        if operation != MutationOp::Delete {
            self.schema.validate(entity_type, entity_id, &payload)?;
        }

        let table = Table::Entity(entity_type);
        let previous = self.local.get(table, entity_id)?;
        let operation = match (operation, &previous) {
            (MutationOp::Delete, None) => {
                return Err(Error::NotFound {
                    entity_type,
                    id: entity_id.to_string(),
                })
            }
            (MutationOp::Delete, Some(_)) => MutationOp::Delete,
            (_, None) => MutationOp::Create,
            (_, Some(_)) => MutationOp::Update,
        };

        match operation {
            MutationOp::Delete => {
                self.local.delete(table, entity_id)?;
            }
            _ => self.local.put(table, entity_id, payload.clone())?,
        }

        let now = self.clock.now();
        let mutation_id = uuid::Uuid::new_v4().to_string();
        let queued = if self.mode() == Mode::Cloud {
            let record = MutationRecord::new(
                mutation_id.clone(),
                entity_type,
                entity_id,
                operation,
                if operation == MutationOp::Delete {
                    serde_json::Value::Null
                } else {
                    payload.clone()
                },
                now,
            )
            .with_base_server_ts(self.known_server_ts(entity_type, entity_id));

            if let Err(e) = self.queue.enqueue(record) {
                self.restore(table, entity_id, previous);
                return Err(e);
            }
            true
        } else {
            false
        };

        // Subscribers of a delete still want to know what went away.
        let event_payload = match operation {
            MutationOp::Delete => previous.unwrap_or(serde_json::Value::Null),
            _ => payload,
        };
        let event = DomainEvent::for_write(
            mutation_id.clone(),
            entity_type,
            operation,
            entity_id,
            event_payload,
            now,
            Origin::Local,
        );
        let published = match self.bus.publish(event) {
            Ok(published) => published,
            Err(e) => {
                // The write itself is committed; only the notification is lost.
                tracing::error!(
                    entity_type = %entity_type,
                    entity_id = %entity_id,
                    error = %e,
                    "failed to record event for committed write"
                );
                false
            }
        };

        tracing::debug!(
            entity_type = %entity_type,
            entity_id = %entity_id,
            operation = ?operation,
            queued,
            "committed write"
        );

        if queued {
            if let Some(coordinator) = self.coordinator() {
                coordinator.refresh_pending();
                coordinator.nudge();
            }
        }

        Ok(Committed {
            mutation_id: queued.then_some(mutation_id.clone()),
            event_id: mutation_id,
            published,
        })
    }

    /// Server timestamp of the copy the local row is based on.
    pub fn known_server_ts(&self, entity_type: EntityType, entity_id: &str) -> Option<DateTime<Utc>> {
        read_version(self.local.as_ref(), entity_type, entity_id)
    }

    fn restore(&self, table: Table, entity_id: &str, previous: Option<serde_json::Value>) {
        let undo = match previous {
            Some(value) => self.local.put(table, entity_id, value),
            None => self.local.delete(table, entity_id).map(|_| ()),
        };
        if let Err(e) = undo {
            tracing::error!(
                table = %table,
                entity_id = %entity_id,
                error = %e,
                "failed to roll back local write"
            );
        }
    }
}

/// Last server timestamp recorded for an entity.
pub(crate) fn read_version(
    local: &dyn LocalStore,
    entity_type: EntityType,
    entity_id: &str,
) -> Option<DateTime<Utc>> {
    let row = local
        .get(Table::Versions, &version_key(entity_type, entity_id))
        .ok()
        .flatten()?;
    serde_json::from_value(row.get("serverTs")?.clone()).ok()
}

/// Remember the server timestamp of an entity's local copy.
pub(crate) fn record_version(
    local: &dyn LocalStore,
    entity_type: EntityType,
    entity_id: &str,
    server_ts: DateTime<Utc>,
) -> std::result::Result<(), crate::error::StorageError> {
    local.put(
        Table::Versions,
        &version_key(entity_type, entity_id),
        serde_json::json!({ "serverTs": server_ts }),
    )
}
