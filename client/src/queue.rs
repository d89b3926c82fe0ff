//! Durable mutation queue.
//!
//! Wraps the engine's [`MutationQueue`] and mirrors every state change into
//! the local `mutations` table. All access goes through one mutex, so
//! pending and attempt counts are never lost to interleaved updates.
//!
//! The in-memory queue is updated first and the row written second. If the
//! process dies in between, the row on disk is one step behind; after a
//! restart that mutation is simply sent again, and remote writes are
//! idempotent per mutation id.

use crate::error::{Result, StorageError};
use crate::local::{LocalStore, Table};
use rollcall_engine::{FailOutcome, FlushGroup, MutationQueue, MutationRecord, Replay};
use std::sync::{Arc, Mutex, MutexGuard};

#[derive(Debug)]
pub struct DurableQueue {
    store: Arc<dyn LocalStore>,
    inner: Mutex<MutationQueue>,
}

impl DurableQueue {
    /// Load the queue from the local store.
    pub fn open(store: Arc<dyn LocalStore>, retry_cap: u32) -> Result<Self> {
        let mut records = Vec::new();
        for value in store.scan(Table::Mutations)? {
            let record: MutationRecord =
                serde_json::from_value(value).map_err(StorageError::from)?;
            records.push(record);
        }

        let (queue, changed) = MutationQueue::restore(records, retry_cap);
        for record in &changed {
            persist(store.as_ref(), record)?;
        }

        if !queue.is_empty() {
            tracing::info!(
                queued = queue.len(),
                pending = queue.pending_count(),
                dead_letters = queue.dead_letters().len(),
                "restored mutation queue"
            );
        }

        Ok(Self {
            store,
            inner: Mutex::new(queue),
        })
    }

    fn lock(&self) -> MutexGuard<'_, MutationQueue> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Add a mutation. It is durable once this returns.
    pub fn enqueue(&self, record: MutationRecord) -> Result<MutationRecord> {
        let mut queue = self.lock();
        let queued = queue.enqueue(record).clone();
        if let Err(e) = persist(self.store.as_ref(), &queued) {
            queue.withdraw(&queued.id);
            return Err(e);
        }
        tracing::debug!(
            mutation_id = %queued.id,
            entity_type = %queued.entity_type,
            entity_id = %queued.entity_id,
            seq = queued.seq,
            "enqueued mutation"
        );
        Ok(queued)
    }

    pub fn plan(&self) -> Vec<FlushGroup> {
        self.lock().plan()
    }

    pub fn get(&self, id: &str) -> Option<MutationRecord> {
        self.lock().get(id).cloned()
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    pub fn pending_count(&self) -> usize {
        self.lock().pending_count()
    }

    pub fn dead_letters(&self) -> Vec<MutationRecord> {
        self.lock().dead_letters().into_iter().cloned().collect()
    }

    pub fn has_unsynced(&self, entity_type: rollcall_engine::EntityType, entity_id: &str) -> bool {
        self.lock().has_unsynced(entity_type, entity_id)
    }

    /// Every queued mutation, dead letters included.
    pub fn snapshot(&self) -> Vec<MutationRecord> {
        self.lock().iter().cloned().collect()
    }

    pub fn begin(&self, id: &str) -> Result<MutationRecord> {
        let mut queue = self.lock();
        let record = queue.begin(id)?.clone();
        persist(self.store.as_ref(), &record)?;
        Ok(record)
    }

    pub fn complete(&self, id: &str) -> Result<MutationRecord> {
        let mut queue = self.lock();
        let record = queue.complete(id)?;
        self.store.delete(Table::Mutations, id)?;
        Ok(record)
    }

    pub fn fail(&self, id: &str, reason: &str) -> Result<FailOutcome> {
        let mut queue = self.lock();
        let outcome = queue.fail(id, reason)?;
        if let Some(record) = queue.get(id) {
            persist(self.store.as_ref(), record)?;
        }
        Ok(outcome)
    }

    pub fn release(&self, id: &str) -> Result<MutationRecord> {
        let mut queue = self.lock();
        let record = queue.release(id)?.clone();
        persist(self.store.as_ref(), &record)?;
        Ok(record)
    }

    pub fn reject(&self, id: &str, reason: &str) -> Result<MutationRecord> {
        let mut queue = self.lock();
        let record = queue.reject(id, reason)?;
        self.store.delete(Table::Mutations, id)?;
        Ok(record)
    }

    /// Put every in-flight mutation back in line, e.g. when sync stops.
    pub fn release_all(&self) -> Result<usize> {
        let mut queue = self.lock();
        let released = queue.release_all();
        for record in &released {
            persist(self.store.as_ref(), record)?;
        }
        Ok(released.len())
    }

    pub fn retry_dead_letter(&self, id: &str, replay: Replay) -> Result<MutationRecord> {
        let mut queue = self.lock();
        let record = queue.retry_dead_letter(id, replay)?.clone();
        persist(self.store.as_ref(), &record)?;
        Ok(record)
    }

    /// Remove a mutation whatever its state, rolling back an enqueue whose
    /// local write could not be completed.
    pub fn withdraw(&self, id: &str) -> Result<Option<MutationRecord>> {
        let mut queue = self.lock();
        let record = queue.withdraw(id);
        if record.is_some() {
            self.store.delete(Table::Mutations, id)?;
        }
        Ok(record)
    }

    pub fn discard(&self, id: &str) -> Result<MutationRecord> {
        let mut queue = self.lock();
        let record = queue.discard(id)?;
        self.store.delete(Table::Mutations, id)?;
        Ok(record)
    }
}

fn persist(store: &dyn LocalStore, record: &MutationRecord) -> Result<()> {
    let value = serde_json::to_value(record).map_err(StorageError::from)?;
    store.put(Table::Mutations, &record.id, value)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Error;
    use crate::local::{FileStore, MemoryStore};
    use chrono::{TimeZone, Utc};
    use rollcall_engine::{EntityType, MutationOp, MutationStatus, Schema};
    use serde_json::json;

    fn write(id: &str, entity: &str) -> MutationRecord {
        MutationRecord::new(
            id,
            EntityType::Student,
            entity,
            MutationOp::Create,
            json!({"id": entity, "name": "Ayu", "className": "7A"}),
            Utc.with_ymd_and_hms(2024, 7, 15, 0, 0, 0).unwrap(),
        )
    }

    #[test]
    fn survives_restart_and_releases_in_flight() {
        let dir = tempfile::tempdir().unwrap();
        let schema = Schema::default();
        {
            let store: Arc<dyn LocalStore> = Arc::new(FileStore::open(dir.path(), &schema).unwrap());
            let queue = DurableQueue::open(store, 5).unwrap();
            queue.enqueue(write("m1", "S1")).unwrap();
            queue.enqueue(write("m2", "S2")).unwrap();
            queue.begin("m1").unwrap();
            queue.begin("m2").unwrap();
            queue.fail("m2", "503").unwrap();
        }

        let store: Arc<dyn LocalStore> = Arc::new(FileStore::open(dir.path(), &schema).unwrap());
        let queue = DurableQueue::open(store, 5).unwrap();
        assert_eq!(queue.pending_count(), 2);
        assert_eq!(queue.get("m1").unwrap().status, MutationStatus::Pending);
        let m2 = queue.get("m2").unwrap();
        assert_eq!(m2.status, MutationStatus::Failed);
        assert_eq!(m2.attempt_count, 1);
    }

    #[test]
    fn complete_removes_row() {
        let store = Arc::new(MemoryStore::default());
        let queue = DurableQueue::open(store.clone(), 5).unwrap();
        queue.enqueue(write("m1", "S1")).unwrap();
        assert_eq!(store.count(Table::Mutations).unwrap(), 1);

        queue.begin("m1").unwrap();
        queue.complete("m1").unwrap();
        assert_eq!(store.count(Table::Mutations).unwrap(), 0);
        assert!(queue.is_empty());
    }

    #[test]
    fn failed_enqueue_is_rolled_back() {
        let store = Arc::new(MemoryStore::default());
        let queue = DurableQueue::open(store.clone(), 5).unwrap();
        store.set_fail_writes(true);
        let err = queue.enqueue(write("m1", "S1")).unwrap_err();
        assert!(matches!(err, Error::Storage(_)));
        assert_eq!(queue.pending_count(), 0);
    }

    #[test]
    fn dead_letter_lifecycle() {
        let store = Arc::new(MemoryStore::default());
        let queue = DurableQueue::open(store.clone(), 1).unwrap();
        queue.enqueue(write("m1", "S1")).unwrap();
        queue.begin("m1").unwrap();
        assert_eq!(
            queue.fail("m1", "boom").unwrap(),
            FailOutcome::DeadLettered { attempt: 1 }
        );
        assert_eq!(queue.dead_letters().len(), 1);
        assert_eq!(queue.pending_count(), 0);

        let replay = Replay {
            current: Some(serde_json::json!({"id": "S1"})),
            base_server_ts: None,
            at: chrono::Utc::now(),
        };
        queue.retry_dead_letter("m1", replay).unwrap();
        assert_eq!(queue.pending_count(), 1);
        let row = store.get(Table::Mutations, "m1").unwrap().unwrap();
        assert_eq!(row["status"], "pending");
        assert_eq!(row["attemptCount"], 0);
    }
}
