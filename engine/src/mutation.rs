//! Mutation records and the pending-mutation queue.
//!
//! Every local write produces a [`MutationRecord`]. The [`MutationQueue`]
//! tracks them until the remote store confirms them and decides, for each
//! flush cycle, which mutations may be sent and in what order.
//!
//! # Ordering
//!
//! Mutations are grouped by entity. Inside a group they are applied strictly
//! in `(created_at, seq)` order; `seq` is assigned at enqueue time and breaks
//! ties between writes in the same instant. Different groups are independent
//! and may be flushed concurrently.
//!
//! # Failure policy
//!
//! A failed attempt increments `attempt_count`. Below the retry cap the
//! mutation becomes `failed` and its group stops for this cycle, so later
//! writes to the same entity wait behind it. At the cap it moves to
//! `deadLetter` and stops blocking anything: the rest of its group proceeds
//! and the dead letter is reported through diagnostics.

use crate::{error::Result, EntityId, EntityType, Error, MutationId};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::fmt;

/// The kind of write a mutation carries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MutationOp {
    Create,
    Update,
    Delete,
}

/// Lifecycle of a queued mutation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum MutationStatus {
    /// Never attempted.
    Pending,
    /// Currently being sent.
    InFlight,
    /// Attempted and failed; will be retried next cycle.
    Failed,
    /// Exceeded the retry cap; kept for diagnostics only.
    DeadLetter,
}

impl MutationStatus {
    /// Whether a flush cycle may pick this mutation up.
    pub fn is_eligible(&self) -> bool {
        matches!(self, MutationStatus::Pending | MutationStatus::Failed)
    }
}

impl fmt::Display for MutationStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            MutationStatus::Pending => "pending",
            MutationStatus::InFlight => "inFlight",
            MutationStatus::Failed => "failed",
            MutationStatus::DeadLetter => "deadLetter",
        };
        f.write_str(s)
    }
}

/// A write not yet confirmed by the remote store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MutationRecord {
    pub id: MutationId,
    pub entity_type: EntityType,
    pub entity_id: EntityId,
    pub operation: MutationOp,
    /// Full payload for create/update, `null` for delete.
    pub payload: serde_json::Value,
    pub created_at: DateTime<Utc>,
    /// Enqueue sequence number; assigned by the queue.
    #[serde(default)]
    pub seq: u64,
    #[serde(default)]
    pub attempt_count: u32,
    pub status: MutationStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
    /// Server timestamp of the copy this write was based on.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub base_server_ts: Option<DateTime<Utc>>,
}

impl MutationRecord {
    /// Create a new pending mutation.
    pub fn new(
        id: impl Into<MutationId>,
        entity_type: EntityType,
        entity_id: impl Into<EntityId>,
        operation: MutationOp,
        payload: serde_json::Value,
        created_at: DateTime<Utc>,
    ) -> Self {
        Self {
            id: id.into(),
            entity_type,
            entity_id: entity_id.into(),
            operation,
            payload,
            created_at,
            seq: 0,
            attempt_count: 0,
            status: MutationStatus::Pending,
            last_error: None,
            base_server_ts: None,
        }
    }

    /// Record the server timestamp the local copy was based on.
    pub fn with_base_server_ts(mut self, ts: Option<DateTime<Utc>>) -> Self {
        self.base_server_ts = ts;
        self
    }

    fn order_key(&self) -> (DateTime<Utc>, u64) {
        (self.created_at, self.seq)
    }

    fn group_key(&self) -> (EntityType, &str) {
        (self.entity_type, self.entity_id.as_str())
    }
}

/// What happened to a mutation after a failed attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailOutcome {
    /// Still under the retry cap; stays in line for the next cycle.
    WillRetry { attempt: u32 },
    /// Hit the retry cap and was moved to the dead-letter set.
    DeadLettered { attempt: u32 },
}

/// Mutations for one entity, in application order.
#[derive(Debug, Clone, PartialEq)]
pub struct FlushGroup {
    pub entity_type: EntityType,
    pub entity_id: EntityId,
    pub mutations: Vec<MutationRecord>,
}

/// What a retried dead letter is replayed as.
#[derive(Debug, Clone, PartialEq)]
pub struct Replay {
    /// The entity's local row now, or `None` if it no longer exists.
    pub current: Option<serde_json::Value>,
    /// Server timestamp the local row is based on.
    pub base_server_ts: Option<DateTime<Utc>>,
    pub at: DateTime<Utc>,
}

/// The in-memory pending-mutation queue.
///
/// Durability is the caller's concern: every method that changes a record
/// returns enough for the caller to persist the change.
#[derive(Debug, Clone)]
pub struct MutationQueue {
    entries: HashMap<MutationId, MutationRecord>,
    next_seq: u64,
    retry_cap: u32,
}

impl MutationQueue {
    /// Create an empty queue. A mutation is dead-lettered once it has
    /// failed `retry_cap` times.
    pub fn new(retry_cap: u32) -> Self {
        Self {
            entries: HashMap::new(),
            next_seq: 1,
            retry_cap: retry_cap.max(1),
        }
    }

    /// Rebuild a queue from persisted records.
    ///
    /// Anything left `inFlight` by a crash is returned to the line. Returns
    /// the records whose status changed so the caller can persist them.
    pub fn restore(
        records: impl IntoIterator<Item = MutationRecord>,
        retry_cap: u32,
    ) -> (Self, Vec<MutationRecord>) {
        let mut queue = Self::new(retry_cap);
        let mut changed = Vec::new();

        for mut record in records {
            if record.status == MutationStatus::InFlight {
                record.status = idle_status(record.attempt_count);
                changed.push(record.clone());
            }
            queue.next_seq = queue.next_seq.max(record.seq + 1);
            queue.entries.insert(record.id.clone(), record);
        }

        (queue, changed)
    }

    pub fn retry_cap(&self) -> u32 {
        self.retry_cap
    }

    /// Add a new mutation at the back of its entity's line.
    pub fn enqueue(&mut self, mut record: MutationRecord) -> &MutationRecord {
        record.seq = self.next_seq;
        record.status = MutationStatus::Pending;
        record.attempt_count = 0;
        record.last_error = None;
        self.next_seq += 1;

        let id = record.id.clone();
        self.entries.entry(id).or_insert(record)
    }

    pub fn get(&self, id: &str) -> Option<&MutationRecord> {
        self.entries.get(id)
    }

    /// Total records, dead letters included.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Mutations still waiting to reach the remote store.
    pub fn pending_count(&self) -> usize {
        self.entries
            .values()
            .filter(|m| m.status != MutationStatus::DeadLetter)
            .count()
    }

    /// Dead-lettered mutations, oldest first.
    pub fn dead_letters(&self) -> Vec<&MutationRecord> {
        let mut out: Vec<_> = self
            .entries
            .values()
            .filter(|m| m.status == MutationStatus::DeadLetter)
            .collect();
        out.sort_by_key(|m| m.order_key());
        out
    }

    /// Whether an entity has writes the remote store has not confirmed.
    pub fn has_unsynced(&self, entity_type: EntityType, entity_id: &str) -> bool {
        self.entries.values().any(|m| {
            m.entity_type == entity_type
                && m.entity_id == entity_id
                && m.status != MutationStatus::DeadLetter
        })
    }

    /// Plan a flush cycle.
    ///
    /// Returns one group per entity with eligible mutations, each in
    /// application order. Entities that already have a mutation in flight
    /// are left out so a group never races with itself. Groups are ordered by
    /// their oldest mutation.
    pub fn plan(&self) -> Vec<FlushGroup> {
        let mut by_entity: BTreeMap<(EntityType, &str), Vec<&MutationRecord>> = BTreeMap::new();
        for m in self.entries.values() {
            if m.status != MutationStatus::DeadLetter {
                by_entity.entry(m.group_key()).or_default().push(m);
            }
        }

        let mut groups: Vec<FlushGroup> = by_entity
            .into_iter()
            .filter(|(_, ms)| ms.iter().all(|m| m.status != MutationStatus::InFlight))
            .map(|((entity_type, entity_id), mut ms)| {
                ms.sort_by_key(|m| m.order_key());
                FlushGroup {
                    entity_type,
                    entity_id: entity_id.to_string(),
                    mutations: ms.into_iter().cloned().collect(),
                }
            })
            .collect();

        groups.sort_by_key(|g| g.mutations.first().map(|m| m.order_key()));
        groups
    }

    /// Mark a mutation as being sent.
    pub fn begin(&mut self, id: &str) -> Result<&MutationRecord> {
        let record = self.entry_mut(id)?;
        if !record.status.is_eligible() {
            return Err(state_error(record, "pending|failed"));
        }
        record.status = MutationStatus::InFlight;
        Ok(record)
    }

    /// The remote store confirmed the mutation; drop it.
    pub fn complete(&mut self, id: &str) -> Result<MutationRecord> {
        self.expect_in_flight(id)?;
        self.remove(id)
    }

    /// The attempt failed after reaching the remote store.
    pub fn fail(&mut self, id: &str, reason: impl Into<String>) -> Result<FailOutcome> {
        let cap = self.retry_cap;
        let record = self.expect_in_flight(id)?;
        record.attempt_count += 1;
        record.last_error = Some(reason.into());

        if record.attempt_count >= cap {
            record.status = MutationStatus::DeadLetter;
            Ok(FailOutcome::DeadLettered {
                attempt: record.attempt_count,
            })
        } else {
            record.status = MutationStatus::Failed;
            Ok(FailOutcome::WillRetry {
                attempt: record.attempt_count,
            })
        }
    }

    /// The attempt never reached the remote store; put the mutation back
    /// without charging it an attempt.
    pub fn release(&mut self, id: &str) -> Result<&MutationRecord> {
        let record = self.expect_in_flight(id)?;
        record.status = idle_status(record.attempt_count);
        Ok(record)
    }

    /// The remote store refused the payload outright; drop it.
    pub fn reject(&mut self, id: &str, reason: impl Into<String>) -> Result<MutationRecord> {
        self.expect_in_flight(id)?;
        let mut record = self.remove(id)?;
        record.last_error = Some(reason.into());
        Ok(record)
    }

    /// Give a dead letter a fresh set of attempts.
    ///
    /// The dead letter may be older than writes to the same entity that were
    /// confirmed since, so it is not replayed as it was: it carries the
    /// entity's current local state and moves to the back of the line.
    pub fn retry_dead_letter(&mut self, id: &str, replay: Replay) -> Result<&MutationRecord> {
        let seq = self.next_seq;
        let record = self
            .entries
            .get_mut(id)
            .ok_or_else(|| Error::MutationNotFound(id.to_string()))?;
        if record.status != MutationStatus::DeadLetter {
            return Err(state_error(record, "deadLetter"));
        }

        match replay.current {
            Some(payload) => {
                if record.operation == MutationOp::Delete {
                    record.operation = MutationOp::Update;
                }
                record.payload = payload;
            }
            None => record.operation = MutationOp::Delete,
        }
        record.base_server_ts = replay.base_server_ts;
        record.created_at = replay.at;
        record.seq = seq;
        record.status = MutationStatus::Pending;
        record.attempt_count = 0;
        record.last_error = None;
        self.next_seq += 1;
        Ok(record)
    }

    /// Drop a dead letter for good.
    pub fn discard(&mut self, id: &str) -> Result<MutationRecord> {
        let record = self.entry_mut(id)?;
        if record.status != MutationStatus::DeadLetter {
            return Err(state_error(record, "deadLetter"));
        }
        self.remove(id)
    }

    /// Remove a mutation whatever its state. Used to roll back an enqueue
    /// that could not be persisted.
    pub fn withdraw(&mut self, id: &str) -> Option<MutationRecord> {
        self.entries.remove(id)
    }

    /// Return every in-flight mutation to the line without charging an
    /// attempt.
    pub fn release_all(&mut self) -> Vec<MutationRecord> {
        let mut released = Vec::new();
        for record in self.entries.values_mut() {
            if record.status == MutationStatus::InFlight {
                record.status = idle_status(record.attempt_count);
                released.push(record.clone());
            }
        }
        released
    }

    pub fn iter(&self) -> impl Iterator<Item = &MutationRecord> {
        self.entries.values()
    }

    fn entry_mut(&mut self, id: &str) -> Result<&mut MutationRecord> {
        self.entries
            .get_mut(id)
            .ok_or_else(|| Error::MutationNotFound(id.to_string()))
    }

    fn expect_in_flight(&mut self, id: &str) -> Result<&mut MutationRecord> {
        let record = self.entry_mut(id)?;
        if record.status != MutationStatus::InFlight {
            return Err(state_error(record, "inFlight"));
        }
        Ok(record)
    }

    fn remove(&mut self, id: &str) -> Result<MutationRecord> {
        self.entries
            .remove(id)
            .ok_or_else(|| Error::MutationNotFound(id.to_string()))
    }
}

fn idle_status(attempt_count: u32) -> MutationStatus {
    if attempt_count == 0 {
        MutationStatus::Pending
    } else {
        MutationStatus::Failed
    }
}

fn state_error(record: &MutationRecord, expected: &str) -> Error {
    Error::InvalidMutationState {
        id: record.id.clone(),
        expected: expected.to_string(),
        actual: record.status.to_string(),
    }
}
