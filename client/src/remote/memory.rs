//! In-memory remote store with failure injection.
//!
//! Behaves like the Postgres backend (last write wins, server timestamps,
//! change feed) without a database, and can be told to go offline, fail
//! writes for particular entities or respond slowly.

use super::{
    change_matches, is_conflict, ChangeCallback, ChangeSubscription, RemoteResult, RemoteRow,
    RemoteStore, RemoteWrite,
};
use crate::error::RemoteError;
use async_trait::async_trait;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use dashmap::DashMap;
use rollcall_engine::{EntityType, MutationId, MutationOp, MutationRecord, Query};
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

struct Subscriber {
    entity_type: Option<EntityType>,
    filter: Query,
    callback: ChangeCallback,
}

#[derive(Default)]
struct State {
    rows: BTreeMap<(EntityType, String), RemoteRow>,
    /// Mutation ids in the order they were applied.
    applied: Vec<MutationId>,
    last_ts: Option<DateTime<Utc>>,
    failing: HashMap<String, RemoteError>,
    latency: Duration,
}

#[derive(Default)]
struct Inner {
    state: Mutex<State>,
    subscribers: DashMap<u64, Subscriber>,
    next_subscriber: AtomicU64,
    offline: AtomicBool,
}

/// A [`RemoteStore`] held in memory. Clones share the same data.
#[derive(Clone, Default)]
pub struct MemoryRemoteStore {
    inner: Arc<Inner>,
}

impl fmt::Debug for MemoryRemoteStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MemoryRemoteStore")
            .field("offline", &self.inner.offline.load(Ordering::SeqCst))
            .field("subscribers", &self.inner.subscribers.len())
            .finish()
    }
}

impl MemoryRemoteStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Simulate losing or regaining the network.
    pub fn set_online(&self, online: bool) {
        self.inner.offline.store(!online, Ordering::SeqCst);
    }

    /// Make every write to `entity_id` fail with `error` until healed.
    pub fn fail_entity(&self, entity_id: impl Into<String>, error: RemoteError) {
        self.state().failing.insert(entity_id.into(), error);
    }

    pub fn heal_entity(&self, entity_id: &str) {
        self.state().failing.remove(entity_id);
    }

    /// Delay every call by `latency`.
    pub fn set_latency(&self, latency: Duration) {
        self.state().latency = latency;
    }

    /// Mutation ids in the order they reached the store.
    pub fn applied(&self) -> Vec<MutationId> {
        self.state().applied.clone()
    }

    pub fn row(&self, entity_type: EntityType, entity_id: &str) -> Option<RemoteRow> {
        self.state()
            .rows
            .get(&(entity_type, entity_id.to_string()))
            .cloned()
    }

    pub fn subscriber_count(&self) -> usize {
        self.inner.subscribers.len()
    }

    /// Write a row as another device would, pushing it through the feed.
    pub fn push_external(
        &self,
        entity_type: EntityType,
        entity_id: &str,
        payload: serde_json::Value,
        mutation_id: Option<&str>,
    ) -> RemoteRow {
        let row = {
            let mut state = self.state();
            let server_ts = next_ts(&mut state);
            let row = RemoteRow {
                entity_type,
                entity_id: entity_id.to_string(),
                payload,
                mutation_id: mutation_id.map(str::to_string),
                deleted: false,
                server_ts,
            };
            state
                .rows
                .insert((entity_type, entity_id.to_string()), row.clone());
            row
        };
        self.notify(&row);
        row
    }

    fn state(&self) -> MutexGuard<'_, State> {
        self.inner.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    async fn enter(&self) -> RemoteResult<()> {
        let latency = self.state().latency;
        if !latency.is_zero() {
            tokio::time::sleep(latency).await;
        }
        if self.inner.offline.load(Ordering::SeqCst) {
            return Err(RemoteError::Connectivity("network unreachable".into()));
        }
        Ok(())
    }

    async fn write(&self, write: &MutationRecord) -> RemoteResult<RemoteWrite> {
        self.enter().await?;

        let (row, result) = {
            let mut state = self.state();
            if let Some(err) = state.failing.get(&write.entity_id) {
                return Err(err.clone());
            }

            let key = (write.entity_type, write.entity_id.clone());
            let previous = state
                .rows
                .get(&key)
                .map(|r| (r.mutation_id.clone(), r.server_ts));
            let conflicted = is_conflict(
                previous.as_ref().map(|(m, ts)| (m.as_deref(), *ts)),
                write,
            );

            let server_ts = next_ts(&mut state);
            let deleted = write.operation == MutationOp::Delete;
            let payload = if deleted {
                state
                    .rows
                    .get(&key)
                    .map(|r| r.payload.clone())
                    .unwrap_or_else(|| serde_json::json!({}))
            } else {
                write.payload.clone()
            };

            let row = RemoteRow {
                entity_type: write.entity_type,
                entity_id: write.entity_id.clone(),
                payload,
                mutation_id: Some(write.id.clone()),
                deleted,
                server_ts,
            };
            state.rows.insert(key, row.clone());
            state.applied.push(write.id.clone());
            (
                row,
                RemoteWrite {
                    server_ts,
                    conflicted,
                },
            )
        };

        self.notify(&row);
        Ok(result)
    }

    fn notify(&self, row: &RemoteRow) {
        let callbacks: Vec<ChangeCallback> = self
            .inner
            .subscribers
            .iter()
            .filter(|s| change_matches(row, s.entity_type, &s.filter))
            .map(|s| s.callback.clone())
            .collect();
        for callback in callbacks {
            callback(row.clone());
        }
    }
}

/// Strictly increasing server clock.
fn next_ts(state: &mut State) -> DateTime<Utc> {
    let now = Utc::now();
    let ts = match state.last_ts {
        Some(last) if now <= last => last + ChronoDuration::microseconds(1),
        _ => now,
    };
    state.last_ts = Some(ts);
    ts
}

#[async_trait]
impl RemoteStore for MemoryRemoteStore {
    async fn create(&self, write: &MutationRecord) -> RemoteResult<RemoteWrite> {
        self.write(write).await
    }

    async fn update(&self, write: &MutationRecord) -> RemoteResult<RemoteWrite> {
        self.write(write).await
    }

    async fn delete(&self, write: &MutationRecord) -> RemoteResult<RemoteWrite> {
        self.write(write).await
    }

    async fn query(&self, entity_type: EntityType, query: &Query) -> RemoteResult<Vec<RemoteRow>> {
        self.enter().await?;
        let limit = query.max_results().unwrap_or(usize::MAX);
        Ok(self
            .state()
            .rows
            .values()
            .filter(|r| r.entity_type == entity_type && !r.deleted && query.matches(&r.payload))
            .take(limit)
            .cloned()
            .collect())
    }

    async fn probe(&self) -> RemoteResult<()> {
        self.enter().await
    }

    async fn subscribe_to_changes(
        &self,
        entity_type: Option<EntityType>,
        filter: Query,
        callback: ChangeCallback,
    ) -> RemoteResult<ChangeSubscription> {
        self.enter().await?;
        let id = self.inner.next_subscriber.fetch_add(1, Ordering::SeqCst);
        self.inner.subscribers.insert(
            id,
            Subscriber {
                entity_type,
                filter,
                callback,
            },
        );

        let inner = Arc::downgrade(&self.inner);
        Ok(ChangeSubscription::new(move || {
            if let Some(inner) = inner.upgrade() {
                inner.subscribers.remove(&id);
            }
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use serde_json::json;

    fn mutation(id: &str, entity: &str, op: MutationOp) -> MutationRecord {
        MutationRecord::new(
            id,
            EntityType::Student,
            entity,
            op,
            json!({"id": entity, "name": "Ayu", "className": "7A"}),
            Utc.with_ymd_and_hms(2024, 7, 15, 0, 0, 0).unwrap(),
        )
    }

    #[tokio::test]
    async fn writes_are_ordered_and_timestamped() {
        let remote = MemoryRemoteStore::new();
        let a = remote
            .create(&mutation("m1", "S1", MutationOp::Create))
            .await
            .unwrap();
        let b = remote
            .update(&mutation("m2", "S1", MutationOp::Update))
            .await
            .unwrap();
        assert!(b.server_ts > a.server_ts);
        assert_eq!(remote.applied(), vec!["m1", "m2"]);
        assert_eq!(
            remote.row(EntityType::Student, "S1").unwrap().mutation_id.as_deref(),
            Some("m2")
        );
    }

    #[tokio::test]
    async fn offline_fails_with_connectivity() {
        let remote = MemoryRemoteStore::new();
        remote.set_online(false);
        let err = remote.probe().await.unwrap_err();
        assert!(err.is_connectivity());
        remote.set_online(true);
        remote.probe().await.unwrap();
    }

    #[tokio::test]
    async fn injected_failures() {
        let remote = MemoryRemoteStore::new();
        remote.fail_entity("S1", RemoteError::Transient("500".into()));
        let err = remote
            .create(&mutation("m1", "S1", MutationOp::Create))
            .await
            .unwrap_err();
        assert_eq!(err, RemoteError::Transient("500".into()));
        remote
            .create(&mutation("m2", "S2", MutationOp::Create))
            .await
            .unwrap();

        remote.heal_entity("S1");
        remote
            .create(&mutation("m3", "S1", MutationOp::Create))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn delete_leaves_tombstone() {
        let remote = MemoryRemoteStore::new();
        remote
            .create(&mutation("m1", "S1", MutationOp::Create))
            .await
            .unwrap();
        remote
            .delete(&mutation("m2", "S1", MutationOp::Delete))
            .await
            .unwrap();
        assert!(remote.row(EntityType::Student, "S1").unwrap().deleted);
        assert!(remote
            .query(EntityType::Student, &Query::all())
            .await
            .unwrap()
            .is_empty());
    }

    #[tokio::test]
    async fn overwriting_unseen_change_is_a_conflict() {
        let remote = MemoryRemoteStore::new();
        remote.push_external(EntityType::Student, "S1", json!({"id": "S1"}), None);
        let write = remote
            .update(&mutation("m1", "S1", MutationOp::Update))
            .await
            .unwrap();
        assert!(write.conflicted);

        // Replaying the same mutation is not.
        let write = remote
            .update(&mutation("m1", "S1", MutationOp::Update))
            .await
            .unwrap();
        assert!(!write.conflicted);
    }

    #[tokio::test]
    async fn change_feed_delivers_until_unsubscribed() {
        let remote = MemoryRemoteStore::new();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        let mut sub = remote
            .subscribe_to_changes(
                Some(EntityType::Student),
                Query::all(),
                Arc::new(move |row: RemoteRow| sink.lock().unwrap().push(row.entity_id)),
            )
            .await
            .unwrap();

        remote
            .create(&mutation("m1", "S1", MutationOp::Create))
            .await
            .unwrap();
        sub.unsubscribe();
        remote
            .create(&mutation("m2", "S2", MutationOp::Create))
            .await
            .unwrap();

        assert_eq!(*seen.lock().unwrap(), vec!["S1".to_string()]);
        assert_eq!(remote.subscriber_count(), 0);
    }
}
