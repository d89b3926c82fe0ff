//! Remote Store Adapter.
//!
//! The remote store is the authoritative copy shared by every device. It
//! accepts writes, answers queries and pushes row changes through a change
//! feed. Conflicts are not merged: the last write by server timestamp wins,
//! and a write that overwrote a change it had not seen is flagged so the
//! caller can log it.

mod memory;
mod postgres;

pub use memory::MemoryRemoteStore;
pub use postgres::PgRemoteStore;

use crate::error::RemoteError;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rollcall_engine::{EntityId, EntityType, MutationId, MutationOp, MutationRecord, Query};
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

/// Result type for remote calls.
pub type RemoteResult<T> = std::result::Result<T, RemoteError>;

/// Outcome of an accepted write.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RemoteWrite {
    pub server_ts: DateTime<Utc>,
    /// The row had changed since the copy this write was based on.
    pub conflicted: bool,
}

/// A row as stored remotely.
#[derive(Debug, Clone, PartialEq)]
pub struct RemoteRow {
    pub entity_type: EntityType,
    pub entity_id: EntityId,
    pub payload: serde_json::Value,
    /// Mutation that last wrote the row.
    pub mutation_id: Option<MutationId>,
    pub deleted: bool,
    pub server_ts: DateTime<Utc>,
}

/// Callback invoked for each change pushed by the feed.
pub type ChangeCallback = Arc<dyn Fn(RemoteRow) + Send + Sync>;

/// Handle to a change-feed subscription. Dropping it unsubscribes.
#[must_use = "dropping the subscription cancels it"]
pub struct ChangeSubscription {
    cancel: Option<Box<dyn FnOnce() + Send + Sync>>,
}

impl ChangeSubscription {
    pub fn new(cancel: impl FnOnce() + Send + Sync + 'static) -> Self {
        Self {
            cancel: Some(Box::new(cancel)),
        }
    }

    /// Stop receiving changes. Safe to call more than once.
    pub fn unsubscribe(&mut self) {
        if let Some(cancel) = self.cancel.take() {
            cancel();
        }
    }

    pub fn is_active(&self) -> bool {
        self.cancel.is_some()
    }
}

impl Drop for ChangeSubscription {
    fn drop(&mut self) {
        self.unsubscribe();
    }
}

impl fmt::Debug for ChangeSubscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ChangeSubscription")
            .field("active", &self.is_active())
            .finish()
    }
}

/// Client for the remote backend.
///
/// Writes take the [`MutationRecord`] that produced them so the remote row can
/// remember which mutation last wrote it; that id comes back through the
/// change feed and lets devices recognise their own echoes.
#[async_trait]
pub trait RemoteStore: Send + Sync + fmt::Debug {
    async fn create(&self, write: &MutationRecord) -> RemoteResult<RemoteWrite>;

    async fn update(&self, write: &MutationRecord) -> RemoteResult<RemoteWrite>;

    async fn delete(&self, write: &MutationRecord) -> RemoteResult<RemoteWrite>;

    /// Live rows of a type matching `query`.
    async fn query(&self, entity_type: EntityType, query: &Query) -> RemoteResult<Vec<RemoteRow>>;

    /// Cheap reachability check.
    async fn probe(&self) -> RemoteResult<()>;

    /// Push every change to rows of `entity_type` (all types if `None`)
    /// whose payload matches `filter` to `callback`.
    async fn subscribe_to_changes(
        &self,
        entity_type: Option<EntityType>,
        filter: Query,
        callback: ChangeCallback,
    ) -> RemoteResult<ChangeSubscription>;

    /// Dispatch a mutation to the matching write call.
    async fn apply(&self, write: &MutationRecord) -> RemoteResult<RemoteWrite> {
        match write.operation {
            MutationOp::Create => self.create(write).await,
            MutationOp::Update => self.update(write).await,
            MutationOp::Delete => self.delete(write).await,
        }
    }
}

/// Run a remote call under a deadline. Exceeding it is a connectivity
/// failure, never a hang.
pub async fn bounded<T>(
    timeout: Duration,
    call: impl Future<Output = RemoteResult<T>>,
) -> RemoteResult<T> {
    match tokio::time::timeout(timeout, call).await {
        Ok(result) => result,
        Err(_) => Err(RemoteError::Timeout(timeout)),
    }
}

/// Whether a write overwrote a change it had not seen.
///
/// `previous` is the row's last writer and timestamp before the write. A
/// replay of the same mutation is never a conflict.
pub(crate) fn is_conflict(
    previous: Option<(Option<&str>, DateTime<Utc>)>,
    write: &MutationRecord,
) -> bool {
    match previous {
        None => false,
        Some((Some(mutation_id), _)) if mutation_id == write.id => false,
        Some((_, prev_ts)) => match write.base_server_ts {
            Some(base) => prev_ts > base,
            None => true,
        },
    }
}

/// Whether a pushed row passes a subscription's filters.
pub(crate) fn change_matches(
    row: &RemoteRow,
    entity_type: Option<EntityType>,
    filter: &Query,
) -> bool {
    entity_type.map_or(true, |t| t == row.entity_type)
        && (filter.filters().is_empty() || filter.matches(&row.payload))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn ts(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(1_720_000_000 + secs, 0).unwrap()
    }

    fn write(base: Option<DateTime<Utc>>) -> MutationRecord {
        MutationRecord::new(
            "m1",
            EntityType::Student,
            "S1",
            MutationOp::Update,
            json!({"id": "S1"}),
            ts(0),
        )
        .with_base_server_ts(base)
    }

    #[test]
    fn conflict_detection() {
        assert!(!is_conflict(None, &write(None)));
        assert!(!is_conflict(Some((Some("m1"), ts(9))), &write(None)));
        assert!(is_conflict(Some((Some("m0"), ts(9))), &write(None)));
        assert!(is_conflict(Some((None, ts(9))), &write(Some(ts(5)))));
        assert!(!is_conflict(Some((None, ts(5))), &write(Some(ts(5)))));
    }

    #[test]
    fn change_filtering() {
        let row = RemoteRow {
            entity_type: EntityType::Attendance,
            entity_id: "S1:2024-07-15".into(),
            payload: json!({"studentId": "S1"}),
            mutation_id: None,
            deleted: false,
            server_ts: ts(0),
        };
        assert!(change_matches(&row, None, &Query::all()));
        assert!(change_matches(&row, Some(EntityType::Attendance), &Query::all()));
        assert!(!change_matches(&row, Some(EntityType::Student), &Query::all()));
        assert!(!change_matches(
            &row,
            None,
            &Query::all().eq("studentId", "S2")
        ));
    }

    #[test]
    fn subscription_cancels_once() {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        let mut sub = ChangeSubscription::new(move || {
            counter.fetch_add(1, Ordering::SeqCst);
        });
        sub.unsubscribe();
        sub.unsubscribe();
        drop(sub);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn bounded_times_out() {
        let result: RemoteResult<()> = bounded(Duration::from_millis(50), async {
            tokio::time::sleep(Duration::from_secs(10)).await;
            Ok(())
        })
        .await;
        assert_eq!(result, Err(RemoteError::Timeout(Duration::from_millis(50))));
    }
}
