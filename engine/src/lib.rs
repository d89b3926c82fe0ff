//! # Rollcall Engine
//!
//! Domain logic for an offline-first school attendance client.
//!
//! This crate holds everything about Rollcall's data layer that can be decided
//! without touching the outside world: which records exist and how they are
//! validated, how pending writes are ordered and retried, how the connectivity
//! state machine moves, which events reach which screens, and how a kiosk scan
//! becomes a `present` or `late` mark. The `rollcall-client` crate wires these
//! pieces to disk, to Postgres and to a tokio runtime.
//!
//! ## Design Principles
//!
//! - **No IO**: no files, sockets, threads or timers
//! - **Injectable time**: anything that needs "now" takes a [`Clock`]
//! - **Testable**: pure state transitions, no mocks needed
//!
//! ## Core Concepts
//!
//! ### Entities
//!
//! Every stored record is an [`Entity`] of some [`EntityType`], persisted as a
//! JSON payload and checked against the [`Schema`] before it is committed.
//! Indexed fields answer [`Query`] predicates without a scan.
//!
//! ### Mutation queue
//!
//! Local writes become [`MutationRecord`]s. The [`MutationQueue`] groups them
//! per entity, keeps each group in submission order and applies the retry
//! cap: a mutation that keeps failing is dead-lettered instead of blocking
//! the writes behind it.
//!
//! ### Sync state
//!
//! [`SyncMachine`] owns the `online`/`offline`/`syncing` transitions and the
//! capped exponential [`Backoff`] used while offline.
//!
//! ### Events
//!
//! Committed writes become [`DomainEvent`]s. An [`EventFilter`] decides which
//! subscriptions see an event and the [`DedupLog`] makes sure each event id
//! is delivered once, even when the remote change feed echoes a local write.
//!
//! ### Attendance
//!
//! [`AttendancePolicy`] turns a scan time into a status and minutes late.
//!
//! ## Quick Start
//!
//! ```rust
//! use rollcall_engine::{
//!     AttendancePolicy, AttendanceStatus, EntityType, MutationOp, MutationQueue,
//!     MutationRecord,
//! };
//! use chrono::{NaiveTime, Utc};
//! use serde_json::json;
//!
//! let policy = AttendancePolicy::new(NaiveTime::from_hms_opt(7, 0, 0).unwrap(), 10);
//! let eval = policy.evaluate(NaiveTime::from_hms_opt(7, 15, 0).unwrap());
//! assert_eq!(eval.status, AttendanceStatus::Late);
//! assert_eq!(eval.minutes_late, 5);
//!
//! let mut queue = MutationQueue::new(5);
//! queue.enqueue(MutationRecord::new(
//!     "m1",
//!     EntityType::Student,
//!     "S1",
//!     MutationOp::Create,
//!     json!({"id": "S1", "name": "Ayu", "className": "7A"}),
//!     Utc::now(),
//! ));
//! assert_eq!(queue.plan().len(), 1);
//! ```

pub mod attendance;
pub mod clock;
pub mod entity;
pub mod error;
pub mod event;
pub mod mutation;
pub mod query;
pub mod schema;
pub mod sync_state;

// Re-export main types at crate root
pub use attendance::{
    absentees, attendance_id, AttendancePolicy, AttendanceRecord, AttendanceSnapshot,
    AttendanceStats, AttendanceStatus, ClassTally, DailySummary, Evaluation,
};
pub use clock::{Clock, ManualClock, SystemClock};
pub use entity::{
    from_payload, payload_id, to_payload, Class, Entity, EntityType, ExitRecord, Notification,
    Role, Settings, Student, User, ViolationRecord,
};
pub use error::Error;
pub use event::{Admission, Audience, DedupLog, DomainEvent, EventFilter, Origin};
pub use mutation::{
    FailOutcome, FlushGroup, MutationOp, MutationQueue, MutationRecord, MutationStatus, Replay,
};
pub use query::{Filter, IndexKey, Query};
pub use schema::{EntitySchema, FieldDef, FieldType, Schema};
pub use sync_state::{Backoff, CycleEnd, SyncMachine, SyncState, SyncStatus};

/// Type aliases for clarity
pub type EntityId = String;
pub type MutationId = String;
pub type EventId = String;
