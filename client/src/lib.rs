//! # Rollcall Client
//!
//! Offline-first data layer for school attendance. Writes commit to a
//! durable local store first and are synced to a remote Postgres backend in
//! the background; screens observe changes through an event bus that
//! delivers each change once, whichever side it came from.
//!
//! [`DataService`] is the entry point:
//!
//! ```no_run
//! # async fn demo() -> rollcall_client::Result<()> {
//! use rollcall_client::DataService;
//! use rollcall_engine::Student;
//!
//! let service = DataService::builder().build()?;
//! service.save_student(&Student::new("S1", "Ayu", "7A"))?;
//! service.preload_for_kiosk().await?;
//! let result = service.mark_attendance_fast("S1").await;
//! assert!(result.success);
//! # Ok(())
//! # }
//! ```
//!
//! The `rollcall-kiosk` binary serves the same service over HTTP and a
//! WebSocket event stream, see [`app`].

pub mod app;
pub mod bus;
pub mod config;
pub mod coordinator;
pub mod diagnostics;
pub mod error;
pub mod facade;
pub mod kiosk;
pub mod local;
pub mod queue;
pub mod remote;
pub mod routes;
pub mod websocket;
mod writer;

pub use app::AppState;
pub use bus::{EventBus, EventCallback, Subscription};
pub use config::{Config, ConfigError, KioskConfig, Mode, SyncConfig};
pub use coordinator::SyncCoordinator;
pub use diagnostics::{CheckStatus, DiagnosticResult, DiagnosticsLog};
pub use error::{Error, RemoteError, Result, StorageError};
pub use facade::{DataService, DataServiceBuilder};
pub use kiosk::{AttendanceResult, ScanStatus};
pub use local::{FileStore, LocalStore, MemoryStore, Table};
pub use queue::DurableQueue;
pub use remote::{
    ChangeCallback, ChangeSubscription, MemoryRemoteStore, PgRemoteStore, RemoteRow, RemoteStore,
    RemoteWrite,
};
pub use writer::Committed;
