//! Connectivity state machine.
//!
//! ```text
//!            begin_cycle                 cycle_completed(ok)
//!   online ─────────────▶ syncing ─────────────────────────▶ online
//!     │                     │
//!     │ connectivity_lost   │ probe_failed / cycle_completed(lost)
//!     ▼                     ▼
//!   offline ◀───────────────┘
//!     │
//!     │ begin_cycle (after backoff elapses)
//!     ▼
//!   syncing
//! ```
//!
//! The machine only records state; the caller owns timers. [`SyncMachine::next_wake`]
//! tells it how long to sleep before the next cycle.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

/// Connectivity status shown to every screen.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SyncStatus {
    Online,
    Offline,
    Syncing,
}

impl fmt::Display for SyncStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            SyncStatus::Online => "online",
            SyncStatus::Offline => "offline",
            SyncStatus::Syncing => "syncing",
        };
        f.write_str(s)
    }
}

/// Observable sync state; one per running engine.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncState {
    pub status: SyncStatus,
    pub pending_count: usize,
    pub last_error: Option<String>,
    pub last_synced_at: Option<DateTime<Utc>>,
}

impl Default for SyncState {
    /// Engines start offline until the first probe succeeds.
    fn default() -> Self {
        Self {
            status: SyncStatus::Offline,
            pending_count: 0,
            last_error: None,
            last_synced_at: None,
        }
    }
}

/// Capped exponential backoff.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Backoff {
    base: Duration,
    max: Duration,
    failures: u32,
}

impl Backoff {
    pub fn new(base: Duration, max: Duration) -> Self {
        Self {
            base,
            max: max.max(base),
            failures: 0,
        }
    }

    /// Consecutive failures recorded since the last reset.
    pub fn failures(&self) -> u32 {
        self.failures
    }

    pub fn record_failure(&mut self) {
        self.failures = self.failures.saturating_add(1);
    }

    pub fn reset(&mut self) {
        self.failures = 0;
    }

    /// Delay before the next attempt: zero with no failures, then
    /// `base * 2^(failures - 1)` capped at `max`.
    pub fn delay(&self) -> Duration {
        if self.failures == 0 {
            return Duration::ZERO;
        }
        let exp = (self.failures - 1).min(31);
        self.base
            .checked_mul(1u32 << exp)
            .map_or(self.max, |d| d.min(self.max))
    }
}

/// Result of a finished flush cycle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CycleEnd {
    /// Every attempt reached the remote store (some may have failed there).
    Reachable,
    /// An attempt failed with a connectivity error.
    ConnectivityLost(String),
}

/// The sync state machine.
#[derive(Debug, Clone)]
pub struct SyncMachine {
    state: SyncState,
    backoff: Backoff,
}

impl SyncMachine {
    pub fn new(backoff: Backoff) -> Self {
        Self {
            state: SyncState::default(),
            backoff,
        }
    }

    pub fn state(&self) -> &SyncState {
        &self.state
    }

    pub fn status(&self) -> SyncStatus {
        self.state.status
    }

    pub fn backoff(&self) -> &Backoff {
        &self.backoff
    }

    pub fn set_pending(&mut self, pending: usize) {
        self.state.pending_count = pending;
    }

    /// `online|offline → syncing`. Returns false if a cycle is already running.
    pub fn begin_cycle(&mut self) -> bool {
        if self.state.status == SyncStatus::Syncing {
            return false;
        }
        self.state.status = SyncStatus::Syncing;
        true
    }

    /// The probe at the start of a cycle failed: `syncing → offline`.
    pub fn probe_failed(&mut self, error: impl Into<String>) {
        self.go_offline(error.into());
    }

    /// A write outside a cycle hit a connectivity error: `online → offline`.
    pub fn connectivity_lost(&mut self, error: impl Into<String>) {
        self.go_offline(error.into());
    }

    /// The cycle finished: back to `online`, or `offline` if connectivity
    /// dropped midway.
    pub fn cycle_completed(&mut self, end: CycleEnd, now: DateTime<Utc>) {
        match end {
            CycleEnd::Reachable => {
                self.state.status = SyncStatus::Online;
                self.state.last_error = None;
                self.state.last_synced_at = Some(now);
                self.backoff.reset();
            }
            CycleEnd::ConnectivityLost(error) => self.go_offline(error),
        }
    }

    /// Abandon a cycle that never got to probe, restoring the status it
    /// started from.
    pub fn abort_cycle(&mut self, previous: SyncStatus) {
        if self.state.status == SyncStatus::Syncing {
            self.state.status = previous;
        }
    }

    /// How long to wait before the next cycle.
    pub fn next_wake(&self, flush_interval: Duration) -> Duration {
        match self.state.status {
            SyncStatus::Offline => self.backoff.delay(),
            SyncStatus::Online | SyncStatus::Syncing => flush_interval,
        }
    }

    fn go_offline(&mut self, error: String) {
        self.state.status = SyncStatus::Offline;
        self.state.last_error = Some(error);
        self.backoff.record_failure();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn machine() -> SyncMachine {
        SyncMachine::new(Backoff::new(
            Duration::from_secs(1),
            Duration::from_secs(60),
        ))
    }

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 7, 15, 0, 0, 0).unwrap()
    }

    #[test]
    fn starts_offline_with_immediate_wake() {
        let m = machine();
        assert_eq!(m.status(), SyncStatus::Offline);
        assert_eq!(m.next_wake(Duration::from_secs(15)), Duration::ZERO);
    }

    #[test]
    fn successful_cycle_goes_online() {
        let mut m = machine();
        assert!(m.begin_cycle());
        assert_eq!(m.status(), SyncStatus::Syncing);
        assert!(!m.begin_cycle());

        m.cycle_completed(CycleEnd::Reachable, now());
        assert_eq!(m.status(), SyncStatus::Online);
        assert_eq!(m.state().last_synced_at, Some(now()));
        assert_eq!(m.next_wake(Duration::from_secs(15)), Duration::from_secs(15));
    }

    #[test]
    fn probe_failure_goes_offline_and_backs_off() {
        let mut m = machine();
        m.begin_cycle();
        m.probe_failed("timeout");
        assert_eq!(m.status(), SyncStatus::Offline);
        assert_eq!(m.state().last_error.as_deref(), Some("timeout"));
        assert_eq!(m.next_wake(Duration::from_secs(15)), Duration::from_secs(1));

        m.begin_cycle();
        m.probe_failed("timeout");
        assert_eq!(m.next_wake(Duration::from_secs(15)), Duration::from_secs(2));
    }

    #[test]
    fn connectivity_lost_mid_cycle() {
        let mut m = machine();
        m.begin_cycle();
        m.cycle_completed(CycleEnd::ConnectivityLost("reset".into()), now());
        assert_eq!(m.status(), SyncStatus::Offline);
        assert_eq!(m.state().last_synced_at, None);
    }

    #[test]
    fn recovery_resets_backoff() {
        let mut m = machine();
        for _ in 0..3 {
            m.begin_cycle();
            m.probe_failed("down");
        }
        assert_eq!(m.backoff().failures(), 3);

        m.begin_cycle();
        m.cycle_completed(CycleEnd::Reachable, now());
        assert_eq!(m.backoff().failures(), 0);
        assert_eq!(m.state().last_error, None);
    }

    #[test]
    fn abort_restores_previous_status() {
        let mut m = machine();
        m.begin_cycle();
        m.abort_cycle(SyncStatus::Offline);
        assert_eq!(m.status(), SyncStatus::Offline);
    }

    #[test]
    fn backoff_is_capped() {
        let mut b = Backoff::new(Duration::from_secs(1), Duration::from_secs(60));
        let delays: Vec<_> = (0..10)
            .map(|_| {
                b.record_failure();
                b.delay().as_secs()
            })
            .collect();
        assert_eq!(delays, vec![1, 2, 4, 8, 16, 32, 60, 60, 60, 60]);

        for _ in 0..100 {
            b.record_failure();
        }
        assert_eq!(b.delay(), Duration::from_secs(60));
    }

    #[test]
    fn state_serialization() {
        let state = SyncState::default();
        let json = serde_json::to_value(&state).unwrap();
        assert_eq!(json["status"], "offline");
        assert_eq!(json["pendingCount"], 0);
    }
}
