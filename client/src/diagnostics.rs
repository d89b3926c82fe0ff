//! Health checks over the sync machinery.
//!
//! [`DiagnosticsLog`] collects the things the coordinator resolves on its
//! own and never shows the user (conflicts, rejected mutations) so an
//! operator can still find them. `run_diagnostics` turns that plus the queue
//! and store state into a list of [`DiagnosticResult`]s.

use chrono::{DateTime, Utc};
use rollcall_engine::{EntityId, EntityType, MutationId, MutationRecord};
use serde::Serialize;
use std::collections::VecDeque;
use std::sync::{Mutex, MutexGuard};

/// How many conflicts and rejections are kept for display.
const RECENT_LIMIT: usize = 50;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum CheckStatus {
    Ok,
    Warning,
    Error,
}

/// Outcome of one check.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DiagnosticResult {
    pub check: String,
    pub status: CheckStatus,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<serde_json::Value>,
}

impl DiagnosticResult {
    pub fn ok(check: &str, message: impl Into<String>) -> Self {
        Self::new(check, CheckStatus::Ok, message)
    }

    pub fn warning(check: &str, message: impl Into<String>) -> Self {
        Self::new(check, CheckStatus::Warning, message)
    }

    pub fn error(check: &str, message: impl Into<String>) -> Self {
        Self::new(check, CheckStatus::Error, message)
    }

    fn new(check: &str, status: CheckStatus, message: impl Into<String>) -> Self {
        Self {
            check: check.to_string(),
            status,
            message: message.into(),
            details: None,
        }
    }

    pub fn with_details(mut self, details: serde_json::Value) -> Self {
        self.details = Some(details);
        self
    }
}

/// A remote write that overwrote a change it had not seen.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ConflictEntry {
    pub mutation_id: MutationId,
    pub entity_type: EntityType,
    pub entity_id: EntityId,
    pub server_ts: DateTime<Utc>,
}

/// A mutation the remote store refused outright.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RejectedEntry {
    pub mutation_id: MutationId,
    pub entity_type: EntityType,
    pub entity_id: EntityId,
    pub reason: String,
    pub rejected_at: DateTime<Utc>,
}

#[derive(Debug, Default)]
struct LogState {
    conflict_count: u64,
    conflicts: VecDeque<ConflictEntry>,
    rejected: VecDeque<RejectedEntry>,
}

#[derive(Debug, Default)]
pub struct DiagnosticsLog {
    state: Mutex<LogState>,
}

impl DiagnosticsLog {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, LogState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn record_conflict(&self, record: &MutationRecord, server_ts: DateTime<Utc>) {
        let mut state = self.state();
        state.conflict_count += 1;
        push_bounded(
            &mut state.conflicts,
            ConflictEntry {
                mutation_id: record.id.clone(),
                entity_type: record.entity_type,
                entity_id: record.entity_id.clone(),
                server_ts,
            },
        );
    }

    pub fn record_rejection(&self, record: &MutationRecord, reason: &str, at: DateTime<Utc>) {
        push_bounded(
            &mut self.state().rejected,
            RejectedEntry {
                mutation_id: record.id.clone(),
                entity_type: record.entity_type,
                entity_id: record.entity_id.clone(),
                reason: reason.to_string(),
                rejected_at: at,
            },
        );
    }

    pub fn conflict_count(&self) -> u64 {
        self.state().conflict_count
    }

    pub fn recent_conflicts(&self) -> Vec<ConflictEntry> {
        self.state().conflicts.iter().cloned().collect()
    }

    pub fn rejected(&self) -> Vec<RejectedEntry> {
        self.state().rejected.iter().cloned().collect()
    }
}

fn push_bounded<T>(list: &mut VecDeque<T>, item: T) {
    if list.len() == RECENT_LIMIT {
        list.pop_front();
    }
    list.push_back(item);
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use rollcall_engine::MutationOp;
    use serde_json::json;

    fn record(id: &str) -> MutationRecord {
        MutationRecord::new(
            id,
            EntityType::Attendance,
            "S1:2024-07-15",
            MutationOp::Create,
            json!({}),
            Utc.with_ymd_and_hms(2024, 7, 15, 0, 0, 0).unwrap(),
        )
    }

    #[test]
    fn keeps_recent_entries_and_total_count() {
        let log = DiagnosticsLog::new();
        for i in 0..(RECENT_LIMIT + 5) {
            log.record_conflict(&record(&format!("m{i}")), Utc::now());
        }
        assert_eq!(log.conflict_count(), (RECENT_LIMIT + 5) as u64);
        let recent = log.recent_conflicts();
        assert_eq!(recent.len(), RECENT_LIMIT);
        assert_eq!(recent[0].mutation_id, "m5");
    }

    #[test]
    fn result_serialization() {
        let result = DiagnosticResult::warning("deadLetters", "1 dead-lettered mutation")
            .with_details(json!([{"id": "m1"}]));
        let json = serde_json::to_value(&result).unwrap();
        assert_eq!(json["status"], "warning");
        assert_eq!(json["check"], "deadLetters");
        assert_eq!(json["details"][0]["id"], "m1");

        let json = serde_json::to_value(DiagnosticResult::ok("mode", "local")).unwrap();
        assert!(json.get("details").is_none());
    }

    #[test]
    fn rejections_are_listed() {
        let log = DiagnosticsLog::new();
        log.record_rejection(&record("m1"), "bad payload", Utc::now());
        let rejected = log.rejected();
        assert_eq!(rejected.len(), 1);
        assert_eq!(rejected[0].reason, "bad payload");
    }
}
