//! Attendance Fast-Path Resolver.
//!
//! A kiosk scan must be answered within a fixed budget whether or not the
//! remote store is reachable. The resolver keeps the roster in an
//! [`AttendanceSnapshot`] and resolves scans against it with no IO beyond
//! one local uniqueness lookup and the local commit. Statistics come from a
//! per-student cache; a cold entry is backfilled in the background and the
//! scan reports `statsPending` instead of waiting.
//!
//! [`KioskResolver::mark_confirmed`] is the slower path used outside the
//! kiosk: in cloud mode it only commits once the remote store accepted the
//! record.

use crate::bus::Subscription;
use crate::config::{KioskConfig, Mode};
use crate::error::{Error, Result, StorageError};
use crate::local::{LocalStore, Table};
use crate::remote::{bounded, RemoteStore};
use crate::writer::{record_version, Writer};
use chrono::{DateTime, NaiveDate, NaiveTime, Utc};
use dashmap::DashMap;
use rollcall_engine::{
    attendance_id, from_payload, to_payload, AttendancePolicy, AttendanceRecord,
    AttendanceSnapshot, AttendanceStats, AttendanceStatus, DomainEvent, EntityId, EntityType,
    EventFilter, MutationOp, MutationRecord, Origin, Query, Settings, Student,
};
use serde::Serialize;
use std::sync::{Arc, Mutex, RwLock};
use std::time::{Duration, Instant};

/// Outcome of a scan.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum ScanStatus {
    Present,
    Late,
    /// The student already has a record today; nothing was written.
    AlreadyMarked,
    NotFound,
    /// Nothing was committed.
    Failed,
}

impl From<AttendanceStatus> for ScanStatus {
    fn from(status: AttendanceStatus) -> Self {
        match status {
            AttendanceStatus::Present => ScanStatus::Present,
            AttendanceStatus::Late => ScanStatus::Late,
            // Absences are written by close_day, never by a scan.
            AttendanceStatus::Absent => ScanStatus::AlreadyMarked,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AttendanceResult {
    pub success: bool,
    pub status: ScanStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub student: Option<Student>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub record: Option<AttendanceRecord>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stats: Option<AttendanceStats>,
    /// Stats were not cached yet and are being computed.
    pub stats_pending: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub elapsed_ms: u64,
}

impl AttendanceResult {
    fn new(status: ScanStatus) -> Self {
        Self {
            success: matches!(status, ScanStatus::Present | ScanStatus::Late),
            status,
            student: None,
            record: None,
            stats: None,
            stats_pending: false,
            error: None,
            elapsed_ms: 0,
        }
    }

    fn failed(student: Option<Student>, error: impl ToString) -> Self {
        Self {
            student,
            error: Some(error.to_string()),
            ..Self::new(ScanStatus::Failed)
        }
    }
}

type Roster = RwLock<Option<Arc<AttendanceSnapshot>>>;
type StatsCache = DashMap<EntityId, AttendanceStats>;

pub struct KioskResolver {
    writer: Arc<Writer>,
    remote: Option<Arc<dyn RemoteStore>>,
    remote_timeout: Duration,
    config: KioskConfig,
    roster: Arc<Roster>,
    stats: Arc<StatsCache>,
    /// Makes check-then-commit atomic per resolver.
    commit: tokio::sync::Mutex<()>,
    watchers: Mutex<Vec<Subscription>>,
}

impl std::fmt::Debug for KioskResolver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KioskResolver")
            .field("roster", &self.snapshot().map(|s| s.len()))
            .field("cached_stats", &self.stats.len())
            .finish()
    }
}

impl KioskResolver {
    pub(crate) fn new(
        writer: Arc<Writer>,
        remote: Option<Arc<dyn RemoteStore>>,
        remote_timeout: Duration,
        config: KioskConfig,
    ) -> Self {
        let roster: Arc<Roster> = Arc::new(RwLock::new(None));
        let stats: Arc<StatsCache> = Arc::new(DashMap::new());

        let roster_watch = {
            let roster = Arc::downgrade(&roster);
            writer
                .bus
                .subscribe(EventFilter::all().kind(EntityType::Student), move |event| {
                    if let Some(roster) = roster.upgrade() {
                        apply_roster_change(&roster, event);
                    }
                })
        };
        let stats_watch = {
            let stats = Arc::downgrade(&stats);
            writer
                .bus
                .subscribe(EventFilter::all().kind(EntityType::Attendance), move |event| {
                    // Local scans update the cache themselves.
                    if event.origin == Origin::Local {
                        return;
                    }
                    if let (Some(stats), Some(student_id)) =
                        (stats.upgrade(), event.payload.get("studentId").and_then(|v| v.as_str()))
                    {
                        stats.remove(student_id);
                    }
                })
        };

        Self {
            writer,
            remote,
            remote_timeout,
            config,
            roster,
            stats,
            commit: tokio::sync::Mutex::new(()),
            watchers: Mutex::new(vec![roster_watch, stats_watch]),
        }
    }

    pub fn snapshot(&self) -> Option<Arc<AttendanceSnapshot>> {
        self.roster.read().unwrap_or_else(|e| e.into_inner()).clone()
    }

    /// Rebuild the roster snapshot and stats cache from the local store.
    pub fn preload(&self) -> Result<Arc<AttendanceSnapshot>> {
        let started = Instant::now();
        let snapshot = Arc::new(load_roster(self.writer.local.as_ref(), self.writer.clock.now())?);

        let records = attendance_records(self.writer.local.as_ref(), &Query::all())?;
        self.stats.clear();
        for student in snapshot.students() {
            self.stats.insert(student.id.clone(), AttendanceStats::default());
        }
        for record in &records {
            if let Some(mut stats) = self.stats.get_mut(&record.student_id) {
                stats.add(record);
            }
        }

        *self.roster.write().unwrap_or_else(|e| e.into_inner()) = Some(snapshot.clone());
        tracing::info!(
            students = snapshot.len(),
            records = records.len(),
            elapsed_ms = started.elapsed().as_millis() as u64,
            "kiosk roster preloaded"
        );
        Ok(snapshot)
    }

    fn snapshot_or_load(&self) -> Result<Arc<AttendanceSnapshot>> {
        match self.snapshot() {
            Some(snapshot) => Ok(snapshot),
            None => {
                tracing::warn!("scan before preload, building roster on demand");
                let snapshot =
                    Arc::new(load_roster(self.writer.local.as_ref(), self.writer.clock.now())?);
                *self.roster.write().unwrap_or_else(|e| e.into_inner()) = Some(snapshot.clone());
                Ok(snapshot)
            }
        }
    }

    /// Resolve a kiosk scan.
    pub async fn mark_fast(&self, student_id: &str) -> AttendanceResult {
        let started = Instant::now();
        let mut result = self.resolve_fast(student_id).await;
        result.elapsed_ms = started.elapsed().as_millis() as u64;

        let budget = self.config.fast_path_budget;
        if started.elapsed() > budget {
            tracing::warn!(
                student_id = %student_id,
                elapsed_ms = result.elapsed_ms,
                budget_ms = budget.as_millis() as u64,
                "kiosk scan over budget"
            );
        }
        result
    }

    async fn resolve_fast(&self, student_id: &str) -> AttendanceResult {
        let snapshot = match self.snapshot_or_load() {
            Ok(snapshot) => snapshot,
            Err(e) => {
                tracing::error!(student_id = %student_id, error = %e, "could not load roster");
                return AttendanceResult::failed(None, e);
            }
        };
        let Some(student) = snapshot.get(student_id).cloned() else {
            tracing::debug!(student_id = %student_id, "scan for unknown student");
            return AttendanceResult::new(ScanStatus::NotFound);
        };

        let (date, time, now) = self.local_now();
        let policy = match self.policy() {
            Ok(policy) => policy,
            Err(e) => return AttendanceResult::failed(Some(student), e),
        };

        let _commit = self.commit.lock().await;
        match self.existing(&student.id, date) {
            Ok(Some(record)) => return self.already_marked(student, record),
            Ok(None) => {}
            Err(e) => return AttendanceResult::failed(Some(student), e),
        }

        let record = AttendanceRecord::new(&student, date, now, policy.evaluate(time));
        let committed = to_payload(&record).map_err(Error::from).and_then(|payload| {
            self.writer
                .write(EntityType::Attendance, &record.id, MutationOp::Create, payload)
        });
        if let Err(e) = committed {
            tracing::error!(student_id = %student.id, error = %e, "failed to commit attendance");
            return AttendanceResult::failed(Some(student), e);
        }
        drop(_commit);

        tracing::info!(
            student_id = %student.id,
            status = ?record.status,
            minutes_late = record.minutes_late,
            "attendance marked"
        );
        self.marked(student, record)
    }

    /// Mark attendance outside the kiosk.
    ///
    /// In cloud mode the record is written to the remote store first and
    /// only committed locally once accepted; a remote failure leaves no
    /// trace. In local mode this is the fast path.
    pub async fn mark_confirmed(&self, student_id: &str) -> AttendanceResult {
        let remote = match (self.writer.mode(), &self.remote) {
            (Mode::Cloud, Some(remote)) => remote.clone(),
            _ => return self.mark_fast(student_id).await,
        };
        let started = Instant::now();
        let mut result = self.resolve_confirmed(student_id, remote.as_ref()).await;
        result.elapsed_ms = started.elapsed().as_millis() as u64;
        result
    }

    async fn resolve_confirmed(&self, student_id: &str, remote: &dyn RemoteStore) -> AttendanceResult {
        let local = self.writer.local.as_ref();
        let student = match local.get(Table::Entity(EntityType::Student), student_id) {
            Ok(Some(payload)) => match from_payload::<Student>(payload) {
                Ok(student) if student.active => student,
                Ok(_) => return AttendanceResult::new(ScanStatus::NotFound),
                Err(e) => return AttendanceResult::failed(None, e),
            },
            Ok(None) => return AttendanceResult::new(ScanStatus::NotFound),
            Err(e) => return AttendanceResult::failed(None, e),
        };

        let (date, time, now) = self.local_now();
        let policy = match self.policy() {
            Ok(policy) => policy,
            Err(e) => return AttendanceResult::failed(Some(student), e),
        };

        let _commit = self.commit.lock().await;
        match self.existing(&student.id, date) {
            Ok(Some(record)) => return self.already_marked(student, record),
            Ok(None) => {}
            Err(e) => return AttendanceResult::failed(Some(student), e),
        }

        let record = AttendanceRecord::new(&student, date, now, policy.evaluate(time));
        let payload = match to_payload(&record) {
            Ok(payload) => payload,
            Err(e) => return AttendanceResult::failed(Some(student), e),
        };
        if let Err(e) = self.writer.schema.validate(EntityType::Attendance, &record.id, &payload) {
            return AttendanceResult::failed(Some(student), e);
        }

        let mutation = MutationRecord::new(
            uuid::Uuid::new_v4().to_string(),
            EntityType::Attendance,
            record.id.clone(),
            MutationOp::Create,
            payload.clone(),
            now,
        )
        .with_base_server_ts(self.writer.known_server_ts(EntityType::Attendance, &record.id));

        let write = match bounded(self.remote_timeout, remote.create(&mutation)).await {
            Ok(write) => write,
            Err(e) => {
                tracing::warn!(student_id = %student.id, error = %e, "remote rejected confirmed attendance");
                return AttendanceResult::failed(Some(student), e);
            }
        };

        if let Err(e) = self.commit_confirmed(&mutation, write.server_ts) {
            // The remote row exists; the change feed will bring it back.
            tracing::error!(student_id = %student.id, error = %e, "confirmed attendance not stored locally");
            return AttendanceResult::failed(Some(student), e);
        }
        drop(_commit);

        tracing::info!(
            student_id = %student.id,
            status = ?record.status,
            server_ts = %write.server_ts,
            "attendance confirmed"
        );
        self.marked(student, record)
    }

    fn commit_confirmed(&self, mutation: &MutationRecord, server_ts: DateTime<Utc>) -> Result<()> {
        let local = self.writer.local.as_ref();
        local.put(
            Table::Entity(EntityType::Attendance),
            &mutation.entity_id,
            mutation.payload.clone(),
        )?;
        record_version(local, EntityType::Attendance, &mutation.entity_id, server_ts)?;
        let event = DomainEvent::for_write(
            mutation.id.clone(),
            EntityType::Attendance,
            MutationOp::Create,
            mutation.entity_id.clone(),
            mutation.payload.clone(),
            mutation.created_at,
            Origin::Local,
        );
        if let Err(e) = self.writer.bus.publish(event) {
            tracing::error!(entity_id = %mutation.entity_id, error = %e, "failed to record event for confirmed attendance");
        }
        Ok(())
    }

    /// Stats for a student: cached, or computed from the local store.
    pub fn stats_for(&self, student_id: &str) -> Result<AttendanceStats> {
        if let Some(stats) = self.stats.get(student_id) {
            return Ok(*stats);
        }
        let stats = compute_stats(self.writer.local.as_ref(), student_id)?;
        self.stats.insert(student_id.to_string(), stats);
        Ok(stats)
    }

    /// Hold off scans while attendance is written in bulk.
    pub(crate) async fn commit_lock(&self) -> tokio::sync::MutexGuard<'_, ()> {
        self.commit.lock().await
    }

    /// Fold a record written outside a scan into the cache.
    pub(crate) fn note_record(&self, record: &AttendanceRecord) {
        if let Some(mut stats) = self.stats.get_mut(&record.student_id) {
            stats.add(record);
        }
    }

    fn marked(&self, student: Student, record: AttendanceRecord) -> AttendanceResult {
        let mut result = AttendanceResult::new(record.status.into());
        match self.stats.get_mut(&student.id) {
            Some(mut stats) => {
                stats.add(&record);
                result.stats = Some(*stats);
            }
            None => {
                result.stats_pending = true;
                self.backfill(student.id.clone());
            }
        }
        result.student = Some(student);
        result.record = Some(record);
        result
    }

    fn already_marked(&self, student: Student, record: AttendanceRecord) -> AttendanceResult {
        tracing::debug!(student_id = %student.id, date = %record.date, "student already marked today");
        let mut result = AttendanceResult::new(ScanStatus::AlreadyMarked);
        result.stats = self.stats.get(&student.id).map(|s| *s);
        result.student = Some(student);
        result.record = Some(record);
        result
    }

    /// Fill the stats cache for a student off the scan path.
    fn backfill(&self, student_id: EntityId) {
        let local = self.writer.local.clone();
        let stats = Arc::downgrade(&self.stats);
        tokio::spawn(async move {
            match compute_stats(local.as_ref(), &student_id) {
                Ok(computed) => {
                    if let Some(stats) = stats.upgrade() {
                        stats.insert(student_id, computed);
                    }
                }
                Err(e) => tracing::warn!(student_id = %student_id, error = %e, "stats backfill failed"),
            }
        });
    }

    fn existing(&self, student_id: &str, date: NaiveDate) -> Result<Option<AttendanceRecord>> {
        let id = attendance_id(student_id, date);
        match self.writer.local.get(Table::Entity(EntityType::Attendance), &id)? {
            Some(payload) => Ok(Some(from_payload(payload)?)),
            None => Ok(None),
        }
    }

    /// Current policy from the settings row, or the defaults.
    fn policy(&self) -> Result<AttendancePolicy> {
        let row = self
            .writer
            .local
            .get(Table::Entity(EntityType::Settings), Settings::ID)?;
        let settings = match row {
            Some(payload) => from_payload::<Settings>(payload)?,
            None => Settings::default(),
        };
        Ok(settings.policy())
    }

    /// School date, school time of day and the UTC instant.
    fn local_now(&self) -> (NaiveDate, NaiveTime, DateTime<Utc>) {
        let now = self.writer.clock.now();
        let local = now.with_timezone(&self.config.utc_offset);
        (local.date_naive(), local.time(), now)
    }

    /// Today's date at the school.
    pub fn today(&self) -> NaiveDate {
        self.local_now().0
    }
}

impl Drop for KioskResolver {
    fn drop(&mut self) {
        for mut watcher in self.watchers.lock().unwrap_or_else(|e| e.into_inner()).drain(..) {
            watcher.unsubscribe();
        }
    }
}

fn load_roster(local: &dyn LocalStore, now: DateTime<Utc>) -> std::result::Result<AttendanceSnapshot, StorageError> {
    let mut students = Vec::new();
    for payload in local.scan(Table::Entity(EntityType::Student))? {
        match from_payload::<Student>(payload) {
            Ok(student) => students.push(student),
            Err(e) => tracing::warn!(error = %e, "skipping unreadable student row"),
        }
    }
    Ok(AttendanceSnapshot::build(students, now))
}

fn apply_roster_change(roster: &Roster, event: &DomainEvent) {
    let mut guard = roster.write().unwrap_or_else(|e| e.into_inner());
    let Some(current) = guard.as_ref() else {
        return;
    };
    let mut students: Vec<Student> = current
        .students()
        .filter(|s| s.id != event.entity_id)
        .cloned()
        .collect();
    if event.change != MutationOp::Delete {
        match from_payload::<Student>(event.payload.clone()) {
            Ok(student) => students.push(student),
            Err(e) => tracing::warn!(entity_id = %event.entity_id, error = %e, "ignoring unreadable student change"),
        }
    }
    *guard = Some(Arc::new(AttendanceSnapshot::build(students, event.created_at)));
    tracing::debug!(entity_id = %event.entity_id, change = ?event.change, "roster snapshot updated");
}

pub(crate) fn attendance_records(local: &dyn LocalStore, query: &Query) -> Result<Vec<AttendanceRecord>> {
    local
        .query(Table::Entity(EntityType::Attendance), query)?
        .into_iter()
        .map(|payload| from_payload(payload).map_err(Error::from))
        .collect()
}

fn compute_stats(local: &dyn LocalStore, student_id: &str) -> Result<AttendanceStats> {
    let records = attendance_records(local, &Query::all().eq("studentId", student_id))?;
    Ok(AttendanceStats::from_records(&records))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::EventBus;
    use crate::local::MemoryStore;
    use crate::queue::DurableQueue;
    use crate::remote::MemoryRemoteStore;
    use chrono::{FixedOffset, TimeZone};
    use rollcall_engine::{Clock, ManualClock, Schema};

    struct Fixture {
        store: Arc<MemoryStore>,
        clock: Arc<ManualClock>,
        writer: Arc<Writer>,
        remote: MemoryRemoteStore,
        kiosk: KioskResolver,
    }

    /// UTC+7, clock at 07:05 school time on 2024-07-15.
    fn fixture(mode: Mode) -> Fixture {
        let store = Arc::new(MemoryStore::default());
        let clock = Arc::new(ManualClock::new(
            Utc.with_ymd_and_hms(2024, 7, 15, 0, 5, 0).unwrap(),
        ));
        let dyn_clock: Arc<dyn Clock> = clock.clone();
        let queue = Arc::new(DurableQueue::open(store.clone(), 5).unwrap());
        let bus = Arc::new(
            EventBus::open(store.clone(), dyn_clock.clone(), chrono::Duration::hours(1), 100).unwrap(),
        );
        let writer = Arc::new(Writer::new(
            store.clone(),
            queue,
            bus,
            Arc::new(Schema::default()),
            dyn_clock,
            mode,
        ));
        let remote = MemoryRemoteStore::new();
        let config = KioskConfig {
            fast_path_budget: Duration::from_millis(300),
            utc_offset: FixedOffset::east_opt(7 * 3600).unwrap(),
        };
        let kiosk = KioskResolver::new(
            writer.clone(),
            Some(Arc::new(remote.clone())),
            Duration::from_secs(5),
            config,
        );

        let student = to_payload(&Student::new("S1", "Ayu", "7A")).unwrap();
        store
            .put(Table::Entity(EntityType::Student), "S1", student)
            .unwrap();
        Fixture {
            store,
            clock,
            writer,
            remote,
            kiosk,
        }
    }

    #[tokio::test]
    async fn present_then_already_marked() {
        let f = fixture(Mode::Cloud);
        f.kiosk.preload().unwrap();

        let first = f.kiosk.mark_fast("S1").await;
        assert!(first.success);
        assert_eq!(first.status, ScanStatus::Present);
        assert_eq!(first.stats.unwrap().present_days, 1);
        assert_eq!(f.writer.queue.pending_count(), 1);

        let second = f.kiosk.mark_fast("S1").await;
        assert!(!second.success);
        assert_eq!(second.status, ScanStatus::AlreadyMarked);
        assert_eq!(second.record, first.record);
        assert_eq!(f.writer.queue.pending_count(), 1);
    }

    #[tokio::test]
    async fn late_after_grace_period() {
        let f = fixture(Mode::Local);
        f.clock.advance(chrono::Duration::minutes(10));
        let result = f.kiosk.mark_fast("S1").await;
        assert_eq!(result.status, ScanStatus::Late);
        assert_eq!(result.record.unwrap().minutes_late, 5);
    }

    #[tokio::test]
    async fn unknown_student_is_not_found() {
        let f = fixture(Mode::Cloud);
        f.kiosk.preload().unwrap();
        let result = f.kiosk.mark_fast("S404").await;
        assert_eq!(result.status, ScanStatus::NotFound);
        assert!(!result.success);
        assert!(f.writer.queue.is_empty());
    }

    #[tokio::test]
    async fn storage_failure_fails_the_scan() {
        let f = fixture(Mode::Cloud);
        f.kiosk.preload().unwrap();
        f.store.set_fail_writes(true);
        let result = f.kiosk.mark_fast("S1").await;
        assert_eq!(result.status, ScanStatus::Failed);
        assert!(!result.success);
        assert!(result.error.is_some());
    }

    #[tokio::test]
    async fn cold_stats_are_backfilled() {
        let f = fixture(Mode::Local);
        // No preload: the roster is built on demand and stats are cold.
        let result = f.kiosk.mark_fast("S1").await;
        assert!(result.success);
        assert!(result.stats_pending);
        assert!(result.stats.is_none());

        tokio::task::yield_now().await;
        assert_eq!(f.kiosk.stats_for("S1").unwrap().present_days, 1);
    }

    #[tokio::test]
    async fn new_student_reaches_snapshot() {
        let f = fixture(Mode::Local);
        f.kiosk.preload().unwrap();
        let payload = to_payload(&Student::new("S2", "Budi", "8B")).unwrap();
        f.writer
            .write(EntityType::Student, "S2", MutationOp::Create, payload)
            .unwrap();
        f.writer.bus.flushed().await;
        assert!(f.kiosk.snapshot().unwrap().get("S2").is_some());
    }

    #[tokio::test]
    async fn confirmed_path_writes_remote_first() {
        let f = fixture(Mode::Cloud);
        let result = f.kiosk.mark_confirmed("S1").await;
        assert!(result.success);
        assert!(f.writer.queue.is_empty());
        let id = result.record.unwrap().id;
        assert!(f.remote.row(EntityType::Attendance, &id).is_some());
        assert!(f.store.get(Table::Entity(EntityType::Attendance), &id).unwrap().is_some());
    }

    #[tokio::test]
    async fn confirmed_path_failure_writes_nothing() {
        let f = fixture(Mode::Cloud);
        f.remote.set_online(false);
        let result = f.kiosk.mark_confirmed("S1").await;
        assert_eq!(result.status, ScanStatus::Failed);
        assert_eq!(f.store.count(Table::Entity(EntityType::Attendance)).unwrap(), 0);
        assert!(f.writer.queue.is_empty());
    }
}
