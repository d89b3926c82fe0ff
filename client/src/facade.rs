//! The data service facade.
//!
//! [`DataService`] is the only thing screens talk to. It owns one of each
//! component (local store, mutation queue, event bus, kiosk resolver and, in
//! cloud mode, the sync coordinator) and routes every write through the
//! same path so the queue never misses a change.

use crate::bus::{EventBus, Gate, Subscription};
use crate::config::{Config, KioskConfig, Mode, SyncConfig};
use crate::coordinator::{SyncContext, SyncCoordinator};
use crate::diagnostics::{DiagnosticResult, DiagnosticsLog};
use crate::error::{Error, RemoteError, Result};
use crate::kiosk::{attendance_records, AttendanceResult, KioskResolver};
use crate::local::{FileStore, LocalStore, MemoryStore, Table};
use crate::queue::DurableQueue;
use crate::remote::{bounded, PgRemoteStore, RemoteStore};
use crate::writer::{Committed, Writer};
use chrono::NaiveDate;
use rollcall_engine::{
    absentees, from_payload, to_payload, AttendanceRecord, Class, Clock, DailySummary,
    DomainEvent, Entity, EntityType, EventFilter, ExitRecord, MutationOp, MutationRecord,
    Notification, Query, Replay, Schema, Settings, Student, SyncState, SyncStatus, SystemClock, User,
    ViolationRecord,
};
use serde_json::json;
use std::sync::Arc;
use tokio::sync::watch;

/// Assembles a [`DataService`].
pub struct DataServiceBuilder {
    local: Option<Arc<dyn LocalStore>>,
    remote: Option<Arc<dyn RemoteStore>>,
    clock: Arc<dyn Clock>,
    mode: Mode,
    schema: Schema,
    sync: SyncConfig,
    kiosk: KioskConfig,
}

impl Default for DataServiceBuilder {
    fn default() -> Self {
        Self {
            local: None,
            remote: None,
            clock: Arc::new(SystemClock),
            mode: Mode::Local,
            schema: Schema::default(),
            sync: SyncConfig::default(),
            kiosk: KioskConfig::default(),
        }
    }
}

impl DataServiceBuilder {
    /// Defaults to an in-memory store.
    pub fn local_store(mut self, local: Arc<dyn LocalStore>) -> Self {
        self.local = Some(local);
        self
    }

    pub fn remote_store(mut self, remote: Arc<dyn RemoteStore>) -> Self {
        self.remote = Some(remote);
        self
    }

    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn mode(mut self, mode: Mode) -> Self {
        self.mode = mode;
        self
    }

    pub fn sync_config(mut self, sync: SyncConfig) -> Self {
        self.sync = sync;
        self
    }

    pub fn kiosk_config(mut self, kiosk: KioskConfig) -> Self {
        self.kiosk = kiosk;
        self
    }

    /// Open the queue and event log and, in cloud mode, start syncing.
    ///
    /// Must be called inside a Tokio runtime.
    pub fn build(self) -> Result<DataService> {
        if self.mode == Mode::Cloud && self.remote.is_none() {
            return Err(Error::ModeUnavailable(
                "cloud mode needs a remote store".to_string(),
            ));
        }
        let schema = Arc::new(self.schema);
        let local = self
            .local
            .unwrap_or_else(|| Arc::new(MemoryStore::new(&schema)));

        let queue = Arc::new(DurableQueue::open(local.clone(), self.sync.retry_cap)?);
        let bus = Arc::new(EventBus::open(
            local.clone(),
            self.clock.clone(),
            self.sync.dedup_retention,
            self.sync.dedup_capacity,
        )?);
        let writer = Arc::new(Writer::new(
            local,
            queue,
            bus,
            schema,
            self.clock,
            self.mode,
        ));
        let kiosk = KioskResolver::new(
            writer.clone(),
            self.remote.clone(),
            self.sync.remote_timeout,
            self.kiosk,
        );
        let (status, _) = watch::channel(SyncState::default());

        let service = DataService {
            writer,
            remote: self.remote,
            kiosk,
            diagnostics: Arc::new(DiagnosticsLog::new()),
            status: Arc::new(status),
            sync: self.sync,
            mode_lock: tokio::sync::Mutex::new(()),
        };
        match service.mode() {
            Mode::Cloud => service.start_sync(),
            Mode::Local => service.publish_local_state(),
        }
        tracing::info!(mode = %service.mode(), "data service ready");
        Ok(service)
    }
}

pub struct DataService {
    writer: Arc<Writer>,
    remote: Option<Arc<dyn RemoteStore>>,
    kiosk: KioskResolver,
    diagnostics: Arc<DiagnosticsLog>,
    status: Arc<watch::Sender<SyncState>>,
    sync: SyncConfig,
    /// Serializes mode switches.
    mode_lock: tokio::sync::Mutex<()>,
}

impl std::fmt::Debug for DataService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DataService")
            .field("mode", &self.mode())
            .field("status", &self.sync_status())
            .finish()
    }
}

impl DataService {
    pub fn builder() -> DataServiceBuilder {
        DataServiceBuilder::default()
    }

    /// Build the service described by `config`: a file store under the data
    /// directory and, when a database URL is set, the Postgres backend.
    pub async fn from_config(config: &Config) -> Result<Self> {
        let schema = Schema::default();
        let local: Arc<dyn LocalStore> = Arc::new(FileStore::open(&config.data_dir, &schema)?);
        let mut builder = Self::builder()
            .local_store(local)
            .mode(config.mode)
            .sync_config(config.sync.clone())
            .kiosk_config(config.kiosk.clone());

        if let Some(url) = &config.database_url {
            let remote = PgRemoteStore::connect_lazy(url, config.sync.remote_timeout)?;
            if config.run_migrations {
                tracing::info!("running database migrations");
                remote
                    .run_migrations()
                    .await
                    .map_err(|e| RemoteError::Transient(format!("migration failed: {e}")))?;
            }
            builder = builder.remote_store(Arc::new(remote));
        }
        builder.build()
    }

    // ---- mode -------------------------------------------------------------

    pub fn mode(&self) -> Mode {
        self.writer.mode()
    }

    /// Switch between local-only and cloud mode.
    ///
    /// Leaving cloud mode stops the coordinator and waits for it; mutations
    /// still queued stay queued for the next time cloud mode is entered.
    /// Selecting cloud mode again restarts a stopped coordinator.
    pub async fn set_mode(&self, mode: Mode) -> Result<()> {
        let _switch = self.mode_lock.lock().await;
        let current = self.mode();
        match mode {
            Mode::Cloud => {
                if self.remote.is_none() {
                    return Err(Error::ModeUnavailable(
                        "no remote store configured".to_string(),
                    ));
                }
                let running = self
                    .writer
                    .coordinator()
                    .is_some_and(|c| !c.is_stopped());
                if current == Mode::Cloud && running {
                    return Ok(());
                }
                self.writer.set_mode(Mode::Cloud);
                self.stop_coordinator().await;
                self.start_sync();
            }
            Mode::Local => {
                if current == Mode::Local {
                    return Ok(());
                }
                self.writer.set_mode(Mode::Local);
                self.stop_coordinator().await;
                self.publish_local_state();
            }
        }
        tracing::info!(from = %current, to = %mode, "mode changed");
        Ok(())
    }

    fn start_sync(&self) {
        let Some(remote) = self.remote.clone() else {
            return;
        };
        let coordinator = SyncCoordinator::start(SyncContext {
            local: self.writer.local.clone(),
            remote,
            queue: self.writer.queue.clone(),
            bus: self.writer.bus.clone(),
            schema: self.writer.schema.clone(),
            clock: self.writer.clock.clone(),
            config: self.sync.clone(),
            status: self.status.clone(),
            diagnostics: self.diagnostics.clone(),
        });
        self.writer.replace_coordinator(Some(Arc::new(coordinator)));
    }

    async fn stop_coordinator(&self) {
        if let Some(coordinator) = self.writer.replace_coordinator(None) {
            coordinator.stop();
            coordinator.join().await;
        }
    }

    /// Status reported while no coordinator runs: the local store is
    /// authoritative, so there is nothing to be offline from.
    fn publish_local_state(&self) {
        let pending = self.writer.queue.pending_count();
        self.status.send_modify(|state| {
            state.status = SyncStatus::Online;
            state.pending_count = pending;
            state.last_error = None;
        });
    }

    fn refresh_status(&self) {
        match self.writer.coordinator() {
            Some(coordinator) => coordinator.refresh_pending(),
            None => self.publish_local_state(),
        }
    }

    // ---- sync status --------------------------------------------------------

    pub fn sync_status(&self) -> SyncState {
        self.status.borrow().clone()
    }

    /// Queued mutations not yet confirmed, dead letters excluded.
    pub fn pending_count(&self) -> usize {
        self.writer.queue.pending_count()
    }

    /// Call `callback` with every new sync state until unsubscribed.
    pub fn on_sync_status_change(
        &self,
        callback: impl Fn(&SyncState) + Send + Sync + 'static,
    ) -> Subscription {
        let mut rx = self.status.subscribe();
        let gate = Arc::new(Gate::new());
        let task_gate = gate.clone();
        let task = tokio::spawn(async move {
            while rx.changed().await.is_ok() {
                let state = rx.borrow_and_update().clone();
                task_gate.run(|| callback(&state));
                if !task_gate.is_open() {
                    break;
                }
            }
        });
        Subscription::new(move || {
            gate.close();
            task.abort();
        })
    }

    /// Run one sync cycle now and return the resulting state. In local mode
    /// there is nothing to flush and the current state is returned.
    pub async fn force_sync_now(&self) -> SyncState {
        match self.writer.coordinator() {
            Some(coordinator) => coordinator.force_sync_now().await,
            None => self.sync_status(),
        }
    }

    /// Stop background sync. Writes keep being queued; selecting cloud mode
    /// again resumes. Idempotent.
    pub fn stop_sync(&self) {
        if let Some(coordinator) = self.writer.coordinator() {
            coordinator.stop();
        }
    }

    /// Stop syncing and wait for in-flight work to settle.
    pub async fn shutdown(&self) {
        let _switch = self.mode_lock.lock().await;
        self.stop_coordinator().await;
        self.writer.bus.flushed().await;
        tracing::info!("data service shut down");
    }

    // ---- subscriptions ------------------------------------------------------

    pub fn subscribe(
        &self,
        filter: EventFilter,
        callback: impl Fn(&DomainEvent) + Send + Sync + 'static,
    ) -> Subscription {
        self.writer.bus.subscribe(filter, callback)
    }

    /// Notifications for an audience (and optionally one target).
    pub fn subscribe_to_notifications(
        &self,
        filter: EventFilter,
        callback: impl Fn(&DomainEvent) + Send + Sync + 'static,
    ) -> Subscription {
        let filter = EventFilter {
            kinds: vec![EntityType::Notification],
            ..filter
        };
        self.writer.bus.subscribe(filter, callback)
    }

    pub fn subscribe_to_attendance(
        &self,
        callback: impl Fn(&DomainEvent) + Send + Sync + 'static,
    ) -> Subscription {
        self.writer
            .bus
            .subscribe(EventFilter::all().kind(EntityType::Attendance), callback)
    }

    // ---- attendance ---------------------------------------------------------

    /// Kiosk scan. Never waits on the network.
    pub async fn mark_attendance_fast(&self, student_id: &str) -> AttendanceResult {
        self.kiosk.mark_fast(student_id).await
    }

    /// Remote-confirmed marking for use outside the kiosk.
    pub async fn mark_attendance(&self, student_id: &str) -> AttendanceResult {
        self.kiosk.mark_confirmed(student_id).await
    }

    /// Load the roster for the kiosk. When the remote store is reachable the
    /// local roster is refreshed from it first. Returns the roster size.
    pub async fn preload_for_kiosk(&self) -> Result<usize> {
        if let (Some(remote), Some(coordinator)) = (&self.remote, self.writer.coordinator()) {
            if coordinator.status() != SyncStatus::Offline && !coordinator.is_stopped() {
                let rows = bounded(
                    self.sync.remote_timeout,
                    remote.query(EntityType::Student, &Query::all()),
                )
                .await;
                match rows {
                    Ok(rows) => {
                        let count = rows.len();
                        for row in rows {
                            coordinator.ingest(row)?;
                        }
                        self.writer.bus.flushed().await;
                        tracing::debug!(rows = count, "refreshed roster from remote");
                    }
                    Err(e) => tracing::warn!(error = %e, "roster refresh failed, using local copy"),
                }
            }
        }
        Ok(self.kiosk.preload()?.len())
    }

    /// Write an absence for every rostered student without a record on
    /// `date`, then save the day's summary.
    pub async fn close_day(&self, date: NaiveDate) -> Result<DailySummary> {
        let roster: Vec<Student> = self.list(&Query::all())?;
        let now = self.writer.clock.now();
        let mut absent = 0;
        {
            let _commit = self.kiosk.commit_lock().await;
            let records = self.attendance_on(date)?;
            for student in absentees(&roster, &records) {
                let record = AttendanceRecord::absent(student, date, now);
                self.save(&record)?;
                self.kiosk.note_record(&record);
                absent += 1;
            }
        }
        let summary = self.summarize_day(date)?;
        self.save(&summary)?;
        tracing::info!(
            date = %date,
            absent_marked = absent,
            present = summary.present,
            late = summary.late,
            absent = summary.absent,
            "day closed"
        );
        Ok(summary)
    }

    /// Tally `date` without writing anything.
    pub fn summarize_day(&self, date: NaiveDate) -> Result<DailySummary> {
        let records = self.attendance_on(date)?;
        Ok(DailySummary::tally(date, &records))
    }

    pub fn attendance_on(&self, date: NaiveDate) -> Result<Vec<AttendanceRecord>> {
        attendance_records(self.writer.local.as_ref(), &Query::all().eq("date", date))
    }

    pub fn attendance_for_student(&self, student_id: &str) -> Result<Vec<AttendanceRecord>> {
        attendance_records(
            self.writer.local.as_ref(),
            &Query::all().eq("studentId", student_id),
        )
    }

    /// Today's date at the school.
    pub fn today(&self) -> NaiveDate {
        self.kiosk.today()
    }

    // ---- generic CRUD -------------------------------------------------------

    pub fn get<E: Entity>(&self, id: &str) -> Result<Option<E>> {
        match self.writer.local.get(Table::Entity(E::TYPE), id)? {
            Some(payload) => Ok(Some(from_payload(payload)?)),
            None => Ok(None),
        }
    }

    pub fn list<E: Entity>(&self, query: &Query) -> Result<Vec<E>> {
        self.writer
            .local
            .query(Table::Entity(E::TYPE), query)?
            .into_iter()
            .map(|payload| from_payload(payload).map_err(Error::from))
            .collect()
    }

    /// Create or replace an entity.
    pub fn save<E: Entity>(&self, entity: &E) -> Result<Committed> {
        let payload = to_payload(entity)?;
        self.writer
            .write(E::TYPE, entity.id(), MutationOp::Create, payload)
    }

    pub fn delete<E: Entity>(&self, id: &str) -> Result<Committed> {
        self.writer
            .write(E::TYPE, id, MutationOp::Delete, serde_json::Value::Null)
    }

    // ---- named CRUD ---------------------------------------------------------

    pub fn get_student(&self, id: &str) -> Result<Option<Student>> {
        self.get(id)
    }

    /// Students, optionally of one class.
    pub fn list_students(&self, class_name: Option<&str>) -> Result<Vec<Student>> {
        match class_name {
            Some(class) => self.list(&Query::all().eq("className", class)),
            None => self.list(&Query::all()),
        }
    }

    pub fn save_student(&self, student: &Student) -> Result<Committed> {
        self.save(student)
    }

    pub fn delete_student(&self, id: &str) -> Result<Committed> {
        self.delete::<Student>(id)
    }

    pub fn get_class(&self, id: &str) -> Result<Option<Class>> {
        self.get(id)
    }

    pub fn list_classes(&self) -> Result<Vec<Class>> {
        self.list(&Query::all())
    }

    pub fn save_class(&self, class: &Class) -> Result<Committed> {
        self.save(class)
    }

    pub fn delete_class(&self, id: &str) -> Result<Committed> {
        self.delete::<Class>(id)
    }

    pub fn get_user(&self, id: &str) -> Result<Option<User>> {
        self.get(id)
    }

    pub fn list_users(&self) -> Result<Vec<User>> {
        self.list(&Query::all())
    }

    pub fn save_user(&self, user: &User) -> Result<Committed> {
        self.save(user)
    }

    pub fn delete_user(&self, id: &str) -> Result<Committed> {
        self.delete::<User>(id)
    }

    /// School settings, or the defaults if never saved.
    pub fn get_settings(&self) -> Result<Settings> {
        Ok(self.get(Settings::ID)?.unwrap_or_default())
    }

    pub fn save_settings(&self, settings: &Settings) -> Result<Committed> {
        self.save(settings)
    }

    pub fn get_exit(&self, id: &str) -> Result<Option<ExitRecord>> {
        self.get(id)
    }

    pub fn list_exits(&self, date: NaiveDate) -> Result<Vec<ExitRecord>> {
        self.list(&Query::all().eq("date", date))
    }

    pub fn save_exit(&self, exit: &ExitRecord) -> Result<Committed> {
        self.save(exit)
    }

    pub fn delete_exit(&self, id: &str) -> Result<Committed> {
        self.delete::<ExitRecord>(id)
    }

    pub fn get_violation(&self, id: &str) -> Result<Option<ViolationRecord>> {
        self.get(id)
    }

    pub fn list_violations(&self, student_id: &str) -> Result<Vec<ViolationRecord>> {
        self.list(&Query::all().eq("studentId", student_id))
    }

    pub fn save_violation(&self, violation: &ViolationRecord) -> Result<Committed> {
        self.save(violation)
    }

    pub fn delete_violation(&self, id: &str) -> Result<Committed> {
        self.delete::<ViolationRecord>(id)
    }

    pub fn get_daily_summary(&self, date: NaiveDate) -> Result<Option<DailySummary>> {
        self.get(&date.format("%Y-%m-%d").to_string())
    }

    pub fn list_daily_summaries(&self, from: NaiveDate, to: NaiveDate) -> Result<Vec<DailySummary>> {
        self.list(&Query::all().between("date", from, to))
    }

    pub fn save_daily_summary(&self, summary: &DailySummary) -> Result<Committed> {
        self.save(summary)
    }

    pub fn delete_daily_summary(&self, date: NaiveDate) -> Result<Committed> {
        self.delete::<DailySummary>(&date.format("%Y-%m-%d").to_string())
    }

    /// Save a notification; its event goes to the notification's audience.
    pub fn send_notification(&self, notification: &Notification) -> Result<Committed> {
        let committed = self.save(notification)?;
        tracing::info!(
            notification_id = %notification.id,
            audience = ?notification.target_audience,
            "notification sent"
        );
        Ok(committed)
    }

    // ---- dead letters -------------------------------------------------------

    pub fn dead_letters(&self) -> Vec<MutationRecord> {
        self.writer.queue.dead_letters()
    }

    /// Put a dead-lettered mutation back in line with a fresh attempt count.
    /// It is replayed as the entity's current local row, behind any write
    /// made since it failed.
    pub fn retry_dead_letter(&self, id: &str) -> Result<MutationRecord> {
        let dead = self
            .writer
            .queue
            .get(id)
            .ok_or_else(|| rollcall_engine::Error::MutationNotFound(id.to_string()))?;
        let replay = Replay {
            current: self
                .writer
                .local
                .get(Table::Entity(dead.entity_type), &dead.entity_id)?,
            base_server_ts: self.writer.known_server_ts(dead.entity_type, &dead.entity_id),
            at: self.writer.clock.now(),
        };
        let record = self.writer.queue.retry_dead_letter(id, replay)?;
        tracing::info!(mutation_id = %id, entity_id = %record.entity_id, "dead letter requeued");
        self.refresh_status();
        if let Some(coordinator) = self.writer.coordinator() {
            coordinator.nudge();
        }
        Ok(record)
    }

    /// Drop a dead-lettered mutation for good.
    pub fn discard_dead_letter(&self, id: &str) -> Result<MutationRecord> {
        let record = self.writer.queue.discard(id)?;
        tracing::warn!(mutation_id = %id, entity_id = %record.entity_id, "dead letter discarded");
        self.refresh_status();
        Ok(record)
    }

    // ---- diagnostics --------------------------------------------------------

    pub async fn run_diagnostics(&self) -> Vec<DiagnosticResult> {
        let mut results = vec![DiagnosticResult::ok("mode", self.mode().to_string())];
        let state = self.sync_status();

        results.push(match (self.mode(), &self.remote) {
            (Mode::Local, _) => DiagnosticResult::ok("connectivity", "local mode, remote not used"),
            (Mode::Cloud, None) => DiagnosticResult::error("connectivity", "no remote store"),
            (Mode::Cloud, Some(remote)) => {
                match bounded(self.sync.remote_timeout, remote.probe()).await {
                    Ok(()) => DiagnosticResult::ok("connectivity", "remote reachable"),
                    Err(e) => DiagnosticResult::error("connectivity", e.to_string()),
                }
            }
        });

        results.push(
            match &state.last_error {
                None => DiagnosticResult::ok("sync", format!("status {}", state.status)),
                Some(error) => DiagnosticResult::warning("sync", error.clone()),
            }
            .with_details(json!({
                "status": state.status,
                "lastError": state.last_error,
                "lastSyncedAt": state.last_synced_at,
            })),
        );

        let pending = self.pending_count();
        results.push(if pending == 0 {
            DiagnosticResult::ok("queueDepth", "queue empty")
        } else {
            DiagnosticResult::warning("queueDepth", format!("{pending} mutations pending"))
                .with_details(json!({ "pending": pending }))
        });

        let dead = self.dead_letters();
        results.push(if dead.is_empty() {
            DiagnosticResult::ok("deadLetters", "no dead-lettered mutations")
        } else {
            let details: Vec<_> = dead
                .iter()
                .map(|m| {
                    json!({
                        "id": m.id,
                        "entityType": m.entity_type,
                        "entityId": m.entity_id,
                        "operation": m.operation,
                        "attemptCount": m.attempt_count,
                        "lastError": m.last_error,
                        "createdAt": m.created_at,
                    })
                })
                .collect();
            DiagnosticResult::error("deadLetters", format!("{} dead-lettered mutations", dead.len()))
                .with_details(json!(details))
        });

        let rejected = self.diagnostics.rejected();
        results.push(if rejected.is_empty() {
            DiagnosticResult::ok("rejected", "no rejected mutations")
        } else {
            DiagnosticResult::warning("rejected", format!("{} mutations rejected by remote", rejected.len()))
                .with_details(json!(rejected))
        });

        let conflicts = self.diagnostics.conflict_count();
        results.push(if conflicts == 0 {
            DiagnosticResult::ok("conflicts", "no conflicts")
        } else {
            DiagnosticResult::warning("conflicts", format!("{conflicts} writes overwrote remote changes"))
                .with_details(json!(self.diagnostics.recent_conflicts()))
        });

        let bus = &self.writer.bus;
        results.push(
            DiagnosticResult::ok("eventLog", format!("{} delivered event ids", bus.delivered_count()))
                .with_details(json!({ "subscribers": bus.subscriber_count() })),
        );

        results.push(match self.kiosk.snapshot() {
            Some(snapshot) => DiagnosticResult::ok(
                "kioskSnapshot",
                format!("{} students preloaded", snapshot.len()),
            )
            .with_details(json!({ "builtAt": snapshot.built_at() })),
            None => DiagnosticResult::warning("kioskSnapshot", "roster not preloaded"),
        });

        results
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::diagnostics::CheckStatus;
    use crate::remote::MemoryRemoteStore;
    use chrono::{TimeZone, Utc};
    use rollcall_engine::{Audience, ManualClock};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    fn clock() -> Arc<ManualClock> {
        Arc::new(ManualClock::new(
            Utc.with_ymd_and_hms(2024, 7, 15, 0, 5, 0).unwrap(),
        ))
    }

    fn service(mode: Mode, remote: &MemoryRemoteStore) -> DataService {
        DataService::builder()
            .mode(mode)
            .remote_store(Arc::new(remote.clone()))
            .clock(clock())
            .build()
            .unwrap()
    }

    #[tokio::test]
    async fn cloud_mode_without_remote_is_unavailable() {
        let err = DataService::builder().mode(Mode::Cloud).build().unwrap_err();
        assert!(matches!(err, Error::ModeUnavailable(_)));

        let local = DataService::builder().build().unwrap();
        assert!(matches!(
            local.set_mode(Mode::Cloud).await.unwrap_err(),
            Error::ModeUnavailable(_)
        ));
    }

    #[tokio::test]
    async fn local_mode_reports_online_and_queues_nothing() {
        let remote = MemoryRemoteStore::new();
        let svc = service(Mode::Local, &remote);
        svc.save_student(&Student::new("S1", "Ayu", "7A")).unwrap();
        assert_eq!(svc.sync_status().status, SyncStatus::Online);
        assert_eq!(svc.pending_count(), 0);
        assert_eq!(svc.get_student("S1").unwrap().unwrap().name, "Ayu");
    }

    #[tokio::test]
    async fn switching_modes_keeps_queue() {
        let remote = MemoryRemoteStore::new();
        remote.set_online(false);
        let svc = service(Mode::Cloud, &remote);
        svc.save_student(&Student::new("S1", "Ayu", "7A")).unwrap();
        assert_eq!(svc.pending_count(), 1);

        svc.set_mode(Mode::Local).await.unwrap();
        assert_eq!(svc.mode(), Mode::Local);
        assert_eq!(svc.pending_count(), 1);

        remote.set_online(true);
        svc.set_mode(Mode::Cloud).await.unwrap();
        let state = svc.force_sync_now().await;
        assert_eq!(state.pending_count, 0);
        assert!(remote.row(EntityType::Student, "S1").is_some());
        svc.shutdown().await;
    }

    #[tokio::test]
    async fn status_listener_stops_after_unsubscribe() {
        let remote = MemoryRemoteStore::new();
        let svc = service(Mode::Cloud, &remote);
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        let mut sub = svc.on_sync_status_change(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        });
        svc.force_sync_now().await;
        tokio::task::yield_now().await;
        sub.unsubscribe();
        let seen = calls.load(Ordering::SeqCst);

        svc.save_student(&Student::new("S1", "Ayu", "7A")).unwrap();
        svc.force_sync_now().await;
        tokio::task::yield_now().await;
        assert_eq!(calls.load(Ordering::SeqCst), seen);
        svc.shutdown().await;
    }

    #[tokio::test]
    async fn notifications_reach_their_audience() {
        let svc = DataService::builder().clock(clock()).build().unwrap();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        let _parents = svc.subscribe_to_notifications(
            EventFilter::all().audience(Audience::Parents),
            move |e| sink.lock().unwrap().push(e.entity_id.clone()),
        );

        for (id, audience) in [("n1", Audience::Parents), ("n2", Audience::Teachers), ("n3", Audience::All)] {
            svc.send_notification(&Notification {
                id: id.into(),
                target_audience: audience,
                target_id: None,
                title: "Assembly moved".into(),
                body: String::new(),
                created_at: Utc::now(),
                read: false,
            })
            .unwrap();
        }
        // Other kinds never reach a notification subscription.
        svc.save_student(&Student::new("S1", "Ayu", "7A")).unwrap();
        svc.writer.bus.flushed().await;
        assert_eq!(*seen.lock().unwrap(), vec!["n1", "n3"]);
    }

    #[tokio::test]
    async fn close_day_marks_absentees() {
        let svc = DataService::builder().clock(clock()).build().unwrap();
        svc.save_student(&Student::new("S1", "Ayu", "7A")).unwrap();
        svc.save_student(&Student::new("S2", "Budi", "7A")).unwrap();
        svc.preload_for_kiosk().await.unwrap();
        assert!(svc.mark_attendance_fast("S1").await.success);

        let today = svc.today();
        let summary = svc.close_day(today).await.unwrap();
        assert_eq!((summary.present, summary.late, summary.absent), (1, 0, 1));
        assert_eq!(summary.by_class["7A"].absent, 1);
        assert_eq!(svc.get_daily_summary(today).unwrap(), Some(summary));

        // Closing again writes nothing new.
        let again = svc.close_day(today).await.unwrap();
        assert_eq!(again.absent, 1);
    }

    #[tokio::test]
    async fn diagnostics_cover_every_check() {
        let svc = DataService::builder().clock(clock()).build().unwrap();
        let results = svc.run_diagnostics().await;
        let checks: Vec<_> = results.iter().map(|r| r.check.as_str()).collect();
        assert_eq!(
            checks,
            vec![
                "mode",
                "connectivity",
                "sync",
                "queueDepth",
                "deadLetters",
                "rejected",
                "conflicts",
                "eventLog",
                "kioskSnapshot"
            ]
        );
        let snapshot = results.last().unwrap();
        assert_eq!(snapshot.status, CheckStatus::Warning);
    }

    #[tokio::test]
    async fn deleting_missing_entity_is_not_found() {
        let svc = DataService::builder().build().unwrap();
        assert!(matches!(
            svc.delete_student("S404").unwrap_err(),
            Error::NotFound { .. }
        ));
    }
}
