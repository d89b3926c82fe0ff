//! Attendance rules.
//!
//! Pure pieces of the kiosk flow: deciding `present` vs `late` from the
//! assembly policy, the roster snapshot the kiosk resolves scans against,
//! per-student statistics and the end-of-day summary.

use crate::{Entity, EntityId, EntityType, Student};
use chrono::{DateTime, NaiveDate, NaiveTime, Timelike, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AttendanceStatus {
    Present,
    Late,
    Absent,
}

/// Id of the attendance record for a student on a date.
///
/// Deterministic so the `(studentId, date)` uniqueness check is a point
/// lookup and two devices marking the same student converge on one row.
pub fn attendance_id(student_id: &str, date: NaiveDate) -> EntityId {
    format!("{}:{}", student_id, date.format("%Y-%m-%d"))
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AttendanceRecord {
    pub id: EntityId,
    pub student_id: EntityId,
    #[serde(default)]
    pub class_name: String,
    pub date: NaiveDate,
    pub timestamp: DateTime<Utc>,
    pub status: AttendanceStatus,
    #[serde(default)]
    pub minutes_late: u32,
}

impl AttendanceRecord {
    pub fn new(
        student: &Student,
        date: NaiveDate,
        timestamp: DateTime<Utc>,
        evaluation: Evaluation,
    ) -> Self {
        Self {
            id: attendance_id(&student.id, date),
            student_id: student.id.clone(),
            class_name: student.class_name.clone(),
            date,
            timestamp,
            status: evaluation.status,
            minutes_late: evaluation.minutes_late,
        }
    }

    /// An absence written when the day is closed.
    pub fn absent(student: &Student, date: NaiveDate, timestamp: DateTime<Utc>) -> Self {
        Self::new(
            student,
            date,
            timestamp,
            Evaluation {
                status: AttendanceStatus::Absent,
                minutes_late: 0,
            },
        )
    }
}

impl Entity for AttendanceRecord {
    const TYPE: EntityType = EntityType::Attendance;

    fn id(&self) -> &str {
        &self.id
    }
}

/// Status decided for one scan.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Evaluation {
    pub status: AttendanceStatus,
    pub minutes_late: u32,
}

/// Assembly time plus grace period.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AttendancePolicy {
    pub assembly_time: NaiveTime,
    pub grace_period_minutes: u32,
}

impl AttendancePolicy {
    pub fn new(assembly_time: NaiveTime, grace_period_minutes: u32) -> Self {
        Self {
            assembly_time,
            grace_period_minutes,
        }
    }

    /// Latest time of day that still counts as present, or `None` when the
    /// grace period runs past midnight.
    pub fn cutoff(&self) -> Option<NaiveTime> {
        let secs = self.cutoff_secs();
        u32::try_from(secs)
            .ok()
            .and_then(|s| NaiveTime::from_num_seconds_from_midnight_opt(s, 0))
    }

    fn cutoff_secs(&self) -> i64 {
        self.assembly_time.num_seconds_from_midnight() as i64
            + self.grace_period_minutes as i64 * 60
    }

    /// Late if the scan is strictly after the cutoff. Minutes late are
    /// counted from the cutoff and rounded up, so one second past it is one
    /// minute late. The cutoff never wraps into the next day.
    pub fn evaluate(&self, local_time: NaiveTime) -> Evaluation {
        let scanned = local_time.num_seconds_from_midnight() as i64;
        let over = scanned - self.cutoff_secs();
        if over <= 0 {
            return Evaluation {
                status: AttendanceStatus::Present,
                minutes_late: 0,
            };
        }
        Evaluation {
            status: AttendanceStatus::Late,
            minutes_late: (over as u64).div_ceil(60) as u32,
        }
    }
}

/// Read-only roster index used by the kiosk.
#[derive(Debug, Clone, Default)]
pub struct AttendanceSnapshot {
    students: HashMap<EntityId, Student>,
    built_at: Option<DateTime<Utc>>,
}

impl AttendanceSnapshot {
    /// Index the active students of a roster.
    pub fn build(roster: impl IntoIterator<Item = Student>, built_at: DateTime<Utc>) -> Self {
        let students = roster
            .into_iter()
            .filter(|s| s.active)
            .map(|s| (s.id.clone(), s))
            .collect();
        Self {
            students,
            built_at: Some(built_at),
        }
    }

    pub fn get(&self, student_id: &str) -> Option<&Student> {
        self.students.get(student_id)
    }

    pub fn len(&self) -> usize {
        self.students.len()
    }

    pub fn is_empty(&self) -> bool {
        self.students.is_empty()
    }

    /// `None` until a preload has run.
    pub fn built_at(&self) -> Option<DateTime<Utc>> {
        self.built_at
    }

    pub fn students(&self) -> impl Iterator<Item = &Student> {
        self.students.values()
    }
}

/// Historical counts for one student.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AttendanceStats {
    pub present_days: u32,
    pub late_days: u32,
    pub absent_days: u32,
    pub total_minutes_late: u64,
}

impl AttendanceStats {
    pub fn from_records<'a>(records: impl IntoIterator<Item = &'a AttendanceRecord>) -> Self {
        let mut stats = Self::default();
        for r in records {
            stats.add(r);
        }
        stats
    }

    /// Fold one more record in.
    pub fn add(&mut self, record: &AttendanceRecord) {
        match record.status {
            AttendanceStatus::Present => self.present_days += 1,
            AttendanceStatus::Late => self.late_days += 1,
            AttendanceStatus::Absent => self.absent_days += 1,
        }
        self.total_minutes_late += record.minutes_late as u64;
    }
}

/// Per-class counts inside a [`DailySummary`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClassTally {
    pub present: u32,
    pub late: u32,
    pub absent: u32,
}

/// Attendance totals for one school day. The id is the date.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DailySummary {
    pub id: EntityId,
    pub date: NaiveDate,
    pub present: u32,
    pub late: u32,
    pub absent: u32,
    pub total_minutes_late: u64,
    #[serde(default)]
    pub by_class: BTreeMap<String, ClassTally>,
}

impl DailySummary {
    /// Tally a day's records.
    pub fn tally<'a>(
        date: NaiveDate,
        records: impl IntoIterator<Item = &'a AttendanceRecord>,
    ) -> Self {
        let mut summary = Self {
            id: date.format("%Y-%m-%d").to_string(),
            date,
            present: 0,
            late: 0,
            absent: 0,
            total_minutes_late: 0,
            by_class: BTreeMap::new(),
        };

        for r in records.into_iter().filter(|r| r.date == date) {
            let class = summary.by_class.entry(r.class_name.clone()).or_default();
            match r.status {
                AttendanceStatus::Present => {
                    summary.present += 1;
                    class.present += 1;
                }
                AttendanceStatus::Late => {
                    summary.late += 1;
                    class.late += 1;
                }
                AttendanceStatus::Absent => {
                    summary.absent += 1;
                    class.absent += 1;
                }
            }
            summary.total_minutes_late += r.minutes_late as u64;
        }

        summary
    }
}

impl Entity for DailySummary {
    const TYPE: EntityType = EntityType::DailySummary;

    fn id(&self) -> &str {
        &self.id
    }
}

/// Students on the roster with no record for the day.
pub fn absentees<'a>(
    roster: impl IntoIterator<Item = &'a Student>,
    records: &[AttendanceRecord],
) -> Vec<&'a Student> {
    let marked: std::collections::HashSet<&str> =
        records.iter().map(|r| r.student_id.as_str()).collect();
    let mut out: Vec<_> = roster
        .into_iter()
        .filter(|s| s.active && !marked.contains(s.id.as_str()))
        .collect();
    out.sort_by(|a, b| a.id.cmp(&b.id));
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn hm(h: u32, m: u32) -> NaiveTime {
        NaiveTime::from_hms_opt(h, m, 0).unwrap()
    }

    fn day() -> NaiveDate {
        NaiveDate::from_ymd_opt(2024, 7, 15).unwrap()
    }

    fn policy() -> AttendancePolicy {
        AttendancePolicy::new(hm(7, 0), 10)
    }

    fn record(student: &str, class: &str, status: AttendanceStatus, late: u32) -> AttendanceRecord {
        AttendanceRecord {
            id: attendance_id(student, day()),
            student_id: student.into(),
            class_name: class.into(),
            date: day(),
            timestamp: Utc.with_ymd_and_hms(2024, 7, 15, 0, 0, 0).unwrap(),
            status,
            minutes_late: late,
        }
    }

    #[test]
    fn scan_within_grace_is_present() {
        let e = policy().evaluate(hm(7, 5));
        assert_eq!(e.status, AttendanceStatus::Present);
        assert_eq!(e.minutes_late, 0);
    }

    #[test]
    fn scan_at_cutoff_is_present() {
        let e = policy().evaluate(hm(7, 10));
        assert_eq!(e.status, AttendanceStatus::Present);
    }

    #[test]
    fn scan_after_grace_is_late() {
        let e = policy().evaluate(hm(7, 15));
        assert_eq!(e.status, AttendanceStatus::Late);
        assert_eq!(e.minutes_late, 5);
    }

    #[test]
    fn partial_minutes_round_up() {
        let e = policy().evaluate(NaiveTime::from_hms_opt(7, 10, 1).unwrap());
        assert_eq!(e.status, AttendanceStatus::Late);
        assert_eq!(e.minutes_late, 1);
    }

    #[test]
    fn attendance_id_is_deterministic() {
        assert_eq!(attendance_id("S1", day()), "S1:2024-07-15");
    }

    #[test]
    fn snapshot_skips_inactive_students() {
        let mut gone = Student::new("S2", "Budi", "7A");
        gone.active = false;
        let snapshot = AttendanceSnapshot::build(
            vec![Student::new("S1", "Ayu", "7A"), gone],
            Utc::now(),
        );
        assert_eq!(snapshot.len(), 1);
        assert!(snapshot.get("S1").is_some());
        assert!(snapshot.get("S2").is_none());
        assert!(snapshot.built_at().is_some());
        assert!(AttendanceSnapshot::default().built_at().is_none());
    }

    #[test]
    fn stats_accumulate() {
        let records = vec![
            record("S1", "7A", AttendanceStatus::Present, 0),
            record("S1", "7A", AttendanceStatus::Late, 5),
            record("S1", "7A", AttendanceStatus::Late, 12),
            record("S1", "7A", AttendanceStatus::Absent, 0),
        ];
        let stats = AttendanceStats::from_records(&records);
        assert_eq!(stats.present_days, 1);
        assert_eq!(stats.late_days, 2);
        assert_eq!(stats.absent_days, 1);
        assert_eq!(stats.total_minutes_late, 17);
    }

    #[test]
    fn grace_period_past_midnight_does_not_wrap() {
        let policy = AttendancePolicy::new(NaiveTime::from_hms_opt(23, 30, 0).unwrap(), 60);
        assert_eq!(policy.cutoff(), None);
        let eval = policy.evaluate(NaiveTime::from_hms_opt(23, 40, 0).unwrap());
        assert_eq!(eval.status, AttendanceStatus::Present);
        assert_eq!(eval.minutes_late, 0);

        let policy = AttendancePolicy::new(NaiveTime::from_hms_opt(23, 30, 0).unwrap(), 20);
        assert_eq!(policy.cutoff(), NaiveTime::from_hms_opt(23, 50, 0));
        let eval = policy.evaluate(NaiveTime::from_hms_opt(23, 55, 0).unwrap());
        assert_eq!(eval.minutes_late, 5);
    }

    #[test]
    fn summary_tallies_by_class() {
        let records = vec![
            record("S1", "7A", AttendanceStatus::Present, 0),
            record("S2", "7A", AttendanceStatus::Late, 4),
            record("S3", "7B", AttendanceStatus::Absent, 0),
        ];
        let summary = DailySummary::tally(day(), &records);
        assert_eq!(summary.id, "2024-07-15");
        assert_eq!((summary.present, summary.late, summary.absent), (1, 1, 1));
        assert_eq!(summary.total_minutes_late, 4);
        assert_eq!(summary.by_class["7A"].late, 1);
        assert_eq!(summary.by_class["7B"].absent, 1);
    }

    #[test]
    fn absentees_are_unmarked_active_students() {
        let roster = vec![
            Student::new("S1", "Ayu", "7A"),
            Student::new("S2", "Budi", "7A"),
            Student::new("S3", "Citra", "7B"),
        ];
        let records = vec![record("S2", "7A", AttendanceStatus::Present, 0)];
        let missing: Vec<_> = absentees(&roster, &records)
            .into_iter()
            .map(|s| s.id.as_str())
            .collect();
        assert_eq!(missing, vec!["S1", "S3"]);
    }

    mod property_tests {
        use super::*;
        use proptest::prelude::*;

        proptest! {
            #[test]
            fn late_exactly_when_past_cutoff(
                assembly in 0u32..(20 * 3600),
                grace in 0u32..60,
                offset in 0u32..(3 * 3600),
            ) {
                let assembly_time = NaiveTime::from_num_seconds_from_midnight_opt(assembly, 0).unwrap();
                let policy = AttendancePolicy::new(assembly_time, grace);
                let scan = NaiveTime::from_num_seconds_from_midnight_opt(assembly + offset, 0).unwrap();
                let eval = policy.evaluate(scan);

                let past = offset > grace * 60;
                prop_assert_eq!(eval.status == AttendanceStatus::Late, past);
                if past {
                    let over = offset - grace * 60;
                    prop_assert_eq!(eval.minutes_late, over.div_ceil(60));
                } else {
                    prop_assert_eq!(eval.minutes_late, 0);
                }
            }

            #[test]
            fn stats_count_every_record(statuses in proptest::collection::vec(0u8..3, 0..40)) {
                let records: Vec<_> = statuses
                    .iter()
                    .enumerate()
                    .map(|(i, s)| {
                        let status = match s {
                            0 => AttendanceStatus::Present,
                            1 => AttendanceStatus::Late,
                            _ => AttendanceStatus::Absent,
                        };
                        let late = if status == AttendanceStatus::Late { 3 } else { 0 };
                        record(&format!("S{i}"), "7A", status, late)
                    })
                    .collect();
                let stats = AttendanceStats::from_records(&records);
                let total = stats.present_days + stats.late_days + stats.absent_days;
                prop_assert_eq!(total as usize, records.len());
                prop_assert_eq!(stats.total_minutes_late, stats.late_days as u64 * 3);
            }
        }
    }
}
