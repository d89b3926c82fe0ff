//! Domain entities.
//!
//! Every record the school product stores is an [`Entity`]: a serde type with
//! a stable id and a fixed [`EntityType`]. Stores persist entities as JSON
//! payloads in one table per type.

use crate::{error::Result, Audience, EntityId, Error};
use chrono::{DateTime, NaiveDate, NaiveTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// The kinds of record the product stores.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum EntityType {
    Student,
    Class,
    User,
    Attendance,
    Exit,
    Violation,
    Notification,
    Settings,
    DailySummary,
}

impl EntityType {
    /// All entity types, in table creation order.
    pub const ALL: [EntityType; 9] = [
        EntityType::Student,
        EntityType::Class,
        EntityType::User,
        EntityType::Attendance,
        EntityType::Exit,
        EntityType::Violation,
        EntityType::Notification,
        EntityType::Settings,
        EntityType::DailySummary,
    ];

    /// Wire name, as used in mutation records and events.
    pub fn as_str(&self) -> &'static str {
        match self {
            EntityType::Student => "student",
            EntityType::Class => "class",
            EntityType::User => "user",
            EntityType::Attendance => "attendance",
            EntityType::Exit => "exit",
            EntityType::Violation => "violation",
            EntityType::Notification => "notification",
            EntityType::Settings => "settings",
            EntityType::DailySummary => "dailySummary",
        }
    }

    /// Name of the durable table holding this type.
    pub fn table(&self) -> &'static str {
        match self {
            EntityType::Student => "students",
            EntityType::Class => "classes",
            EntityType::User => "users",
            EntityType::Attendance => "attendance",
            EntityType::Exit => "exits",
            EntityType::Violation => "violations",
            EntityType::Notification => "notifications",
            EntityType::Settings => "settings",
            EntityType::DailySummary => "daily_summaries",
        }
    }
}

impl fmt::Display for EntityType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EntityType {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        EntityType::ALL
            .into_iter()
            .find(|t| t.as_str() == s || t.table() == s)
            .ok_or_else(|| Error::UnknownEntityType(s.to_string()))
    }
}

/// A typed domain record.
pub trait Entity: Serialize + DeserializeOwned + Clone + Send + Sync + 'static {
    const TYPE: EntityType;

    fn id(&self) -> &str;
}

/// Serialize an entity into its stored payload.
pub fn to_payload<E: Entity>(entity: &E) -> Result<serde_json::Value> {
    serde_json::to_value(entity).map_err(|e| Error::InvalidPayload(e.to_string()))
}

/// Decode a stored payload back into an entity.
pub fn from_payload<E: Entity>(payload: serde_json::Value) -> Result<E> {
    serde_json::from_value(payload)
        .map_err(|e| Error::InvalidPayload(format!("{}: {}", E::TYPE, e)))
}

/// Read the `id` field of a raw payload.
pub fn payload_id(payload: &serde_json::Value) -> Option<&str> {
    payload.get("id").and_then(|v| v.as_str())
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Student {
    pub id: EntityId,
    pub name: String,
    pub class_name: String,
    /// School-issued student number printed on the card.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub nis: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_user_id: Option<String>,
    #[serde(default = "default_true")]
    pub active: bool,
}

impl Student {
    pub fn new(
        id: impl Into<EntityId>,
        name: impl Into<String>,
        class_name: impl Into<String>,
    ) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            class_name: class_name.into(),
            nis: None,
            parent_user_id: None,
            active: true,
        }
    }
}

impl Entity for Student {
    const TYPE: EntityType = EntityType::Student;

    fn id(&self) -> &str {
        &self.id
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Class {
    pub id: EntityId,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub homeroom_teacher_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub grade: Option<i64>,
}

impl Entity for Class {
    const TYPE: EntityType = EntityType::Class;

    fn id(&self) -> &str {
        &self.id
    }
}

/// Role of a user account.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Admin,
    Teacher,
    Parent,
    Watcher,
    Supervisor,
}

impl Role {
    /// The notification audience a user of this role belongs to.
    pub fn audience(&self) -> Audience {
        match self {
            Role::Admin => Audience::Admins,
            Role::Teacher => Audience::Teachers,
            Role::Parent => Audience::Parents,
            Role::Watcher => Audience::Watchers,
            Role::Supervisor => Audience::Supervisors,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct User {
    pub id: EntityId,
    pub username: String,
    pub role: Role,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub display_name: Option<String>,
    /// Opaque credential hash; checked by the auth layer, never here.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub password_hash: Option<String>,
    /// Students a parent account may see.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub student_ids: Vec<EntityId>,
}

impl Entity for User {
    const TYPE: EntityType = EntityType::User;

    fn id(&self) -> &str {
        &self.id
    }
}

/// A student leaving the premises during school hours.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExitRecord {
    pub id: EntityId,
    pub student_id: EntityId,
    pub date: NaiveDate,
    pub reason: String,
    pub left_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub returned_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub approved_by: Option<String>,
}

impl Entity for ExitRecord {
    const TYPE: EntityType = EntityType::Exit;

    fn id(&self) -> &str {
        &self.id
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ViolationRecord {
    pub id: EntityId,
    pub student_id: EntityId,
    pub date: NaiveDate,
    pub description: String,
    pub points: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub recorded_by: Option<String>,
}

impl Entity for ViolationRecord {
    const TYPE: EntityType = EntityType::Violation;

    fn id(&self) -> &str {
        &self.id
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Notification {
    pub id: EntityId,
    pub target_audience: Audience,
    /// Narrows delivery to one student's watchers (e.g. their parent).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target_id: Option<EntityId>,
    pub title: String,
    #[serde(default)]
    pub body: String,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub read: bool,
}

impl Entity for Notification {
    const TYPE: EntityType = EntityType::Notification;

    fn id(&self) -> &str {
        &self.id
    }
}

/// School-wide settings. There is a single row, [`Settings::ID`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Settings {
    pub id: EntityId,
    #[serde(with = "hhmm")]
    pub assembly_time: NaiveTime,
    pub grace_period_minutes: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub school_name: Option<String>,
}

impl Settings {
    pub const ID: &'static str = "school";

    /// Attendance policy derived from these settings.
    pub fn policy(&self) -> crate::AttendancePolicy {
        crate::AttendancePolicy::new(self.assembly_time, self.grace_period_minutes)
    }
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            id: Self::ID.to_string(),
            assembly_time: NaiveTime::from_hms_opt(7, 0, 0).unwrap_or_default(),
            grace_period_minutes: 10,
            school_name: None,
        }
    }
}

impl Entity for Settings {
    const TYPE: EntityType = EntityType::Settings;

    fn id(&self) -> &str {
        &self.id
    }
}

fn default_true() -> bool {
    true
}

/// `HH:MM` on the wire; `HH:MM:SS` is accepted on input.
mod hhmm {
    use chrono::NaiveTime;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(time: &NaiveTime, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&time.format("%H:%M").to_string())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<NaiveTime, D::Error> {
        let raw = String::deserialize(d)?;
        NaiveTime::parse_from_str(&raw, "%H:%M")
            .or_else(|_| NaiveTime::parse_from_str(&raw, "%H:%M:%S"))
            .map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn entity_type_names() {
        assert_eq!(EntityType::DailySummary.as_str(), "dailySummary");
        assert_eq!(EntityType::DailySummary.table(), "daily_summaries");
        assert_eq!(
            "attendance".parse::<EntityType>().unwrap(),
            EntityType::Attendance
        );
        assert_eq!("students".parse::<EntityType>().unwrap(), EntityType::Student);
        assert!(matches!(
            "pets".parse::<EntityType>(),
            Err(Error::UnknownEntityType(t)) if t == "pets"
        ));
    }

    #[test]
    fn entity_type_serializes_like_as_str() {
        for t in EntityType::ALL {
            let json = serde_json::to_value(t).unwrap();
            assert_eq!(json, json!(t.as_str()));
        }
    }

    #[test]
    fn student_payload_is_camel_case() {
        let student = Student::new("S1", "Ayu", "7A");
        let payload = to_payload(&student).unwrap();
        assert_eq!(payload["className"], "7A");
        assert_eq!(payload["active"], true);
        assert!(payload.get("nis").is_none());

        let back: Student = from_payload(payload).unwrap();
        assert_eq!(back, student);
    }

    #[test]
    fn student_defaults_to_active() {
        let student: Student =
            from_payload(json!({"id": "S1", "name": "Ayu", "className": "7A"})).unwrap();
        assert!(student.active);
    }

    #[test]
    fn settings_time_format() {
        let settings = Settings::default();
        let payload = to_payload(&settings).unwrap();
        assert_eq!(payload["assemblyTime"], "07:00");

        let parsed: Settings = from_payload(json!({
            "id": "school",
            "assemblyTime": "06:45:00",
            "gracePeriodMinutes": 5
        }))
        .unwrap();
        assert_eq!(
            parsed.assembly_time,
            NaiveTime::from_hms_opt(6, 45, 0).unwrap()
        );
    }

    #[test]
    fn from_payload_reports_type() {
        let err = from_payload::<Student>(json!({"id": "S1"})).unwrap_err();
        assert!(matches!(err, Error::InvalidPayload(msg) if msg.starts_with("student:")));
    }

    #[test]
    fn role_audience() {
        assert_eq!(Role::Parent.audience(), Audience::Parents);
        assert_eq!(Role::Watcher.audience(), Audience::Watchers);
    }
}
