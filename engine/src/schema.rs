//! Schema definition and validation.
//!
//! Each entity type has a fixed [`EntitySchema`]. Schemas validate payloads
//! before they are committed, and mark which fields the local store keeps a
//! secondary index for.

use crate::{error::Result, EntityType, Error};
use chrono::{DateTime, NaiveDate, NaiveTime};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Field types supported in schemas.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FieldType {
    String,
    Int,
    Float,
    Bool,
    /// RFC 3339 string
    Timestamp,
    /// `YYYY-MM-DD` string
    Date,
    /// `HH:MM` or `HH:MM:SS` string
    Time,
    /// Arbitrary nested JSON
    Json,
}

impl std::fmt::Display for FieldType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FieldType::String => write!(f, "String"),
            FieldType::Int => write!(f, "Int"),
            FieldType::Float => write!(f, "Float"),
            FieldType::Bool => write!(f, "Bool"),
            FieldType::Timestamp => write!(f, "Timestamp"),
            FieldType::Date => write!(f, "Date"),
            FieldType::Time => write!(f, "Time"),
            FieldType::Json => write!(f, "Json"),
        }
    }
}

/// Definition of a field in an entity payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FieldDef {
    /// Field name
    pub name: String,
    /// Field type
    pub field_type: FieldType,
    /// Whether this field is required
    pub required: bool,
    /// Whether the local store indexes this field
    pub indexed: bool,
}

impl FieldDef {
    /// Create a new required field definition.
    pub fn required(name: impl Into<String>, field_type: FieldType) -> Self {
        Self {
            name: name.into(),
            field_type,
            required: true,
            indexed: false,
        }
    }

    /// Create a new optional field definition.
    pub fn optional(name: impl Into<String>, field_type: FieldType) -> Self {
        Self {
            name: name.into(),
            field_type,
            required: false,
            indexed: false,
        }
    }

    /// Mark the field as indexed.
    pub fn indexed(mut self) -> Self {
        self.indexed = true;
        self
    }

    /// Validate a JSON value against this field definition.
    pub fn validate(&self, value: Option<&serde_json::Value>) -> Result<()> {
        match value {
            None if self.required => Err(Error::MissingRequiredField(self.name.clone())),
            None => Ok(()),
            Some(serde_json::Value::Null) if self.required => {
                Err(Error::MissingRequiredField(self.name.clone()))
            }
            Some(serde_json::Value::Null) => Ok(()),
            Some(v) => self.validate_type(v),
        }
    }

    fn validate_type(&self, value: &serde_json::Value) -> Result<()> {
        let valid = match self.field_type {
            FieldType::String => value.is_string(),
            FieldType::Int => value.is_i64() || value.is_u64(),
            FieldType::Float => value.is_f64() || value.is_i64() || value.is_u64(),
            FieldType::Bool => value.is_boolean(),
            FieldType::Timestamp => value
                .as_str()
                .is_some_and(|s| DateTime::parse_from_rfc3339(s).is_ok()),
            FieldType::Date => value
                .as_str()
                .is_some_and(|s| NaiveDate::parse_from_str(s, "%Y-%m-%d").is_ok()),
            FieldType::Time => value.as_str().is_some_and(|s| {
                NaiveTime::parse_from_str(s, "%H:%M").is_ok()
                    || NaiveTime::parse_from_str(s, "%H:%M:%S").is_ok()
            }),
            FieldType::Json => true, // Any JSON is valid
        };

        if valid {
            Ok(())
        } else {
            Err(Error::TypeMismatch {
                field: self.name.clone(),
                expected: self.field_type.to_string(),
                got: json_type_name(value).to_string(),
            })
        }
    }
}

fn json_type_name(value: &serde_json::Value) -> &'static str {
    match value {
        serde_json::Value::Null => "Null",
        serde_json::Value::Bool(_) => "Bool",
        serde_json::Value::Number(n) if n.is_i64() || n.is_u64() => "Int",
        serde_json::Value::Number(_) => "Float",
        serde_json::Value::String(_) => "String",
        serde_json::Value::Array(_) => "Array",
        serde_json::Value::Object(_) => "Object",
    }
}

/// Schema for one entity type.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EntitySchema {
    pub entity_type: EntityType,
    pub fields: Vec<FieldDef>,
}

impl EntitySchema {
    pub fn new(entity_type: EntityType, fields: Vec<FieldDef>) -> Self {
        Self {
            entity_type,
            fields,
        }
    }

    /// Validate a payload against this schema.
    pub fn validate_payload(&self, payload: &serde_json::Value) -> Result<()> {
        let obj = payload
            .as_object()
            .ok_or_else(|| Error::InvalidPayload("payload must be an object".into()))?;

        for field in &self.fields {
            field.validate(obj.get(&field.name))?;
        }

        Ok(())
    }

    /// Names of the fields the local store indexes.
    pub fn indexed_fields(&self) -> impl Iterator<Item = &str> {
        self.fields
            .iter()
            .filter(|f| f.indexed)
            .map(|f| f.name.as_str())
    }
}

/// Schemas for every entity type.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Schema {
    entities: HashMap<EntityType, EntitySchema>,
}

impl Schema {
    /// Get the schema for an entity type.
    pub fn entity(&self, entity_type: EntityType) -> &EntitySchema {
        // Every EntityType is registered in Default.
        &self.entities[&entity_type]
    }

    /// Validate a payload written as `entity_type` with id `entity_id`.
    pub fn validate(
        &self,
        entity_type: EntityType,
        entity_id: &str,
        payload: &serde_json::Value,
    ) -> Result<()> {
        self.entity(entity_type).validate_payload(payload)?;
        match crate::entity::payload_id(payload) {
            Some(id) if id == entity_id => Ok(()),
            Some(id) => Err(Error::IdMismatch {
                payload: id.to_string(),
                target: entity_id.to_string(),
            }),
            None => Err(Error::MissingRequiredField("id".into())),
        }
    }
}

impl Default for Schema {
    fn default() -> Self {
        use FieldType::*;
        let id = || FieldDef::required("id", String);

        let schemas = vec![
            EntitySchema::new(
                EntityType::Student,
                vec![
                    id(),
                    FieldDef::required("name", String),
                    FieldDef::required("className", String).indexed(),
                    FieldDef::optional("nis", String),
                    FieldDef::optional("parentUserId", String),
                    FieldDef::optional("active", Bool),
                ],
            ),
            EntitySchema::new(
                EntityType::Class,
                vec![
                    id(),
                    FieldDef::required("name", String),
                    FieldDef::optional("homeroomTeacherId", String),
                    FieldDef::optional("grade", Int),
                ],
            ),
            EntitySchema::new(
                EntityType::User,
                vec![
                    id(),
                    FieldDef::required("username", String),
                    FieldDef::required("role", String).indexed(),
                    FieldDef::optional("displayName", String),
                    FieldDef::optional("passwordHash", String),
                    FieldDef::optional("studentIds", Json),
                ],
            ),
            EntitySchema::new(
                EntityType::Attendance,
                vec![
                    id(),
                    FieldDef::required("studentId", String).indexed(),
                    FieldDef::required("date", Date).indexed(),
                    FieldDef::required("timestamp", Timestamp),
                    FieldDef::required("status", String),
                    FieldDef::optional("className", String).indexed(),
                    FieldDef::optional("minutesLate", Int),
                ],
            ),
            EntitySchema::new(
                EntityType::Exit,
                vec![
                    id(),
                    FieldDef::required("studentId", String).indexed(),
                    FieldDef::required("date", Date).indexed(),
                    FieldDef::required("reason", String),
                    FieldDef::optional("leftAt", Timestamp),
                    FieldDef::optional("returnedAt", Timestamp),
                    FieldDef::optional("approvedBy", String),
                ],
            ),
            EntitySchema::new(
                EntityType::Violation,
                vec![
                    id(),
                    FieldDef::required("studentId", String).indexed(),
                    FieldDef::required("date", Date).indexed(),
                    FieldDef::required("description", String),
                    FieldDef::required("points", Int),
                    FieldDef::optional("recordedBy", String),
                ],
            ),
            EntitySchema::new(
                EntityType::Notification,
                vec![
                    id(),
                    FieldDef::required("targetAudience", String).indexed(),
                    FieldDef::optional("targetId", String).indexed(),
                    FieldDef::required("title", String),
                    FieldDef::optional("body", String),
                    FieldDef::required("createdAt", Timestamp),
                    FieldDef::optional("read", Bool),
                ],
            ),
            EntitySchema::new(
                EntityType::Settings,
                vec![
                    id(),
                    FieldDef::required("assemblyTime", Time),
                    FieldDef::required("gracePeriodMinutes", Int),
                    FieldDef::optional("schoolName", String),
                ],
            ),
            EntitySchema::new(
                EntityType::DailySummary,
                vec![
                    id(),
                    FieldDef::required("date", Date).indexed(),
                    FieldDef::optional("present", Int),
                    FieldDef::optional("late", Int),
                    FieldDef::optional("absent", Int),
                    FieldDef::optional("totalMinutesLate", Int),
                    FieldDef::optional("byClass", Json),
                ],
            ),
        ];

        Self {
            entities: schemas.into_iter().map(|s| (s.entity_type, s)).collect(),
        }
    }
}
