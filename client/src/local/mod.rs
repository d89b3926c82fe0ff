//! Local Store Adapter.
//!
//! Durable, indexed key-value storage on the device. Every call is
//! synchronous and returns only once the change is durable, so a kiosk that
//! loses power right after a scan still has the record on restart.
//!
//! Two implementations share the [`LocalStore`] trait: [`FileStore`] keeps one
//! append-only log per table on disk and [`MemoryStore`] keeps everything in
//! memory for tests and demos.

mod file;
mod index;
mod memory;

pub use file::FileStore;
pub use memory::MemoryStore;

use crate::error::StorageError;
use rollcall_engine::{EntityType, Query, Schema};
use std::fmt;

pub(crate) use index::IndexedTable;

/// A durable table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Table {
    /// One table per entity type.
    Entity(EntityType),
    /// The pending-mutation queue.
    Mutations,
    /// The delivered-event dedup log.
    DeliveredEvents,
    /// Last server timestamp seen per entity, keyed by [`version_key`].
    Versions,
}

impl Table {
    /// Every table a store holds.
    pub fn all() -> Vec<Table> {
        let mut tables: Vec<Table> = EntityType::ALL.into_iter().map(Table::Entity).collect();
        tables.extend([Table::Mutations, Table::DeliveredEvents, Table::Versions]);
        tables
    }

    pub fn name(&self) -> &'static str {
        match self {
            Table::Entity(t) => t.table(),
            Table::Mutations => "mutations",
            Table::DeliveredEvents => "delivered_events",
            Table::Versions => "entity_versions",
        }
    }

    /// Payload fields kept in a secondary index.
    pub fn indexed_fields(&self, schema: &Schema) -> Vec<String> {
        match self {
            Table::Entity(t) => schema
                .entity(*t)
                .indexed_fields()
                .map(str::to_string)
                .collect(),
            Table::Mutations => vec!["entityId".to_string()],
            Table::DeliveredEvents | Table::Versions => Vec::new(),
        }
    }
}

impl fmt::Display for Table {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Key of an entity in [`Table::Versions`].
pub fn version_key(entity_type: EntityType, entity_id: &str) -> String {
    format!("{}/{}", entity_type, entity_id)
}

/// Durable local storage.
///
/// Rows are JSON values keyed by id. Writers go through the data service so
/// the mutation queue sees every change; readers may query directly.
pub trait LocalStore: Send + Sync + fmt::Debug {
    fn get(&self, table: Table, id: &str) -> Result<Option<serde_json::Value>, StorageError>;

    /// Insert or replace a row. Durable once this returns.
    fn put(&self, table: Table, id: &str, value: serde_json::Value) -> Result<(), StorageError>;

    /// Remove a row. Returns whether it existed.
    fn delete(&self, table: Table, id: &str) -> Result<bool, StorageError>;

    /// Rows matching `query`, ordered by id.
    fn query(&self, table: Table, query: &Query) -> Result<Vec<serde_json::Value>, StorageError>;

    fn count(&self, table: Table) -> Result<usize, StorageError>;

    /// Every row in a table.
    fn scan(&self, table: Table) -> Result<Vec<serde_json::Value>, StorageError> {
        self.query(table, &Query::all())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn table_names_are_unique() {
        let tables = Table::all();
        let mut names: Vec<_> = tables.iter().map(Table::name).collect();
        names.sort();
        names.dedup();
        assert_eq!(names.len(), tables.len());
    }

    #[test]
    fn indexed_fields_follow_schema() {
        let schema = Schema::default();
        let fields = Table::Entity(EntityType::Attendance).indexed_fields(&schema);
        assert!(fields.contains(&"studentId".to_string()));
        assert!(fields.contains(&"date".to_string()));
        assert!(Table::Versions.indexed_fields(&schema).is_empty());
    }

    #[test]
    fn version_keys() {
        assert_eq!(version_key(EntityType::Student, "S1"), "student/S1");
    }
}
