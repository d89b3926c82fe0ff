//! In-memory local store.

use super::{IndexedTable, LocalStore, Table};
use crate::error::StorageError;
use rollcall_engine::{Query, Schema};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, MutexGuard};

/// A [`LocalStore`] that forgets everything on drop.
///
/// Writes can be made to fail on demand to exercise storage-error paths.
#[derive(Debug)]
pub struct MemoryStore {
    tables: HashMap<Table, Mutex<IndexedTable>>,
    fail_writes: AtomicBool,
}

impl MemoryStore {
    pub fn new(schema: &Schema) -> Self {
        let tables = Table::all()
            .into_iter()
            .map(|t| (t, Mutex::new(IndexedTable::new(t.indexed_fields(schema)))))
            .collect();
        Self {
            tables,
            fail_writes: AtomicBool::new(false),
        }
    }

    /// Make every subsequent `put`/`delete` fail until cleared.
    pub fn set_fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }

    fn table(&self, table: Table) -> Result<MutexGuard<'_, IndexedTable>, StorageError> {
        let lock = self
            .tables
            .get(&table)
            .ok_or_else(|| StorageError::Unavailable(format!("unknown table {}", table)))?;
        Ok(lock.lock().unwrap_or_else(|e| e.into_inner()))
    }

    fn check_writable(&self) -> Result<(), StorageError> {
        if self.fail_writes.load(Ordering::SeqCst) {
            Err(StorageError::Unavailable("writes disabled".into()))
        } else {
            Ok(())
        }
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new(&Schema::default())
    }
}

impl LocalStore for MemoryStore {
    fn get(&self, table: Table, id: &str) -> Result<Option<serde_json::Value>, StorageError> {
        Ok(self.table(table)?.get(id).cloned())
    }

    fn put(&self, table: Table, id: &str, value: serde_json::Value) -> Result<(), StorageError> {
        self.check_writable()?;
        self.table(table)?.insert(id.to_string(), value);
        Ok(())
    }

    fn delete(&self, table: Table, id: &str) -> Result<bool, StorageError> {
        self.check_writable()?;
        Ok(self.table(table)?.remove(id).is_some())
    }

    fn query(&self, table: Table, query: &Query) -> Result<Vec<serde_json::Value>, StorageError> {
        Ok(self.table(table)?.query(query))
    }

    fn count(&self, table: Table) -> Result<usize, StorageError> {
        Ok(self.table(table)?.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rollcall_engine::EntityType;
    use serde_json::json;

    #[test]
    fn basic_crud() {
        let store = MemoryStore::default();
        let t = Table::Entity(EntityType::Class);
        store.put(t, "7A", json!({"id": "7A", "name": "7A"})).unwrap();
        assert_eq!(store.count(t).unwrap(), 1);
        assert!(store.get(t, "7A").unwrap().is_some());
        assert!(store.delete(t, "7A").unwrap());
        assert_eq!(store.scan(t).unwrap().len(), 0);
    }

    #[test]
    fn failing_writes() {
        let store = MemoryStore::default();
        let t = Table::Entity(EntityType::Class);
        store.set_fail_writes(true);
        assert!(matches!(
            store.put(t, "7A", json!({})),
            Err(StorageError::Unavailable(_))
        ));
        assert!(store.get(t, "7A").unwrap().is_none());

        store.set_fail_writes(false);
        store.put(t, "7A", json!({})).unwrap();
    }
}
