//! Append-only log file store.
//!
//! Each table lives in `<dir>/<table>.log`, one JSON entry per line. Writes
//! append and `sync_data` before returning; opening a store replays every log
//! into an [`IndexedTable`]. A log is compacted once its dead entries
//! outnumber the live rows.

use super::{IndexedTable, LocalStore, Table};
use crate::error::StorageError;
use rollcall_engine::{Query, Schema};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};

/// Small logs are never worth rewriting.
const COMPACT_MIN_DEAD: usize = 64;

#[derive(Debug, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "lowercase")]
enum LogEntry {
    Put {
        id: String,
        value: serde_json::Value,
    },
    Del {
        id: String,
    },
}

#[derive(Debug)]
struct LogTable {
    path: PathBuf,
    file: File,
    data: IndexedTable,
    /// Log lines that no longer describe a live row.
    dead: usize,
    /// Length of the log up to the last committed entry.
    len: u64,
    /// Set when a failed append could not be rolled back.
    failed: Option<String>,
}

impl LogTable {
    fn open(path: PathBuf, indexed_fields: Vec<String>) -> Result<Self, StorageError> {
        let mut data = IndexedTable::new(indexed_fields);
        let mut lines = 0usize;

        let bytes = match fs::read(&path) {
            Ok(b) => b,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Vec::new(),
            Err(e) => return Err(StorageError::io(&path, e)),
        };

        // Offset just past the last complete line.
        let mut good_len = 0usize;
        let mut torn = false;
        let mut start = 0usize;
        let mut line_no = 0usize;

        while start < bytes.len() {
            line_no += 1;
            let (end, complete) = match bytes[start..].iter().position(|b| *b == b'\n') {
                Some(i) => (start + i, true),
                None => (bytes.len(), false),
            };
            let line = &bytes[start..end];

            if !line.iter().all(u8::is_ascii_whitespace) {
                match serde_json::from_slice::<LogEntry>(line) {
                    Ok(entry) => {
                        lines += 1;
                        apply(&mut data, entry);
                    }
                    Err(_) if !complete => {
                        tracing::warn!(
                            path = %path.display(),
                            line = line_no,
                            "discarding torn final log entry"
                        );
                        torn = true;
                        break;
                    }
                    Err(e) => {
                        return Err(StorageError::Corrupt {
                            path,
                            line: line_no,
                            reason: e.to_string(),
                        })
                    }
                }
            }

            if complete {
                good_len = end + 1;
            } else {
                good_len = end;
            }
            start = end + 1;
        }

        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .map_err(|e| StorageError::io(&path, e))?;

        let mut len = good_len as u64;
        if torn {
            file.set_len(len).map_err(|e| StorageError::io(&path, e))?;
        } else if !bytes.is_empty() && good_len == bytes.len() && bytes.last() != Some(&b'\n') {
            // Final entry decoded but its newline never made it to disk.
            file.write_all(b"\n")
                .map_err(|e| StorageError::io(&path, e))?;
            len += 1;
        }

        let dead = lines.saturating_sub(data.len());
        Ok(Self {
            path,
            file,
            data,
            dead,
            len,
            failed: None,
        })
    }

    /// Append one entry. Anything past the last committed entry, whether left
    /// by this append failing or by an earlier partial write, is cut off so
    /// the next entry always starts on a fresh line.
    fn append(&mut self, entry: &LogEntry) -> Result<(), StorageError> {
        if let Some(reason) = &self.failed {
            return Err(StorageError::Unavailable(format!(
                "{} is read-only after a failed write: {}",
                self.path.display(),
                reason
            )));
        }

        let mut line = serde_json::to_vec(entry)?;
        line.push(b'\n');

        let on_disk = self
            .file
            .metadata()
            .map_err(|e| StorageError::io(&self.path, e))?
            .len();
        if on_disk != self.len {
            tracing::warn!(
                path = %self.path.display(),
                stray_bytes = on_disk.saturating_sub(self.len),
                "truncating uncommitted bytes before append"
            );
            self.rollback()?;
        }

        let written = self
            .file
            .write_all(&line)
            .and_then(|_| self.file.sync_data());
        match written {
            Ok(()) => {
                self.len += line.len() as u64;
                Ok(())
            }
            Err(e) => {
                let err = StorageError::io(&self.path, e);
                if let Err(rollback) = self.rollback() {
                    tracing::error!(
                        path = %self.path.display(),
                        error = %rollback,
                        "could not roll back failed append, refusing further writes"
                    );
                    self.failed = Some(err.to_string());
                }
                Err(err)
            }
        }
    }

    fn rollback(&mut self) -> Result<(), StorageError> {
        self.file
            .set_len(self.len)
            .and_then(|_| self.file.sync_data())
            .map_err(|e| StorageError::io(&self.path, e))
    }

    fn put(&mut self, id: &str, value: serde_json::Value) -> Result<(), StorageError> {
        let entry = LogEntry::Put {
            id: id.to_string(),
            value,
        };
        self.append(&entry)?;
        if let LogEntry::Put { id, value } = entry {
            if self.data.insert(id, value).is_some() {
                self.dead += 1;
            }
        }
        self.maybe_compact();
        Ok(())
    }

    fn delete(&mut self, id: &str) -> Result<bool, StorageError> {
        if !self.data.contains(id) {
            return Ok(false);
        }
        self.append(&LogEntry::Del { id: id.to_string() })?;
        self.data.remove(id);
        // The old put and the delete itself.
        self.dead += 2;
        self.maybe_compact();
        Ok(true)
    }

    /// Compact when enough of the log is dead. The entry that triggered it
    /// is already durable, so a failure only postpones compaction to a later
    /// write.
    fn maybe_compact(&mut self) {
        if self.dead < COMPACT_MIN_DEAD || self.dead <= self.data.len() {
            return;
        }
        if let Err(e) = self.compact() {
            tracing::warn!(
                path = %self.path.display(),
                error = %e,
                dead = self.dead,
                "log compaction failed, will retry on a later write"
            );
        }
    }

    fn compact(&mut self) -> Result<(), StorageError> {

        let tmp = self.path.with_extension("log.tmp");
        let buf_len;
        {
            let mut out = File::create(&tmp).map_err(|e| StorageError::io(&tmp, e))?;
            let mut buf = Vec::new();
            for (id, value) in self.data.iter() {
                serde_json::to_writer(
                    &mut buf,
                    &LogEntry::Put {
                        id: id.clone(),
                        value: value.clone(),
                    },
                )?;
                buf.push(b'\n');
            }
            out.write_all(&buf)
                .and_then(|_| out.sync_all())
                .map_err(|e| StorageError::io(&tmp, e))?;
            buf_len = buf.len() as u64;
        }
        fs::rename(&tmp, &self.path).map_err(|e| StorageError::io(&self.path, e))?;

        let reopened = OpenOptions::new().append(true).open(&self.path);
        match reopened {
            Ok(file) => self.file = file,
            Err(e) => {
                // The renamed log holds every live row but the old handle
                // points at the unlinked file.
                let err = StorageError::io(&self.path, e);
                self.failed = Some(err.to_string());
                return Err(err);
            }
        }
        self.len = buf_len;

        tracing::debug!(
            path = %self.path.display(),
            dropped = self.dead,
            live = self.data.len(),
            "compacted table log"
        );
        self.dead = 0;
        Ok(())
    }
}

fn apply(data: &mut IndexedTable, entry: LogEntry) {
    match entry {
        LogEntry::Put { id, value } => {
            data.insert(id, value);
        }
        LogEntry::Del { id } => {
            data.remove(&id);
        }
    }
}

/// Durable local store backed by one log file per table.
#[derive(Debug)]
pub struct FileStore {
    dir: PathBuf,
    tables: HashMap<Table, Mutex<LogTable>>,
}

impl FileStore {
    /// Open (or create) a store under `dir`, replaying every table log.
    pub fn open(dir: impl AsRef<Path>, schema: &Schema) -> Result<Self, StorageError> {
        let dir = dir.as_ref().to_path_buf();
        fs::create_dir_all(&dir).map_err(|e| StorageError::io(&dir, e))?;

        let mut tables = HashMap::new();
        for table in Table::all() {
            let path = dir.join(format!("{}.log", table.name()));
            let log = LogTable::open(path, table.indexed_fields(schema))?;
            tables.insert(table, Mutex::new(log));
        }

        tracing::info!(dir = %dir.display(), "opened local store");
        Ok(Self { dir, tables })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn table(&self, table: Table) -> Result<MutexGuard<'_, LogTable>, StorageError> {
        let lock = self
            .tables
            .get(&table)
            .ok_or_else(|| StorageError::Unavailable(format!("unknown table {}", table)))?;
        // A poisoned table still holds the rows that were durably written.
        Ok(lock.lock().unwrap_or_else(|e| e.into_inner()))
    }
}

impl LocalStore for FileStore {
    fn get(&self, table: Table, id: &str) -> Result<Option<serde_json::Value>, StorageError> {
        Ok(self.table(table)?.data.get(id).cloned())
    }

    fn put(&self, table: Table, id: &str, value: serde_json::Value) -> Result<(), StorageError> {
        self.table(table)?.put(id, value)
    }

    fn delete(&self, table: Table, id: &str) -> Result<bool, StorageError> {
        self.table(table)?.delete(id)
    }

    fn query(&self, table: Table, query: &Query) -> Result<Vec<serde_json::Value>, StorageError> {
        Ok(self.table(table)?.data.query(query))
    }

    fn count(&self, table: Table) -> Result<usize, StorageError> {
        Ok(self.table(table)?.data.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rollcall_engine::EntityType;
    use serde_json::json;

    const STUDENTS: Table = Table::Entity(EntityType::Student);

    fn open(dir: &Path) -> FileStore {
        FileStore::open(dir, &Schema::default()).unwrap()
    }

    fn student(id: &str, class: &str) -> serde_json::Value {
        json!({"id": id, "name": "Student", "className": class})
    }

    #[test]
    fn survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        {
            let store = open(dir.path());
            store.put(STUDENTS, "S1", student("S1", "7A")).unwrap();
            store.put(STUDENTS, "S2", student("S2", "7B")).unwrap();
            store.put(STUDENTS, "S1", student("S1", "8A")).unwrap();
            assert!(store.delete(STUDENTS, "S2").unwrap());
        }

        let store = open(dir.path());
        assert_eq!(store.count(STUDENTS).unwrap(), 1);
        assert_eq!(store.get(STUDENTS, "S1").unwrap().unwrap()["className"], "8A");
        assert!(store.get(STUDENTS, "S2").unwrap().is_none());
        assert_eq!(
            store
                .query(STUDENTS, &Query::all().eq("className", "8A"))
                .unwrap()
                .len(),
            1
        );
    }

    #[test]
    fn delete_missing_row_is_noop() {
        let dir = tempfile::tempdir().unwrap();
        let store = open(dir.path());
        assert!(!store.delete(STUDENTS, "nope").unwrap());
    }

    #[test]
    fn torn_final_line_is_discarded() {
        let dir = tempfile::tempdir().unwrap();
        {
            let store = open(dir.path());
            store.put(STUDENTS, "S1", student("S1", "7A")).unwrap();
        }
        let path = dir.path().join("students.log");
        let mut f = OpenOptions::new().append(true).open(&path).unwrap();
        f.write_all(br#"{"op":"put","id":"S2","val"#).unwrap();
        drop(f);

        let store = open(dir.path());
        assert_eq!(store.count(STUDENTS).unwrap(), 1);

        // The log is usable again after truncation.
        store.put(STUDENTS, "S3", student("S3", "7A")).unwrap();
        drop(store);
        let store = open(dir.path());
        assert_eq!(store.count(STUDENTS).unwrap(), 2);
    }

    #[test]
    fn partial_write_in_running_store_is_cut_off() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("students.log");
        {
            let store = open(dir.path());
            store.put(STUDENTS, "S1", student("S1", "7A")).unwrap();

            // Bytes of an append that never completed.
            let mut f = OpenOptions::new().append(true).open(&path).unwrap();
            f.write_all(br#"{"op":"put","id":"S2","va"#).unwrap();
            drop(f);

            store.put(STUDENTS, "S3", student("S3", "7A")).unwrap();
            assert!(store.get(STUDENTS, "S2").unwrap().is_none());
        }

        let store = open(dir.path());
        assert_eq!(store.count(STUDENTS).unwrap(), 2);
        assert!(store.get(STUDENTS, "S3").unwrap().is_some());
        let text = fs::read_to_string(&path).unwrap();
        assert!(!text.contains(r#""id":"S2""#));
    }

    #[test]
    fn failed_compaction_keeps_the_write() {
        let dir = tempfile::tempdir().unwrap();
        let tmp = dir.path().join("students.log.tmp");
        fs::create_dir(&tmp).unwrap();

        let store = open(dir.path());
        for i in 0..(COMPACT_MIN_DEAD + 8) {
            store
                .put(STUDENTS, "S1", student("S1", &format!("C{}", i)))
                .unwrap();
        }
        let last = format!("C{}", COMPACT_MIN_DEAD + 7);
        assert_eq!(store.get(STUDENTS, "S1").unwrap().unwrap()["className"], last);

        // Compaction goes through once the obstacle is gone.
        fs::remove_dir(&tmp).unwrap();
        store.put(STUDENTS, "S1", student("S1", "final")).unwrap();
        let lines = fs::read_to_string(dir.path().join("students.log"))
            .unwrap()
            .lines()
            .count();
        assert_eq!(lines, 1);
        drop(store);

        let store = open(dir.path());
        assert_eq!(store.get(STUDENTS, "S1").unwrap().unwrap()["className"], "final");
    }

    #[test]
    fn corrupt_middle_line_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(
            dir.path().join("students.log"),
            "not json\n{\"op\":\"del\",\"id\":\"S1\"}\n",
        )
        .unwrap();
        let err = FileStore::open(dir.path(), &Schema::default()).unwrap_err();
        assert!(matches!(err, StorageError::Corrupt { line: 1, .. }));
    }

    #[test]
    fn compaction_keeps_live_rows() {
        let dir = tempfile::tempdir().unwrap();
        let store = open(dir.path());
        for i in 0..(COMPACT_MIN_DEAD * 3) {
            store
                .put(STUDENTS, "S1", student("S1", &format!("C{}", i)))
                .unwrap();
        }
        store.put(STUDENTS, "S2", student("S2", "7A")).unwrap();

        let len = fs::metadata(dir.path().join("students.log")).unwrap().len();
        let lines = fs::read_to_string(dir.path().join("students.log"))
            .unwrap()
            .lines()
            .count();
        assert!(lines < COMPACT_MIN_DEAD * 2, "log has {lines} lines ({len} bytes)");
        drop(store);

        let store = open(dir.path());
        assert_eq!(store.count(STUDENTS).unwrap(), 2);
        let last = format!("C{}", COMPACT_MIN_DEAD * 3 - 1);
        assert_eq!(store.get(STUDENTS, "S1").unwrap().unwrap()["className"], last);
    }

    #[test]
    fn tables_are_independent() {
        let dir = tempfile::tempdir().unwrap();
        let store = open(dir.path());
        store.put(Table::Mutations, "m1", json!({"id": "m1"})).unwrap();
        store.put(STUDENTS, "m1", student("m1", "7A")).unwrap();
        store.delete(Table::Mutations, "m1").unwrap();
        assert!(store.get(STUDENTS, "m1").unwrap().is_some());
    }
}
