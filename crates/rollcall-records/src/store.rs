//! Durable collections behind a `load`/`save` interface.
//!
//! Each collection is written as a whole: a save either lands completely
//! or leaves the previous contents in place.

use rusqlite::{params, Connection, OptionalExtension};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use thiserror::Error;

/// Collection holding user records.
pub const USERS: &str = "users";
/// Collection holding face templates.
pub const FACE_REGISTRATIONS: &str = "faceRegistrations";
/// Collection holding attendance records.
pub const ATTENDANCE_RECORDS: &str = "attendanceRecords";

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("I/O error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("malformed data in {collection}: {source}")]
    Malformed {
        collection: String,
        #[source]
        source: serde_json::Error,
    },
    #[error("sqlite: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("store lock poisoned")]
    Poisoned,
    #[error("write rejected: {0}")]
    Rejected(String),
}

/// Whole-collection persistence for one record type.
pub trait Store<T>: Send + Sync {
    fn load(&self) -> Result<Vec<T>, StoreError>;
    fn save(&self, items: &[T]) -> Result<(), StoreError>;
    fn describe(&self) -> String;
}

/// Load a collection, falling back to empty when it cannot be read.
pub fn load_or_empty<T>(store: &dyn Store<T>) -> Vec<T> {
    match store.load() {
        Ok(items) => items,
        Err(e) => {
            tracing::warn!(store = %store.describe(), error = %e, "unreadable state; starting empty");
            Vec::new()
        }
    }
}

/// Write a collection, logging instead of propagating failures.
///
/// Returns whether the write landed.
pub fn save_logged<T>(store: &dyn Store<T>, items: &[T]) -> bool {
    match store.save(items) {
        Ok(()) => true,
        Err(e) => {
            tracing::error!(store = %store.describe(), count = items.len(), error = %e, "failed to persist");
            false
        }
    }
}

/// One JSON array per file, replaced via write-then-rename.
pub struct JsonFileStore {
    path: PathBuf,
    collection: String,
}

impl JsonFileStore {
    pub fn new(dir: &Path, collection: &str) -> Self {
        Self {
            path: dir.join(format!("{collection}.json")),
            collection: collection.to_string(),
        }
    }

    fn io_err(&self, source: std::io::Error) -> StoreError {
        StoreError::Io { path: self.path.clone(), source }
    }
}

impl<T: Serialize + DeserializeOwned> Store<T> for JsonFileStore {
    fn load(&self) -> Result<Vec<T>, StoreError> {
        let text = match std::fs::read_to_string(&self.path) {
            Ok(text) => text,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(self.io_err(e)),
        };
        if text.trim().is_empty() {
            return Ok(Vec::new());
        }
        serde_json::from_str(&text).map_err(|source| StoreError::Malformed {
            collection: self.collection.clone(),
            source,
        })
    }

    fn save(&self, items: &[T]) -> Result<(), StoreError> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| self.io_err(e))?;
        }
        let body = serde_json::to_vec_pretty(items).map_err(|source| StoreError::Malformed {
            collection: self.collection.clone(),
            source,
        })?;

        let staging = self.path.with_extension("json.tmp");
        std::fs::write(&staging, body).map_err(|e| self.io_err(e))?;
        std::fs::rename(&staging, &self.path).map_err(|e| self.io_err(e))
    }

    fn describe(&self) -> String {
        self.path.display().to_string()
    }
}

/// Collections as JSON documents in a single SQLite table.
pub struct SqliteStore {
    conn: Mutex<Connection>,
    path: PathBuf,
    collection: String,
}

impl SqliteStore {
    pub fn open(path: &Path, collection: &str) -> Result<Self, StoreError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|source| StoreError::Io {
                path: parent.to_path_buf(),
                source,
            })?;
        }

        let conn = Connection::open(path)?;
        conn.execute(
            "CREATE TABLE IF NOT EXISTS collections (
                name TEXT PRIMARY KEY,
                body TEXT NOT NULL,
                updated_at TEXT NOT NULL
            )",
            [],
        )?;

        Ok(Self {
            conn: Mutex::new(conn),
            path: path.to_path_buf(),
            collection: collection.to_string(),
        })
    }
}

impl<T: Serialize + DeserializeOwned> Store<T> for SqliteStore {
    fn load(&self) -> Result<Vec<T>, StoreError> {
        let conn = self.conn.lock().map_err(|_| StoreError::Poisoned)?;
        let body: Option<String> = conn
            .query_row(
                "SELECT body FROM collections WHERE name = ?1",
                params![self.collection],
                |row| row.get(0),
            )
            .optional()?;

        match body {
            None => Ok(Vec::new()),
            Some(body) => serde_json::from_str(&body).map_err(|source| StoreError::Malformed {
                collection: self.collection.clone(),
                source,
            }),
        }
    }

    fn save(&self, items: &[T]) -> Result<(), StoreError> {
        let body = serde_json::to_string(items).map_err(|source| StoreError::Malformed {
            collection: self.collection.clone(),
            source,
        })?;

        let mut conn = self.conn.lock().map_err(|_| StoreError::Poisoned)?;
        let tx = conn.transaction()?;
        tx.execute(
            "INSERT INTO collections (name, body, updated_at) VALUES (?1, ?2, ?3)
             ON CONFLICT(name) DO UPDATE SET body = excluded.body, updated_at = excluded.updated_at",
            params![self.collection, body, chrono::Utc::now().to_rfc3339()],
        )?;
        tx.commit()?;
        Ok(())
    }

    fn describe(&self) -> String {
        format!("{}#{}", self.path.display(), self.collection)
    }
}

/// Process-local store. Clones share contents.
pub struct MemoryStore<T> {
    items: Arc<Mutex<Vec<T>>>,
    fail_writes: Arc<AtomicBool>,
}

impl<T> Clone for MemoryStore<T> {
    fn clone(&self) -> Self {
        Self {
            items: Arc::clone(&self.items),
            fail_writes: Arc::clone(&self.fail_writes),
        }
    }
}

impl<T> Default for MemoryStore<T> {
    fn default() -> Self {
        Self::with_items(Vec::new())
    }
}

impl<T> MemoryStore<T> {
    pub fn with_items(items: Vec<T>) -> Self {
        Self {
            items: Arc::new(Mutex::new(items)),
            fail_writes: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Make subsequent saves fail, for exercising degraded paths.
    pub fn set_fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }
}

impl<T: Clone> MemoryStore<T> {
    pub fn snapshot(&self) -> Vec<T> {
        self.items.lock().map(|items| items.clone()).unwrap_or_default()
    }
}

impl<T: Clone + Send> Store<T> for MemoryStore<T> {
    fn load(&self) -> Result<Vec<T>, StoreError> {
        Ok(self.items.lock().map_err(|_| StoreError::Poisoned)?.clone())
    }

    fn save(&self, items: &[T]) -> Result<(), StoreError> {
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(StoreError::Rejected("memory store configured to fail".into()));
        }
        *self.items.lock().map_err(|_| StoreError::Poisoned)? = items.to_vec();
        Ok(())
    }

    fn describe(&self) -> String {
        "memory".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct Row {
        id: String,
        n: u32,
    }

    fn rows() -> Vec<Row> {
        vec![Row { id: "a".into(), n: 1 }, Row { id: "b".into(), n: 2 }]
    }

    fn scratch_dir() -> PathBuf {
        std::env::temp_dir().join(format!("rollcall-store-{}", uuid::Uuid::new_v4()))
    }

    #[test]
    fn test_json_store_missing_file_is_empty() {
        let store = JsonFileStore::new(&scratch_dir(), USERS);
        let loaded: Vec<Row> = store.load().unwrap();
        assert!(loaded.is_empty());
    }

    #[test]
    fn test_json_store_persists_across_instances() {
        let dir = scratch_dir();
        Store::<Row>::save(&JsonFileStore::new(&dir, USERS), &rows()).unwrap();

        let reopened: Vec<Row> = JsonFileStore::new(&dir, USERS).load().unwrap();
        assert_eq!(reopened, rows());
        assert!(!dir.join("users.json.tmp").exists());
        let _ = std::fs::remove_dir_all(dir);
    }

    #[test]
    fn test_json_store_malformed_degrades_to_empty() {
        let dir = scratch_dir();
        std::fs::create_dir_all(&dir).unwrap();
        std::fs::write(dir.join("users.json"), "{ not json").unwrap();

        let store = JsonFileStore::new(&dir, USERS);
        assert!(matches!(Store::<Row>::load(&store), Err(StoreError::Malformed { .. })));
        let fallback = load_or_empty::<Row>(&store);
        assert!(fallback.is_empty());
        let _ = std::fs::remove_dir_all(dir);
    }

    #[test]
    fn test_sqlite_store_collections_are_independent() {
        let dir = scratch_dir();
        let db = dir.join("rollcall.db");
        let users = SqliteStore::open(&db, USERS).unwrap();
        let faces = SqliteStore::open(&db, FACE_REGISTRATIONS).unwrap();

        users.save(rows().as_slice()).unwrap();
        let no_faces: Vec<Row> = faces.load().unwrap();
        assert!(no_faces.is_empty());

        let replaced = vec![Row { id: "c".into(), n: 3 }];
        users.save(replaced.as_slice()).unwrap();
        let reopened: Vec<Row> = SqliteStore::open(&db, USERS).unwrap().load().unwrap();
        assert_eq!(reopened, replaced);
        let _ = std::fs::remove_dir_all(dir);
    }

    #[test]
    fn test_memory_store_failing_writes() {
        let store = MemoryStore::with_items(rows());
        store.set_fail_writes(true);
        assert!(!save_logged::<Row>(&store, &[]));
        assert_eq!(store.snapshot(), rows());

        store.set_fail_writes(false);
        assert!(save_logged::<Row>(&store, &[]));
        assert!(store.snapshot().is_empty());
    }
}
