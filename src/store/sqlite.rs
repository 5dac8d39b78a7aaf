//! SQLite-backed event store.
//!
//! The connection is shared behind a mutex and every call runs on the
//! blocking pool so a slow disk never stalls the async runtime.

use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use rusqlite::{params, Connection};

use super::{EventStore, StoredRecord};
use crate::error::StoreError;

pub struct SqliteStore {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteStore {
    /// Open (or create) the store at `path` and apply the schema.
    pub fn open_at(path: &Path) -> Result<Self, StoreError> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() && !parent.exists() {
                std::fs::create_dir_all(parent)
                    .map_err(|e| StoreError::CreateDir(parent.to_path_buf(), e))?;
            }
        }

        let conn = Connection::open(path)?;
        // WAL keeps ingestion writes from blocking warm-up reads
        conn.execute_batch("PRAGMA journal_mode=WAL;")?;
        crate::migrations::run_migrations(&conn)?;

        log::info!("Opened event store at {}", path.display());
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Open a volatile in-memory SQLite store.
    pub fn open_in_memory() -> Result<Self, StoreError> {
        let conn = Connection::open_in_memory()?;
        crate::migrations::run_migrations(&conn)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    async fn with_conn<T, F>(&self, f: F) -> Result<T, StoreError>
    where
        F: FnOnce(&Connection) -> Result<T, StoreError> + Send + 'static,
        T: Send + 'static,
    {
        let conn = Arc::clone(&self.conn);
        tokio::task::spawn_blocking(move || {
            let guard = conn.lock();
            f(&guard)
        })
        .await
        .map_err(|e| StoreError::Task(e.to_string()))?
    }
}

fn read_records(
    conn: &Connection,
    sql: &str,
    args: &[&dyn rusqlite::ToSql],
) -> Result<Vec<StoredRecord>, StoreError> {
    let mut stmt = conn.prepare(sql)?;
    let rows = stmt.query_map(args, |row| {
        Ok(StoredRecord {
            key: row.get(0)?,
            watershed: row.get(1)?,
            value: row.get(2)?,
        })
    })?;
    Ok(rows.collect::<Result<Vec<_>, _>>()?)
}

#[async_trait]
impl EventStore for SqliteStore {
    async fn get_all(&self, namespace: &str) -> Result<Vec<StoredRecord>, StoreError> {
        let namespace = namespace.to_string();
        self.with_conn(move |conn| {
            read_records(
                conn,
                "SELECT record_key, watershed, value FROM kv_records
                 WHERE namespace = ?1
                 ORDER BY record_key",
                params![namespace],
            )
        })
        .await
    }

    async fn put(&self, namespace: &str, record: StoredRecord) -> Result<(), StoreError> {
        let namespace = namespace.to_string();
        self.with_conn(move |conn| {
            conn.execute(
                "INSERT INTO kv_records (namespace, record_key, watershed, value, updated_at)
                 VALUES (?1, ?2, ?3, ?4, datetime('now'))
                 ON CONFLICT(namespace, record_key) DO UPDATE SET
                    watershed = excluded.watershed,
                    value = excluded.value,
                    updated_at = datetime('now')",
                params![namespace, record.key, record.watershed, record.value],
            )?;
            Ok(())
        })
        .await
    }

    async fn list_by_watershed(
        &self,
        namespace: &str,
        huc8: &str,
    ) -> Result<Vec<StoredRecord>, StoreError> {
        let namespace = namespace.to_string();
        let huc8 = huc8.to_string();
        self.with_conn(move |conn| {
            read_records(
                conn,
                "SELECT record_key, watershed, value FROM kv_records
                 WHERE namespace = ?1 AND watershed = ?2
                 ORDER BY record_key",
                params![namespace, huc8],
            )
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(key: &str, watershed: Option<&str>, value: &str) -> StoredRecord {
        StoredRecord {
            key: key.to_string(),
            watershed: watershed.map(|w| w.to_string()),
            value: value.to_string(),
        }
    }

    #[tokio::test]
    async fn test_put_and_get_all() {
        let store = SqliteStore::open_in_memory().expect("open");
        store.put("events", record("b", Some("02070010"), "{}")).await.expect("put");
        store.put("events", record("a", Some("02070011"), "{}")).await.expect("put");
        store.put("health", record("wqp", None, "{}")).await.expect("put");

        let all = store.get_all("events").await.expect("get_all");
        assert_eq!(all.len(), 2);
        assert_eq!(all[0].key, "a");
        assert_eq!(all[1].key, "b");
    }

    #[tokio::test]
    async fn test_put_overwrites_same_key() {
        let store = SqliteStore::open_in_memory().expect("open");
        store.put("health", record("wqp", None, "{\"v\":1}")).await.expect("put");
        store.put("health", record("wqp", None, "{\"v\":2}")).await.expect("put");

        let all = store.get_all("health").await.expect("get_all");
        assert_eq!(all.len(), 1);
        assert_eq!(all[0].value, "{\"v\":2}");
    }

    #[tokio::test]
    async fn test_list_by_watershed() {
        let store = SqliteStore::open_in_memory().expect("open");
        store.put("events", record("a", Some("02070010"), "{}")).await.expect("put");
        store.put("events", record("b", Some("02070011"), "{}")).await.expect("put");
        store.put("events", record("c", Some("02070010"), "{}")).await.expect("put");

        let rows = store.list_by_watershed("events", "02070010").await.expect("list");
        let keys: Vec<&str> = rows.iter().map(|r| r.key.as_str()).collect();
        assert_eq!(keys, vec!["a", "c"]);
    }

    #[tokio::test]
    async fn test_file_store_survives_reopen() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("nested").join("sentinel.db");
        {
            let store = SqliteStore::open_at(&path).expect("open");
            store.put("events", record("a", Some("02070010"), "{}")).await.expect("put");
        }
        let store = SqliteStore::open_at(&path).expect("reopen");
        assert_eq!(store.get_all("events").await.expect("get_all").len(), 1);
    }
}
