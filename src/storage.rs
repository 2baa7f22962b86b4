//! Namespaced key-value persistence (SQLite or in-memory).

use anyhow::{anyhow, Result};
use rusqlite::{params, Connection, OpenFlags, OptionalExtension};
use std::collections::HashMap;
use std::sync::Mutex;

use crate::now_s;

/// Storage namespaces, one per owning component.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Namespace {
    Credentials,
    Policy,
    SecurityLog,
}

impl Namespace {
    pub fn as_str(self) -> &'static str {
        match self {
            Namespace::Credentials => "credentials",
            Namespace::Policy => "policy",
            Namespace::SecurityLog => "security_log",
        }
    }
}

/// Persistence collaborator for credentials, policy and the security log.
///
/// Implementations synchronize internally; components share one store
/// through `Arc<dyn KeyValueStore>`.
pub trait KeyValueStore: Send + Sync {
    fn get(&self, ns: Namespace, key: &str) -> Result<Option<Vec<u8>>>;

    fn put(&self, ns: Namespace, key: &str, value: &[u8]) -> Result<()>;
}

pub struct SqliteKeyValueStore {
    conn: Mutex<Connection>,
}

impl SqliteKeyValueStore {
    pub fn open(db_path: &str) -> Result<Self> {
        let conn = open_db_connection(db_path)?;
        let store = Self {
            conn: Mutex::new(conn),
        };
        store.ensure_schema()?;
        Ok(store)
    }

    fn ensure_schema(&self) -> Result<()> {
        let conn = self.lock()?;
        conn.execute_batch(
            r#"
            PRAGMA journal_mode=WAL;

            CREATE TABLE IF NOT EXISTS kv (
              namespace TEXT NOT NULL,
              key TEXT NOT NULL,
              value BLOB NOT NULL,
              updated_at INTEGER NOT NULL,
              PRIMARY KEY (namespace, key)
            );
            "#,
        )?;
        Ok(())
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|_| anyhow!("kv store connection lock poisoned"))
    }
}

impl KeyValueStore for SqliteKeyValueStore {
    fn get(&self, ns: Namespace, key: &str) -> Result<Option<Vec<u8>>> {
        let conn = self.lock()?;
        let value = conn
            .query_row(
                "SELECT value FROM kv WHERE namespace = ?1 AND key = ?2",
                params![ns.as_str(), key],
                |row| row.get::<_, Vec<u8>>(0),
            )
            .optional()?;
        Ok(value)
    }

    fn put(&self, ns: Namespace, key: &str, value: &[u8]) -> Result<()> {
        let updated_at = now_s()? as i64;
        let conn = self.lock()?;
        conn.execute(
            r#"
            INSERT INTO kv(namespace, key, value, updated_at)
            VALUES (?1, ?2, ?3, ?4)
            ON CONFLICT(namespace, key) DO UPDATE SET
              value = excluded.value,
              updated_at = excluded.updated_at
            "#,
            params![ns.as_str(), key, value, updated_at],
        )?;
        Ok(())
    }
}

#[derive(Debug, Default)]
pub struct InMemoryKeyValueStore {
    entries: Mutex<HashMap<(Namespace, String), Vec<u8>>>,
}

impl InMemoryKeyValueStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl KeyValueStore for InMemoryKeyValueStore {
    fn get(&self, ns: Namespace, key: &str) -> Result<Option<Vec<u8>>> {
        let entries = self
            .entries
            .lock()
            .map_err(|_| anyhow!("in-memory kv store lock poisoned"))?;
        Ok(entries.get(&(ns, key.to_string())).cloned())
    }

    fn put(&self, ns: Namespace, key: &str, value: &[u8]) -> Result<()> {
        let mut entries = self
            .entries
            .lock()
            .map_err(|_| anyhow!("in-memory kv store lock poisoned"))?;
        entries.insert((ns, key.to_string()), value.to_vec());
        Ok(())
    }
}

pub(crate) fn open_db_connection(db_path: &str) -> Result<Connection> {
    if db_path.starts_with("file:") {
        return Ok(Connection::open_with_flags(
            db_path,
            OpenFlags::SQLITE_OPEN_READ_WRITE
                | OpenFlags::SQLITE_OPEN_CREATE
                | OpenFlags::SQLITE_OPEN_URI,
        )?);
    }
    Ok(Connection::open(db_path)?)
}

/// Reads a JSON document stored under `key`.
pub(crate) fn get_json<T: serde::de::DeserializeOwned>(
    store: &dyn KeyValueStore,
    ns: Namespace,
    key: &str,
) -> Result<Option<T>> {
    match store.get(ns, key)? {
        Some(bytes) => {
            let value = serde_json::from_slice(&bytes).map_err(|e| {
                anyhow!("corrupt {} entry '{}': {}", ns.as_str(), key, e)
            })?;
            Ok(Some(value))
        }
        None => Ok(None),
    }
}

pub(crate) fn put_json<T: serde::Serialize>(
    store: &dyn KeyValueStore,
    ns: Namespace,
    key: &str,
    value: &T,
) -> Result<()> {
    let bytes = serde_json::to_vec(value)?;
    store.put(ns, key, &bytes)
}
