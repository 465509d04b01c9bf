//! SQLite-backed snapshot persistence
//!
//! Stores the serialized snapshot as a single row of a key/value table,
//! the same role browser local storage plays for a web client.

use std::path::Path;
use std::sync::Mutex;

use rusqlite::{params, Connection, OptionalExtension};

use super::error::StorageResult;
use super::persistence::Persistence;

/// Current schema version for migrations
pub const SCHEMA_VERSION: i32 = 1;

const SNAPSHOT_KEY: &str = "snapshot";
const BACKUP_PREFIX: &str = "snapshot.corrupt.";

/// Initialize the database schema
pub fn init_schema(conn: &Connection) -> rusqlite::Result<()> {
    conn.execute_batch(
        r#"
        CREATE TABLE IF NOT EXISTS schema_info (
            key TEXT PRIMARY KEY,
            value TEXT NOT NULL
        );

        CREATE TABLE IF NOT EXISTS kv (
            key TEXT PRIMARY KEY,
            value TEXT NOT NULL,
            updated_at INTEGER NOT NULL
        );
        "#,
    )?;

    conn.execute(
        "INSERT OR REPLACE INTO schema_info (key, value) VALUES ('version', ?1)",
        params![SCHEMA_VERSION.to_string()],
    )?;

    Ok(())
}

/// Snapshot stored in a SQLite key/value table
pub struct SqlitePersistence {
    conn: Mutex<Connection>,
}

impl SqlitePersistence {
    /// Open (or create) the database at `path`
    pub fn open(path: &Path) -> StorageResult<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let conn = Connection::open(path)?;
        Self::with_connection(conn)
    }

    /// In-memory database, mostly for tests
    pub fn open_in_memory() -> StorageResult<Self> {
        Self::with_connection(Connection::open_in_memory()?)
    }

    fn with_connection(conn: Connection) -> StorageResult<Self> {
        init_schema(&conn)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Schema version recorded in the database
    pub fn schema_version(&self) -> StorageResult<Option<i32>> {
        let conn = self.conn.lock().unwrap_or_else(|e| e.into_inner());
        let version: Option<String> = conn
            .query_row(
                "SELECT value FROM schema_info WHERE key = 'version'",
                [],
                |row| row.get(0),
            )
            .optional()?;
        Ok(version.and_then(|v| v.parse().ok()))
    }
}

impl Persistence for SqlitePersistence {
    fn save(&self, snapshot: &str) -> StorageResult<()> {
        let conn = self.conn.lock().unwrap_or_else(|e| e.into_inner());
        conn.execute(
            "INSERT INTO kv (key, value, updated_at) VALUES (?1, ?2, ?3)
             ON CONFLICT(key) DO UPDATE SET value = excluded.value, updated_at = excluded.updated_at",
            params![SNAPSHOT_KEY, snapshot, chrono::Utc::now().timestamp()],
        )?;
        Ok(())
    }

    fn load(&self) -> StorageResult<Option<String>> {
        let conn = self.conn.lock().unwrap_or_else(|e| e.into_inner());
        let value = conn
            .query_row(
                "SELECT value FROM kv WHERE key = ?1",
                params![SNAPSHOT_KEY],
                |row| row.get(0),
            )
            .optional()?;
        Ok(value)
    }

    fn quarantine(&self) -> StorageResult<Option<String>> {
        let conn = self.conn.lock().unwrap_or_else(|e| e.into_inner());
        // Backups are numbered by the highest existing one
        let last: i64 = conn.query_row(
            "SELECT COALESCE(MAX(CAST(SUBSTR(key, LENGTH(?1) + 1) AS INTEGER)), 0)
             FROM kv WHERE key LIKE ?1 || '%'",
            params![BACKUP_PREFIX],
            |row| row.get(0),
        )?;
        let backup_key = format!("{}{}", BACKUP_PREFIX, last + 1);
        let moved = conn.execute(
            "UPDATE kv SET key = ?1 WHERE key = ?2",
            params![backup_key, SNAPSHOT_KEY],
        )?;
        Ok((moved > 0).then(|| format!("kv row '{}'", backup_key)))
    }
}
