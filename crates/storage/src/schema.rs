use rusqlite::{Connection, OptionalExtension};

use relmover_core::StorageMode;

use crate::error::StorageError;

pub const SCHEMA_VERSION: i32 = 1;

/// Per-connection settings. Every connection to the database needs these,
/// not only the one that created the schema.
pub fn configure_connection(conn: &Connection) -> Result<(), StorageError> {
    conn.execute_batch(
        "
        PRAGMA busy_timeout = 5000;
        PRAGMA journal_mode = WAL;
        PRAGMA synchronous = NORMAL;
        PRAGMA cache_size = -32000;
    ",
    )?;
    Ok(())
}

/// Create the permanent tables for `mode`.
///
/// The mode is recorded on first use; opening an existing database in the
/// other mode fails with `StorageError::ModeMismatch`.
pub fn init_schema(conn: &Connection, mode: StorageMode) -> Result<(), StorageError> {
    configure_connection(conn)?;
    conn.execute_batch(SCHEMA_VERSION_SQL)?;
    conn.execute(
        "INSERT OR IGNORE INTO schema_version (version, keep_history, applied_at) VALUES (?1, ?2, unixepoch())",
        rusqlite::params![SCHEMA_VERSION, mode.keeps_history()],
    )?;
    if let Some(found) = recorded_mode(conn)? {
        if found != mode {
            return Err(StorageError::mode_mismatch(mode, found));
        }
    }
    match mode {
        StorageMode::HistoryPreserving => conn.execute_batch(HISTORY_PRESERVING_SQL)?,
        StorageMode::HistoryFree => conn.execute_batch(HISTORY_FREE_SQL)?,
    }
    conn.execute_batch(COMMIT_LOG_SQL)?;
    Ok(())
}

/// The mode the database was created in, if the schema exists.
pub fn recorded_mode(conn: &Connection) -> Result<Option<StorageMode>, StorageError> {
    let table_exists: bool = conn.query_row(
        "SELECT EXISTS (SELECT 1 FROM sqlite_master WHERE type = 'table' AND name = 'schema_version')",
        [],
        |row| row.get(0),
    )?;
    if !table_exists {
        return Ok(None);
    }
    let keep_history: Option<bool> = conn
        .query_row(
            "SELECT keep_history FROM schema_version WHERE version = ?1",
            [SCHEMA_VERSION],
            |row| row.get(0),
        )
        .optional()?;
    Ok(keep_history.map(StorageMode::from_keep_history))
}

/// Staging tables. TEMP tables are private to the connection that created
/// them, which keeps one transaction's staged rows invisible to the others.
pub const TEMP_STORE_SQL: &str = "CREATE TEMP TABLE IF NOT EXISTS temp_store (
    zoid INTEGER PRIMARY KEY,
    prev_tid INTEGER NOT NULL CHECK (prev_tid >= 0),
    md5 BLOB CHECK (md5 IS NULL OR length(md5) = 32),
    state BLOB
)";

pub const TEMP_BLOB_CHUNK_SQL: &str = "CREATE TEMP TABLE IF NOT EXISTS temp_blob_chunk (
    zoid INTEGER NOT NULL,
    chunk_num INTEGER NOT NULL CHECK (chunk_num >= 0),
    chunk BLOB NOT NULL,
    PRIMARY KEY (zoid, chunk_num)
)";

pub const TEMP_TABLE_STATEMENTS: &[&str] = &[TEMP_STORE_SQL, TEMP_BLOB_CHUNK_SQL];

pub fn init_temp_tables(conn: &Connection) -> Result<(), StorageError> {
    for stmt in TEMP_TABLE_STATEMENTS {
        conn.execute_batch(stmt)?;
    }
    Ok(())
}

const SCHEMA_VERSION_SQL: &str = "
CREATE TABLE IF NOT EXISTS schema_version (
    version INTEGER PRIMARY KEY,
    keep_history INTEGER NOT NULL,
    applied_at INTEGER NOT NULL
);
";

const HISTORY_PRESERVING_SQL: &str = "
CREATE TABLE IF NOT EXISTS object_state (
    zoid INTEGER NOT NULL CHECK (zoid >= 0),
    tid INTEGER NOT NULL CHECK (tid > 0),
    prev_tid INTEGER NOT NULL CHECK (prev_tid >= 0 AND prev_tid < tid),
    md5 BLOB CHECK (md5 IS NULL OR length(md5) = 32),
    state_size INTEGER NOT NULL CHECK (state_size >= 0),
    state BLOB,
    PRIMARY KEY (zoid, tid)
);
CREATE INDEX IF NOT EXISTS object_state_tid ON object_state (tid);
CREATE INDEX IF NOT EXISTS object_state_prev_tid ON object_state (prev_tid);

CREATE TABLE IF NOT EXISTS current_object (
    zoid INTEGER PRIMARY KEY,
    tid INTEGER NOT NULL CHECK (tid > 0)
);
CREATE INDEX IF NOT EXISTS current_object_tid ON current_object (tid);

CREATE TABLE IF NOT EXISTS blob_chunk (
    zoid INTEGER NOT NULL,
    tid INTEGER NOT NULL CHECK (tid > 0),
    chunk_num INTEGER NOT NULL CHECK (chunk_num >= 0),
    chunk BLOB NOT NULL,
    PRIMARY KEY (zoid, tid, chunk_num)
);
";

const HISTORY_FREE_SQL: &str = "
CREATE TABLE IF NOT EXISTS object_state (
    zoid INTEGER PRIMARY KEY CHECK (zoid >= 0),
    tid INTEGER NOT NULL CHECK (tid > 0),
    state_size INTEGER NOT NULL CHECK (state_size >= 0),
    state BLOB
);
CREATE INDEX IF NOT EXISTS object_state_tid ON object_state (tid);

CREATE TABLE IF NOT EXISTS blob_chunk (
    zoid INTEGER NOT NULL,
    tid INTEGER NOT NULL CHECK (tid > 0),
    chunk_num INTEGER NOT NULL CHECK (chunk_num >= 0),
    chunk BLOB NOT NULL,
    PRIMARY KEY (zoid, chunk_num)
);
";

const COMMIT_LOG_SQL: &str = "
CREATE TABLE IF NOT EXISTS commit_log (
    tid INTEGER PRIMARY KEY CHECK (tid > 0),
    committed_at INTEGER NOT NULL DEFAULT (CAST(unixepoch('now','subsec') * 1000 AS INTEGER)),
    description TEXT
);
";
