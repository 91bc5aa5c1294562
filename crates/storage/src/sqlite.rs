use std::io::Write;

use rusqlite::{Connection, DatabaseName};

use relmover_core::{Oid, StorageMode, Tid};

use crate::dialect::{Dialect, Query};
use crate::error::StorageError;
use crate::schema;
use crate::traits::{Backend, StagedWrite};

// Changing temp_store drops existing TEMP tables, so it must come first.
const STORE_OPENED_STATEMENTS: &[&str] = &[
    "PRAGMA temp_store = MEMORY",
    schema::TEMP_STORE_SQL,
    schema::TEMP_BLOB_CHUNK_SQL,
];

const LOAD_OPENED_STATEMENTS: &[&str] = &["PRAGMA query_only = ON"];

const UPSERT_STAGED: &str = "
    INSERT INTO temp_store (zoid, prev_tid, md5, state) VALUES (?1, ?2, ?3, ?4)
    ON CONFLICT (zoid) DO UPDATE SET
        prev_tid = excluded.prev_tid,
        md5 = excluded.md5,
        state = excluded.state";

// Probes the current_object primary key directly instead of joining.
const HP_LOAD_CURRENT: &str = "
    SELECT state, tid, md5
    FROM object_state
    WHERE zoid = ?1
        AND tid = (SELECT tid FROM current_object WHERE zoid = ?1)";

const BLOB_CHUNK_ROWIDS: &str = "
    SELECT rowid FROM blob_chunk
    WHERE zoid = ?1
        AND tid = ?2
    ORDER BY chunk_num";

/// SQLite through rusqlite: native upsert staging and incremental blob I/O.
#[derive(Debug, Clone, Copy, Default)]
pub struct SqliteBackend;

impl Backend for SqliteBackend {
    fn name(&self) -> &'static str {
        "sqlite"
    }

    fn statement_overrides(&self, mode: StorageMode) -> Vec<(Query, &'static str)> {
        match mode {
            StorageMode::HistoryPreserving => vec![(Query::LoadCurrent, HP_LOAD_CURRENT)],
            StorageMode::HistoryFree => Vec::new(),
        }
    }

    fn store_opened_statements(&self) -> &'static [&'static str] {
        STORE_OPENED_STATEMENTS
    }

    fn load_opened_statements(&self) -> &'static [&'static str] {
        LOAD_OPENED_STATEMENTS
    }

    fn store_temp(
        &self,
        conn: &Connection,
        _dialect: &Dialect,
        write: &StagedWrite<'_>,
    ) -> Result<(), StorageError> {
        conn.prepare_cached(UPSERT_STAGED)?.execute(rusqlite::params![
            write.oid.to_sql()?,
            write.prev_tid.to_sql()?,
            write.fingerprint.as_ref().map(|f| f.as_bytes().as_slice()),
            write.state,
        ])?;
        Ok(())
    }

    /// Streams each chunk through an incremental blob handle rather than
    /// materializing it as a row value.
    fn download_blob(
        &self,
        conn: &Connection,
        _dialect: &Dialect,
        oid: Oid,
        tid: Tid,
        sink: &mut dyn Write,
    ) -> Result<u64, StorageError> {
        let rowids: Vec<i64> = conn
            .prepare_cached(BLOB_CHUNK_ROWIDS)?
            .query_map([oid.to_sql()?, tid.to_sql()?], |row| row.get(0))?
            .collect::<Result<Vec<_>, _>>()?;
        if rowids.is_empty() {
            return Err(StorageError::BlobNotFound { oid, tid });
        }

        let mut total = 0u64;
        for rowid in rowids {
            let mut blob = conn.blob_open(DatabaseName::Main, "blob_chunk", "chunk", rowid, true)?;
            total += std::io::copy(&mut blob, sink)?;
        }
        Ok(total)
    }
}
