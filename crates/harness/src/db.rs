use std::path::{Path, PathBuf};
use std::sync::Arc;

use rusqlite::Connection;
use tempfile::TempDir;

use relmover_core::{Oid, StoreOptions, Tid};
use relmover_engine::{CommitOutcome, Engine, EngineError, RejectConflicts};
use relmover_storage::{Backend, ObjectMover, SqliteBackend, StorageError};

const DB_FILE: &str = "objects.db";

/// A throwaway on-disk database.
///
/// Sessions are separate connections to the same file, so staging on one is
/// invisible to the others, as it would be between real clients.
pub struct TestDb<B: Backend = SqliteBackend> {
    // Removed on drop.
    _dir: TempDir,
    path: PathBuf,
    engine: Arc<Engine<B>>,
}

impl TestDb<SqliteBackend> {
    pub fn new(options: StoreOptions) -> Result<Self, EngineError> {
        Self::with_backend(SqliteBackend, options)
    }

    pub fn history_preserving() -> Result<Self, EngineError> {
        Self::new(StoreOptions::default())
    }

    pub fn history_free() -> Result<Self, EngineError> {
        Self::new(StoreOptions::history_free())
    }
}

impl<B: Backend> TestDb<B> {
    pub fn with_backend(backend: B, options: StoreOptions) -> Result<Self, EngineError> {
        let dir = tempfile::tempdir().map_err(StorageError::from)?;
        let path = dir.path().join(DB_FILE);
        let conn = Connection::open(&path)?;
        let engine = Engine::open(backend, options, &conn)?;
        Ok(Self {
            _dir: dir,
            path,
            engine: Arc::new(engine),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn engine(&self) -> &Arc<Engine<B>> {
        &self.engine
    }

    pub fn mover(&self) -> &ObjectMover<B> {
        self.engine.mover()
    }

    /// A new connection set up for staging and committing.
    pub fn store_session(&self) -> Result<Connection, EngineError> {
        let conn = Connection::open(&self.path)?;
        self.engine.open_store_session(&conn, false)?;
        Ok(conn)
    }

    /// A new read-only connection.
    pub fn load_session(&self) -> Result<Connection, EngineError> {
        let conn = Connection::open(&self.path)?;
        self.engine.open_load_session(&conn, false)?;
        Ok(conn)
    }

    /// Stage `writes` as `(oid, prev_tid, state)` and commit them, failing on
    /// any conflict.
    pub fn commit(
        &self,
        conn: &mut Connection,
        writes: &[(Oid, Tid, Option<&[u8]>)],
    ) -> Result<CommitOutcome, EngineError> {
        let mut txn = self.engine.begin(conn);
        for (oid, prev_tid, state) in writes {
            txn.store(*oid, *prev_tid, *state)?;
        }
        txn.commit(&mut RejectConflicts)
    }
}
