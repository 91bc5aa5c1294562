use std::collections::BTreeMap;
use std::fs::File;
use std::io::{BufReader, BufWriter, Read, Write};
use std::path::Path;

use rusqlite::{Connection, OptionalExtension};
use tracing::{debug, warn};

use relmover_core::{Conflict, Fingerprint, Fingerprinter, Oid, StorageMode, StoreOptions, Tid};

use crate::dialect::{Dialect, ID_LIST_MARKER, Query};
use crate::error::StorageError;
use crate::traits::{Backend, StagedRecord, StagedWrite};

/// A stored object state. `None` means the object's creation was undone,
/// which is different from the object not existing at all.
pub type State = Option<Vec<u8>>;

/// Reads, stages, and commits object revisions over a caller-supplied
/// connection.
///
/// Every method takes the connection explicitly. Within one transaction the
/// caller must run staging, [`detect_conflicts`](Self::detect_conflicts),
/// [`move_from_temp`](Self::move_from_temp) and
/// [`update_current`](Self::update_current) in that order, inside one
/// database transaction for the last three.
pub struct ObjectMover<B: Backend> {
    backend: B,
    options: StoreOptions,
    dialect: Dialect,
    fingerprinter: Fingerprinter,
}

impl<B: Backend> ObjectMover<B> {
    pub fn new(backend: B, options: StoreOptions) -> Result<Self, StorageError> {
        options.validate()?;
        let mode = options.mode();
        let dialect = Dialect::new(mode).with_overrides(backend.statement_overrides(mode));
        Ok(Self {
            backend,
            options,
            dialect,
            fingerprinter: Fingerprinter::for_mode(mode),
        })
    }

    pub fn mode(&self) -> StorageMode {
        self.dialect.mode()
    }

    pub fn options(&self) -> &StoreOptions {
        &self.options
    }

    pub fn dialect(&self) -> &Dialect {
        &self.dialect
    }

    pub fn backend(&self) -> &B {
        &self.backend
    }

    // ------------------------------------------------------------------
    // Session hooks
    // ------------------------------------------------------------------

    pub fn on_store_opened(&self, conn: &Connection, restart: bool) -> Result<(), StorageError> {
        if restart {
            return Ok(());
        }
        for stmt in self.backend.store_opened_statements() {
            conn.execute_batch(stmt)?;
        }
        debug!(backend = self.backend.name(), "store session opened");
        Ok(())
    }

    pub fn on_load_opened(&self, conn: &Connection, restart: bool) -> Result<(), StorageError> {
        if restart {
            return Ok(());
        }
        for stmt in self.backend.load_opened_statements() {
            conn.execute_batch(stmt)?;
        }
        debug!(backend = self.backend.name(), "load session opened");
        Ok(())
    }

    // ------------------------------------------------------------------
    // Reader
    // ------------------------------------------------------------------

    /// Latest state and tid of `oid`, or `None` if it has never been committed.
    pub fn load_current(
        &self,
        conn: &Connection,
        oid: Oid,
    ) -> Result<Option<(State, Tid)>, StorageError> {
        let row = conn
            .prepare_cached(self.dialect.sql(Query::LoadCurrent))?
            .query_row([oid.to_sql()?], |row| {
                Ok((
                    row.get::<_, Option<Vec<u8>>>(0)?,
                    row.get::<_, i64>(1)?,
                    row.get::<_, Option<Vec<u8>>>(2)?,
                ))
            })
            .optional()?;

        let Some((state, tid, md5)) = row else {
            return Ok(None);
        };
        let tid = Tid::from_sql(tid)?;
        if let (Some(state), Some(md5)) = (&state, &md5) {
            check_fingerprint(oid, tid, md5, state);
        }
        Ok(Some((state, tid)))
    }

    /// State of `oid` exactly at `tid`. History-free databases only know the
    /// latest revision.
    pub fn load_revision(
        &self,
        conn: &Connection,
        oid: Oid,
        tid: Tid,
    ) -> Result<Option<State>, StorageError> {
        let state = conn
            .prepare_cached(self.dialect.sql(Query::LoadRevision))?
            .query_row([oid.to_sql()?, tid.to_sql()?], |row| {
                row.get::<_, Option<Vec<u8>>>(0)
            })
            .optional()?;
        Ok(state)
    }

    /// The newest revision of `oid` strictly older than `tid`.
    pub fn load_before(
        &self,
        conn: &Connection,
        oid: Oid,
        tid: Tid,
    ) -> Result<Option<(State, Tid)>, StorageError> {
        let mut stmt = conn.prepare_cached(self.dialect.sql(Query::LoadBefore))?;
        let mut rows = stmt.query([oid.to_sql()?, tid.to_sql()?])?;
        match rows.next()? {
            Some(row) => {
                let state: State = row.get(0)?;
                let found: i64 = row.get(1)?;
                Ok(Some((state, Tid::from_sql(found)?)))
            }
            None => Ok(None),
        }
    }

    pub fn exists(&self, conn: &Connection, oid: Oid) -> Result<bool, StorageError> {
        let found = conn
            .prepare_cached(self.dialect.sql(Query::Exists))?
            .query_row([oid.to_sql()?], |_| Ok(()))
            .optional()?;
        Ok(found.is_some())
    }

    /// Smallest revision tid of `oid` strictly greater than `tid`.
    pub fn next_transaction_after(
        &self,
        conn: &Connection,
        oid: Oid,
        tid: Tid,
    ) -> Result<Option<Tid>, StorageError> {
        let next: Option<i64> = conn
            .prepare_cached(self.dialect.sql(Query::TidAfter))?
            .query_row([oid.to_sql()?, tid.to_sql()?], |row| row.get(0))
            .optional()?;
        Ok(next.map(Tid::from_sql).transpose()?)
    }

    /// Current tid for each of `oids` that has current state.
    ///
    /// Ids are bound as parameters in batches of `id_batch_size`, so any
    /// number of ids can be passed.
    pub fn current_transactions<I>(
        &self,
        conn: &Connection,
        oids: I,
    ) -> Result<BTreeMap<Oid, Tid>, StorageError>
    where
        I: IntoIterator<Item = Oid>,
    {
        let oids = oids
            .into_iter()
            .map(Oid::to_sql)
            .collect::<Result<Vec<i64>, _>>()?;
        let template = self.dialect.sql(Query::CurrentTids);

        let mut result = BTreeMap::new();
        for batch in oids.chunks(self.options.id_batch_size) {
            let placeholders = vec!["?"; batch.len()].join(",");
            let sql = template.replace(ID_LIST_MARKER, &placeholders);
            let mut stmt = conn.prepare_cached(&sql)?;
            let mut rows = stmt.query(rusqlite::params_from_iter(batch.iter()))?;
            while let Some(row) = rows.next()? {
                let oid = Oid::from_sql(row.get(0)?)?;
                let tid = Tid::from_sql(row.get(1)?)?;
                result.insert(oid, tid);
            }
        }
        Ok(result)
    }

    // ------------------------------------------------------------------
    // Staging
    // ------------------------------------------------------------------

    /// Stage `state` for `oid`, replacing anything already staged for it.
    pub fn stage_write(
        &self,
        conn: &Connection,
        oid: Oid,
        prev_tid: Tid,
        state: Option<&[u8]>,
    ) -> Result<(), StorageError> {
        let write = StagedWrite {
            oid,
            prev_tid,
            fingerprint: self.fingerprinter.compute(state),
            state,
        };
        self.backend.store_temp(conn, &self.dialect, &write)
    }

    /// Overwrite an existing staged row in place after conflict resolution.
    ///
    /// Staged blob chunks for `oid` are left alone. Returns `false` if
    /// nothing was staged for `oid`.
    pub fn replace_staged(
        &self,
        conn: &Connection,
        oid: Oid,
        prev_tid: Tid,
        state: Option<&[u8]>,
    ) -> Result<bool, StorageError> {
        let fingerprint = self.fingerprinter.compute(state);
        let updated = conn
            .prepare_cached(self.dialect.sql(Query::ReplaceStaged))?
            .execute(rusqlite::params![
                oid.to_sql()?,
                prev_tid.to_sql()?,
                fingerprint.as_ref().map(|f| f.as_bytes().as_slice()),
                state,
            ])?;
        Ok(updated > 0)
    }

    pub fn load_staged(
        &self,
        conn: &Connection,
        oid: Oid,
    ) -> Result<Option<StagedRecord>, StorageError> {
        let row = conn
            .prepare_cached(self.dialect.sql(Query::LoadStaged))?
            .query_row([oid.to_sql()?], |row| {
                Ok((
                    row.get::<_, i64>(0)?,
                    row.get::<_, Option<Vec<u8>>>(1)?,
                    row.get::<_, State>(2)?,
                ))
            })
            .optional()?;

        let Some((prev_tid, md5, state)) = row else {
            return Ok(None);
        };
        Ok(Some(StagedRecord {
            oid,
            prev_tid: Tid::from_sql(prev_tid)?,
            fingerprint: md5.as_deref().map(Fingerprint::from_slice).transpose()?,
            state,
        }))
    }

    /// Staged oids in ascending order.
    pub fn staged_oids(&self, conn: &Connection) -> Result<Vec<Oid>, StorageError> {
        let raw: Vec<i64> = conn
            .prepare_cached(self.dialect.sql(Query::StagedOids))?
            .query_map([], |row| row.get(0))?
            .collect::<Result<_, _>>()?;
        Ok(raw.into_iter().map(Oid::from_sql).collect::<Result<_, _>>()?)
    }

    /// Discard every staged row and staged blob chunk on this connection.
    pub fn clear_staged(&self, conn: &Connection) -> Result<(), StorageError> {
        conn.execute(self.dialect.sql(Query::ClearStaged), [])?;
        conn.execute(self.dialect.sql(Query::ClearStagedBlobs), [])?;
        Ok(())
    }

    // ------------------------------------------------------------------
    // Conflict detection
    // ------------------------------------------------------------------

    /// Staged objects whose prior tid is not the committed current tid.
    ///
    /// Conflicts are data for the caller to resolve or abort on. Objects
    /// with no committed state never conflict. Order is unspecified.
    pub fn detect_conflicts(&self, conn: &Connection) -> Result<Vec<Conflict>, StorageError> {
        let mut stmt = conn.prepare_cached(self.dialect.sql(Query::DetectConflicts))?;
        let rows = stmt.query_map([], |row| {
            Ok((
                row.get::<_, i64>(0)?,
                row.get::<_, i64>(1)?,
                row.get::<_, i64>(2)?,
            ))
        })?;

        let mut conflicts = Vec::new();
        for row in rows {
            let (oid, current_tid, staged_prev_tid) = row?;
            conflicts.push(Conflict {
                oid: Oid::from_sql(oid)?,
                current_tid: Tid::from_sql(current_tid)?,
                staged_prev_tid: Tid::from_sql(staged_prev_tid)?,
            });
        }
        Ok(conflicts)
    }

    // ------------------------------------------------------------------
    // Commit
    // ------------------------------------------------------------------

    /// Promote every staged row (and, with `has_blobs`, every staged blob
    /// chunk) to permanent storage under `tid`, then empty the staging
    /// tables. Returns the promoted oids in ascending order.
    ///
    /// Atomicity comes from the enclosing database transaction.
    pub fn move_from_temp(
        &self,
        conn: &Connection,
        tid: Tid,
        has_blobs: bool,
    ) -> Result<Vec<Oid>, StorageError> {
        let tid_sql = tid.to_sql()?;
        let oids = self.staged_oids(conn)?;
        if oids.is_empty() {
            debug!(%tid, "nothing staged to move");
            return Ok(oids);
        }

        match self.mode() {
            StorageMode::HistoryPreserving => {
                conn.execute(self.dialect.sql(Query::MoveInsert), [tid_sql])?;
            }
            StorageMode::HistoryFree => {
                conn.execute(self.dialect.sql(Query::MoveDeleteState), [])?;
                conn.execute(self.dialect.sql(Query::MoveInsert), [tid_sql])?;
                if has_blobs {
                    conn.execute(self.dialect.sql(Query::MoveDeleteBlobChunks), [])?;
                }
            }
        }

        if has_blobs {
            let chunks = conn.execute(self.dialect.sql(Query::MoveCopyBlobChunks), [tid_sql])?;
            debug!(%tid, chunks, "copied staged blob chunks");
        }

        self.clear_staged(conn)?;
        debug!(%tid, objects = oids.len(), has_blobs, "moved staged objects");
        Ok(oids)
    }

    /// Point `current_object` at `tid` for every object committed in it.
    ///
    /// New objects get a fresh pointer; existing pointers are updated one
    /// row at a time in ascending oid order, the lock order every committer
    /// shares. Does nothing in history-free mode.
    pub fn update_current(&self, conn: &Connection, tid: Tid) -> Result<(), StorageError> {
        if !self.mode().keeps_history() {
            debug!(%tid, "history-free mode keeps no current pointers");
            return Ok(());
        }
        let tid_sql = tid.to_sql()?;

        let created = conn
            .prepare_cached(self.dialect.sql(Query::UpdateCurrentInsert))?
            .execute([tid_sql])?;

        let existing: Vec<i64> = conn
            .prepare_cached(self.dialect.sql(Query::UpdateCurrentSelectExisting))?
            .query_map([tid_sql], |row| row.get(0))?
            .collect::<Result<_, _>>()?;
        debug_assert!(existing.windows(2).all(|w| w[0] < w[1]));

        let mut update = conn.prepare_cached(self.dialect.sql(Query::UpdateCurrentSet))?;
        for zoid in &existing {
            update.execute([tid_sql, *zoid])?;
        }

        debug!(%tid, created, updated = existing.len(), "updated current pointers");
        Ok(())
    }

    /// Store a revision directly under a known `tid`, bypassing staging and
    /// conflict detection. Used when copying transactions from another
    /// database; the caller runs [`update_current`](Self::update_current)
    /// for `tid` afterwards.
    ///
    /// In history-free mode an empty or missing state deletes the object.
    pub fn restore(
        &self,
        conn: &Connection,
        oid: Oid,
        tid: Tid,
        state: Option<&[u8]>,
    ) -> Result<(), StorageError> {
        let oid_sql = oid.to_sql()?;
        let tid_sql = tid.to_sql()?;
        match self.mode() {
            StorageMode::HistoryPreserving => {
                let fingerprint = self.fingerprinter.compute(state);
                let size = state.map_or(0, <[u8]>::len) as i64;
                conn.execute(self.dialect.sql(Query::RestoreDelete), [oid_sql, tid_sql])?;
                conn.execute(
                    self.dialect.sql(Query::RestoreInsert),
                    rusqlite::params![
                        oid_sql,
                        tid_sql,
                        fingerprint.as_ref().map(|f| f.as_bytes().as_slice()),
                        size,
                        state,
                    ],
                )?;
            }
            StorageMode::HistoryFree => {
                conn.execute(self.dialect.sql(Query::RestoreDelete), [oid_sql])?;
                if let Some(data) = state.filter(|data| !data.is_empty()) {
                    conn.execute(
                        self.dialect.sql(Query::RestoreInsert),
                        rusqlite::params![oid_sql, tid_sql, data.len() as i64, data],
                    )?;
                }
            }
        }
        debug!(%oid, %tid, "restored object revision");
        Ok(())
    }

    // ------------------------------------------------------------------
    // Blobs
    // ------------------------------------------------------------------

    /// Store the bytes of `source` as the blob of `oid`. `tid = None` stages
    /// the blob for the current transaction.
    pub fn upload_blob(
        &self,
        conn: &Connection,
        oid: Oid,
        tid: Option<Tid>,
        source: &mut dyn Read,
    ) -> Result<u64, StorageError> {
        let size = self.backend.upload_blob(
            conn,
            &self.dialect,
            self.options.blob_chunk_size,
            oid,
            tid,
            source,
        )?;
        debug!(%oid, staged = tid.is_none(), size, "uploaded blob");
        Ok(size)
    }

    pub fn download_blob(
        &self,
        conn: &Connection,
        oid: Oid,
        tid: Tid,
        sink: &mut dyn Write,
    ) -> Result<u64, StorageError> {
        self.backend.download_blob(conn, &self.dialect, oid, tid, sink)
    }

    pub fn upload_blob_file(
        &self,
        conn: &Connection,
        oid: Oid,
        tid: Option<Tid>,
        path: &Path,
    ) -> Result<u64, StorageError> {
        let mut reader = BufReader::new(File::open(path)?);
        self.upload_blob(conn, oid, tid, &mut reader)
    }

    /// Download into a new file at `path`. The file is removed again if the
    /// blob cannot be read.
    pub fn download_blob_file(
        &self,
        conn: &Connection,
        oid: Oid,
        tid: Tid,
        path: &Path,
    ) -> Result<u64, StorageError> {
        let mut writer = BufWriter::new(File::create(path)?);
        let result = self
            .download_blob(conn, oid, tid, &mut writer)
            .and_then(|size| writer.flush().map(|_| size).map_err(StorageError::from));
        if result.is_err() {
            drop(writer);
            if let Err(e) = std::fs::remove_file(path) {
                warn!(path = %path.display(), error = %e, "failed to remove partial blob file");
            }
        }
        result
    }
}

fn check_fingerprint(oid: Oid, tid: Tid, stored: &[u8], state: &[u8]) {
    let matches = Fingerprint::from_slice(stored)
        .map(|fp| fp.verify(state))
        .unwrap_or(false);
    if !matches {
        warn!(%oid, %tid, "stored fingerprint does not match object state");
    }
}
