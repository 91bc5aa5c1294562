use std::io::Read;

use rusqlite::{Connection, OptionalExtension, TransactionBehavior};
use tracing::{debug, warn};

use relmover_core::{Oid, Tid};
use relmover_storage::{Backend, ObjectMover, State};

use crate::error::EngineError;
use crate::resolver::ConflictResolver;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TxnState {
    /// Accepting writes.
    Staged,
    /// Inside the commit: conflicts checked, rows being promoted.
    Promoting,
    /// Committed and visible to new readers.
    Visible,
    /// Staged writes discarded.
    Aborted,
}

impl TxnState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Staged => "staged",
            Self::Promoting => "promoting",
            Self::Visible => "visible",
            Self::Aborted => "aborted",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommitOutcome {
    pub tid: Tid,
    /// Committed oids in ascending order.
    pub oids: Vec<Oid>,
    /// Number of conflicts the resolver settled.
    pub resolved: usize,
}

/// One in-flight write transaction on a store connection.
///
/// Writes are staged in the connection's TEMP tables without holding the
/// database write lock. [`commit`](Self::commit) takes the lock, allocates a
/// tid, and runs conflict detection, promotion, and the current-pointer
/// update as one database transaction.
pub struct StoreTransaction<'c, B: Backend> {
    mover: &'c ObjectMover<B>,
    conn: &'c mut Connection,
    state: TxnState,
    has_blobs: bool,
    description: Option<String>,
}

impl<'c, B: Backend> StoreTransaction<'c, B> {
    pub(crate) fn new(mover: &'c ObjectMover<B>, conn: &'c mut Connection) -> Self {
        Self {
            mover,
            conn,
            state: TxnState::Staged,
            has_blobs: false,
            description: None,
        }
    }

    pub fn state(&self) -> TxnState {
        self.state
    }

    pub fn set_description(&mut self, description: impl Into<String>) {
        self.description = Some(description.into());
    }

    fn expect_state(&self, expected: TxnState) -> Result<(), EngineError> {
        if self.state != expected {
            return Err(EngineError::InvalidState {
                expected,
                actual: self.state,
            });
        }
        Ok(())
    }

    /// Committed state as seen by this connection; staged writes are not
    /// included.
    pub fn load_current(&self, oid: Oid) -> Result<Option<(State, Tid)>, EngineError> {
        Ok(self.mover.load_current(self.conn, oid)?)
    }

    /// Stage `state` for `oid`, assuming `prev_tid` is its committed tid
    /// (`Tid::ZERO` for a new object).
    pub fn store(
        &mut self,
        oid: Oid,
        prev_tid: Tid,
        state: Option<&[u8]>,
    ) -> Result<(), EngineError> {
        self.expect_state(TxnState::Staged)?;
        self.mover.stage_write(self.conn, oid, prev_tid, state)?;
        Ok(())
    }

    /// Stage `state` together with a blob read from `blob`.
    pub fn store_blob(
        &mut self,
        oid: Oid,
        prev_tid: Tid,
        state: Option<&[u8]>,
        blob: &mut dyn Read,
    ) -> Result<u64, EngineError> {
        self.expect_state(TxnState::Staged)?;
        self.mover.stage_write(self.conn, oid, prev_tid, state)?;
        let size = self.mover.upload_blob(self.conn, oid, None, blob)?;
        self.has_blobs = true;
        Ok(size)
    }

    /// Commit everything staged.
    ///
    /// Conflicts go to `resolver` first; any it cannot settle abort the
    /// transaction with `EngineError::Conflict`. On any failure nothing is
    /// promoted and the transaction ends up `Aborted`.
    pub fn commit(
        &mut self,
        resolver: &mut dyn ConflictResolver,
    ) -> Result<CommitOutcome, EngineError> {
        self.expect_state(TxnState::Staged)?;
        if self.mover.staged_oids(self.conn)?.is_empty() {
            return Err(EngineError::EmptyTransaction);
        }

        self.state = TxnState::Promoting;
        let result = promote(
            self.mover,
            self.conn,
            self.has_blobs,
            self.description.as_deref(),
            resolver,
        );
        match result {
            Ok(outcome) => {
                self.state = TxnState::Visible;
                debug!(
                    tid = %outcome.tid,
                    objects = outcome.oids.len(),
                    resolved = outcome.resolved,
                    "transaction committed"
                );
                Ok(outcome)
            }
            Err(e) => {
                self.state = TxnState::Aborted;
                if let Err(clear) = self.mover.clear_staged(self.conn) {
                    warn!(error = %clear, "failed to discard staged rows after a failed commit");
                }
                Err(e)
            }
        }
    }

    /// Discard everything staged. Committed state is untouched.
    pub fn abort(&mut self) -> Result<(), EngineError> {
        self.expect_state(TxnState::Staged)?;
        self.mover.clear_staged(self.conn)?;
        self.state = TxnState::Aborted;
        debug!("transaction aborted");
        Ok(())
    }
}

impl<B: Backend> Drop for StoreTransaction<'_, B> {
    fn drop(&mut self) {
        if self.state == TxnState::Staged {
            if let Err(e) = self.mover.clear_staged(self.conn) {
                warn!(error = %e, "failed to discard staged rows of a dropped transaction");
            }
        }
    }
}

fn promote<B: Backend>(
    mover: &ObjectMover<B>,
    conn: &mut Connection,
    has_blobs: bool,
    description: Option<&str>,
    resolver: &mut dyn ConflictResolver,
) -> Result<CommitOutcome, EngineError> {
    let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
    let tid = last_committed_tid(&tx)?.next()?;

    let mut resolved = 0;
    let conflicts = mover.detect_conflicts(&tx)?;
    if !conflicts.is_empty() {
        let mut unresolved = Vec::new();
        for conflict in conflicts {
            let committed = mover
                .load_current(&tx, conflict.oid)?
                .and_then(|(state, _)| state);
            let staged = mover
                .load_staged(&tx, conflict.oid)?
                .and_then(|record| record.state);
            match resolver.resolve(&conflict, committed.as_deref(), staged.as_deref()) {
                Some(merged) => {
                    mover.replace_staged(&tx, conflict.oid, conflict.current_tid, Some(merged.as_slice()))?;
                    resolved += 1;
                }
                None => unresolved.push(conflict),
            }
        }
        if !unresolved.is_empty() {
            return Err(EngineError::Conflict(unresolved));
        }
        let remaining = mover.detect_conflicts(&tx)?;
        if !remaining.is_empty() {
            return Err(EngineError::Conflict(remaining));
        }
    }

    let oids = mover.move_from_temp(&tx, tid, has_blobs)?;
    mover.update_current(&tx, tid)?;
    record_commit(&tx, tid, description)?;
    tx.commit()?;

    Ok(CommitOutcome {
        tid,
        oids,
        resolved,
    })
}

/// Greatest tid in the commit log, `Tid::ZERO` for a fresh database.
pub fn last_committed_tid(conn: &Connection) -> Result<Tid, EngineError> {
    let last: Option<i64> = conn
        .query_row("SELECT MAX(tid) FROM commit_log", [], |row| row.get(0))
        .optional()?
        .flatten();
    match last {
        Some(last) => Ok(Tid::from_sql(last)?),
        None => Ok(Tid::ZERO),
    }
}

pub(crate) fn record_commit(
    conn: &Connection,
    tid: Tid,
    description: Option<&str>,
) -> Result<(), EngineError> {
    conn.execute(
        "INSERT INTO commit_log (tid, description) VALUES (?1, ?2)",
        rusqlite::params![tid.to_sql()?, description],
    )?;
    Ok(())
}
