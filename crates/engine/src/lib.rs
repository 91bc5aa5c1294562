pub mod error;
pub mod resolver;
pub mod txn;

pub use error::EngineError;
pub use resolver::{ConflictResolver, RejectConflicts};
pub use txn::{CommitOutcome, StoreTransaction, TxnState};

use rusqlite::{Connection, TransactionBehavior};
use tracing::debug;

use relmover_core::{Oid, StoreOptions, Tid};
use relmover_storage::{Backend, ObjectMover, schema};

/// Drives store transactions through an [`ObjectMover`].
///
/// The engine holds no connection. Callers open one connection per session,
/// hand it to [`open_store_session`](Self::open_store_session) or
/// [`open_load_session`](Self::open_load_session) once, and then lend it to
/// [`begin`](Self::begin) for each transaction.
pub struct Engine<B: Backend> {
    mover: ObjectMover<B>,
}

impl<B: Backend> Engine<B> {
    pub fn new(mover: ObjectMover<B>) -> Self {
        Self { mover }
    }

    /// Build a mover for `options` and create the schema through `conn`.
    pub fn open(backend: B, options: StoreOptions, conn: &Connection) -> Result<Self, EngineError> {
        let mover = ObjectMover::new(backend, options)?;
        schema::init_schema(conn, mover.mode())?;
        debug!(
            backend = mover.backend().name(),
            mode = mover.mode().as_str(),
            "engine opened"
        );
        Ok(Self::new(mover))
    }

    pub fn mover(&self) -> &ObjectMover<B> {
        &self.mover
    }

    pub fn open_store_session(&self, conn: &Connection, restart: bool) -> Result<(), EngineError> {
        schema::configure_connection(conn)?;
        self.mover.on_store_opened(conn, restart)?;
        Ok(())
    }

    pub fn open_load_session(&self, conn: &Connection, restart: bool) -> Result<(), EngineError> {
        schema::configure_connection(conn)?;
        self.mover.on_load_opened(conn, restart)?;
        Ok(())
    }

    /// Start a transaction on a store session connection.
    pub fn begin<'c>(&'c self, conn: &'c mut Connection) -> StoreTransaction<'c, B> {
        StoreTransaction::new(&self.mover, conn)
    }

    pub fn last_tid(&self, conn: &Connection) -> Result<Tid, EngineError> {
        txn::last_committed_tid(conn)
    }

    /// Copy one transaction from another database under its original `tid`.
    ///
    /// No conflict detection runs. `tid` must be greater than every tid
    /// already committed here.
    pub fn restore_transaction(
        &self,
        conn: &mut Connection,
        tid: Tid,
        records: &[(Oid, Option<&[u8]>)],
        description: Option<&str>,
    ) -> Result<(), EngineError> {
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let last = txn::last_committed_tid(&tx)?;
        if tid <= last {
            return Err(EngineError::TidNotIncreasing { tid, last });
        }
        for (oid, state) in records {
            self.mover.restore(&tx, *oid, tid, *state)?;
        }
        self.mover.update_current(&tx, tid)?;
        txn::record_commit(&tx, tid, description)?;
        tx.commit()?;
        debug!(%tid, objects = records.len(), "restored transaction");
        Ok(())
    }
}
