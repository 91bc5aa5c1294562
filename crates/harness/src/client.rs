use std::collections::BTreeMap;
use std::sync::Arc;

use rusqlite::Connection;
use serde::Serialize;
use serde::de::DeserializeOwned;

use relmover_core::{CoreError, Oid, Tid};
use relmover_engine::{CommitOutcome, ConflictResolver, Engine, EngineError, RejectConflicts};
use relmover_storage::{Backend, SqliteBackend};

use crate::TestDb;

/// A client that stores typed values as MessagePack object states.
///
/// It remembers the tid each object was last read or written at and stages
/// writes against it, so a concurrent commit in between shows up as a
/// conflict.
pub struct TestClient<B: Backend = SqliteBackend> {
    engine: Arc<Engine<B>>,
    conn: Connection,
    seen: BTreeMap<Oid, Tid>,
    pending: BTreeMap<Oid, Option<Vec<u8>>>,
}

impl<B: Backend> TestClient<B> {
    pub fn connect(db: &TestDb<B>) -> Result<Self, EngineError> {
        Ok(Self {
            engine: Arc::clone(db.engine()),
            conn: db.store_session()?,
            seen: BTreeMap::new(),
            pending: BTreeMap::new(),
        })
    }

    /// Latest committed value of `oid`. `None` if it was never stored or its
    /// creation was undone.
    pub fn get<T: DeserializeOwned>(&mut self, oid: Oid) -> Result<Option<T>, EngineError> {
        let Some((state, tid)) = self.engine.mover().load_current(&self.conn, oid)? else {
            self.seen.remove(&oid);
            return Ok(None);
        };
        self.seen.insert(oid, tid);
        state.map(|bytes| decode(&bytes)).transpose()
    }

    /// Tid this client last saw `oid` at.
    pub fn seen_tid(&self, oid: Oid) -> Option<Tid> {
        self.seen.get(&oid).copied()
    }

    pub fn put<T: Serialize>(&mut self, oid: Oid, value: &T) -> Result<(), EngineError> {
        let bytes =
            rmp_serde::to_vec_named(value).map_err(|e| CoreError::Serialization(e.to_string()))?;
        self.pending.insert(oid, Some(bytes));
        Ok(())
    }

    /// Queue an undo of `oid`'s creation.
    pub fn remove(&mut self, oid: Oid) {
        self.pending.insert(oid, None);
    }

    /// Forget every remembered tid, as after a cache invalidation.
    pub fn forget(&mut self) {
        self.seen.clear();
    }

    pub fn commit(&mut self) -> Result<CommitOutcome, EngineError> {
        self.commit_with(&mut RejectConflicts)
    }

    /// Commit the queued writes. Queued writes are dropped whether or not
    /// the commit succeeds.
    pub fn commit_with(
        &mut self,
        resolver: &mut dyn ConflictResolver,
    ) -> Result<CommitOutcome, EngineError> {
        let pending = std::mem::take(&mut self.pending);
        let mut txn = self.engine.begin(&mut self.conn);
        for (oid, state) in &pending {
            let prev_tid = self.seen.get(oid).copied().unwrap_or(Tid::ZERO);
            txn.store(*oid, prev_tid, state.as_deref())?;
        }
        let outcome = txn.commit(resolver)?;
        drop(txn);

        for oid in &outcome.oids {
            self.seen.insert(*oid, outcome.tid);
        }
        Ok(outcome)
    }
}

fn decode<T: DeserializeOwned>(bytes: &[u8]) -> Result<T, EngineError> {
    let value =
        rmp_serde::from_slice(bytes).map_err(|e| CoreError::Serialization(e.to_string()))?;
    Ok(value)
}
