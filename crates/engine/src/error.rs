use relmover_core::{Conflict, CoreError, Tid};
use relmover_storage::StorageError;
use thiserror::Error;

use crate::txn::TxnState;

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("core error: {0}")]
    Core(#[from] CoreError),

    #[error("unresolved conflicts on {} object(s)", .0.len())]
    Conflict(Vec<Conflict>),

    #[error("transaction is {}, expected {}", .actual.as_str(), .expected.as_str())]
    InvalidState { expected: TxnState, actual: TxnState },

    #[error("nothing staged to commit")]
    EmptyTransaction,

    #[error("tid {tid} is not greater than the last committed tid {last}")]
    TidNotIncreasing { tid: Tid, last: Tid },
}

impl From<rusqlite::Error> for EngineError {
    fn from(e: rusqlite::Error) -> Self {
        Self::Storage(StorageError::Sqlite(e))
    }
}
