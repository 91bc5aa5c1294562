use relmover_core::{CoreError, Oid, StorageMode, Tid};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serialization(String),

    #[error("blob not found: oid {oid}, tid {tid}")]
    BlobNotFound { oid: Oid, tid: Tid },

    #[error("database was created {found}, opened {expected}")]
    ModeMismatch {
        expected: &'static str,
        found: &'static str,
    },

    #[error("core error: {0}")]
    Core(#[from] CoreError),
}

impl StorageError {
    pub(crate) fn mode_mismatch(expected: StorageMode, found: StorageMode) -> Self {
        Self::ModeMismatch {
            expected: expected.as_str(),
            found: found.as_str(),
        }
    }
}
