use serde::{Deserialize, Serialize};

use crate::CoreError;

/// Chunk size used when splitting large objects into `blob_chunk` rows.
pub const DEFAULT_BLOB_CHUNK_SIZE: usize = 1 << 20;

/// Maximum number of ids bound into one `IN (...)` list.
///
/// Portability constant: SQLite before 3.32 caps a statement at 999 bound
/// parameters, Oracle caps IN lists at 1000 entries.
pub const DEFAULT_ID_BATCH_SIZE: usize = 1000;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum StorageMode {
    /// Every committed revision is retained.
    HistoryPreserving,
    /// Only the latest revision of each object is retained.
    HistoryFree,
}

impl StorageMode {
    pub fn from_keep_history(keep_history: bool) -> Self {
        if keep_history {
            Self::HistoryPreserving
        } else {
            Self::HistoryFree
        }
    }

    pub fn keeps_history(&self) -> bool {
        matches!(self, Self::HistoryPreserving)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::HistoryPreserving => "history-preserving",
            Self::HistoryFree => "history-free",
        }
    }
}

/// Installation-wide settings. The mode is fixed when the schema is created.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreOptions {
    pub keep_history: bool,
    pub blob_chunk_size: usize,
    pub id_batch_size: usize,
}

impl Default for StoreOptions {
    fn default() -> Self {
        Self {
            keep_history: true,
            blob_chunk_size: DEFAULT_BLOB_CHUNK_SIZE,
            id_batch_size: DEFAULT_ID_BATCH_SIZE,
        }
    }
}

impl StoreOptions {
    pub fn history_free() -> Self {
        Self {
            keep_history: false,
            ..Self::default()
        }
    }

    pub fn mode(&self) -> StorageMode {
        StorageMode::from_keep_history(self.keep_history)
    }

    pub fn validate(&self) -> Result<(), CoreError> {
        if self.blob_chunk_size == 0 {
            return Err(CoreError::InvalidOptions("blob_chunk_size must be positive".into()));
        }
        if self.id_batch_size == 0 {
            return Err(CoreError::InvalidOptions("id_batch_size must be positive".into()));
        }
        Ok(())
    }

    pub fn to_msgpack(&self) -> Result<Vec<u8>, CoreError> {
        rmp_serde::to_vec_named(self).map_err(|e| CoreError::Serialization(e.to_string()))
    }

    pub fn from_msgpack(bytes: &[u8]) -> Result<Self, CoreError> {
        let options: Self =
            rmp_serde::from_slice(bytes).map_err(|e| CoreError::Serialization(e.to_string()))?;
        options.validate()?;
        Ok(options)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_keep_history() {
        let opts = StoreOptions::default();
        assert_eq!(opts.mode(), StorageMode::HistoryPreserving);
        assert_eq!(opts.id_batch_size, DEFAULT_ID_BATCH_SIZE);
        assert!(opts.validate().is_ok());
        assert_eq!(StoreOptions::history_free().mode(), StorageMode::HistoryFree);
    }

    #[test]
    fn msgpack_persisted_options_are_validated() {
        let opts = StoreOptions {
            keep_history: false,
            blob_chunk_size: 4096,
            id_batch_size: 10,
        };
        let bytes = opts.to_msgpack().unwrap();
        assert_eq!(StoreOptions::from_msgpack(&bytes).unwrap(), opts);

        let broken = StoreOptions {
            blob_chunk_size: 0,
            ..StoreOptions::default()
        };
        let bytes = broken.to_msgpack().unwrap();
        assert!(matches!(
            StoreOptions::from_msgpack(&bytes),
            Err(CoreError::InvalidOptions(_))
        ));
    }
}
