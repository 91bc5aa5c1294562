//! Statement selection for the two storage modes.
//!
//! Every statement the object mover runs is named by a [`Query`]. A
//! [`Dialect`] resolves a query to SQL once per mode, and a backend may
//! replace any entry with an equivalent form that suits its engine better.

use std::collections::BTreeMap;

use relmover_core::StorageMode;

/// Marker replaced by a list of `?` placeholders in batched id queries.
pub const ID_LIST_MARKER: &str = "{ids}";

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Query {
    LoadCurrent,
    LoadRevision,
    LoadBefore,
    Exists,
    TidAfter,
    CurrentTids,
    LoadStaged,
    DeleteStaged,
    InsertStaged,
    ReplaceStaged,
    ClearStaged,
    ClearStagedBlobs,
    StagedOids,
    DetectConflicts,
    MoveDeleteState,
    MoveInsert,
    MoveDeleteBlobChunks,
    MoveCopyBlobChunks,
    UpdateCurrentInsert,
    UpdateCurrentSelectExisting,
    UpdateCurrentSet,
    RestoreDelete,
    RestoreInsert,
    BlobChunks,
    BlobDelete,
    BlobInsert,
    StagedBlobDelete,
    StagedBlobInsert,
}

#[derive(Debug, Clone)]
pub struct Dialect {
    mode: StorageMode,
    overrides: BTreeMap<Query, &'static str>,
}

impl Dialect {
    pub fn new(mode: StorageMode) -> Self {
        Self {
            mode,
            overrides: BTreeMap::new(),
        }
    }

    pub fn with_overrides<I>(mut self, overrides: I) -> Self
    where
        I: IntoIterator<Item = (Query, &'static str)>,
    {
        self.overrides.extend(overrides);
        self
    }

    pub fn mode(&self) -> StorageMode {
        self.mode
    }

    pub fn is_overridden(&self, query: Query) -> bool {
        self.overrides.contains_key(&query)
    }

    pub fn sql(&self, query: Query) -> &'static str {
        match self.overrides.get(&query) {
            Some(sql) => sql,
            None => default_sql(self.mode, query),
        }
    }
}

fn default_sql(mode: StorageMode, query: Query) -> &'static str {
    use StorageMode::{HistoryFree as Hf, HistoryPreserving as Hp};

    match (query, mode) {
        (Query::LoadCurrent, Hp) => {
            "SELECT state, tid, md5
             FROM current_object
                JOIN object_state USING (zoid, tid)
             WHERE zoid = ?1"
        }
        (Query::LoadCurrent, Hf) => "SELECT state, tid, NULL FROM object_state WHERE zoid = ?1",

        (Query::LoadRevision, _) => "SELECT state FROM object_state WHERE zoid = ?1 AND tid = ?2",

        (Query::LoadBefore, _) => {
            "SELECT state, tid
             FROM object_state
             WHERE zoid = ?1
                AND tid < ?2
             ORDER BY tid DESC
             LIMIT 1"
        }

        (Query::Exists, Hp) => "SELECT 1 FROM current_object WHERE zoid = ?1",
        (Query::Exists, Hf) => "SELECT 1 FROM object_state WHERE zoid = ?1",

        (Query::TidAfter, _) => {
            "SELECT tid
             FROM object_state
             WHERE zoid = ?1
                AND tid > ?2
             ORDER BY tid
             LIMIT 1"
        }

        (Query::CurrentTids, Hp) => "SELECT zoid, tid FROM current_object WHERE zoid IN ({ids})",
        (Query::CurrentTids, Hf) => "SELECT zoid, tid FROM object_state WHERE zoid IN ({ids})",

        (Query::LoadStaged, _) => "SELECT prev_tid, md5, state FROM temp_store WHERE zoid = ?1",
        (Query::DeleteStaged, _) => "DELETE FROM temp_store WHERE zoid = ?1",
        (Query::InsertStaged, _) => {
            "INSERT INTO temp_store (zoid, prev_tid, md5, state) VALUES (?1, ?2, ?3, ?4)"
        }
        (Query::ReplaceStaged, _) => {
            "UPDATE temp_store SET
                prev_tid = ?2,
                md5 = ?3,
                state = ?4
             WHERE zoid = ?1"
        }
        (Query::ClearStaged, _) => "DELETE FROM temp_store",
        (Query::ClearStagedBlobs, _) => "DELETE FROM temp_blob_chunk",
        (Query::StagedOids, _) => "SELECT zoid FROM temp_store ORDER BY zoid",

        (Query::DetectConflicts, Hp) => {
            "SELECT temp_store.zoid, current_object.tid, temp_store.prev_tid
             FROM temp_store
                JOIN current_object ON (current_object.zoid = temp_store.zoid)
             WHERE temp_store.prev_tid != current_object.tid"
        }
        (Query::DetectConflicts, Hf) => {
            "SELECT temp_store.zoid, object_state.tid, temp_store.prev_tid
             FROM temp_store
                JOIN object_state ON (object_state.zoid = temp_store.zoid)
             WHERE temp_store.prev_tid != object_state.tid"
        }

        (Query::MoveDeleteState, _) => {
            "DELETE FROM object_state WHERE zoid IN (SELECT zoid FROM temp_store)"
        }
        (Query::MoveInsert, Hp) => {
            "INSERT INTO object_state (zoid, tid, prev_tid, md5, state_size, state)
             SELECT zoid, ?1,
                COALESCE((SELECT current_object.tid FROM current_object
                          WHERE current_object.zoid = temp_store.zoid), 0),
                md5, COALESCE(LENGTH(state), 0), state
             FROM temp_store"
        }
        (Query::MoveInsert, Hf) => {
            "INSERT INTO object_state (zoid, tid, state_size, state)
             SELECT zoid, ?1, COALESCE(LENGTH(state), 0), state
             FROM temp_store"
        }
        (Query::MoveDeleteBlobChunks, _) => {
            "DELETE FROM blob_chunk WHERE zoid IN (SELECT zoid FROM temp_store)"
        }
        (Query::MoveCopyBlobChunks, _) => {
            "INSERT INTO blob_chunk (zoid, tid, chunk_num, chunk)
             SELECT zoid, ?1, chunk_num, chunk
             FROM temp_blob_chunk
             WHERE zoid IN (SELECT zoid FROM temp_store)
             ORDER BY zoid, chunk_num"
        }

        // History-free databases have no current_object table; the object
        // mover never issues these there.
        (Query::UpdateCurrentInsert, _) => {
            "INSERT INTO current_object (zoid, tid)
             SELECT zoid, tid FROM object_state
             WHERE tid = ?1
                AND prev_tid = 0"
        }
        (Query::UpdateCurrentSelectExisting, _) => {
            "SELECT zoid FROM object_state
             WHERE tid = ?1
                AND prev_tid != 0
             ORDER BY zoid"
        }
        (Query::UpdateCurrentSet, _) => "UPDATE current_object SET tid = ?1 WHERE zoid = ?2",

        (Query::RestoreDelete, Hp) => "DELETE FROM object_state WHERE zoid = ?1 AND tid = ?2",
        (Query::RestoreDelete, Hf) => "DELETE FROM object_state WHERE zoid = ?1",
        (Query::RestoreInsert, Hp) => {
            "INSERT INTO object_state (zoid, tid, prev_tid, md5, state_size, state)
             VALUES (?1, ?2, COALESCE((SELECT tid FROM current_object WHERE zoid = ?1), 0), ?3, ?4, ?5)"
        }
        (Query::RestoreInsert, Hf) => {
            "INSERT INTO object_state (zoid, tid, state_size, state) VALUES (?1, ?2, ?3, ?4)"
        }

        (Query::BlobChunks, _) => {
            "SELECT chunk FROM blob_chunk
             WHERE zoid = ?1
                AND tid = ?2
             ORDER BY chunk_num"
        }
        (Query::BlobDelete, Hp) => "DELETE FROM blob_chunk WHERE zoid = ?1 AND tid = ?2",
        (Query::BlobDelete, Hf) => "DELETE FROM blob_chunk WHERE zoid = ?1 AND tid <= ?2",
        (Query::BlobInsert, _) => {
            "INSERT INTO blob_chunk (zoid, tid, chunk_num, chunk) VALUES (?1, ?2, ?3, ?4)"
        }
        (Query::StagedBlobDelete, _) => "DELETE FROM temp_blob_chunk WHERE zoid = ?1",
        (Query::StagedBlobInsert, _) => {
            "INSERT INTO temp_blob_chunk (zoid, chunk_num, chunk) VALUES (?1, ?2, ?3)"
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mode_selects_statement_form() {
        let hp = Dialect::new(StorageMode::HistoryPreserving);
        let hf = Dialect::new(StorageMode::HistoryFree);
        assert!(hp.sql(Query::DetectConflicts).contains("current_object"));
        assert!(!hf.sql(Query::DetectConflicts).contains("current_object"));
        assert_eq!(hp.sql(Query::LoadRevision), hf.sql(Query::LoadRevision));
    }

    #[test]
    fn overrides_replace_defaults() {
        let dialect = Dialect::new(StorageMode::HistoryFree)
            .with_overrides([(Query::Exists, "SELECT 1 FROM object_state WHERE zoid = ?1 LIMIT 1")]);
        assert!(dialect.is_overridden(Query::Exists));
        assert!(dialect.sql(Query::Exists).ends_with("LIMIT 1"));
        assert!(!dialect.is_overridden(Query::LoadCurrent));
    }

    #[test]
    fn batched_queries_carry_marker() {
        for mode in [StorageMode::HistoryPreserving, StorageMode::HistoryFree] {
            assert!(Dialect::new(mode).sql(Query::CurrentTids).contains(ID_LIST_MARKER));
        }
    }
}
