use std::io::{Read, Write};

use rusqlite::Connection;

use relmover_core::{Fingerprint, Oid, StorageMode, Tid};

use crate::dialect::{Dialect, Query};
use crate::error::StorageError;
use crate::schema;

/// One row headed for `temp_store`.
#[derive(Debug, Clone, Copy)]
pub struct StagedWrite<'a> {
    pub oid: Oid,
    pub prev_tid: Tid,
    pub fingerprint: Option<Fingerprint>,
    pub state: Option<&'a [u8]>,
}

/// A row read back from this connection's `temp_store`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StagedRecord {
    pub oid: Oid,
    pub prev_tid: Tid,
    pub fingerprint: Option<Fingerprint>,
    pub state: Option<Vec<u8>>,
}

/// Engine-specific capabilities the commit protocol relies on.
///
/// The provided methods use only portable SQL from the [`Dialect`]; a backend
/// overrides them where its engine has a better native form.
pub trait Backend: Send + Sync {
    fn name(&self) -> &'static str;

    /// Replacement statements for this engine, applied on top of the
    /// defaults for `mode`.
    fn statement_overrides(&self, _mode: StorageMode) -> Vec<(Query, &'static str)> {
        Vec::new()
    }

    /// Run once per fresh store session.
    fn store_opened_statements(&self) -> &'static [&'static str] {
        schema::TEMP_TABLE_STATEMENTS
    }

    /// Run once per fresh load session.
    fn load_opened_statements(&self) -> &'static [&'static str] {
        &[]
    }

    /// Stage a write, replacing any staged row for the same oid.
    fn store_temp(
        &self,
        conn: &Connection,
        dialect: &Dialect,
        write: &StagedWrite<'_>,
    ) -> Result<(), StorageError> {
        let oid = write.oid.to_sql()?;
        conn.prepare_cached(dialect.sql(Query::DeleteStaged))?
            .execute([oid])?;
        conn.prepare_cached(dialect.sql(Query::InsertStaged))?
            .execute(rusqlite::params![
                oid,
                write.prev_tid.to_sql()?,
                write.fingerprint.as_ref().map(|f| f.as_bytes().as_slice()),
                write.state,
            ])?;
        Ok(())
    }

    /// Split `source` into `chunk_size` pieces and store them for `oid`.
    ///
    /// With `tid = None` the chunks go to `temp_blob_chunk` and are promoted
    /// by the commit. Existing chunks under the same key are replaced.
    /// Returns the number of bytes stored.
    fn upload_blob(
        &self,
        conn: &Connection,
        dialect: &Dialect,
        chunk_size: usize,
        oid: Oid,
        tid: Option<Tid>,
        source: &mut dyn Read,
    ) -> Result<u64, StorageError> {
        let oid_sql = oid.to_sql()?;
        let tid_sql = tid.map(Tid::to_sql).transpose()?;
        match tid_sql {
            Some(tid_sql) => {
                conn.execute(dialect.sql(Query::BlobDelete), [oid_sql, tid_sql])?;
            }
            None => {
                conn.execute(dialect.sql(Query::StagedBlobDelete), [oid_sql])?;
            }
        }

        let mut buf = vec![0u8; chunk_size];
        let mut total = 0u64;
        let mut chunk_num = 0i64;
        loop {
            let len = fill_chunk(source, &mut buf)?;
            // An empty blob still gets one chunk so it can be told apart
            // from a missing one.
            if len == 0 && chunk_num > 0 {
                break;
            }
            let chunk = &buf[..len];
            match tid_sql {
                Some(tid_sql) => {
                    conn.prepare_cached(dialect.sql(Query::BlobInsert))?
                        .execute(rusqlite::params![oid_sql, tid_sql, chunk_num, chunk])?;
                }
                None => {
                    conn.prepare_cached(dialect.sql(Query::StagedBlobInsert))?
                        .execute(rusqlite::params![oid_sql, chunk_num, chunk])?;
                }
            }
            total += len as u64;
            chunk_num += 1;
            if len < buf.len() {
                break;
            }
        }
        Ok(total)
    }

    /// Write the blob stored for `(oid, tid)` to `sink`, chunk by chunk.
    fn download_blob(
        &self,
        conn: &Connection,
        dialect: &Dialect,
        oid: Oid,
        tid: Tid,
        sink: &mut dyn Write,
    ) -> Result<u64, StorageError> {
        let mut stmt = conn.prepare_cached(dialect.sql(Query::BlobChunks))?;
        let mut rows = stmt.query([oid.to_sql()?, tid.to_sql()?])?;
        let mut found = false;
        let mut total = 0u64;
        while let Some(row) = rows.next()? {
            found = true;
            let chunk = row
                .get_ref(0)?
                .as_blob()
                .map_err(|e| StorageError::Serialization(e.to_string()))?;
            sink.write_all(chunk)?;
            total += chunk.len() as u64;
        }
        if !found {
            return Err(StorageError::BlobNotFound { oid, tid });
        }
        Ok(total)
    }
}

/// Read until `buf` is full or the source is exhausted.
pub(crate) fn fill_chunk(source: &mut dyn Read, buf: &mut [u8]) -> std::io::Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        match source.read(&mut buf[filled..]) {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        }
    }
    Ok(filled)
}

/// Portable backend: default statements, delete-then-insert staging.
#[derive(Debug, Clone, Copy, Default)]
pub struct GenericBackend;

impl Backend for GenericBackend {
    fn name(&self) -> &'static str {
        "generic"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Hands out at most three bytes per read call.
    struct Trickle<'a>(&'a [u8]);

    impl Read for Trickle<'_> {
        fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
            let n = buf.len().min(3).min(self.0.len());
            buf[..n].copy_from_slice(&self.0[..n]);
            self.0 = &self.0[n..];
            Ok(n)
        }
    }

    #[test]
    fn fill_chunk_handles_short_reads() {
        let data = b"abcdefghij";
        let mut source = Trickle(data);
        let mut buf = [0u8; 8];
        assert_eq!(fill_chunk(&mut source, &mut buf).unwrap(), 8);
        assert_eq!(&buf, b"abcdefgh");
        assert_eq!(fill_chunk(&mut source, &mut buf).unwrap(), 2);
        assert_eq!(&buf[..2], b"ij");
        assert_eq!(fill_chunk(&mut source, &mut buf).unwrap(), 0);
    }
}
