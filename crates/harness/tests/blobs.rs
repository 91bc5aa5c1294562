use rand::{Rng, SeedableRng, rngs::StdRng};
use rusqlite::Connection;

use relmover_core::{Oid, StoreOptions, Tid};
use relmover_engine::RejectConflicts;
use relmover_harness::TestDb;
use relmover_storage::{Backend, GenericBackend, StorageError};

type TestResult = Result<(), Box<dyn std::error::Error>>;

const SMALL_CHUNKS: usize = 64;

fn small_chunks(keep_history: bool) -> StoreOptions {
    StoreOptions {
        keep_history,
        blob_chunk_size: SMALL_CHUNKS,
        ..StoreOptions::default()
    }
}

fn pattern(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i % 251) as u8).collect()
}

/// Commit `blob` as the blob of `oid` and return the new tid.
fn commit_blob<B: Backend>(
    db: &TestDb<B>,
    conn: &mut Connection,
    oid: Oid,
    prev_tid: Tid,
    blob: &[u8],
) -> Result<Tid, Box<dyn std::error::Error>> {
    let mut txn = db.engine().begin(conn);
    let size = txn.store_blob(oid, prev_tid, Some(&b"blob-holder"[..]), &mut &blob[..])?;
    assert_eq!(size, blob.len() as u64);
    Ok(txn.commit(&mut RejectConflicts)?.tid)
}

fn chunk_rows(conn: &Connection, oid: u64) -> Result<Vec<(i64, i64)>, rusqlite::Error> {
    conn.prepare("SELECT tid, chunk_num FROM blob_chunk WHERE zoid = ?1 ORDER BY tid, chunk_num")?
        .query_map([oid as i64], |row| Ok((row.get(0)?, row.get(1)?)))?
        .collect()
}

// ============================================================================
// Round trips
// ============================================================================

#[test]
fn blobs_round_trip_across_chunk_boundaries() -> TestResult {
    let db = TestDb::new(small_chunks(true))?;
    let mut store = db.store_session()?;
    let load = db.load_session()?;

    for (i, len) in [0usize, 1, 63, 64, 65, 128, 1000].into_iter().enumerate() {
        let oid = Oid::new(i as u64 + 1);
        let blob = pattern(len);
        let tid = commit_blob(&db, &mut store, oid, Tid::ZERO, &blob)?;

        let mut out = Vec::new();
        let size = db.mover().download_blob(&load, oid, tid, &mut out)?;
        assert_eq!(size, len as u64);
        assert_eq!(out, blob, "blob of {len} bytes");

        let expected_chunks = len.div_ceil(SMALL_CHUNKS).max(1);
        assert_eq!(chunk_rows(&store, oid.get())?.len(), expected_chunks);
    }
    Ok(())
}

#[test]
fn generic_download_matches_stored_bytes() -> TestResult {
    let db = TestDb::with_backend(GenericBackend, small_chunks(true))?;
    let mut store = db.store_session()?;
    let blob = pattern(300);
    let tid = commit_blob(&db, &mut store, Oid::new(1), Tid::ZERO, &blob)?;

    let mut out = Vec::new();
    db.mover().download_blob(&store, Oid::new(1), tid, &mut out)?;
    assert_eq!(out, blob);
    Ok(())
}

#[test]
fn large_random_blob_survives_default_chunking() -> TestResult {
    let db = TestDb::history_preserving()?;
    let mut store = db.store_session()?;
    let mut rng = StdRng::seed_from_u64(7);
    let len = (5 << 20) / 2 + rng.gen_range(0..4096);
    let mut blob = vec![0u8; len];
    rng.fill(&mut blob[..]);

    let tid = commit_blob(&db, &mut store, Oid::new(42), Tid::ZERO, &blob)?;
    let mut out = Vec::with_capacity(len);
    db.mover().download_blob(&store, Oid::new(42), tid, &mut out)?;
    assert_eq!(blake3::hash(&out), blake3::hash(&blob));
    assert_eq!(chunk_rows(&store, 42)?.len(), 3);
    Ok(())
}

#[test]
fn blob_files_round_trip() -> TestResult {
    let db = TestDb::new(small_chunks(true))?;
    let store = db.store_session()?;
    let dir = tempfile::tempdir()?;
    let source = dir.path().join("source.bin");
    let target = dir.path().join("target.bin");
    std::fs::write(&source, pattern(777))?;

    // Stored directly under a known tid, as a restore would.
    let tid = Tid::new(5);
    let size = db.mover().upload_blob_file(&store, Oid::new(3), Some(tid), &source)?;
    assert_eq!(size, 777);
    db.mover().download_blob_file(&store, Oid::new(3), tid, &target)?;
    assert_eq!(std::fs::read(&target)?, pattern(777));
    Ok(())
}

#[test]
fn missing_blob_is_an_error_and_leaves_no_file() -> TestResult {
    let db = TestDb::history_preserving()?;
    let store = db.store_session()?;
    let dir = tempfile::tempdir()?;
    let target = dir.path().join("missing.bin");

    let result = db.mover().download_blob_file(&store, Oid::new(1), Tid::new(1), &target);
    match result {
        Err(StorageError::BlobNotFound { oid, tid }) => {
            assert_eq!(oid, Oid::new(1));
            assert_eq!(tid, Tid::new(1));
        }
        other => panic!("expected BlobNotFound, got {other:?}"),
    }
    assert!(!target.exists());
    Ok(())
}

// ============================================================================
// Storage modes
// ============================================================================

#[test]
fn history_free_replaces_blob_chunks() -> TestResult {
    let db = TestDb::new(small_chunks(false))?;
    let mut store = db.store_session()?;
    let oid = Oid::new(8);

    let first = commit_blob(&db, &mut store, oid, Tid::ZERO, &pattern(200))?;
    let second = commit_blob(&db, &mut store, oid, first, &pattern(10))?;

    let rows = chunk_rows(&store, 8)?;
    assert_eq!(rows, vec![(second.to_sql()?, 0)]);

    let mut out = Vec::new();
    assert!(matches!(
        db.mover().download_blob(&store, oid, first, &mut out),
        Err(StorageError::BlobNotFound { .. })
    ));
    out.clear();
    db.mover().download_blob(&store, oid, second, &mut out)?;
    assert_eq!(out, pattern(10));
    Ok(())
}

#[test]
fn history_preserving_keeps_every_blob_revision() -> TestResult {
    let db = TestDb::new(small_chunks(true))?;
    let mut store = db.store_session()?;
    let oid = Oid::new(8);

    let first = commit_blob(&db, &mut store, oid, Tid::ZERO, &pattern(100))?;
    let second = commit_blob(&db, &mut store, oid, first, &pattern(20))?;

    for (tid, len) in [(first, 100), (second, 20)] {
        let mut out = Vec::new();
        db.mover().download_blob(&store, oid, tid, &mut out)?;
        assert_eq!(out, pattern(len));
    }
    Ok(())
}

#[test]
fn aborted_blob_is_never_promoted() -> TestResult {
    let db = TestDb::new(small_chunks(true))?;
    let mut store = db.store_session()?;

    let mut txn = db.engine().begin(&mut store);
    txn.store_blob(Oid::new(1), Tid::ZERO, None, &mut &pattern(90)[..])?;
    txn.abort()?;
    drop(txn);

    let staged: i64 = store.query_row("SELECT COUNT(*) FROM temp_blob_chunk", [], |row| row.get(0))?;
    assert_eq!(staged, 0);

    // A later commit of another object must not pick the chunks up.
    commit_blob(&db, &mut store, Oid::new(2), Tid::ZERO, b"other")?;
    assert!(chunk_rows(&store, 1)?.is_empty());
    Ok(())
}
