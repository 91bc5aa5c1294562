use relmover_core::{Oid, Tid};
use relmover_engine::EngineError;
use relmover_harness::TestDb;

type TestResult = Result<(), Box<dyn std::error::Error>>;

/// Every `(tid, oid, state)` revision of `db`, in commit order.
fn revisions(db: &TestDb) -> Result<Vec<(Tid, Oid, Option<Vec<u8>>)>, Box<dyn std::error::Error>> {
    let load = db.load_session()?;
    let rows: Vec<(i64, i64, Option<Vec<u8>>)> = load
        .prepare("SELECT tid, zoid, state FROM object_state ORDER BY tid, zoid")?
        .query_map([], |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)))?
        .collect::<Result<_, _>>()?;
    let mut out = Vec::with_capacity(rows.len());
    for (tid, oid, state) in rows {
        out.push((Tid::from_sql(tid)?, Oid::from_sql(oid)?, state));
    }
    Ok(out)
}

#[test]
fn copied_history_matches_source() -> TestResult {
    let source = TestDb::history_preserving()?;
    let mut store = source.store_session()?;
    let a = source.commit(&mut store, &[(Oid::new(1), Tid::ZERO, Some(&b"a1"[..]))])?;
    let b = source.commit(
        &mut store,
        &[
            (Oid::new(1), a.tid, Some(&b"a2"[..])),
            (Oid::new(2), Tid::ZERO, Some(&b"b1"[..])),
        ],
    )?;
    source.commit(&mut store, &[(Oid::new(2), b.tid, None)])?;

    let target = TestDb::history_preserving()?;
    let mut conn = target.store_session()?;
    let copied = revisions(&source)?;
    let mut batch: Vec<(Oid, Option<&[u8]>)> = Vec::new();
    let mut iter = copied.iter().peekable();
    while let Some((tid, oid, state)) = iter.next() {
        batch.push((*oid, state.as_deref()));
        if iter.peek().is_none_or(|(next, _, _)| next != tid) {
            target
                .engine()
                .restore_transaction(&mut conn, *tid, &batch, Some("copied"))?;
            batch.clear();
        }
    }

    assert_eq!(revisions(&target)?, copied);
    for oid in [Oid::new(1), Oid::new(2)] {
        assert_eq!(
            target.mover().load_current(&conn, oid)?,
            source.mover().load_current(&store, oid)?
        );
    }
    assert_eq!(target.engine().last_tid(&conn)?, source.engine().last_tid(&store)?);
    Ok(())
}

#[test]
fn history_free_restore_of_empty_state_deletes() -> TestResult {
    let db = TestDb::history_free()?;
    let mut conn = db.store_session()?;
    let engine = db.engine();

    engine.restore_transaction(&mut conn, Tid::new(10), &[(Oid::new(1), Some(&b"x"[..]))], None)?;
    assert!(db.mover().exists(&conn, Oid::new(1))?);

    engine.restore_transaction(&mut conn, Tid::new(11), &[(Oid::new(1), Some(&b""[..]))], None)?;
    assert!(!db.mover().exists(&conn, Oid::new(1))?);
    assert_eq!(db.mover().load_current(&conn, Oid::new(1))?, None);

    let stale = engine.restore_transaction(&mut conn, Tid::new(3), &[], None);
    assert!(matches!(stale, Err(EngineError::TidNotIncreasing { .. })));
    Ok(())
}
