use std::collections::BTreeMap;
use std::thread;

use rand::seq::SliceRandom;
use rand::{Rng, SeedableRng, rngs::StdRng};

use relmover_core::{Conflict, Oid, StoreOptions, Tid};
use relmover_engine::{CommitOutcome, EngineError};
use relmover_harness::TestDb;

type TestResult = Result<(), Box<dyn std::error::Error>>;

const WORKERS: u64 = 4;
const COMMITS_PER_WORKER: usize = 25;
const OBJECTS: u64 = 12;

fn keep_staged(_: &Conflict, _: Option<&[u8]>, staged: Option<&[u8]>) -> Option<Vec<u8>> {
    staged.map(<[u8]>::to_vec)
}

/// One worker: its own store session, random overlapping object sets,
/// conflicts settled in favor of the worker's own write.
fn run_worker(db: &TestDb, seed: u64) -> Result<Vec<CommitOutcome>, EngineError> {
    let mut conn = db.store_session()?;
    let mut rng = StdRng::seed_from_u64(seed);
    let mut outcomes = Vec::with_capacity(COMMITS_PER_WORKER);

    for round in 0..COMMITS_PER_WORKER {
        let mut oids: Vec<u64> = (1..=OBJECTS).collect();
        oids.shuffle(&mut rng);
        oids.truncate(rng.gen_range(1..=5));

        let mut txn = db.engine().begin(&mut conn);
        for oid in oids {
            let oid = Oid::new(oid);
            let prev_tid = txn.load_current(oid)?.map_or(Tid::ZERO, |(_, tid)| tid);
            let state = format!("worker {seed} round {round}");
            txn.store(oid, prev_tid, Some(state.as_bytes()))?;
        }
        outcomes.push(txn.commit(&mut keep_staged)?);
    }
    Ok(outcomes)
}

#[test]
fn concurrent_committers_keep_pointers_consistent() -> TestResult {
    for options in [StoreOptions::default(), StoreOptions::history_free()] {
        let db = TestDb::new(options)?;

        let outcomes = thread::scope(|scope| {
            let handles: Vec<_> = (0..WORKERS)
                .map(|seed| {
                    let db = &db;
                    scope.spawn(move || run_worker(db, seed))
                })
                .collect();
            handles
                .into_iter()
                .map(|handle| handle.join().expect("worker panicked"))
                .collect::<Result<Vec<_>, _>>()
        })?;

        let mut expected: BTreeMap<Oid, Tid> = BTreeMap::new();
        let mut tids = Vec::new();
        for outcome in outcomes.iter().flatten() {
            tids.push(outcome.tid);
            for oid in &outcome.oids {
                let entry = expected.entry(*oid).or_insert(outcome.tid);
                *entry = (*entry).max(outcome.tid);
            }
        }

        // Every commit got its own tid.
        tids.sort();
        tids.dedup();
        assert_eq!(tids.len(), (WORKERS as usize) * COMMITS_PER_WORKER);

        let load = db.load_session()?;
        let current = db.mover().current_transactions(&load, (1..=OBJECTS).map(Oid::new))?;
        assert_eq!(current, expected);
        assert_eq!(db.engine().last_tid(&load)?, *tids.last().ok_or("no commits")?);

        if db.mover().mode().keeps_history() {
            // Each revision points at the one committed just before it.
            for oid in expected.keys() {
                let revisions: Vec<(i64, i64)> = load
                    .prepare("SELECT tid, prev_tid FROM object_state WHERE zoid = ?1 ORDER BY tid")?
                    .query_map([oid.to_sql()?], |row| Ok((row.get(0)?, row.get(1)?)))?
                    .collect::<Result<_, _>>()?;
                let mut prev = 0;
                for (tid, prev_tid) in revisions {
                    assert_eq!(prev_tid, prev, "{oid} revision {tid}");
                    prev = tid;
                }
            }
        }
    }
    Ok(())
}
