//! Concurrent top-level queries from multiple threads (§5, §8 boundary
//! behavior: "concurrent top-level queries returning the same key produce
//! equal values"), grounded on the teacher's multithreaded stress test but
//! simplified to match this engine's non-goals: no snapshots, no GC, no
//! cross-thread cancellation. Input writes still require quiescence, so
//! writes happen on the main thread between joined batches of readers
//! rather than concurrently with them.

use std::sync::Arc;
use std::thread;

use rand::Rng;

use increment::{Database, DerivedQuery, EngineError, InputQuery};

const N_KEYS: usize = 10;
const N_READER_THREADS: usize = 8;
const N_READER_OPS: usize = 100;
const N_ROUNDS: usize = 5;

struct A;
impl InputQuery for A {
    type Key = usize;
    type Value = usize;
}

struct B;
impl DerivedQuery for B {
    type Key = usize;
    type Value = usize;

    fn execute(db: &Database, key: usize) -> Result<usize, EngineError> {
        db.read_input_map::<A>(&key)
    }
}

struct C;
impl DerivedQuery for C {
    type Key = usize;
    type Value = usize;

    fn execute(db: &Database, key: usize) -> Result<usize, EngineError> {
        db.call_derived::<B>(key)
    }
}

#[derive(Clone, Copy, Debug)]
enum Query {
    A,
    B,
    C,
}

fn random_query(rng: &mut impl Rng) -> Query {
    match rng.gen_range(0..3) {
        0 => Query::A,
        1 => Query::B,
        _ => Query::C,
    }
}

fn run(db: &Database, query: Query, key: usize) -> usize {
    match query {
        Query::A => db.read_input_map::<A>(&key).unwrap(),
        Query::B => db.call_derived::<B>(key).unwrap(),
        Query::C => db.call_derived::<C>(key).unwrap(),
    }
}

#[test]
fn concurrent_readers_agree_on_every_key() {
    let _ = env_logger::builder().is_test(true).try_init();

    let db = Arc::new(Database::new());
    for key in 0..N_KEYS {
        db.set_input_map::<A>(key, key);
    }

    let mut rng = rand::thread_rng();

    for _ in 0..N_ROUNDS {
        let ops: Vec<Vec<(Query, usize)>> = (0..N_READER_THREADS)
            .map(|_| {
                (0..N_READER_OPS)
                    .map(|_| (random_query(&mut rng), rng.gen_range(0..N_KEYS)))
                    .collect()
            })
            .collect();

        let handles: Vec<_> = ops
            .into_iter()
            .map(|thread_ops| {
                let db = Arc::clone(&db);
                thread::spawn(move || {
                    thread_ops
                        .into_iter()
                        .map(|(query, key)| (query, key, run(&db, query, key)))
                        .collect::<Vec<_>>()
                })
            })
            .collect();

        let mut per_key: std::collections::HashMap<(usize, usize), usize> =
            std::collections::HashMap::new();
        for handle in handles {
            for (query, key, value) in handle.join().unwrap() {
                let tag = match query {
                    Query::A => 0,
                    Query::B => 1,
                    Query::C => 2,
                };
                let entry = per_key.entry((tag, key)).or_insert(value);
                assert_eq!(
                    *entry, value,
                    "two threads computed different values for the same query/key"
                );
            }
        }

        // All reader threads joined: derived_active_count is back to zero,
        // so a write is legal again.
        let write_key = rng.gen_range(0..N_KEYS);
        let write_value = rng.gen_range(0..100);
        db.set_input_map::<A>(write_key, write_value);
    }
}

#[test]
fn concurrent_first_computation_of_the_same_key_is_consistent() {
    let db = Arc::new(Database::new());
    db.set_input_map::<A>(0, 42);

    let handles: Vec<_> = (0..16)
        .map(|_| {
            let db = Arc::clone(&db);
            thread::spawn(move || db.call_derived::<C>(0).unwrap())
        })
        .collect();

    for handle in handles {
        assert_eq!(handle.join().unwrap(), 42);
    }
}
