//! End-to-end scenario 6 (§8): a derived function that re-enters a key
//! already on its own live-call stack must surface `EngineError::Cycle`
//! carrying the live-call stack, unchanged by the intervening recursive
//! calls (§7: "failures reach the originating top-level query unchanged
//! apart from the trace annotation").

use increment::{Database, DerivedQuery, EngineError};

struct CycleA;
impl DerivedQuery for CycleA {
    type Key = ();
    type Value = ();

    fn execute(db: &Database, key: ()) -> Result<(), EngineError> {
        db.call_derived::<CycleB>(key)
    }
}

struct CycleB;
impl DerivedQuery for CycleB {
    type Key = ();
    type Value = ();

    fn execute(db: &Database, key: ()) -> Result<(), EngineError> {
        db.call_derived::<CycleA>(key)
    }
}

#[test]
fn mutually_recursive_derived_functions_raise_a_cycle_error() {
    let db = Database::new();
    let err = db.call_derived::<CycleA>(()).unwrap_err();

    // The cycle must be reported as-is, not laundered into a
    // `UserFunctionFailure` by an intervening `.unwrap()`/panic boundary.
    match err {
        EngineError::Cycle(cycle) => {
            // CycleA -> CycleB -> CycleA: the live-call stack at the
            // moment the re-entry was detected names both frames plus the
            // repeated key that closed the loop.
            assert_eq!(cycle.live_call_stack().len(), 3);
        }
        other => panic!("expected EngineError::Cycle, got {other:?}"),
    }
}

#[test]
fn a_derived_function_that_calls_itself_with_the_same_key_cycles() {
    struct SelfCall;
    impl DerivedQuery for SelfCall {
        type Key = ();
        type Value = ();

        fn execute(db: &Database, key: ()) -> Result<(), EngineError> {
            db.call_derived::<SelfCall>(key)
        }
    }

    let db = Database::new();
    let err = db.call_derived::<SelfCall>(()).unwrap_err();
    assert!(matches!(err, EngineError::Cycle(_)));
}
