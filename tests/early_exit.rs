//! End-to-end scenario 2 (§8): a derived value that recomputes to an
//! equal result must not force its own consumer to recompute.

use increment::{Database, DerivedQuery, EngineError, InputQuery};

struct X;
impl InputQuery for X {
    type Key = ();
    type Value = i64;
}

struct Parity;
impl DerivedQuery for Parity {
    type Key = ();
    type Value = i64;

    fn execute(db: &Database, _key: ()) -> Result<i64, EngineError> {
        Ok(db.read_input_scalar::<X>()? % 2)
    }
}

struct DoubleParity;
impl DerivedQuery for DoubleParity {
    type Key = ();
    type Value = i64;

    fn execute(db: &Database, _key: ()) -> Result<i64, EngineError> {
        Ok(db.call_derived::<Parity>(())? * 2)
    }
}

#[test]
fn early_exit_shields_downstream_from_an_equal_recompute() {
    let db = Database::new();

    db.set_input_scalar::<X>(1);
    assert_eq!(db.call_derived::<DoubleParity>(()).unwrap(), 2);
    assert!(db.dependencies::<DoubleParity>(&()).is_some());
    assert_eq!(db.current_revision().as_u64(), 1);

    // x: 1 -> 3. Both are odd, so Parity recomputes to the *same* value
    // (1) it already had; DoubleParity's validity walk should see that and
    // upgrade verified_at without ever re-running its own body.
    db.set_input_scalar::<X>(3);
    assert_eq!(db.current_revision().as_u64(), 2);
    assert_eq!(db.call_derived::<DoubleParity>(()).unwrap(), 2);
}

#[test]
fn parity_itself_keeps_its_original_changed_at_across_the_elided_recompute() {
    let db = Database::new();
    db.set_input_scalar::<X>(1);
    db.call_derived::<Parity>(()).unwrap();

    db.set_input_scalar::<X>(3);
    db.call_derived::<Parity>(()).unwrap();

    // Parity's value never actually changed, so changed_at must still be
    // revision 1 even though verified_at has moved to revision 2.
    // We observe this indirectly: a derived value depending on Parity that
    // was cached at revision 1 should remain valid at revision 2.
    assert_eq!(db.call_derived::<DoubleParity>(()).unwrap(), 2);
}
