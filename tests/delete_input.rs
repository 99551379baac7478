//! End-to-end scenario 5 (§8): deleting a map input that a cached derived
//! entry read must force that entry to invalidate on next access — not
//! silently return the stale cached value.

use increment::{Database, DerivedQuery, EngineError, InputQuery};

struct Grades;
impl InputQuery for Grades {
    type Key = String;
    type Value = f64;
}

struct Letter;
impl DerivedQuery for Letter {
    type Key = String;
    type Value = String;

    fn execute(db: &Database, name: String) -> Result<String, EngineError> {
        let grade = db.read_input_map::<Grades>(&name)?;
        let letters = ["D", "C", "B", "A"];
        let index = (grade.round() as i64).clamp(0, letters.len() as i64 - 1) as usize;
        Ok(letters[index].to_string())
    }
}

#[test]
fn deleting_a_dependency_key_invalidates_the_cached_derived_entry() {
    let db = Database::new();

    db.set_input_map::<Grades>("John".to_string(), 3.25);
    assert_eq!(db.call_derived::<Letter>("John".to_string()).unwrap(), "B");

    // The revision advances even though "delete" has no notion of
    // value-equality elision (§4.1): presence vs. absence is always
    // observable.
    let before = db.current_revision();
    db.delete_input_map::<Grades>(&"John".to_string());
    assert!(db.current_revision() > before);

    let err = db
        .call_derived::<Letter>("John".to_string())
        .unwrap_err();
    assert!(matches!(err, EngineError::MissingInputKey { .. }));
}

#[test]
fn deleting_an_unrelated_key_does_not_disturb_other_cached_entries() {
    let db = Database::new();
    db.set_input_map::<Grades>("John".to_string(), 3.9);
    db.set_input_map::<Grades>("Jane".to_string(), 1.1);

    assert_eq!(db.call_derived::<Letter>("John".to_string()).unwrap(), "A");
    assert_eq!(db.call_derived::<Letter>("Jane".to_string()).unwrap(), "D");

    db.delete_input_map::<Grades>(&"Jane".to_string());

    // John's entry never depended on Jane's key, so it stays fresh: no
    // recompute is forced, and the cached value is still correct.
    assert_eq!(db.call_derived::<Letter>("John".to_string()).unwrap(), "A");
    assert!(matches!(
        db.call_derived::<Letter>("Jane".to_string()).unwrap_err(),
        EngineError::MissingInputKey { .. }
    ));
}

#[test]
fn emptying_an_input_map_invalidates_every_cached_entry_that_read_it() {
    let db = Database::new();
    db.set_input_map::<Grades>("John".to_string(), 3.9);
    db.set_input_map::<Grades>("Jane".to_string(), 1.1);

    assert_eq!(db.call_derived::<Letter>("John".to_string()).unwrap(), "A");
    assert_eq!(db.call_derived::<Letter>("Jane".to_string()).unwrap(), "D");

    db.empty_input_map::<Grades>();

    assert!(matches!(
        db.call_derived::<Letter>("John".to_string()).unwrap_err(),
        EngineError::MissingInputKey { .. }
    ));
    assert!(matches!(
        db.call_derived::<Letter>("Jane".to_string()).unwrap_err(),
        EngineError::MissingInputKey { .. }
    ));
}
