#![warn(rust_2018_idioms)]
#![warn(missing_docs)]

//! A small engine for demand-driven, incrementalized computation.
//!
//! Clients declare two kinds of queries by implementing a trait on a
//! zero-sized marker type:
//!
//! - [`InputQuery`]: an externally-settable value, read with
//!   [`Database::read_input_scalar`]/[`Database::read_input_map`] and
//!   written with [`Database::set_input_scalar`]/[`Database::set_input_map`].
//! - [`DerivedQuery`]: a pure function of inputs and other derived queries,
//!   invoked with [`Database::call_derived`]. Results are memoized against
//!   a single global [`Revision`] clock and only recomputed when a
//!   transitive dependency has actually changed.
//!
//! ```
//! use increment::{Database, InputQuery, DerivedQuery};
//!
//! struct Number;
//! impl InputQuery for Number {
//!     type Key = ();
//!     type Value = i64;
//! }
//!
//! struct IsEven;
//! impl DerivedQuery for IsEven {
//!     type Key = ();
//!     type Value = bool;
//!     fn execute(db: &Database, _key: ()) -> Result<bool, EngineError> {
//!         Ok(db.read_input_scalar::<Number>()? % 2 == 0)
//!     }
//! }
//!
//! let db = Database::new();
//! db.set_input_scalar::<Number>(4);
//! assert_eq!(db.call_derived::<IsEven>(()).unwrap(), true);
//! ```

mod error;
mod key;
mod revision;
mod store;
mod trace;
mod value;

pub use error::{CycleError, EngineError, UserFunctionFailure};
pub use key::{ArgumentTuple, DependencyKey, DerivedId, InputId, QueryId};
pub use revision::Revision;
pub use value::Indistinguishable;

use std::any::Any;
use std::fmt;
use std::hash::Hash;
use std::panic::{self, AssertUnwindSafe};

use parking_lot::Mutex;

use error::extract_panic_message;
use key::DependencyKey as Dep;
use store::{DerivedEntry, Inner, InputEntry};

/// A key usable inside a [`DependencyKey`]: erasable, hashable, comparable,
/// printable, and `'static`.
pub trait QueryKey: Any + Eq + Hash + Clone + fmt::Debug + Send + Sync {}
impl<T: Any + Eq + Hash + Clone + fmt::Debug + Send + Sync> QueryKey for T {}

/// A value cacheable inside an [`InputEntry`]/`DerivedEntry`: cloneable,
/// comparable by the engine's [`Indistinguishable`] predicate, and safe to
/// move across threads (the cache may be read from any thread).
pub trait QueryValue: Clone + Indistinguishable + Send + Sync + 'static {}
impl<T: Clone + Indistinguishable + Send + Sync + 'static> QueryValue for T {}

/// Declares an input family: a keyed table (`Key` anything but `()`) or a
/// single scalar slot (`Key = ()`). See §6, "Registration surface."
pub trait InputQuery: Any + Send + Sync + 'static {
    type Key: QueryKey;
    type Value: QueryValue;
}

/// Declares a derived function: a pure computation over `Key`, memoized
/// against its [`Revision`]-stamped dependencies. See §6.
pub trait DerivedQuery: Any + Send + Sync + 'static {
    type Key: QueryKey;
    type Value: QueryValue;

    /// The user-supplied computation. Runs with the cache lock **not**
    /// held; may freely call back into `db` for its own dependencies.
    ///
    /// Returns `Result` rather than `Self::Value` so that a failure raised
    /// by a nested `call_derived`/`read_input_*` (an `EngineError::Cycle`,
    /// say) can be propagated with `?` unchanged, instead of forcing
    /// callers to `.unwrap()` it into a panic that the engine would then
    /// have to re-catch and misreport as a [`UserFunctionFailure`] (§7).
    fn execute(db: &Database, key: Self::Key) -> Result<Self::Value, EngineError>;
}

/// A value together with the revision at which it last actually changed.
#[derive(Clone)]
pub(crate) struct Stamped<V> {
    pub(crate) value: V,
    pub(crate) changed_at: Revision,
}

/// Decrements `active_count` on every exit path, including unwinds, so the
/// "no input mutation while any derived computation is active" invariant
/// (§3 Invariant 1) can never be left permanently set after a panic.
struct ActiveGuard<'a> {
    inner: &'a Mutex<Inner>,
}

impl<'a> ActiveGuard<'a> {
    fn enter(inner: &'a Mutex<Inner>) -> Self {
        inner.lock().active_count += 1;
        ActiveGuard { inner }
    }
}

impl Drop for ActiveGuard<'_> {
    fn drop(&mut self) {
        self.inner.lock().active_count -= 1;
    }
}

/// Owns the Cache Store and Revision Clock behind one lock (§4.2, §5).
/// Cheap to construct; typically one `Database` is created per program and
/// shared (via `&Database`, or wrapped in an `Arc`) across every thread
/// that issues queries.
#[derive(Default)]
pub struct Database {
    inner: Mutex<Inner>,
}

impl Database {
    pub fn new() -> Self {
        Database {
            inner: Mutex::new(Inner::default()),
        }
    }

    // ---- query surface: reads -------------------------------------------------

    /// Reads a scalar input (`Key = ()`), failing with
    /// [`EngineError::UninitializedInput`] if it was never set.
    pub fn read_input_scalar<I>(&self) -> Result<I::Value, EngineError>
    where
        I: InputQuery<Key = ()>,
    {
        log::debug!("read_input_scalar({})", std::any::type_name::<I>());
        let stamped = self.input_lookup::<I>(&())?;
        trace::record(Dep::input::<I>(()));
        Ok(stamped.value)
    }

    /// Reads a map input, failing with [`EngineError::MissingInputKey`] if
    /// `key` has no entry.
    pub fn read_input_map<I: InputQuery>(&self, key: &I::Key) -> Result<I::Value, EngineError> {
        log::debug!(
            "read_input_map({}, {:?})",
            std::any::type_name::<I>(),
            key
        );
        let stamped = self.input_lookup::<I>(key)?;
        trace::record(Dep::input::<I>(key.clone()));
        Ok(stamped.value)
    }

    /// Invokes (or returns the memoized result of) a derived function. May
    /// propagate [`EngineError::Cycle`] or [`EngineError::UserFunctionFailure`]
    /// raised by the computation itself.
    pub fn call_derived<Q: DerivedQuery>(&self, key: Q::Key) -> Result<Q::Value, EngineError> {
        log::debug!("call_derived({}, {:?})", std::any::type_name::<Q>(), key);
        let stamped = self.memoized_lookup::<Q>(key.clone())?;
        trace::record(Dep::derived::<Q>(key));
        Ok(stamped.value)
    }

    // ---- query surface: writes -------------------------------------------------

    /// Sets a scalar input. A no-op (Early-Exit Part 1, §4.1) if the new
    /// value is [`Indistinguishable`] from the current one.
    pub fn set_input_scalar<I>(&self, value: I::Value)
    where
        I: InputQuery<Key = ()>,
    {
        self.set_input_map::<I>((), value);
    }

    /// Sets a map input entry. A no-op (Early-Exit Part 1) if the new value
    /// is [`Indistinguishable`] from the current one at `key`.
    pub fn set_input_map<I: InputQuery>(&self, key: I::Key, value: I::Value) {
        let mut inner = self.inner.lock();
        let table = inner.ensure_input_table::<I>();
        if let Some(existing) = table.entries.get(&key) {
            if existing.value.indistinguishable(&value) {
                log::trace!(
                    "set_input_map({}, {:?}) ignored: value unchanged",
                    std::any::type_name::<I>(),
                    key
                );
                return;
            }
        }
        inner.require_quiescent();
        inner.revision = inner.revision.next();
        let revision = inner.revision;
        log::debug!(
            "set_input_map({}, {:?}) -> {}",
            std::any::type_name::<I>(),
            key,
            revision
        );
        let table = inner.ensure_input_table::<I>();
        table.entries.insert(
            key,
            InputEntry {
                value,
                changed_at: revision,
            },
        );
    }

    /// Removes a map input entry. Unconditionally advances the revision
    /// (§4.1): unlike `set_input_map`, deletion is not elided even if the
    /// key was already absent, since "present vs. absent" is always an
    /// observable change in a reader's error disposition.
    pub fn delete_input_map<I: InputQuery>(&self, key: &I::Key) {
        let mut inner = self.inner.lock();
        inner.require_quiescent();
        inner.revision = inner.revision.next();
        log::debug!(
            "delete_input_map({}, {:?}) -> {}",
            std::any::type_name::<I>(),
            key,
            inner.revision
        );
        let table = inner.ensure_input_table::<I>();
        table.entries.remove(key);
    }

    /// Clears every entry in an input family's table as a single mutation.
    pub fn empty_input_map<I: InputQuery>(&self) {
        let mut inner = self.inner.lock();
        inner.require_quiescent();
        inner.revision = inner.revision.next();
        log::debug!(
            "empty_input_map({}) -> {}",
            std::any::type_name::<I>(),
            inner.revision
        );
        let table = inner.ensure_input_table::<I>();
        table.entries.clear();
    }

    // ---- introspection (§6) -----------------------------------------------------

    /// The current value of the Revision Clock.
    pub fn current_revision(&self) -> Revision {
        self.inner.lock().revision
    }

    /// All keys currently cached for a derived function, in insertion
    /// order.
    pub fn cached_keys<Q: DerivedQuery>(&self) -> Vec<Q::Key> {
        let mut inner = self.inner.lock();
        inner
            .ensure_derived_table::<Q>()
            .entries
            .keys()
            .cloned()
            .collect()
    }

    /// The recorded direct dependencies of a cached derived entry, if any.
    pub fn dependencies<Q: DerivedQuery>(&self, key: &Q::Key) -> Option<Vec<DependencyKey>> {
        let mut inner = self.inner.lock();
        inner
            .ensure_derived_table::<Q>()
            .entries
            .get(key)
            .map(|entry| entry.dependencies.iter().cloned().collect())
    }

    // ---- internals --------------------------------------------------------------

    /// Input half of `key_changed_at` (§4.4.3): used by the validity walk,
    /// does *not* record a trace dependency (the walk is the engine
    /// re-checking its own bookkeeping, not a fresh read by an active
    /// query).
    pub(crate) fn input_changed_at<I: InputQuery>(
        &self,
        key: &I::Key,
    ) -> Result<Revision, EngineError> {
        Ok(self.input_lookup::<I>(key)?.changed_at)
    }

    fn input_lookup<I: InputQuery>(&self, key: &I::Key) -> Result<Stamped<I::Value>, EngineError> {
        let mut inner = self.inner.lock();
        let table = inner.ensure_input_table::<I>();
        match table.entries.get(key) {
            Some(entry) => Ok(Stamped {
                value: entry.value.clone(),
                changed_at: entry.changed_at,
            }),
            None => Err(missing_input_error::<I>(key)),
        }
    }

    /// The Lookup Engine's memoized-lookup state machine for a derived key
    /// (§4.4.1). Does *not* record a trace dependency on the caller's
    /// frame by itself; `call_derived` does that after this returns. Used
    /// directly (without the extra record) by the validity walk via
    /// `DerivedAdapter::changed_at`.
    pub(crate) fn memoized_lookup<Q: DerivedQuery>(
        &self,
        key: Q::Key,
    ) -> Result<Stamped<Q::Value>, EngineError> {
        let _active = ActiveGuard::enter(&self.inner);

        let revision_now = self.inner.lock().revision;

        // Step 2: cache probe, under lock.
        let previous: Option<DerivedEntry<Q::Value>> = {
            let mut inner = self.inner.lock();
            let table = inner.ensure_derived_table::<Q>();
            match table.entries.get(&key) {
                // Step 3: fresh.
                Some(entry) if entry.verified_at == revision_now => {
                    log::trace!(
                        "{}({:?}) fresh at {}",
                        std::any::type_name::<Q>(),
                        key,
                        revision_now
                    );
                    return Ok(Stamped {
                        value: entry.value.clone(),
                        changed_at: entry.changed_at,
                    });
                }
                Some(entry) => Some(entry.clone()),
                None => None,
            }
        };

        // Step 4: validity walk, lock released.
        if let Some(previous) = &previous {
            let mut valid = true;
            for dep in &previous.dependencies {
                let dep_changed_at = self.dispatch_changed_at(dep)?;
                log::trace!(
                    "{}({:?}) dependency {:?} changed_at={} verified_at={}",
                    std::any::type_name::<Q>(),
                    key,
                    dep,
                    dep_changed_at,
                    previous.verified_at
                );
                if dep_changed_at > previous.verified_at {
                    valid = false;
                    break;
                }
            }
            if valid {
                let mut inner = self.inner.lock();
                let table = inner.ensure_derived_table::<Q>();
                let entry = table
                    .entries
                    .get_mut(&key)
                    .expect("derived entries are never removed while the lock is held");
                entry.verified_at = revision_now;
                return Ok(Stamped {
                    value: previous.value.clone(),
                    changed_at: previous.changed_at,
                });
            }
        }

        // Step 5: recompute, lock released.
        let dep_key = Dep::derived::<Q>(key.clone());
        trace::enter_frame(dep_key)?;
        let outcome = panic::catch_unwind(AssertUnwindSafe(|| Q::execute(self, key.clone())));
        let live_call_stack = if outcome.is_err() {
            Some(trace::live_call_stack_snapshot())
        } else {
            None
        };
        let deps = trace::exit_frame();

        let value = match outcome {
            // The user function ran to completion and itself succeeded.
            Ok(Ok(value)) => value,
            // The user function ran to completion but a nested
            // `call_derived`/`read_input_*` it called (without handling
            // the error) returned one: propagate it unchanged rather than
            // wrapping it, so e.g. a nested `EngineError::Cycle` reaches
            // the originating top-level query as `EngineError::Cycle`,
            // not laundered through a panic into `UserFunctionFailure`.
            Ok(Err(nested)) => return Err(nested),
            // The user function itself panicked.
            Err(payload) => {
                return Err(EngineError::UserFunctionFailure(
                    error::UserFunctionFailure {
                        name: std::any::type_name::<Q>(),
                        key: format!("{key:?}"),
                        live_call_stack: live_call_stack.unwrap_or_default(),
                        message: extract_panic_message(payload.as_ref()),
                    },
                ));
            }
        };

        let mut inner = self.inner.lock();
        let table = inner.ensure_derived_table::<Q>();

        // Step 6: early-exit compare.
        if let Some(previous) = &previous {
            if previous.value.indistinguishable(&value) {
                log::trace!(
                    "{}({:?}) recomputed to an indistinguishable value; retaining old value",
                    std::any::type_name::<Q>(),
                    key
                );
                table.entries.insert(
                    key,
                    DerivedEntry {
                        value: previous.value.clone(),
                        dependencies: deps,
                        changed_at: previous.changed_at,
                        verified_at: revision_now,
                    },
                );
                return Ok(Stamped {
                    value: previous.value.clone(),
                    changed_at: previous.changed_at,
                });
            }
        }

        // Step 7: install.
        log::debug!(
            "{}({:?}) recomputed at {}",
            std::any::type_name::<Q>(),
            key,
            revision_now
        );
        table.entries.insert(
            key,
            DerivedEntry {
                value: value.clone(),
                dependencies: deps,
                changed_at: revision_now,
                verified_at: revision_now,
            },
        );
        Ok(Stamped {
            value,
            changed_at: revision_now,
        })
    }

    fn dispatch_changed_at(&self, dep: &DependencyKey) -> Result<Revision, EngineError> {
        let erased = {
            let inner = self.inner.lock();
            inner.dispatch.get(&dep.query()).cloned()
        };
        let erased = erased.unwrap_or_else(|| {
            panic!(
                "dependency {:?} references a query family that was never registered",
                dep
            )
        });
        erased.changed_at(self, &dep.args)
    }
}

fn missing_input_error<I: InputQuery>(key: &I::Key) -> EngineError {
    if std::any::TypeId::of::<I::Key>() == std::any::TypeId::of::<()>() {
        EngineError::UninitializedInput {
            name: std::any::type_name::<I>(),
        }
    } else {
        EngineError::MissingInputKey {
            name: std::any::type_name::<I>(),
            key: format!("{key:?}"),
        }
    }
}
