use std::any::{Any, TypeId};
use std::cmp::Ordering;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::sync::Arc;

use crate::{DerivedQuery, InputQuery};

/// A type-erased, hashable, comparable query argument.
///
/// Every `InputQuery`/`DerivedQuery`'s `Key` type is required to implement
/// this (via the blanket impl below) so it can live inside a
/// [`DependencyKey`] without the trace recorder or cache store ever needing
/// to know the concrete key type.
pub(crate) trait AnyKey: Any + Send + Sync {
    fn as_any(&self) -> &dyn Any;
    fn dyn_eq(&self, other: &dyn AnyKey) -> bool;
    fn dyn_hash(&self, state: &mut dyn Hasher);
    fn dyn_debug(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result;
    fn dyn_cmp_key(&self) -> String;
}

impl<T> AnyKey for T
where
    T: Any + Eq + Hash + fmt::Debug + Send + Sync,
{
    fn as_any(&self) -> &dyn Any {
        self
    }

    fn dyn_eq(&self, other: &dyn AnyKey) -> bool {
        match other.as_any().downcast_ref::<T>() {
            Some(other) => self == other,
            None => false,
        }
    }

    fn dyn_hash(&self, mut state: &mut dyn Hasher) {
        TypeId::of::<T>().hash(&mut state);
        self.hash(&mut state);
    }

    fn dyn_debug(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }

    fn dyn_cmp_key(&self) -> String {
        format!("{:?}", self)
    }
}

/// A type-erased argument tuple. In this engine every query takes exactly
/// zero or one argument (a scalar input's key is `()`, a map input's or a
/// derived function's key is whatever `Key` type the client declared), so
/// "tuple" here just means "the one argument value, erased."
#[derive(Clone)]
pub struct ArgumentTuple(Arc<dyn AnyKey>);

impl ArgumentTuple {
    pub(crate) fn new<T>(value: T) -> Self
    where
        T: Any + Eq + Hash + fmt::Debug + Send + Sync,
    {
        ArgumentTuple(Arc::new(value))
    }

    pub(crate) fn downcast_ref<T: Any>(&self) -> Option<&T> {
        self.0.as_any().downcast_ref::<T>()
    }
}

impl PartialEq for ArgumentTuple {
    fn eq(&self, other: &Self) -> bool {
        self.0.dyn_eq(other.0.as_ref())
    }
}
impl Eq for ArgumentTuple {}

impl Hash for ArgumentTuple {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.0.dyn_hash(state);
    }
}

/// Ordered only for deterministic diagnostics (§3): the `Debug` rendering
/// of the erased value is not a semantic ordering, just a stable one.
impl PartialOrd for ArgumentTuple {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for ArgumentTuple {
    fn cmp(&self, other: &Self) -> Ordering {
        self.0.dyn_cmp_key().cmp(&other.0.dyn_cmp_key())
    }
}

impl fmt::Debug for ArgumentTuple {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.dyn_debug(f)
    }
}

/// Identifies one registered input family (a keyed table, or a single
/// scalar slot when `Key = ()`).
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct InputId {
    type_id: TypeId,
    name: &'static str,
}

impl InputId {
    pub(crate) fn of<I: InputQuery>() -> Self {
        InputId {
            type_id: TypeId::of::<I>(),
            name: std::any::type_name::<I>(),
        }
    }

    /// The family's human-readable name, from `std::any::type_name`.
    pub fn name(&self) -> &'static str {
        self.name
    }
}

impl fmt::Debug for InputId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "InputId({})", self.name)
    }
}

/// Ordered only for deterministic diagnostics (§3). `TypeId` itself has no
/// `Ord` impl, so ties on `name` (rare: distinct marker types sharing a
/// `type_name`, e.g. identically-named types in different generic
/// instantiations) fall back to comparing the `TypeId`'s `Debug` output,
/// which is stable within a single process run.
impl PartialOrd for InputId {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for InputId {
    fn cmp(&self, other: &Self) -> Ordering {
        self.name
            .cmp(other.name)
            .then_with(|| format!("{:?}", self.type_id).cmp(&format!("{:?}", other.type_id)))
    }
}

/// Identifies one registered derived function, parameterized implicitly by
/// its argument-type signature (two derived functions named identically but
/// declared on distinct marker types are distinct `DerivedId`s, since the
/// `TypeId` differs).
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct DerivedId {
    type_id: TypeId,
    name: &'static str,
}

impl DerivedId {
    pub(crate) fn of<Q: DerivedQuery>() -> Self {
        DerivedId {
            type_id: TypeId::of::<Q>(),
            name: std::any::type_name::<Q>(),
        }
    }

    /// The function's human-readable name, from `std::any::type_name`.
    pub fn name(&self) -> &'static str {
        self.name
    }
}

impl fmt::Debug for DerivedId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "DerivedId({})", self.name)
    }
}

/// Ordered only for deterministic diagnostics (§3); see `InputId`'s `Ord`
/// impl for why the `TypeId` tiebreak goes through `Debug`.
impl PartialOrd for DerivedId {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for DerivedId {
    fn cmp(&self, other: &Self) -> Ordering {
        self.name
            .cmp(other.name)
            .then_with(|| format!("{:?}", self.type_id).cmp(&format!("{:?}", other.type_id)))
    }
}

/// Distinguishes an input family from a derived function at the identity
/// level, without losing either's erased `TypeId`.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub enum QueryId {
    /// Identifies an input family.
    Input(InputId),
    /// Identifies a derived function.
    Derived(DerivedId),
}

impl QueryId {
    /// The name of the underlying `InputId`/`DerivedId`.
    pub fn name(&self) -> &'static str {
        match self {
            QueryId::Input(id) => id.name(),
            QueryId::Derived(id) => id.name(),
        }
    }
}

/// Ordered only for deterministic diagnostics (§3): inputs sort before
/// derived functions, then by the wrapped id.
impl PartialOrd for QueryId {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for QueryId {
    fn cmp(&self, other: &Self) -> Ordering {
        match (self, other) {
            (QueryId::Input(a), QueryId::Input(b)) => a.cmp(b),
            (QueryId::Derived(a), QueryId::Derived(b)) => a.cmp(b),
            (QueryId::Input(_), QueryId::Derived(_)) => Ordering::Less,
            (QueryId::Derived(_), QueryId::Input(_)) => Ordering::Greater,
        }
    }
}

/// The canonical `(QueryId, ArgumentTuple)` pair: the sole handle used
/// inside dependency lists.
#[derive(Clone, PartialEq, Eq, Hash)]
pub struct DependencyKey {
    pub(crate) query: QueryId,
    pub(crate) args: ArgumentTuple,
}

impl DependencyKey {
    pub(crate) fn input<I: InputQuery>(key: I::Key) -> Self {
        DependencyKey {
            query: QueryId::Input(InputId::of::<I>()),
            args: ArgumentTuple::new(key),
        }
    }

    pub(crate) fn derived<Q: DerivedQuery>(key: Q::Key) -> Self {
        DependencyKey {
            query: QueryId::Derived(DerivedId::of::<Q>()),
            args: ArgumentTuple::new(key),
        }
    }

    /// The `QueryId` half of this key, without the argument.
    pub fn query(&self) -> QueryId {
        self.query
    }
}

/// Ordered only for deterministic diagnostics (§3): by `QueryId` first,
/// then by the erased argument's `Debug` rendering.
impl PartialOrd for DependencyKey {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for DependencyKey {
    fn cmp(&self, other: &Self) -> Ordering {
        self.query
            .cmp(&other.query)
            .then_with(|| self.args.cmp(&other.args))
    }
}

impl fmt::Debug for DependencyKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}({:?})", self.query.name(), self.args)
    }
}
