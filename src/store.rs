use std::any::Any;
use std::marker::PhantomData;
use std::sync::Arc;

use rustc_hash::FxHashMap;

use crate::error::EngineError;
use crate::key::{ArgumentTuple, DependencyKey, DerivedId, InputId, QueryId};
use crate::revision::Revision;
use crate::{Database, DerivedQuery, InputQuery};

type FxIndexSet<K> = indexmap::IndexSet<K, std::hash::BuildHasherDefault<rustc_hash::FxHasher>>;
type FxIndexMap<K, V> = indexmap::IndexMap<K, V, std::hash::BuildHasherDefault<rustc_hash::FxHasher>>;

/// `InputEntry` (§3): created or overwritten only by the input write path.
#[derive(Clone)]
pub(crate) struct InputEntry<V> {
    pub(crate) value: V,
    pub(crate) changed_at: Revision,
}

/// `DerivedEntry` (§3). `changed_at <= verified_at` is maintained by every
/// write site in `engine.rs`, never by this type itself.
#[derive(Clone)]
pub(crate) struct DerivedEntry<V> {
    pub(crate) value: V,
    pub(crate) dependencies: FxIndexSet<DependencyKey>,
    pub(crate) changed_at: Revision,
    pub(crate) verified_at: Revision,
}

pub(crate) struct InputTable<K, V> {
    pub(crate) entries: FxHashMap<K, InputEntry<V>>,
}

impl<K, V> Default for InputTable<K, V> {
    fn default() -> Self {
        InputTable {
            entries: FxHashMap::default(),
        }
    }
}

pub(crate) struct DerivedTable<K, V> {
    /// `IndexMap` so `cached_keys` (§6 introspection) enumerates in a
    /// deterministic, insertion-stable order.
    pub(crate) entries: FxIndexMap<K, DerivedEntry<V>>,
}

impl<K, V> Default for DerivedTable<K, V> {
    fn default() -> Self {
        DerivedTable {
            entries: FxIndexMap::default(),
        }
    }
}

/// The narrow, type-erased interface the validity walk needs from a
/// dependency without knowing its concrete `Key`/`Value` types (§9,
/// "Map-of-maps heterogeneity").
pub(crate) trait ErasedQuery: Send + Sync {
    fn changed_at(&self, db: &Database, args: &ArgumentTuple) -> Result<Revision, EngineError>;
}

pub(crate) struct InputAdapter<I>(PhantomData<fn() -> I>);

impl<I> Default for InputAdapter<I> {
    fn default() -> Self {
        InputAdapter(PhantomData)
    }
}

// `PhantomData<fn() -> I>` is `Send + Sync` unconditionally (function
// pointers don't borrow or own their type parameters), so these adapters
// are `Send + Sync` via ordinary auto-trait derivation with no unsafe code.
impl<I: InputQuery> ErasedQuery for InputAdapter<I> {
    fn changed_at(&self, db: &Database, args: &ArgumentTuple) -> Result<Revision, EngineError> {
        let key = args
            .downcast_ref::<I::Key>()
            .expect("ArgumentTuple type mismatch for InputAdapter");
        db.input_changed_at::<I>(key)
    }
}

pub(crate) struct DerivedAdapter<Q>(PhantomData<fn() -> Q>);

impl<Q> Default for DerivedAdapter<Q> {
    fn default() -> Self {
        DerivedAdapter(PhantomData)
    }
}

impl<Q: DerivedQuery> ErasedQuery for DerivedAdapter<Q> {
    fn changed_at(&self, db: &Database, args: &ArgumentTuple) -> Result<Revision, EngineError> {
        let key = args
            .downcast_ref::<Q::Key>()
            .expect("ArgumentTuple type mismatch for DerivedAdapter")
            .clone();
        Ok(db.memoized_lookup::<Q>(key)?.changed_at)
    }
}

/// Everything protected by the Cache Store's single lock (§4.2): the
/// Revision Clock, the active-computation guard count, the dispatch
/// registry, and both families of typed tables (erased behind `Box<dyn
/// Any>` and recovered at each call site, which always knows the concrete
/// `I`/`Q`).
#[derive(Default)]
pub(crate) struct Inner {
    pub(crate) revision: Revision,
    pub(crate) active_count: usize,
    pub(crate) dispatch: FxHashMap<QueryId, Arc<dyn ErasedQuery>>,
    pub(crate) inputs: FxHashMap<InputId, Box<dyn Any + Send + Sync>>,
    pub(crate) derived: FxHashMap<DerivedId, Box<dyn Any + Send + Sync>>,
}

impl Inner {
    pub(crate) fn require_quiescent(&self) {
        if self.active_count != 0 {
            panic!(
                "input mutation attempted while {} derived computation(s) are active; \
                 inputs cannot be written or deleted from within a derived function",
                self.active_count
            );
        }
    }

    pub(crate) fn ensure_input_table<I: InputQuery>(&mut self) -> &mut InputTable<I::Key, I::Value> {
        let id = InputId::of::<I>();
        self.dispatch
            .entry(QueryId::Input(id))
            .or_insert_with(|| Arc::new(InputAdapter::<I>::default()) as Arc<dyn ErasedQuery>);
        self.inputs
            .entry(id)
            .or_insert_with(|| Box::new(InputTable::<I::Key, I::Value>::default()))
            .downcast_mut::<InputTable<I::Key, I::Value>>()
            .expect("input table type mismatch for registered InputId")
    }

    pub(crate) fn ensure_derived_table<Q: DerivedQuery>(
        &mut self,
    ) -> &mut DerivedTable<Q::Key, Q::Value> {
        let id = DerivedId::of::<Q>();
        self.dispatch
            .entry(QueryId::Derived(id))
            .or_insert_with(|| Arc::new(DerivedAdapter::<Q>::default()) as Arc<dyn ErasedQuery>);
        self.derived
            .entry(id)
            .or_insert_with(|| Box::new(DerivedTable::<Q::Key, Q::Value>::default()))
            .downcast_mut::<DerivedTable<Q::Key, Q::Value>>()
            .expect("derived table type mismatch for registered DerivedId")
    }
}
