use std::error::Error as StdError;
use std::fmt;

use crate::key::DependencyKey;

/// Everything that can go wrong from inside `call_derived`/`read_input_*`.
///
/// `InputMutationDuringComputation` (§7) is *not* a variant here: it is a
/// fatal assertion and surfaces as a `panic!`, not a `Result`.
#[derive(Debug)]
pub enum EngineError {
    /// A scalar input was read before it was ever written.
    UninitializedInput { name: &'static str },
    /// A map input was read with a key that has no entry.
    MissingInputKey { name: &'static str, key: String },
    /// A derived function re-entered a key already on the live-call stack.
    Cycle(CycleError),
    /// A user-supplied derived function panicked while computing.
    UserFunctionFailure(UserFunctionFailure),
}

impl fmt::Display for EngineError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EngineError::UninitializedInput { name } => {
                write!(f, "input `{name}` was read before it was ever set")
            }
            EngineError::MissingInputKey { name, key } => {
                write!(f, "input `{name}` has no entry for key `{key}`")
            }
            EngineError::Cycle(err) => fmt::Display::fmt(err, f),
            EngineError::UserFunctionFailure(err) => fmt::Display::fmt(err, f),
        }
    }
}

impl StdError for EngineError {
    fn source(&self) -> Option<&(dyn StdError + 'static)> {
        None
    }
}

impl From<CycleError> for EngineError {
    fn from(err: CycleError) -> Self {
        EngineError::Cycle(err)
    }
}

/// Raised when `enter_frame` observes that the key about to be computed is
/// already on the live-call stack.
#[derive(Debug, Clone)]
pub struct CycleError {
    pub(crate) cycle: Vec<DependencyKey>,
}

impl CycleError {
    /// The chain of keys from the re-entered key to the recursive call that
    /// closed the cycle.
    pub fn live_call_stack(&self) -> &[DependencyKey] {
        &self.cycle
    }
}

impl fmt::Display for CycleError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "cycle detected: ")?;
        for (i, key) in self.cycle.iter().enumerate() {
            if i > 0 {
                write!(f, " -> ")?;
            }
            write!(f, "{key:?}")?;
        }
        Ok(())
    }
}

/// Raised when a user-supplied derived function panics during recompute.
/// Carries the live-call stack captured at the moment the panic was caught.
#[derive(Debug, Clone)]
pub struct UserFunctionFailure {
    pub(crate) name: &'static str,
    pub(crate) key: String,
    pub(crate) live_call_stack: Vec<DependencyKey>,
    pub(crate) message: String,
}

impl UserFunctionFailure {
    /// The keys on the call stack at the moment the panic was caught, most
    /// recent last.
    pub fn live_call_stack(&self) -> &[DependencyKey] {
        &self.live_call_stack
    }

    /// A best-effort extraction of the panic payload's message.
    pub fn message(&self) -> &str {
        &self.message
    }
}

impl fmt::Display for UserFunctionFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "derived function `{}({})` panicked: {}",
            self.name, self.key, self.message
        )?;
        if !self.live_call_stack.is_empty() {
            write!(f, " (live call stack: ")?;
            for (i, key) in self.live_call_stack.iter().enumerate() {
                if i > 0 {
                    write!(f, " -> ")?;
                }
                write!(f, "{key:?}")?;
            }
            write!(f, ")")?;
        }
        Ok(())
    }
}

pub(crate) fn extract_panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}
