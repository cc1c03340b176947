//! Error kinds surfaced by the substrate.
//!
//! Per-task failures are delivered through the failure branch of the task's
//! result future and never affect sibling tasks. Heap-limit and termination
//! failures additionally poison the isolate that produced them.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Clone, thiserror::Error)]
pub enum Error {
    /// The value has no transferable representation (functions, symbols,
    /// native objects outside the reference set).
    #[error("value is not transferable: {0}")]
    NotSerializable(String),

    /// Materializing the value would exceed the destination isolate's
    /// memory cap. The destination heap is left untouched.
    #[error("materialization of {needed} bytes would exceed the isolate memory limit of {limit} bytes")]
    HeapLimit { needed: usize, limit: usize },

    /// The target holder no longer owns a live environment.
    #[error("isolate is disposed")]
    IsolateDisposed,

    /// The task was aborted by cooperative termination mid-run.
    #[error("isolate execution was terminated")]
    Terminated,

    /// User JavaScript threw; carries a heap-independent copy of the error.
    #[error("script error: {0}")]
    ScriptError(ErrorCopy),

    /// Script execution exceeded its configured deadline. The isolate
    /// survives; only the offending task fails.
    #[error("script execution timed out after {0:?}")]
    Timeout(Duration),

    /// An OOM slipped past the guard or the engine violated an internal
    /// invariant. The isolate is destroyed but the process survives.
    #[error("fatal isolate failure: {0}")]
    Fatal(String),

    /// A context or script id was used against an isolate other than the
    /// one that minted it, or after it was released.
    #[error("invalid handle: {0}")]
    InvalidHandle(String),

    /// Host-side plumbing failure (channel closed, thread spawn failed).
    #[error("platform error: {0}")]
    Platform(String),
}

impl Error {
    pub(crate) fn not_serializable(what: impl Into<String>) -> Self {
        Error::NotSerializable(what.into())
    }

    pub(crate) fn platform(context: impl Into<String>) -> Self {
        Error::Platform(context.into())
    }

    pub(crate) fn invalid_handle(context: impl Into<String>) -> Self {
        Error::InvalidHandle(context.into())
    }

    pub(crate) fn fatal(context: impl Into<String>) -> Self {
        Error::Fatal(context.into())
    }

    /// Whether this failure poisons the isolate it came from.
    pub fn poisons_isolate(&self) -> bool {
        matches!(self, Error::HeapLimit { .. } | Error::Terminated | Error::Fatal(_))
    }

    /// The error copy attached to a script failure, if any.
    pub fn error_copy(&self) -> Option<&ErrorCopy> {
        match self {
            Error::ScriptError(copy) => Some(copy),
            _ => None,
        }
    }
}

/// The JavaScript error constructor a copied error round-trips through.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ErrorKind {
    RangeError,
    ReferenceError,
    SyntaxError,
    TypeError,
    Error,
}

impl ErrorKind {
    pub(crate) fn from_constructor_name(name: &str) -> Self {
        match name {
            "RangeError" => ErrorKind::RangeError,
            "ReferenceError" => ErrorKind::ReferenceError,
            "SyntaxError" => ErrorKind::SyntaxError,
            "TypeError" => ErrorKind::TypeError,
            _ => ErrorKind::Error,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            ErrorKind::RangeError => "RangeError",
            ErrorKind::ReferenceError => "ReferenceError",
            ErrorKind::SyntaxError => "SyntaxError",
            ErrorKind::TypeError => "TypeError",
            ErrorKind::Error => "Error",
        }
    }
}

/// Heap-independent copy of a thrown error: kind, message, and stack are
/// plain host strings shared by reference count, so one copy can fan out to
/// any number of destination isolates.
#[derive(Debug, Clone)]
pub struct ErrorCopy {
    pub kind: ErrorKind,
    pub message: Arc<str>,
    pub stack: Option<Arc<str>>,
}

impl ErrorCopy {
    pub fn new(kind: ErrorKind, message: impl Into<Arc<str>>) -> Self {
        Self {
            kind,
            message: message.into(),
            stack: None,
        }
    }

    /// Annotate the message with the script origin, `message [name:line:col]`.
    /// Decorating twice with the same origin is a no-op.
    pub fn decorate(&mut self, resource: &str, line: usize, column: usize) {
        let decorator = format!(" [{resource}:{line}:{column}]");
        if !self.message.ends_with(decorator.as_str()) {
            self.message = format!("{}{}", self.message, decorator).into();
        }
    }

    /// Host bytes held by this copy.
    pub fn size(&self) -> usize {
        self.message.len() + self.stack.as_deref().map_or(0, str::len)
    }
}

impl fmt::Display for ErrorCopy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.kind.name(), self.message)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_kind_from_constructor_name() {
        assert_eq!(ErrorKind::from_constructor_name("TypeError"), ErrorKind::TypeError);
        assert_eq!(ErrorKind::from_constructor_name("RangeError"), ErrorKind::RangeError);
        assert_eq!(ErrorKind::from_constructor_name("EvalError"), ErrorKind::Error);
        assert_eq!(ErrorKind::from_constructor_name(""), ErrorKind::Error);
    }

    #[test]
    fn test_decoration_is_idempotent() {
        let mut copy = ErrorCopy::new(ErrorKind::TypeError, "x is not a function");
        copy.decorate("worker.js", 3, 12);
        let once = copy.message.clone();
        copy.decorate("worker.js", 3, 12);
        assert_eq!(copy.message, once);
        assert!(copy.message.ends_with("[worker.js:3:12]"));
    }

    #[test]
    fn test_poisoning_classification() {
        assert!(Error::Terminated.poisons_isolate());
        assert!(Error::HeapLimit { needed: 1, limit: 0 }.poisons_isolate());
        assert!(!Error::IsolateDisposed.poisons_isolate());
        assert!(!Error::ScriptError(ErrorCopy::new(ErrorKind::Error, "x")).poisons_isolate());
        assert!(!Error::Timeout(Duration::from_millis(5)).poisons_isolate());
    }
}
