//! Error taxonomy: native-side `Error` and the host-facing `HostError`.
//!
//! Native code propagates `Error` with `?`. Whenever control crosses back into
//! the host (factory creation, method or accessor invocation, host function
//! calls) the failure is converted into a `HostError`, which carries a
//! snapshot of the native call stack.

use std::any::Any;
use std::backtrace::Backtrace;
use std::fmt;

/// Banner separating the host-visible message from the native stack snapshot.
pub const NATIVE_STACK_BANNER: &str = "==== Native Stack ====";

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    NotInitialized,
    AlreadyDestroyed,
    AlreadyClosed,
    Initialization,
    TypeMismatch,
    Unknown,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::NotInitialized => "NotInitialized",
            ErrorKind::AlreadyDestroyed => "AlreadyDestroyed",
            ErrorKind::AlreadyClosed => "AlreadyClosed",
            ErrorKind::Initialization => "InitializationError",
            ErrorKind::TypeMismatch => "TypeMismatch",
            ErrorKind::Unknown => "Unknown",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// No per-context state exists for the named subsystem.
    #[error("{0} not initialized for this context")]
    NotInitialized(&'static str),

    /// The wrapped native handle was released by `destroy`.
    #[error("{0} object already destroyed")]
    AlreadyDestroyed(&'static str),

    #[error("stream already closed")]
    AlreadyClosed,

    #[error("cannot initialize {what}: {reason}")]
    Initialization { what: String, reason: String },

    #[error("{0}")]
    TypeMismatch(String),

    #[error("{0}")]
    Unknown(String),
}

impl Error {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::NotInitialized(_) => ErrorKind::NotInitialized,
            Error::AlreadyDestroyed(_) => ErrorKind::AlreadyDestroyed,
            Error::AlreadyClosed => ErrorKind::AlreadyClosed,
            Error::Initialization { .. } => ErrorKind::Initialization,
            Error::TypeMismatch(_) => ErrorKind::TypeMismatch,
            Error::Unknown(_) => ErrorKind::Unknown,
        }
    }

    pub fn initialization(what: impl Into<String>, reason: impl Into<String>) -> Self {
        Error::Initialization {
            what: what.into(),
            reason: reason.into(),
        }
    }

    pub fn type_mismatch(message: impl Into<String>) -> Self {
        Error::TypeMismatch(message.into())
    }
}

// =============================================================================
// HostError: what the host sees
// =============================================================================

/// A native failure converted for the host, with the native stack attached.
#[derive(Debug, Clone, thiserror::Error)]
#[error("{kind}: {message}")]
pub struct HostError {
    kind: ErrorKind,
    message: String,
    native_stack: String,
}

impl HostError {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            native_stack: Backtrace::force_capture().to_string(),
        }
    }

    /// Convert a caught panic payload. `&str` and `String` payloads keep
    /// their text; anything else becomes a generic message.
    pub fn from_panic(payload: Box<dyn Any + Send>) -> Self {
        let message = if let Some(s) = payload.downcast_ref::<&str>() {
            (*s).to_string()
        } else if let Some(s) = payload.downcast_ref::<String>() {
            s.clone()
        } else {
            "native code panicked".to_string()
        };
        Self::new(ErrorKind::Unknown, message)
    }

    pub fn kind(&self) -> ErrorKind {
        self.kind
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    pub fn native_stack(&self) -> &str {
        &self.native_stack
    }

    /// Full host-visible description: the message followed by the native stack.
    pub fn description(&self) -> String {
        format!("{self}\n\n{NATIVE_STACK_BANNER}\n{}", self.native_stack)
    }
}

impl From<Error> for HostError {
    fn from(err: Error) -> Self {
        HostError::new(err.kind(), err.to_string())
    }
}
