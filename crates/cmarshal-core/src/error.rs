//! Error types for the cmarshal core library
//!
//! Every failure is detected before or immediately after crossing the native
//! boundary and is returned to the immediate caller. Nothing here is retried
//! or logged-and-continued; marshaling is deterministic, so a retry cannot
//! change the outcome.
//!
//! A fault raised by native code during a call (segmentation violation,
//! `abort()`) is not represented here. No in-process technique can recover
//! from it; hosts that need resilience against misbehaving libraries should
//! run those calls in a disposable child process.

use thiserror::Error;

/// Main error type for cmarshal operations
#[derive(Error, Debug)]
pub enum Error {
    /// A layout with this name is already registered
    #[error("Layout '{name}' is already registered")]
    DuplicateLayout { name: String },

    /// A field declaration was rejected while defining a layout
    #[error("Invalid field '{field}' in layout '{layout}': {reason}")]
    InvalidField {
        layout: String,
        field: String,
        reason: String,
    },

    /// Lookup of a layout that was never registered
    #[error("Unknown layout '{name}'")]
    UnknownLayout { name: String },

    /// Lookup of a field the layout does not declare
    #[error("Layout '{layout}' has no field named '{field}'")]
    UnknownField { layout: String, field: String },

    /// The native library could not be opened
    #[error("Failed to load library '{library}': {message}")]
    LibraryLoad {
        library: String,
        message: String,
        #[source]
        source: Option<libloading::Error>,
    },

    /// The symbol is absent from the library
    #[error("Symbol '{symbol}' not found in '{library}'")]
    SymbolNotFound {
        symbol: String,
        library: String,
        #[source]
        source: Option<libloading::Error>,
    },

    /// The loader reported success but handed back address zero
    #[error("Symbol '{symbol}' in '{library}' resolved to a null function pointer")]
    NullFunctionPointer { symbol: String, library: String },

    /// A bound function was called with the wrong number of arguments
    #[error("Function '{function}' expects {expected} argument(s), got {actual}")]
    ArityMismatch {
        function: String,
        expected: usize,
        actual: usize,
    },

    /// A host value cannot be converted to the declared native kind
    #[error("Type mismatch for {target}: expected {expected}, got {actual}")]
    TypeMismatch {
        target: String,
        expected: String,
        actual: String,
    },

    /// A pointer slot inside the declared length of a pointer array is null
    #[error("Null element at index {index} of '{field}' (declared length {len})")]
    NullElement {
        field: String,
        index: usize,
        len: usize,
    },

    /// Element access past the declared length of a pointer array
    #[error("Index {index} out of bounds for '{field}' (length {len})")]
    OutOfBounds {
        field: String,
        index: usize,
        len: usize,
    },

    /// libffi refused to prepare a call interface for the signature
    #[error("Cannot prepare call interface for '{function}' (libffi status {status})")]
    CallInterface { function: String, status: u32 },

    /// A declaration document or signature string is malformed
    #[error("Invalid declaration: {message}")]
    Declaration { message: String },

    /// The background worker serving a bound function has stopped
    #[error("Background worker for '{function}' is no longer running")]
    Worker { function: String },

    /// IO errors
    #[error("IO error: {message}")]
    Io {
        message: String,
        #[source]
        source: std::io::Error,
    },

    /// JSON parsing errors
    #[error("JSON error: {message}")]
    Json {
        message: String,
        #[source]
        source: serde_json::Error,
    },

    /// YAML parsing errors
    #[error("YAML error: {message}")]
    Yaml {
        message: String,
        #[source]
        source: serde_yaml::Error,
    },
}

/// Convenience type alias for Results using our Error type
pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    /// Build an [`Error::InvalidField`]
    pub fn invalid_field(
        layout: impl Into<String>,
        field: impl Into<String>,
        reason: impl Into<String>,
    ) -> Self {
        Error::InvalidField {
            layout: layout.into(),
            field: field.into(),
            reason: reason.into(),
        }
    }

    /// Build an [`Error::TypeMismatch`]
    pub fn type_mismatch(
        target: impl Into<String>,
        expected: impl Into<String>,
        actual: impl Into<String>,
    ) -> Self {
        Error::TypeMismatch {
            target: target.into(),
            expected: expected.into(),
            actual: actual.into(),
        }
    }

    /// Build an [`Error::Declaration`]
    pub fn declaration(message: impl Into<String>) -> Self {
        Error::Declaration {
            message: message.into(),
        }
    }

    /// True for errors raised by the argument guard, i.e. before any native
    /// code was entered
    pub fn is_pre_call(&self) -> bool {
        matches!(self, Error::ArityMismatch { .. } | Error::TypeMismatch { .. })
    }
}

// Conversion implementations
impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Error::Json {
            message: err.to_string(),
            source: err,
        }
    }
}

impl From<serde_yaml::Error> for Error {
    fn from(err: serde_yaml::Error) -> Self {
        Error::Yaml {
            message: err.to_string(),
            source: err,
        }
    }
}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        Error::Io {
            message: err.to_string(),
            source: err,
        }
    }
}
