//! Error types and handling for the CLI
//!
//! Every error maps to a distinct process exit code so scripts driving the
//! smoke test can tell a missing symbol from a bad argument.

use std::io;
use std::path::PathBuf;

/// Result type alias for CLI operations
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for CLI operations
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// IO error (file operations, etc.)
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    /// Error from cmarshal-core
    #[error("{0}")]
    Core(#[from] cmarshal_core::Error),

    /// File not found
    #[error("File not found: {}", path.display())]
    FileNotFound { path: PathBuf },

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Invalid argument combination or unparsable literal
    #[error("Invalid arguments: {0}")]
    InvalidArgs(String),

    /// No declarations file on the command line or in the config
    #[error("No declarations file given and none configured (set `declarations` in the config)")]
    NoDeclarations,

    /// One or more smoke checks failed
    #[error("{failed} of {total} smoke check(s) failed")]
    SmokeFailed { failed: usize, total: usize },

    /// JSON serialization/deserialization error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// YAML serialization/deserialization error
    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),
}

impl Error {
    /// Create a configuration error
    pub fn config(message: impl Into<String>) -> Self {
        Self::Config(message.into())
    }

    /// Create an invalid arguments error
    pub fn invalid_args(message: impl Into<String>) -> Self {
        Self::InvalidArgs(message.into())
    }

    /// Get the exit code for this error
    pub fn exit_code(&self) -> i32 {
        match self {
            Self::Io(_) => 1,
            Self::Core(core) => core_exit_code(core),
            Self::FileNotFound { .. } => 3,
            Self::Config(_) => 5,
            Self::InvalidArgs(_) => 6,
            Self::NoDeclarations => 7,
            Self::SmokeFailed { .. } => 8,
            Self::Json(_) => 12,
            Self::Yaml(_) => 13,
        }
    }

    /// Check if this error should display usage help
    pub fn should_show_help(&self) -> bool {
        matches!(self, Self::InvalidArgs(_) | Self::NoDeclarations)
    }
}

/// Binding failures get their own codes; everything else from the core is 2.
fn core_exit_code(error: &cmarshal_core::Error) -> i32 {
    use cmarshal_core::Error as Core;
    match error {
        Core::LibraryLoad { .. } => 20,
        Core::SymbolNotFound { .. } | Core::NullFunctionPointer { .. } => 21,
        Core::ArityMismatch { .. } | Core::TypeMismatch { .. } => 22,
        Core::Declaration { .. }
        | Core::DuplicateLayout { .. }
        | Core::InvalidField { .. }
        | Core::UnknownLayout { .. } => 23,
        _ => 2,
    }
}

/// Format an error for display to the user
pub fn format_error(error: &Error, use_color: bool) -> String {
    if use_color {
        use colored::Colorize;
        format!("{} {}", "Error:".red().bold(), error)
    } else {
        format!("Error: {}", error)
    }
}
