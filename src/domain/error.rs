//! Domain-level error types for the installer.
//!
//! All errors are typed with `thiserror` and carry enough context to print
//! a human-readable diagnostic before the process exits non-zero.

use thiserror::Error;

/// Installer errors. Every variant is fatal to the current run.
#[derive(Error, Debug)]
pub enum AppError {
    /// Elevated access was requested and denied.
    #[error("Permission denied: {message}")]
    Permission { message: String },

    /// A named dependency could not be satisfied.
    #[error("Failed to provision dependency '{dependency}': {message}")]
    Provision {
        dependency: String,
        message: String,
        #[source]
        source: Option<Box<AppError>>,
    },

    /// The managed process did not reach an active state in time.
    #[error("Service {unit} failed to start: {diagnostic}")]
    StartFailure { unit: String, diagnostic: String },

    /// The service is still discoverable after uninstall.
    #[error("Service {unit} is still present after uninstall. {remedy}")]
    VerificationMismatch { unit: String, remedy: String },

    /// A mandatory host capability is missing.
    #[error("Required capability not available: {capability}")]
    MissingCapability { capability: String },

    /// An external command could not be run or exited unsuccessfully.
    #[error("Command '{program}' failed: {message}")]
    Command {
        program: String,
        message: String,
        #[source]
        source: Option<std::io::Error>,
    },

    /// Configuration or environment error.
    #[error("Configuration error: {message}")]
    Config { message: String },

    /// IO operation failed.
    #[error("IO error: {message}")]
    Io {
        message: String,
        #[source]
        source: Option<std::io::Error>,
    },
}

impl AppError {
    /// Create an IO error with context.
    pub fn io(message: impl Into<String>, err: std::io::Error) -> Self {
        Self::Io {
            message: message.into(),
            source: Some(err),
        }
    }

    /// Create a command error for a program that exited unsuccessfully.
    pub fn command(program: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Command {
            program: program.into(),
            message: message.into(),
            source: None,
        }
    }

    /// Wrap a cause into a provisioning error for `dependency`.
    pub fn provision(dependency: impl Into<String>, cause: Self) -> Self {
        Self::Provision {
            dependency: dependency.into(),
            message: cause.to_string(),
            source: Some(Box::new(cause)),
        }
    }

    /// Process exit code for this error.
    #[must_use]
    pub const fn exit_code(&self) -> i32 {
        1
    }
}

/// Result type alias using `AppError`.
pub type Result<T> = std::result::Result<T, AppError>;
