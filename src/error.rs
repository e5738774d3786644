//! Error types for Rollout.
//!
//! This module defines the error types used throughout Rollout, providing
//! rich error information for debugging and user feedback. Errors raised
//! inside a host pipeline are never propagated across hosts; the deployment
//! engine converts them into terminal task states (see the engine module).

use std::path::PathBuf;
use thiserror::Error;

/// Result type alias for Rollout operations.
pub type Result<T> = std::result::Result<T, Error>;

/// The main error type for Rollout.
#[derive(Error, Debug)]
pub enum Error {
    // ========================================================================
    // Configuration Errors
    // ========================================================================
    /// Error reading or parsing the deployment configuration file.
    #[error("Failed to load configuration '{path}': {message}")]
    ConfigLoad {
        /// Path to the configuration file
        path: PathBuf,
        /// Error message
        message: String,
    },

    /// The configuration parsed but failed validation.
    ///
    /// Carries every validation problem found so the operator can fix them
    /// all in one pass.
    #[error("Invalid configuration:\n{}", .0.join("\n"))]
    ConfigInvalid(Vec<String>),

    // ========================================================================
    // Host Execution Errors
    // ========================================================================
    /// The host could not be reached or authentication failed.
    #[error("Host '{host}' unreachable: {message}")]
    Unreachable {
        /// Target host
        host: String,
        /// Error message
        message: String,
    },

    /// The runner binary could not be found or spawned.
    #[error("Runner unavailable: {0}")]
    RunnerUnavailable(String),

    /// A remote operation exceeded its deadline.
    #[error("Operation timed out on '{host}' after {timeout_secs} seconds")]
    Timeout {
        /// Target host
        host: String,
        /// Timeout in seconds
        timeout_secs: u64,
    },

    // ========================================================================
    // Installer Errors
    // ========================================================================
    /// No installer is registered for the requested package.
    #[error("No installer for package '{0}'")]
    InstallerNotFound(String),

    /// The installer does not support the requested version.
    #[error("Installer '{installer}' does not support version '{version}'")]
    UnsupportedVersion {
        /// Installer name
        installer: String,
        /// Requested version
        version: String,
    },

    /// An installer lifecycle phase failed.
    #[error("Install of '{package}' failed on '{host}': {message}")]
    InstallFailed {
        /// Package name
        package: String,
        /// Target host
        host: String,
        /// Failure detail
        message: String,
    },

    // ========================================================================
    // Run Control
    // ========================================================================
    /// The run was cancelled cooperatively.
    #[error("Cancelled")]
    Cancelled,

    /// Unexpected programming error caught at a worker boundary.
    #[error("Internal error: {0}")]
    Internal(String),

    // ========================================================================
    // IO / Serialization
    // ========================================================================
    /// IO error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// YAML parsing error.
    #[error("YAML parse error: {0}")]
    YamlParse(#[from] serde_yaml::Error),

    /// JSON parsing error.
    #[error("JSON parse error: {0}")]
    JsonParse(#[from] serde_json::Error),
}

impl Error {
    /// Creates a new unreachable-host error.
    pub fn unreachable(host: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Unreachable {
            host: host.into(),
            message: message.into(),
        }
    }

    /// Creates a new install-failed error.
    pub fn install_failed(
        package: impl Into<String>,
        host: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self::InstallFailed {
            package: package.into(),
            host: host.into(),
            message: message.into(),
        }
    }

    /// Returns true if this error represents cooperative cancellation.
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Error::Cancelled)
    }

    /// Returns true if this error means the host could not be contacted.
    pub fn is_unreachable(&self) -> bool {
        matches!(self, Error::Unreachable { .. })
    }

    /// The short reason string recorded on a failed task.
    pub fn task_reason(&self) -> String {
        match self {
            Error::Unreachable { message, .. } => format!("unreachable: {message}"),
            Error::Timeout { .. } => "timeout".to_string(),
            Error::Cancelled => "cancelled".to_string(),
            Error::Internal(msg) => format!("internal error: {msg}"),
            other => other.to_string(),
        }
    }
}
