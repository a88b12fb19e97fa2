//! Error types for kubehost
//!
//! Errors carry the host and namespace they concern where one is known, so
//! that the plugin framework driving us can report them without extra context.
//! The four categories callers care about are kept apart: configuration
//! problems, Kubernetes API failures, a missing Pod, and an expired wait.

use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

/// Default context value when no specific context is available
pub const UNKNOWN_CONTEXT: &str = "unknown";

/// Main error type for kubehost operations
#[derive(Debug, Error)]
pub enum Error {
    /// Kubernetes API error, passed through unchanged
    #[error("kubernetes error: {source}")]
    Kube {
        /// The underlying kube-rs error
        #[from]
        source: kube::Error,
    },

    /// Local configuration could not be loaded or is invalid
    #[error("configuration error: {message}")]
    Config {
        /// Description of what's wrong
        message: String,
        /// The file involved, if any
        path: Option<PathBuf>,
    },

    /// The host's Pod does not exist
    #[error("{kind} {namespace}/{name} not found")]
    NotFound {
        /// Resource kind that was looked up
        kind: String,
        /// Namespace the lookup ran in
        namespace: String,
        /// Name of the missing resource
        name: String,
    },

    /// Waiting for the host to report an address exceeded its bound
    #[error("timed out after {timeout:?} waiting for IP of {namespace}/{name}")]
    Timeout {
        /// Namespace of the host
        namespace: String,
        /// Name of the host
        name: String,
        /// The bound that elapsed
        timeout: Duration,
    },

    /// Serialization/deserialization error
    #[error("serialization error: {message}")]
    Serialization {
        /// Description of what failed
        message: String,
    },

    /// An external command (e.g. ssh-keygen) failed
    #[error("command `{command}` failed: {message}")]
    Command {
        /// The program that was run
        command: String,
        /// Captured stderr or spawn failure
        message: String,
    },

    /// Internal/operational error
    #[error("internal error [{context}]: {message}")]
    Internal {
        /// Description of what failed
        message: String,
        /// Context where the error occurred
        context: String,
    },
}

impl Error {
    /// Create a configuration error with the given message
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config {
            message: msg.into(),
            path: None,
        }
    }

    /// Create a configuration error about a specific file
    pub fn config_for_path(path: impl Into<PathBuf>, msg: impl Into<String>) -> Self {
        Self::Config {
            message: msg.into(),
            path: Some(path.into()),
        }
    }

    /// Create a not-found error for a namespaced resource
    pub fn not_found(
        kind: impl Into<String>,
        namespace: impl Into<String>,
        name: impl Into<String>,
    ) -> Self {
        Self::NotFound {
            kind: kind.into(),
            namespace: namespace.into(),
            name: name.into(),
        }
    }

    /// Create a timeout error for an address wait
    pub fn timeout(namespace: impl Into<String>, name: impl Into<String>, timeout: Duration) -> Self {
        Self::Timeout {
            namespace: namespace.into(),
            name: name.into(),
            timeout,
        }
    }

    /// Create a serialization error with the given message
    pub fn serialization(msg: impl Into<String>) -> Self {
        Self::Serialization {
            message: msg.into(),
        }
    }

    /// Create a command error
    pub fn command(command: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Command {
            command: command.into(),
            message: msg.into(),
        }
    }

    /// Create an internal error with the given message
    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal {
            message: msg.into(),
            context: UNKNOWN_CONTEXT.to_string(),
        }
    }

    /// Create an internal error with context
    pub fn internal_with_context(context: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Internal {
            message: msg.into(),
            context: context.into(),
        }
    }

    /// Whether this error means "the host's objects do not exist"
    pub fn is_not_found(&self) -> bool {
        match self {
            Error::NotFound { .. } => true,
            Error::Kube { source } => is_api_not_found(source),
            _ => false,
        }
    }

    /// Whether this error is a bounded wait that expired
    pub fn is_timeout(&self) -> bool {
        matches!(self, Error::Timeout { .. })
    }

    /// Check if this error is retryable by the caller
    ///
    /// Configuration and not-found errors need a change before a retry can
    /// succeed. Kubernetes errors are retryable unless the API rejected the
    /// request with a 4xx status.
    pub fn is_retryable(&self) -> bool {
        match self {
            Error::Kube { source } => !matches!(
                source,
                kube::Error::Api(ae) if (400..500).contains(&ae.code)
            ),
            Error::Config { .. } => false,
            Error::NotFound { .. } => false,
            Error::Timeout { .. } => true,
            Error::Serialization { .. } => false,
            Error::Command { .. } => false,
            Error::Internal { .. } => true,
        }
    }
}

/// True when a kube error is an API 404
pub fn is_api_not_found(err: &kube::Error) -> bool {
    matches!(err, kube::Error::Api(ae) if ae.code == 404)
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::serialization(e.to_string())
    }
}
