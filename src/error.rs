//! Error types for the driver binary

use std::path::PathBuf;

/// CLI Result type
pub type Result<T> = std::result::Result<T, Error>;

/// CLI errors
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Failure from the driver or the cluster
    #[error(transparent)]
    Driver(#[from] kubehost_common::Error),

    /// Local store I/O failure
    #[error("io error on {path}: {source}")]
    Io {
        /// File or directory involved
        path: PathBuf,
        /// Underlying error
        source: std::io::Error,
    },

    /// A host record could not be parsed or written
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    /// No record exists for the named host
    #[error("host not found: {name}")]
    HostNotFound {
        /// Host name
        name: String,
    },

    /// A record already exists for the named host
    #[error("host already exists: {name}")]
    HostAlreadyExists {
        /// Host name
        name: String,
    },

    /// Invalid user input
    #[error("validation error: {message}")]
    Validation {
        /// What's wrong
        message: String,
    },
}

impl Error {
    /// Create a validation error with the given message
    pub fn validation(message: impl Into<String>) -> Self {
        Error::Validation {
            message: message.into(),
        }
    }

    /// Wrap an I/O error with the path it concerns
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Error::Io {
            path: path.into(),
            source,
        }
    }
}
