//! Error types for nodeshell-exec

use std::time::Duration;

use thiserror::Error;

/// Errors reported by an execution, either from `exec()` or through the listener
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ExecError {
    /// Keys were rejected or the passphrase prompt was declined
    #[error("authentication failed on {0}")]
    AuthenticationFailed(String),

    /// Host name could not be resolved
    #[error("unknown host {0}")]
    UnknownHost(String),

    /// Connection or protocol failure
    #[error("transport error: {0}")]
    Transport(String),

    /// The monitor was interrupted locally
    #[error("interrupted")]
    Interrupted,

    /// Remote command outlived the configured deadline
    #[error("command timed out after {timeout:?}")]
    Timeout {
        /// Deadline that was exceeded
        timeout: Duration,
    },

    /// Connection parameters failed validation
    #[error("invalid connection parameters: {0}")]
    InvalidParameters(String),

    /// Identity could not be loaded
    #[error("SSH key error: {0}")]
    SshKeyError(String),
}

impl ExecError {
    /// Check if error is retryable
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        matches!(self, ExecError::Transport(_) | ExecError::Timeout { .. })
    }
}

/// Failure reported by a transport binding
///
/// Bindings map their own error types onto these variants; [`classify`]
/// turns them into the caller-facing [`ExecError`].
#[derive(Error, Debug)]
pub enum TransportError {
    /// The user declined to unlock the key
    #[error("authentication cancelled")]
    AuthCancelled,

    /// The server rejected every offered key, or the key could not be decrypted
    #[error("authentication rejected: {0}")]
    AuthRejected(String),

    /// Host name lookup failed
    #[error("failed to resolve host: {0}")]
    Resolve(#[source] std::io::Error),

    /// Connecting or authenticating took longer than allowed
    #[error("connection timed out after {0:?}")]
    ConnectTimeout(Duration),

    /// Anything else raised by the underlying library
    #[error("{0}")]
    Protocol(String),
}

/// Map a transport failure on `host` onto the public error taxonomy
#[must_use]
pub fn classify(host: &str, err: &TransportError) -> ExecError {
    match err {
        TransportError::AuthCancelled | TransportError::AuthRejected(_) => {
            ExecError::AuthenticationFailed(host.to_string())
        }
        TransportError::Resolve(_) => ExecError::UnknownHost(host.to_string()),
        TransportError::ConnectTimeout(_) | TransportError::Protocol(_) => {
            ExecError::Transport(err.to_string())
        }
    }
}
