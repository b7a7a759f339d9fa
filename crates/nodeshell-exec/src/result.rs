//! Connection parameters and execution results

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::ExecError;

/// Opaque node identifier handed out by the node registry
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct NodeId(pub u64);

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "node-{}", self.0)
    }
}

/// Where and as whom to run a command
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectionParameters {
    /// Node the execution is reported against
    pub node: NodeId,
    /// Remote user
    pub user: String,
    /// Host address
    pub host: String,
    /// Port (default 22)
    #[serde(default = "default_port")]
    pub port: u16,
}

pub(crate) fn default_port() -> u16 {
    22
}

impl ConnectionParameters {
    /// Create parameters with the default port
    pub fn new(node: NodeId, host: impl Into<String>, user: impl Into<String>) -> Self {
        Self {
            node,
            user: user.into(),
            host: host.into(),
            port: default_port(),
        }
    }

    /// Set custom port
    #[must_use]
    pub fn with_port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    /// Reject parameters no session could be opened with
    ///
    /// # Errors
    /// Returns `ExecError::InvalidParameters` naming the offending field
    pub fn validate(&self) -> Result<(), ExecError> {
        if self.host.trim().is_empty() {
            return Err(ExecError::InvalidParameters("host is empty".to_string()));
        }
        if self.user.trim().is_empty() {
            return Err(ExecError::InvalidParameters(format!(
                "user is empty for {}",
                self.host
            )));
        }
        if self.port == 0 {
            return Err(ExecError::InvalidParameters(format!(
                "port 0 is not valid for {}",
                self.host
            )));
        }
        Ok(())
    }
}

/// Terminal outcome of one execution
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecutionResult {
    /// Node the command ran on
    pub node: NodeId,
    /// Failure, if the command could not be seen through to the end
    pub error: Option<ExecError>,
    /// Remote exit status, `-1` when `error` is set or none was reported
    pub exit_status: i32,
}

impl ExecutionResult {
    pub(crate) fn finished(node: NodeId, exit_status: i32) -> Self {
        Self {
            node,
            error: None,
            exit_status,
        }
    }

    pub(crate) fn failed(node: NodeId, error: ExecError) -> Self {
        Self {
            node,
            error: Some(error),
            exit_status: -1,
        }
    }

    /// Check if the command ran to completion with exit status 0
    #[must_use]
    pub fn success(&self) -> bool {
        self.error.is_none() && self.exit_status == 0
    }
}
