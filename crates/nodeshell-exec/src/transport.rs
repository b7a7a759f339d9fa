//! Transport seam between the executor and an SSH library
//!
//! The executor only sees sessions and exec channels through these traits;
//! [`crate::ssh::RusshTransport`] is the production binding.

use std::sync::Arc;

use async_trait::async_trait;
use tokio::io::AsyncRead;

use crate::credentials::CredentialProvider;
use crate::error::TransportError;
use crate::keys::UnlockedKey;
use crate::result::ConnectionParameters;

/// Remote standard output of an exec channel
pub type OutputStream = Box<dyn AsyncRead + Send + Unpin>;

/// Everything a transport needs to open an authenticated session
#[derive(Debug, Clone, Copy)]
pub struct SessionRequest<'a> {
    pub params: &'a ConnectionParameters,
    /// Keys to offer, in order; unlocked before the connection is attempted
    pub keys: &'a [UnlockedKey],
    pub credentials: &'a Arc<CredentialProvider>,
}

/// Opens authenticated sessions
#[async_trait]
pub trait Transport: Send + Sync {
    /// Connect and authenticate
    async fn open_session(
        &self,
        request: SessionRequest<'_>,
    ) -> Result<Box<dyn RemoteSession>, TransportError>;
}

/// An authenticated connection to one host
#[async_trait]
pub trait RemoteSession: Send {
    /// Open an exec channel bound to `command`; the command does not start
    /// until [`ExecChannel::connect`]
    async fn open_exec(&mut self, command: &str) -> Result<Box<dyn ExecChannel>, TransportError>;

    /// Tear the session down; errors are logged, not returned
    async fn disconnect(&mut self);
}

/// A channel running a single command
#[async_trait]
pub trait ExecChannel: Send {
    /// Take the remote stdout stream; can only succeed once
    fn output_stream(&mut self) -> std::io::Result<OutputStream>;

    /// Start the remote command
    async fn connect(&mut self) -> Result<(), TransportError>;

    /// Wait for the channel to close; yields the exit status if the remote sent one
    async fn wait_closed(&mut self) -> Result<Option<u32>, TransportError>;

    /// Close the channel; errors are logged, not returned
    async fn disconnect(&mut self);
}
