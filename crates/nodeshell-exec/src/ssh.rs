//! SSH transport using russh crate

use std::net::SocketAddr;
use std::sync::Arc;

use async_trait::async_trait;
use russh::keys::PrivateKeyWithHashAlg;
use russh::keys::ssh_key;
use russh::{ChannelMsg, Disconnect, client};
use tokio::io::{AsyncWriteExt, DuplexStream};
use tracing::{debug, info, instrument, warn};

use crate::credentials::CredentialProvider;
use crate::error::TransportError;
use crate::transport::{ExecChannel, OutputStream, RemoteSession, SessionRequest, Transport};

/// Bytes of remote stdout buffered ahead of the relay
const OUTPUT_BUFFER: usize = 64 * 1024;

const STDERR_EXT: u32 = 1;

fn protocol(e: russh::Error) -> TransportError {
    TransportError::Protocol(e.to_string())
}

/// SSH client handler for russh
struct SshClientHandler {
    host: String,
    credentials: Arc<CredentialProvider>,
}

impl client::Handler for SshClientHandler {
    type Error = russh::Error;

    async fn check_server_key(
        &mut self,
        server_public_key: &ssh_key::PublicKey,
    ) -> Result<bool, Self::Error> {
        let fingerprint = server_public_key.fingerprint(ssh_key::HashAlg::Sha256);
        Ok(self.credentials.prompt_yes_no(&format!(
            "The authenticity of host {} can't be established. Key fingerprint is {fingerprint}. Continue connecting?",
            self.host
        )))
    }

    async fn auth_banner(
        &mut self,
        banner: &str,
        _session: &mut client::Session,
    ) -> Result<(), Self::Error> {
        self.credentials.show_message(banner);
        Ok(())
    }
}

/// [`Transport`] backed by russh
///
/// Every session is a fresh TCP connection; nothing is pooled.
#[derive(Debug, Clone, Default)]
pub struct RusshTransport {
    config: Arc<client::Config>,
}

impl RusshTransport {
    #[must_use]
    pub fn new(config: client::Config) -> Self {
        Self {
            config: Arc::new(config),
        }
    }
}

#[async_trait]
impl Transport for RusshTransport {
    #[instrument(skip(self, request), fields(host = %request.params.host, port = request.params.port))]
    async fn open_session(
        &self,
        request: SessionRequest<'_>,
    ) -> Result<Box<dyn RemoteSession>, TransportError> {
        let params = request.params;

        let addrs: Vec<SocketAddr> = tokio::net::lookup_host((params.host.as_str(), params.port))
            .await
            .map_err(TransportError::Resolve)?
            .collect();
        if addrs.is_empty() {
            return Err(TransportError::Resolve(std::io::Error::new(
                std::io::ErrorKind::NotFound,
                format!("no addresses for {}", params.host),
            )));
        }

        info!(
            host = %params.host,
            port = params.port,
            user = %params.user,
            "connecting to SSH"
        );

        let handler = SshClientHandler {
            host: params.host.clone(),
            credentials: request.credentials.clone(),
        };
        let mut handle = client::connect(self.config.clone(), addrs.as_slice(), handler)
            .await
            .map_err(protocol)?;

        let mut last_error = None;
        for unlocked in request.keys {
            let hash_alg = handle
                .best_supported_rsa_hash()
                .await
                .ok()
                .flatten()
                .flatten();
            let auth_res = handle
                .authenticate_publickey(
                    &params.user,
                    PrivateKeyWithHashAlg::new(unlocked.key().clone(), hash_alg),
                )
                .await
                .map_err(protocol)?;

            if auth_res.success() {
                info!(host = %params.host, identity = %unlocked.id(), "SSH connected and authenticated");
                return Ok(Box::new(RusshSession {
                    handle,
                    host: params.host.clone(),
                }));
            }

            debug!(identity = %unlocked.id(), "public key rejected");
            last_error = Some(TransportError::AuthRejected(format!(
                "{} rejected by {}",
                unlocked.id(),
                params.host
            )));
        }

        if let Err(e) = handle
            .disconnect(Disconnect::ByApplication, "", "English")
            .await
        {
            debug!(host = %params.host, error = %e, "disconnect after failed auth");
        }

        Err(last_error.unwrap_or_else(|| {
            TransportError::AuthRejected("no identity configured".to_string())
        }))
    }
}

/// Authenticated russh session
struct RusshSession {
    handle: client::Handle<SshClientHandler>,
    host: String,
}

#[async_trait]
impl RemoteSession for RusshSession {
    async fn open_exec(&mut self, command: &str) -> Result<Box<dyn ExecChannel>, TransportError> {
        let channel = self
            .handle
            .channel_open_session()
            .await
            .map_err(protocol)?;
        debug!(host = %self.host, "exec channel opened");

        Ok(Box::new(RusshChannel {
            channel,
            command: command.to_string(),
            host: self.host.clone(),
            output: None,
        }))
    }

    async fn disconnect(&mut self) {
        match self
            .handle
            .disconnect(Disconnect::ByApplication, "", "English")
            .await
        {
            Ok(()) => info!(host = %self.host, "SSH disconnected"),
            Err(e) => warn!(host = %self.host, error = %e, "SSH disconnect failed"),
        }
    }
}

/// Exec channel; stdout is pumped into a pipe read by the relay
struct RusshChannel {
    channel: russh::Channel<client::Msg>,
    command: String,
    host: String,
    output: Option<DuplexStream>,
}

impl RusshChannel {
    async fn forward_output(&mut self, data: &[u8]) {
        if let Some(pipe) = self.output.as_mut() {
            if let Err(e) = pipe.write_all(data).await {
                debug!(host = %self.host, error = %e, "relay gone, dropping output");
                self.output = None;
            }
        }
    }
}

#[async_trait]
impl ExecChannel for RusshChannel {
    fn output_stream(&mut self) -> std::io::Result<OutputStream> {
        if self.output.is_some() {
            return Err(std::io::Error::other("output stream already taken"));
        }
        let (writer, reader) = tokio::io::duplex(OUTPUT_BUFFER);
        self.output = Some(writer);
        Ok(Box::new(reader))
    }

    async fn connect(&mut self) -> Result<(), TransportError> {
        debug!(host = %self.host, command = %self.command, "executing remote command");
        self.channel
            .exec(true, self.command.as_str())
            .await
            .map_err(protocol)?;

        // no stdin is ever sent
        if let Err(e) = self.channel.eof().await {
            debug!(host = %self.host, error = %e, "could not close remote stdin");
        }
        Ok(())
    }

    async fn wait_closed(&mut self) -> Result<Option<u32>, TransportError> {
        let mut exit_status = None;
        let mut stderr = tokio::io::stderr();

        loop {
            match self.channel.wait().await {
                Some(ChannelMsg::Data { data }) => self.forward_output(&data).await,
                Some(ChannelMsg::ExtendedData { data, ext }) if ext == STDERR_EXT => {
                    if let Err(e) = stderr.write_all(&data).await {
                        debug!(host = %self.host, error = %e, "could not write remote stderr");
                    }
                }
                Some(ChannelMsg::ExitStatus { exit_status: status }) => {
                    exit_status = Some(status);
                }
                Some(ChannelMsg::ExitSignal { signal_name, .. }) => {
                    warn!(host = %self.host, signal = ?signal_name, "remote command killed by signal");
                }
                Some(ChannelMsg::Failure) => {
                    self.output = None;
                    return Err(TransportError::Protocol(format!(
                        "{} refused to execute command",
                        self.host
                    )));
                }
                Some(ChannelMsg::Eof) => {
                    // closes the relay's end
                    self.output = None;
                }
                Some(ChannelMsg::Close) => break,
                Some(_) => {}
                None => {
                    self.output = None;
                    return Err(TransportError::Protocol(format!(
                        "connection to {} lost before channel close",
                        self.host
                    )));
                }
            }
        }

        self.output = None;
        Ok(exit_status)
    }

    async fn disconnect(&mut self) {
        self.output = None;
        if let Err(e) = self.channel.close().await {
            debug!(host = %self.host, error = %e, "channel already closed");
        }
    }
}
