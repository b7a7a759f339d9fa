//! `NodeShell`: run a command on a node and get told when it is done

use std::path::PathBuf;
use std::sync::Arc;

use tokio::time::{Instant, timeout_at};
use tracing::{debug, error, instrument};

use crate::config::ShellConfig;
use crate::credentials::{CredentialProvider, NoPrompt, PassphrasePrompt};
use crate::error::{ExecError, TransportError, classify};
use crate::keys::{Identity, KeySource, UnlockedKey, unlock_all};
use crate::listener::ShellExecListener;
use crate::monitor::{self, ExecutionHandle, MonitorHandle};
use crate::relay::{LogSink, OutputRelay, TracingSink};
use crate::result::ConnectionParameters;
use crate::ssh::RusshTransport;
use crate::transport::{ExecChannel, RemoteSession, SessionRequest, Transport};

/// Remote shell executor
///
/// `exec` connects, authenticates and opens the channel before returning, so
/// those failures come back as `Err`. Everything after that is reported
/// through the listener, from a monitor task owned by the execution.
pub struct NodeShell {
    transport: Arc<dyn Transport>,
    identities: Vec<Arc<Identity>>,
    credentials: Arc<CredentialProvider>,
    relay: OutputRelay,
    config: ShellConfig,
}

impl std::fmt::Debug for NodeShell {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NodeShell")
            .field("identities", &self.identities)
            .field("credentials", &self.credentials)
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl NodeShell {
    /// Start building an executor that authenticates with `key_source`
    pub fn builder(key_source: KeySource) -> NodeShellBuilder {
        NodeShellBuilder::new(key_source)
    }

    /// Credential provider shared by all executions
    #[must_use]
    pub fn credentials(&self) -> &Arc<CredentialProvider> {
        &self.credentials
    }

    #[must_use]
    pub fn config(&self) -> &ShellConfig {
        &self.config
    }

    /// Register another key; keys are offered in the order they were added
    ///
    /// # Errors
    /// Returns `ExecError::SshKeyError` if the key cannot be loaded
    pub fn add_identity(&mut self, key_source: &KeySource) -> Result<(), ExecError> {
        let identity =
            Identity::from_source(key_source).map_err(|e| ExecError::SshKeyError(e.to_string()))?;
        self.identities.push(Arc::new(identity));
        Ok(())
    }

    /// Run `command` on the node described by `params`
    ///
    /// Returns once the channel is open; `listener` is called exactly once
    /// when the command ends, fails or is interrupted.
    ///
    /// # Errors
    /// - `ExecError::InvalidParameters` for an empty host, user, command or port 0
    /// - `ExecError::AuthenticationFailed` when keys are rejected or unlocking is declined
    /// - `ExecError::UnknownHost` when the host does not resolve
    /// - `ExecError::Transport` for any other connection failure
    #[instrument(skip(self, command, listener), fields(node = %params.node, host = %params.host))]
    pub async fn exec(
        &self,
        params: &ConnectionParameters,
        command: &str,
        listener: impl ShellExecListener + 'static,
    ) -> Result<MonitorHandle, ExecError> {
        params.validate()?;
        if command.trim().is_empty() {
            return Err(ExecError::InvalidParameters("command is empty".to_string()));
        }

        // prompting for a passphrase is not part of the connect budget
        let keys = unlock_all(&self.identities, &self.credentials)
            .await
            .map_err(|e| self.fail(params, &e))?;

        let (session, mut channel) = self
            .open(params, command, &keys)
            .await
            .map_err(|e| self.fail(params, &e))?;

        let stream = match channel.output_stream() {
            Ok(stream) => Some(stream),
            Err(e) => {
                debug!(host = %params.host, error = %e, "no output stream, output will be dropped");
                None
            }
        };
        let relay = self.relay.attach(&params.host, stream);

        Ok(monitor::spawn(ExecutionHandle {
            node: params.node,
            host: params.host.clone(),
            session,
            channel,
            listener: Box::new(listener),
            relay,
            deadline: self.config.command_deadline(),
            relay_drain: self.config.relay_drain(),
        }))
    }

    fn fail(&self, params: &ConnectionParameters, cause: &TransportError) -> ExecError {
        let err = classify(&params.host, cause);
        error!(host = %params.host, cause = %cause, error = %err, "exec failed");
        err
    }

    /// Connect, authenticate and open the channel within `connect_timeout`
    async fn open(
        &self,
        params: &ConnectionParameters,
        command: &str,
        keys: &[UnlockedKey],
    ) -> Result<(Box<dyn RemoteSession>, Box<dyn ExecChannel>), TransportError> {
        let limit = self.config.connect_timeout();
        let deadline = Instant::now() + limit;

        let mut session = timeout_at(
            deadline,
            self.transport.open_session(SessionRequest {
                params,
                keys,
                credentials: &self.credentials,
            }),
        )
        .await
        .unwrap_or(Err(TransportError::ConnectTimeout(limit)))?;

        let opened = timeout_at(deadline, session.open_exec(command))
            .await
            .unwrap_or(Err(TransportError::ConnectTimeout(limit)));
        match opened {
            Ok(channel) => Ok((session, channel)),
            Err(e) => {
                session.disconnect().await;
                Err(e)
            }
        }
    }
}

/// Builder for `NodeShell`
pub struct NodeShellBuilder {
    key_sources: Vec<KeySource>,
    identities: Vec<Arc<Identity>>,
    transport: Option<Arc<dyn Transport>>,
    credentials: Option<Arc<CredentialProvider>>,
    sink: Option<Arc<dyn LogSink>>,
    config: ShellConfig,
}

impl NodeShellBuilder {
    /// Create builder with the first key
    pub fn new(key_source: KeySource) -> Self {
        Self {
            key_sources: vec![key_source],
            identities: Vec::new(),
            transport: None,
            credentials: None,
            sink: None,
            config: ShellConfig::default(),
        }
    }

    /// Start from an identity that is already loaded
    pub fn from_identity(identity: Arc<Identity>) -> Self {
        Self {
            key_sources: Vec::new(),
            identities: vec![identity],
            transport: None,
            credentials: None,
            sink: None,
            config: ShellConfig::default(),
        }
    }

    /// Offer an additional key file
    #[must_use]
    pub fn with_key_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.key_sources.push(KeySource::Path(path.into()));
        self
    }

    /// Offer an additional key from environment variable (base64)
    #[must_use]
    pub fn with_env_key(mut self, var_name: impl Into<String>) -> Self {
        self.key_sources.push(KeySource::Env(var_name.into()));
        self
    }

    /// Prompt used to unlock encrypted keys
    #[must_use]
    pub fn with_prompt(mut self, prompt: impl PassphrasePrompt + 'static) -> Self {
        self.credentials = Some(Arc::new(CredentialProvider::new(prompt)));
        self
    }

    /// Share an existing credential provider (and its cached passphrases)
    #[must_use]
    pub fn with_credentials(mut self, credentials: Arc<CredentialProvider>) -> Self {
        self.credentials = Some(credentials);
        self
    }

    /// Where remote stdout goes; defaults to `tracing`
    #[must_use]
    pub fn with_sink(mut self, sink: Arc<dyn LogSink>) -> Self {
        self.sink = Some(sink);
        self
    }

    #[must_use]
    pub fn with_transport(mut self, transport: Arc<dyn Transport>) -> Self {
        self.transport = Some(transport);
        self
    }

    #[must_use]
    pub fn with_config(mut self, config: ShellConfig) -> Self {
        self.config = config;
        self
    }

    /// Build the executor
    ///
    /// # Errors
    /// Returns `ExecError::SshKeyError` if a key cannot be loaded
    pub fn build(self) -> Result<NodeShell, ExecError> {
        let mut identities = self.identities;
        for source in &self.key_sources {
            let identity =
                Identity::from_source(source).map_err(|e| ExecError::SshKeyError(e.to_string()))?;
            identities.push(Arc::new(identity));
        }

        let credentials = self
            .credentials
            .unwrap_or_else(|| Arc::new(CredentialProvider::new(NoPrompt)));
        if !self.config.display_prompts {
            credentials.disable_display();
        }

        Ok(NodeShell {
            transport: self
                .transport
                .unwrap_or_else(|| Arc::new(RusshTransport::default())),
            identities,
            credentials,
            relay: OutputRelay::new(self.sink.unwrap_or_else(|| Arc::new(TracingSink))),
            config: self.config,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::result::{ExecutionResult, NodeId};

    #[test]
    fn test_build_fails_on_missing_key() {
        let result = NodeShell::builder(KeySource::Path("/nonexistent/id_rsa".into())).build();
        assert!(matches!(result, Err(ExecError::SshKeyError(_))));
    }

    #[test]
    fn test_batch_config_disables_display() {
        let identity = Arc::new(Identity::from_pem("test", String::new()));
        let config = ShellConfig {
            display_prompts: false,
            ..ShellConfig::default()
        };
        let shell = NodeShellBuilder::from_identity(identity)
            .with_config(config)
            .build()
            .unwrap();
        assert!(!shell.credentials().is_display_enabled());
    }

    #[tokio::test]
    async fn test_invalid_parameters_rejected_before_connecting() {
        let identity = Arc::new(Identity::from_pem("test", String::new()));
        let shell = NodeShellBuilder::from_identity(identity).build().unwrap();
        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel::<ExecutionResult>();

        let params = ConnectionParameters::new(NodeId(1), "", "u");
        let result = shell.exec(&params, "true", tx.clone()).await;
        assert!(matches!(result, Err(ExecError::InvalidParameters(_))));

        let params = ConnectionParameters::new(NodeId(1), "h1", "u");
        let result = shell.exec(&params, "  ", tx).await;
        assert!(matches!(result, Err(ExecError::InvalidParameters(_))));

        assert!(rx.try_recv().is_err());
    }
}
