//! Completion monitor: one task per execution
//!
//! The monitor owns the session and channel of an execution. It starts the
//! remote command, waits for the channel to close, reports the outcome to the
//! listener and then releases channel and session, in that order, exactly once.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tracing::{debug, error, info, warn};

use crate::error::ExecError;
use crate::listener::ShellExecListener;
use crate::result::{ExecutionResult, NodeId};
use crate::transport::{ExecChannel, RemoteSession};

/// In-flight state of one execution, moved into its monitor task
pub(crate) struct ExecutionHandle {
    pub node: NodeId,
    pub host: String,
    pub session: Box<dyn RemoteSession>,
    pub channel: Box<dyn ExecChannel>,
    pub listener: Box<dyn ShellExecListener>,
    /// Relay task fed by the channel's stdout, if one is attached
    pub relay: Option<JoinHandle<()>>,
    pub deadline: Option<Duration>,
    pub relay_drain: Duration,
}

/// Caller-side handle on a running monitor
///
/// Dropping it detaches; the execution carries on and still reports.
#[derive(Debug)]
pub struct MonitorHandle {
    node: NodeId,
    host: String,
    interrupt: Arc<Notify>,
    task: JoinHandle<()>,
}

impl MonitorHandle {
    #[must_use]
    pub fn node(&self) -> NodeId {
        self.node
    }

    #[must_use]
    pub fn host(&self) -> &str {
        &self.host
    }

    /// Stop waiting on the remote command
    ///
    /// The listener receives `ExecError::Interrupted` unless the execution
    /// already finished. Channel and session are still released.
    pub fn interrupt(&self) {
        self.interrupt.notify_one();
    }

    #[must_use]
    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }

    /// Wait until the listener has been called and resources are released
    pub async fn join(self) {
        if let Err(e) = self.task.await {
            error!(node = %self.node, host = %self.host, error = %e, "monitor task failed");
        }
    }
}

pub(crate) fn spawn(execution: ExecutionHandle) -> MonitorHandle {
    let interrupt = Arc::new(Notify::new());
    let node = execution.node;
    let host = execution.host.clone();
    let task = tokio::spawn(execution.run(interrupt.clone()));

    MonitorHandle {
        node,
        host,
        interrupt,
        task,
    }
}

impl ExecutionHandle {
    async fn run(self, interrupt: Arc<Notify>) {
        let ExecutionHandle {
            node,
            host,
            mut session,
            mut channel,
            listener,
            relay,
            deadline,
            relay_drain,
        } = self;

        let outcome = tokio::select! {
            biased;
            () = interrupt.notified() => {
                debug!(host = %host, "monitor interrupted");
                Err(ExecError::Interrupted)
            }
            outcome = supervise(&mut *channel, &host, deadline) => outcome,
        };

        // let buffered output reach the sink before reporting
        if let Some(relay) = relay {
            if outcome.is_ok() && timeout(relay_drain, relay).await.is_err() {
                debug!(host = %host, "output still draining after channel close");
            }
        }

        let result = match outcome {
            Ok(exit_status) => {
                info!(node = %node, host = %host, exit_status, "remote command finished");
                ExecutionResult::finished(node, exit_status)
            }
            Err(e) => {
                warn!(node = %node, host = %host, error = %e, "remote command failed");
                ExecutionResult::failed(node, e)
            }
        };

        listener.exec_finished(result);

        channel.disconnect().await;
        session.disconnect().await;
        debug!(host = %host, "channel and session released");
    }
}

/// `Connecting → Running → Closed(exit)`; any error is `Failed`
async fn supervise(
    channel: &mut dyn ExecChannel,
    host: &str,
    deadline: Option<Duration>,
) -> Result<i32, ExecError> {
    debug!(host = %host, "connecting channel");
    channel
        .connect()
        .await
        .map_err(|e| ExecError::Transport(e.to_string()))?;
    debug!(host = %host, "channel connected, command running");

    let closed = match deadline {
        Some(limit) => timeout(limit, channel.wait_closed())
            .await
            .map_err(|_| ExecError::Timeout { timeout: limit })?,
        None => channel.wait_closed().await,
    };
    let exit_status = closed.map_err(|e| ExecError::Transport(e.to_string()))?;
    debug!(host = %host, ?exit_status, "channel closed");

    Ok(exit_status.map_or(-1, u32::cast_signed))
}
