//! `nodeshell run`: execute one command across nodes

use std::sync::Arc;

use nodeshell_exec::{ExecutionResult, MonitorHandle, NodeShell};
use tokio::sync::{mpsc, watch};
use tracing::{error, info, warn};

use crate::config::Config;
use crate::prompt::{StdoutSink, TerminalPrompt};

/// Which nodes to run on and what
#[derive(Debug)]
pub struct RunRequest<'a> {
    pub nodes: &'a [u64],
    pub all: bool,
    pub command: &'a str,
    /// Never prompt; unlock keys only from cached or empty passphrases
    pub batch: bool,
}

/// Run the command on every selected node and wait for all of them
///
/// Returns the process exit code: 0 when every node exited 0, 1 otherwise.
///
/// # Errors
/// Returns error if node selection or key loading fails
pub async fn run(config: &Config, request: &RunRequest<'_>) -> eyre::Result<i32> {
    let nodes = config.select_nodes(request.nodes, request.all)?;

    let mut shell_config = config.shell.clone();
    if request.batch {
        shell_config.display_prompts = false;
    }

    let mut shell = NodeShell::builder(config.identity.key_source()?)
        .with_prompt(TerminalPrompt)
        .with_sink(Arc::new(StdoutSink))
        .with_config(shell_config)
        .build()?;
    for path in &config.identity.extra_keys {
        shell.add_identity(&nodeshell_exec::KeySource::Path(path.clone()))?;
    }

    let mut stop = watch_interrupt();
    let (tx, mut rx) = mpsc::unbounded_channel::<ExecutionResult>();
    let mut handles = Vec::with_capacity(nodes.len());
    let mut failures = 0usize;

    for node in nodes {
        let started = if *stop.borrow() {
            None
        } else {
            let params = node.params();
            tokio::select! {
                biased;
                () = interrupted(&mut stop) => None,
                started = shell.exec(&params, request.command, tx.clone()) => Some(started),
            }
        };

        match started {
            Some(Ok(handle)) => handles.push(handle),
            Some(Err(e)) => {
                error!(node = node.id, host = %node.host, error = %e, "could not start command");
                println!("{}\terror\t{e}", node.host);
                failures += 1;
            }
            None => {
                println!("{}\terror\tinterrupted", node.host);
                failures += 1;
            }
        }
    }
    drop(tx);

    info!(started = handles.len(), "waiting for remote commands");

    let mut stopping = *stop.borrow();
    if stopping {
        interrupt_all(&handles);
    }
    loop {
        tokio::select! {
            result = rx.recv() => {
                let Some(result) = result else { break };
                if !result.success() {
                    failures += 1;
                }
                println!("{}", describe(config, &result));
            }
            () = interrupted(&mut stop), if !stopping => {
                stopping = true;
                interrupt_all(&handles);
            }
        }
    }

    for handle in handles {
        handle.join().await;
    }

    Ok(i32::from(failures > 0))
}

/// Flips to `true` on the first Ctrl-C
fn watch_interrupt() -> watch::Receiver<bool> {
    let (tx, rx) = watch::channel(false);
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => {
                warn!("interrupt received, stopping remote commands");
                tx.send_replace(true);
            }
            Err(e) => warn!(error = %e, "could not listen for ctrl-c"),
        }
    });
    rx
}

/// Resolves once interrupted; never if the signal cannot be watched
async fn interrupted(stop: &mut watch::Receiver<bool>) {
    if stop.wait_for(|stopped| *stopped).await.is_err() {
        std::future::pending::<()>().await;
    }
}

fn interrupt_all(handles: &[MonitorHandle]) {
    for handle in handles {
        handle.interrupt();
    }
}

fn describe(config: &Config, result: &ExecutionResult) -> String {
    let host = config.host_of(result.node);
    match &result.error {
        None => format!("{host}\texit\t{}", result.exit_status),
        Some(e) => format!("{host}\terror\t{e}"),
    }
}
