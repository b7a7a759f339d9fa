//! Forwarding of remote standard output to a log sink

use std::sync::Arc;

use tokio::io::{AsyncBufReadExt, AsyncReadExt, BufReader};
use tokio::task::JoinHandle;
use tracing::{debug, info};

use crate::transport::OutputStream;

/// Longest line handed to a sink; longer lines arrive in pieces of this size
pub const MAX_LINE: usize = 16 * 1024;

/// Receives remote output, one line at a time
pub trait LogSink: Send + Sync {
    /// `line` has its trailing newline removed
    fn log_line(&self, host: &str, line: &str);
}

/// Sink writing each line as a `tracing` event under the `remote_output` target
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingSink;

impl LogSink for TracingSink {
    fn log_line(&self, host: &str, line: &str) {
        info!(target: "remote_output", host = %host, "{line}");
    }
}

/// Line-oriented pump from an [`OutputStream`] into a [`LogSink`]
#[derive(Clone)]
pub struct OutputRelay {
    sink: Arc<dyn LogSink>,
}

impl std::fmt::Debug for OutputRelay {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OutputRelay").finish_non_exhaustive()
    }
}

impl OutputRelay {
    pub fn new(sink: Arc<dyn LogSink>) -> Self {
        Self { sink }
    }

    /// Start forwarding `stream`; `None` means the relay stays detached
    ///
    /// The returned task ends when the stream is exhausted or fails.
    pub fn attach(&self, host: &str, stream: Option<OutputStream>) -> Option<JoinHandle<()>> {
        let Some(stream) = stream else {
            debug!(host = %host, "no output stream, relay detached");
            return None;
        };

        let sink = self.sink.clone();
        let host = host.to_string();
        Some(tokio::spawn(async move {
            forward(stream, sink.as_ref(), &host).await;
        }))
    }
}

async fn forward(stream: OutputStream, sink: &dyn LogSink, host: &str) {
    let mut reader = BufReader::new(stream);
    let mut buf = Vec::new();

    loop {
        buf.clear();
        let mut limited = (&mut reader).take(MAX_LINE as u64);
        match limited.read_until(b'\n', &mut buf).await {
            Ok(0) => break,
            Ok(_) => {
                let line = String::from_utf8_lossy(&buf);
                sink.log_line(host, line.trim_end_matches(['\n', '\r']));
            }
            Err(e) => {
                debug!(host = %host, error = %e, "output stream failed, relay stopped");
                break;
            }
        }
    }
}
