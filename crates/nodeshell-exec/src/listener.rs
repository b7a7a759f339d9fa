//! Completion callback

use std::sync::Arc;

use tokio::sync::mpsc;
use tracing::debug;

use crate::result::ExecutionResult;

/// Receives the terminal result of an execution, exactly once per accepted `exec()`
///
/// Called from the monitor task. Implementations that need to do real work
/// should hand the result off, which is what the `mpsc` sender impl does.
pub trait ShellExecListener: Send + Sync {
    fn exec_finished(&self, result: ExecutionResult);
}

impl ShellExecListener for mpsc::UnboundedSender<ExecutionResult> {
    fn exec_finished(&self, result: ExecutionResult) {
        if let Err(e) = self.send(result) {
            debug!(node = %e.0.node, "completion queue closed, result dropped");
        }
    }
}

impl<T: ShellExecListener + ?Sized> ShellExecListener for Arc<T> {
    fn exec_finished(&self, result: ExecutionResult) {
        (**self).exec_finished(result);
    }
}
