//! nodeshell-exec: Remote shell execution abstraction
//!
//! Opens an SSH session per execution, runs one command, streams its stdout to
//! a log sink and reports completion asynchronously to a listener.

pub mod config;
pub mod credentials;
pub mod error;
pub mod executor;
pub mod keys;
pub mod listener;
mod monitor;
pub mod relay;
pub mod result;
pub mod ssh;
pub mod transport;

pub use config::ShellConfig;
pub use credentials::{CredentialProvider, NoPrompt, PassphrasePrompt};
pub use error::{ExecError, TransportError};
pub use executor::{NodeShell, NodeShellBuilder};
pub use keys::{Identity, IdentityId, KeyError, KeySource, UnlockedKey};
pub use listener::ShellExecListener;
pub use monitor::MonitorHandle;
pub use relay::{LogSink, OutputRelay, TracingSink};
pub use result::{ConnectionParameters, ExecutionResult, NodeId};
