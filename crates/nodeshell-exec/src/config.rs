//! Executor configuration

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Tunables shared by every execution of a `NodeShell`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShellConfig {
    /// Upper bound for resolve + connect + authenticate
    #[serde(default = "default_connect_timeout_secs")]
    pub connect_timeout_secs: u64,
    /// Deadline for the remote command; unset means wait forever
    #[serde(default)]
    pub command_deadline_secs: Option<u64>,
    /// How long the monitor waits for buffered output after the channel closes
    #[serde(default = "default_relay_drain_ms")]
    pub relay_drain_ms: u64,
    /// Whether passphrase prompts may be shown
    #[serde(default = "default_display_prompts")]
    pub display_prompts: bool,
}

fn default_connect_timeout_secs() -> u64 {
    30
}

fn default_relay_drain_ms() -> u64 {
    1000
}

fn default_display_prompts() -> bool {
    true
}

impl Default for ShellConfig {
    fn default() -> Self {
        Self {
            connect_timeout_secs: default_connect_timeout_secs(),
            command_deadline_secs: None,
            relay_drain_ms: default_relay_drain_ms(),
            display_prompts: default_display_prompts(),
        }
    }
}

impl ShellConfig {
    #[must_use]
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    #[must_use]
    pub fn command_deadline(&self) -> Option<Duration> {
        self.command_deadline_secs.map(Duration::from_secs)
    }

    #[must_use]
    pub fn relay_drain(&self) -> Duration {
        Duration::from_millis(self.relay_drain_ms)
    }
}
