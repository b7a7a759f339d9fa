//! Configuration loading and types

use std::path::PathBuf;

use eyre::{bail, eyre};
use nodeshell_exec::{ConnectionParameters, KeySource, NodeId, ShellConfig};
use serde::{Deserialize, Serialize};

/// Top-level configuration for nodeshell
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// Executor tunables
    #[serde(default)]
    pub shell: ShellConfig,
    /// Keys used to authenticate
    #[serde(default)]
    pub identity: IdentityConfig,
    /// Logging settings
    #[serde(default)]
    pub log: LogConfig,
    /// Node registry
    #[serde(default)]
    pub node: Vec<NodeConfig>,
}

/// Private keys offered to every node
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct IdentityConfig {
    /// Path to the primary private key (defaults to `~/.ssh/id_rsa`)
    pub key_path: Option<PathBuf>,
    /// Environment variable holding a base64 key; wins over `key_path`
    pub key_env: Option<String>,
    /// Further keys, tried after the primary one
    #[serde(default)]
    pub extra_keys: Vec<PathBuf>,
}

impl IdentityConfig {
    /// Source of the primary key
    ///
    /// # Errors
    /// Returns error if no key is configured and the home directory is unknown
    pub fn key_source(&self) -> eyre::Result<KeySource> {
        if let Some(var) = &self.key_env {
            return Ok(KeySource::Env(var.clone()));
        }
        if let Some(path) = &self.key_path {
            return Ok(KeySource::Path(path.clone()));
        }
        let home = dirs::home_dir().ok_or_else(|| eyre!("cannot determine home directory"))?;
        Ok(KeySource::Path(home.join(".ssh").join("id_rsa")))
    }
}

/// Logging settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogConfig {
    /// Log level (trace, debug, info, warn, error); `RUST_LOG` overrides
    #[serde(default = "default_log_level")]
    pub level: String,
    /// Emit JSON lines instead of text
    #[serde(default)]
    pub json: bool,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            json: false,
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

/// One entry of the node registry
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeConfig {
    /// Node identifier reported back with each result
    pub id: u64,
    /// IP address or hostname for SSH connection
    pub host: String,
    /// SSH user (defaults to root)
    #[serde(default = "default_user")]
    pub user: String,
    #[serde(default = "default_port")]
    pub port: u16,
}

fn default_user() -> String {
    "root".to_string()
}

fn default_port() -> u16 {
    22
}

impl NodeConfig {
    #[must_use]
    pub fn params(&self) -> ConnectionParameters {
        ConnectionParameters::new(NodeId(self.id), &self.host, &self.user).with_port(self.port)
    }
}

impl Config {
    /// Load configuration from file
    ///
    /// # Errors
    /// Returns error if file cannot be read or parsed
    pub fn load(path: &PathBuf) -> eyre::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Config = toml::from_str(&content)?;
        Ok(config)
    }

    /// Load from default paths or use defaults
    ///
    /// # Errors
    /// Returns error if a config file exists but cannot be read or parsed
    pub fn load_default() -> eyre::Result<Self> {
        // Check environment variable
        if let Ok(path) = std::env::var("NODESHELL_CONFIG") {
            return Self::load(&PathBuf::from(path));
        }

        // Try common paths
        let paths = [
            PathBuf::from("nodeshell.toml"),
            PathBuf::from("/etc/nodeshell/nodeshell.toml"),
            dirs::config_dir()
                .map(|p| p.join("nodeshell/nodeshell.toml"))
                .unwrap_or_default(),
        ];

        for path in paths {
            if path.is_file() {
                return Self::load(&path);
            }
        }

        Ok(Config::default())
    }

    /// Nodes picked by id, or every node when `all` is set
    ///
    /// # Errors
    /// Returns error for unknown ids or an empty selection
    pub fn select_nodes(&self, ids: &[u64], all: bool) -> eyre::Result<Vec<&NodeConfig>> {
        if all {
            if self.node.is_empty() {
                bail!("no nodes configured");
            }
            return Ok(self.node.iter().collect());
        }
        if ids.is_empty() {
            bail!("no nodes selected, pass --node <ID> or --all");
        }

        ids.iter()
            .map(|id| {
                self.node
                    .iter()
                    .find(|n| n.id == *id)
                    .ok_or_else(|| eyre!("unknown node {id}"))
            })
            .collect()
    }

    /// Host name of a node, for reporting
    #[must_use]
    pub fn host_of(&self, node: NodeId) -> &str {
        self.node
            .iter()
            .find(|n| n.id == node.0)
            .map_or("?", |n| n.host.as_str())
    }
}
