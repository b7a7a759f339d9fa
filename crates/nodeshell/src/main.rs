//! nodeshell CLI
//!
//! Runs a shell command on cluster nodes over SSH and reports each node's exit status

use std::path::PathBuf;

use clap::{Parser, Subcommand};
use color_eyre::Result;
use tracing_subscriber::EnvFilter;

mod config;
mod prompt;
mod run;

use config::{Config, LogConfig};

#[derive(Parser)]
#[command(name = "nodeshell")]
#[command(about = "Run shell commands on cluster nodes over SSH", long_about = None)]
struct Cli {
    /// Configuration file (defaults to NODESHELL_CONFIG or the standard locations)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a command on nodes
    #[command(name = "run")]
    Run {
        /// Node id to run on (repeatable)
        #[arg(short, long = "node")]
        nodes: Vec<u64>,
        /// Run on every configured node
        #[arg(long)]
        all: bool,
        /// Never prompt for passphrases
        #[arg(long)]
        batch: bool,
        /// Command line executed by the remote shell
        command: String,
    },
    /// List configured nodes
    #[command(name = "nodes")]
    Nodes,
}

fn init_tracing(log: &LogConfig) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&log.level));
    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr);

    if log.json {
        subscriber.json().init();
    } else {
        subscriber.init();
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    color_eyre::install()?;
    let cli = Cli::parse();

    let config = match &cli.config {
        Some(path) => Config::load(path)?,
        None => Config::load_default()?,
    };
    init_tracing(&config.log);
    tracing::debug!(nodes = config.node.len(), "configuration loaded");

    match cli.command {
        Commands::Nodes => {
            for node in &config.node {
                println!("{}\t{}@{}:{}", node.id, node.user, node.host, node.port);
            }
        }
        Commands::Run {
            nodes,
            all,
            batch,
            command,
        } => {
            let request = run::RunRequest {
                nodes: &nodes,
                all,
                command: &command,
                batch,
            };
            let code = run::run(&config, &request).await?;
            if code != 0 {
                std::process::exit(code);
            }
        }
    }

    Ok(())
}
