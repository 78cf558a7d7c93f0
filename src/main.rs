//! The slurmlink sidecar binary.

use std::io::IsTerminal;
use std::io::stderr;
use std::path::PathBuf;

use anyhow::Context;
use clap::Parser;
use clap_verbosity_flag::InfoLevel;
use clap_verbosity_flag::Verbosity;
use colored::Colorize;
use slurmlink::config::Config;
use slurmlink::registry::JobRegistry;
use slurmlink::server;
use slurmlink::workdir;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Path to the sidecar configuration file.
    #[arg(short, long, value_name = "CONFIG")]
    config: Option<PathBuf>,

    /// Host to bind to.
    #[arg(long)]
    host: Option<String>,

    /// Port to bind to.
    #[arg(long)]
    port: Option<u16>,

    #[command(flatten)]
    verbosity: Verbosity<InfoLevel>,
}

pub async fn inner() -> anyhow::Result<()> {
    let cli = Cli::parse();

    match std::env::var("RUST_LOG") {
        Ok(_) => {
            let subscriber = tracing_subscriber::fmt()
                .with_env_filter(EnvFilter::from_default_env())
                .with_ansi(stderr().is_terminal())
                .finish();

            tracing::subscriber::set_global_default(subscriber)?;
        }
        Err(_) => {
            let subscriber = tracing_subscriber::fmt()
                .with_max_level(cli.verbosity)
                .with_ansi(stderr().is_terminal())
                .finish();

            tracing::subscriber::set_global_default(subscriber)?;
        }
    };

    let mut config = match &cli.config {
        Some(path) => Config::from_file(path)?,
        None => Config::default(),
    };

    if let Some(host) = cli.host {
        config.server.host = host;
    }

    if let Some(port) = cli.port {
        config.server.port = port;
    }

    workdir::ensure_root(&config.slurm).context("failed to create the data root directory")?;

    let registry =
        JobRegistry::recover(&config.slurm).context("failed to recover the job registry")?;

    server::run(config, registry).await
}

#[tokio::main]
pub async fn main() {
    if let Err(e) = inner().await {
        eprintln!(
            "{error}: {e:?}",
            error = if std::io::stderr().is_terminal() {
                "error".red().bold()
            } else {
                "error".normal()
            }
        );
        std::process::exit(1);
    }
}
