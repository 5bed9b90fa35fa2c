//! rudderd — the Rudder GitOps agent.
//!
//! Watches a desired-state tree, plans deployment pipelines for every
//! configured application and drives them to completion, serving the
//! command API on the side.
//!
//! # Usage
//!
//! ```text
//! rudderd run --config /etc/rudder/rudderd.toml
//! rudderd check --config /etc/rudder/rudderd.toml
//! ```

use std::path::PathBuf;

use anyhow::bail;
use clap::{Parser, Subcommand, ValueEnum};
use rudder_core::DaemonConfig;
use rudderd::{Daemon, check_config};
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "rudderd", about = "Rudder GitOps continuous delivery agent")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the agent.
    Run {
        /// Path to the configuration file.
        #[arg(long, default_value = "rudderd.toml")]
        config: PathBuf,

        /// Override the API port.
        #[arg(long)]
        port: Option<u16>,

        /// Override the data directory.
        #[arg(long)]
        data_dir: Option<PathBuf>,

        /// Log output format.
        #[arg(long, value_enum, default_value_t = LogFormat::Text)]
        log_format: LogFormat,
    },
    /// Validate a configuration file and exit.
    Check {
        #[arg(long, default_value = "rudderd.toml")]
        config: PathBuf,

        /// Print the effective configuration, defaults filled in.
        #[arg(long)]
        print: bool,
    },
}

#[derive(Clone, Copy, PartialEq, Eq, ValueEnum)]
enum LogFormat {
    Text,
    Json,
}

fn init_tracing(format: LogFormat) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,rudderd=debug,rudder=debug"));
    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    match format {
        LogFormat::Text => builder.init(),
        LogFormat::Json => builder.json().init(),
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Command::Run {
            config,
            port,
            data_dir,
            log_format,
        } => {
            init_tracing(log_format);
            let mut daemon_config = DaemonConfig::from_file(&config)?;
            if let Some(port) = port {
                daemon_config.server.port = port;
            }
            if let Some(data_dir) = data_dir {
                daemon_config.storage.data_dir = data_dir;
            }
            run(daemon_config, config).await
        }
        Command::Check { config, print } => {
            init_tracing(LogFormat::Text);
            let daemon_config = DaemonConfig::from_file(&config)?;
            if print {
                print!("{}", daemon_config.to_toml_string()?);
            }
            let problems = check_config(&daemon_config);
            if problems.is_empty() {
                println!(
                    "{}: ok ({} applications)",
                    config.display(),
                    daemon_config.applications.len()
                );
                return Ok(());
            }
            for problem in &problems {
                println!("{problem}");
            }
            bail!("{}: {} problems found", config.display(), problems.len())
        }
    }
}

async fn run(config: DaemonConfig, path: PathBuf) -> anyhow::Result<()> {
    info!(config = ?path, "Rudder agent starting");

    for problem in check_config(&config) {
        error!(%problem, "configuration problem");
    }

    let daemon = Daemon::start(&config).await?;
    info!(
        instance = %daemon.scheduler.instance_id(),
        applications = config.applications.len(),
        resumed = daemon.recovery.resumed.len(),
        released = daemon.recovery.released_markers.len(),
        owned_elsewhere = daemon.recovery.owned_elsewhere.len(),
        "scheduler started"
    );

    daemon
        .serve(async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                error!(error = %e, "failed to listen for shutdown signal");
                std::future::pending::<()>().await;
            }
            info!("shutdown signal received");
        })
        .await
}
