use anyhow::Result;
use clap::{Parser, Subcommand};
use lxcsmith::build::Builder;
use lxcsmith::cluster::HttpClusterClient;
use lxcsmith::config::BuildConfig;
use lxcsmith::steps::ShellHook;
use std::path::PathBuf;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::warn;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "lxcsmith")]
#[command(version, about = "LXC template builder for Proxmox-style clusters")]
struct Cli {
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a container build end-to-end
    Build {
        /// Path to the build configuration file
        #[arg(long, default_value = "lxcsmith.toml")]
        config: PathBuf,

        /// Delete a pre-existing instance matching this build's id or
        /// hostname before creating the new one
        #[arg(long)]
        force: bool,
    },
    /// Load and validate a configuration file without touching the cluster
    Validate {
        #[arg(long, default_value = "lxcsmith.toml")]
        config: PathBuf,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let default_level = if cli.verbose { "debug" } else { "info" };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    match cli.command {
        Commands::Validate { config } => {
            let config = BuildConfig::load(&config)?;
            println!(
                "configuration valid: instance '{}' on node '{}'",
                config.hostname, config.connection.node
            );
            Ok(())
        }
        Commands::Build { config, force } => {
            let mut config = BuildConfig::load(&config)?;
            if force {
                config.force = true;
            }

            let client = HttpClusterClient::connect(&config.connection).await?;

            let cancel = CancellationToken::new();
            let signal_cancel = cancel.clone();
            tokio::spawn(async move {
                if tokio::signal::ctrl_c().await.is_ok() {
                    warn!("interrupt received, cancelling build");
                    signal_cancel.cancel();
                }
            });

            let hook = Arc::new(ShellHook::new(config.provisioners.clone()));
            let builder = Builder::new(config, Arc::new(client));
            let output = builder.run(hook, None, cancel).await?;

            println!("build finished: instance {}", output.instance);
            if !output.generated.is_null() {
                println!("{}", serde_json::to_string_pretty(&output.generated)?);
            }
            Ok(())
        }
    }
}
