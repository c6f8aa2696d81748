//! Interop deployment entry point.

use std::path::PathBuf;

use clap::{Parser, Subcommand};
use log::{error, info};

use interop_deploy::config::Config;
use interop_deploy::remote::agent;
use interop_deploy::{DeployError, Deployment, Implementation, RunPaths};

#[derive(Parser)]
#[command(version, about = "Deploys interop test containers")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Start simulator, server and client idling for manual debugging.
    Debug {
        #[arg(long)]
        client_image: String,
        #[arg(long)]
        server_image: String,
        #[arg(long, default_value = "certs")]
        certs: PathBuf,
        #[arg(long, default_value = "www")]
        www: PathBuf,
        #[arg(long, default_value = "downloads")]
        downloads: PathBuf,
        #[arg(long, default_value = "logs")]
        logs: PathBuf,
    },
    /// Companion mode: handle one request from stdin, answer on stdout.
    Agent,
}

fn implementation(image: String) -> Implementation {
    Implementation {
        name: image.clone(),
        image,
        image_id: String::new(),
        image_repo_digests: Vec::new(),
        image_versions: Vec::new(),
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Initialize logging; stdout belongs to the agent protocol
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let (client_image, server_image, paths) = match cli.command {
        Command::Agent => return agent::run_stdio().await,
        Command::Debug {
            client_image,
            server_image,
            certs,
            www,
            downloads,
            logs,
        } => (
            client_image,
            server_image,
            RunPaths {
                certs,
                www,
                downloads,
                logs,
            },
        ),
    };

    // Load configuration
    let cfg = Config::load()?;
    info!("Starting debug session with config: {:?}", cfg);
    std::fs::create_dir_all(&paths.downloads)?;
    std::fs::create_dir_all(&paths.logs)?;

    let deployment = Deployment::new(cfg).await?;
    match deployment
        .run_debug_setup(
            &implementation(client_image),
            &implementation(server_image),
            &paths,
        )
        .await
    {
        Ok(result) => info!("Debug session over: {}", result),
        Err(DeployError::Interrupted) => info!("Received Ctrl+C, debug session stopped."),
        Err(e) => {
            error!("Debug session failed: {}", e);
            return Err(e.into());
        }
    }

    info!("Shutdown complete.");
    Ok(())
}
