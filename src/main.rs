use anyhow::Result;
use clap::Parser;
use spiral_bridge::{config::Config, supervisor::Supervisor};
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "spiral-bridge", about = "Conscious-state ⇄ planner sync bridge")]
struct Cli {
    /// Load environment from this file instead of ./.env
    #[arg(long)]
    env_file: Option<String>,

    /// Run one full reconciliation pass and exit
    #[arg(long)]
    reconcile_once: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    if let Some(path) = &cli.env_file {
        dotenvy::from_path(path)?;
    }

    info!("Starting Spiral Bridge sync service");

    let config = Config::load()?;
    let supervisor = Supervisor::new(config);

    if cli.reconcile_once {
        supervisor.reconcile_once().await?;
        info!("Reconciliation pass complete");
        return Ok(());
    }

    supervisor.run().await?;
    Ok(())
}
