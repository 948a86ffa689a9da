use anyhow::{Context, Result};
use clap::Parser;
use tokio::net::TcpListener;
use tracing::{info, warn};

use cluster_mesh::{
    cli::{Cli, Command},
    cluster::ClusterService,
    config::ClusterConfig,
    discovery::DiscoveryService,
};

fn init_tracing() {
    use tracing_subscriber::{fmt, EnvFilter};

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = fmt().with_env_filter(filter).with_target(false).try_init();
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();

    let cli = Cli::parse();
    match cli.command {
        Command::Node(args) => run_node(args.into_config()).await?,
        Command::Discovery(args) => {
            let config = args.into_config();
            let listener = TcpListener::bind(config.listen)
                .await
                .with_context(|| format!("failed to bind {}", config.listen))?;
            let service = DiscoveryService::new(listener, config);
            info!("discovery listening on {}", service.local_addr()?);
            if let Err(err) = service.run_until_ctrl_c().await {
                warn!("discovery exited with error: {err:?}");
                return Err(err);
            }
        }
    }

    Ok(())
}

/// Runs one node until Ctrl-C, reporting every leadership verdict. The
/// playback side that would react to them lives elsewhere.
async fn run_node(config: ClusterConfig) -> Result<()> {
    let node = ClusterService::start(config).await?;
    info!(id = node.id(), address = node.address(), "node is up");

    let mut leadership = node.leadership();
    loop {
        tokio::select! {
            result = tokio::signal::ctrl_c() => {
                if let Err(err) = result {
                    warn!(error = ?err, "failed to install ctrl-c handler");
                }
                break;
            }
            changed = leadership.changed() => {
                if changed.is_err() {
                    break;
                }
                let decision = *leadership.borrow_and_update();
                match decision {
                    Some(true) => info!("switching to leader mode"),
                    Some(false) => info!("switching to follower mode"),
                    None => {}
                }
            }
        }
    }

    node.shutdown().await
}
