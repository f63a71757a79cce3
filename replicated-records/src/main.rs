use anyhow::Result;
use clap::Parser;
use tokio::net::TcpListener;
use tracing::{info, warn};

use replicated_records::cli::Cli;
use replicated_records::config::NodeConfig;
use replicated_records::server::Server;

fn init_tracing() {
    use tracing_subscriber::{EnvFilter, fmt};

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = fmt().with_env_filter(filter).with_target(false).try_init();
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();

    let config = NodeConfig::from_cli(Cli::parse())?;
    let service = config.build_service()?;

    let listener = TcpListener::bind(config.listen).await?;
    let server = Server::new(listener, service);
    let addr = server.local_addr()?;
    info!(node = %config.name, "listening on {}", addr);

    if let Err(err) = server.run_until_ctrl_c().await {
        warn!("server exited with error: {err:?}");
        return Err(err);
    }
    Ok(())
}
