//! ingress: host-based reverse proxy
//!
//! Reads `INGRESS_*` environment variables and serves plain HTTP on :8080,
//! or with `--production`, ACME challenges on :80 and TLS on :443.

use clap::Parser;
use ingress::server::{self, CHALLENGE_ADDR, DEVELOPMENT_ADDR, TLS_ADDR};
use ingress::{Ingress, IngressTable, ProductionServer, Settings};
use std::sync::Arc;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser, Debug)]
#[command(name = "ingress", version, about = "Host-based HTTP/HTTPS ingress")]
struct Cli {
    /// Enable production mode (ACME certificates, ports 80 and 443)
    #[arg(long)]
    production: bool,
}

#[tokio::main]
async fn main() {
    // Initialize logging
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "ingress=info,tower_http=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let cli = Cli::parse();
    info!("Starting ingress v{}", env!("CARGO_PKG_VERSION"));

    if let Err(e) = run(cli).await {
        error!("{:#}", e);
        std::process::exit(1);
    }
}

async fn run(cli: Cli) -> anyhow::Result<()> {
    let config = Settings::from_env()?.into_config()?;
    let table = IngressTable::from_config(&config)?;
    let ingress = Arc::new(Ingress::new(table));

    if cli.production {
        ProductionServer::from_config(&config, ingress)?
            .run(CHALLENGE_ADDR, TLS_ADDR)
            .await?;
    } else {
        server::run_development(ingress, DEVELOPMENT_ADDR).await?;
    }

    Ok(())
}
