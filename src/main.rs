//! Binary entry-point for the TCP proxy.

use anyhow::Result;
use clap::Parser;
use tokio::net::TcpListener;
use tracing::{error, info};
use tracing_subscriber::{filter::LevelFilter, fmt, EnvFilter};

use tcpproxy::config::Cli;
use tcpproxy::engine::Engine;
use tcpproxy::mgmt;

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let default_level = if cli.debug { LevelFilter::DEBUG } else { LevelFilter::INFO };
    fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive(default_level.into()))
        .init();

    let engine = Engine::with_settings(
        cli.listen_address.clone(),
        cli.remote_address.clone(),
        cli.settings(),
    )?;

    if let Some(mgmt_addr) = cli.mgmt_listen_addr.clone() {
        let router = mgmt::router(engine.clone());
        let mgmt_listener = TcpListener::bind(&mgmt_addr).await?;
        info!(addr = %mgmt_addr, "management interface listening");
        tokio::spawn(async move {
            if let Err(e) = axum::serve(mgmt_listener, router).await {
                error!("management server exited with error: {e}");
            }
        });
    }

    let engine_for_signal = engine.clone();
    tokio::select! {
        res = engine.run() => {
            if let Err(e) = res {
                error!("proxy exited with error: {e}");
                std::process::exit(1);
            }
        }
        _ = tokio::signal::ctrl_c() => {
            info!("shutdown signal received (Ctrl-C)");
            if let Err(e) = engine_for_signal.shutdown().await {
                error!("error waiting for connections to drain: {e}");
            }
        }
    }

    Ok(())
}
