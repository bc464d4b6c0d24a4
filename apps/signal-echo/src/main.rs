use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tracing::info;
use tracing_subscriber::EnvFilter;
use transport_negotiation::RtcSessionFactory;

use signal_echo::cli::{self, Cli, Commands};
use signal_echo::config::Config;
use signal_echo::handlers::AppState;

#[tokio::main]
async fn main() -> Result<()> {
    // Default to WARN when RUST_LOG is unset.
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")),
        )
        .init();

    let cli = Cli::parse();
    match cli.command {
        Some(Commands::Probe {
            url,
            channel,
            message,
            timeout_secs,
        }) => cli::run_probe(url, channel, message, timeout_secs).await,
        Some(Commands::Serve { port }) => serve(port).await,
        None => serve(None).await,
    }
}

async fn serve(port: Option<u16>) -> Result<()> {
    let mut config = Config::from_env();
    if let Some(port) = port {
        config.port = port;
    }
    info!(
        port = config.port,
        prefix = %config.prefix,
        ttl_secs = config.session_ttl.as_secs(),
        portal_slots = config.portal_slots,
        "starting signal echo server"
    );

    let state = AppState::new(config.clone(), Arc::new(RtcSessionFactory));
    let app = signal_echo::router(state.clone());

    let addr = format!("0.0.0.0:{}", config.port);
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("binding {addr}"))?;
    info!("signal echo listening on {addr}");

    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
        })
        .await
        .context("serving")?;
    state.echo_sessions().close_all().await;
    Ok(())
}
