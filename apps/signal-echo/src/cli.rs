use std::time::Duration;

use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand};
use tokio::time::timeout;
use tracing::{debug, info};
use transport_negotiation::{
    ChannelOptions, HttpTransfer, PeerSession, Restriction, SessionConfig,
};
use url::Url;

#[derive(Parser, Debug)]
#[command(name = "signal-echo")]
#[command(about = "Signaling echo server and probe client for perfect negotiation")]
pub struct Cli {
    #[command(subcommand)]
    pub command: Option<Commands>,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Run the HTTP server (default when no command is given)
    Serve {
        /// Overrides SIGNAL_ECHO_PORT
        #[arg(short, long)]
        port: Option<u16>,
    },
    /// Connect to an echo endpoint over HTTP long-polling and send a message
    Probe {
        /// Echo endpoint, e.g. http://localhost:3000/test/echo/probe
        #[arg(default_value = "http://localhost:3000/test/echo/probe")]
        url: Url,

        /// Channel to open; the echo server answers on `echo`
        #[arg(short, long, default_value = "echo")]
        channel: String,

        /// Message to send once the channel is open
        #[arg(short, long, default_value = "hello")]
        message: String,

        /// Give up after this many seconds
        #[arg(long, default_value_t = 30, env = "SIGNAL_ECHO_PROBE_TIMEOUT_SECS")]
        timeout_secs: u64,
    },
}

pub async fn run_probe(url: Url, channel: String, message: String, timeout_secs: u64) -> Result<()> {
    let deadline = Duration::from_secs(timeout_secs);
    let session = PeerSession::connect(SessionConfig::from_env("probe"))
        .await
        .context("creating peer connection")?;
    let outcome = probe(&session, url, &channel, &message, deadline).await;
    session.close().await;
    outcome
}

async fn probe(
    session: &PeerSession,
    url: Url,
    channel: &str,
    message: &str,
    deadline: Duration,
) -> Result<()> {
    let transfer = HttpTransfer::new(url.clone()).with_timeout(deadline);
    session
        .open_channel(channel, ChannelOptions::default())
        .await
        .context("opening channel")?;
    debug!(%url, channel, "polling");
    timeout(deadline, session.connect_via(&transfer))
        .await
        .context("signaling timed out")?
        .context("signaling failed")?;

    let open = timeout(deadline, session.await_channel(channel, Restriction::Ours))
        .await
        .context("channel did not open in time")??;
    if let Some(report) = session.report_connection(false).await {
        println!("connected {}", report.summary());
    }

    open.send_text(message).await.context("sending")?;
    let reply = timeout(deadline, open.recv())
        .await
        .context("no reply in time")?;
    match reply {
        Some(payload) => {
            let text = payload
                .as_text()
                .map(str::to_string)
                .unwrap_or_else(|| format!("<{} bytes>", payload.len()));
            info!(channel, reply = %text, "probe reply");
            println!("{text}");
            Ok(())
        }
        None => bail!("channel closed before replying"),
    }
}
