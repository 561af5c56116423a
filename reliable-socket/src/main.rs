//! Entry point for `reliable-socket`.
//!
//! Parses CLI arguments and dispatches into either **listen** or **connect**
//! mode.  All protocol work is delegated to the library; `main.rs` owns only
//! process setup (logging, argument parsing) and stdio plumbing.

use std::time::Duration;

use anyhow::Context;
use clap::{Args, Parser, Subcommand};
use reliable_socket::{Connection, ConnectionConfig, DeviationBasis, UdpChannel, MAX_PAYLOAD};
use tokio::io::{AsyncReadExt, AsyncWriteExt};

/// Reliable, ordered message channel over UDP.
#[derive(Parser)]
#[command(author, version, about)]
struct Cli {
    #[command(subcommand)]
    mode: Mode,
}

#[derive(Subcommand)]
enum Mode {
    /// Wait for one peer and copy everything it sends to stdout.
    Listen {
        /// UDP port to bind on all interfaces.
        #[arg(short, long, default_value_t = 9000)]
        port: u16,
        #[command(flatten)]
        tuning: Tuning,
    },
    /// Connect to a listener and stream stdin to it.
    Connect {
        /// Listener host name or address.
        host: String,
        #[arg(short, long, default_value_t = 9000)]
        port: u16,
        #[command(flatten)]
        tuning: Tuning,
    },
}

/// Connection tunables shared by both modes.
#[derive(Args)]
struct Tuning {
    /// Give up a handshake step or send after this many retransmissions.
    #[arg(long)]
    max_retransmits: Option<u32>,
    /// Retransmissions of CLOSE before releasing anyway.
    #[arg(long, default_value_t = 6)]
    close_retransmits: u32,
    /// Minimum time-wait in milliseconds.
    #[arg(long, default_value_t = 500)]
    time_wait_ms: u64,
    /// How long to wait for the peer's CLOSE after ours is acknowledged.
    #[arg(long, default_value_t = 30)]
    peer_close_timeout_secs: u64,
    /// Measure deviation against the updated mean instead of the prior one.
    #[arg(long)]
    updated_mean_deviation: bool,
}

impl Tuning {
    fn into_config(self) -> ConnectionConfig {
        let mut config = ConnectionConfig {
            max_retransmits: self.max_retransmits,
            close_retransmits: self.close_retransmits,
            peer_close_timeout: Duration::from_secs(self.peer_close_timeout_secs),
            min_time_wait: Duration::from_millis(self.time_wait_ms),
            ..ConnectionConfig::default()
        };
        if self.updated_mean_deviation {
            config.timer.deviation_basis = DeviationBasis::UpdatedMean;
        }
        config
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialise env_logger; set RUST_LOG to control verbosity.
    env_logger::init();

    let cli = Cli::parse();

    match cli.mode {
        Mode::Listen { port, tuning } => {
            log::info!("Listening on port {port}");
            let conn = Connection::listen_with(port, tuning.into_config())
                .await
                .with_context(|| format!("no connection established on port {port}"))?;
            sink_to_stdout(conn).await
        }
        Mode::Connect { host, port, tuning } => {
            log::info!("Connecting to {host}:{port}");
            let conn = Connection::connect_with(&host, port, tuning.into_config())
                .await
                .with_context(|| format!("could not connect to {host}:{port}"))?;
            stream_from_stdin(conn).await
        }
    }
}

async fn sink_to_stdout(mut conn: Connection<UdpChannel>) -> anyhow::Result<()> {
    let mut stdout = tokio::io::stdout();
    let mut total = 0usize;
    while let Some(payload) = conn.receive().await.context("receive failed")? {
        total += payload.len();
        stdout.write_all(&payload).await?;
    }
    stdout.flush().await?;
    log::info!("Peer finished after {total} bytes");
    conn.close().await.context("close failed")?;
    Ok(())
}

async fn stream_from_stdin(mut conn: Connection<UdpChannel>) -> anyhow::Result<()> {
    let mut stdin = tokio::io::stdin();
    let mut chunk = vec![0u8; MAX_PAYLOAD];
    let mut total = 0usize;
    loop {
        let n = stdin.read(&mut chunk).await.context("reading stdin")?;
        if n == 0 {
            break;
        }
        conn.send(&chunk[..n]).await.context("send failed")?;
        total += n;
    }
    log::info!("Sent {total} bytes; closing");
    conn.close().await.context("close failed")?;
    Ok(())
}
