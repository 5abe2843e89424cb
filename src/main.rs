use anyhow::{bail, Context};
use clap::{Parser, Subcommand};
use quickshare_daemon::{
    config::Settings,
    service::{DirectoryHandler, QuickshareDaemon},
    utils::format_file_size,
};
use std::path::PathBuf;
use std::time::Duration;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "quickshare-daemon")]
#[command(about = "Send files to peers on the local network")]
struct Cli {
    /// Configuration file path
    #[arg(short, long)]
    config: Option<String>,

    /// Verbose logging
    #[arg(short, long)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Announce this node and accept incoming files until interrupted
    Receive,
    /// Listen for announcements and list the peers heard
    Peers {
        /// Seconds to listen before printing
        #[arg(short, long, default_value_t = 3)]
        wait: u64,
    },
    /// Send a file to a peer's control port
    Send {
        /// Peer address as host:port
        target: String,
        file: PathBuf,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let log_level = if cli.verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(format!("quickshare_daemon={}", log_level)));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    info!("Quickshare daemon v{}", env!("CARGO_PKG_VERSION"));

    let settings = Settings::load(cli.config.as_deref()).context("Failed to load configuration")?;

    match cli.command {
        Command::Receive => receive(settings).await,
        Command::Peers { wait } => list_peers(settings, Duration::from_secs(wait)).await,
        Command::Send { target, file } => send(settings, &target, file).await,
    }
}

async fn receive(settings: Settings) -> anyhow::Result<()> {
    let receive_dir = settings.receive_dir();
    let handler = DirectoryHandler::new(&receive_dir)
        .on_start(|started| {
            info!(
                "Incoming {} ({})",
                started.filename,
                format_file_size(started.size)
            );
        })
        .on_complete(|outcome| {
            if outcome.ok {
                info!(
                    "Saved {:?} (sha256 {})",
                    outcome.save_path,
                    outcome.sha256.as_deref().unwrap_or("-")
                );
            } else {
                warn!(
                    "Failed to receive {}: {}",
                    outcome.filename,
                    outcome.error.as_deref().unwrap_or("unknown error")
                );
            }
        });

    let mut daemon = QuickshareDaemon::with_handler(settings, handler);
    daemon.start().await.context("Failed to start daemon")?;
    info!("Saving incoming files to {:?}", receive_dir);

    let signal_result = shutdown_signal().await;
    info!("Shutdown signal received, stopping daemon...");
    daemon.stop().await;

    signal_result.context("Failed to listen for shutdown signal")
}

async fn list_peers(settings: Settings, wait: Duration) -> anyhow::Result<()> {
    let mut daemon = QuickshareDaemon::new(settings);
    daemon.start().await.context("Failed to start daemon")?;

    tokio::time::sleep(wait).await;
    let peers = daemon.peers().await;
    daemon.stop().await;

    if peers.is_empty() {
        println!("No peers found");
    }
    for peer in peers {
        println!("{}\t{}", peer.name, peer.control_addr());
    }
    Ok(())
}

async fn send(settings: Settings, target: &str, file: PathBuf) -> anyhow::Result<()> {
    let (host, port) = parse_target(target)?;
    let daemon = QuickshareDaemon::new(settings);

    let report = daemon
        .send_file(&host, port, &file, |index, len| {
            info!("Sent chunk {} ({})", index, format_file_size(len as u64));
        })
        .await
        .with_context(|| format!("Failed to send {:?} to {}", file, target))?;

    if !report.digests_match() {
        error!(
            "Checksum mismatch: sent {}, peer stored {}",
            report.sha256, report.receiver_sha256
        );
        bail!("Peer stored different content than was sent");
    }

    println!(
        "Sent {} ({}) sha256 {}",
        file.display(),
        format_file_size(report.bytes_sent),
        report.sha256
    );
    Ok(())
}

fn parse_target(target: &str) -> anyhow::Result<(String, u16)> {
    let (host, port) = target
        .rsplit_once(':')
        .with_context(|| format!("Expected host:port, got {:?}", target))?;
    let port = port
        .parse::<u16>()
        .with_context(|| format!("Invalid port in {:?}", target))?;
    let host = host.trim_start_matches('[').trim_end_matches(']');
    if host.is_empty() {
        bail!("Missing host in {:?}", target);
    }
    Ok((host.to_string(), port))
}

async fn shutdown_signal() -> std::io::Result<()> {
    use tokio::signal;

    #[cfg(unix)]
    {
        let mut sigterm = signal::unix::signal(signal::unix::SignalKind::terminate())?;
        let mut sigint = signal::unix::signal(signal::unix::SignalKind::interrupt())?;

        tokio::select! {
            _ = sigterm.recv() => {},
            _ = sigint.recv() => {},
        }
        Ok(())
    }

    #[cfg(not(unix))]
    {
        signal::ctrl_c().await
    }
}
