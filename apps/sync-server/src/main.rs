//! Room replay sync server
//! Clients connect over WebSocket to `/room/<roomID>`, push mutations and
//! receive pokes as the room replays them.

mod connection;

use anyhow::Context;
use clap::{Parser, ValueEnum};
use replication::{FrameMode, MutatorRegistry, Server, ServerConfig};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use storage::{Backend, MemBackend, SqliteBackend};
use tokio::net::TcpListener;
use tracing::info;
use tracing_subscriber::EnvFilter;

const DEFAULT_LOG_FILTER: &str = "sync_server=debug,replication=debug,storage=info";

#[derive(Parser)]
#[command(name = "sync-server")]
#[command(about = "Real-time sync server replaying client mutations per room")]
#[command(version)]
struct Cli {
    /// Address to listen on
    #[arg(long, default_value = "127.0.0.1:8080")]
    addr: SocketAddr,

    /// SQLite database file. Rooms live in memory when omitted.
    #[arg(long)]
    db: Option<PathBuf>,

    /// Milliseconds between scheduling a turn and running it
    #[arg(long, default_value = "16")]
    turn_interval_ms: u64,

    #[arg(long, value_enum, default_value = "tick")]
    frame_mode: FrameModeArg,

    /// How far behind real time span frames run
    #[arg(long, default_value = "100")]
    straggler_delay_ms: u64,
}

#[derive(Clone, Copy, Debug, ValueEnum)]
enum FrameModeArg {
    /// Everything pending in one frame per turn
    Tick,
    /// Fixed 1/60 s frames, delayed by --straggler-delay-ms
    Span,
}

impl Cli {
    fn config(&self) -> ServerConfig {
        let frame_mode = match self.frame_mode {
            FrameModeArg::Tick => FrameMode::Tick,
            FrameModeArg::Span => FrameMode::Span {
                delay: Duration::from_millis(self.straggler_delay_ms),
            },
        };
        ServerConfig::new()
            .with_turn_interval(Duration::from_millis(self.turn_interval_ms))
            .with_frame_mode(frame_mode)
    }

    fn backend(&self) -> anyhow::Result<Arc<dyn Backend>> {
        match &self.db {
            Some(path) => {
                let backend = SqliteBackend::open_or_create(path)
                    .with_context(|| format!("opening database {}", path.display()))?;
                info!("Storing rooms in {}", path.display());
                Ok(Arc::new(backend))
            }
            None => {
                info!("Storing rooms in memory");
                Ok(Arc::new(MemBackend::new()))
            }
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Initialize tracing
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_LOG_FILTER));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let config = cli.config();
    info!("Turn config: {:?}", config);
    let server = Server::new(cli.backend()?, MutatorRegistry::with_builtins(), config);

    let listener = TcpListener::bind(cli.addr).await?;
    info!("Sync server listening on: {}", cli.addr);

    while let Ok((stream, addr)) = listener.accept().await {
        info!("New connection from: {}", addr);
        tokio::spawn(connection::handle_connection(stream, addr, server.clone()));
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cli_defaults() {
        let cli = Cli::parse_from(["sync-server"]);
        assert!(cli.db.is_none());
        assert_eq!(cli.config(), ServerConfig::default().with_turn_interval(Duration::from_millis(16)));
    }

    #[test]
    fn test_cli_span_mode() {
        let cli = Cli::parse_from([
            "sync-server",
            "--frame-mode",
            "span",
            "--straggler-delay-ms",
            "250",
            "--turn-interval-ms",
            "5",
        ]);
        let config = cli.config();
        assert_eq!(config.turn_interval, Duration::from_millis(5));
        assert_eq!(
            config.frame_mode,
            FrameMode::Span {
                delay: Duration::from_millis(250)
            }
        );
    }
}
