mod churn;
mod common;
mod events;
mod fanout;
mod ping;

use clap::{Parser, Subcommand};
use std::time::Instant;

#[derive(Parser)]
#[command(name = "mbus-sim", about = "Simulated context trees for the messaging bus")]
struct Cli {
    /// Nesting depth below the root context.
    #[arg(long, default_value = "2")]
    depth: u32,

    /// Children per context.
    #[arg(long, default_value = "3")]
    fanout: u32,

    /// Seed for random choices (silent peers). Random if omitted.
    #[arg(long)]
    seed: Option<u64>,

    /// How long to wait for discovery to converge, in ms.
    #[arg(long, default_value = "5000")]
    settle: u64,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Root requests every peer in turn and reports round trips.
    Ping {
        /// Rounds over all peers.
        #[arg(long, default_value = "10")]
        count: u32,
    },

    /// Request-to-all with some peers never answering.
    Fanout {
        /// Number of peers that stay silent.
        #[arg(long, default_value = "0")]
        silent: u32,
        /// Keep silent peers as timed-out entries instead of failing.
        #[arg(long)]
        partial: bool,
        /// Per-request timeout in ms.
        #[arg(long, default_value = "1000")]
        timeout: u64,
    },

    /// Close and reopen a leaf context, watching the root's peer list.
    Churn {
        /// Close/reopen cycles.
        #[arg(long, default_value = "5")]
        rounds: u32,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "warn".into()),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let start = Instant::now();

    eprintln!("mbus-sim v{}", env!("CARGO_PKG_VERSION"));

    let shape = common::TreeShape {
        depth: cli.depth,
        fanout: cli.fanout,
        settle_ms: cli.settle,
    };

    match cli.command {
        Command::Ping { count } => {
            ping::run(shape, ping::PingConfig { count }, start).await?;
        }

        Command::Fanout {
            silent,
            partial,
            timeout,
        } => {
            fanout::run(
                shape,
                fanout::FanoutConfig {
                    silent,
                    partial,
                    timeout_ms: timeout,
                    seed: cli.seed.unwrap_or_else(rand::random),
                },
                start,
            )
            .await?;
        }

        Command::Churn { rounds } => {
            churn::run(shape, churn::ChurnConfig { rounds }, start).await?;
        }
    }

    Ok(())
}
