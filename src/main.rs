use std::future::Future;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tokio::signal::unix::{signal, SignalKind};
use tracing_subscriber::{fmt, EnvFilter};

use apmflow::config::Config;
use apmflow::node::Node;

/// Streaming APM aggregation node.
#[derive(Parser)]
#[command(name = "apmflow", about)]
struct Cli {
    /// Path to the YAML configuration file.
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Log filter (trace, debug, info, warn, error or an EnvFilter
    /// directive). Overrides `log_level` from the config file.
    #[arg(long)]
    log_level: Option<String>,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand)]
enum Command {
    /// Print version information and exit.
    Version,
    /// Load and validate the config, print the cluster layout and exit.
    CheckConfig,
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    match &cli.command {
        Some(Command::Version) => {
            println!(
                "apmflow {} ({}/{})",
                env!("CARGO_PKG_VERSION"),
                std::env::consts::OS,
                std::env::consts::ARCH,
            );
            return Ok(());
        }
        Some(Command::CheckConfig) => return check_config(cli.config.as_deref()),
        None => {}
    }

    let cfg = load_config(cli.config.as_deref())?;

    let level = cli.log_level.as_deref().unwrap_or(&cfg.log_level);
    let filter =
        EnvFilter::try_new(level).with_context(|| format!("invalid log level: {level}"))?;
    fmt().with_env_filter(filter).with_target(true).init();

    tracing::info!(
        version = env!("CARGO_PKG_VERSION"),
        node = %cfg.node_name,
        members = cfg.cluster.members.len(),
        "starting apmflow",
    );

    let rt = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("building tokio runtime")?;

    rt.block_on(run(cfg))
}

fn load_config(path: Option<&Path>) -> Result<Config> {
    let path = path.context("--config is required (use --help for usage)")?;
    Config::load(path).with_context(|| format!("loading config from {}", path.display()))
}

fn check_config(path: Option<&Path>) -> Result<()> {
    let cfg = load_config(path)?;

    println!(
        "node {} listens on {}, advertises {}",
        cfg.node_name,
        cfg.cluster.listen_addr,
        cfg.cluster.advertised(),
    );
    for member in &cfg.cluster.members {
        println!("  member {} at {}", member.name, member.address);
    }
    println!(
        "roll-ups: hour={} day={}",
        cfg.downsampling.hour, cfg.downsampling.day
    );
    println!("config ok");

    Ok(())
}

async fn run(cfg: Config) -> Result<()> {
    // Handlers are registered before anything starts, so a signal during
    // startup is not lost.
    let shutdown = shutdown_signal()?;

    let mut node = Node::new(cfg)?;
    if let Err(e) = node.start().await {
        if let Err(stop_err) = node.stop().await {
            tracing::warn!(error = format!("{stop_err:#}"), "cleanup after failed start");
        }
        return Err(e);
    }

    shutdown.await;

    node.stop().await?;

    tracing::info!("apmflow stopped");

    Ok(())
}

/// Resolves on the first SIGINT or SIGTERM.
fn shutdown_signal() -> Result<impl Future<Output = ()>> {
    let mut sigterm = signal(SignalKind::terminate()).context("registering SIGTERM handler")?;

    Ok(async move {
        tokio::select! {
            res = tokio::signal::ctrl_c() => {
                if let Err(e) = res {
                    tracing::error!(error = %e, "listening for SIGINT");
                }
                tracing::info!("received SIGINT, shutting down");
            }
            _ = sigterm.recv() => {
                tracing::info!("received SIGTERM, shutting down");
            }
        }
    })
}
