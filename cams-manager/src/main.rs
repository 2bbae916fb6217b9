mod check;

use anyhow::Context;
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use stream_recorder::{Config, Manager};

#[derive(Parser, Debug)]
#[command(name = "cams-manager")]
#[command(about = "Record RTSP camera streams to per-minute files")]
#[command(version)]
struct Args {
    /// Path to config.toml
    #[arg(short, long, default_value = "config.toml")]
    config: PathBuf,

    /// Enable debug logging (RUST_LOG takes precedence)
    #[arg(short, long)]
    verbose: bool,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Record all configured streams until interrupted (default)
    Run,

    /// Verify ffmpeg, ffprobe and the configuration, then exit
    Check,
}

fn main() {
    let args = Args::parse();

    if let Some(Commands::Check) = args.command {
        let passed = check::run(&args.config);
        std::process::exit(if passed { 0 } else { 1 });
    }

    init_logging(args.verbose);

    if let Err(e) = run(&args) {
        tracing::error!("{:#}", e);
        eprintln!("Error: {:#}", e);
        std::process::exit(1);
    }
}

fn init_logging(verbose: bool) {
    let default_level = if verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| default_level.into()),
        )
        .with_target(true)
        .init();
}

fn run(args: &Args) -> anyhow::Result<()> {
    let config = Config::load(&args.config)
        .with_context(|| format!("failed to load {}", args.config.display()))?;

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("failed to build tokio runtime")?;

    runtime.block_on(async {
        tracing::info!(version = env!("CARGO_PKG_VERSION"), "starting cams-manager");

        let mut manager = Manager::new(&config).context("failed to set up streams")?;
        manager.start();

        wait_for_shutdown().await;

        manager.stop().await;
        Ok::<(), anyhow::Error>(())
    })
}

/// Resolve on SIGINT or SIGTERM
async fn wait_for_shutdown() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "failed to listen for ctrl-c");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => tracing::info!("received interrupt"),
        _ = terminate => tracing::info!("received SIGTERM"),
    }
}
