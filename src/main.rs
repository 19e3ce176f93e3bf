use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing_subscriber::{fmt, EnvFilter};

use flagwatch::config::Config;
use flagwatch::export::health::HealthMetrics;
use flagwatch::store::memory::MemoryStores;
use flagwatch::ClientMetricsService;

/// Client metrics aggregation service for feature-flag SDKs.
#[derive(Parser)]
#[command(name = "flagwatch", about)]
struct Cli {
    /// Path to the YAML configuration file. Defaults apply when omitted.
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Logging verbosity level (trace, debug, info, warn, error). Overrides
    /// `log_level` from the configuration file.
    #[arg(long)]
    log_level: Option<String>,

    #[command(subcommand)]
    command: Option<Command>,
}

impl Cli {
    /// `--log-level` when given, otherwise the configured level.
    fn log_level<'a>(&'a self, cfg: &'a Config) -> &'a str {
        self.log_level.as_deref().unwrap_or(&cfg.log_level)
    }
}

#[derive(Subcommand)]
enum Command {
    /// Print version information and exit.
    Version,
    /// Validate the configuration file and exit.
    CheckConfig,
}

/// Build-time version info.
mod version {
    /// Release version string (set at build time).
    pub const RELEASE: &str = env!("CARGO_PKG_VERSION");

    /// Git commit hash (set at build time via env, or "unknown").
    pub fn git_commit() -> &'static str {
        option_env!("GIT_COMMIT").unwrap_or("unknown")
    }

    /// Full version string with platform info.
    pub fn full() -> String {
        format!(
            "{} (commit: {}, {}/{})",
            RELEASE,
            git_commit(),
            std::env::consts::OS,
            std::env::consts::ARCH,
        )
    }
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    if let Some(Command::Version) = &cli.command {
        println!("flagwatch {}", version::full());
        return Ok(());
    }

    let cfg = match &cli.config {
        Some(path) => Config::load(path)
            .with_context(|| format!("loading config from {}", path.display()))?,
        None => {
            let cfg = Config::default();
            cfg.validate().context("validating default config")?;
            cfg
        }
    };

    if let Some(Command::CheckConfig) = &cli.command {
        println!("configuration ok");
        return Ok(());
    }

    let level = cli.log_level(&cfg);
    let filter =
        EnvFilter::try_new(level).with_context(|| format!("invalid log level: {level}"))?;

    fmt().with_env_filter(filter).with_target(true).init();

    tracing::info!(
        version = version::RELEASE,
        commit = version::git_commit(),
        "starting flagwatch",
    );

    let rt = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("building tokio runtime")?;

    rt.block_on(run(cfg))
}

async fn run(cfg: Config) -> Result<()> {
    let (shutdown_tx, shutdown_rx) = tokio::sync::oneshot::channel::<()>();

    let mut sigterm = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
        .context("registering SIGTERM handler")?;

    tokio::spawn(async move {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                tracing::info!("received SIGINT, shutting down");
            }
            _ = sigterm.recv() => {
                tracing::info!("received SIGTERM, shutting down");
            }
        }

        let _ = shutdown_tx.send(());
    });

    let health =
        Arc::new(HealthMetrics::new(&cfg.health.addr).context("creating health metrics")?);
    health.start().await.context("starting health server")?;

    let service = ClientMetricsService::new(cfg, MemoryStores::new(), Some(Arc::clone(&health)));
    service.start().await.context("starting client metrics service")?;

    let _ = shutdown_rx.await;

    service.shutdown().await;
    health.stop().await?;

    tracing::info!("flagwatch stopped");

    Ok(())
}
