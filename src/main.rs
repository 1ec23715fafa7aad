//! CLI entry point for the filer.

use anyhow::{Context, Result, anyhow};
use clap::Parser;
use filer_core::{Filer, FilerConfig, TransferContext, TransferMode};
use tracing::{debug, error, info, warn};
use tracing_subscriber::EnvFilter;

mod cli;

use cli::{Args, LogFormat};

fn init_tracing(args: &Args) {
    // Priority: RUST_LOG env var > --log-level / LOG_LEVEL > quiet flag > verbose flag > info
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(args.default_filter()));
    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    match args.log_format {
        LogFormat::Text => builder.init(),
        LogFormat::Json => builder.json().init(),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    // Parse CLI arguments first (before tracing, so --help works without logs)
    let args = Args::parse();
    init_tracing(&args);
    debug!(?args, "CLI arguments parsed");

    let result = run(args).await;
    if let Err(e) = &result {
        error!(error = format!("{e:#}"), "filer failed");
    }
    result
}

async fn run(args: Args) -> Result<()> {
    let config = FilerConfig::from_env()?;

    let mode = args
        .mode
        .or_else(|| config.mode.clone())
        .ok_or_else(|| anyhow!("no mode given (pass inputs, outputs or all, or set FILER_MODE)"))?
        .parse::<TransferMode>()?;
    let manifest = args
        .manifest
        .or_else(|| config.manifest_path.clone())
        .ok_or_else(|| anyhow!("no manifest given (pass --manifest or set POD_INFO_ANNOTATIONS_FILE)"))?;
    info!(%mode, manifest = %manifest.display(), "filer starting");

    let ctx = TransferContext::new();
    let canceller = ctx.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("interrupt received, cancelling transfers");
            canceller.cancel();
        }
    });

    let filer = Filer::build_from_file(&manifest, mode, config)
        .await
        .with_context(|| format!("failed to load manifest {}", manifest.display()))?
        .with_transfer_context(ctx);
    let stats = filer.transfer().await?;

    info!(
        transferred = stats.transferred,
        skipped_completed = stats.skipped_completed,
        skipped_missing = stats.skipped_missing,
        total = stats.total(),
        "filer complete"
    );
    Ok(())
}
