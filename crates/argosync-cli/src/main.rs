use std::path::PathBuf;

use anyhow::{bail, Result};
use argosync_sync::{EntityOutcome, SyncConfig, SyncPipeline};
use clap::{Parser, Subcommand};
use tokio::sync::watch;
use tracing::warn;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "argosync")]
#[command(about = "Incremental Argo float sync and conversion")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
    /// Remote archive root, or a local mirror directory.
    #[arg(long, global = true)]
    base_url: Option<String>,
    #[arg(long, global = true)]
    dac: Option<String>,
    #[arg(long, global = true)]
    raw_root: Option<PathBuf>,
    #[arg(long, global = true)]
    out_root: Option<PathBuf>,
    #[arg(long, global = true)]
    concurrency: Option<usize>,
    /// Log at debug level unless RUST_LOG says otherwise.
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Sync the DAC once.
    Run,
    /// Show ledger and catalog counts.
    Status,
}

impl Cli {
    fn apply(&self, mut config: SyncConfig) -> SyncConfig {
        if let Some(base_url) = &self.base_url {
            config.base_url = base_url.clone();
        }
        if let Some(dac) = &self.dac {
            config.dac = dac.clone();
        }
        if let Some(raw_root) = &self.raw_root {
            config.raw_root = raw_root.clone();
        }
        if let Some(out_root) = &self.out_root {
            config.out_root = out_root.clone();
        }
        if let Some(concurrency) = self.concurrency {
            config.concurrency = concurrency.max(1);
        }
        config
    }
}

fn init_tracing(verbose: bool) {
    let default = if verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    let _ = tracing_subscriber::fmt().with_env_filter(filter).try_init();
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    let config = cli.apply(SyncConfig::from_env());
    match cli.command.unwrap_or(Commands::Run) {
        Commands::Run => {
            let (shutdown_tx, shutdown_rx) = watch::channel(false);
            tokio::spawn(async move {
                if tokio::signal::ctrl_c().await.is_ok() {
                    warn!("interrupt received, finishing in-flight floats");
                    let _ = shutdown_tx.send(true);
                }
            });

            let pipeline = SyncPipeline::new(config)?.with_shutdown(shutdown_rx);
            let summary = pipeline.run_once().await?;
            println!(
                "sync complete: run_id={} dac={} listed={} work={}",
                summary.run_id, summary.dac, summary.listed, summary.work
            );
            for outcome in EntityOutcome::ALL {
                let n = summary.count(outcome);
                if n > 0 {
                    println!("  {outcome}: {n}");
                }
            }
            if let Some(fatal) = &summary.fatal_error {
                bail!("sync aborted: {fatal}");
            }
            if !summary.ledger_persisted {
                bail!("ledger could not be persisted");
            }
        }
        Commands::Status => {
            let status = SyncPipeline::new(config)?.status().await?;
            println!(
                "ledger: {} floats ({} processed, {} failed, {} pending)",
                status.ledger_entries, status.processed, status.failed, status.pending
            );
            println!("catalog: {} rows", status.catalog_rows);
            if status.findings.is_empty() {
                println!("consistency: ok");
            } else {
                for finding in &status.findings {
                    println!("consistency: {}", finding.describe());
                }
            }
        }
    }

    Ok(())
}
