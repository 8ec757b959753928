//! One-shot ingestion: canonical MusicBrainz CSV -> optimized offline
//! database with the HOT/COLD partition, cleaned columns and indices.

use std::path::PathBuf;

use anyhow::Result;
use clap::Parser;

use trackmatch::config::AppDirs;
use trackmatch::ingest::build_store;
use trackmatch::progress::Reporter;

/// Build the optimized offline database from the canonical recording CSV.
#[derive(Parser)]
#[command(name = "build-db")]
#[command(about = "Build the optimized MusicBrainz database for trackmatch")]
struct Args {
    /// Canonical recording CSV (already decompressed)
    canonical_csv: PathBuf,

    /// Output database path (default: the trackmatch data directory)
    #[arg(long)]
    output: Option<PathBuf>,

    /// Disable progress bars, use log output only (for background runs)
    #[arg(long)]
    log_only: bool,
}

fn main() -> Result<()> {
    let args = Args::parse();
    let reporter = Reporter::from_flag(args.log_only);
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let output = match args.output {
        Some(path) => path,
        None => {
            let dirs = AppDirs::resolve();
            std::fs::create_dir_all(&dirs.data_dir)?;
            dirs.offline_db_path()
        }
    };

    let report = build_store(&args.canonical_csv, &output, reporter)?;
    eprintln!(
        "[DONE] {} recordings ({} hot, {} cold, threshold {}) -> {}",
        report.total,
        report.hot,
        report.cold,
        report.threshold,
        output.display()
    );
    Ok(())
}
