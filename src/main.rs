//! Batch CLI: resolve a play-history table against the offline corpus
//! and/or the iTunes Search API, then write the scrobble export.
//!
//! The input is an already-parsed record table (CSV with named columns);
//! schema sniffing and timestamp synthesis live outside this tool.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use anyhow::{bail, Context, Result};
use clap::Parser;
use crossbeam_channel::unbounded;
use tracing_subscriber::EnvFilter;

use trackmatch::batch::{BatchRunner, RunState, SHUTDOWN_DEADLINE};
use trackmatch::cache::{MappingCache, DEFAULT_LRU_CAPACITY};
use trackmatch::config::{AppDirs, MatchMode, ProviderMode, Settings};
use trackmatch::dispatch::DispatchOptions;
use trackmatch::export::{build_output_rows, write_rate_limited_csv, write_scrobble_csv};
use trackmatch::models::TrackQuery;
use trackmatch::online::OnlineResolver;
use trackmatch::progress::{format_eta, Reporter};

/// Resolve play-history tracks to canonical artist credits and write a
/// scrobble-ready CSV.
#[derive(Parser)]
#[command(name = "trackmatch")]
#[command(about = "Resolve play-history tracks to canonical artist credits")]
struct Args {
    /// Input CSV with Song Name / Container Artist Name / Container Album
    /// Name (or Title / Artist / Album) columns
    input: PathBuf,

    /// Output CSV path; the filename must contain "scrobble"
    /// (e.g. scrobbles.csv) so an input file can never be overwritten
    output: PathBuf,

    /// Path to the optimized MusicBrainz database (default: data dir)
    #[arg(long)]
    db: Option<PathBuf>,

    /// Resolver chain: offline-only, online-only, offline-then-online,
    /// online-then-offline (default: from settings)
    #[arg(long)]
    provider: Option<String>,

    /// Matching mode: normal or high-accuracy (default: from settings)
    #[arg(long)]
    mode: Option<String>,

    /// Worker pool width (default: from settings)
    #[arg(long)]
    workers: Option<usize>,

    /// Online rate limit in requests per minute (default: from settings)
    #[arg(long)]
    rpm: Option<u32>,

    /// Tracks per checkpoint window (default: from settings)
    #[arg(long)]
    checkpoint_interval: Option<usize>,

    /// Checkpoint file path (default: alongside the output)
    #[arg(long)]
    checkpoint: Option<PathBuf>,

    /// Where to write rate-limited tracks (default: alongside the output)
    #[arg(long)]
    rate_limited_out: Option<PathBuf>,

    /// Export run statistics to a JSON file
    #[arg(long)]
    export_stats: Option<PathBuf>,

    /// Disable progress bars, use log output only (for background runs)
    #[arg(long)]
    log_only: bool,
}

fn parse_provider(s: &str) -> Result<ProviderMode> {
    match s {
        "offline-only" | "offline_only" => Ok(ProviderMode::OfflineOnly),
        "online-only" | "online_only" => Ok(ProviderMode::OnlineOnly),
        "offline-then-online" | "offline_then_online" => Ok(ProviderMode::OfflineThenOnline),
        "online-then-offline" | "online_then_offline" => Ok(ProviderMode::OnlineThenOffline),
        other => bail!("unknown provider mode '{other}'"),
    }
}

fn parse_mode(s: &str) -> Result<MatchMode> {
    match s {
        "normal" => Ok(MatchMode::Normal),
        "high-accuracy" | "high_accuracy" => Ok(MatchMode::HighAccuracy),
        other => bail!("unknown matching mode '{other}'"),
    }
}

/// Input record columns, located once from the header row.
struct InputColumns {
    title: usize,
    artist: Option<usize>,
    album: Option<usize>,
    duration_ms: Option<usize>,
    timestamp: Option<usize>,
}

impl InputColumns {
    fn locate(headers: &csv::StringRecord) -> Result<InputColumns> {
        let find = |names: &[&str]| {
            headers.iter().position(|h| {
                let h = h.trim().to_ascii_lowercase();
                names.iter().any(|n| h == *n)
            })
        };
        let title = find(&["song name", "track", "title"])
            .context("input CSV has no Song Name / Track / Title column")?;
        Ok(InputColumns {
            title,
            artist: find(&["container artist name", "artist", "album artist"]),
            album: find(&["container album name", "album"]),
            duration_ms: find(&["duration (ms)", "media duration in milliseconds", "duration"]),
            timestamp: find(&["event end timestamp", "timestamp"]),
        })
    }
}

fn read_input(path: &Path) -> Result<(Vec<TrackQuery>, Vec<String>)> {
    let mut reader = csv::ReaderBuilder::new()
        .flexible(true)
        .from_path(path)
        .with_context(|| format!("opening input {}", path.display()))?;
    let columns = InputColumns::locate(&reader.headers()?.clone())?;

    let mut tracks = Vec::new();
    let mut timestamps = Vec::new();
    for record in reader.records() {
        let record = record?;
        let get = |idx: Option<usize>| {
            idx.and_then(|i| record.get(i))
                .map(str::trim)
                .filter(|s| !s.is_empty())
        };
        let Some(title) = record.get(columns.title).map(str::trim).filter(|s| !s.is_empty())
        else {
            continue;
        };
        tracks.push(TrackQuery {
            title: title.to_string(),
            artist_hint: get(columns.artist).map(str::to_string),
            album_hint: get(columns.album).map(str::to_string),
            duration_ms: get(columns.duration_ms).and_then(|s| s.parse().ok()),
        });
        timestamps.push(get(columns.timestamp).unwrap_or_default().to_string());
    }
    Ok((tracks, timestamps))
}

fn init_logging(settings: &Settings, dirs: &AppDirs) -> Option<tracing_appender::non_blocking::WorkerGuard> {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(settings.logging.level.clone()));
    if settings.logging.file {
        if std::fs::create_dir_all(&dirs.log_dir).is_ok() {
            let appender = tracing_appender::rolling::daily(&dirs.log_dir, "trackmatch.log");
            let (writer, guard) = tracing_appender::non_blocking(appender);
            tracing_subscriber::fmt()
                .with_env_filter(filter)
                .with_writer(writer)
                .with_ansi(false)
                .init();
            return Some(guard);
        }
    }
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
    None
}

fn main() -> Result<()> {
    let args = Args::parse();
    let reporter = Reporter::from_flag(args.log_only);

    let dirs = AppDirs::resolve();
    let settings_path = dirs.settings_path();
    let mut settings = Settings::load_or_default(&settings_path);
    let _log_guard = init_logging(&settings, &dirs);

    // CLI flags override the settings file for this run.
    if let Some(provider) = &args.provider {
        settings.provider = parse_provider(provider)?;
    }
    if let Some(mode) = &args.mode {
        settings.mode = parse_mode(mode)?;
    }
    if let Some(workers) = args.workers {
        settings.workers = workers.max(1);
    }
    if let Some(rpm) = args.rpm {
        settings.rate_limit_rpm = rpm.clamp(1, 120);
    }
    if let Some(interval) = args.checkpoint_interval {
        settings.checkpoint_interval = interval.max(1);
    }

    let (tracks, timestamps) = read_input(&args.input)?;
    if tracks.is_empty() {
        bail!("input {} contained no usable rows", args.input.display());
    }
    eprintln!("[INPUT] {} tracks from {}", tracks.len(), args.input.display());

    let db_path = match settings.provider {
        ProviderMode::OnlineOnly => None,
        _ => Some(args.db.clone().unwrap_or_else(|| dirs.offline_db_path())),
    };
    let online = match settings.provider {
        ProviderMode::OfflineOnly => None,
        _ => Some(Arc::new(OnlineResolver::new(
            settings.rate_limit_rpm,
            settings.workers,
            settings.adaptive.clone(),
        ))),
    };
    let cache = Arc::new(MappingCache::open(
        &dirs.mappings_db_path(),
        DEFAULT_LRU_CAPACITY,
    ));

    let checkpoint_path = args
        .checkpoint
        .clone()
        .unwrap_or_else(|| args.output.with_extension("checkpoint.json"));
    let (progress_tx, progress_rx) = unbounded();
    let runner = BatchRunner::new(
        db_path,
        cache,
        online.clone(),
        DispatchOptions::from(&settings),
    )
    .with_workers(settings.workers)
    .with_mode(settings.mode)
    .with_checkpoint_interval(settings.checkpoint_interval)
    .with_checkpoint_path(checkpoint_path)
    .with_progress_sender(progress_tx);

    let total = tracks.len();
    let run_tracks = tracks.clone();
    let run_handle = thread::spawn(move || runner.run(run_tracks));

    let pb = reporter.bar(total as u64, "Resolving");
    for event in progress_rx.iter() {
        pb.set_position(event.processed as u64);
        pb.set_message(format!(
            "Resolving ({} ok, {} cached, {} rate limited, {} failed, ETA {})",
            event.resolved,
            event.cached,
            event.rate_limited,
            event.failed,
            format_eta(event.eta_secs),
        ));
        reporter.line("RESOLVE", event.processed as u64, total as u64, 500);
    }

    // The channel closed, so the run is over; the join is bounded and the
    // process exits deterministically even if a worker wedged.
    let join_deadline = Instant::now() + SHUTDOWN_DEADLINE + Duration::from_secs(2);
    while !run_handle.is_finished() && Instant::now() < join_deadline {
        thread::sleep(Duration::from_millis(50));
    }
    if !run_handle.is_finished() {
        eprintln!("[FATAL] worker pool failed to shut down in time; exiting");
        std::process::exit(1);
    }
    let report = run_handle.join().expect("run thread panicked")?;
    pb.finish_with_message(format!(
        "Resolved {} of {} tracks ({:.1}%)",
        report.stats.resolved + report.stats.cached,
        total,
        report.stats.match_rate()
    ));

    // Export in input order; timestamps pass through untouched.
    let mut rows = build_output_rows(&tracks, &report.outcomes);
    for (row, timestamp) in rows.iter_mut().zip(timestamps.iter()) {
        row.timestamp = timestamp.clone();
    }
    write_scrobble_csv(&args.output, &rows, &[&args.input])?;
    eprintln!("[EXPORT] Wrote {} rows to {}", rows.len(), args.output.display());

    if !report.rate_limited.is_empty() {
        let rate_limited_path = args
            .rate_limited_out
            .clone()
            .unwrap_or_else(|| args.output.with_extension("rate_limited.csv"));
        write_rate_limited_csv(&rate_limited_path, &report.rate_limited, &[&args.input])?;
        eprintln!(
            "[EXPORT] {} rate-limited tracks recorded in {} (re-run later with --provider online-only)",
            report.rate_limited.len(),
            rate_limited_path.display()
        );
    }

    if let Some(stats_path) = &args.export_stats {
        report.stats.write_to_file(stats_path)?;
        eprintln!("[STATS] Wrote {}", stats_path.display());
    }

    // Persist the adaptively discovered limit for the next run.
    if let Some(online) = &online {
        let discovered = online.discovered_rpm();
        if discovered != settings.rate_limit_rpm {
            settings.rate_limit_rpm = discovered;
            if let Err(e) = settings.save(&settings_path) {
                tracing::warn!("could not persist discovered rate limit: {e:#}");
            }
        }
    }

    if report.state != RunState::Done {
        bail!("run ended in state {:?}", report.state);
    }
    Ok(())
}
