//! Batch orchestrator: drives the dispatcher over an ordered track stream
//! with a worker pool, checkpoints, pause/resume/cancel and progress
//! events.
//!
//! Workers complete out of order; outcomes are reassembled by index so the
//! output sequence always preserves input order. The offline database
//! connection is never shared: every worker opens its own read-only store.
//! Cancellation is cooperative with a bounded join; workers that overrun
//! the deadline are detached (the binary holds the hard process-exit
//! escape hatch).

use std::path::{Path, PathBuf};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use anyhow::{bail, Context, Result};
use crossbeam_channel::{bounded, unbounded, RecvTimeoutError, Sender};
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::cache::MappingCache;
use crate::config::{MatchMode, MatchingConfig, ProviderMode};
use crate::dispatch::{DispatchOptions, Dispatcher};
use crate::models::{
    FailReason, FailedTrack, ProgressEvent, Provider, RateLimitedTrack, Resolution, RunStats,
    TrackOutcome, TrackQuery,
};
use crate::offline::OfflineResolver;
use crate::online::{OnlineOutcome, OnlineResolver};
use crate::ratelimit::CancellationToken;
use crate::session::{align_session, detect_sessions};
use crate::store::OfflineStore;

/// Graceful-shutdown budget after `cancel()`.
pub const SHUTDOWN_DEADLINE: Duration = Duration::from_secs(5);

const MAX_NETWORK_RETRIES: u32 = 3;
const RETRY_BACKOFF_BASE: Duration = Duration::from_millis(250);

// ============================================================================
// Run state & control
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RunState {
    Idle,
    Running,
    Paused,
    Finalizing,
    Done,
    Cancelled,
    Failed,
}

/// Shared handle for controlling a run from another thread.
pub struct BatchControl {
    state: Mutex<RunState>,
    cv: Condvar,
    cancel: CancellationToken,
    /// Cancelling must also wake the online resolver's limiter sleep.
    online: Mutex<Option<Arc<OnlineResolver>>>,
}

impl BatchControl {
    fn new() -> Arc<BatchControl> {
        Arc::new(BatchControl {
            state: Mutex::new(RunState::Idle),
            cv: Condvar::new(),
            cancel: CancellationToken::new(),
            online: Mutex::new(None),
        })
    }

    pub fn state(&self) -> RunState {
        *self.state.lock().unwrap()
    }

    fn set_state(&self, next: RunState) {
        let mut state = self.state.lock().unwrap();
        *state = next;
        self.cv.notify_all();
    }

    /// Stop dispatching new work; in-flight tracks complete.
    pub fn pause(&self) {
        let mut state = self.state.lock().unwrap();
        if matches!(*state, RunState::Idle | RunState::Running) {
            *state = RunState::Paused;
            self.cv.notify_all();
        }
    }

    pub fn resume(&self) {
        let mut state = self.state.lock().unwrap();
        if *state == RunState::Paused {
            *state = RunState::Running;
            self.cv.notify_all();
        }
    }

    /// Terminal: stops dispatch, wakes every interruptible sleep.
    pub fn cancel(&self) {
        {
            let mut state = self.state.lock().unwrap();
            *state = RunState::Cancelled;
            self.cv.notify_all();
        }
        self.cancel.cancel();
        if let Some(online) = self.online.lock().unwrap().as_ref() {
            online.cancel();
        }
    }

    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Block while paused. Returns `false` once cancelled.
    fn wait_while_paused(&self) -> bool {
        let mut state = self.state.lock().unwrap();
        loop {
            match *state {
                RunState::Paused => {
                    let (next, _) = self
                        .cv
                        .wait_timeout(state, Duration::from_millis(100))
                        .unwrap();
                    state = next;
                }
                RunState::Cancelled => return false,
                _ => return true,
            }
        }
    }
}

// ============================================================================
// Checkpoints
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Checkpoint {
    pub processed: usize,
    pub total: usize,
    pub resolved: usize,
    pub cached: usize,
    pub rate_limited: usize,
    pub failed: usize,
    pub rate_limited_tracks: Vec<RateLimitedTrack>,
}

/// Atomic write: temp file in the same directory, then rename.
pub fn write_checkpoint(path: &Path, checkpoint: &Checkpoint) -> Result<()> {
    let json = serde_json::to_string_pretty(checkpoint)?;
    let tmp = path.with_extension("tmp");
    std::fs::write(&tmp, json).with_context(|| format!("writing {}", tmp.display()))?;
    std::fs::rename(&tmp, path).with_context(|| format!("replacing {}", path.display()))?;
    Ok(())
}

pub fn load_checkpoint(path: &Path) -> Option<Checkpoint> {
    let raw = std::fs::read_to_string(path).ok()?;
    serde_json::from_str(&raw).ok()
}

// ============================================================================
// Report
// ============================================================================

#[derive(Debug)]
pub struct BatchReport {
    /// One outcome per input track, in input order.
    pub outcomes: Vec<TrackOutcome>,
    pub stats: RunStats,
    pub rate_limited: Vec<RateLimitedTrack>,
    pub failed: Vec<FailedTrack>,
    pub state: RunState,
}

// ============================================================================
// Runner
// ============================================================================

pub struct BatchRunner {
    db_path: Option<PathBuf>,
    cache: Arc<MappingCache>,
    online: Option<Arc<OnlineResolver>>,
    options: DispatchOptions,
    mode: MatchMode,
    workers: usize,
    checkpoint_interval: usize,
    checkpoint_path: Option<PathBuf>,
    progress: Option<Sender<ProgressEvent>>,
    control: Arc<BatchControl>,
}

impl BatchRunner {
    pub fn new(
        db_path: Option<PathBuf>,
        cache: Arc<MappingCache>,
        online: Option<Arc<OnlineResolver>>,
        options: DispatchOptions,
    ) -> BatchRunner {
        let control = BatchControl::new();
        *control.online.lock().unwrap() = online.clone();
        BatchRunner {
            db_path,
            cache,
            online,
            options,
            mode: MatchMode::Normal,
            workers: 10,
            checkpoint_interval: 50,
            checkpoint_path: None,
            progress: None,
            control,
        }
    }

    pub fn with_workers(mut self, workers: usize) -> BatchRunner {
        self.workers = workers.max(1);
        self
    }

    pub fn with_mode(mut self, mode: MatchMode) -> BatchRunner {
        self.mode = mode;
        self
    }

    pub fn with_checkpoint_interval(mut self, interval: usize) -> BatchRunner {
        self.checkpoint_interval = interval.max(1);
        self
    }

    pub fn with_checkpoint_path(mut self, path: PathBuf) -> BatchRunner {
        self.checkpoint_path = Some(path);
        self
    }

    pub fn with_progress_sender(mut self, sender: Sender<ProgressEvent>) -> BatchRunner {
        self.progress = Some(sender);
        self
    }

    pub fn control(&self) -> Arc<BatchControl> {
        Arc::clone(&self.control)
    }

    fn make_dispatcher(&self) -> Result<Dispatcher> {
        let offline = match &self.db_path {
            Some(path) => match OfflineStore::open(path) {
                Ok(store) => Some(OfflineResolver::with_config(
                    store,
                    MatchingConfig::for_mode(self.mode),
                )),
                Err(e) => {
                    if self.online.is_some() && self.options.provider != ProviderMode::OfflineOnly
                    {
                        warn!("offline store unavailable ({e}); running online only");
                        None
                    } else {
                        bail!("offline store unavailable: {e}");
                    }
                }
            },
            None => None,
        };
        Ok(Dispatcher::new(
            offline,
            self.online.clone(),
            Arc::clone(&self.cache),
            self.options.clone(),
        ))
    }

    fn make_aligner(&self) -> Option<OfflineResolver> {
        let path = self.db_path.as_ref()?;
        OfflineStore::open(path)
            .ok()
            .map(|store| OfflineResolver::with_config(store, MatchingConfig::for_mode(self.mode)))
    }

    /// Resolve the whole stream. Blocks until done, cancelled or failed.
    pub fn run(&self, tracks: Vec<TrackQuery>) -> Result<BatchReport> {
        let total = tracks.len();
        let started = Instant::now();
        {
            let mut state = self.control.state.lock().unwrap();
            if *state == RunState::Idle {
                *state = RunState::Running;
            }
        }

        let mut stats = RunStats::default();
        stats.total_tracks = total;
        if total == 0 {
            self.control.set_state(RunState::Done);
            return Ok(BatchReport {
                outcomes: Vec::new(),
                stats,
                rate_limited: Vec::new(),
                failed: Vec::new(),
                state: RunState::Done,
            });
        }

        // Fail fast on a fatal store problem before spawning anything.
        let first_dispatcher = match self.make_dispatcher() {
            Ok(dispatcher) => dispatcher,
            Err(e) => {
                self.control.set_state(RunState::Failed);
                return Err(e);
            }
        };

        let tracks = Arc::new(tracks);
        let mut sessions = detect_sessions(&tracks);
        let aligner = self.make_aligner();
        let cancel = self.control.cancel_token();

        let (job_tx, job_rx) = bounded::<usize>(self.workers * 2);
        let (result_tx, result_rx) = unbounded::<(usize, TrackOutcome)>();

        let mut handles: Vec<JoinHandle<()>> = Vec::with_capacity(self.workers);
        let mut first = Some(first_dispatcher);
        for _ in 0..self.workers {
            let dispatcher = match first.take() {
                Some(dispatcher) => dispatcher,
                None => match self.make_dispatcher() {
                    Ok(dispatcher) => dispatcher,
                    Err(e) => {
                        self.control.set_state(RunState::Failed);
                        return Err(e);
                    }
                },
            };
            handles.push(spawn_worker(
                dispatcher,
                Arc::clone(&tracks),
                job_rx.clone(),
                result_tx.clone(),
                cancel.clone(),
            ));
        }
        drop(job_rx);
        drop(result_tx);

        // Feeder: walks the input in order, honoring pause and cancel.
        let feeder = {
            let control = Arc::clone(&self.control);
            thread::spawn(move || {
                for index in 0..total {
                    if !control.wait_while_paused() {
                        break;
                    }
                    if job_tx.send(index).is_err() {
                        break;
                    }
                }
            })
        };

        // Collector: reassembles by index, checkpoints per window.
        let mut outcomes: Vec<Option<TrackOutcome>> = vec![None; total];
        let mut rate_limited: Vec<RateLimitedTrack> = Vec::new();
        let mut failed: Vec<FailedTrack> = Vec::new();
        let mut processed = 0usize;
        while processed < total {
            match result_rx.recv_timeout(Duration::from_millis(200)) {
                Ok((index, outcome)) => {
                    self.record(
                        index, &outcome, &tracks, &mut stats, &mut rate_limited, &mut failed,
                    );
                    outcomes[index] = Some(outcome);
                    processed += 1;
                    if processed % self.checkpoint_interval == 0 {
                        self.emit_progress(processed, total, started, &stats);
                        self.write_checkpoint_file(processed, total, &stats, &rate_limited);
                        let aligned = self.align_ready_sessions(
                            aligner.as_ref(),
                            &mut sessions,
                            &tracks,
                            &mut outcomes,
                        );
                        stats.sessions_aligned += aligned;
                    }
                }
                Err(RecvTimeoutError::Timeout) => {
                    if self.control.is_cancelled() {
                        continue;
                    }
                }
                Err(RecvTimeoutError::Disconnected) => break,
            }
        }

        let cancelled = self.control.is_cancelled();
        if !cancelled {
            self.control.set_state(RunState::Finalizing);
            let aligned =
                self.align_ready_sessions(aligner.as_ref(), &mut sessions, &tracks, &mut outcomes);
            stats.sessions_aligned += aligned;
        }

        let _ = feeder.join();
        let deadline = Instant::now() + SHUTDOWN_DEADLINE;
        if !join_with_deadline(handles, deadline) {
            warn!("worker pool did not drain within the shutdown budget; detaching");
        }

        stats.elapsed_seconds = started.elapsed().as_secs_f64();
        self.emit_progress(processed, total, started, &stats);
        self.write_checkpoint_file(processed, total, &stats, &rate_limited);

        let state = if cancelled {
            RunState::Cancelled
        } else {
            RunState::Done
        };
        self.control.set_state(state);

        Ok(BatchReport {
            outcomes: outcomes
                .into_iter()
                .map(|o| o.unwrap_or(TrackOutcome::Cancelled))
                .collect(),
            stats,
            rate_limited,
            failed,
            state,
        })
    }

    /// Re-drive the rate-limited bucket through the online resolver,
    /// updating the report in place. Tracks that hit 403 again stay in the
    /// bucket.
    pub fn retry_rate_limited(&self, report: &mut BatchReport) -> Result<()> {
        if report.rate_limited.is_empty() {
            return Ok(());
        }
        if self.online.is_none() {
            bail!("no online resolver configured; cannot retry rate-limited tracks");
        }
        let mut dispatcher = Dispatcher::new(
            None,
            self.online.clone(),
            Arc::clone(&self.cache),
            DispatchOptions {
                provider: ProviderMode::OnlineOnly,
                ..self.options.clone()
            },
        );

        let bucket = std::mem::take(&mut report.rate_limited);
        for entry in bucket {
            let outcome = dispatcher.resolve(&entry.query);
            match &outcome {
                TrackOutcome::Resolved(_) => {
                    report.stats.rate_limited = report.stats.rate_limited.saturating_sub(1);
                    report.stats.record(&outcome);
                }
                TrackOutcome::RateLimited => {
                    report.rate_limited.push(RateLimitedTrack {
                        index: entry.index,
                        query: entry.query.clone(),
                        attempted_at: now_unix(),
                    });
                }
                TrackOutcome::Failed(reason) => {
                    report.stats.rate_limited = report.stats.rate_limited.saturating_sub(1);
                    report.stats.failed += 1;
                    report.failed.push(FailedTrack {
                        index: entry.index,
                        query: entry.query.clone(),
                        reason: *reason,
                    });
                }
                TrackOutcome::Cancelled => {
                    report.rate_limited.push(entry);
                    continue;
                }
            }
            report.outcomes[entry.index] = outcome;
        }
        Ok(())
    }

    fn emit_progress(&self, processed: usize, total: usize, started: Instant, stats: &RunStats) {
        let Some(sender) = &self.progress else {
            return;
        };
        let eta_secs = if processed > 0 && processed < total {
            let rate = started.elapsed().as_secs_f64() / processed as f64;
            Some(rate * (total - processed) as f64)
        } else {
            None
        };
        let _ = sender.send(ProgressEvent {
            processed,
            total,
            resolved: stats.resolved,
            cached: stats.cached,
            rate_limited: stats.rate_limited,
            failed: stats.failed,
            eta_secs,
        });
    }

    /// Checkpoint failures are logged and never stop the run.
    fn write_checkpoint_file(
        &self,
        processed: usize,
        total: usize,
        stats: &RunStats,
        rate_limited: &[RateLimitedTrack],
    ) {
        let Some(path) = &self.checkpoint_path else {
            return;
        };
        let checkpoint = Checkpoint {
            processed,
            total,
            resolved: stats.resolved,
            cached: stats.cached,
            rate_limited: stats.rate_limited,
            failed: stats.failed,
            rate_limited_tracks: rate_limited.to_vec(),
        };
        if let Err(e) = write_checkpoint(path, &checkpoint) {
            warn!("checkpoint write failed ({e}); run continues");
        }
    }

    /// Align sessions whose every track has an outcome. Amortized per
    /// checkpoint window instead of per track.
    fn align_ready_sessions(
        &self,
        aligner: Option<&OfflineResolver>,
        sessions: &mut [crate::models::AlbumSession],
        tracks: &[TrackQuery],
        outcomes: &mut [Option<TrackOutcome>],
    ) -> usize {
        let Some(resolver) = aligner else {
            return 0;
        };
        let mut aligned = 0;
        for session in sessions.iter_mut().filter(|s| !s.aligned) {
            let complete = session.tracks.iter().all(|&i| outcomes[i].is_some());
            if !complete {
                continue;
            }
            match align_session(resolver, session, tracks, outcomes) {
                Ok(true) => aligned += 1,
                Ok(false) => {}
                Err(e) => warn!("session alignment failed ({e}); skipping"),
            }
        }
        aligned
    }

    fn record(
        &self,
        index: usize,
        outcome: &TrackOutcome,
        tracks: &[TrackQuery],
        stats: &mut RunStats,
        rate_limited: &mut Vec<RateLimitedTrack>,
        failed: &mut Vec<FailedTrack>,
    ) {
        stats.record(outcome);
        match outcome {
            TrackOutcome::RateLimited => rate_limited.push(RateLimitedTrack {
                index,
                query: tracks[index].clone(),
                attempted_at: now_unix(),
            }),
            TrackOutcome::Failed(reason) => failed.push(FailedTrack {
                index,
                query: tracks[index].clone(),
                reason: *reason,
            }),
            _ => {}
        }
    }
}

fn spawn_worker(
    mut dispatcher: Dispatcher,
    tracks: Arc<Vec<TrackQuery>>,
    job_rx: crossbeam_channel::Receiver<usize>,
    result_tx: Sender<(usize, TrackOutcome)>,
    cancel: CancellationToken,
) -> JoinHandle<()> {
    thread::spawn(move || {
        while let Ok(index) = job_rx.recv() {
            let outcome = if cancel.is_cancelled() {
                TrackOutcome::Cancelled
            } else {
                resolve_with_retries(&mut dispatcher, &tracks[index], &cancel)
            };
            if result_tx.send((index, outcome)).is_err() {
                break;
            }
        }
    })
}

/// Per-track network retries with exponential backoff; 403 is not retried
/// here, it goes to the rate-limited bucket for user-driven retry.
fn resolve_with_retries(
    dispatcher: &mut Dispatcher,
    query: &TrackQuery,
    cancel: &CancellationToken,
) -> TrackOutcome {
    let mut attempt = 0u32;
    loop {
        let outcome = dispatcher.resolve(query);
        match outcome {
            TrackOutcome::Failed(FailReason::NetworkError) if attempt < MAX_NETWORK_RETRIES => {
                attempt += 1;
                let backoff = RETRY_BACKOFF_BASE * 2u32.pow(attempt);
                if !cancel.sleep(backoff) {
                    return TrackOutcome::Cancelled;
                }
            }
            other => return other,
        }
    }
}

fn join_with_deadline(handles: Vec<JoinHandle<()>>, deadline: Instant) -> bool {
    let mut all_joined = true;
    for handle in handles {
        while !handle.is_finished() && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(20));
        }
        if handle.is_finished() {
            let _ = handle.join();
        } else {
            all_joined = false;
        }
    }
    all_joined
}

fn now_unix() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}

/// Map a raw online outcome into a track outcome. Used by callers driving
/// the online resolver directly.
pub fn online_outcome_to_track(outcome: OnlineOutcome) -> TrackOutcome {
    match outcome {
        OnlineOutcome::Found(result) => TrackOutcome::Resolved(Resolution {
            result,
            provider: Provider::Online,
        }),
        OnlineOutcome::NotFound => TrackOutcome::Failed(FailReason::NotFound),
        OnlineOutcome::RateLimited => TrackOutcome::RateLimited,
        OnlineOutcome::NetworkError(_) => TrackOutcome::Failed(FailReason::NetworkError),
        OnlineOutcome::Invalid(_) => TrackOutcome::Failed(FailReason::Invalid),
        OnlineOutcome::Cancelled => TrackOutcome::Cancelled,
    }
}

// ============================================================================
// TESTS
// ============================================================================
