//! CSV writers for the scrobble export and the rate-limited report.
//!
//! Column orders are fixed by the export contract. Rows are written in
//! input order; timestamps are synthesized by the caller and passed
//! through untouched.

use std::path::Path;

use anyhow::{Context, Result};

use crate::models::{RateLimitedTrack, TrackOutcome, TrackQuery};
use crate::safety::check_output_path;

/// One scrobble row, already in export shape.
#[derive(Debug, Clone, Default)]
pub struct OutputRow {
    pub artist: String,
    pub track: String,
    pub album: String,
    pub timestamp: String,
    pub album_artist: String,
    pub duration_sec: Option<i64>,
}

/// Merge resolutions back onto the input records. Unresolved tracks keep
/// their original artist hint so the export never loses a row.
pub fn build_output_rows(queries: &[TrackQuery], outcomes: &[TrackOutcome]) -> Vec<OutputRow> {
    queries
        .iter()
        .zip(outcomes.iter())
        .map(|(query, outcome)| {
            let resolved_artist = match outcome {
                TrackOutcome::Resolved(res) => res.result.artist_name.clone(),
                _ => None,
            };
            let artist = resolved_artist
                .or_else(|| query.artist_hint.clone())
                .unwrap_or_default();
            OutputRow {
                artist: artist.clone(),
                track: query.title.clone(),
                album: query.album_hint.clone().unwrap_or_default(),
                timestamp: String::new(),
                album_artist: artist,
                duration_sec: query.duration_ms.map(|ms| ms / 1000),
            }
        })
        .collect()
}

/// Write the scrobble export: `Artist, Track, Album, Timestamp,
/// Album Artist, Duration (sec)`, one row per input track, input order.
/// The target filename must carry the "scrobble" marker.
pub fn write_scrobble_csv(path: &Path, rows: &[OutputRow], sources: &[&Path]) -> Result<()> {
    check_output_path(path, "scrobble", sources)?;
    let mut writer = csv::Writer::from_path(path)
        .with_context(|| format!("creating {}", path.display()))?;
    writer.write_record([
        "Artist",
        "Track",
        "Album",
        "Timestamp",
        "Album Artist",
        "Duration (sec)",
    ])?;
    for row in rows {
        writer.write_record([
            row.artist.as_str(),
            row.track.as_str(),
            row.album.as_str(),
            row.timestamp.as_str(),
            row.album_artist.as_str(),
            &row.duration_sec.map(|d| d.to_string()).unwrap_or_default(),
        ])?;
    }
    writer.flush()?;
    Ok(())
}

/// Write the rate-limited report: `Track, Artist, Album, Reason,
/// Attempted_At`. `Attempted_At` is unix seconds. The target filename must
/// carry the "rate_limited" marker.
pub fn write_rate_limited_csv(
    path: &Path,
    tracks: &[RateLimitedTrack],
    sources: &[&Path],
) -> Result<()> {
    check_output_path(path, "rate_limited", sources)?;
    let mut writer = csv::Writer::from_path(path)
        .with_context(|| format!("creating {}", path.display()))?;
    writer.write_record(["Track", "Artist", "Album", "Reason", "Attempted_At"])?;
    for track in tracks {
        writer.write_record([
            track.query.title.as_str(),
            track.query.artist_hint.as_deref().unwrap_or(""),
            track.query.album_hint.as_deref().unwrap_or(""),
            "403",
            &track.attempted_at.to_string(),
        ])?;
    }
    writer.flush()?;
    Ok(())
}

// ============================================================================
// TESTS
// ============================================================================
