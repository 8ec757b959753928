//! Core data models for track resolution.
//!
//! Value types shared across the store, resolvers, dispatcher and batch
//! orchestrator. Per-track conditions are sum types, never errors.

use serde::{Deserialize, Serialize};

// ============================================================================
// Offline corpus rows
// ============================================================================

/// Release type carried through from the canonical export. Stored on every
/// row and surfaced on candidates, but not yet part of scoring.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReleaseType {
    Album,
    Single,
    Ep,
    Compilation,
    Soundtrack,
    Other,
}

impl ReleaseType {
    pub fn as_str(self) -> &'static str {
        match self {
            ReleaseType::Album => "album",
            ReleaseType::Single => "single",
            ReleaseType::Ep => "ep",
            ReleaseType::Compilation => "compilation",
            ReleaseType::Soundtrack => "soundtrack",
            ReleaseType::Other => "other",
        }
    }

    pub fn parse(s: &str) -> Option<ReleaseType> {
        match s.to_ascii_lowercase().as_str() {
            "album" => Some(ReleaseType::Album),
            "single" => Some(ReleaseType::Single),
            "ep" => Some(ReleaseType::Ep),
            "compilation" => Some(ReleaseType::Compilation),
            "soundtrack" => Some(ReleaseType::Soundtrack),
            "" => None,
            _ => Some(ReleaseType::Other),
        }
    }
}

/// One canonical recording row. Immutable after ingestion; `score` is the
/// row id of the upstream export (lower = earlier-established = canonical),
/// not a popularity figure.
#[derive(Debug, Clone)]
pub struct RecordingRow {
    pub recording_id: i64,
    pub recording_name: String,
    pub recording_name_clean: String,
    pub artist_credit_name: String,
    pub artist_credit_name_clean: String,
    pub release_name: String,
    pub release_name_clean: String,
    pub score: i64,
    pub release_type: Option<ReleaseType>,
}

// ============================================================================
// Queries and candidates
// ============================================================================

/// One track to resolve. All string fields are raw; the resolvers run them
/// through the text pipeline themselves.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TrackQuery {
    pub title: String,
    pub artist_hint: Option<String>,
    pub album_hint: Option<String>,
    pub duration_ms: Option<i64>,
}

impl TrackQuery {
    pub fn new(title: impl Into<String>) -> Self {
        TrackQuery {
            title: title.into(),
            ..Default::default()
        }
    }

    pub fn with_artist(mut self, artist: impl Into<String>) -> Self {
        self.artist_hint = Some(artist.into());
        self
    }

    pub fn with_album(mut self, album: impl Into<String>) -> Self {
        self.album_hint = Some(album.into());
        self
    }
}

/// How a candidate's artist credit related to the artist hint.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArtistMatch {
    None,
    Partial,
    Exact,
    Phonetic,
    Fuzzy,
}

/// How a candidate's release related to the album hint.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AlbumMatch {
    None,
    Partial,
    Exact,
}

/// A scored cascade hit. Ephemeral, per query.
#[derive(Debug, Clone)]
pub struct Candidate {
    pub artist_credit: String,
    pub release_name: String,
    pub recording_name: String,
    pub raw_score: i64,
    pub weight: f64,
    pub artist_match: ArtistMatch,
    pub album_match: AlbumMatch,
}

// ============================================================================
// Results
// ============================================================================

/// Four-level confidence band. Ordered so `>=` comparisons read naturally:
/// `NoMatch < Low < Medium < High`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Confidence {
    NoMatch,
    Low,
    Medium,
    High,
}

impl Confidence {
    pub fn as_str(self) -> &'static str {
        match self {
            Confidence::NoMatch => "no_match",
            Confidence::Low => "low",
            Confidence::Medium => "medium",
            Confidence::High => "high",
        }
    }
}

/// Which backend produced a resolution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Provider {
    Offline,
    Online,
    Cache,
}

/// Outcome of a single resolve attempt against one backend.
#[derive(Debug, Clone)]
pub struct MatchResult {
    pub artist_name: Option<String>,
    pub release_name: Option<String>,
    pub confidence: Confidence,
    /// Weight gap between the top two candidates; infinity for a lone hit.
    pub margin: f64,
    /// Up to three top candidates, for introspection.
    pub top_candidates: Vec<Candidate>,
    /// Which policy or cascade level produced this result.
    pub reason: String,
}

impl MatchResult {
    pub fn no_match(reason: impl Into<String>) -> Self {
        MatchResult {
            artist_name: None,
            release_name: None,
            confidence: Confidence::NoMatch,
            margin: 0.0,
            top_candidates: Vec::new(),
            reason: reason.into(),
        }
    }

    pub fn is_match(&self) -> bool {
        self.confidence > Confidence::NoMatch && self.artist_name.is_some()
    }
}

/// Dispatcher-level result: a match plus the backend that produced it.
#[derive(Debug, Clone)]
pub struct Resolution {
    pub result: MatchResult,
    pub provider: Provider,
}

// ============================================================================
// Verified mappings
// ============================================================================

/// Confidence band allowed into the persistent mapping store. `Low` rows
/// appear only when `persist_low_matches` is switched on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MappingConfidence {
    High,
    Medium,
    Manual,
    Low,
}

impl MappingConfidence {
    pub fn as_str(self) -> &'static str {
        match self {
            MappingConfidence::High => "high",
            MappingConfidence::Medium => "medium",
            MappingConfidence::Manual => "manual",
            MappingConfidence::Low => "low",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "high" => Some(MappingConfidence::High),
            "medium" => Some(MappingConfidence::Medium),
            "manual" => Some(MappingConfidence::Manual),
            "low" => Some(MappingConfidence::Low),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VerifiedBy {
    Auto,
    User,
}

impl VerifiedBy {
    pub fn as_str(self) -> &'static str {
        match self {
            VerifiedBy::Auto => "auto",
            VerifiedBy::User => "user",
        }
    }
}

/// One persisted verified mapping, keyed by the stable hash of the
/// normalized (song, album, artist) triple.
#[derive(Debug, Clone)]
pub struct VerifiedMapping {
    pub track_hash: String,
    pub apple_song: String,
    pub apple_album: String,
    pub apple_artist: String,
    pub mb_artist_credit: String,
    pub mb_release: Option<String>,
    pub confidence: MappingConfidence,
    pub verified_by: VerifiedBy,
    pub created_at: i64,
    pub last_used_at: i64,
}

// ============================================================================
// Failure buckets
// ============================================================================

/// Permanent per-track failure reasons. Rate limiting is deliberately not
/// one of these: a 403 track is retriable and lives in its own bucket.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailReason {
    NotFound,
    NetworkError,
    Invalid,
}

impl FailReason {
    pub fn as_str(self) -> &'static str {
        match self {
            FailReason::NotFound => "not_found",
            FailReason::NetworkError => "network_error",
            FailReason::Invalid => "invalid",
        }
    }
}

/// A track that failed permanently, with its input position.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FailedTrack {
    pub index: usize,
    pub query: TrackQuery,
    pub reason: FailReason,
}

/// A track whose online attempt was answered with 403. Retriable.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RateLimitedTrack {
    pub index: usize,
    pub query: TrackQuery,
    /// Unix seconds of the rejected attempt.
    pub attempted_at: i64,
}

/// Final state of one input track after a batch run.
#[derive(Debug, Clone)]
pub enum TrackOutcome {
    Resolved(Resolution),
    RateLimited,
    Failed(FailReason),
    Cancelled,
}

// ============================================================================
// Album sessions
// ============================================================================

/// A run of >= 3 consecutive input tracks sharing a cleaned album name.
/// Holds indices into the batch's outcome vector, never the outcomes
/// themselves.
#[derive(Debug, Clone)]
pub struct AlbumSession {
    pub album_clean: String,
    pub tracks: Vec<usize>,
    pub aligned: bool,
    pub artist_credit: Option<String>,
}

// ============================================================================
// Progress & statistics
// ============================================================================

/// Emitted by the orchestrator at every checkpoint interval.
#[derive(Debug, Clone, Serialize)]
pub struct ProgressEvent {
    pub processed: usize,
    pub total: usize,
    pub resolved: usize,
    pub cached: usize,
    pub rate_limited: usize,
    pub failed: usize,
    pub eta_secs: Option<f64>,
}

/// Per-run counters, exportable as JSON.
#[derive(Debug, Clone, Default, Serialize)]
pub struct RunStats {
    pub total_tracks: usize,
    pub resolved: usize,
    pub cached: usize,
    pub rate_limited: usize,
    pub failed: usize,
    pub no_match: usize,
    pub high_confidence: usize,
    pub medium_confidence: usize,
    pub low_confidence: usize,
    pub sessions_aligned: usize,
    pub elapsed_seconds: f64,
}

impl RunStats {
    /// Share of input tracks that ended with a usable artist credit.
    pub fn match_rate(&self) -> f64 {
        if self.total_tracks == 0 {
            0.0
        } else {
            100.0 * (self.resolved + self.cached) as f64 / self.total_tracks as f64
        }
    }

    pub fn record(&mut self, outcome: &TrackOutcome) {
        match outcome {
            TrackOutcome::Resolved(resolution) => {
                if resolution.result.confidence == Confidence::NoMatch {
                    self.no_match += 1;
                    return;
                }
                if resolution.provider == Provider::Cache {
                    self.cached += 1;
                } else {
                    self.resolved += 1;
                }
                match resolution.result.confidence {
                    Confidence::High => self.high_confidence += 1,
                    Confidence::Medium => self.medium_confidence += 1,
                    Confidence::Low => self.low_confidence += 1,
                    Confidence::NoMatch => {}
                }
            }
            TrackOutcome::RateLimited => self.rate_limited += 1,
            TrackOutcome::Failed(_) => self.failed += 1,
            TrackOutcome::Cancelled => {}
        }
    }

    pub fn write_to_file(&self, path: &std::path::Path) -> anyhow::Result<()> {
        let json = serde_json::to_string_pretty(self)?;
        std::fs::write(path, json)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn confidence_ordering() {
        assert!(Confidence::High > Confidence::Medium);
        assert!(Confidence::Medium > Confidence::Low);
        assert!(Confidence::Low > Confidence::NoMatch);
    }

    #[test]
    fn release_type_round_trip() {
        for rt in [
            ReleaseType::Album,
            ReleaseType::Single,
            ReleaseType::Ep,
            ReleaseType::Compilation,
            ReleaseType::Soundtrack,
        ] {
            assert_eq!(ReleaseType::parse(rt.as_str()), Some(rt));
        }
        assert_eq!(ReleaseType::parse(""), None);
        assert_eq!(ReleaseType::parse("broadcast"), Some(ReleaseType::Other));
    }

    #[test]
    fn stats_record_buckets() {
        let mut stats = RunStats::default();
        stats.record(&TrackOutcome::Resolved(Resolution {
            result: MatchResult {
                artist_name: Some("The Weeknd".into()),
                release_name: None,
                confidence: Confidence::High,
                margin: f64::INFINITY,
                top_candidates: vec![],
                reason: "test".into(),
            },
            provider: Provider::Offline,
        }));
        stats.record(&TrackOutcome::RateLimited);
        stats.record(&TrackOutcome::Failed(FailReason::NotFound));
        assert_eq!(stats.resolved, 1);
        assert_eq!(stats.high_confidence, 1);
        assert_eq!(stats.rate_limited, 1);
        assert_eq!(stats.failed, 1);
    }

    #[test]
    fn no_match_result_is_not_a_match() {
        let result = MatchResult::no_match("nothing found");
        assert!(!result.is_match());
        assert_eq!(result.confidence, Confidence::NoMatch);
    }
}
