//! Online resolver over the iTunes Search API.
//!
//! One endpoint: `GET /search?term=<title [album]>&entity=song&limit=5`.
//! Every per-track condition is an [`OnlineOutcome`] variant; the crucial
//! distinction is 403 (`RateLimited`, retriable, goes to its own bucket)
//! versus the permanent `NotFound`/`Invalid` and the retriable-at-the-
//! orchestrator `NetworkError`.

use std::time::Duration;

use reqwest::blocking::Client;
use serde::Deserialize;
use tracing::debug;

use crate::config::AdaptiveRateConfig;
use crate::models::{Confidence, MatchResult, RateLimitedTrack};
use crate::ratelimit::{CancellationToken, RateLimiter, WorkerGate};
use crate::text::{clean_conservative, normalize_for_matching, tokenize_artist_credit};

const DEFAULT_BASE_URL: &str = "https://itunes.apple.com";

/// Per-request timeout. Covers connect + response.
const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

/// Outcome of one online resolution attempt.
#[derive(Debug, Clone)]
pub enum OnlineOutcome {
    Found(MatchResult),
    /// Zero results even after the title-only retry. Permanent.
    NotFound,
    /// HTTP 403. Retriable after the limit resets; never "failed".
    RateLimited,
    /// Timeout, DNS failure or 5xx. Retried by the orchestrator.
    NetworkError(String),
    /// Malformed response or unexpected status. Permanent.
    Invalid(String),
    Cancelled,
}

// ============================================================================
// Response model
// ============================================================================

#[derive(Debug, Deserialize)]
struct SearchResponse {
    #[serde(rename = "resultCount")]
    result_count: i64,
    results: Vec<SongResult>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SongResult {
    artist_name: String,
    track_name: String,
    #[serde(default)]
    collection_name: Option<String>,
}

// ============================================================================
// Resolver
// ============================================================================

pub struct OnlineResolver {
    http: Client,
    base_url: String,
    limiter: RateLimiter,
    gate: WorkerGate,
    cancel: CancellationToken,
}

impl OnlineResolver {
    /// # Panics
    ///
    /// Panics if the underlying HTTP client cannot be constructed (only
    /// possible if TLS initialisation fails at the OS level).
    pub fn new(rate_limit_rpm: u32, workers: usize, adaptive: AdaptiveRateConfig) -> OnlineResolver {
        Self::with_base_url(DEFAULT_BASE_URL, rate_limit_rpm, workers, adaptive)
    }

    /// Point the client at an arbitrary base URL. Intended for tests.
    #[doc(hidden)]
    pub fn with_base_url(
        base_url: impl Into<String>,
        rate_limit_rpm: u32,
        workers: usize,
        adaptive: AdaptiveRateConfig,
    ) -> OnlineResolver {
        let http = Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .expect("Failed to build HTTP client");
        OnlineResolver {
            http,
            base_url: base_url.into(),
            limiter: RateLimiter::new(rate_limit_rpm, workers, adaptive),
            gate: WorkerGate::new(),
            cancel: CancellationToken::new(),
        }
    }

    /// The cancellation token shared with the orchestrator. Tripping it
    /// wakes any rate-limiter sleep immediately.
    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    /// Effective rpm after adaptive discovery, for persisting back to
    /// settings.
    pub fn discovered_rpm(&self) -> u32 {
        self.limiter.current_rpm()
    }

    /// Resolve one track. The search term is the cleaned title plus the
    /// cleaned album when present; a zero-result response with an album is
    /// retried once with the title alone.
    pub fn search(
        &self,
        title: &str,
        album: Option<&str>,
        artist_hint: Option<&str>,
    ) -> OnlineOutcome {
        let clean_title = clean_conservative(title);
        if clean_title.is_empty() {
            return OnlineOutcome::NotFound;
        }
        let album_clean = album.map(clean_conservative).filter(|s| !s.is_empty());

        // The gate bounds how many pool workers are inside the resolver at
        // once; its cap shrinks while the limiter is backing off.
        if !self
            .gate
            .enter(|| self.limiter.current_slots(), &self.cancel)
        {
            return OnlineOutcome::Cancelled;
        }
        let outcome = (|| {
            match &album_clean {
                Some(album) => {
                    let term = format!("{clean_title} {album}");
                    match self.request(&term, &clean_title, artist_hint) {
                        OnlineOutcome::NotFound => {
                            self.request(&clean_title, &clean_title, artist_hint)
                        }
                        other => other,
                    }
                }
                None => self.request(&clean_title, &clean_title, artist_hint),
            }
        })();
        self.gate.leave();
        outcome
    }

    /// Drain a rate-limited bucket through the current limiter. Stops early
    /// on cancellation, leaving remaining outcomes as `Cancelled`.
    pub fn retry(&self, tracks: &[RateLimitedTrack]) -> Vec<(usize, OnlineOutcome)> {
        tracks
            .iter()
            .map(|t| {
                if self.cancel.is_cancelled() {
                    return (t.index, OnlineOutcome::Cancelled);
                }
                (
                    t.index,
                    self.search(
                        &t.query.title,
                        t.query.album_hint.as_deref(),
                        t.query.artist_hint.as_deref(),
                    ),
                )
            })
            .collect()
    }

    fn request(&self, term: &str, clean_title: &str, artist_hint: Option<&str>) -> OnlineOutcome {
        if !self.limiter.acquire(&self.cancel) {
            return OnlineOutcome::Cancelled;
        }
        debug!(term, "itunes search");
        let response = match self
            .http
            .get(format!("{}/search", self.base_url))
            .query(&[("term", term), ("entity", "song"), ("limit", "5")])
            .send()
        {
            Ok(response) => response,
            Err(e) => return OnlineOutcome::NetworkError(e.to_string()),
        };

        let status = response.status().as_u16();
        match status {
            200 => {}
            403 => {
                self.limiter.record_rate_limited();
                return OnlineOutcome::RateLimited;
            }
            s if s >= 500 => return OnlineOutcome::NetworkError(format!("HTTP {s}")),
            s => return OnlineOutcome::Invalid(format!("unexpected HTTP {s}")),
        }

        let parsed: SearchResponse = match response.json() {
            Ok(parsed) => parsed,
            Err(e) => return OnlineOutcome::Invalid(format!("malformed response: {e}")),
        };
        self.limiter.record_success();

        if parsed.result_count == 0 || parsed.results.is_empty() {
            return OnlineOutcome::NotFound;
        }
        OnlineOutcome::Found(interpret(parsed.results, clean_title, artist_hint))
    }
}

/// Pick a candidate and assign a confidence band: prefer the first result
/// whose track name starts with the queried title, fall back to the first
/// result. An artist hint that shares no token with the chosen credit
/// knocks the confidence down one band.
fn interpret(results: Vec<SongResult>, clean_title: &str, artist_hint: Option<&str>) -> MatchResult {
    let title_norm = normalize_for_matching(clean_title);
    let chosen = results
        .iter()
        .find(|r| normalize_for_matching(&r.track_name).starts_with(&title_norm))
        .unwrap_or(&results[0]);

    let track_norm = normalize_for_matching(&chosen.track_name);
    let base = if track_norm == title_norm {
        Confidence::High
    } else if track_norm.starts_with(&title_norm) {
        Confidence::Medium
    } else {
        Confidence::Low
    };
    let (confidence, hint_note) = match artist_hint {
        Some(hint) => {
            let hint_tokens = tokenize_artist_credit(hint);
            let credit_tokens = tokenize_artist_credit(&chosen.artist_name);
            if credit_tokens.intersection(&hint_tokens).next().is_some() {
                (base, ", artist hint agrees")
            } else {
                (downgrade(base), ", artist hint disagrees")
            }
        }
        None => (base, ""),
    };

    let title_note = if track_norm == title_norm {
        "exact track name"
    } else if track_norm.starts_with(&title_norm) {
        "track name prefix"
    } else {
        "first result"
    };
    MatchResult {
        artist_name: Some(chosen.artist_name.clone()),
        release_name: chosen.collection_name.clone(),
        confidence,
        margin: 0.0,
        top_candidates: Vec::new(),
        reason: format!("itunes search: {title_note}{hint_note}"),
    }
}

fn downgrade(confidence: Confidence) -> Confidence {
    match confidence {
        Confidence::High => Confidence::Medium,
        Confidence::Medium => Confidence::Low,
        other => other,
    }
}

// ============================================================================
// TESTS
// ============================================================================

/// Minimal single-threaded HTTP stub shared by the online and dispatch
/// tests: serves the given (status, body) responses to consecutive
/// connections, then reports how many requests it saw.
#[cfg(test)]
pub(crate) mod test_http {
    use std::io::{Read, Write};
    use std::net::TcpListener;
    use std::thread::{self, JoinHandle};

    pub fn serve(responses: Vec<(u16, String)>) -> (String, JoinHandle<usize>) {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let handle = thread::spawn(move || {
            let mut served = 0usize;
            for (status, body) in responses {
                let Ok((mut stream, _)) = listener.accept() else {
                    break;
                };
                let mut buf = [0u8; 4096];
                let mut data = Vec::new();
                loop {
                    let n = stream.read(&mut buf).unwrap_or(0);
                    if n == 0 {
                        break;
                    }
                    data.extend_from_slice(&buf[..n]);
                    if data.windows(4).any(|w| w == b"\r\n\r\n") {
                        break;
                    }
                }
                let reason = match status {
                    200 => "OK",
                    403 => "Forbidden",
                    500 => "Internal Server Error",
                    _ => "Unknown",
                };
                let response = format!(
                    "HTTP/1.1 {status} {reason}\r\nContent-Type: application/json\r\n\
                     Content-Length: {}\r\nConnection: close\r\n\r\n{body}",
                    body.len()
                );
                stream.write_all(response.as_bytes()).unwrap();
                served += 1;
            }
            served
        });
        (format!("http://{addr}"), handle)
    }

    pub fn song_json(results: &[(&str, &str, &str)]) -> String {
        let items: Vec<String> = results
            .iter()
            .map(|(artist, track, album)| {
                format!(
                    r#"{{"artistName":"{artist}","trackName":"{track}","collectionName":"{album}"}}"#
                )
            })
            .collect();
        format!(
            r#"{{"resultCount":{},"results":[{}]}}"#,
            results.len(),
            items.join(",")
        )
    }
}

#[cfg(test)]
mod tests {
    use super::test_http::serve;
    use super::*;
    use crate::models::TrackQuery;
    use std::net::TcpListener;

    fn resolver_for(base_url: &str) -> OnlineResolver {
        OnlineResolver::with_base_url(base_url, 120, 2, AdaptiveRateConfig::default())
    }

    fn song_json(results: &[(&str, &str, &str)]) -> String {
        super::test_http::song_json(results)
    }

    #[test]
    fn successful_search_returns_artist() {
        let body = song_json(&[("The Weeknd", "Blinding Lights", "After Hours")]);
        let (url, server) = serve(vec![(200, body)]);
        let resolver = resolver_for(&url);
        match resolver.search("Blinding Lights", None, None) {
            OnlineOutcome::Found(result) => {
                assert_eq!(result.artist_name.as_deref(), Some("The Weeknd"));
                assert_eq!(result.release_name.as_deref(), Some("After Hours"));
                assert_eq!(result.confidence, Confidence::High);
            }
            other => panic!("expected Found, got {other:?}"),
        }
        assert_eq!(server.join().unwrap(), 1);
    }

    #[test]
    fn prefers_prefix_matching_track_name() {
        let body = song_json(&[
            ("Karaoke Krew", "Lights Down Low", "Karaoke Nights"),
            ("The Weeknd", "Blinding Lights", "After Hours"),
        ]);
        let (url, server) = serve(vec![(200, body)]);
        let resolver = resolver_for(&url);
        match resolver.search("Blinding Lights", None, None) {
            OnlineOutcome::Found(result) => {
                assert_eq!(result.artist_name.as_deref(), Some("The Weeknd"));
            }
            other => panic!("expected Found, got {other:?}"),
        }
        server.join().unwrap();
    }

    #[test]
    fn falls_back_to_first_result() {
        let body = song_json(&[("Somebody", "A Different Song Entirely", "Album")]);
        let (url, server) = serve(vec![(200, body)]);
        let resolver = resolver_for(&url);
        match resolver.search("Blinding Lights", None, None) {
            OnlineOutcome::Found(result) => {
                assert_eq!(result.artist_name.as_deref(), Some("Somebody"));
                assert_eq!(result.confidence, Confidence::Low);
            }
            other => panic!("expected Found, got {other:?}"),
        }
        server.join().unwrap();
    }

    #[test]
    fn http_403_is_rate_limited_and_backs_off() {
        let (url, server) = serve(vec![(403, String::new())]);
        let resolver = resolver_for(&url);
        let before = resolver.limiter.current_rpm();
        match resolver.search("Some Song", None, None) {
            OnlineOutcome::RateLimited => {}
            other => panic!("expected RateLimited, got {other:?}"),
        }
        assert!(resolver.limiter.current_rpm() < before);
        server.join().unwrap();
    }

    #[test]
    fn zero_results_with_album_retries_title_only() {
        let empty = r#"{"resultCount":0,"results":[]}"#.to_string();
        let found = song_json(&[("The Weeknd", "Blinding Lights", "After Hours")]);
        let (url, server) = serve(vec![(200, empty), (200, found)]);
        let resolver = resolver_for(&url);
        match resolver.search("Blinding Lights", Some("After Hours"), None) {
            OnlineOutcome::Found(result) => {
                assert_eq!(result.artist_name.as_deref(), Some("The Weeknd"));
            }
            other => panic!("expected Found, got {other:?}"),
        }
        assert_eq!(server.join().unwrap(), 2);
    }

    #[test]
    fn zero_results_twice_is_not_found() {
        let empty = r#"{"resultCount":0,"results":[]}"#.to_string();
        let (url, server) = serve(vec![(200, empty.clone()), (200, empty)]);
        let resolver = resolver_for(&url);
        match resolver.search("Nonexistent", Some("Nowhere"), None) {
            OnlineOutcome::NotFound => {}
            other => panic!("expected NotFound, got {other:?}"),
        }
        assert_eq!(server.join().unwrap(), 2);
    }

    #[test]
    fn malformed_json_is_invalid() {
        let (url, server) = serve(vec![(200, "{not json at all".to_string())]);
        let resolver = resolver_for(&url);
        match resolver.search("Some Song", None, None) {
            OnlineOutcome::Invalid(_) => {}
            other => panic!("expected Invalid, got {other:?}"),
        }
        server.join().unwrap();
    }

    #[test]
    fn missing_required_field_is_invalid() {
        let body = r#"{"resultCount":1,"results":[{"trackName":"No Artist Here"}]}"#.to_string();
        let (url, server) = serve(vec![(200, body)]);
        let resolver = resolver_for(&url);
        match resolver.search("Some Song", None, None) {
            OnlineOutcome::Invalid(_) => {}
            other => panic!("expected Invalid, got {other:?}"),
        }
        server.join().unwrap();
    }

    #[test]
    fn http_500_is_network_error() {
        let (url, server) = serve(vec![(500, String::new())]);
        let resolver = resolver_for(&url);
        match resolver.search("Some Song", None, None) {
            OnlineOutcome::NetworkError(_) => {}
            other => panic!("expected NetworkError, got {other:?}"),
        }
        server.join().unwrap();
    }

    #[test]
    fn connection_refused_is_network_error() {
        // Bind and immediately drop to get a port with nothing listening.
        let port = {
            let listener = TcpListener::bind("127.0.0.1:0").unwrap();
            listener.local_addr().unwrap().port()
        };
        let resolver = resolver_for(&format!("http://127.0.0.1:{port}"));
        match resolver.search("Some Song", None, None) {
            OnlineOutcome::NetworkError(_) => {}
            other => panic!("expected NetworkError, got {other:?}"),
        }
    }

    #[test]
    fn cancelled_before_request() {
        let resolver = resolver_for("http://127.0.0.1:1");
        resolver.cancel();
        match resolver.search("Some Song", None, None) {
            OnlineOutcome::Cancelled => {}
            other => panic!("expected Cancelled, got {other:?}"),
        }
    }

    #[test]
    fn artist_hint_disagreement_downgrades() {
        let body = song_json(&[("Totally Different Band", "Blinding Lights", "Covers")]);
        let (url, server) = serve(vec![(200, body)]);
        let resolver = resolver_for(&url);
        match resolver.search("Blinding Lights", None, Some("The Weeknd")) {
            OnlineOutcome::Found(result) => {
                assert_eq!(result.confidence, Confidence::Medium);
                assert!(result.reason.contains("disagrees"));
            }
            other => panic!("expected Found, got {other:?}"),
        }
        server.join().unwrap();
    }

    #[test]
    fn retry_drains_bucket() {
        let body = song_json(&[("The Weeknd", "Blinding Lights", "After Hours")]);
        let (url, server) = serve(vec![(200, body)]);
        let resolver = resolver_for(&url);
        let bucket = vec![RateLimitedTrack {
            index: 7,
            query: TrackQuery::new("Blinding Lights"),
            attempted_at: 0,
        }];
        let outcomes = resolver.retry(&bucket);
        assert_eq!(outcomes.len(), 1);
        assert_eq!(outcomes[0].0, 7);
        assert!(matches!(outcomes[0].1, OnlineOutcome::Found(_)));
        server.join().unwrap();
    }
}
