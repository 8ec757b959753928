//! Album-session detection and artist-credit alignment.
//!
//! Listening history is bursty: people play albums front to back. A run of
//! three or more consecutive tracks sharing a cleaned album name is treated
//! as one session, and every resolved track in it is re-checked with the
//! release's modal artist credit as a mandatory hint. This pulls generic
//! in-album titles ("Intro", "Interlude") onto the same credit as their
//! neighbours. Alignment only ever rewrites the artist name; it never
//! downgrades a confidence that resolution already assigned.

use crate::models::{AlbumSession, Confidence, TrackOutcome, TrackQuery};
use crate::offline::OfflineResolver;
use crate::store::StoreError;
use crate::text::clean_conservative;

/// Minimum run length that forms a session.
const MIN_SESSION_LEN: usize = 3;

/// Detect maximal runs of >= 3 consecutive tracks with equal, non-empty
/// cleaned album names. Indices are positions in `queries`.
pub fn detect_sessions(queries: &[TrackQuery]) -> Vec<AlbumSession> {
    let cleaned: Vec<String> = queries
        .iter()
        .map(|q| {
            q.album_hint
                .as_deref()
                .map(clean_conservative)
                .unwrap_or_default()
        })
        .collect();

    let mut sessions = Vec::new();
    let mut i = 0;
    while i < cleaned.len() {
        if cleaned[i].is_empty() {
            i += 1;
            continue;
        }
        let mut j = i + 1;
        while j < cleaned.len() && cleaned[j] == cleaned[i] {
            j += 1;
        }
        if j - i >= MIN_SESSION_LEN {
            sessions.push(AlbumSession {
                album_clean: cleaned[i].clone(),
                tracks: (i..j).collect(),
                aligned: false,
                artist_credit: None,
            });
        }
        i = j;
    }
    sessions
}

/// Align one session: find the modal artist credit for the release in the
/// offline store, re-resolve each track with it as a mandatory hint, and
/// rewrite the credit on already-resolved tracks whose re-resolution
/// confirms the modal at medium confidence or better.
///
/// Returns whether the session was aligned. A release unknown to the store
/// leaves the session untouched.
pub fn align_session(
    resolver: &OfflineResolver,
    session: &mut AlbumSession,
    queries: &[TrackQuery],
    outcomes: &mut [Option<TrackOutcome>],
) -> Result<bool, StoreError> {
    if session.aligned {
        return Ok(true);
    }
    let credits = resolver.store().release_artist_credits(&session.album_clean)?;
    let Some((modal, _)) = credits.into_iter().next() else {
        return Ok(false);
    };

    for &idx in &session.tracks {
        let Some(TrackOutcome::Resolved(resolution)) = outcomes.get_mut(idx).and_then(Option::as_mut)
        else {
            continue;
        };
        if resolution.result.artist_name.as_deref() == Some(modal.as_str()) {
            continue;
        }
        let query = &queries[idx];
        let confirmed = resolver.search(
            &query.title,
            Some(&modal),
            query.album_hint.as_deref(),
        )?;
        if confirmed.confidence < Confidence::Medium
            || confirmed.artist_name.as_deref() != Some(modal.as_str())
        {
            continue;
        }
        if resolution.result.is_match() {
            // An existing credit is rewritten in place; its confidence is
            // whatever resolution already assigned, never lowered.
            resolution.result.artist_name = Some(modal.clone());
        } else {
            // A generic in-album title ("Intro") that resolved to nothing
            // on its own adopts the confirmed session credit wholesale.
            resolution.result = confirmed;
        }
    }

    session.aligned = true;
    session.artist_credit = Some(modal);
    Ok(true)
}

/// Align every unaligned session. Returns how many sessions were aligned
/// in this pass.
pub fn align_sessions(
    resolver: &OfflineResolver,
    sessions: &mut [AlbumSession],
    queries: &[TrackQuery],
    outcomes: &mut [Option<TrackOutcome>],
) -> Result<usize, StoreError> {
    let mut aligned = 0;
    for session in sessions.iter_mut().filter(|s| !s.aligned) {
        if align_session(resolver, session, queries, outcomes)? {
            aligned += 1;
        }
    }
    Ok(aligned)
}

// ============================================================================
// TESTS
// ============================================================================
