//! Two-layer mapping cache.
//!
//! Layer 1 is a bounded in-memory LRU over full `MatchResult`s, keyed by
//! the cleaned (title, artist, album) triple; every resolve lands here,
//! including `low` and `no_match`. Layer 2 is the persistent verified
//! store, keyed by a stable hash of the same triple; only results the
//! dispatcher considers trustworthy are written there, and a manual (user)
//! row always survives an auto overwrite.
//!
//! If the persistent store cannot be opened or a query fails, the cache
//! degrades to memory-only with a single warning. Resolution never blocks
//! on cache problems.

use std::num::NonZeroUsize;
use std::path::Path;
use std::sync::Mutex;
use std::time::{SystemTime, UNIX_EPOCH};

use lru::LruCache;
use rusqlite::Connection;
use sha2::{Digest, Sha256};
use tracing::warn;

use crate::models::{
    Confidence, MappingConfidence, MatchResult, TrackQuery, VerifiedBy, VerifiedMapping,
};
use crate::text::clean_conservative;

/// Default LRU capacity; roughly one large export's worth of distinct keys.
pub const DEFAULT_LRU_CAPACITY: usize = 50_000;

const CREATE_MAPPINGS_SQL: &str = "\
    CREATE TABLE IF NOT EXISTS verified_mappings ( \
        track_hash        TEXT PRIMARY KEY, \
        apple_song        TEXT NOT NULL, \
        apple_album       TEXT NOT NULL DEFAULT '', \
        apple_artist      TEXT NOT NULL DEFAULT '', \
        mb_artist_credit  TEXT NOT NULL, \
        mb_release        TEXT, \
        confidence        TEXT NOT NULL \
            CHECK (confidence IN ('high', 'medium', 'manual', 'low')), \
        verified_by       TEXT NOT NULL CHECK (verified_by IN ('auto', 'user')), \
        created_at        INTEGER NOT NULL, \
        last_used_at      INTEGER NOT NULL \
    )";

type LruKey = (String, String, String);

fn now_unix() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}

/// Stable hash of the cleaned (song, album, artist) triple, hex-encoded.
pub fn track_hash(song_clean: &str, album_clean: &str, artist_clean: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(song_clean.as_bytes());
    hasher.update([0x1f]);
    hasher.update(album_clean.as_bytes());
    hasher.update([0x1f]);
    hasher.update(artist_clean.as_bytes());
    let digest = hasher.finalize();
    digest.iter().map(|b| format!("{b:02x}")).collect()
}

pub struct MappingCache {
    lru: Mutex<LruCache<LruKey, MatchResult>>,
    /// `None` once the store has degraded to memory-only.
    store: Mutex<Option<Connection>>,
}

impl MappingCache {
    /// Open (or create) the persistent store at `path`. Falls back to
    /// memory-only on any I/O problem.
    pub fn open(path: &Path, lru_capacity: usize) -> MappingCache {
        let store = match Self::open_store(path) {
            Ok(conn) => Some(conn),
            Err(e) => {
                warn!(
                    "mapping store unavailable ({e}); continuing with in-memory cache only"
                );
                None
            }
        };
        MappingCache {
            lru: Mutex::new(LruCache::new(lru_cap(lru_capacity))),
            store: Mutex::new(store),
        }
    }

    /// A cache with a throwaway in-memory persistent store.
    pub fn in_memory(lru_capacity: usize) -> MappingCache {
        let conn = Connection::open_in_memory().ok().and_then(|conn| {
            conn.execute_batch(CREATE_MAPPINGS_SQL).ok()?;
            Some(conn)
        });
        MappingCache {
            lru: Mutex::new(LruCache::new(lru_cap(lru_capacity))),
            store: Mutex::new(conn),
        }
    }

    fn open_store(path: &Path) -> Result<Connection, rusqlite::Error> {
        let conn = Connection::open(path)?;
        conn.execute_batch("PRAGMA journal_mode = WAL; PRAGMA synchronous = NORMAL;")?;
        conn.execute_batch(CREATE_MAPPINGS_SQL)?;
        Ok(conn)
    }

    pub fn is_degraded(&self) -> bool {
        self.store.lock().unwrap().is_none()
    }

    fn lru_key(query: &TrackQuery) -> LruKey {
        (
            clean_conservative(&query.title),
            query
                .artist_hint
                .as_deref()
                .map(clean_conservative)
                .unwrap_or_default(),
            query
                .album_hint
                .as_deref()
                .map(clean_conservative)
                .unwrap_or_default(),
        )
    }

    fn query_hash(query: &TrackQuery) -> String {
        let (song, artist, album) = Self::lru_key(query);
        track_hash(&song, &album, &artist)
    }

    /// Look up a query: persistent verified mapping first (touching its
    /// `last_used_at`), then the LRU.
    pub fn lookup(&self, query: &TrackQuery) -> Option<MatchResult> {
        if let Some(mapping) = self.persistent_lookup(query) {
            let confidence = match mapping.confidence {
                MappingConfidence::High | MappingConfidence::Manual => Confidence::High,
                MappingConfidence::Medium => Confidence::Medium,
                MappingConfidence::Low => Confidence::Low,
            };
            return Some(MatchResult {
                artist_name: Some(mapping.mb_artist_credit),
                release_name: mapping.mb_release,
                confidence,
                margin: f64::INFINITY,
                top_candidates: Vec::new(),
                reason: format!("verified mapping ({})", mapping.verified_by.as_str()),
            });
        }
        let mut lru = self.lru.lock().unwrap();
        lru.get(&Self::lru_key(query)).cloned()
    }

    /// Fetch the raw persistent row for a query, touching `last_used_at`.
    pub fn persistent_lookup(&self, query: &TrackQuery) -> Option<VerifiedMapping> {
        let hash = Self::query_hash(query);
        let mut guard = self.store.lock().unwrap();
        let conn = guard.as_ref()?;
        let result = conn
            .query_row(
                "SELECT track_hash, apple_song, apple_album, apple_artist, \
                 mb_artist_credit, mb_release, confidence, verified_by, \
                 created_at, last_used_at \
                 FROM verified_mappings WHERE track_hash = ?1",
                [&hash],
                |row| {
                    let confidence: String = row.get(6)?;
                    let verified_by: String = row.get(7)?;
                    Ok(VerifiedMapping {
                        track_hash: row.get(0)?,
                        apple_song: row.get(1)?,
                        apple_album: row.get(2)?,
                        apple_artist: row.get(3)?,
                        mb_artist_credit: row.get(4)?,
                        mb_release: row.get(5)?,
                        confidence: MappingConfidence::parse(&confidence)
                            .unwrap_or(MappingConfidence::Medium),
                        verified_by: if verified_by == "user" {
                            VerifiedBy::User
                        } else {
                            VerifiedBy::Auto
                        },
                        created_at: row.get(8)?,
                        last_used_at: row.get(9)?,
                    })
                },
            );
        match result {
            Ok(mapping) => {
                let _ = conn.execute(
                    "UPDATE verified_mappings SET last_used_at = ?1 WHERE track_hash = ?2",
                    rusqlite::params![now_unix(), hash],
                );
                Some(mapping)
            }
            Err(rusqlite::Error::QueryReturnedNoRows) => None,
            Err(e) => {
                warn!("mapping store query failed ({e}); degrading to in-memory cache");
                *guard = None;
                None
            }
        }
    }

    /// Persist a verified mapping. An existing user-verified row is never
    /// replaced by an auto one.
    pub fn store_verified(
        &self,
        query: &TrackQuery,
        result: &MatchResult,
        confidence: MappingConfidence,
        verified_by: VerifiedBy,
    ) {
        let Some(artist) = result.artist_name.as_deref() else {
            return;
        };
        let hash = Self::query_hash(query);
        let now = now_unix();
        let mut guard = self.store.lock().unwrap();
        let Some(conn) = guard.as_ref() else {
            return;
        };
        let outcome = conn.execute(
            "INSERT INTO verified_mappings \
             (track_hash, apple_song, apple_album, apple_artist, mb_artist_credit, \
              mb_release, confidence, verified_by, created_at, last_used_at) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?9) \
             ON CONFLICT(track_hash) DO UPDATE SET \
                mb_artist_credit = excluded.mb_artist_credit, \
                mb_release = excluded.mb_release, \
                confidence = excluded.confidence, \
                verified_by = excluded.verified_by, \
                last_used_at = excluded.last_used_at \
             WHERE verified_mappings.verified_by != 'user' \
                OR excluded.verified_by = 'user'",
            rusqlite::params![
                hash,
                query.title,
                query.album_hint.as_deref().unwrap_or(""),
                query.artist_hint.as_deref().unwrap_or(""),
                artist,
                result.release_name,
                confidence.as_str(),
                verified_by.as_str(),
                now,
            ],
        );
        if let Err(e) = outcome {
            warn!("mapping store write failed ({e}); degrading to in-memory cache");
            *guard = None;
        }
    }

    /// Record a user override: always wins, stored as `manual`.
    pub fn store_manual(&self, query: &TrackQuery, artist: &str, release: Option<&str>) {
        let result = MatchResult {
            artist_name: Some(artist.to_string()),
            release_name: release.map(str::to_string),
            confidence: Confidence::High,
            margin: f64::INFINITY,
            top_candidates: Vec::new(),
            reason: "manual override".to_string(),
        };
        self.store_verified(query, &result, MappingConfidence::Manual, VerifiedBy::User);
        self.put_lru(query, result);
    }

    /// Explicit user deletion; mappings are never evicted implicitly.
    pub fn delete(&self, query: &TrackQuery) {
        let hash = Self::query_hash(query);
        let guard = self.store.lock().unwrap();
        if let Some(conn) = guard.as_ref() {
            let _ = conn.execute(
                "DELETE FROM verified_mappings WHERE track_hash = ?1",
                [&hash],
            );
        }
        drop(guard);
        let mut lru = self.lru.lock().unwrap();
        lru.pop(&Self::lru_key(query));
    }

    pub fn put_lru(&self, query: &TrackQuery, result: MatchResult) {
        let mut lru = self.lru.lock().unwrap();
        lru.put(Self::lru_key(query), result);
    }

    /// Dropped wholesale on mode switches: results are only comparable
    /// within one matching mode.
    pub fn clear_lru(&self) {
        let mut lru = self.lru.lock().unwrap();
        lru.clear();
    }

    pub fn lru_len(&self) -> usize {
        self.lru.lock().unwrap().len()
    }

    pub fn persistent_count(&self) -> usize {
        let guard = self.store.lock().unwrap();
        match guard.as_ref() {
            Some(conn) => conn
                .query_row("SELECT COUNT(*) FROM verified_mappings", [], |row| {
                    row.get::<_, i64>(0)
                })
                .unwrap_or(0) as usize,
            None => 0,
        }
    }

    /// Distinct confidence tags present in the persistent store.
    pub fn persistent_confidences(&self) -> Vec<String> {
        let guard = self.store.lock().unwrap();
        let mut out = Vec::new();
        if let Some(conn) = guard.as_ref() {
            if let Ok(mut stmt) =
                conn.prepare("SELECT DISTINCT confidence FROM verified_mappings")
            {
                if let Ok(rows) = stmt.query_map([], |row| row.get::<_, String>(0)) {
                    for row in rows.flatten() {
                        out.push(row);
                    }
                }
            }
        }
        out
    }
}

fn lru_cap(capacity: usize) -> NonZeroUsize {
    NonZeroUsize::new(capacity.max(1)).unwrap()
}

// ============================================================================
// TESTS
// ============================================================================
