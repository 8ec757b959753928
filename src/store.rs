//! Read-only access to the optimized MusicBrainz corpus.
//!
//! The database holds two partitions of the same canonical recording table:
//! `recordings_hot` (scores at or below the 15th-percentile threshold, the
//! established entries) and `recordings_cold` (everything else). Every row
//! lives in exactly one of the two. All writes happen at build time in
//! [`crate::ingest`]; at runtime the connection is opened read-only.

use std::path::{Path, PathBuf};

use rusqlite::{Connection, OpenFlags};
use thiserror::Error;

use crate::models::{RecordingRow, ReleaseType};

/// Bumped whenever the schema or the cleaning rules change; a mismatch
/// means the optimized DB must be rebuilt with `build-db`.
pub const SCHEMA_VERSION: i32 = 3;

/// Share of lowest-score rows that land in the HOT partition.
pub const HOT_PERCENTILE: f64 = 0.15;

/// Ordering bonus applied at query time to rows whose release matches the
/// album hint, so they dominate regardless of score.
const ALBUM_SQL_BOOST: i64 = 1_000_000_000;

/// Shortest cleaned recording name allowed to anchor a reverse-contains
/// match; anything shorter matches half the corpus.
const REVERSE_CONTAINS_MIN_LEN: usize = 3;

pub(crate) const CREATE_SCHEMA_SQL: &str = r#"
CREATE TABLE IF NOT EXISTS recordings_hot (
    recording_id              INTEGER NOT NULL,
    recording_name            TEXT NOT NULL,
    recording_name_clean      TEXT NOT NULL,
    artist_credit_name        TEXT NOT NULL,
    artist_credit_name_clean  TEXT NOT NULL,
    release_name              TEXT NOT NULL,
    release_name_clean        TEXT NOT NULL,
    score                     INTEGER NOT NULL,
    release_type              TEXT
);
CREATE TABLE IF NOT EXISTS recordings_cold (
    recording_id              INTEGER NOT NULL,
    recording_name            TEXT NOT NULL,
    recording_name_clean      TEXT NOT NULL,
    artist_credit_name        TEXT NOT NULL,
    artist_credit_name_clean  TEXT NOT NULL,
    release_name              TEXT NOT NULL,
    release_name_clean        TEXT NOT NULL,
    score                     INTEGER NOT NULL,
    release_type              TEXT
);
"#;

pub(crate) const CREATE_INDEX_SQL: &str = r#"
CREATE INDEX IF NOT EXISTS idx_hot_name ON recordings_hot(recording_name_clean);
CREATE INDEX IF NOT EXISTS idx_hot_artist ON recordings_hot(artist_credit_name_clean);
CREATE INDEX IF NOT EXISTS idx_hot_release ON recordings_hot(release_name_clean);
CREATE INDEX IF NOT EXISTS idx_cold_name ON recordings_cold(recording_name_clean);
CREATE INDEX IF NOT EXISTS idx_cold_artist ON recordings_cold(artist_credit_name_clean);
CREATE INDEX IF NOT EXISTS idx_cold_release ON recordings_cold(release_name_clean);
"#;

// ============================================================================
// Errors
// ============================================================================

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("offline database not found at {0}")]
    Missing(PathBuf),

    #[error("offline database is corrupt or not a trackmatch database: {0}")]
    Corrupt(String),

    #[error("offline database schema version {found}, expected {expected}; rebuild with build-db")]
    VersionMismatch { found: i32, expected: i32 },

    #[error("offline query failed: {0}")]
    Query(#[from] rusqlite::Error),
}

// ============================================================================
// Query surface
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Partition {
    Hot,
    Cold,
}

impl Partition {
    pub fn table_name(self) -> &'static str {
        match self {
            Partition::Hot => "recordings_hot",
            Partition::Cold => "recordings_cold",
        }
    }
}

/// Cascade levels, cheapest first. Each level is only consulted when the
/// previous one came back empty.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CascadeLevel {
    Exact,
    Prefix,
    Contains,
    ReverseContains,
}

impl CascadeLevel {
    pub const ALL: [CascadeLevel; 4] = [
        CascadeLevel::Exact,
        CascadeLevel::Prefix,
        CascadeLevel::Contains,
        CascadeLevel::ReverseContains,
    ];

    pub fn describe(self) -> &'static str {
        match self {
            CascadeLevel::Exact => "exact title",
            CascadeLevel::Prefix => "title prefix",
            CascadeLevel::Contains => "title substring",
            CascadeLevel::ReverseContains => "title with trailing qualifier",
        }
    }

    fn predicate(self) -> String {
        match self {
            CascadeLevel::Exact => "recording_name_clean = ?1".to_string(),
            CascadeLevel::Prefix => "recording_name_clean LIKE ?1 || '%'".to_string(),
            CascadeLevel::Contains => "recording_name_clean LIKE '%' || ?1 || '%'".to_string(),
            CascadeLevel::ReverseContains => format!(
                "?1 LIKE '%' || recording_name_clean || '%' AND length(recording_name_clean) >= {REVERSE_CONTAINS_MIN_LEN}"
            ),
        }
    }
}

fn cascade_sql(partition: Partition, level: CascadeLevel) -> String {
    // One row per artist credit: GROUP BY with a single MIN() aggregate, so
    // the bare columns come from the winning (lowest sort key) row. The
    // album boost is folded into the sort key; ?3 = '' disables it.
    format!(
        "SELECT recording_id, recording_name, recording_name_clean, \
                artist_credit_name, artist_credit_name_clean, \
                release_name, release_name_clean, score, release_type, \
                MIN(score - (CASE WHEN ?3 <> '' AND release_name_clean LIKE '%' || ?3 || '%' \
                             THEN {boost} ELSE 0 END)) AS sort_key \
         FROM {table} \
         WHERE {predicate} \
         GROUP BY artist_credit_name \
         ORDER BY (?2 <> '' AND artist_credit_name_clean = ?2) DESC, sort_key ASC \
         LIMIT ?4",
        boost = ALBUM_SQL_BOOST,
        table = partition.table_name(),
        predicate = level.predicate(),
    )
}

const TITLE_COUNT_SQL: &str = "\
    SELECT COUNT(DISTINCT artist_credit_name) FROM ( \
        SELECT artist_credit_name FROM recordings_hot WHERE recording_name_clean = ?1 \
        UNION ALL \
        SELECT artist_credit_name FROM recordings_cold WHERE recording_name_clean = ?1 \
    )";

const RELEASE_CREDITS_SQL: &str = "\
    SELECT artist_credit_name, COUNT(*) AS n FROM ( \
        SELECT artist_credit_name FROM recordings_hot \
         WHERE release_name_clean LIKE '%' || ?1 || '%' \
        UNION ALL \
        SELECT artist_credit_name FROM recordings_cold \
         WHERE release_name_clean LIKE '%' || ?1 || '%' \
    ) \
    GROUP BY artist_credit_name \
    ORDER BY n DESC, artist_credit_name ASC";

// ============================================================================
// Store
// ============================================================================

/// Owns the read-only connection and its prepared statements. Not `Sync`;
/// each worker thread opens its own store against the same file.
#[derive(Debug)]
pub struct OfflineStore {
    conn: Connection,
}

impl OfflineStore {
    /// Open and validate an optimized database file.
    pub fn open(path: &Path) -> Result<OfflineStore, StoreError> {
        if !path.exists() {
            return Err(StoreError::Missing(path.to_path_buf()));
        }
        let conn = Connection::open_with_flags(
            path,
            OpenFlags::SQLITE_OPEN_READ_ONLY | OpenFlags::SQLITE_OPEN_NO_MUTEX,
        )
        .map_err(|e| StoreError::Corrupt(e.to_string()))?;

        let version: i32 = conn
            .query_row("PRAGMA user_version", [], |row| row.get(0))
            .map_err(|e| StoreError::Corrupt(e.to_string()))?;
        if version != SCHEMA_VERSION {
            return Err(StoreError::VersionMismatch {
                found: version,
                expected: SCHEMA_VERSION,
            });
        }

        let tables: i64 = conn
            .query_row(
                "SELECT COUNT(*) FROM sqlite_master WHERE type = 'table' \
                 AND name IN ('recordings_hot', 'recordings_cold')",
                [],
                |row| row.get(0),
            )
            .map_err(|e| StoreError::Corrupt(e.to_string()))?;
        if tables != 2 {
            return Err(StoreError::Corrupt(
                "missing recordings_hot/recordings_cold tables".to_string(),
            ));
        }

        let store = OfflineStore { conn };
        store.prepare_queries()?;
        Ok(store)
    }

    /// Wrap an existing connection. Intended for tests and the ingestion
    /// pipeline, which build the schema themselves.
    #[doc(hidden)]
    pub fn from_connection(conn: Connection) -> OfflineStore {
        OfflineStore { conn }
    }

    /// Parse and cache every cascade statement up front so a malformed
    /// schema surfaces at open time, not mid-batch.
    pub fn prepare_queries(&self) -> Result<(), StoreError> {
        for partition in [Partition::Hot, Partition::Cold] {
            for level in CascadeLevel::ALL {
                self.conn.prepare_cached(&cascade_sql(partition, level))?;
            }
        }
        self.conn.prepare_cached(TITLE_COUNT_SQL)?;
        self.conn.prepare_cached(RELEASE_CREDITS_SQL)?;
        Ok(())
    }

    /// Run one cascade statement. Returns at most one row per artist
    /// credit, ordered by artist-hint exactness then ascending score (with
    /// the album ordering boost applied when `album_hint_clean` is set).
    pub fn search(
        &self,
        partition: Partition,
        level: CascadeLevel,
        clean_title: &str,
        artist_hint_clean: Option<&str>,
        album_hint_clean: Option<&str>,
        row_limit: usize,
    ) -> Result<Vec<RecordingRow>, StoreError> {
        let sql = cascade_sql(partition, level);
        let mut stmt = self.conn.prepare_cached(&sql)?;
        let artist = artist_hint_clean.unwrap_or("");
        let album = album_hint_clean.unwrap_or("");
        let mut rows = stmt.query(rusqlite::params![
            clean_title,
            artist,
            album,
            row_limit as i64
        ])?;
        let mut out = Vec::new();
        while let Some(row) = rows.next()? {
            let release_type: Option<String> = row.get(8)?;
            out.push(RecordingRow {
                recording_id: row.get(0)?,
                recording_name: row.get(1)?,
                recording_name_clean: row.get(2)?,
                artist_credit_name: row.get(3)?,
                artist_credit_name_clean: row.get(4)?,
                release_name: row.get(5)?,
                release_name_clean: row.get(6)?,
                score: row.get(7)?,
                release_type: release_type.as_deref().and_then(ReleaseType::parse),
            });
        }
        Ok(out)
    }

    /// Number of distinct artist credits sharing this exact cleaned title
    /// across both partitions. Drives the common-title policy.
    pub fn title_candidate_count(&self, clean_title: &str) -> Result<i64, StoreError> {
        let mut stmt = self.conn.prepare_cached(TITLE_COUNT_SQL)?;
        Ok(stmt.query_row([clean_title], |row| row.get(0))?)
    }

    /// Artist credits appearing on a release, most frequent first. Used by
    /// the session aligner to find the modal credit for an album.
    pub fn release_artist_credits(
        &self,
        album_clean: &str,
    ) -> Result<Vec<(String, i64)>, StoreError> {
        let mut stmt = self.conn.prepare_cached(RELEASE_CREDITS_SQL)?;
        let mut rows = stmt.query([album_clean])?;
        let mut out = Vec::new();
        while let Some(row) = rows.next()? {
            out.push((row.get(0)?, row.get(1)?));
        }
        Ok(out)
    }

    pub fn count(&self, partition: Partition) -> Result<i64, StoreError> {
        let sql = format!("SELECT COUNT(*) FROM {}", partition.table_name());
        Ok(self.conn.query_row(&sql, [], |row| row.get(0))?)
    }

    /// (min, max) score within a partition; `None` when empty.
    pub fn score_bounds(&self, partition: Partition) -> Result<Option<(i64, i64)>, StoreError> {
        let sql = format!(
            "SELECT MIN(score), MAX(score) FROM {}",
            partition.table_name()
        );
        let bounds: (Option<i64>, Option<i64>) =
            self.conn
                .query_row(&sql, [], |row| Ok((row.get(0)?, row.get(1)?)))?;
        Ok(match bounds {
            (Some(lo), Some(hi)) => Some((lo, hi)),
            _ => None,
        })
    }
}

// ============================================================================
// TESTS
// ============================================================================


#[cfg(test)]
mod tests {
    use super::test_support::{empty_store, insert};
    use super::*;

    fn sample_store() -> OfflineStore {
        let store = empty_store();
        insert(&store, Partition::Hot, 1, "Blinding Lights", "The Weeknd", "After Hours", 500_000);
        insert(&store, Partition::Hot, 2, "Blinding Lights", "Pete Frogs", "Frog Covers", 4_000_000);
        insert(&store, Partition::Hot, 3, "Blinding Lights (Remix)", "The Weeknd", "After Hours Remixes", 900_000);
        insert(&store, Partition::Cold, 4, "Say You Will", "Kanye West", "808s & Heartbreak", 5_501_542);
        insert(&store, Partition::Cold, 5, "Blinding Lights", "Karaoke Stars", "Karaoke Hits", 9_000_000);
        store
    }

    #[test]
    fn exact_search_orders_by_score() {
        let store = sample_store();
        let rows = store
            .search(Partition::Hot, CascadeLevel::Exact, "blinding lights", None, None, 10)
            .unwrap();
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].artist_credit_name, "The Weeknd");
        assert_eq!(rows[1].artist_credit_name, "Pete Frogs");
    }

    #[test]
    fn artist_hint_outranks_score() {
        let store = sample_store();
        let rows = store
            .search(
                Partition::Hot,
                CascadeLevel::Exact,
                "blinding lights",
                Some("pete frogs"),
                None,
                10,
            )
            .unwrap();
        assert_eq!(rows[0].artist_credit_name, "Pete Frogs");
    }

    #[test]
    fn prefix_and_contains_levels() {
        let store = sample_store();
        let prefix = store
            .search(Partition::Hot, CascadeLevel::Prefix, "blinding", None, None, 10)
            .unwrap();
        assert!(!prefix.is_empty());
        let contains = store
            .search(Partition::Hot, CascadeLevel::Contains, "lights", None, None, 10)
            .unwrap();
        assert!(!contains.is_empty());
    }

    #[test]
    fn reverse_contains_matches_trailing_qualifier() {
        let store = sample_store();
        let rows = store
            .search(
                Partition::Hot,
                CascadeLevel::ReverseContains,
                "blinding lights extended mix",
                None,
                None,
                10,
            )
            .unwrap();
        assert!(rows.iter().any(|r| r.artist_credit_name == "The Weeknd"));
    }

    #[test]
    fn one_row_per_artist_credit() {
        let store = sample_store();
        // "The Weeknd" has two matching recordings under Contains; only the
        // lower-score one may surface.
        let rows = store
            .search(Partition::Hot, CascadeLevel::Contains, "blinding lights", None, None, 10)
            .unwrap();
        let weeknd: Vec<_> = rows
            .iter()
            .filter(|r| r.artist_credit_name == "The Weeknd")
            .collect();
        assert_eq!(weeknd.len(), 1);
        assert_eq!(weeknd[0].score, 500_000);
    }

    #[test]
    fn album_boost_dominates_score() {
        let store = empty_store();
        insert(&store, Partition::Hot, 1, "Say You Will", "Wrong Artist", "Greatest Hits", 100);
        insert(&store, Partition::Hot, 2, "Say You Will", "Kanye West", "808s & Heartbreak", 5_000_000);
        let rows = store
            .search(
                Partition::Hot,
                CascadeLevel::Exact,
                "say you will",
                None,
                Some("808s & heartbreak"),
                10,
            )
            .unwrap();
        assert_eq!(rows[0].artist_credit_name, "Kanye West");
    }

    #[test]
    fn title_candidate_count_spans_partitions() {
        let store = sample_store();
        assert_eq!(store.title_candidate_count("blinding lights").unwrap(), 3);
        assert_eq!(store.title_candidate_count("say you will").unwrap(), 1);
        assert_eq!(store.title_candidate_count("nope").unwrap(), 0);
    }

    #[test]
    fn release_artist_credits_modal_first() {
        let store = empty_store();
        insert(&store, Partition::Hot, 1, "Intro", "The Weeknd", "After Hours", 10);
        insert(&store, Partition::Hot, 2, "Blinding Lights", "The Weeknd", "After Hours", 11);
        insert(&store, Partition::Cold, 3, "Scared to Live", "The Weeknd", "After Hours", 12);
        insert(&store, Partition::Cold, 4, "In Your Eyes", "Someone Else", "After Hours", 13);
        let credits = store.release_artist_credits("after hours").unwrap();
        assert_eq!(credits[0].0, "The Weeknd");
        assert_eq!(credits[0].1, 3);
    }

    #[test]
    fn open_missing_file() {
        let err = OfflineStore::open(Path::new("/nonexistent/nowhere.sqlite3")).unwrap_err();
        assert!(matches!(err, StoreError::Missing(_)));
    }

    #[test]
    fn open_rejects_version_mismatch() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("old.sqlite3");
        let conn = Connection::open(&path).unwrap();
        conn.execute_batch(CREATE_SCHEMA_SQL).unwrap();
        conn.pragma_update(None, "user_version", 1).unwrap();
        drop(conn);
        let err = OfflineStore::open(&path).unwrap_err();
        assert!(matches!(
            err,
            StoreError::VersionMismatch { found: 1, expected: SCHEMA_VERSION }
        ));
    }

    #[test]
    fn open_rejects_foreign_database() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("foreign.sqlite3");
        let conn = Connection::open(&path).unwrap();
        conn.execute_batch("CREATE TABLE something_else (x INTEGER);")
            .unwrap();
        conn.pragma_update(None, "user_version", SCHEMA_VERSION).unwrap();
        drop(conn);
        let err = OfflineStore::open(&path).unwrap_err();
        assert!(matches!(err, StoreError::Corrupt(_)));
    }

    #[test]
    fn score_bounds_and_counts() {
        let store = sample_store();
        assert_eq!(store.count(Partition::Hot).unwrap(), 3);
        assert_eq!(store.count(Partition::Cold).unwrap(), 2);
        let (lo, hi) = store.score_bounds(Partition::Hot).unwrap().unwrap();
        assert_eq!(lo, 500_000);
        assert_eq!(hi, 4_000_000);
    }
}
