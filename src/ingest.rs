//! Build the optimized offline database from a canonical MusicBrainz CSV.
//!
//! The input is the already-decompressed canonical recording export with at
//! least `{recording_id, recording_name, artist_credit_name, release_name,
//! score}` columns. Fields are trimmed, `*_clean` columns are precomputed
//! with the conservative cleaner, and rows are split into the HOT partition
//! (scores at or below the 15th-percentile threshold) and COLD (the rest).
//! The split is computed once here and never changes at runtime.

use std::path::Path;
use std::time::Instant;

use anyhow::{bail, Context, Result};
use rayon::prelude::*;
use rusqlite::Connection;
use serde::Serialize;

use crate::models::ReleaseType;
use crate::progress::{format_duration, Reporter};
use crate::safety::check_output_path;
use crate::store::{CREATE_INDEX_SQL, CREATE_SCHEMA_SQL, HOT_PERCENTILE, SCHEMA_VERSION};
use crate::text::clean_conservative;

/// Rows per multi-value INSERT. 9 columns each, comfortably under SQLite's
/// bound-parameter limit.
const BATCH_SIZE: usize = 3_000;

#[derive(Debug, Clone, Serialize)]
pub struct IngestReport {
    pub total: usize,
    pub hot: usize,
    pub cold: usize,
    pub threshold: i64,
    pub elapsed_seconds: f64,
}

struct RawRow {
    recording_id: i64,
    recording_name: String,
    artist_credit_name: String,
    release_name: String,
    score: i64,
    release_type: Option<ReleaseType>,
}

struct CleanRow {
    raw: RawRow,
    recording_name_clean: String,
    artist_credit_name_clean: String,
    release_name_clean: String,
}

/// Build a multi-value INSERT statement for a given number of rows.
fn build_batch_sql(table: &str, num_rows: usize) -> String {
    let mut sql = String::with_capacity(200 + num_rows * 20);
    sql.push_str(&format!(
        "INSERT INTO {table} (recording_id, recording_name, recording_name_clean, \
         artist_credit_name, artist_credit_name_clean, release_name, \
         release_name_clean, score, release_type) VALUES "
    ));
    for i in 0..num_rows {
        if i > 0 {
            sql.push(',');
        }
        sql.push_str("(?,?,?,?,?,?,?,?,?)");
    }
    sql
}

fn execute_batch_insert(conn: &Connection, table: &str, batch: &[CleanRow]) -> Result<()> {
    if batch.is_empty() {
        return Ok(());
    }
    let sql = build_batch_sql(table, batch.len());
    let mut stmt = conn.prepare_cached(&sql)?;
    let release_types: Vec<Option<&str>> = batch
        .iter()
        .map(|row| row.raw.release_type.map(ReleaseType::as_str))
        .collect();
    let params: Vec<&dyn rusqlite::ToSql> = batch
        .iter()
        .zip(release_types.iter())
        .flat_map(|(row, release_type)| {
            [
                &row.raw.recording_id as &dyn rusqlite::ToSql,
                &row.raw.recording_name as &dyn rusqlite::ToSql,
                &row.recording_name_clean as &dyn rusqlite::ToSql,
                &row.raw.artist_credit_name as &dyn rusqlite::ToSql,
                &row.artist_credit_name_clean as &dyn rusqlite::ToSql,
                &row.raw.release_name as &dyn rusqlite::ToSql,
                &row.release_name_clean as &dyn rusqlite::ToSql,
                &row.raw.score as &dyn rusqlite::ToSql,
                release_type as &dyn rusqlite::ToSql,
            ]
        })
        .collect();
    stmt.execute(params.as_slice())?;
    Ok(())
}

fn column_index(headers: &csv::StringRecord, names: &[&str]) -> Option<usize> {
    headers.iter().position(|h| {
        let h = h.trim().to_ascii_lowercase();
        names.iter().any(|n| h == *n)
    })
}

fn read_canonical_csv(csv_path: &Path, reporter: Reporter) -> Result<Vec<RawRow>> {
    let mut reader = csv::ReaderBuilder::new()
        .flexible(true)
        .from_path(csv_path)
        .with_context(|| format!("opening canonical CSV {}", csv_path.display()))?;

    let headers = reader.headers()?.clone();
    let id_col = column_index(&headers, &["recording_id", "id"])
        .context("canonical CSV is missing a recording_id column")?;
    let name_col = column_index(&headers, &["recording_name", "recording"])
        .context("canonical CSV is missing a recording_name column")?;
    let artist_col = column_index(&headers, &["artist_credit_name", "artist_credit"])
        .context("canonical CSV is missing an artist_credit_name column")?;
    let release_col = column_index(&headers, &["release_name", "release"])
        .context("canonical CSV is missing a release_name column")?;
    let score_col =
        column_index(&headers, &["score"]).context("canonical CSV is missing a score column")?;
    let type_col = column_index(&headers, &["release_type", "primary_type"]);

    let spinner = reporter.spinner("Reading canonical recordings");
    let mut rows = Vec::new();
    let mut skipped = 0usize;
    for record in reader.records() {
        let record = record?;
        let get = |idx: usize| record.get(idx).unwrap_or("").trim();
        let recording_name = get(name_col).to_string();
        let artist_credit_name = get(artist_col).to_string();
        if recording_name.is_empty() || artist_credit_name.is_empty() {
            skipped += 1;
            continue;
        }
        let (Ok(recording_id), Ok(score)) =
            (get(id_col).parse::<i64>(), get(score_col).parse::<i64>())
        else {
            skipped += 1;
            continue;
        };
        rows.push(RawRow {
            recording_id,
            recording_name,
            artist_credit_name,
            release_name: get(release_col).to_string(),
            score,
            release_type: type_col.and_then(|idx| ReleaseType::parse(get(idx))),
        });
        if rows.len() % 1_000_000 == 0 {
            spinner.set_message(format!("Reading canonical recordings ({}M)", rows.len() / 1_000_000));
        }
    }
    spinner.finish_with_message(format!(
        "Read {} canonical rows ({} skipped)",
        rows.len(),
        skipped
    ));
    if rows.is_empty() {
        bail!("canonical CSV {} contained no usable rows", csv_path.display());
    }
    Ok(rows)
}

/// Approximate quantile over all scores: the value at the 15th-percentile
/// rank. Ties at the threshold land in HOT, which keeps the partition
/// invariant max(HOT.score) <= min(COLD.score).
fn hot_threshold(rows: &[RawRow]) -> i64 {
    let mut scores: Vec<i64> = rows.iter().map(|r| r.score).collect();
    scores.sort_unstable();
    let rank = ((scores.len() - 1) as f64 * HOT_PERCENTILE) as usize;
    scores[rank]
}

/// Build the optimized database file. Replaces any existing partitions.
pub fn build_store(csv_path: &Path, db_path: &Path, reporter: Reporter) -> Result<IngestReport> {
    let started = Instant::now();
    check_output_path(db_path, "optimized", &[csv_path])?;

    let rows = read_canonical_csv(csv_path, reporter)?;
    let total = rows.len();
    let threshold = hot_threshold(&rows);
    eprintln!(
        "[SPLIT] {} rows, HOT threshold score <= {}",
        total, threshold
    );

    // Cleaning dominates build time; fan it out across cores.
    let clean_start = Instant::now();
    let cleaned: Vec<CleanRow> = rows
        .into_par_iter()
        .map(|raw| CleanRow {
            recording_name_clean: clean_conservative(&raw.recording_name),
            artist_credit_name_clean: clean_conservative(&raw.artist_credit_name),
            release_name_clean: clean_conservative(&raw.release_name),
            raw,
        })
        .collect();
    eprintln!(
        "[CLEAN] Normalized {} rows ({})",
        total,
        format_duration(clean_start.elapsed())
    );

    let mut conn = Connection::open(db_path)
        .with_context(|| format!("creating {}", db_path.display()))?;
    conn.execute_batch(
        "PRAGMA journal_mode = WAL; \
         PRAGMA synchronous = NORMAL; \
         PRAGMA cache_size = -64000;",
    )?;
    conn.execute_batch(
        "DROP TABLE IF EXISTS recordings_hot; DROP TABLE IF EXISTS recordings_cold;",
    )?;
    conn.execute_batch(CREATE_SCHEMA_SQL)?;

    let pb = reporter.bar(total as u64, "Writing partitions");
    let tx = conn.transaction()?;
    let mut hot = 0usize;
    let mut cold = 0usize;
    {
        let mut hot_batch: Vec<CleanRow> = Vec::with_capacity(BATCH_SIZE);
        let mut cold_batch: Vec<CleanRow> = Vec::with_capacity(BATCH_SIZE);
        let mut written = 0u64;
        for row in cleaned {
            let batch = if row.raw.score <= threshold {
                hot += 1;
                &mut hot_batch
            } else {
                cold += 1;
                &mut cold_batch
            };
            batch.push(row);
            if batch.len() == BATCH_SIZE {
                let (table, full) = if hot_batch.len() == BATCH_SIZE {
                    ("recordings_hot", &mut hot_batch)
                } else {
                    ("recordings_cold", &mut cold_batch)
                };
                execute_batch_insert(&tx, table, full)?;
                written += full.len() as u64;
                pb.set_position(written);
                reporter.line("WRITE", written, total as u64, 500_000);
                full.clear();
            }
        }
        execute_batch_insert(&tx, "recordings_hot", &hot_batch)?;
        execute_batch_insert(&tx, "recordings_cold", &cold_batch)?;
        pb.set_position(total as u64);
    }
    tx.commit()?;
    pb.finish_with_message(format!("Wrote {hot} HOT + {cold} COLD rows"));

    let index_spinner = reporter.spinner("Building indices");
    conn.execute_batch(CREATE_INDEX_SQL)?;
    conn.execute_batch("ANALYZE;")?;
    conn.pragma_update(None, "user_version", SCHEMA_VERSION)?;
    index_spinner.finish_with_message("Indices built");

    let report = IngestReport {
        total,
        hot,
        cold,
        threshold,
        elapsed_seconds: started.elapsed().as_secs_f64(),
    };
    eprintln!(
        "[BUILD] Complete: {} rows ({} hot / {} cold) in {}",
        report.total,
        report.hot,
        report.cold,
        format_duration(started.elapsed())
    );
    Ok(report)
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{OfflineStore, Partition};
    use std::io::Write;

    fn write_sample_csv(dir: &Path, rows: &[(i64, &str, &str, &str, i64)]) -> std::path::PathBuf {
        let path = dir.join("canonical.csv");
        let mut file = std::fs::File::create(&path).unwrap();
        writeln!(
            file,
            "recording_id,recording_name,artist_credit_name,release_name,score"
        )
        .unwrap();
        for (id, name, artist, release, score) in rows {
            writeln!(file, "{id},{name},{artist},{release},{score}").unwrap();
        }
        path
    }

    fn sample_rows() -> Vec<(i64, &'static str, &'static str, &'static str, i64)> {
        (0..20)
            .map(|i| {
                let name: &'static str = Box::leak(format!("Song {i}").into_boxed_str());
                (i, name, "Some Artist", "Some Album", (i + 1) * 100)
            })
            .collect()
    }

    #[test]
    fn build_splits_hot_and_cold() {
        let dir = tempfile::tempdir().unwrap();
        let csv = write_sample_csv(dir.path(), &sample_rows());
        let db = dir.path().join("musicbrainz_optimized.sqlite3");
        let report = build_store(&csv, &db, Reporter::LogOnly).unwrap();
        assert_eq!(report.total, 20);
        assert_eq!(report.hot + report.cold, report.total);
        assert!(report.hot >= 1);

        let store = OfflineStore::open(&db).unwrap();
        assert_eq!(
            store.count(Partition::Hot).unwrap() + store.count(Partition::Cold).unwrap(),
            20
        );
        let (_, hot_max) = store.score_bounds(Partition::Hot).unwrap().unwrap();
        let (cold_min, _) = store.score_bounds(Partition::Cold).unwrap().unwrap();
        assert!(hot_max <= cold_min);
        assert_eq!(hot_max, report.threshold);
    }

    #[test]
    fn build_precomputes_clean_columns() {
        let dir = tempfile::tempdir().unwrap();
        let csv = dir.path().join("canonical.csv");
        let mut file = std::fs::File::create(&csv).unwrap();
        writeln!(
            file,
            "recording_id,recording_name,artist_credit_name,release_name,score"
        )
        .unwrap();
        writeln!(file, "1,Halo (Live),Beyoncé,I Am... Sasha Fierce,10").unwrap();
        writeln!(file, "2,Other Song,Other Artist,Other Album,20").unwrap();
        drop(file);
        let db = dir.path().join("musicbrainz_optimized.sqlite3");
        build_store(&csv, &db, Reporter::LogOnly).unwrap();

        let store = OfflineStore::open(&db).unwrap();
        let rows = store
            .search(
                Partition::Hot,
                crate::store::CascadeLevel::Exact,
                "halo",
                None,
                None,
                10,
            )
            .unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].recording_name, "Halo (Live)");
        assert_eq!(rows[0].recording_name_clean, "halo");
        assert_eq!(rows[0].artist_credit_name_clean, "beyoncé");
    }

    #[test]
    fn threshold_is_fifteenth_percentile() {
        let rows: Vec<RawRow> = (1..=100)
            .map(|i| RawRow {
                recording_id: i,
                recording_name: "x".into(),
                artist_credit_name: "y".into(),
                release_name: String::new(),
                score: i * 10,
                release_type: None,
            })
            .collect();
        // Ranks 0..=99; 15th percentile rank is floor(99 * 0.15) = 14 → 150.
        assert_eq!(hot_threshold(&rows), 150);
    }

    #[test]
    fn refuses_to_overwrite_source() {
        let dir = tempfile::tempdir().unwrap();
        let csv = write_sample_csv(dir.path(), &sample_rows());
        let err = build_store(&csv, &csv, Reporter::LogOnly).unwrap_err();
        assert!(err.to_string().contains("refusing"));
    }

    #[test]
    fn batch_sql_row_count() {
        let sql = build_batch_sql("recordings_hot", 3);
        assert_eq!(sql.matches("(?,?,?,?,?,?,?,?,?)").count(), 3);
    }
}
