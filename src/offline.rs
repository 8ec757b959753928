//! Offline resolver: cascade search over the optimized corpus, edge-case
//! policies, candidate scoring and confidence assignment.
//!
//! Missing data is never an error here; every per-track condition comes
//! back as a [`MatchResult`]. Only store-level failures surface as
//! [`StoreError`], which the dispatcher treats as resolver-unavailable.

use once_cell::sync::Lazy;
use rustc_hash::{FxHashMap, FxHashSet};

use crate::config::{MatchMode, MatchingConfig};
use crate::models::{
    AlbumMatch, ArtistMatch, Candidate, Confidence, MatchResult, RecordingRow,
};
use crate::store::{CascadeLevel, OfflineStore, Partition, StoreError};
use crate::text::{
    clean_aggressive, clean_conservative, enhanced_artist_similarity, normalize_for_matching,
    soundex, tokenize_artist_credit,
};

/// Scores are upstream row ids; raw weight is the inverted score so that
/// earlier-established rows weigh more.
pub const MAX_SCORE: i64 = 5_000_000;

// Bonuses are absolute, deliberately far apart so that a better match
// category always beats any score difference within a worse one.
const ARTIST_EXACT_BONUS: f64 = 10_000_000.0;
const ARTIST_PARTIAL_BONUS: f64 = 5_000_000.0;
const ARTIST_PHONETIC_BONUS: f64 = 2_000_000.0;
const ARTIST_FUZZY_BONUS: f64 = 2_000_000.0;
const ALBUM_EXACT_BONUS: f64 = 5_000_000.0;
const ALBUM_PARTIAL_BONUS: f64 = 3_000_000.0;

/// Titles that say nothing about the recording by themselves.
static GENERIC_TITLES: Lazy<FxHashSet<&'static str>> = Lazy::new(|| {
    [
        "intro",
        "outro",
        "interlude",
        "prelude",
        "intermission",
        "skit",
        "untitled",
        "track",
        "hidden track",
    ]
    .into_iter()
    .collect()
});

// ============================================================================
// Edge-case detection
// ============================================================================

#[derive(Debug, Clone, Copy)]
struct TitleTraits {
    short: bool,
    generic: bool,
    numeric: bool,
}

impl TitleTraits {
    fn detect(clean_title: &str, config: &MatchingConfig) -> TitleTraits {
        let effective_len = clean_aggressive(clean_title).chars().count();
        let digits = clean_title.strip_prefix('#').unwrap_or(clean_title);
        TitleTraits {
            short: effective_len < config.min_effective_title_length,
            generic: GENERIC_TITLES.contains(clean_title),
            numeric: !digits.is_empty() && digits.chars().all(|c| c.is_ascii_digit()),
        }
    }

    fn ambiguous(self) -> bool {
        self.short || self.generic || self.numeric
    }

    fn describe(self) -> &'static str {
        if self.generic {
            "generic"
        } else if self.short {
            "short"
        } else {
            "numeric"
        }
    }
}

// ============================================================================
// Candidate scoring
// ============================================================================

fn jaccard(a: &FxHashSet<String>, b: &FxHashSet<String>) -> f64 {
    if a.is_empty() || b.is_empty() {
        return 0.0;
    }
    let intersection = a.intersection(b).count();
    let union = a.union(b).count();
    intersection as f64 / union as f64
}

fn classify_artist(
    credit_name: &str,
    hint: &str,
    config: &MatchingConfig,
) -> (ArtistMatch, f64) {
    let hint_norm = normalize_for_matching(hint);
    let credit_norm = normalize_for_matching(credit_name);
    if hint_norm.is_empty() || credit_norm.is_empty() {
        return (ArtistMatch::None, 0.0);
    }
    let hint_tokens = tokenize_artist_credit(hint);
    let credit_tokens = tokenize_artist_credit(credit_name);

    if credit_norm == hint_norm || (!hint_tokens.is_empty() && hint_tokens == credit_tokens) {
        return (ArtistMatch::Exact, ARTIST_EXACT_BONUS);
    }
    if credit_norm.contains(&hint_norm)
        || hint_norm.contains(&credit_norm)
        || jaccard(&hint_tokens, &credit_tokens) >= 0.5
    {
        return (ArtistMatch::Partial, ARTIST_PARTIAL_BONUS);
    }
    let hint_code = soundex(&hint_norm);
    if !hint_code.is_empty() && hint_code == soundex(&credit_norm) {
        return (ArtistMatch::Phonetic, ARTIST_PHONETIC_BONUS);
    }
    if config.fuzzy_enabled
        && enhanced_artist_similarity(&credit_norm, &hint_norm) >= config.fuzzy_similarity_floor
    {
        return (ArtistMatch::Fuzzy, ARTIST_FUZZY_BONUS);
    }
    (ArtistMatch::None, 0.0)
}

fn classify_album(release_clean: &str, album_clean: &str) -> (AlbumMatch, f64) {
    if release_clean.is_empty() || album_clean.is_empty() {
        return (AlbumMatch::None, 0.0);
    }
    if release_clean == album_clean {
        return (AlbumMatch::Exact, ALBUM_EXACT_BONUS);
    }
    if release_clean.contains(album_clean) || album_clean.contains(release_clean) {
        return (AlbumMatch::Partial, ALBUM_PARTIAL_BONUS);
    }
    (AlbumMatch::None, 0.0)
}

fn score_row(
    row: &RecordingRow,
    artist_hint: Option<&str>,
    album_clean: Option<&str>,
    config: &MatchingConfig,
) -> Candidate {
    let raw_score = row.score;
    let mut weight = (MAX_SCORE - row.score) as f64;

    let (artist_match, artist_bonus) = match artist_hint {
        Some(hint) => classify_artist(&row.artist_credit_name, hint, config),
        None => (ArtistMatch::None, 0.0),
    };
    weight += artist_bonus;

    let (album_match, album_bonus) = match album_clean {
        Some(album) => classify_album(&row.release_name_clean, album),
        None => (AlbumMatch::None, 0.0),
    };
    weight += album_bonus;

    Candidate {
        artist_credit: row.artist_credit_name.clone(),
        release_name: row.release_name.clone(),
        recording_name: row.recording_name.clone(),
        raw_score,
        weight,
        artist_match,
        album_match,
    }
}

fn album_rank(release_clean: &str, album_clean: Option<&str>) -> u8 {
    match album_clean {
        Some(album) => match classify_album(release_clean, album).0 {
            AlbumMatch::Exact => 0,
            AlbumMatch::Partial => 1,
            AlbumMatch::None => 2,
        },
        None => 2,
    }
}

/// When HOT and COLD results are unioned, the same artist credit can appear
/// twice. Keep the row with the better album match, then the lower score.
fn dedup_by_credit(rows: Vec<RecordingRow>, album_clean: Option<&str>) -> Vec<RecordingRow> {
    let mut best: FxHashMap<String, RecordingRow> = FxHashMap::default();
    for row in rows {
        let key = row.artist_credit_name.clone();
        match best.get(&key) {
            Some(existing) => {
                let new_rank = (album_rank(&row.release_name_clean, album_clean), row.score);
                let old_rank = (
                    album_rank(&existing.release_name_clean, album_clean),
                    existing.score,
                );
                if new_rank < old_rank {
                    best.insert(key, row);
                }
            }
            None => {
                best.insert(key, row);
            }
        }
    }
    best.into_values().collect()
}

// ============================================================================
// Resolver
// ============================================================================

pub struct OfflineResolver {
    store: OfflineStore,
    config: MatchingConfig,
    /// Mirror of the dispatcher's `album_hint_boost_in_sql` knob.
    album_boost_in_sql: bool,
}

impl OfflineResolver {
    pub fn new(store: OfflineStore) -> OfflineResolver {
        OfflineResolver {
            store,
            config: MatchingConfig::normal(),
            album_boost_in_sql: true,
        }
    }

    pub fn with_config(store: OfflineStore, config: MatchingConfig) -> OfflineResolver {
        OfflineResolver {
            store,
            config,
            album_boost_in_sql: true,
        }
    }

    pub fn config(&self) -> &MatchingConfig {
        &self.config
    }

    pub fn store(&self) -> &OfflineStore {
        &self.store
    }

    pub fn set_album_boost_in_sql(&mut self, enabled: bool) {
        self.album_boost_in_sql = enabled;
    }

    /// Swap the active config for the given mode. The caller is responsible
    /// for clearing any result caches keyed under the old mode.
    pub fn set_mode(&mut self, mode: MatchMode) {
        self.config = MatchingConfig::for_mode(mode);
    }

    pub fn search(
        &self,
        title: &str,
        artist_hint: Option<&str>,
        album_hint: Option<&str>,
    ) -> Result<MatchResult, StoreError> {
        self.search_with_config(title, artist_hint, album_hint, &self.config)
    }

    /// One-shot search under a different mode, without touching the active
    /// config. This is the escalation path: a `low` normal-mode result is
    /// retried once in high-accuracy mode, which is the only way fuzzy
    /// scoring ever runs.
    pub fn search_in_mode(
        &self,
        title: &str,
        artist_hint: Option<&str>,
        album_hint: Option<&str>,
        mode: MatchMode,
    ) -> Result<MatchResult, StoreError> {
        let config = MatchingConfig::for_mode(mode);
        self.search_with_config(title, artist_hint, album_hint, &config)
    }

    fn search_with_config(
        &self,
        title: &str,
        artist_hint: Option<&str>,
        album_hint: Option<&str>,
        config: &MatchingConfig,
    ) -> Result<MatchResult, StoreError> {
        let clean_title = clean_conservative(title);
        if clean_title.is_empty() {
            return Ok(MatchResult::no_match("empty title"));
        }
        let artist_clean = artist_hint
            .map(clean_conservative)
            .filter(|s| !s.is_empty());
        let album_clean = album_hint.map(clean_conservative).filter(|s| !s.is_empty());

        // Ambiguous titles without a hint are rejected before any query.
        let traits = TitleTraits::detect(&clean_title, config);
        if traits.ambiguous() && artist_clean.is_none() {
            return Ok(MatchResult::no_match(format!(
                "ambiguous title ({}) requires an artist hint",
                traits.describe()
            )));
        }

        let is_common =
            self.store.title_candidate_count(&clean_title)? >= config.high_frequency_threshold;
        if is_common && artist_clean.is_none() {
            return Ok(MatchResult::no_match(format!(
                "common title '{clean_title}' requires an artist hint"
            )));
        }

        let row_limit = if album_clean.is_some() {
            config.album_search_row_limit
        } else {
            config.search_row_limit
        };
        let album_sql = if self.album_boost_in_sql {
            album_clean.as_deref()
        } else {
            None
        };

        // Cascade: HOT first, COLD as fallback, stop at the first non-empty
        // level. With an album hint, HOT and COLD are unioned before scoring
        // since the canonical release is often a low-score COLD row.
        let mut rows: Vec<RecordingRow> = Vec::new();
        let mut hot_contributed = false;
        let mut level_used = CascadeLevel::Exact;
        for level in CascadeLevel::ALL {
            if album_clean.is_some() {
                let hot = self.store.search(
                    Partition::Hot,
                    level,
                    &clean_title,
                    artist_clean.as_deref(),
                    album_sql,
                    row_limit,
                )?;
                let cold = self.store.search(
                    Partition::Cold,
                    level,
                    &clean_title,
                    artist_clean.as_deref(),
                    album_sql,
                    row_limit,
                )?;
                if !hot.is_empty() || !cold.is_empty() {
                    hot_contributed = !hot.is_empty();
                    let mut union = hot;
                    union.extend(cold);
                    rows = dedup_by_credit(union, album_clean.as_deref());
                    level_used = level;
                    break;
                }
            } else {
                let hot = self.store.search(
                    Partition::Hot,
                    level,
                    &clean_title,
                    artist_clean.as_deref(),
                    None,
                    row_limit,
                )?;
                if !hot.is_empty() {
                    rows = hot;
                    hot_contributed = true;
                    level_used = level;
                    break;
                }
                let cold = self.store.search(
                    Partition::Cold,
                    level,
                    &clean_title,
                    artist_clean.as_deref(),
                    None,
                    row_limit,
                )?;
                if !cold.is_empty() {
                    rows = cold;
                    level_used = level;
                    break;
                }
            }
        }
        if rows.is_empty() {
            return Ok(MatchResult::no_match(format!(
                "no candidates at any cascade level for '{clean_title}'"
            )));
        }

        // Ambiguous titles with a hint: only candidates sharing at least one
        // artist token with the hint survive.
        if traits.ambiguous() {
            if let Some(hint) = artist_hint {
                let hint_tokens = tokenize_artist_credit(hint);
                rows.retain(|row| {
                    let credit_tokens = tokenize_artist_credit(&row.artist_credit_name);
                    credit_tokens.intersection(&hint_tokens).next().is_some()
                });
                if rows.is_empty() {
                    return Ok(MatchResult::no_match(format!(
                        "ambiguous title ({}): no candidate shares an artist token with the hint",
                        traits.describe()
                    )));
                }
            }
        }

        // Obscure-artist policy: nothing established matched, only COLD.
        if !hot_contributed {
            if let Some(hint) = artist_hint {
                let hint_tokens = tokenize_artist_credit(hint);
                rows.retain(|row| {
                    tokenize_artist_credit(&row.artist_credit_name) == hint_tokens
                });
                if rows.is_empty() {
                    return Ok(MatchResult::no_match(
                        "no established entry; cold candidates did not match the artist hint exactly",
                    ));
                }
            }
        }

        let mut candidates: Vec<Candidate> = rows
            .iter()
            .map(|row| score_row(row, artist_hint, album_clean.as_deref(), config))
            .collect();
        candidates.sort_by(|a, b| {
            b.weight
                .partial_cmp(&a.weight)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| a.raw_score.cmp(&b.raw_score))
        });

        // Obscure artist without a hint: the best COLD row, flagged low.
        if !hot_contributed && artist_hint.is_none() {
            let top = candidates[0].clone();
            let margin = match candidates.get(1) {
                Some(second) => top.weight - second.weight,
                None => f64::INFINITY,
            };
            return Ok(self.build_result(
                candidates,
                Confidence::Low,
                margin,
                format!(
                    "{}: only low-ranked entries matched; returning top cold candidate",
                    level_used.describe()
                ),
            ));
        }

        let top = &candidates[0];
        let margin = match candidates.get(1) {
            Some(second) => top.weight - second.weight,
            None => f64::INFINITY,
        };

        // Common-title policy replaces the margin rules entirely.
        if is_common {
            let (confidence, note) = if top.album_match != AlbumMatch::None
                && top.artist_match != ArtistMatch::None
            {
                (Confidence::High, "artist and album hints both matched")
            } else if top.artist_match != ArtistMatch::None {
                (Confidence::Medium, "artist hint matched")
            } else {
                return Ok(MatchResult::no_match(format!(
                    "common title '{clean_title}': artist hint did not match any candidate"
                )));
            };
            let reason = format!("common title, {}; {}", level_used.describe(), note);
            return Ok(self.build_result(candidates, confidence, margin, reason));
        }

        let (confidence, note) = if candidates.len() == 1 {
            (Confidence::High, "single candidate")
        } else if margin >= config.min_confidence_margin
            && top.weight >= config.min_absolute_score
        {
            (Confidence::High, "clear margin over runner-up")
        } else if top.artist_match == ArtistMatch::Exact {
            (Confidence::Medium, "narrow margin but exact artist hint")
        } else if config.mode == MatchMode::HighAccuracy {
            (Confidence::Low, "narrow margin")
        } else if top.weight < config.min_absolute_score {
            let reason = format!(
                "{}: weak candidates below absolute floor",
                level_used.describe()
            );
            let mut result = MatchResult::no_match(reason);
            candidates.truncate(3);
            result.top_candidates = candidates;
            result.margin = margin;
            return Ok(result);
        } else {
            (Confidence::Low, "narrow margin")
        };

        let reason = format!("{}; {}", level_used.describe(), note);
        Ok(self.build_result(candidates, confidence, margin, reason))
    }

    fn build_result(
        &self,
        mut candidates: Vec<Candidate>,
        confidence: Confidence,
        margin: f64,
        reason: String,
    ) -> MatchResult {
        let top = candidates[0].clone();
        candidates.truncate(3);
        MatchResult {
            artist_name: Some(top.artist_credit),
            release_name: Some(top.release_name),
            confidence,
            margin,
            top_candidates: candidates,
            reason,
        }
    }
}

// ============================================================================
// TESTS
// ============================================================================
