//! Matching thresholds, persisted settings and directory resolution.
//!
//! `MatchingConfig` is an immutable value handed to the offline resolver;
//! switching modes replaces the whole struct rather than mutating fields.
//! `Settings` is the JSON file the binaries read and write.

use std::env;
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

// ============================================================================
// Matching configuration
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MatchMode {
    Normal,
    HighAccuracy,
}

impl Default for MatchMode {
    fn default() -> Self {
        MatchMode::Normal
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProviderMode {
    OfflineOnly,
    OnlineOnly,
    OfflineThenOnline,
    OnlineThenOffline,
}

impl Default for ProviderMode {
    fn default() -> Self {
        ProviderMode::OfflineThenOnline
    }
}

/// Thresholds and limits for one offline matching pass. Immutable; the
/// resolver swaps the whole value on mode change.
#[derive(Debug, Clone)]
pub struct MatchingConfig {
    pub mode: MatchMode,
    /// Titles with fewer effective (alphanumeric) characters need a hint.
    pub min_effective_title_length: usize,
    /// Distinct-artist count at which a title counts as common.
    pub high_frequency_threshold: i64,
    /// Weight gap between top two candidates required for high confidence.
    pub min_confidence_margin: f64,
    /// Absolute weight floor for high confidence.
    pub min_absolute_score: f64,
    /// Per-query row cap for cascade statements.
    pub search_row_limit: usize,
    /// Row cap when an album hint widens the search.
    pub album_search_row_limit: usize,
    pub fuzzy_enabled: bool,
    /// Enhanced-similarity floor for a fuzzy artist match.
    pub fuzzy_similarity_floor: f64,
}

impl MatchingConfig {
    pub fn normal() -> Self {
        MatchingConfig {
            mode: MatchMode::Normal,
            min_effective_title_length: 3,
            high_frequency_threshold: 50,
            min_confidence_margin: 500_000.0,
            min_absolute_score: 1_000_000.0,
            search_row_limit: 10,
            album_search_row_limit: 100,
            fuzzy_enabled: false,
            fuzzy_similarity_floor: 0.8,
        }
    }

    /// Raised row limit plus fuzzy and phonetic matching enabled.
    pub fn high_accuracy() -> Self {
        MatchingConfig {
            mode: MatchMode::HighAccuracy,
            search_row_limit: 20,
            fuzzy_enabled: true,
            ..Self::normal()
        }
    }

    pub fn for_mode(mode: MatchMode) -> Self {
        match mode {
            MatchMode::Normal => Self::normal(),
            MatchMode::HighAccuracy => Self::high_accuracy(),
        }
    }
}

impl Default for MatchingConfig {
    fn default() -> Self {
        Self::normal()
    }
}

// ============================================================================
// Persisted settings
// ============================================================================

/// Ramp/backoff constants for the adaptive online rate limiter. These are
/// not uniformly agreed upstream, so they stay configurable.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AdaptiveRateConfig {
    /// Starting rpm for parallel discovery before any 403 is seen.
    pub discovery_rpm: u32,
    /// Multiplicative rpm reduction applied on each 403.
    pub backoff_factor: f64,
    /// Additive rpm increase per quiet cooldown window.
    pub ramp_step_rpm: u32,
    /// Seconds without a 403 before ramping back up.
    pub cooldown_secs: u64,
}

impl Default for AdaptiveRateConfig {
    fn default() -> Self {
        AdaptiveRateConfig {
            discovery_rpm: 120,
            backoff_factor: 0.5,
            ramp_step_rpm: 5,
            cooldown_secs: 60,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingSettings {
    /// tracing filter directive, e.g. "info" or "trackmatch=debug".
    pub level: String,
    /// Write rotated log files under the log dir instead of stderr only.
    pub file: bool,
}

impl Default for LoggingSettings {
    fn default() -> Self {
        LoggingSettings {
            level: "info".to_string(),
            file: false,
        }
    }
}

/// settings.json contents. Unknown keys are ignored, missing keys take
/// defaults, so older files keep loading across releases.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub provider: ProviderMode,
    pub rate_limit_rpm: u32,
    pub workers: usize,
    pub mode: MatchMode,
    pub fuzzy_enabled: bool,
    pub checkpoint_interval: usize,
    pub fallback_on_low: bool,
    pub persist_low_matches: bool,
    pub album_hint_boost_in_sql: bool,
    pub adaptive: AdaptiveRateConfig,
    pub logging: LoggingSettings,
}

impl Default for Settings {
    fn default() -> Self {
        Settings {
            provider: ProviderMode::default(),
            rate_limit_rpm: 20,
            workers: 10,
            mode: MatchMode::Normal,
            fuzzy_enabled: false,
            checkpoint_interval: 50,
            fallback_on_low: true,
            persist_low_matches: false,
            album_hint_boost_in_sql: true,
            adaptive: AdaptiveRateConfig::default(),
            logging: LoggingSettings::default(),
        }
    }
}

impl Settings {
    pub fn load(path: &Path) -> Result<Settings> {
        let raw = fs::read_to_string(path)
            .with_context(|| format!("reading settings from {}", path.display()))?;
        serde_json::from_str(&raw)
            .with_context(|| format!("parsing settings from {}", path.display()))
    }

    /// Load the settings file, falling back to defaults when it is missing
    /// or unreadable. A malformed file is reported, not fatal.
    pub fn load_or_default(path: &Path) -> Settings {
        if !path.exists() {
            return Settings::default();
        }
        match Self::load(path) {
            Ok(settings) => settings,
            Err(e) => {
                tracing::warn!("ignoring unreadable settings file: {e:#}");
                Settings::default()
            }
        }
    }

    /// Atomic save: write a sibling temp file, then rename over the target.
    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("creating {}", parent.display()))?;
        }
        let json = serde_json::to_string_pretty(self)?;
        let tmp = path.with_extension("json.tmp");
        fs::write(&tmp, json).with_context(|| format!("writing {}", tmp.display()))?;
        fs::rename(&tmp, path)
            .with_context(|| format!("replacing {}", path.display()))?;
        Ok(())
    }
}

// ============================================================================
// Directory layout
// ============================================================================

const DATA_DIR_ENV: &str = "TRACKMATCH_DATA_DIR";
const SETTINGS_DIR_ENV: &str = "TRACKMATCH_SETTINGS_DIR";
const LOG_DIR_ENV: &str = "TRACKMATCH_LOG_DIR";

pub const OFFLINE_DB_FILE: &str = "musicbrainz_optimized.sqlite3";
pub const MAPPINGS_DB_FILE: &str = "mappings.sqlite3";
pub const SETTINGS_FILE: &str = "settings.json";

/// Resolved data/settings/log directories, honoring env overrides.
#[derive(Debug, Clone)]
pub struct AppDirs {
    pub data_dir: PathBuf,
    pub settings_dir: PathBuf,
    pub log_dir: PathBuf,
}

impl AppDirs {
    pub fn resolve() -> AppDirs {
        let data_dir = env::var_os(DATA_DIR_ENV)
            .map(PathBuf::from)
            .unwrap_or_else(|| default_base().join("data"));
        let settings_dir = env::var_os(SETTINGS_DIR_ENV)
            .map(PathBuf::from)
            .unwrap_or_else(default_base);
        let log_dir = env::var_os(LOG_DIR_ENV)
            .map(PathBuf::from)
            .unwrap_or_else(|| default_base().join("logs"));
        AppDirs {
            data_dir,
            settings_dir,
            log_dir,
        }
    }

    pub fn offline_db_path(&self) -> PathBuf {
        self.data_dir.join(OFFLINE_DB_FILE)
    }

    pub fn mappings_db_path(&self) -> PathBuf {
        self.data_dir.join(MAPPINGS_DB_FILE)
    }

    pub fn settings_path(&self) -> PathBuf {
        self.settings_dir.join(SETTINGS_FILE)
    }
}

fn default_base() -> PathBuf {
    dirs::data_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("trackmatch")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_documented_values() {
        let s = Settings::default();
        assert_eq!(s.rate_limit_rpm, 20);
        assert_eq!(s.workers, 10);
        assert_eq!(s.checkpoint_interval, 50);
        assert!(!s.persist_low_matches);
        assert!(s.fallback_on_low);
        assert_eq!(s.provider, ProviderMode::OfflineThenOnline);
    }

    #[test]
    fn matching_config_modes() {
        let normal = MatchingConfig::normal();
        assert_eq!(normal.search_row_limit, 10);
        assert!(!normal.fuzzy_enabled);
        let high = MatchingConfig::high_accuracy();
        assert_eq!(high.search_row_limit, 20);
        assert!(high.fuzzy_enabled);
        assert_eq!(high.album_search_row_limit, 100);
        assert_eq!(high.min_confidence_margin, normal.min_confidence_margin);
    }

    #[test]
    fn settings_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("settings.json");
        let mut settings = Settings::default();
        settings.rate_limit_rpm = 60;
        settings.provider = ProviderMode::OnlineOnly;
        settings.save(&path).unwrap();
        let loaded = Settings::load(&path).unwrap();
        assert_eq!(loaded.rate_limit_rpm, 60);
        assert_eq!(loaded.provider, ProviderMode::OnlineOnly);
    }

    #[test]
    fn partial_settings_file_takes_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("settings.json");
        std::fs::write(&path, r#"{"rate_limit_rpm": 45}"#).unwrap();
        let loaded = Settings::load_or_default(&path);
        assert_eq!(loaded.rate_limit_rpm, 45);
        assert_eq!(loaded.workers, 10);
        assert_eq!(loaded.checkpoint_interval, 50);
    }

    #[test]
    fn malformed_settings_file_falls_back() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("settings.json");
        std::fs::write(&path, "{not json").unwrap();
        let loaded = Settings::load_or_default(&path);
        assert_eq!(loaded.rate_limit_rpm, 20);
    }
}
