//! Dispatcher: the single entry point that routes a track through the
//! caches and resolvers.
//!
//! Order of operations per track: verified/LRU cache, then the configured
//! provider chain, then reconciliation. An offline `high` is final; below
//! that, the higher confidence wins and exact ties go to offline. Results
//! at medium confidence or better are persisted; everything, including
//! `low` and `no_match`, lands in the LRU.

use std::sync::Arc;

use tracing::{debug, warn};

use crate::cache::MappingCache;
use crate::config::{MatchMode, ProviderMode, Settings};
use crate::models::{
    Confidence, FailReason, MappingConfidence, MatchResult, Provider, Resolution, TrackOutcome,
    TrackQuery, VerifiedBy,
};
use crate::offline::OfflineResolver;
use crate::online::{OnlineOutcome, OnlineResolver};

#[derive(Debug, Clone)]
pub struct DispatchOptions {
    pub provider: ProviderMode,
    pub fallback_on_low: bool,
    pub persist_low_matches: bool,
    pub album_hint_boost_in_sql: bool,
}

impl Default for DispatchOptions {
    fn default() -> Self {
        DispatchOptions {
            provider: ProviderMode::default(),
            fallback_on_low: true,
            persist_low_matches: false,
            album_hint_boost_in_sql: true,
        }
    }
}

impl From<&Settings> for DispatchOptions {
    fn from(settings: &Settings) -> Self {
        DispatchOptions {
            provider: settings.provider,
            fallback_on_low: settings.fallback_on_low,
            persist_low_matches: settings.persist_low_matches,
            album_hint_boost_in_sql: settings.album_hint_boost_in_sql,
        }
    }
}

pub struct Dispatcher {
    offline: Option<OfflineResolver>,
    online: Option<Arc<OnlineResolver>>,
    cache: Arc<MappingCache>,
    options: DispatchOptions,
    /// Set after the store failed twice in a row; the rest of the run goes
    /// online-only.
    offline_down: bool,
}

impl Dispatcher {
    pub fn new(
        mut offline: Option<OfflineResolver>,
        online: Option<Arc<OnlineResolver>>,
        cache: Arc<MappingCache>,
        options: DispatchOptions,
    ) -> Dispatcher {
        if let Some(resolver) = offline.as_mut() {
            resolver.set_album_boost_in_sql(options.album_hint_boost_in_sql);
        }
        Dispatcher {
            offline,
            online,
            cache,
            options,
            offline_down: false,
        }
    }

    /// Swap matching mode. The LRU is cleared because cached results are
    /// only comparable within one mode.
    pub fn set_mode(&mut self, mode: MatchMode) {
        if let Some(resolver) = self.offline.as_mut() {
            resolver.set_mode(mode);
        }
        self.cache.clear_lru();
    }

    pub fn resolve(&mut self, query: &TrackQuery) -> TrackOutcome {
        if let Some(result) = self.cache.lookup(query) {
            return TrackOutcome::Resolved(Resolution {
                result,
                provider: Provider::Cache,
            });
        }

        let mut offline_result: Option<MatchResult> = None;
        let mut online_result: Option<MatchResult> = None;
        let mut online_failure: Option<TrackOutcome> = None;

        match self.options.provider {
            ProviderMode::OfflineOnly => {
                offline_result = self.try_offline(query);
            }
            ProviderMode::OnlineOnly => {
                self.try_online(query, &mut online_result, &mut online_failure);
            }
            ProviderMode::OfflineThenOnline => {
                offline_result = self.try_offline(query);
                if self.should_fall_back(offline_result.as_ref()) {
                    self.try_online(query, &mut online_result, &mut online_failure);
                }
            }
            ProviderMode::OnlineThenOffline => {
                self.try_online(query, &mut online_result, &mut online_failure);
                let fall_back =
                    online_failure.is_some() || self.should_fall_back(online_result.as_ref());
                if fall_back {
                    offline_result = self.try_offline(query);
                }
            }
        }

        let outcome = self.reconcile(offline_result, online_result, online_failure);
        if let TrackOutcome::Resolved(resolution) = &outcome {
            self.remember(query, resolution);
        }
        outcome
    }

    fn should_fall_back(&self, result: Option<&MatchResult>) -> bool {
        match result {
            None => true,
            Some(r) => {
                r.confidence == Confidence::NoMatch
                    || (r.confidence == Confidence::Low && self.options.fallback_on_low)
            }
        }
    }

    fn try_offline(&mut self, query: &TrackQuery) -> Option<MatchResult> {
        if self.offline_down {
            return None;
        }
        let resolver = self.offline.as_ref()?;
        let title = &query.title;
        let artist = query.artist_hint.as_deref();
        let album = query.album_hint.as_deref();

        // One retry on a store error; a second failure takes the offline
        // resolver out of the run.
        let result = match resolver.search(title, artist, album) {
            Ok(result) => result,
            Err(first) => {
                warn!("offline resolver error ({first}); retrying once");
                match resolver.search(title, artist, album) {
                    Ok(result) => result,
                    Err(second) => {
                        warn!("offline resolver unavailable ({second}); degrading to online only");
                        self.offline_down = true;
                        return None;
                    }
                }
            }
        };

        // A low normal-mode result escalates to one high-accuracy re-run;
        // the only path that ever enables fuzzy scoring.
        if result.confidence == Confidence::Low
            && resolver.config().mode == MatchMode::Normal
        {
            if let Ok(escalated) =
                resolver.search_in_mode(title, artist, album, MatchMode::HighAccuracy)
            {
                if escalated.confidence > result.confidence {
                    debug!("high-accuracy escalation improved confidence");
                    return Some(escalated);
                }
            }
        }
        Some(result)
    }

    fn try_online(
        &self,
        query: &TrackQuery,
        online_result: &mut Option<MatchResult>,
        online_failure: &mut Option<TrackOutcome>,
    ) {
        let Some(online) = self.online.as_ref() else {
            return;
        };
        match online.search(
            &query.title,
            query.album_hint.as_deref(),
            query.artist_hint.as_deref(),
        ) {
            OnlineOutcome::Found(result) => *online_result = Some(result),
            OnlineOutcome::NotFound => {
                *online_failure = Some(TrackOutcome::Failed(FailReason::NotFound))
            }
            OnlineOutcome::RateLimited => *online_failure = Some(TrackOutcome::RateLimited),
            OnlineOutcome::NetworkError(e) => {
                debug!("online network error: {e}");
                *online_failure = Some(TrackOutcome::Failed(FailReason::NetworkError));
            }
            OnlineOutcome::Invalid(e) => {
                debug!("online invalid response: {e}");
                *online_failure = Some(TrackOutcome::Failed(FailReason::Invalid));
            }
            OnlineOutcome::Cancelled => *online_failure = Some(TrackOutcome::Cancelled),
        }
    }

    fn reconcile(
        &self,
        offline_result: Option<MatchResult>,
        online_result: Option<MatchResult>,
        online_failure: Option<TrackOutcome>,
    ) -> TrackOutcome {
        let offline_unmatched = offline_result.as_ref().filter(|r| !r.is_match()).cloned();
        let offline_match = offline_result.filter(MatchResult::is_match);
        let online_match = online_result.filter(MatchResult::is_match);

        let resolution = match (offline_match, online_match) {
            (Some(offline), Some(online)) => {
                if offline.confidence == Confidence::High || offline.confidence >= online.confidence
                {
                    Resolution {
                        result: offline,
                        provider: Provider::Offline,
                    }
                } else {
                    Resolution {
                        result: online,
                        provider: Provider::Online,
                    }
                }
            }
            (Some(offline), None) => Resolution {
                result: offline,
                provider: Provider::Offline,
            },
            (None, Some(online)) => Resolution {
                result: online,
                provider: Provider::Online,
            },
            (None, None) => {
                // Nothing matched anywhere. A definite online failure keeps
                // its classification (403 must stay retriable); otherwise
                // the offline no-match, with its policy reason, stands.
                return match online_failure {
                    Some(failure) => failure,
                    None => TrackOutcome::Resolved(Resolution {
                        result: offline_unmatched.unwrap_or_else(|| {
                            MatchResult::no_match("no backend produced a match")
                        }),
                        provider: Provider::Offline,
                    }),
                };
            }
        };
        TrackOutcome::Resolved(resolution)
    }

    /// Persistence rules: medium-or-better matches go to the verified
    /// store (low too, when the knob is on); everything lands in the LRU.
    fn remember(&self, query: &TrackQuery, resolution: &Resolution) {
        if resolution.provider != Provider::Cache {
            if resolution.result.is_match() {
                let mapping_confidence = match resolution.result.confidence {
                    Confidence::High => Some(MappingConfidence::High),
                    Confidence::Medium => Some(MappingConfidence::Medium),
                    Confidence::Low if self.options.persist_low_matches => {
                        Some(MappingConfidence::Low)
                    }
                    _ => None,
                };
                if let Some(confidence) = mapping_confidence {
                    self.cache.store_verified(
                        query,
                        &resolution.result,
                        confidence,
                        VerifiedBy::Auto,
                    );
                }
            }
            self.cache.put_lru(query, resolution.result.clone());
        }
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::AdaptiveRateConfig;
    use crate::online::test_http::{serve, song_json};
    use crate::store::test_support::{empty_store, insert};
    use crate::store::{OfflineStore, Partition};
    use rusqlite::Connection;

    fn offline_with_weeknd() -> OfflineResolver {
        let store = empty_store();
        insert(&store, Partition::Hot, 1, "Blinding Lights", "The Weeknd", "After Hours", 500_000);
        insert(&store, Partition::Hot, 2, "Blinding Lights", "Pete Frogs", "Frog Covers", 4_000_000);
        OfflineResolver::new(store)
    }

    fn online_for(url: &str) -> Arc<OnlineResolver> {
        Arc::new(OnlineResolver::with_base_url(
            url,
            120,
            2,
            AdaptiveRateConfig::default(),
        ))
    }

    fn dispatcher_offline_only(resolver: OfflineResolver) -> Dispatcher {
        Dispatcher::new(
            Some(resolver),
            None,
            Arc::new(MappingCache::in_memory(64)),
            DispatchOptions {
                provider: ProviderMode::OfflineOnly,
                ..DispatchOptions::default()
            },
        )
    }

    #[test]
    fn offline_high_is_persisted_and_cached() {
        let cache = Arc::new(MappingCache::in_memory(64));
        let mut dispatcher = Dispatcher::new(
            Some(offline_with_weeknd()),
            None,
            Arc::clone(&cache),
            DispatchOptions {
                provider: ProviderMode::OfflineOnly,
                ..DispatchOptions::default()
            },
        );
        let query = TrackQuery::new("Blinding Lights").with_artist("The Weeknd");

        let first = dispatcher.resolve(&query);
        let TrackOutcome::Resolved(resolution) = first else {
            panic!("expected resolution");
        };
        assert_eq!(resolution.provider, Provider::Offline);
        assert_eq!(resolution.result.artist_name.as_deref(), Some("The Weeknd"));
        assert_eq!(cache.persistent_count(), 1);

        let second = dispatcher.resolve(&query);
        let TrackOutcome::Resolved(resolution) = second else {
            panic!("expected resolution");
        };
        assert_eq!(resolution.provider, Provider::Cache);
    }

    #[test]
    fn no_match_updates_lru_but_not_persistent_store() {
        let cache = Arc::new(MappingCache::in_memory(64));
        let mut dispatcher = Dispatcher::new(
            Some(OfflineResolver::new(empty_store())),
            None,
            Arc::clone(&cache),
            DispatchOptions {
                provider: ProviderMode::OfflineOnly,
                ..DispatchOptions::default()
            },
        );
        let query = TrackQuery::new("Entirely Unknown Track");
        let outcome = dispatcher.resolve(&query);
        let TrackOutcome::Resolved(resolution) = outcome else {
            panic!("expected resolution");
        };
        assert_eq!(resolution.result.confidence, Confidence::NoMatch);
        assert_eq!(cache.persistent_count(), 0);
        assert_eq!(cache.lru_len(), 1);
    }

    #[test]
    fn low_confidence_not_persisted_by_default() {
        let store = empty_store();
        insert(&store, Partition::Cold, 1, "Deep Cut", "Basement Band", "Demos", 4_900_000);
        let cache = Arc::new(MappingCache::in_memory(64));
        let mut dispatcher = Dispatcher::new(
            Some(OfflineResolver::new(store)),
            None,
            Arc::clone(&cache),
            DispatchOptions {
                provider: ProviderMode::OfflineOnly,
                ..DispatchOptions::default()
            },
        );
        let outcome = dispatcher.resolve(&TrackQuery::new("Deep Cut"));
        let TrackOutcome::Resolved(resolution) = outcome else {
            panic!("expected resolution");
        };
        assert_eq!(resolution.result.confidence, Confidence::Low);
        assert_eq!(cache.persistent_count(), 0);
        assert_eq!(cache.lru_len(), 1);
        // The invariant: nothing below medium in the persistent store.
        for tag in cache.persistent_confidences() {
            assert!(["high", "medium", "manual"].contains(&tag.as_str()));
        }
    }

    #[test]
    fn persist_low_matches_knob() {
        let store = empty_store();
        insert(&store, Partition::Cold, 1, "Deep Cut", "Basement Band", "Demos", 4_900_000);
        let cache = Arc::new(MappingCache::in_memory(64));
        let mut dispatcher = Dispatcher::new(
            Some(OfflineResolver::new(store)),
            None,
            Arc::clone(&cache),
            DispatchOptions {
                provider: ProviderMode::OfflineOnly,
                persist_low_matches: true,
                ..DispatchOptions::default()
            },
        );
        dispatcher.resolve(&TrackQuery::new("Deep Cut"));
        assert_eq!(cache.persistent_count(), 1);
        assert_eq!(cache.persistent_confidences(), vec!["low".to_string()]);
    }

    #[test]
    fn falls_back_to_online_on_no_match() {
        let body = song_json(&[("The Weeknd", "Blinding Lights", "After Hours")]);
        let (url, server) = serve(vec![(200, body)]);
        let mut dispatcher = Dispatcher::new(
            Some(OfflineResolver::new(empty_store())),
            Some(online_for(&url)),
            Arc::new(MappingCache::in_memory(64)),
            DispatchOptions::default(),
        );
        let outcome = dispatcher.resolve(&TrackQuery::new("Blinding Lights"));
        let TrackOutcome::Resolved(resolution) = outcome else {
            panic!("expected resolution");
        };
        assert_eq!(resolution.provider, Provider::Online);
        assert_eq!(resolution.result.artist_name.as_deref(), Some("The Weeknd"));
        server.join().unwrap();
    }

    #[test]
    fn offline_high_skips_online_entirely() {
        let (url, server) = serve(vec![]);
        let mut dispatcher = Dispatcher::new(
            Some(offline_with_weeknd()),
            Some(online_for(&url)),
            Arc::new(MappingCache::in_memory(64)),
            DispatchOptions::default(),
        );
        let outcome =
            dispatcher.resolve(&TrackQuery::new("Blinding Lights").with_artist("The Weeknd"));
        let TrackOutcome::Resolved(resolution) = outcome else {
            panic!("expected resolution");
        };
        assert_eq!(resolution.provider, Provider::Offline);
        assert_eq!(server.join().unwrap(), 0);
    }

    #[test]
    fn online_rate_limit_classification_survives() {
        let (url, server) = serve(vec![(403, String::new())]);
        let mut dispatcher = Dispatcher::new(
            Some(OfflineResolver::new(empty_store())),
            Some(online_for(&url)),
            Arc::new(MappingCache::in_memory(64)),
            DispatchOptions::default(),
        );
        let outcome = dispatcher.resolve(&TrackQuery::new("Some Song"));
        assert!(matches!(outcome, TrackOutcome::RateLimited));
        server.join().unwrap();
    }

    #[test]
    fn online_then_offline_falls_back_on_not_found() {
        let empty = r#"{"resultCount":0,"results":[]}"#.to_string();
        let (url, server) = serve(vec![(200, empty)]);
        let mut dispatcher = Dispatcher::new(
            Some(offline_with_weeknd()),
            Some(online_for(&url)),
            Arc::new(MappingCache::in_memory(64)),
            DispatchOptions {
                provider: ProviderMode::OnlineThenOffline,
                ..DispatchOptions::default()
            },
        );
        let outcome =
            dispatcher.resolve(&TrackQuery::new("Blinding Lights").with_artist("The Weeknd"));
        let TrackOutcome::Resolved(resolution) = outcome else {
            panic!("expected resolution");
        };
        assert_eq!(resolution.provider, Provider::Offline);
        server.join().unwrap();
    }

    #[test]
    fn offline_wins_confidence_ties() {
        // Online returns a weak first-result match (low); offline is high.
        let body = song_json(&[("Wrong Band", "Unrelated Title", "Album")]);
        let (url, server) = serve(vec![(200, body)]);
        let mut dispatcher = Dispatcher::new(
            Some(offline_with_weeknd()),
            Some(online_for(&url)),
            Arc::new(MappingCache::in_memory(64)),
            DispatchOptions {
                provider: ProviderMode::OnlineThenOffline,
                ..DispatchOptions::default()
            },
        );
        let outcome =
            dispatcher.resolve(&TrackQuery::new("Blinding Lights").with_artist("The Weeknd"));
        let TrackOutcome::Resolved(resolution) = outcome else {
            panic!("expected resolution");
        };
        assert_eq!(resolution.provider, Provider::Offline);
        assert_eq!(resolution.result.artist_name.as_deref(), Some("The Weeknd"));
        server.join().unwrap();
    }

    #[test]
    fn escalation_activates_fuzzy_matching() {
        let store = empty_store();
        insert(&store, Partition::Hot, 1, "Yellow", "Coldplay", "Parachutes", 300_000);
        insert(&store, Partition::Hot, 2, "Yellow", "Another Band", "Misc", 400_000);
        let mut dispatcher = dispatcher_offline_only(OfflineResolver::new(store));
        let outcome = dispatcher.resolve(&TrackQuery::new("Yellow").with_artist("Goldplay"));
        let TrackOutcome::Resolved(resolution) = outcome else {
            panic!("expected resolution");
        };
        assert_eq!(resolution.result.artist_name.as_deref(), Some("Coldplay"));
        assert_eq!(resolution.result.confidence, Confidence::High);
    }

    #[test]
    fn broken_store_degrades_to_online() {
        let body = song_json(&[("The Weeknd", "Blinding Lights", "After Hours")]);
        let (url, server) = serve(vec![(200, body)]);
        // A connection with no tables: every query errors.
        let broken = OfflineResolver::new(OfflineStore::from_connection(
            Connection::open_in_memory().unwrap(),
        ));
        let mut dispatcher = Dispatcher::new(
            Some(broken),
            Some(online_for(&url)),
            Arc::new(MappingCache::in_memory(64)),
            DispatchOptions::default(),
        );
        let outcome = dispatcher.resolve(&TrackQuery::new("Blinding Lights"));
        let TrackOutcome::Resolved(resolution) = outcome else {
            panic!("expected resolution");
        };
        assert_eq!(resolution.provider, Provider::Online);
        server.join().unwrap();
    }

    #[test]
    fn manual_mapping_beats_resolvers() {
        let cache = Arc::new(MappingCache::in_memory(64));
        let query = TrackQuery::new("Blinding Lights").with_artist("The Weeknd");
        cache.store_manual(&query, "Corrected Credit", None);
        let mut dispatcher = Dispatcher::new(
            Some(offline_with_weeknd()),
            None,
            Arc::clone(&cache),
            DispatchOptions {
                provider: ProviderMode::OfflineOnly,
                ..DispatchOptions::default()
            },
        );
        let outcome = dispatcher.resolve(&query);
        let TrackOutcome::Resolved(resolution) = outcome else {
            panic!("expected resolution");
        };
        assert_eq!(resolution.provider, Provider::Cache);
        assert_eq!(
            resolution.result.artist_name.as_deref(),
            Some("Corrected Credit")
        );
    }

    #[test]
    fn set_mode_clears_lru() {
        let cache = Arc::new(MappingCache::in_memory(64));
        let mut dispatcher = Dispatcher::new(
            Some(offline_with_weeknd()),
            None,
            Arc::clone(&cache),
            DispatchOptions {
                provider: ProviderMode::OfflineOnly,
                ..DispatchOptions::default()
            },
        );
        dispatcher.resolve(&TrackQuery::new("Some Unknown"));
        assert!(cache.lru_len() > 0);
        dispatcher.set_mode(MatchMode::HighAccuracy);
        assert_eq!(cache.lru_len(), 0);
    }
}
