//! trackmatch: resolve Apple Music play-history track identifiers to
//! canonical MusicBrainz artist credits for scrobbling, offline against an
//! optimized local corpus or online via the iTunes Search API.

pub mod batch;
pub mod cache;
pub mod config;
pub mod dispatch;
pub mod export;
pub mod ingest;
pub mod models;
pub mod offline;
pub mod online;
pub mod progress;
pub mod ratelimit;
pub mod safety;
pub mod session;
pub mod store;
pub mod text;
