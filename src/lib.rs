//! Playback and streaming cache engine for a personal music client.
//!
//! **cadenza** is the playback core of a music client that streams tracks
//! from a remote provider. It turns an opaque `track_id` into continuous
//! audio with minimum latency after a user action, and keeps upcoming
//! tracks warm so transitions are instant:
//!
//! # Core Features
//!
//! * **Queue Playback**: install, reorder, shuffle and loop a queue of
//!   tracks, with durable persistence across restarts
//! * **Stream Resolution**: multi-client fallback resolution of signed
//!   stream URLs, cached until their signatures lapse
//! * **Byte Cache**: LRU-bounded on-disk cache of audio bodies, filled by
//!   a background precacher
//! * **Crossfade**: equal-power overlap between tracks on a dual-player
//!   engine, or gapless hard switches
//! * **Radio**: automatic queue extension with related tracks
//! * **Offline Library**: validated, resumable downloads with parallel
//!   byte ranges
//!
//! # Architecture
//!
//! The library is organized into several key modules:
//!
//! * **Playback**
//!   - [`controller`]: public facade and state machine
//!   - [`engine`]: dual-player crossfade engine
//!   - [`player`]: audio device and playback slots
//!   - [`source`]: track-to-source conversion
//!
//! * **Streaming & Caching**
//!   - [`resolver`]: stream resolution and URL caching
//!   - [`cache`]: on-disk LRU byte cache
//!   - [`downloader`]: segmented and range-continued downloads
//!   - [`precache`]: background fetch scheduling
//!   - [`library`]: offline download pipeline
//!
//! * **Queue**
//!   - [`queue`]: ordering, shuffle and skip policy
//!   - [`radio`]: related-track extension
//!   - [`persist`]: durable queue snapshots
//!
//! * **Support**
//!   - [`config`]: application configuration and user settings
//!   - [`http`]: rate-limited HTTP client
//!   - [`state`]: observable playback state
//!   - [`events`]: discrete notifications
//!   - [`error`]: error types and handling
//!   - [`track`]: data model
//!   - [`util`]: general helpers
//!
//! # Example
//!
//! ```rust,no_run
//! use std::sync::Arc;
//!
//! use cadenza::{
//!     config::{Config, Settings},
//!     controller::PlaybackController,
//!     persist::JsonFileStore,
//!     precache::AssumeUnmetered,
//! };
//!
//! async fn example() -> cadenza::error::Result<()> {
//!     let config = Config::with_base_dir("/var/lib/cadenza");
//!     let settings = Settings::load(&config.state_dir)?;
//!     let store = Arc::new(JsonFileStore::new(config.state_dir.clone()));
//!
//!     let controller = PlaybackController::new(
//!         config,
//!         settings,
//!         my_resolver(),
//!         my_recommender(),
//!         Arc::new(AssumeUnmetered),
//!         store,
//!     )
//!     .await?;
//!
//!     controller.start().await?;
//!     Ok(())
//! }
//! ```
//!
//! # Error Handling
//!
//! Errors are handled through the types in the [`error`] module, with
//! most functions returning [`Result`](error::Result). The components
//! that own a failure domain define their own taxonomy
//! ([`resolver::ResolveError`], [`downloader::DownloadError`],
//! [`cache::CacheError`]) and convert into the unified type at the
//! controller boundary.
//!
//! # Concurrency
//!
//! The library uses async/await for concurrency and is designed to work
//! with the Tokio async runtime. A single controller task serializes all
//! state mutations; network and cache I/O run on worker tasks.

#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![doc(test(attr(ignore)))]

#[macro_use]
extern crate log;

pub mod cache;
pub mod config;
pub mod controller;
pub mod downloader;
pub mod engine;
pub mod error;
pub mod events;
pub mod http;
pub mod library;
pub mod persist;
pub mod player;
pub mod precache;
pub mod queue;
pub mod radio;
pub mod resolver;
pub mod source;
pub mod state;
pub mod track;
pub mod util;
