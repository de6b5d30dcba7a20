//! Background precaching of upcoming queue entries.
//!
//! Whenever the queue changes, the current index advances or settings
//! change, the controller hands the scheduler a snapshot of the upcoming
//! tracks. For each candidate the scheduler resolves stream data, claims
//! the byte cache's write slot and downloads the body, committing it so
//! the next source build is a cache hit.
//!
//! # Policy
//!
//! * Skipped entirely on metered networks when the Wi-Fi-only setting is
//!   on.
//! * Only the next `min(3, max_concurrent)` indices are considered.
//! * Candidates with a local file, an in-flight fetch or a committed
//!   body are skipped.
//! * A global semaphore caps concurrent downloads at `max_concurrent`;
//!   waiters are served in FIFO order.
//! * Every commit is followed by a cache limit pass.
//!
//! # DNS Recovery
//!
//! CDN hostnames rotate; a stale resolved URL can point at a host that no
//! longer exists. On a transient failure the scheduler clears the URL
//! cache for the track, re-resolves once and retries the download. After
//! that it logs and drops the candidate.

use std::{
    collections::HashSet,
    sync::{Arc, Mutex, PoisonError},
};

use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;

use crate::{
    cache::{ByteCache, CacheKey},
    config::Settings,
    downloader::{DownloadError, Downloader},
    resolver::StreamResolver,
    track::{Track, TrackId},
};

/// Connectivity probe.
///
/// Out-of-scope collaborator: the embedding platform knows whether the
/// current route is metered. The default assumes an unmetered network.
pub trait NetworkMonitor: Send + Sync {
    /// Returns whether the current connection is Wi-Fi/Ethernet-class.
    fn is_unmetered(&self) -> bool;
}

/// Default [`NetworkMonitor`] that always reports an unmetered network.
pub struct AssumeUnmetered;

impl NetworkMonitor for AssumeUnmetered {
    fn is_unmetered(&self) -> bool {
        true
    }
}

/// How many upcoming indices are considered per scheduling pass.
#[must_use]
pub fn lookahead_count(max_concurrent: u8) -> usize {
    usize::from(max_concurrent.max(1)).min(3)
}

/// Background precache scheduler.
pub struct PrecacheScheduler {
    resolver: Arc<StreamResolver>,
    cache: Arc<ByteCache>,
    downloader: Downloader,
    network: Arc<dyn NetworkMonitor>,

    /// Download slots; replaced when the concurrency setting changes.
    semaphore: Mutex<(u8, Arc<Semaphore>)>,

    /// Tracks with a precache task in flight.
    in_flight: Arc<Mutex<HashSet<TrackId>>>,

    /// Fired on shutdown; drains workers.
    cancel: CancellationToken,
}

impl PrecacheScheduler {
    /// Creates a scheduler over the shared resolver, cache and client.
    #[must_use]
    pub fn new(
        resolver: Arc<StreamResolver>,
        cache: Arc<ByteCache>,
        downloader: Downloader,
        network: Arc<dyn NetworkMonitor>,
        max_concurrent: u8,
    ) -> Self {
        let max_concurrent = max_concurrent.clamp(1, 4);
        Self {
            resolver,
            cache,
            downloader,
            network,
            semaphore: Mutex::new((
                max_concurrent,
                Arc::new(Semaphore::new(usize::from(max_concurrent))),
            )),
            in_flight: Arc::new(Mutex::new(HashSet::new())),
            cancel: CancellationToken::new(),
        }
    }

    /// Adjusts the concurrency cap.
    ///
    /// Running downloads keep their permits on the old semaphore; new
    /// downloads queue on the resized one.
    pub fn set_max_concurrent(&self, max_concurrent: u8) {
        let max_concurrent = max_concurrent.clamp(1, 4);
        let mut guard = self
            .semaphore
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        if guard.0 != max_concurrent {
            debug!("precache concurrency set to {max_concurrent}");
            *guard = (
                max_concurrent,
                Arc::new(Semaphore::new(usize::from(max_concurrent))),
            );
        }
    }

    /// Schedules fetches for the upcoming tracks.
    ///
    /// `upcoming` is the queue slice after the current index, in order.
    /// Fire-and-forget: workers run on the runtime and release their
    /// permits when done.
    pub fn schedule_ahead(self: &Arc<Self>, upcoming: &[Track], settings: &Settings) {
        if settings.stream_cache_wifi_only && !self.network.is_unmetered() {
            debug!("precache skipped: metered connection and Wi-Fi-only set");
            return;
        }

        let quality = settings.streaming_quality;
        let metered = !self.network.is_unmetered();
        let limit_bytes = settings.stream_cache_limit_bytes();
        let parts = settings.download_parallel_part_count;
        let min_parallel = settings.download_parallel_min_size_bytes();

        for track in upcoming
            .iter()
            .take(lookahead_count(settings.stream_cache_max_concurrent))
        {
            if track.has_local_file() {
                continue;
            }

            {
                let mut in_flight = self
                    .in_flight
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner);
                if !in_flight.insert(track.id.clone()) {
                    continue;
                }
            }

            let scheduler = Arc::clone(self);
            let semaphore = {
                let guard = scheduler
                    .semaphore
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner);
                Arc::clone(&guard.1)
            };
            let track = track.clone();

            tokio::spawn(async move {
                let _permit = match semaphore.acquire().await {
                    Ok(permit) => permit,
                    Err(_) => return,
                };

                if scheduler.cancel.is_cancelled() {
                    return;
                }

                if let Err(e) = scheduler
                    .fetch_one(&track, quality, metered, limit_bytes, parts, min_parallel)
                    .await
                {
                    debug!("precache of {track} dropped: {e}");
                }

                scheduler
                    .in_flight
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner)
                    .remove(&track.id);
            });
        }
    }

    /// Fetches one track into the byte cache.
    async fn fetch_one(
        &self,
        track: &Track,
        quality: crate::track::AudioQuality,
        metered: bool,
        limit_bytes: u64,
        parts: u8,
        min_parallel: u64,
    ) -> Result<(), crate::error::Error> {
        let mut data = self.resolver.resolve(&track.id, quality, metered).await?;
        let mut key = CacheKey::new(track.id.clone(), quality, data.format.bitrate);

        // Already cached at this quality: nothing to do.
        if self.cache.open_for_read(&key, data.format.content_length).await?.is_some() {
            return Ok(());
        }

        let Some(slot) = self.cache.reserve_write(&key) else {
            trace!("precache of {track} skipped: writer already active");
            return Ok(());
        };

        let result = self
            .downloader
            .download(
                &data.stream_url,
                slot.temp_path(),
                data.format.content_length,
                parts,
                min_parallel,
                &self.cancel,
                |_, _| {},
            )
            .await;

        match result {
            Ok(_) => {
                self.cache
                    .commit(slot, data.format.content_length, &data.format.mime_type)
                    .await?;
            }
            Err(DownloadError::NetworkTransient(reason)) => {
                // Possibly a rotated CDN hostname: re-resolve once and retry.
                debug!("precache of {track} hit transient failure ({reason}), re-resolving");
                self.cache.abort(slot).await;

                data = self
                    .resolver
                    .resolve_fresh(&track.id, quality, metered)
                    .await?;
                key = CacheKey::new(track.id.clone(), quality, data.format.bitrate);

                let Some(slot) = self.cache.reserve_write(&key) else {
                    return Ok(());
                };
                match self
                    .downloader
                    .download(
                        &data.stream_url,
                        slot.temp_path(),
                        data.format.content_length,
                        parts,
                        min_parallel,
                        &self.cancel,
                        |_, _| {},
                    )
                    .await
                {
                    Ok(_) => {
                        self.cache
                            .commit(slot, data.format.content_length, &data.format.mime_type)
                            .await?;
                    }
                    Err(e) => {
                        self.cache.abort(slot).await;
                        return Err(e.into());
                    }
                }
            }
            Err(e) => {
                self.cache.abort(slot).await;
                return Err(e.into());
            }
        }

        info!("precached {track}");
        self.cache.enforce_limit(limit_bytes).await?;
        Ok(())
    }

    /// Returns whether a precache of the track is in flight.
    #[must_use]
    pub fn is_in_flight(&self, track_id: &str) -> bool {
        self.in_flight
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .contains(track_id)
    }

    /// Cancels outstanding work and prevents new downloads.
    pub fn shutdown(&self) {
        self.cancel.cancel();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lookahead_is_capped_at_three() {
        assert_eq!(lookahead_count(1), 1);
        assert_eq!(lookahead_count(2), 2);
        assert_eq!(lookahead_count(3), 3);
        assert_eq!(lookahead_count(4), 3);
    }

    #[test]
    fn lookahead_never_zero() {
        assert_eq!(lookahead_count(0), 1);
    }
}
