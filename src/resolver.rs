//! Stream resolution with multi-client fallback and URL caching.
//!
//! Given a `(track_id, quality)` pair, the [`StreamResolver`] produces a
//! [`PlaybackData`]: a signed, time-limited stream URL plus the concrete
//! audio format it serves. Results are cached in memory until shortly
//! before their signature lapses, so repeated loads of the same track skip
//! the network entirely.
//!
//! # Client Fallback
//!
//! The remote resolver impersonates a sequence of official clients (web,
//! mobile, TV) because the provider serves different format sets, and
//! occasionally errors, per client surface. The walk order is fixed;
//! clients that failed recently are moved to the back of the walk until
//! [`StreamResolver::reset_client_failures`] is called on the first
//! successful playback after a fallback.
//!
//! # Quality Policy
//!
//! * `Auto` picks the highest bitrate at or below a per-network ceiling
//!   (128 kbit/s when metered, unlimited otherwise)
//! * `Low`/`Medium`/`High` pick the closest bitrate to 64/128/256 kbit/s
//! * `Max` picks the best available
//!
//! Ties are broken toward the simpler container: Opus/WebM over M4A.

use std::{
    collections::{HashMap, HashSet},
    sync::{Arc, Mutex},
    time::SystemTime,
};

use async_trait::async_trait;
use thiserror::Error;
use url::Url;

use crate::{
    error::{Error, ErrorKind},
    http,
    track::{AudioFormat, AudioQuality, PlaybackData, TrackId},
};

/// Errors produced while resolving a stream.
#[derive(Debug, Error)]
pub enum ResolveError {
    /// Every client surface failed to yield a playable format.
    #[error("no client could resolve the track")]
    Unresolvable,

    /// A previously resolved URL lapsed while in use.
    ///
    /// Triggers a single automatic re-resolve at the call site.
    #[error("stream URL expired mid-flight")]
    ExpiredMidFlight,

    /// Transport-level failure talking to the resolver.
    #[error("network failure: {0}")]
    Network(String),

    /// The provider refused the request for quota or geo reasons.
    #[error("quota exceeded or region blocked: {0}")]
    QuotaOrGeo(String),
}

impl From<ResolveError> for Error {
    fn from(e: ResolveError) -> Self {
        let kind = match &e {
            ResolveError::Unresolvable => ErrorKind::NotFound,
            ResolveError::ExpiredMidFlight => ErrorKind::DeadlineExceeded,
            ResolveError::Network(_) => ErrorKind::Unavailable,
            ResolveError::QuotaOrGeo(_) => ErrorKind::ResourceExhausted,
        };
        Self::new(kind, e)
    }
}

/// Client surfaces the remote resolver can impersonate.
///
/// Ordered by preference: the web surface offers the widest format
/// selection, the TV surface is the most permissive fallback.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
pub enum ClientKind {
    /// Web player surface.
    Web,
    /// Official mobile app surface.
    Mobile,
    /// Living-room app surface.
    Tv,
}

impl ClientKind {
    /// Preferred walk order.
    pub const ORDER: [Self; 3] = [Self::Web, Self::Mobile, Self::Tv];
}

impl std::fmt::Display for ClientKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Web => write!(f, "web"),
            Self::Mobile => write!(f, "mobile"),
            Self::Tv => write!(f, "tv"),
        }
    }
}

/// A single stream variant offered by the provider.
#[derive(Clone, Debug)]
pub struct StreamFormat {
    /// Signed URL serving this variant.
    pub url: Url,
    /// The audio format the URL serves.
    pub format: AudioFormat,
}

/// A resolved set of stream variants sharing one signature expiry.
#[derive(Clone, Debug)]
pub struct ResolvedStreams {
    /// Audio-only variants, unordered.
    pub formats: Vec<StreamFormat>,
    /// When the URL signatures lapse.
    pub expires_at: SystemTime,
}

/// External contract of the remote resolver.
///
/// Implementations talk to the provider's player endpoint on behalf of one
/// client surface and return the audio-only formats it offers.
#[async_trait]
pub trait FormatSource: Send + Sync {
    /// Fetches the audio formats offered for a track on one client surface.
    ///
    /// # Errors
    ///
    /// Returns [`ResolveError::Network`] for transport failures,
    /// [`ResolveError::QuotaOrGeo`] for provider refusals, and
    /// [`ResolveError::Unresolvable`] when the surface has no playable
    /// formats for this track.
    async fn fetch(
        &self,
        track_id: &str,
        client: ClientKind,
    ) -> Result<ResolvedStreams, ResolveError>;
}

/// Bitrate ceiling applied to `Auto` quality on metered connections.
const METERED_CEILING: u32 = 128_000;

/// Stream resolver with URL caching and client fallback.
///
/// Shared across the controller, the precache scheduler and the source
/// builder; all state is interior and lock-guarded.
pub struct StreamResolver {
    /// Remote resolver contract.
    source: Arc<dyn FormatSource>,

    /// Unexpired results keyed by id and quality.
    cache: Mutex<HashMap<(TrackId, AudioQuality), PlaybackData>>,

    /// Ids with a prefetch resolve in flight.
    ///
    /// Tested before a new prefetch task is spawned so bursts of queue
    /// changes cannot stack duplicate resolves.
    in_flight: Mutex<HashSet<TrackId>>,

    /// Consecutive failures per client surface.
    failures: Mutex<HashMap<ClientKind, u32>>,
}

impl StreamResolver {
    /// Creates a resolver over the given remote contract.
    #[must_use]
    pub fn new(source: Arc<dyn FormatSource>) -> Self {
        Self {
            source,
            cache: Mutex::new(HashMap::new()),
            in_flight: Mutex::new(HashSet::new()),
            failures: Mutex::new(HashMap::new()),
        }
    }

    /// Resolves a stream for the given track and quality.
    ///
    /// Consults the in-memory cache first; on a miss, walks the client
    /// surfaces until one yields a playable format set, then selects a
    /// format per the quality policy.
    ///
    /// # Errors
    ///
    /// Returns [`ResolveError::Unresolvable`] if every surface failed,
    /// or the last transport error when all failures were network-level.
    pub async fn resolve(
        &self,
        track_id: &str,
        quality: AudioQuality,
        metered: bool,
    ) -> Result<PlaybackData, ResolveError> {
        if let Some(cached) = self.cached(track_id, quality) {
            trace!("resolver cache hit for {track_id} ({quality})");
            return Ok(cached);
        }

        let mut last_network: Option<ResolveError> = None;
        for client in self.client_walk() {
            match self.source.fetch(track_id, client).await {
                Ok(resolved) => {
                    let Some(selected) = select_format(&resolved.formats, quality, metered) else {
                        debug!("{client} client returned no usable formats for {track_id}");
                        self.record_failure(client);
                        continue;
                    };

                    let data = PlaybackData {
                        stream_url: selected.url.clone(),
                        format: selected.format.clone(),
                        expires_at: resolved.expires_at,
                    };

                    debug!(
                        "resolved {track_id} via {client} client: {} @ {} kbit/s",
                        data.format.mime_type,
                        data.format.bitrate / 1000
                    );

                    self.cache
                        .lock()
                        .unwrap_or_else(std::sync::PoisonError::into_inner)
                        .insert((track_id.to_string(), quality), data.clone());

                    return Ok(data);
                }
                Err(ResolveError::QuotaOrGeo(reason)) => {
                    // A refusal applies to every surface; no point walking on.
                    warn!("resolver refused {track_id}: {reason}");
                    return Err(ResolveError::QuotaOrGeo(reason));
                }
                Err(e) => {
                    warn!("{client} client failed to resolve {track_id}: {e}");
                    self.record_failure(client);
                    if matches!(e, ResolveError::Network(_)) {
                        last_network = Some(e);
                    }
                }
            }
        }

        Err(last_network.unwrap_or(ResolveError::Unresolvable))
    }

    /// Forces a fresh resolve, discarding any cached entry first.
    ///
    /// Used to recover from [`ResolveError::ExpiredMidFlight`] and from
    /// DNS failures observed by the precacher.
    ///
    /// # Errors
    ///
    /// Same as [`StreamResolver::resolve`].
    pub async fn resolve_fresh(
        &self,
        track_id: &str,
        quality: AudioQuality,
        metered: bool,
    ) -> Result<PlaybackData, ResolveError> {
        self.clear(track_id);
        self.resolve(track_id, quality, metered).await
    }

    /// Warms the URL cache for upcoming tracks.
    ///
    /// Fire-and-forget: failures are logged and dropped. Resolves already
    /// in flight or already cached are skipped.
    pub fn prefetch(self: &Arc<Self>, ids: Vec<TrackId>, quality: AudioQuality, metered: bool) {
        for id in ids {
            if self.has_cached(&id) {
                continue;
            }

            {
                let mut in_flight = self
                    .in_flight
                    .lock()
                    .unwrap_or_else(std::sync::PoisonError::into_inner);
                if !in_flight.insert(id.clone()) {
                    continue;
                }
            }

            let resolver = Arc::clone(self);
            tokio::spawn(async move {
                if let Err(e) = resolver.resolve(&id, quality, metered).await {
                    debug!("prefetch resolve of {id} failed: {e}");
                }
                resolver
                    .in_flight
                    .lock()
                    .unwrap_or_else(std::sync::PoisonError::into_inner)
                    .remove(&id);
            });
        }
    }

    /// Returns whether an unexpired result is cached for the id at any
    /// quality.
    #[must_use]
    pub fn has_cached(&self, track_id: &str) -> bool {
        self.cache
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .iter()
            .any(|((id, _), data)| id == track_id && data.is_fresh())
    }

    /// Drops cached results for one track.
    pub fn clear(&self, track_id: &str) {
        self.cache
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .retain(|(id, _), _| id != track_id);
    }

    /// Drops the entire URL cache.
    ///
    /// Called on quality changes: cached entries would otherwise serve the
    /// previous quality's formats.
    pub fn clear_all(&self) {
        self.cache
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .clear();
    }

    /// Clears the per-client failure counters.
    ///
    /// Called on the first successful playback after a fallback event, so
    /// the preferred surface is retried first again.
    pub fn reset_client_failures(&self) {
        self.failures
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .clear();
    }

    /// Returns the cached entry for an id and quality, if still fresh.
    fn cached(&self, track_id: &str, quality: AudioQuality) -> Option<PlaybackData> {
        let mut cache = self
            .cache
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);

        match cache.get(&(track_id.to_string(), quality)) {
            Some(data) if data.is_fresh() => Some(data.clone()),
            Some(_) => {
                cache.remove(&(track_id.to_string(), quality));
                None
            }
            None => None,
        }
    }

    /// Client walk order: preferred order, recently failed surfaces last.
    fn client_walk(&self) -> Vec<ClientKind> {
        let failures = self
            .failures
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);

        let mut order = ClientKind::ORDER.to_vec();
        order.sort_by_key(|client| failures.get(client).copied().unwrap_or(0));
        order
    }

    /// Bumps the failure counter for a client surface.
    fn record_failure(&self, client: ClientKind) {
        *self
            .failures
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .entry(client)
            .or_insert(0) += 1;
    }
}

/// Selects a format per the quality policy.
///
/// Returns `None` when the list is empty.
#[must_use]
pub fn select_format(
    formats: &[StreamFormat],
    quality: AudioQuality,
    metered: bool,
) -> Option<&StreamFormat> {
    if formats.is_empty() {
        return None;
    }

    match quality {
        AudioQuality::Auto => {
            let ceiling = if metered { Some(METERED_CEILING) } else { None };
            let mut candidates: Vec<&StreamFormat> = formats
                .iter()
                .filter(|f| ceiling.is_none_or(|max| f.format.bitrate <= max))
                .collect();

            if candidates.is_empty() {
                // Nothing under the ceiling: take the most frugal option.
                candidates = formats.iter().collect();
                candidates.sort_by_key(|f| (f.format.bitrate, f.format.mime_complexity()));
                return candidates.first().copied();
            }

            candidates.sort_by_key(|f| {
                (std::cmp::Reverse(f.format.bitrate), f.format.mime_complexity())
            });
            candidates.first().copied()
        }
        AudioQuality::Max => formats
            .iter()
            .min_by_key(|f| (std::cmp::Reverse(f.format.bitrate), f.format.mime_complexity())),
        AudioQuality::Low | AudioQuality::Medium | AudioQuality::High => {
            let target = quality.target_bitrate().unwrap_or(u32::MAX);
            formats.iter().min_by_key(|f| {
                let distance = f.format.bitrate.abs_diff(target);
                (distance, f.format.mime_complexity())
            })
        }
    }
}

/// A [`FormatSource`] over direct audio URLs.
///
/// Treats the track id as a URL and probes it with a HEAD request for
/// content length and MIME type. Used by the binary for direct-URL
/// playback and by integration tests; real deployments plug in a provider
/// resolver here.
pub struct DirectUrlSource {
    client: Arc<http::Client>,
}

impl DirectUrlSource {
    /// Nominal signature lifetime assumed for direct URLs.
    const DIRECT_URL_TTL: std::time::Duration = std::time::Duration::from_secs(6 * 60 * 60);

    /// Creates a source probing direct URLs with the given client.
    #[must_use]
    pub fn new(client: Arc<http::Client>) -> Self {
        Self { client }
    }
}

#[async_trait]
impl FormatSource for DirectUrlSource {
    async fn fetch(
        &self,
        track_id: &str,
        _client: ClientKind,
    ) -> Result<ResolvedStreams, ResolveError> {
        let url: Url = track_id
            .parse()
            .map_err(|_| ResolveError::Unresolvable)?;

        let response = self
            .client
            .unlimited
            .head(url.clone())
            .send()
            .await
            .map_err(|e| ResolveError::Network(e.to_string()))?;

        if !response.status().is_success() {
            return Err(ResolveError::Unresolvable);
        }

        let mime_type = response
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .unwrap_or("audio/mpeg")
            .to_string();
        let content_length = response.content_length().filter(|len| *len > 0);

        Ok(ResolvedStreams {
            formats: vec![StreamFormat {
                url,
                format: AudioFormat {
                    mime_type,
                    codecs: None,
                    bitrate: 128_000,
                    content_length,
                },
            }],
            expires_at: SystemTime::now() + Self::DIRECT_URL_TTL,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn stream(mime: &str, codecs: Option<&str>, bitrate: u32) -> StreamFormat {
        StreamFormat {
            url: "https://cdn.example.com/body".parse().unwrap(),
            format: AudioFormat {
                mime_type: mime.to_string(),
                codecs: codecs.map(ToOwned::to_owned),
                bitrate,
                content_length: None,
            },
        }
    }

    fn catalog() -> Vec<StreamFormat> {
        vec![
            stream("audio/webm", Some("opus"), 64_000),
            stream("audio/webm", Some("opus"), 140_000),
            stream("audio/mp4", Some("mp4a.40.2"), 140_000),
            stream("audio/webm", Some("opus"), 256_000),
        ]
    }

    #[test]
    fn auto_unmetered_takes_best() {
        let formats = catalog();
        let picked = select_format(&formats, AudioQuality::Auto, false).unwrap();
        assert_eq!(picked.format.bitrate, 256_000);
    }

    #[test]
    fn auto_metered_respects_ceiling() {
        let formats = catalog();
        let picked = select_format(&formats, AudioQuality::Auto, true).unwrap();
        assert_eq!(picked.format.bitrate, 64_000);
    }

    #[test]
    fn auto_metered_falls_back_to_most_frugal() {
        let formats = vec![stream("audio/webm", Some("opus"), 256_000)];
        let picked = select_format(&formats, AudioQuality::Auto, true).unwrap();
        assert_eq!(picked.format.bitrate, 256_000);
    }

    #[test]
    fn fixed_quality_picks_closest() {
        let formats = catalog();
        let picked = select_format(&formats, AudioQuality::Medium, false).unwrap();
        assert_eq!(picked.format.bitrate, 140_000);
    }

    #[test]
    fn ties_prefer_opus() {
        let formats = catalog();
        let picked = select_format(&formats, AudioQuality::Medium, false).unwrap();
        assert!(picked.format.is_opus());
    }

    #[test]
    fn max_picks_best_bitrate() {
        let formats = catalog();
        let picked = select_format(&formats, AudioQuality::Max, false).unwrap();
        assert_eq!(picked.format.bitrate, 256_000);
    }

    #[test]
    fn empty_formats_yield_none() {
        assert!(select_format(&[], AudioQuality::Auto, false).is_none());
    }

    struct FixedSource {
        expires_at: SystemTime,
    }

    #[async_trait]
    impl FormatSource for FixedSource {
        async fn fetch(
            &self,
            _track_id: &str,
            _client: ClientKind,
        ) -> Result<ResolvedStreams, ResolveError> {
            Ok(ResolvedStreams {
                formats: vec![stream("audio/webm", Some("opus"), 128_000)],
                expires_at: self.expires_at,
            })
        }
    }

    #[tokio::test]
    async fn resolve_caches_fresh_results() {
        let resolver = StreamResolver::new(Arc::new(FixedSource {
            expires_at: SystemTime::now() + std::time::Duration::from_secs(3600),
        }));

        let first = resolver
            .resolve("abc", AudioQuality::Auto, false)
            .await
            .unwrap();
        assert!(resolver.has_cached("abc"));

        let second = resolver
            .resolve("abc", AudioQuality::Auto, false)
            .await
            .unwrap();
        assert_eq!(first, second);

        resolver.clear_all();
        assert!(!resolver.has_cached("abc"));
    }

    #[tokio::test]
    async fn stale_entries_are_not_served() {
        let resolver = StreamResolver::new(Arc::new(FixedSource {
            expires_at: SystemTime::now() + std::time::Duration::from_secs(10),
        }));

        // Expiry is inside the safety margin, so the result must not be
        // reported as cached.
        resolver
            .resolve("abc", AudioQuality::Auto, false)
            .await
            .unwrap();
        assert!(!resolver.has_cached("abc"));
    }
}
