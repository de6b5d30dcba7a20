//! Conversion of queued tracks into playable audio sources.
//!
//! The source builder prefers, in order:
//! 1. a local file from the offline library (at least 10 KB)
//! 2. a committed body from the byte cache
//! 3. a direct network stream, with a background precache queued so the
//!    next play of the same track hits the cache
//!
//! All three produce an [`AudioSourceReader`]: a buffered `Read + Seek`
//! the player's decoder consumes. Network streams are wrapped in a
//! [`StreamDownload`] whose prefetch is awaited before the reader is
//! handed out, so the decoder never blocks on an empty buffer while
//! reading the container header.

use std::{
    io::{BufReader, Read, Seek},
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Mutex, PoisonError,
    },
    time::Duration,
};

use stream_download::{
    http::HttpStream, source::SourceStream, storage::temp::TempStorageProvider, StreamDownload,
    StreamPhase, StreamState,
};
use thiserror::Error as ThisError;

use crate::{
    cache::{ByteCache, CacheKey},
    error::{Error, ErrorKind, Result},
    http,
    resolver::{ResolveError, StreamResolver},
    track::{AudioQuality, PlaybackData, Track, TrackId},
};

/// Combines Read and Seek traits for audio stream handling.
///
/// This trait requires thread-safety (Send + Sync) to enable:
/// * Concurrent playback and downloading
/// * Safe sharing between threads
/// * Integration with async runtimes
pub trait ReadSeek: Read + Seek + Send + Sync {}

/// Blanket implementation for any type that implements both Read and Seek
impl<T: Read + Seek + Send + Sync> ReadSeek for T {}

/// Default buffer size for audio stream reads (32 KiB).
///
/// This size matches the decoder's read pattern, which reads sequentially
/// in increasing chunks up to 32 KiB.
pub const BUFFER_LEN: usize = 32 * 1024;

/// Smallest local file accepted as a playable copy.
const MIN_LOCAL_FILE_BYTES: u64 = 10 * 1024;

/// Amount of audio to buffer before playback can start.
///
/// This helps prevent playback interruptions by ensuring
/// enough audio data is available.
const PREFETCH_LENGTH: Duration = Duration::from_secs(3);

/// Default prefetch size in bytes when the body length is unknown.
const PREFETCH_DEFAULT: u64 = 60 * 1024;

/// Errors raised while constructing a source.
#[derive(Debug, ThisError)]
pub enum SourceError {
    /// The platform refused the loopback/cached file path.
    ///
    /// Latched for the process lifetime: subsequent builds go straight to
    /// direct streaming.
    #[error("platform blocked cached playback path")]
    CleartextLoopbackBlocked,

    /// The audio backend refused the source.
    #[error("audio backend refused source: {0}")]
    BackendRefused(String),
}

impl From<SourceError> for Error {
    fn from(e: SourceError) -> Self {
        let kind = match &e {
            SourceError::CleartextLoopbackBlocked => ErrorKind::PermissionDenied,
            SourceError::BackendRefused(_) => ErrorKind::Unavailable,
        };
        Self::new(kind, e)
    }
}

/// Where a built source draws its bytes from.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum SourceKind {
    /// Offline library file.
    LocalFile,
    /// Committed byte-cache body.
    CachedBody,
    /// Direct network stream.
    DirectStream,
}

/// A playable source handed to a [`PlayerHandle`](crate::player::PlayerHandle).
pub struct AudioSourceReader {
    track_id: TrackId,
    duration: Option<Duration>,
    buffered: Arc<Mutex<Duration>>,
    reader: Box<dyn ReadSeek>,
}

impl AudioSourceReader {
    /// Identity of the track this source plays.
    #[must_use]
    pub fn track_id(&self) -> &str {
        &self.track_id
    }

    /// Track duration, when known ahead of decoding.
    #[must_use]
    pub fn duration(&self) -> Option<Duration> {
        self.duration
    }

    /// Shared downloaded-ahead marker.
    ///
    /// File-backed sources report their full duration immediately;
    /// network sources update it from the download progress callback.
    #[must_use]
    pub fn buffered_handle(&self) -> Arc<Mutex<Duration>> {
        Arc::clone(&self.buffered)
    }

    /// Consumes the source, yielding the reader for the decoder.
    #[must_use]
    pub fn into_reader(self) -> Box<dyn ReadSeek> {
        self.reader
    }
}

/// A built source plus the metadata the controller needs.
pub struct BuiltSource {
    /// The reader for the player.
    pub reader: AudioSourceReader,

    /// Which path produced the source.
    pub kind: SourceKind,

    /// Stream data used, when the source came from the network or cache.
    pub playback_data: Option<PlaybackData>,

    /// Whether a background precache of this track is worthwhile.
    ///
    /// True only for direct streams; file-backed sources are already on
    /// disk.
    pub precache_wanted: bool,
}

/// Builds playable sources for queued tracks.
pub struct SourceBuilder {
    resolver: Arc<StreamResolver>,
    cache: Arc<ByteCache>,
    client: Arc<http::Client>,

    /// Cleartext-loopback latch.
    ///
    /// Once the platform refuses the cached file path, every later build
    /// goes straight to direct streaming for the rest of the process.
    cached_path_disabled: AtomicBool,
}

impl SourceBuilder {
    /// Creates a builder over the shared resolver, cache and client.
    #[must_use]
    pub fn new(
        resolver: Arc<StreamResolver>,
        cache: Arc<ByteCache>,
        client: Arc<http::Client>,
    ) -> Self {
        Self {
            resolver,
            cache,
            client,
            cached_path_disabled: AtomicBool::new(false),
        }
    }

    /// Builds a source for the track.
    ///
    /// # Errors
    ///
    /// Returns the underlying resolve error when no local or cached copy
    /// exists and the stream cannot be resolved, or a stream
    /// initialization error for the direct path.
    pub async fn build(
        &self,
        track: &Track,
        quality: AudioQuality,
        metered: bool,
    ) -> Result<BuiltSource> {
        // Local library copy wins: no network, no cache bookkeeping.
        if track.has_local_file() {
            if let Some(path) = track.local_file_path.as_deref() {
                debug!("playing {track} from local file");
                return self.file_source(track, path, SourceKind::LocalFile, None);
            }
        }

        let data = self
            .resolver
            .resolve(&track.id, quality, metered)
            .await
            .map_err(Error::from)?;

        // Then a committed cache body.
        if !self.cached_path_disabled.load(Ordering::Relaxed) {
            let key = CacheKey::new(track.id.clone(), quality, data.format.bitrate);
            if let Some(path) = self
                .cache
                .open_for_read(&key, data.format.content_length)
                .await
                .map_err(Error::from)?
            {
                debug!("playing {track} from stream cache");
                match self.file_source(track, &path, SourceKind::CachedBody, Some(data.clone())) {
                    Ok(source) => return Ok(source),
                    Err(e) if e.kind == ErrorKind::PermissionDenied => {
                        // Some platforms block the cached-file path once
                        // hardened; latch and fall through to streaming.
                        warn!(
                            "{}; disabling cached playback for this process ({e})",
                            SourceError::CleartextLoopbackBlocked
                        );
                        self.cached_path_disabled.store(true, Ordering::Relaxed);
                    }
                    Err(e) => return Err(e),
                }
            }
        }

        // Finally, stream directly and let the precacher fill the cache.
        debug!("playing {track} from direct stream");
        match self.stream_source(track, data).await {
            Ok(source) => Ok(source),
            Err(first) => {
                // A signed URL can lapse between resolve and open; one
                // silent re-resolve covers it.
                debug!(
                    "direct stream for {track} failed ({first}), assuming {}",
                    ResolveError::ExpiredMidFlight
                );
                let data = self
                    .resolver
                    .resolve_fresh(&track.id, quality, metered)
                    .await
                    .map_err(Error::from)?;
                self.stream_source(track, data).await
            }
        }
    }

    /// Builds a file-backed source.
    fn file_source(
        &self,
        track: &Track,
        path: &std::path::Path,
        kind: SourceKind,
        playback_data: Option<PlaybackData>,
    ) -> Result<BuiltSource> {
        let meta = std::fs::metadata(path)?;
        if meta.len() < MIN_LOCAL_FILE_BYTES {
            return Err(Error::data_loss(format!(
                "local file for {track} is truncated ({} bytes)",
                meta.len()
            )));
        }

        let file = std::fs::File::open(path)?;
        let reader = BufReader::with_capacity(BUFFER_LEN, file);

        // A file on disk is fully buffered by definition.
        let buffered = Arc::new(Mutex::new(track.duration));

        Ok(BuiltSource {
            reader: AudioSourceReader {
                track_id: track.id.clone(),
                duration: (!track.duration.is_zero()).then_some(track.duration),
                buffered,
                reader: Box::new(reader),
            },
            kind,
            playback_data,
            precache_wanted: false,
        })
    }

    /// Builds a direct network source.
    ///
    /// The HTTP stream is wrapped in a [`StreamDownload`] over temp-file
    /// storage with a duration-scaled prefetch; download progress feeds
    /// the buffered-position marker.
    async fn stream_source(&self, track: &Track, data: PlaybackData) -> Result<BuiltSource> {
        let stream =
            HttpStream::new(self.client.unlimited.clone(), data.stream_url.clone()).await?;

        // Scale the prefetch with the real byte rate when the size is
        // known. This assumes constant bitrate, which is a good enough
        // approximation for a prefetch.
        let mut prefetch_size = PREFETCH_DEFAULT;
        if let Some(file_size) = stream.content_length() {
            info!("streaming {file_size} bytes for {track}");
            if !track.duration.is_zero() {
                prefetch_size = PREFETCH_LENGTH.as_secs()
                    * file_size.saturating_div(track.duration.as_secs().max(1));
            }
        } else {
            info!("streaming {track} with unknown length");
        }

        let buffered = Arc::new(Mutex::new(Duration::ZERO));
        let duration = (!track.duration.is_zero()).then_some(track.duration);

        // Progress callback keeps the buffered marker current.
        let progress_buffered = Arc::clone(&buffered);
        let callback = move |stream: &HttpStream<_>,
                             stream_state: StreamState,
                             _: &tokio_util::sync::CancellationToken| {
            if let Some(duration) = duration {
                if stream_state.phase == StreamPhase::Complete {
                    *progress_buffered
                        .lock()
                        .unwrap_or_else(PoisonError::into_inner) = duration;
                } else if let Some(file_size) = stream.content_length() {
                    if file_size > 0 {
                        #[expect(clippy::cast_precision_loss)]
                        let progress = stream_state.current_position as f64 / file_size as f64;
                        *progress_buffered
                            .lock()
                            .unwrap_or_else(PoisonError::into_inner) =
                            duration.mul_f64(progress.clamp(0.0, 1.0));
                    }
                }
            }
        };

        // The `await` here will *not* block until the download is
        // complete, only until the prefetch is filled. The download
        // continues in the background and drops with the reader.
        let download = StreamDownload::from_stream(
            stream,
            TempStorageProvider::default(),
            stream_download::Settings::default()
                .on_progress(callback)
                .prefetch_bytes(prefetch_size)
                .cancel_on_drop(true),
        )
        .await?;

        let reader = BufReader::with_capacity(BUFFER_LEN, download);

        Ok(BuiltSource {
            reader: AudioSourceReader {
                track_id: track.id.clone(),
                duration,
                buffered,
                reader: Box::new(reader),
            },
            kind: SourceKind::DirectStream,
            playback_data: Some(data),
            precache_wanted: true,
        })
    }
}
