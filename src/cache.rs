//! On-disk LRU cache of downloaded audio bodies.
//!
//! The cache holds fully downloaded audio bodies keyed by
//! `(track_id, quality, bitrate)`, so a quality switch produces clean
//! misses instead of stale bodies. Files live in a single
//! `stream_audio_cache/` directory:
//!
//! * `*.audio` - committed bodies
//! * `*.audio.mime` - MIME sidecar for committed bodies
//! * `*.audio.part`, `*.audio.precache.part`, `*.audio.segN.part` -
//!   transient download artifacts, never served
//!
//! The file modification time is the LRU key: every successful read
//! touches it, and [`ByteCache::enforce_limit`] deletes the oldest bodies
//! until the configured budget is met.
//!
//! # Writer Discipline
//!
//! At most one writer per key: [`ByteCache::reserve_write`] registers the
//! key as in-progress and concurrent writers back off. Readers only ever
//! see a committed, validated body or [`None`] - a partial file is never
//! returned to the player.

use std::{
    collections::HashSet,
    fs::FileTimes,
    path::{Path, PathBuf},
    sync::{Arc, Mutex, PoisonError},
    time::SystemTime,
};

use thiserror::Error;

use crate::{
    error::{Error, ErrorKind},
    track::{AudioQuality, TrackId},
    util::sanitize_file_name,
};

/// Smallest body size accepted as a valid audio file.
///
/// Anything shorter is a truncated artifact: even the most frugal Opus
/// stream exceeds this within two seconds of audio.
pub const MIN_BODY_BYTES: u64 = 50 * 1024;

/// Errors produced by cache operations.
///
/// Validation failures always delete the offending file before the error
/// is returned.
#[derive(Debug, Error)]
pub enum CacheError {
    /// Body shorter than [`MIN_BODY_BYTES`].
    #[error("cached body too small: {actual} bytes")]
    TooSmall {
        /// Observed size in bytes.
        actual: u64,
    },

    /// Body size disagrees with the provider's content length.
    #[error("cached body length mismatch: expected {expected}, got {actual}")]
    LengthMismatch {
        /// Size the provider reported.
        expected: u64,
        /// Observed size in bytes.
        actual: u64,
    },

    /// Underlying filesystem failure.
    #[error("cache I/O failed: {0}")]
    IoFailed(#[from] std::io::Error),
}

impl From<CacheError> for Error {
    fn from(e: CacheError) -> Self {
        let kind = match &e {
            CacheError::TooSmall { .. } | CacheError::LengthMismatch { .. } => ErrorKind::DataLoss,
            CacheError::IoFailed(_) => ErrorKind::Internal,
        };
        Self::new(kind, e)
    }
}

/// Cache key: track identity plus the quality/bitrate of the body.
#[derive(Clone, Debug, Eq, PartialEq, Hash)]
pub struct CacheKey {
    /// Track identity.
    pub track_id: TrackId,
    /// Quality setting the body was fetched under.
    pub quality: AudioQuality,
    /// Bitrate of the stored format in bits per second.
    pub bitrate: u32,
}

impl CacheKey {
    /// Creates a key for a track at the given quality and bitrate.
    #[must_use]
    pub fn new(track_id: impl Into<TrackId>, quality: AudioQuality, bitrate: u32) -> Self {
        Self {
            track_id: track_id.into(),
            quality,
            bitrate,
        }
    }

    /// File name of the committed body for this key.
    #[must_use]
    pub fn file_name(&self) -> String {
        format!(
            "{}_{}_{}.audio",
            sanitize_file_name(&self.track_id),
            self.quality.name(),
            self.bitrate
        )
    }
}

/// Reservation of the single write slot for a key.
///
/// Returned by [`ByteCache::reserve_write`]; finished with
/// [`ByteCache::commit`] or [`ByteCache::abort`]. Dropping the slot
/// without either releases the reservation but leaves any temp file for
/// the next writer to overwrite.
#[derive(Debug)]
pub struct WriteSlot {
    key: CacheKey,
    temp_path: PathBuf,
    final_path: PathBuf,
    in_progress: Arc<Mutex<HashSet<String>>>,
    released: bool,
}

impl WriteSlot {
    /// Path the writer should stream into.
    #[must_use]
    pub fn temp_path(&self) -> &Path {
        &self.temp_path
    }

    /// The key this slot reserves.
    #[must_use]
    pub fn key(&self) -> &CacheKey {
        &self.key
    }

    fn release(&mut self) {
        if !self.released {
            self.in_progress
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .remove(&self.key.file_name());
            self.released = true;
        }
    }
}

impl Drop for WriteSlot {
    fn drop(&mut self) {
        self.release();
    }
}

/// On-disk LRU cache of audio bodies.
///
/// Cheap to clone behind an [`Arc`]; all I/O runs through `tokio::fs` so
/// callers never block an async worker.
pub struct ByteCache {
    /// `stream_audio_cache/` directory.
    dir: PathBuf,

    /// Keys with a writer in flight.
    ///
    /// Tested by [`ByteCache::reserve_write`] and respected by
    /// [`ByteCache::enforce_limit`], which never deletes an in-flight key.
    in_progress: Arc<Mutex<HashSet<String>>>,
}

impl ByteCache {
    /// Directory name under the cache root.
    pub const DIR_NAME: &'static str = "stream_audio_cache";

    /// Opens (creating if necessary) the cache under the given root.
    ///
    /// # Errors
    ///
    /// Returns error if the directory cannot be created.
    pub async fn open(cache_root: impl AsRef<Path>) -> Result<Self, CacheError> {
        let dir = cache_root.as_ref().join(Self::DIR_NAME);
        tokio::fs::create_dir_all(&dir).await?;

        Ok(Self {
            dir,
            in_progress: Arc::new(Mutex::new(HashSet::new())),
        })
    }

    /// Looks up a committed body and touches its LRU timestamp.
    ///
    /// Returns the body path when the file is valid: at least
    /// [`MIN_BODY_BYTES`] and, when `expected_bytes` is known, exactly that
    /// size. An invalid body is deleted and reported as a miss.
    ///
    /// # Errors
    ///
    /// Returns error only for filesystem failures; a missing or invalid
    /// body is `Ok(None)`.
    pub async fn open_for_read(
        &self,
        key: &CacheKey,
        expected_bytes: Option<u64>,
    ) -> Result<Option<PathBuf>, CacheError> {
        let path = self.dir.join(key.file_name());

        let meta = match tokio::fs::metadata(&path).await {
            Ok(meta) => meta,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };

        let size = meta.len();
        let valid =
            size >= MIN_BODY_BYTES && expected_bytes.is_none_or(|expected| size == expected);
        if !valid {
            warn!(
                "dropping invalid cache body for {} ({size} bytes)",
                key.track_id
            );
            self.delete(key).await?;
            return Ok(None);
        }

        // Touch the mtime: it is the LRU key.
        let touch_path = path.clone();
        tokio::task::spawn_blocking(move || {
            let file = std::fs::OpenOptions::new().append(true).open(&touch_path)?;
            file.set_times(FileTimes::new().set_modified(SystemTime::now()))
        })
        .await
        .map_err(|e| CacheError::IoFailed(std::io::Error::other(e)))??;

        Ok(Some(path))
    }

    /// Reserves the write slot for a key.
    ///
    /// Returns `None` when another writer holds the slot; the caller backs
    /// off instead of double-downloading.
    #[must_use]
    pub fn reserve_write(&self, key: &CacheKey) -> Option<WriteSlot> {
        let file_name = key.file_name();

        let mut in_progress = self
            .in_progress
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        if !in_progress.insert(file_name.clone()) {
            return None;
        }

        Some(WriteSlot {
            temp_path: self.dir.join(format!("{file_name}.precache.part")),
            final_path: self.dir.join(file_name),
            key: key.clone(),
            in_progress: Arc::clone(&self.in_progress),
            released: false,
        })
    }

    /// Commits a finished download: validates and atomically renames.
    ///
    /// Also writes the `.mime` sidecar so a later reader can rebuild the
    /// format without re-resolving.
    ///
    /// # Errors
    ///
    /// Returns [`CacheError::TooSmall`] or [`CacheError::LengthMismatch`]
    /// on validation failure; the temp file is deleted either way.
    pub async fn commit(
        &self,
        mut slot: WriteSlot,
        expected_bytes: Option<u64>,
        mime_type: &str,
    ) -> Result<(), CacheError> {
        let result = self.commit_inner(&slot, expected_bytes, mime_type).await;
        if result.is_err() {
            tokio::fs::remove_file(&slot.temp_path).await.ok();
        }
        slot.release();
        result
    }

    async fn commit_inner(
        &self,
        slot: &WriteSlot,
        expected_bytes: Option<u64>,
        mime_type: &str,
    ) -> Result<(), CacheError> {
        let size = tokio::fs::metadata(&slot.temp_path).await?.len();

        if size < MIN_BODY_BYTES {
            return Err(CacheError::TooSmall { actual: size });
        }
        if let Some(expected) = expected_bytes {
            if size != expected {
                return Err(CacheError::LengthMismatch {
                    expected,
                    actual: size,
                });
            }
        }

        tokio::fs::rename(&slot.temp_path, &slot.final_path).await?;
        tokio::fs::write(
            slot.final_path.with_extension("audio.mime"),
            mime_type.as_bytes(),
        )
        .await?;

        debug!(
            "committed {} bytes to cache for {}",
            size,
            slot.key.track_id
        );
        Ok(())
    }

    /// Abandons a reservation and deletes its temp artifacts.
    pub async fn abort(&self, mut slot: WriteSlot) {
        tokio::fs::remove_file(&slot.temp_path).await.ok();
        slot.release();
    }

    /// Deletes a body and every sidecar artifact for the key.
    ///
    /// # Errors
    ///
    /// Returns error on filesystem failures other than absence.
    pub async fn delete(&self, key: &CacheKey) -> Result<(), CacheError> {
        let prefix = key.file_name();

        let mut entries = tokio::fs::read_dir(&self.dir).await?;
        while let Some(entry) = entries.next_entry().await? {
            let name = entry.file_name();
            let name = name.to_string_lossy();
            if name.as_ref() == prefix || name.starts_with(&format!("{prefix}.")) {
                tokio::fs::remove_file(entry.path()).await.ok();
            }
        }

        Ok(())
    }

    /// Total size of committed bodies in bytes.
    ///
    /// # Errors
    ///
    /// Returns error if the cache directory cannot be listed.
    pub async fn usage_bytes(&self) -> Result<u64, CacheError> {
        Ok(self
            .scan_bodies()
            .await?
            .into_iter()
            .map(|body| body.size)
            .sum())
    }

    /// Deletes the oldest bodies until usage fits the budget.
    ///
    /// Bodies whose key has a writer in flight are never deleted, so the
    /// scan is safe to run concurrently with downloads. Idempotent.
    ///
    /// # Errors
    ///
    /// Returns error if the cache directory cannot be listed.
    pub async fn enforce_limit(&self, limit_bytes: u64) -> Result<(), CacheError> {
        let mut bodies = self.scan_bodies().await?;
        let mut usage: u64 = bodies.iter().map(|body| body.size).sum();
        if usage <= limit_bytes {
            return Ok(());
        }

        // Oldest first: mtime is the LRU key.
        bodies.sort_by_key(|body| body.modified);

        let in_progress = {
            let guard = self
                .in_progress
                .lock()
                .unwrap_or_else(PoisonError::into_inner);
            guard.clone()
        };

        for body in bodies {
            if usage <= limit_bytes {
                break;
            }
            if in_progress.contains(&body.file_name) {
                continue;
            }

            if tokio::fs::remove_file(&body.path).await.is_ok() {
                tokio::fs::remove_file(body.path.with_extension("audio.mime"))
                    .await
                    .ok();
                usage = usage.saturating_sub(body.size);
                info!(
                    "evicted {} ({} bytes) from stream cache",
                    body.file_name, body.size
                );
            }
        }

        Ok(())
    }

    /// Lists committed bodies with their size and LRU timestamp.
    async fn scan_bodies(&self) -> Result<Vec<BodyEntry>, CacheError> {
        let mut bodies = Vec::new();

        let mut entries = tokio::fs::read_dir(&self.dir).await?;
        while let Some(entry) = entries.next_entry().await? {
            let name = entry.file_name();
            let name = name.to_string_lossy().into_owned();
            if !name.ends_with(".audio") {
                continue;
            }

            let meta = match entry.metadata().await {
                Ok(meta) => meta,
                Err(_) => continue,
            };

            bodies.push(BodyEntry {
                path: entry.path(),
                file_name: name,
                size: meta.len(),
                modified: meta.modified().unwrap_or(SystemTime::UNIX_EPOCH),
            });
        }

        Ok(bodies)
    }
}

/// A committed body as seen by the eviction scan.
struct BodyEntry {
    path: PathBuf,
    file_name: String,
    size: u64,
    modified: SystemTime,
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    async fn scratch_cache(tag: &str) -> (PathBuf, ByteCache) {
        let root = std::env::temp_dir().join(format!(
            "cadenza-cache-{tag}-{}",
            uuid::Uuid::new_v4().simple()
        ));
        let cache = ByteCache::open(&root).await.unwrap();
        (root, cache)
    }

    fn key(id: &str) -> CacheKey {
        CacheKey::new(id, AudioQuality::High, 256_000)
    }

    async fn write_body(cache: &ByteCache, id: &str, size: usize) {
        let slot = cache.reserve_write(&key(id)).unwrap();
        tokio::fs::write(slot.temp_path(), vec![0u8; size])
            .await
            .unwrap();
        cache
            .commit(slot, Some(size as u64), "audio/webm")
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn commit_then_read_round_trip() {
        let (root, cache) = scratch_cache("roundtrip").await;

        write_body(&cache, "track-a", 64 * 1024).await;
        let path = cache
            .open_for_read(&key("track-a"), Some(64 * 1024))
            .await
            .unwrap();
        assert!(path.is_some());

        // The part file must not survive the commit.
        let part = root
            .join(ByteCache::DIR_NAME)
            .join(format!("{}.precache.part", key("track-a").file_name()));
        assert!(!part.exists());

        std::fs::remove_dir_all(&root).ok();
    }

    #[tokio::test]
    async fn tiny_bodies_are_rejected_and_cleaned() {
        let (root, cache) = scratch_cache("tiny").await;

        let slot = cache.reserve_write(&key("track-a")).unwrap();
        tokio::fs::write(slot.temp_path(), vec![0u8; 1024])
            .await
            .unwrap();
        let temp = slot.temp_path().to_path_buf();

        let result = cache.commit(slot, None, "audio/webm").await;
        assert!(matches!(result, Err(CacheError::TooSmall { .. })));
        assert!(!temp.exists());

        std::fs::remove_dir_all(&root).ok();
    }

    #[tokio::test]
    async fn length_mismatch_is_rejected() {
        let (root, cache) = scratch_cache("mismatch").await;

        let slot = cache.reserve_write(&key("track-a")).unwrap();
        tokio::fs::write(slot.temp_path(), vec![0u8; 64 * 1024])
            .await
            .unwrap();

        let result = cache.commit(slot, Some(65 * 1024), "audio/webm").await;
        assert!(matches!(result, Err(CacheError::LengthMismatch { .. })));

        std::fs::remove_dir_all(&root).ok();
    }

    #[tokio::test]
    async fn second_writer_backs_off() {
        let (root, cache) = scratch_cache("writers").await;

        let slot = cache.reserve_write(&key("track-a")).unwrap();
        assert!(cache.reserve_write(&key("track-a")).is_none());

        cache.abort(slot).await;
        assert!(cache.reserve_write(&key("track-a")).is_some());

        std::fs::remove_dir_all(&root).ok();
    }

    #[tokio::test]
    async fn enforce_limit_evicts_oldest_first() {
        let (root, cache) = scratch_cache("lru").await;

        // Ten bodies of 60 KiB with strictly increasing mtime.
        for i in 0..10 {
            write_body(&cache, &format!("track-{i}"), 60 * 1024).await;
            let path = root
                .join(ByteCache::DIR_NAME)
                .join(key(&format!("track-{i}")).file_name());
            let file = std::fs::OpenOptions::new().append(true).open(path).unwrap();
            file.set_times(
                FileTimes::new()
                    .set_modified(SystemTime::UNIX_EPOCH + Duration::from_secs(1000 + i)),
            )
            .unwrap();
        }

        // Budget for six bodies: the four oldest must go.
        cache.enforce_limit(6 * 60 * 1024).await.unwrap();

        for i in 0..4 {
            assert!(
                cache
                    .open_for_read(&key(&format!("track-{i}")), None)
                    .await
                    .unwrap()
                    .is_none(),
                "track-{i} should have been evicted"
            );
        }
        for i in 4..10 {
            assert!(
                cache
                    .open_for_read(&key(&format!("track-{i}")), None)
                    .await
                    .unwrap()
                    .is_some(),
                "track-{i} should have survived"
            );
        }

        assert!(cache.usage_bytes().await.unwrap() <= 6 * 60 * 1024);

        std::fs::remove_dir_all(&root).ok();
    }

    #[tokio::test]
    async fn delete_removes_sidecars() {
        let (root, cache) = scratch_cache("sidecars").await;

        write_body(&cache, "track-a", 64 * 1024).await;
        let dir = root.join(ByteCache::DIR_NAME);
        let body_name = key("track-a").file_name();
        std::fs::write(dir.join(format!("{body_name}.seg0.part")), b"x").unwrap();
        std::fs::write(dir.join(format!("{body_name}.part")), b"x").unwrap();

        cache.delete(&key("track-a")).await.unwrap();

        let remaining: Vec<_> = std::fs::read_dir(&dir).unwrap().collect();
        assert!(remaining.is_empty());

        std::fs::remove_dir_all(&root).ok();
    }
}
