//! Offline library downloads.
//!
//! Tracks saved for offline playback are downloaded into an app-private
//! `audio/` directory as `"{artist} - {title}{ext}"` with a sibling
//! `.cover.jpg`. The pipeline differs from the stream precache in three
//! ways: files are named for humans, finished files are validated
//! structurally (size deficit and magic bytes), and transient network
//! failures are retried on a `min(30, 2 + 3n)` second backoff for up to
//! eight attempts.
//!
//! Each download runs under its own cancellation token; cancelling
//! removes every artifact the task created, including a partially
//! written body and the cover sidecar.

use std::{
    collections::HashMap,
    path::PathBuf,
    sync::{Arc, Mutex, PoisonError},
    time::{Duration, SystemTime},
};

use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::{
    cache::MIN_BODY_BYTES,
    config::Settings,
    downloader::{self, DownloadError, Downloader},
    error::{Error, Result},
    http,
    persist::StateStore,
    resolver::StreamResolver,
    track::{Track, TrackId},
    util::sanitize_file_name,
};

/// Maximum attempts for one download, transient failures included.
const MAX_ATTEMPTS: u32 = 8;

/// Minimum interval between task progress updates.
///
/// These updates feed a notification surface; anything faster is wasted
/// redraws.
const PROGRESS_NOTIFY_INTERVAL: Duration = Duration::from_millis(500);

/// Store key of the completed-download index.
const COMPLETED_KEY: &str = "library_downloads";

/// Lifecycle of a download task.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DownloadStatus {
    /// Accepted, waiting for a worker.
    Queued,
    /// Transfer in progress.
    Downloading,
    /// Finished and validated.
    Completed,
    /// Gave up after validation or retry exhaustion.
    Failed,
    /// Cancelled by the user.
    Cancelled,
}

/// One offline download and its progress.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct DownloadTask {
    /// Task identity.
    pub id: Uuid,

    /// Track being downloaded.
    pub track_id: TrackId,

    /// Lifecycle state.
    pub status: DownloadStatus,

    /// Fraction of the body downloaded, in `[0, 1]`.
    pub progress: f64,

    /// Bytes written so far.
    pub downloaded_bytes: u64,

    /// Body size, once known.
    pub total_bytes: Option<u64>,

    /// Failure reason, for `Failed` tasks.
    pub error: Option<String>,

    /// Final file location, for `Completed` tasks.
    pub local_path: Option<PathBuf>,

    /// When the task was accepted.
    pub started_at: SystemTime,
}

impl DownloadTask {
    fn new(track_id: TrackId) -> Self {
        Self {
            id: Uuid::new_v4(),
            track_id,
            status: DownloadStatus::Queued,
            progress: 0.0,
            downloaded_bytes: 0,
            total_bytes: None,
            error: None,
            local_path: None,
            started_at: SystemTime::now(),
        }
    }
}

/// Builds the library file name for a track.
///
/// # Example
///
/// ```text
/// Artist Name - Track Title.opus
/// ```
#[must_use]
pub fn library_file_name(track: &Track, extension: &str) -> String {
    format!(
        "{} - {}{extension}",
        sanitize_file_name(&track.artist),
        sanitize_file_name(&track.title)
    )
}

/// Offline download manager.
pub struct DownloadManager {
    resolver: Arc<StreamResolver>,
    downloader: Downloader,
    client: Arc<http::Client>,
    store: Arc<dyn StateStore>,
    library_dir: PathBuf,

    /// Task registry, completed tasks included.
    tasks: Arc<Mutex<HashMap<TrackId, DownloadTask>>>,

    /// Cancellation tokens of running tasks.
    cancels: Arc<Mutex<HashMap<TrackId, CancellationToken>>>,
}

impl DownloadManager {
    /// Creates a manager storing files under the given library directory.
    #[must_use]
    pub fn new(
        resolver: Arc<StreamResolver>,
        downloader: Downloader,
        client: Arc<http::Client>,
        store: Arc<dyn StateStore>,
        library_dir: PathBuf,
    ) -> Self {
        Self {
            resolver,
            downloader,
            client,
            store,
            library_dir,
            tasks: Arc::new(Mutex::new(HashMap::new())),
            cancels: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Restores the completed-download index from the store.
    ///
    /// Entries whose file no longer exists are dropped.
    ///
    /// # Errors
    ///
    /// Returns error if the store read fails.
    pub async fn restore(&self) -> Result<()> {
        let Some(json) = self.store.get_raw(COMPLETED_KEY).await? else {
            return Ok(());
        };

        let completed: Vec<DownloadTask> = match serde_json::from_str(&json) {
            Ok(completed) => completed,
            Err(e) => {
                warn!("discarding corrupt download index: {e}");
                return Ok(());
            }
        };

        // Batch the existence checks onto the blocking pool.
        let paths: Vec<PathBuf> = completed
            .iter()
            .map(|task| task.local_path.clone().unwrap_or_default())
            .collect();
        let exists = crate::util::stat_many(paths).await;

        let mut tasks = self.tasks.lock().unwrap_or_else(PoisonError::into_inner);
        for (task, file_exists) in completed.into_iter().zip(exists) {
            if file_exists && task.local_path.is_some() {
                tasks.insert(task.track_id.clone(), task);
            }
        }

        info!("restored {} completed downloads", tasks.len());
        Ok(())
    }

    /// Snapshot of all known tasks.
    #[must_use]
    pub fn tasks(&self) -> Vec<DownloadTask> {
        self.tasks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .cloned()
            .collect()
    }

    /// Snapshot of one task.
    #[must_use]
    pub fn task(&self, track_id: &str) -> Option<DownloadTask> {
        self.tasks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(track_id)
            .cloned()
    }

    /// Returns the local path of a completed download.
    #[must_use]
    pub fn local_path(&self, track_id: &str) -> Option<PathBuf> {
        self.tasks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(track_id)
            .filter(|task| task.status == DownloadStatus::Completed)
            .and_then(|task| task.local_path.clone())
    }

    /// Starts downloading a track into the library.
    ///
    /// Returns the task id. A track already completed or in flight is
    /// not downloaded twice.
    ///
    /// # Errors
    ///
    /// Returns error if a task for the track is already active.
    pub fn start(self: &Arc<Self>, track: Track, settings: &Settings) -> Result<Uuid> {
        {
            let mut tasks = self.tasks.lock().unwrap_or_else(PoisonError::into_inner);
            if let Some(existing) = tasks.get(&track.id) {
                if matches!(
                    existing.status,
                    DownloadStatus::Queued | DownloadStatus::Downloading | DownloadStatus::Completed
                ) {
                    return Err(Error::already_exists(format!(
                        "download of {track} already {:?}",
                        existing.status
                    )));
                }
            }

            let task = DownloadTask::new(track.id.clone());
            let id = task.id;
            tasks.insert(track.id.clone(), task);
            drop(tasks);

            let cancel = CancellationToken::new();
            self.cancels
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .insert(track.id.clone(), cancel.clone());

            let manager = Arc::clone(self);
            let settings = settings.clone();
            tokio::spawn(async move {
                let result = manager.run_task(&track, &settings, &cancel).await;
                manager.finish_task(&track, result).await;
            });

            Ok(id)
        }
    }

    /// Cancels a running download and removes its artifacts.
    pub async fn cancel(&self, track_id: &str) {
        let token = self
            .cancels
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(track_id);

        if let Some(token) = token {
            token.cancel();
        }

        let paths = {
            let mut tasks = self.tasks.lock().unwrap_or_else(PoisonError::into_inner);
            let Some(task) = tasks.get_mut(track_id) else {
                return;
            };
            if task.status == DownloadStatus::Completed {
                return;
            }
            task.status = DownloadStatus::Cancelled;
            task.local_path.clone()
        };

        // Best-effort cleanup of everything the task may have created.
        if let Some(final_path) = paths {
            remove_artifacts(&final_path).await;
        }
    }

    /// Deletes a completed download from disk and the index.
    ///
    /// # Errors
    ///
    /// Returns error if the index cannot be persisted afterwards.
    pub async fn delete(&self, track_id: &str) -> Result<()> {
        let path = {
            let mut tasks = self.tasks.lock().unwrap_or_else(PoisonError::into_inner);
            tasks.remove(track_id).and_then(|task| task.local_path)
        };

        if let Some(path) = path {
            remove_artifacts(&path).await;
        }

        self.persist_completed().await
    }

    /// Runs one download to completion.
    async fn run_task(
        &self,
        track: &Track,
        settings: &Settings,
        cancel: &CancellationToken,
    ) -> std::result::Result<PathBuf, DownloadError> {
        let data = self
            .resolver
            .resolve(&track.id, settings.download_quality, false)
            .await
            .map_err(|e| DownloadError::NetworkTransient(e.to_string()))?;

        tokio::fs::create_dir_all(&self.library_dir).await?;

        let final_path = self
            .library_dir
            .join(library_file_name(track, data.format.extension()));
        let part_path = final_path.with_extension(format!(
            "{}.part",
            final_path
                .extension()
                .and_then(|ext| ext.to_str())
                .unwrap_or("audio")
        ));

        self.update_task(&track.id, |task| {
            task.status = DownloadStatus::Downloading;
            task.total_bytes = data.format.content_length;
            task.local_path = Some(final_path.clone());
        });

        let mut last_error: Option<DownloadError> = None;
        for attempt in 0..MAX_ATTEMPTS {
            if cancel.is_cancelled() {
                return Err(DownloadError::Cancelled);
            }
            if attempt > 0 {
                let backoff = downloader::retry_backoff(attempt - 1);
                debug!(
                    "retrying download of {track} in {backoff:?} ({attempt}/{MAX_ATTEMPTS})"
                );
                tokio::time::sleep(backoff).await;
            }

            let progress_tasks = Arc::clone(&self.tasks);
            let progress_id = track.id.clone();
            let throttle: Mutex<Option<tokio::time::Instant>> = Mutex::new(None);
            let progress = move |downloaded: u64, total: Option<u64>| {
                let now = tokio::time::Instant::now();
                {
                    let mut last = throttle.lock().unwrap_or_else(PoisonError::into_inner);
                    if last.is_some_and(|last| now.duration_since(last) < PROGRESS_NOTIFY_INTERVAL)
                    {
                        return;
                    }
                    *last = Some(now);
                }

                let mut tasks = progress_tasks
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner);
                if let Some(task) = tasks.get_mut(&progress_id) {
                    task.downloaded_bytes = downloaded;
                    task.total_bytes = total.or(task.total_bytes);
                    if let Some(total) = task.total_bytes.filter(|total| *total > 0) {
                        #[expect(clippy::cast_precision_loss)]
                        let fraction = downloaded as f64 / total as f64;
                        task.progress = fraction.clamp(0.0, 1.0);
                    }
                }
            };

            let result = self
                .downloader
                .download(
                    &data.stream_url,
                    &part_path,
                    data.format.content_length,
                    settings.download_parallel_part_count,
                    settings.download_parallel_min_size_bytes(),
                    cancel,
                    progress,
                )
                .await;

            match result {
                Ok(written) => {
                    let validated = validate_finished(
                        &part_path,
                        data.format.extension(),
                        data.format.content_length,
                        written,
                    )
                    .await;
                    if let Err(e) = validated {
                        tokio::fs::remove_file(&part_path).await.ok();
                        return Err(e);
                    }

                    tokio::fs::rename(&part_path, &final_path).await?;
                    self.fetch_cover(track, &final_path).await;
                    return Ok(final_path);
                }
                Err(DownloadError::Cancelled) => return Err(DownloadError::Cancelled),
                Err(DownloadError::NetworkTransient(reason)) => {
                    warn!("download of {track} failed transiently: {reason}");
                    last_error = Some(DownloadError::NetworkTransient(reason));
                }
                Err(e) => {
                    tokio::fs::remove_file(&part_path).await.ok();
                    return Err(e);
                }
            }
        }

        tokio::fs::remove_file(&part_path).await.ok();
        Err(last_error
            .unwrap_or_else(|| DownloadError::NetworkTransient("retries exhausted".to_string())))
    }

    /// Fetches the cover sidecar, best-effort.
    async fn fetch_cover(&self, track: &Track, final_path: &std::path::Path) {
        let Some(url) = track.thumbnail_url.clone() else {
            return;
        };

        let cover_path = cover_path_for(final_path);
        let response = match self.client.unlimited.get(url).send().await {
            Ok(response) if response.status().is_success() => response,
            Ok(response) => {
                debug!("cover fetch for {track} returned {}", response.status());
                return;
            }
            Err(e) => {
                debug!("cover fetch for {track} failed: {e}");
                return;
            }
        };

        match response.bytes().await {
            Ok(bytes) => {
                if let Err(e) = tokio::fs::write(&cover_path, &bytes).await {
                    debug!("cover write for {track} failed: {e}");
                }
            }
            Err(e) => debug!("cover body for {track} failed: {e}"),
        }
    }

    /// Records the task outcome and persists the completed index.
    async fn finish_task(
        &self,
        track: &Track,
        result: std::result::Result<PathBuf, DownloadError>,
    ) {
        self.cancels
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&track.id);

        match result {
            Ok(path) => {
                info!("downloaded {track} to {}", path.display());
                self.update_task(&track.id, |task| {
                    task.status = DownloadStatus::Completed;
                    task.progress = 1.0;
                    task.local_path = Some(path.clone());
                    task.error = None;
                });
                if let Err(e) = self.persist_completed().await {
                    error!("failed to persist download index: {e}");
                }
            }
            Err(DownloadError::Cancelled) => {
                info!("download of {track} cancelled");
                self.update_task(&track.id, |task| {
                    task.status = DownloadStatus::Cancelled;
                });
            }
            Err(e) => {
                error!("download of {track} failed: {e}");
                self.update_task(&track.id, |task| {
                    task.status = DownloadStatus::Failed;
                    task.error = Some(e.to_string());
                });
            }
        }
    }

    fn update_task(&self, track_id: &str, f: impl FnOnce(&mut DownloadTask)) {
        let mut tasks = self.tasks.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(task) = tasks.get_mut(track_id) {
            f(task);
        }
    }

    /// Persists the completed tasks.
    async fn persist_completed(&self) -> Result<()> {
        let completed: Vec<DownloadTask> = {
            let tasks = self.tasks.lock().unwrap_or_else(PoisonError::into_inner);
            tasks
                .values()
                .filter(|task| task.status == DownloadStatus::Completed)
                .cloned()
                .collect()
        };

        let json = serde_json::to_string(&completed)?;
        self.store.put_raw(COMPLETED_KEY, &json).await
    }
}

/// Validates a finished body: present, large enough, deficit within
/// tolerance, magic bytes matching the resolved container.
///
/// `extension` is the container the resolved format promised; it is
/// passed through explicitly because the body still sits under its
/// `.part` download name at this point.
async fn validate_finished(
    path: &std::path::Path,
    extension: &str,
    expected: Option<u64>,
    written: u64,
) -> std::result::Result<(), DownloadError> {
    let meta = tokio::fs::metadata(path).await?;
    if meta.len() < MIN_BODY_BYTES {
        return Err(DownloadError::Corrupt(format!(
            "file too small: {} bytes",
            meta.len()
        )));
    }

    downloader::validate_size(expected, written)?;

    let path = path.to_path_buf();
    let extension = extension.to_string();
    tokio::task::spawn_blocking(move || downloader::validate_magic(&path, &extension))
        .await
        .map_err(|e| DownloadError::Corrupt(e.to_string()))?
}

/// Cover sidecar path for a library file.
fn cover_path_for(final_path: &std::path::Path) -> PathBuf {
    let mut name = final_path
        .file_stem()
        .unwrap_or_default()
        .to_os_string();
    name.push(".cover.jpg");
    final_path.with_file_name(name)
}

/// Removes a download's artifacts: final file, part files, cover.
async fn remove_artifacts(final_path: &std::path::Path) {
    tokio::fs::remove_file(final_path).await.ok();
    tokio::fs::remove_file(cover_path_for(final_path)).await.ok();

    if let Some(parent) = final_path.parent() {
        if let Some(stem) = final_path.file_name().and_then(|name| name.to_str()) {
            if let Ok(mut entries) = tokio::fs::read_dir(parent).await {
                while let Ok(Some(entry)) = entries.next_entry().await {
                    let name = entry.file_name();
                    let name = name.to_string_lossy();
                    let stem_root = stem.rsplit_once('.').map_or(stem, |(root, _)| root);
                    if name.starts_with(stem_root) && name.ends_with(".part") {
                        tokio::fs::remove_file(entry.path()).await.ok();
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn track(id: &str, artist: &str, title: &str) -> Track {
        Track::new(id, title, artist, Duration::from_secs(180))
    }

    #[test]
    fn file_names_are_sanitized() {
        let track = track("x", "AC/DC", "Back in Black?");
        assert_eq!(
            library_file_name(&track, ".opus"),
            "AC_DC - Back in Black_.opus"
        );
    }

    #[test]
    fn cover_sits_next_to_the_body() {
        let cover = cover_path_for(std::path::Path::new("/music/Artist - Title.opus"));
        assert_eq!(cover, std::path::Path::new("/music/Artist - Title.cover.jpg"));
    }

    #[test]
    fn new_tasks_start_queued() {
        let task = DownloadTask::new("abc".to_string());
        assert_eq!(task.status, DownloadStatus::Queued);
        assert_eq!(task.progress, 0.0);
        assert!(task.local_path.is_none());
    }

    #[tokio::test]
    async fn validation_rejects_small_files() {
        let path = std::env::temp_dir().join(format!(
            "cadenza-library-small-{}",
            Uuid::new_v4().simple()
        ));
        tokio::fs::write(&path, vec![0u8; 100]).await.unwrap();

        let result = validate_finished(&path, ".opus", None, 100).await;
        assert!(matches!(result, Err(DownloadError::Corrupt(_))));

        tokio::fs::remove_file(&path).await.ok();
    }

    #[tokio::test]
    async fn part_files_validate_against_the_audio_extension() {
        // Mirror the pipeline's naming: the body streams into
        // "<artist> - <title>.opus.part" and is validated there, before
        // the rename onto the final name.
        let dir = std::env::temp_dir();
        let track = track("x", "Artist", "Title");
        let final_path = dir.join(format!(
            "{}-{}",
            Uuid::new_v4().simple(),
            library_file_name(&track, ".opus")
        ));
        let part_path = final_path.with_extension("opus.part");

        // A body of the wrong bytes must fail the opus header check even
        // though the file's own extension is "part".
        let mut body = b"<html>not audio</html>".to_vec();
        body.resize(64 * 1024, 0);
        tokio::fs::write(&part_path, &body).await.unwrap();
        let result = validate_finished(&part_path, ".opus", None, body.len() as u64).await;
        assert!(matches!(result, Err(DownloadError::Corrupt(_))));

        // The same file with a real Ogg page passes.
        body[..4].copy_from_slice(b"OggS");
        tokio::fs::write(&part_path, &body).await.unwrap();
        validate_finished(&part_path, ".opus", None, body.len() as u64)
            .await
            .unwrap();

        tokio::fs::remove_file(&part_path).await.ok();
    }
}
