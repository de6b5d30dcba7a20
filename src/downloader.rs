//! Audio body downloads with range continuation and parallel segments.
//!
//! One downloader serves both consumers:
//! * the [`precache`](crate::precache) scheduler, filling the byte cache
//! * the offline [`library`](crate::library) pipeline
//!
//! # Strategy
//!
//! When the body size is known and large enough, the download is split
//! into contiguous byte ranges fetched concurrently and merged in order.
//! Otherwise (or when any segment fails) a single sequential GET runs,
//! and a server that closes early is answered with follow-up
//! `Range: bytes=<downloaded>-` requests until the body is complete.
//!
//! All requests carry `Accept-Encoding: identity`: a transcoding proxy
//! would invalidate both the content length and the byte ranges.
//!
//! # Cancellation
//!
//! The caller's [`CancellationToken`] is checked before every chunk write
//! and between range retries; cancellation surfaces as
//! [`DownloadError::Cancelled`] and the caller cleans up its artifacts.

use std::{
    path::{Path, PathBuf},
    time::Duration,
};

use futures_util::StreamExt;
use reqwest::{
    header::{HeaderValue, ACCEPT_ENCODING, RANGE},
    StatusCode,
};
use thiserror::Error;
use tokio::io::AsyncWriteExt;
use tokio_util::sync::CancellationToken;
use url::Url;

use crate::{
    error::{Error, ErrorKind},
    http,
};

/// Minimum body size before a parallel split is considered.
const PARALLEL_FLOOR_BYTES: u64 = 1024 * 1024;

/// Target size of one parallel segment.
const SEGMENT_TARGET_BYTES: u64 = 512 * 1024;

/// Pause between range continuation attempts.
const RANGE_RETRY_PAUSE: Duration = Duration::from_millis(500);

/// Maximum follow-up range requests per download.
const MAX_RANGE_ATTEMPTS: u32 = 10;

/// Maximum transient errors tolerated inside the continuation loop.
const MAX_RANGE_ERRORS: u32 = 5;

/// Minimum interval between progress callback invocations.
const PROGRESS_INTERVAL: Duration = Duration::from_millis(100);

/// Tolerated shortfall when the expected size is known, as a fraction.
const DEFICIT_TOLERANCE: f64 = 0.05;

/// Errors produced while downloading an audio body.
#[derive(Debug, Error)]
pub enum DownloadError {
    /// Socket, timeout, DNS or handshake failure; worth retrying.
    #[error("transient network failure: {0}")]
    NetworkTransient(String),

    /// The server answered with an unexpected status.
    #[error("unexpected HTTP status {0}")]
    HttpStatus(u16),

    /// The body fell short of the expected size by more than the
    /// tolerated deficit.
    #[error("download incomplete: {missing_percent:.1}% missing")]
    Incomplete {
        /// Share of the body that is missing, in percent.
        missing_percent: f64,
    },

    /// The file failed a structural check.
    #[error("downloaded file is corrupt: {0}")]
    Corrupt(String),

    /// The caller cancelled the download.
    #[error("download cancelled")]
    Cancelled,

    /// Local filesystem failure.
    #[error("I/O failure: {0}")]
    Io(#[from] std::io::Error),
}

impl From<DownloadError> for Error {
    fn from(e: DownloadError) -> Self {
        let kind = match &e {
            DownloadError::NetworkTransient(_) => ErrorKind::Unavailable,
            DownloadError::HttpStatus(_) => ErrorKind::FailedPrecondition,
            DownloadError::Incomplete { .. } => ErrorKind::DataLoss,
            DownloadError::Corrupt(_) => ErrorKind::DataLoss,
            DownloadError::Cancelled => ErrorKind::Cancelled,
            DownloadError::Io(_) => ErrorKind::Internal,
        };
        Self::new(kind, e)
    }
}

/// Classifies a transport error as transient.
///
/// Decided by error kind, never by message text: connection setup,
/// timeouts and mid-body disconnects qualify; protocol-level failures do
/// not.
#[must_use]
pub fn is_transient(err: &reqwest::Error) -> bool {
    err.is_timeout() || err.is_connect() || err.is_body() || err.is_request()
}

/// Retry backoff schedule for the offline library: `min(30, 2 + 3n)`
/// seconds for the n-th retry.
#[must_use]
pub fn retry_backoff(attempt: u32) -> Duration {
    Duration::from_secs(u64::from((2 + 3 * attempt).min(30)))
}

/// Validates the size of a finished body against the expected length.
///
/// With an unknown expected size any non-empty body passes. With a known
/// size, up to 5% may be missing (some CDN edges round off the tail);
/// a larger deficit is an [`DownloadError::Incomplete`].
///
/// # Errors
///
/// Returns [`DownloadError::Incomplete`] when the deficit exceeds the
/// tolerance.
pub fn validate_size(expected: Option<u64>, actual: u64) -> Result<(), DownloadError> {
    let Some(expected) = expected else {
        return Ok(());
    };
    if expected == 0 || actual >= expected {
        return Ok(());
    }

    #[expect(clippy::cast_precision_loss)]
    let missing = (expected - actual) as f64 / expected as f64;
    if missing > DEFICIT_TOLERANCE {
        return Err(DownloadError::Incomplete {
            missing_percent: missing * 100.0,
        });
    }

    Ok(())
}

/// Checks the leading magic bytes of a finished file.
///
/// `extension` names the audio container the body is supposed to hold,
/// with or without a leading dot. The file's own name is deliberately
/// not consulted: bodies are validated while still under their
/// transient `.part` name, whose extension says nothing about the
/// container.
///
/// * `m4a` requires `ftyp` at offset 0 or 4
/// * `opus`/`webm` require an EBML header or an Ogg page
/// * `mp3` requires an ID3 tag or an MPEG sync word
/// * unknown extensions pass
///
/// # Errors
///
/// Returns [`DownloadError::Corrupt`] when the header does not match.
pub fn validate_magic(path: &Path, extension: &str) -> Result<(), DownloadError> {
    let extension = extension.trim_start_matches('.').to_ascii_lowercase();

    let mut header = [0u8; 12];
    let read = {
        use std::io::Read;
        let mut file = std::fs::File::open(path)?;
        file.read(&mut header)?
    };
    let header = &header[..read];

    let ok = match extension.as_str() {
        "m4a" | "mp4" => {
            header.len() >= 8 && (&header[..4] == b"ftyp" || &header[4..8] == b"ftyp")
        }
        "opus" | "webm" => {
            header.len() >= 4
                && (header[..4] == [0x1A, 0x45, 0xDF, 0xA3] || &header[..4] == b"OggS")
        }
        "mp3" => {
            header.len() >= 3
                && (&header[..3] == b"ID3" || (header[0] == 0xFF && header[1] & 0xE0 == 0xE0))
        }
        _ => true,
    };

    if ok {
        Ok(())
    } else {
        Err(DownloadError::Corrupt(format!(
            "bad magic bytes for .{extension}"
        )))
    }
}

/// Plans contiguous byte ranges for a parallel download.
///
/// The part count is `min(configured, max(2, expected / 512 KiB))`; the
/// remainder is distributed one byte at a time to the first ranges so the
/// parts cover `[0, expected)` exactly.
#[must_use]
pub fn plan_ranges(expected_bytes: u64, configured_parts: u8) -> Vec<(u64, u64)> {
    let by_size = (expected_bytes / SEGMENT_TARGET_BYTES).max(2);
    let parts = u64::from(configured_parts).min(by_size).max(1);

    let base = expected_bytes / parts;
    let remainder = expected_bytes % parts;

    let mut ranges = Vec::new();
    let mut start = 0u64;
    for i in 0..parts {
        let len = base + u64::from(i < remainder);
        // Inclusive range bounds, as used on the wire.
        ranges.push((start, start + len - 1));
        start += len;
    }

    ranges
}

/// Throttles progress reporting to a minimum interval.
struct ProgressThrottle {
    last: Option<tokio::time::Instant>,
    interval: Duration,
}

impl ProgressThrottle {
    fn new(interval: Duration) -> Self {
        Self {
            last: None,
            interval,
        }
    }

    fn ready(&mut self) -> bool {
        let now = tokio::time::Instant::now();
        match self.last {
            Some(last) if now.duration_since(last) < self.interval => false,
            _ => {
                self.last = Some(now);
                true
            }
        }
    }
}

/// Audio body downloader.
///
/// Stateless apart from the shared HTTP client; cheap to clone.
#[derive(Clone)]
pub struct Downloader {
    client: std::sync::Arc<http::Client>,
}

impl Downloader {
    /// Creates a downloader over the shared HTTP client.
    #[must_use]
    pub fn new(client: std::sync::Arc<http::Client>) -> Self {
        Self { client }
    }

    /// Downloads a full audio body into `dest`.
    ///
    /// Picks the parallel strategy when `expected_bytes` is known and at
    /// least `max(1 MiB, parallel_min_bytes)`; falls back to the
    /// sequential strategy otherwise or when any segment fails. Returns
    /// the number of bytes written.
    ///
    /// `progress` is invoked with `(downloaded, expected)` at most every
    /// 100 ms.
    ///
    /// # Errors
    ///
    /// * [`DownloadError::Cancelled`] when the token fires
    /// * [`DownloadError::HttpStatus`] on an unexpected response status
    /// * [`DownloadError::NetworkTransient`] when the transfer failed and
    ///   the retry budget is spent
    pub async fn download<F>(
        &self,
        url: &Url,
        dest: &Path,
        expected_bytes: Option<u64>,
        parallel_parts: u8,
        parallel_min_bytes: u64,
        cancel: &CancellationToken,
        progress: F,
    ) -> Result<u64, DownloadError>
    where
        F: Fn(u64, Option<u64>) + Send + Sync,
    {
        if let Some(expected) = expected_bytes {
            if expected >= PARALLEL_FLOOR_BYTES.max(parallel_min_bytes) && parallel_parts >= 2 {
                match self
                    .download_parallel(url, dest, expected, parallel_parts, cancel, &progress)
                    .await
                {
                    Ok(written) => return Ok(written),
                    Err(DownloadError::Cancelled) => return Err(DownloadError::Cancelled),
                    Err(e) => {
                        warn!("parallel download failed ({e}), falling back to sequential");
                    }
                }
            }
        }

        self.download_sequential(url, dest, expected_bytes, cancel, &progress)
            .await
    }

    /// Parallel byte-range strategy.
    ///
    /// Every segment must answer `206 Partial Content` with exactly the
    /// requested length; the segments are then concatenated in order into
    /// `dest` and the merged length verified.
    async fn download_parallel<F>(
        &self,
        url: &Url,
        dest: &Path,
        expected_bytes: u64,
        parts: u8,
        cancel: &CancellationToken,
        progress: &F,
    ) -> Result<u64, DownloadError>
    where
        F: Fn(u64, Option<u64>) + Send + Sync,
    {
        let ranges = plan_ranges(expected_bytes, parts);
        debug!(
            "downloading {expected_bytes} bytes in {} parallel parts",
            ranges.len()
        );

        let seg_paths: Vec<PathBuf> = (0..ranges.len())
            .map(|i| segment_path(dest, i))
            .collect();

        let result = self
            .run_segments(url, &ranges, &seg_paths, cancel, progress, expected_bytes)
            .await;

        if let Err(e) = result {
            for path in &seg_paths {
                tokio::fs::remove_file(path).await.ok();
            }
            return Err(e);
        }

        // Merge in order.
        let mut out = tokio::fs::File::create(dest).await?;
        let mut written = 0u64;
        for path in &seg_paths {
            let data = tokio::fs::read(path).await?;
            out.write_all(&data).await?;
            written += data.len() as u64;
            tokio::fs::remove_file(path).await.ok();
        }
        out.flush().await?;

        if written != expected_bytes {
            tokio::fs::remove_file(dest).await.ok();
            return Err(DownloadError::Incomplete {
                #[expect(clippy::cast_precision_loss)]
                missing_percent: (expected_bytes.saturating_sub(written)) as f64
                    / expected_bytes as f64
                    * 100.0,
            });
        }

        Ok(written)
    }

    /// Runs all segment fetches concurrently.
    async fn run_segments<F>(
        &self,
        url: &Url,
        ranges: &[(u64, u64)],
        seg_paths: &[PathBuf],
        cancel: &CancellationToken,
        progress: &F,
        expected_bytes: u64,
    ) -> Result<(), DownloadError>
    where
        F: Fn(u64, Option<u64>) + Send + Sync,
    {
        use std::sync::atomic::{AtomicU64, Ordering};

        let total_downloaded = AtomicU64::new(0);
        let throttle = std::sync::Mutex::new(ProgressThrottle::new(PROGRESS_INTERVAL));

        let fetches = ranges.iter().zip(seg_paths).map(|(&(start, end), path)| {
            let client = &self.client;
            let total_downloaded = &total_downloaded;
            let throttle = &throttle;
            async move {
                let response = client
                    .unlimited
                    .get(url.clone())
                    .header(ACCEPT_ENCODING, HeaderValue::from_static("identity"))
                    .header(RANGE, format!("bytes={start}-{end}"))
                    .send()
                    .await
                    .map_err(classify)?;

                if response.status() != StatusCode::PARTIAL_CONTENT {
                    return Err(DownloadError::HttpStatus(response.status().as_u16()));
                }

                let mut file = tokio::fs::File::create(path).await?;
                let mut stream = response.bytes_stream();
                let mut seg_written = 0u64;

                while let Some(chunk) = stream.next().await {
                    if cancel.is_cancelled() {
                        return Err(DownloadError::Cancelled);
                    }
                    let chunk = chunk.map_err(classify)?;
                    file.write_all(&chunk).await?;
                    seg_written += chunk.len() as u64;

                    let downloaded =
                        total_downloaded.fetch_add(chunk.len() as u64, Ordering::Relaxed)
                            + chunk.len() as u64;
                    if throttle
                        .lock()
                        .unwrap_or_else(std::sync::PoisonError::into_inner)
                        .ready()
                    {
                        progress(downloaded, Some(expected_bytes));
                    }
                }
                file.flush().await?;

                let wanted = end - start + 1;
                if seg_written != wanted {
                    return Err(DownloadError::Incomplete {
                        #[expect(clippy::cast_precision_loss)]
                        missing_percent: (wanted.saturating_sub(seg_written)) as f64
                            / wanted as f64
                            * 100.0,
                    });
                }

                Ok(())
            }
        });

        futures_util::future::try_join_all(fetches).await?;
        Ok(())
    }

    /// Sequential strategy with range continuation.
    async fn download_sequential<F>(
        &self,
        url: &Url,
        dest: &Path,
        expected_bytes: Option<u64>,
        cancel: &CancellationToken,
        progress: &F,
    ) -> Result<u64, DownloadError>
    where
        F: Fn(u64, Option<u64>) + Send + Sync,
    {
        let mut file = tokio::fs::File::create(dest).await?;
        let mut throttle = ProgressThrottle::new(PROGRESS_INTERVAL);
        let mut downloaded = 0u64;
        let mut expected = expected_bytes;

        let mut range_attempts = 0u32;
        let mut error_budget = MAX_RANGE_ERRORS;

        loop {
            if cancel.is_cancelled() {
                return Err(DownloadError::Cancelled);
            }

            let mut request = self
                .client
                .unlimited
                .get(url.clone())
                .header(ACCEPT_ENCODING, HeaderValue::from_static("identity"));
            if downloaded > 0 {
                request = request.header(RANGE, format!("bytes={downloaded}-"));
            }

            let response = match request.send().await {
                Ok(response) => response,
                Err(e) if is_transient(&e) && error_budget > 0 => {
                    error_budget -= 1;
                    debug!("transient error starting request ({e}), retrying");
                    tokio::time::sleep(RANGE_RETRY_PAUSE).await;
                    continue;
                }
                Err(e) => return Err(classify(e)),
            };

            let status = response.status();
            let expecting_partial = downloaded > 0;
            if !(status == StatusCode::OK || (expecting_partial && status == StatusCode::PARTIAL_CONTENT))
            {
                return Err(DownloadError::HttpStatus(status.as_u16()));
            }

            // A full (200) answer to a range request restarts the body.
            if expecting_partial && status == StatusCode::OK {
                file.set_len(0).await?;
                file = tokio::fs::File::create(dest).await?;
                downloaded = 0;
            }

            if downloaded == 0 {
                if let Some(len) = response.content_length().filter(|len| *len > 0) {
                    expected = Some(len);
                }
            }

            let mut received_this_attempt = 0u64;
            let mut stream = response.bytes_stream();
            let mut stream_error: Option<reqwest::Error> = None;

            while let Some(chunk) = stream.next().await {
                if cancel.is_cancelled() {
                    return Err(DownloadError::Cancelled);
                }
                match chunk {
                    Ok(chunk) => {
                        file.write_all(&chunk).await?;
                        downloaded += chunk.len() as u64;
                        received_this_attempt += chunk.len() as u64;
                        if throttle.ready() {
                            progress(downloaded, expected);
                        }
                    }
                    Err(e) => {
                        stream_error = Some(e);
                        break;
                    }
                }
            }

            if let Some(e) = stream_error {
                if is_transient(&e) && error_budget > 0 {
                    error_budget -= 1;
                    debug!("stream interrupted at {downloaded} bytes ({e}), continuing with range");
                    tokio::time::sleep(RANGE_RETRY_PAUSE).await;
                    continue;
                }
                return Err(classify(e));
            }

            // Clean end of stream. Done when the size is unknown, met, or
            // the server had nothing more to give (treated as EOF).
            let complete = expected.is_none_or(|len| downloaded >= len);
            if complete || (expecting_partial && received_this_attempt == 0) {
                break;
            }

            range_attempts += 1;
            if range_attempts >= MAX_RANGE_ATTEMPTS {
                debug!("giving up range continuation after {range_attempts} attempts");
                break;
            }

            debug!(
                "server closed early at {downloaded}/{} bytes, continuing with range",
                expected.unwrap_or_default()
            );
            tokio::time::sleep(RANGE_RETRY_PAUSE).await;
        }

        file.flush().await?;
        progress(downloaded, expected);
        Ok(downloaded)
    }
}

/// Path of the n-th parallel segment for a destination file.
fn segment_path(dest: &Path, index: usize) -> PathBuf {
    let mut name = dest.file_name().unwrap_or_default().to_os_string();
    name.push(format!(".seg{index}.part"));
    dest.with_file_name(name)
}

/// Maps a transport error onto the download taxonomy.
fn classify(e: reqwest::Error) -> DownloadError {
    if is_transient(&e) {
        DownloadError::NetworkTransient(e.to_string())
    } else if let Some(status) = e.status() {
        DownloadError::HttpStatus(status.as_u16())
    } else {
        DownloadError::NetworkTransient(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ranges_cover_exactly() {
        for (expected, parts) in [(4_000_000u64, 4u8), (1_048_576, 8), (10_000_001, 3)] {
            let ranges = plan_ranges(expected, parts);
            assert_eq!(ranges[0].0, 0);
            assert_eq!(ranges.last().unwrap().1, expected - 1);
            for window in ranges.windows(2) {
                assert_eq!(window[0].1 + 1, window[1].0);
            }
            let total: u64 = ranges.iter().map(|(a, b)| b - a + 1).sum();
            assert_eq!(total, expected);
        }
    }

    #[test]
    fn part_count_scales_with_size() {
        // 1 MiB at 512 KiB per segment caps out at 2 parts.
        assert_eq!(plan_ranges(1024 * 1024, 8).len(), 2);
        // Large bodies use the configured count.
        assert_eq!(plan_ranges(100 * 1024 * 1024, 4).len(), 4);
    }

    #[test]
    fn remainder_goes_to_first_ranges() {
        let ranges = plan_ranges(10 * 1024 * 1024 + 3, 4);
        let lens: Vec<u64> = ranges.iter().map(|(a, b)| b - a + 1).collect();
        assert!(lens[0] >= lens[3]);
        assert_eq!(lens[0] - lens[3], 1);
    }

    #[test]
    fn backoff_schedule() {
        assert_eq!(retry_backoff(0), Duration::from_secs(2));
        assert_eq!(retry_backoff(1), Duration::from_secs(5));
        assert_eq!(retry_backoff(5), Duration::from_secs(17));
        assert_eq!(retry_backoff(20), Duration::from_secs(30));
    }

    #[test]
    fn deficit_within_tolerance_passes() {
        assert!(validate_size(Some(1000), 960).is_ok());
        assert!(validate_size(Some(1000), 1000).is_ok());
        assert!(validate_size(None, 1).is_ok());
    }

    #[test]
    fn deficit_beyond_tolerance_fails() {
        let err = validate_size(Some(1000), 900).unwrap_err();
        assert!(matches!(
            err,
            DownloadError::Incomplete { missing_percent } if (missing_percent - 10.0).abs() < 0.01
        ));
    }

    fn write_scratch(name: &str, bytes: &[u8]) -> PathBuf {
        let path = std::env::temp_dir().join(format!(
            "cadenza-magic-{}-{name}",
            uuid::Uuid::new_v4().simple()
        ));
        std::fs::write(&path, bytes).unwrap();
        path
    }

    #[test]
    fn magic_m4a() {
        let good = write_scratch("good.m4a", b"\x00\x00\x00\x20ftypM4A \x00\x00");
        assert!(validate_magic(&good, ".m4a").is_ok());
        std::fs::remove_file(good).ok();

        let bad = write_scratch("bad.m4a", b"not an mp4 file!");
        assert!(validate_magic(&bad, ".m4a").is_err());
        std::fs::remove_file(bad).ok();
    }

    #[test]
    fn magic_webm_and_ogg() {
        let ebml = write_scratch("a.webm", &[0x1A, 0x45, 0xDF, 0xA3, 0, 0, 0, 0, 0, 0, 0, 0]);
        assert!(validate_magic(&ebml, ".webm").is_ok());
        std::fs::remove_file(ebml).ok();

        let ogg = write_scratch("b.opus", b"OggS\x00\x02rest of page");
        assert!(validate_magic(&ogg, ".opus").is_ok());
        std::fs::remove_file(ogg).ok();
    }

    #[test]
    fn magic_mp3() {
        let id3 = write_scratch("a.mp3", b"ID3\x04\x00\x00\x00\x00\x00\x00");
        assert!(validate_magic(&id3, ".mp3").is_ok());
        std::fs::remove_file(id3).ok();

        let sync = write_scratch("b.mp3", &[0xFF, 0xFB, 0x90, 0x00, 0, 0, 0, 0, 0, 0]);
        assert!(validate_magic(&sync, ".mp3").is_ok());
        std::fs::remove_file(sync).ok();
    }

    #[test]
    fn magic_unknown_extension_passes() {
        let path = write_scratch("a.bin", b"whatever");
        assert!(validate_magic(&path, ".audio").is_ok());
        std::fs::remove_file(path).ok();
    }

    #[test]
    fn magic_ignores_transient_file_names() {
        // Bodies are checked under their `.part` download name; the
        // verdict must come from the declared container, not the path.
        let bad = write_scratch("bad.opus.part", b"<html>not audio</html>");
        assert!(validate_magic(&bad, ".opus").is_err());
        std::fs::remove_file(bad).ok();

        let good = write_scratch("good.opus.part", b"OggS\x00\x02rest of page");
        assert!(validate_magic(&good, ".opus").is_ok());
        std::fs::remove_file(good).ok();
    }

    #[test]
    fn segment_paths_are_siblings() {
        let seg = segment_path(Path::new("/tmp/body.audio"), 2);
        assert_eq!(seg, Path::new("/tmp/body.audio.seg2.part"));
    }

    #[tokio::test]
    async fn throttle_limits_rate() {
        tokio::time::pause();
        let mut throttle = ProgressThrottle::new(Duration::from_millis(100));
        assert!(throttle.ready());
        assert!(!throttle.ready());
        tokio::time::advance(Duration::from_millis(150)).await;
        assert!(throttle.ready());
    }
}
