//! Track metadata and stream description types.
//!
//! This module defines the data model shared by the whole playback core:
//! * [`Track`] - immutable track metadata as queued for playback
//! * [`AudioQuality`] - the user-facing quality selector
//! * [`AudioFormat`] - a concrete audio-only format offered by the provider
//! * [`PlaybackData`] - a resolved, time-limited stream URL with its format
//! * [`LoopMode`] - queue boundary behavior
//!
//! # Track Lifecycle
//!
//! 1. Creation from provider metadata (or from a persisted queue)
//! 2. Stream resolution through the [`resolver`](crate::resolver)
//! 3. Source construction through the [`source`](crate::source) builder
//!
//! Tracks are immutable once queued; the single exception is
//! [`Track::with_duration`], applied once after the player reports an
//! authoritative duration.

use std::{fmt, path::PathBuf, time::Duration, time::SystemTime};

use serde::{Deserialize, Serialize};
use url::Url;
use veil::Redact;

/// A unique identifier for a track.
///
/// Opaque to the playback core; assigned by the streaming provider.
pub type TrackId = String;

/// User-facing audio quality selector.
///
/// The resolver maps this to a concrete [`AudioFormat`] selection policy;
/// see [`AudioQuality::target_bitrate`].
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AudioQuality {
    /// Pick the best format allowed by the current network.
    #[default]
    Auto,
    /// Target 64 kbit/s.
    Low,
    /// Target 128 kbit/s.
    Medium,
    /// Target 256 kbit/s.
    High,
    /// Best available bitrate, network permitting.
    Max,
}

impl AudioQuality {
    /// Target bitrate in bits per second, if the quality names one.
    ///
    /// `Auto` and `Max` return `None`: their selection is driven by the
    /// network ceiling instead of a fixed target.
    #[must_use]
    pub fn target_bitrate(self) -> Option<u32> {
        match self {
            Self::Auto | Self::Max => None,
            Self::Low => Some(64_000),
            Self::Medium => Some(128_000),
            Self::High => Some(256_000),
        }
    }

    /// Short name used in cache file names and settings keys.
    #[must_use]
    pub fn name(self) -> &'static str {
        match self {
            Self::Auto => "auto",
            Self::Low => "low",
            Self::Medium => "medium",
            Self::High => "high",
            Self::Max => "max",
        }
    }
}

impl fmt::Display for AudioQuality {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.name())
    }
}

impl std::str::FromStr for AudioQuality {
    type Err = crate::error::Error;

    fn from_str(s: &str) -> crate::error::Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "auto" => Ok(Self::Auto),
            "low" => Ok(Self::Low),
            "medium" => Ok(Self::Medium),
            "high" => Ok(Self::High),
            "max" => Ok(Self::Max),
            other => Err(crate::error::Error::invalid_argument(format!(
                "unknown audio quality: {other}"
            ))),
        }
    }
}

/// Queue boundary behavior.
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LoopMode {
    /// Stop at the end of the queue.
    #[default]
    Off,
    /// Wrap around to the start of the queue.
    All,
    /// Repeat the current track.
    One,
}

impl fmt::Display for LoopMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Off => write!(f, "off"),
            Self::All => write!(f, "all"),
            Self::One => write!(f, "one"),
        }
    }
}

/// A concrete audio-only format offered by the streaming provider.
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct AudioFormat {
    /// MIME type, e.g. `audio/webm` or `audio/mp4`.
    pub mime_type: String,

    /// Codec string as reported by the provider, e.g. `opus` or `mp4a.40.2`.
    pub codecs: Option<String>,

    /// Average bitrate in bits per second.
    pub bitrate: u32,

    /// Body length in bytes, when the provider reports it.
    pub content_length: Option<u64>,
}

impl AudioFormat {
    /// Returns whether this is an Opus-in-WebM format.
    ///
    /// Preferred for offline storage; smaller at equal quality.
    #[must_use]
    pub fn is_opus(&self) -> bool {
        self.mime_type.contains("webm")
            || self
                .codecs
                .as_deref()
                .is_some_and(|codecs| codecs.starts_with("opus"))
    }

    /// Relative container complexity, used to break bitrate ties.
    ///
    /// Lower sorts first: Opus/WebM over M4A, M4A over anything exotic.
    #[must_use]
    pub fn mime_complexity(&self) -> u8 {
        if self.is_opus() {
            0
        } else if self.mime_type.contains("mp4") || self.mime_type.contains("m4a") {
            1
        } else if self.mime_type.contains("mpeg") || self.mime_type.contains("mp3") {
            2
        } else {
            3
        }
    }

    /// File extension matching this format's container.
    #[must_use]
    pub fn extension(&self) -> &'static str {
        if self.is_opus() {
            ".opus"
        } else if self.mime_type.contains("mp4") || self.mime_type.contains("m4a") {
            ".m4a"
        } else if self.mime_type.contains("mpeg") || self.mime_type.contains("mp3") {
            ".mp3"
        } else {
            ".audio"
        }
    }
}

/// A resolved, time-limited stream location.
///
/// Handed out by the [`resolver`](crate::resolver); the URL embeds an
/// expiring signature, so `expires_at > now` holds whenever a value leaves
/// the resolver. URLs are redacted in debug output as they grant access to
/// the stream.
#[derive(Clone, Redact, Eq, PartialEq)]
pub struct PlaybackData {
    /// Signed stream URL.
    #[redact]
    pub stream_url: Url,

    /// The format the URL serves.
    pub format: AudioFormat,

    /// When the URL's signature lapses.
    pub expires_at: SystemTime,
}

impl PlaybackData {
    /// Safety margin subtracted from the nominal expiry.
    ///
    /// Streams started just before the deadline would 403 mid-flight.
    const EXPIRY_MARGIN: Duration = Duration::from_secs(60);

    /// Returns whether the stream URL is still usable.
    #[must_use]
    pub fn is_fresh(&self) -> bool {
        self.expires_at
            .checked_sub(Self::EXPIRY_MARGIN)
            .is_some_and(|deadline| deadline > SystemTime::now())
    }
}

/// A track as queued for playback.
///
/// Combines provider metadata with the optional path of a local copy. The
/// value is immutable; [`Track::with_duration`] produces an updated copy
/// once the player reports an authoritative duration.
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct Track {
    /// Provider-assigned identifier.
    pub id: TrackId,

    /// Track title.
    pub title: String,

    /// Artist name.
    pub artist: String,

    /// Album title, when known.
    pub album: Option<String>,

    /// Total playback time. Zero when the provider did not report one.
    pub duration: Duration,

    /// Cover art location, when known.
    pub thumbnail_url: Option<Url>,

    /// Path of a downloaded copy in the offline library, when one exists.
    pub local_file_path: Option<PathBuf>,
}

impl Track {
    /// Creates a track with the given identity and display metadata.
    ///
    /// Durations unknown at creation are passed as `Duration::ZERO` and
    /// corrected later via [`Track::with_duration`].
    #[must_use]
    pub fn new(
        id: impl Into<TrackId>,
        title: impl Into<String>,
        artist: impl Into<String>,
        duration: Duration,
    ) -> Self {
        Self {
            id: id.into(),
            title: title.into(),
            artist: artist.into(),
            album: None,
            duration,
            thumbnail_url: None,
            local_file_path: None,
        }
    }

    /// Returns a copy with the duration replaced.
    ///
    /// Applied once, after the active player reports the real duration of
    /// the decoded stream.
    #[must_use]
    pub fn with_duration(&self, duration: Duration) -> Self {
        let mut track = self.clone();
        track.duration = duration;
        track
    }

    /// Returns whether a local copy exists and is plausibly complete.
    ///
    /// Anything under 10 KB is treated as a truncated artifact and ignored.
    #[must_use]
    pub fn has_local_file(&self) -> bool {
        self.local_file_path.as_deref().is_some_and(|path| {
            std::fs::metadata(path).is_ok_and(|meta| meta.is_file() && meta.len() >= 10 * 1024)
        })
    }
}

/// Formats track for display, showing ID, artist and title.
///
/// # Example
///
/// ```text
/// dQw4w9WgXcQ: "Artist Name - Track Title"
/// ```
impl fmt::Display for Track {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: \"{} - {}\"", self.id, self.artist, self.title)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn format(mime: &str, codecs: Option<&str>, bitrate: u32) -> AudioFormat {
        AudioFormat {
            mime_type: mime.to_string(),
            codecs: codecs.map(ToOwned::to_owned),
            bitrate,
            content_length: None,
        }
    }

    #[test]
    fn quality_targets() {
        assert_eq!(AudioQuality::Low.target_bitrate(), Some(64_000));
        assert_eq!(AudioQuality::Medium.target_bitrate(), Some(128_000));
        assert_eq!(AudioQuality::High.target_bitrate(), Some(256_000));
        assert_eq!(AudioQuality::Max.target_bitrate(), None);
        assert_eq!(AudioQuality::Auto.target_bitrate(), None);
    }

    #[test]
    fn opus_sorts_before_m4a() {
        let opus = format("audio/webm", Some("opus"), 128_000);
        let m4a = format("audio/mp4", Some("mp4a.40.2"), 128_000);
        assert!(opus.mime_complexity() < m4a.mime_complexity());
    }

    #[test]
    fn extension_follows_container() {
        assert_eq!(format("audio/webm", Some("opus"), 0).extension(), ".opus");
        assert_eq!(format("audio/mp4", None, 0).extension(), ".m4a");
        assert_eq!(format("audio/mpeg", None, 0).extension(), ".mp3");
    }

    #[test]
    fn playback_data_expiry_margin() {
        let fresh = PlaybackData {
            stream_url: "https://cdn.example.com/a".parse().unwrap(),
            format: format("audio/webm", Some("opus"), 128_000),
            expires_at: SystemTime::now() + Duration::from_secs(600),
        };
        assert!(fresh.is_fresh());

        let nearly_expired = PlaybackData {
            expires_at: SystemTime::now() + Duration::from_secs(30),
            ..fresh.clone()
        };
        assert!(!nearly_expired.is_fresh());
    }

    #[test]
    fn with_duration_updates_only_duration() {
        let track = Track::new("abc123", "Title", "Artist", Duration::ZERO);
        let updated = track.with_duration(Duration::from_secs(180));
        assert_eq!(updated.duration, Duration::from_secs(180));
        assert_eq!(updated.id, track.id);
        assert_eq!(updated.title, track.title);
    }
}
