//! Observable playback state.
//!
//! [`PlaybackState`] is the single value type observed through the
//! controller's state stream. Equality deliberately ignores the two
//! high-frequency fields (`position` and `buffered_position`) so that
//! position ticks do not invalidate subscribers; the raw position is
//! published on a separate stream.

use std::time::Duration;

use crate::track::{AudioQuality, LoopMode, PlaybackData, Track};

/// Lifecycle of the currently loading playback slot.
///
/// ```text
/// Idle -> Loading -> (Ready | Error) -> Playing <-> Paused -> Buffering? -> Completed
/// ```
///
/// `Completed -> Loading` happens automatically unless Jams mode hands
/// progression to an external controller.
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq, Hash)]
pub enum PlayPhase {
    /// No source attached.
    #[default]
    Idle,
    /// A source is being resolved and attached.
    Loading,
    /// Source attached, not yet playing.
    Ready,
    /// Audio is being produced.
    Playing,
    /// Playback suspended, resumable.
    Paused,
    /// Starved for data mid-track.
    Buffering,
    /// The track played to its end.
    Completed,
    /// Loading or playback failed; recoverable by the next command.
    Error,
}

/// The observable playback state.
///
/// A coarse snapshot emitted whenever anything but the playhead moves.
/// Cheap to clone relative to its emission rate; the queue is the largest
/// field and changes rarely.
#[derive(Clone, Debug, Default)]
pub struct PlaybackState {
    /// The current track, if any.
    pub current_track: Option<Track>,

    /// Queue snapshot in playing order.
    pub queue: Vec<Track>,

    /// Revision of the queue snapshot.
    pub queue_revision: u64,

    /// Index of the current track; `None` iff the queue is empty.
    pub current_index: Option<usize>,

    /// Whether audio is being produced.
    pub is_playing: bool,

    /// Whether playback is starved for data.
    pub is_buffering: bool,

    /// Whether a source is being loaded.
    pub is_loading: bool,

    /// Playhead position. Excluded from equality.
    pub position: Duration,

    /// Downloaded-ahead position. Excluded from equality.
    pub buffered_position: Duration,

    /// Authoritative duration reported by the player, once known.
    pub duration: Option<Duration>,

    /// Playback speed multiplier.
    pub speed: f32,

    /// Queue boundary behavior.
    pub loop_mode: LoopMode,

    /// Whether the queue order is shuffled.
    pub shuffle_enabled: bool,

    /// Most recent user-facing error; cleared by the next successful
    /// command.
    pub error: Option<String>,

    /// Active streaming quality.
    pub audio_quality: AudioQuality,

    /// Stream data of the current track, once resolved.
    pub current_playback_data: Option<PlaybackData>,

    /// Identity of the playlist or album that seeded the queue.
    pub source_id: Option<String>,

    /// Whether the queue auto-extends with related tracks.
    pub is_radio_mode: bool,

    /// Whether a radio extension fetch is in flight.
    pub is_fetching_radio: bool,

    /// Wi-Fi-only precache policy.
    pub stream_cache_wifi_only: bool,

    /// Stream cache budget in MiB.
    pub stream_cache_size_limit_mb: u32,

    /// Precache concurrency cap.
    pub stream_cache_max_concurrent: u8,

    /// Crossfade overlap in milliseconds; zero means hard switches.
    pub crossfade_duration_ms: u32,
}

impl PlaybackState {
    /// Creates the initial state for the given settings.
    #[must_use]
    pub fn initial(settings: &crate::config::Settings) -> Self {
        Self {
            speed: 1.0,
            audio_quality: settings.streaming_quality,
            stream_cache_wifi_only: settings.stream_cache_wifi_only,
            stream_cache_size_limit_mb: settings.stream_cache_size_limit_mb,
            stream_cache_max_concurrent: settings.stream_cache_max_concurrent,
            crossfade_duration_ms: settings.crossfade_duration_ms,
            ..Self::default()
        }
    }
}

/// Equality over everything except the playhead fields.
///
/// `position` and `buffered_position` tick several times a second; a
/// subscriber interested in them listens to the position stream instead.
impl PartialEq for PlaybackState {
    fn eq(&self, other: &Self) -> bool {
        self.current_track == other.current_track
            && self.queue == other.queue
            && self.queue_revision == other.queue_revision
            && self.current_index == other.current_index
            && self.is_playing == other.is_playing
            && self.is_buffering == other.is_buffering
            && self.is_loading == other.is_loading
            && self.duration == other.duration
            && self.speed == other.speed
            && self.loop_mode == other.loop_mode
            && self.shuffle_enabled == other.shuffle_enabled
            && self.error == other.error
            && self.audio_quality == other.audio_quality
            && self.current_playback_data == other.current_playback_data
            && self.source_id == other.source_id
            && self.is_radio_mode == other.is_radio_mode
            && self.is_fetching_radio == other.is_fetching_radio
            && self.stream_cache_wifi_only == other.stream_cache_wifi_only
            && self.stream_cache_size_limit_mb == other.stream_cache_size_limit_mb
            && self.stream_cache_max_concurrent == other.stream_cache_max_concurrent
            && self.crossfade_duration_ms == other.crossfade_duration_ms
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn equality_ignores_playhead() {
        let a = PlaybackState {
            position: Duration::from_secs(10),
            buffered_position: Duration::from_secs(30),
            ..PlaybackState::default()
        };
        let b = PlaybackState {
            position: Duration::from_secs(11),
            buffered_position: Duration::from_secs(35),
            ..PlaybackState::default()
        };
        assert_eq!(a, b);
    }

    #[test]
    fn equality_sees_everything_else() {
        let a = PlaybackState::default();

        let playing = PlaybackState {
            is_playing: true,
            ..a.clone()
        };
        assert_ne!(a, playing);

        let revised = PlaybackState {
            queue_revision: 1,
            ..a.clone()
        };
        assert_ne!(a, revised);

        let errored = PlaybackState {
            error: Some("boom".to_string()),
            ..a.clone()
        };
        assert_ne!(a, errored);
    }
}
