//! Events emitted by the playback controller.
//!
//! This module defines the coarse notifications that can be observed
//! alongside the state stream. These events can be used to:
//! * Drive a notification surface
//! * Hand progression decisions to an external controller (Jams mode)
//! * React to track changes
//!
//! # Example
//!
//! ```rust
//! use cadenza::events::Event;
//!
//! fn handle_event(event: Event) {
//!     match event {
//!         Event::Play => println!("Playback started"),
//!         Event::TrackChanged => println!("New track playing"),
//!         Event::TrackComplete => println!("Track finished"),
//!         // ... handle other events ...
//!     }
//! }
//! ```

/// Events emitted by the playback controller.
///
/// These events represent significant state changes in playback. The
/// high-frequency position stream is separate; see
/// [`PlaybackController::position_stream`](crate::controller::PlaybackController::position_stream).
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum Event {
    /// Playback has started.
    ///
    /// Emitted when a track begins playing, either from a paused
    /// state or when starting a new track.
    Play,

    /// Playback has paused.
    ///
    /// Emitted when playback is suspended but can be resumed
    /// from the current position.
    Pause,

    /// Current track has changed.
    ///
    /// Emitted when switching to a different track, whether through
    /// manual selection, automatic progression, or a crossfade.
    TrackChanged,

    /// The active player finished its track.
    ///
    /// In Jams mode this is the only progression signal: the external
    /// controller decides what plays next.
    TrackComplete,

    /// The radio extender appended tracks to the queue.
    RadioExtended,
}
