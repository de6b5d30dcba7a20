//! Dual-player engine with hard switches and equal-power crossfades.
//!
//! The engine owns the audio output and two playback slots. Exactly one
//! slot is active at any time; the other preloads the next track when a
//! crossfade is coming. All engine methods are called from the controller
//! task, so slot state never needs its own locking.
//!
//! # Crossfade
//!
//! A crossfade runs in two phases:
//! 1. [`DualPlayerEngine::begin_crossfade`] attaches the next source to
//!    the standby slot at near-zero gain, matches its loop mode and speed
//!    to the active slot, and swaps the active marker. Callers observe
//!    the new active slot from the moment this returns.
//! 2. The fade task starts the new slot via
//!    [`DualPlayerEngine::play_incoming`], waits for buffer warm-up,
//!    walks [`DualPlayerEngine::apply_fade_step`] along the equal-power
//!    curve, stops the outgoing slot and settles gains back to unity.
//!
//! Some backends transiently re-emit a stale volume after a source
//! handoff, so settlement re-asserts the incoming gain on a fixed
//! schedule until it sticks. On top of that, a runtime anti-stall check
//! re-asserts unity gain whenever the active slot is found below it
//! outside a crossfade.

use std::time::Duration;

use crate::{
    error::Result,
    player::{AudioOutput, PlayerHandle},
    source::AudioSourceReader,
};

/// Number of gain steps in a crossfade ramp.
pub const RAMP_STEPS: u32 = 24;

/// Bounds for the duration of a single ramp step.
const RAMP_STEP_MIN: Duration = Duration::from_millis(10);
const RAMP_STEP_MAX: Duration = Duration::from_millis(500);

/// Initial gain of the incoming slot before the ramp starts.
const WARMUP_GAIN: f32 = 0.12;

/// Buffer warm-up pause between starting the incoming slot and ramping.
pub const WARMUP_PAUSE: Duration = Duration::from_millis(90);

/// Settlement re-assertion schedule after the ramp, from ramp end.
pub const SETTLE_SCHEDULE: [Duration; 5] = [
    Duration::ZERO,
    Duration::from_millis(120),
    Duration::from_millis(320),
    Duration::from_millis(700),
    Duration::from_millis(1400),
];

/// Gain considered "settled at unity".
const SETTLED_GAIN: f32 = 0.98;

/// Anti-stall: active gain below this outside a crossfade is corrected.
const STALL_GAIN: f32 = 0.95;

/// Minimum interval between anti-stall corrections.
const STALL_REASSERT_INTERVAL: Duration = Duration::from_millis(800);

/// Equal-power gain pair at ramp step `step` of `total`.
///
/// The outgoing gain follows a quarter cosine, the incoming gain a
/// quarter sine, so the summed power stays flat across the ramp.
#[must_use]
pub fn equal_power_gains(step: u32, total: u32) -> (f32, f32) {
    #[expect(clippy::cast_precision_loss)]
    let progress = step as f32 / total as f32;
    let angle = progress * std::f32::consts::FRAC_PI_2;
    (angle.cos(), angle.sin())
}

/// Duration of one ramp step for a total crossfade length.
///
/// Clamped so very short fades still move through every gain value and
/// very long fades do not starve the tick loop.
#[must_use]
pub fn ramp_step_duration(crossfade_ms: u32) -> Duration {
    let step = Duration::from_millis(u64::from(crossfade_ms) / u64::from(RAMP_STEPS));
    step.clamp(RAMP_STEP_MIN, RAMP_STEP_MAX)
}

/// The two playback slots and the active marker.
pub struct DualPlayerEngine {
    output: AudioOutput,

    /// The two slots; index 0 starts active.
    players: Option<[PlayerHandle; 2]>,

    /// Index of the active slot.
    active: usize,

    /// Whether a crossfade ramp is running.
    crossfading: bool,

    /// Per-track crossfade trigger latch; reset on each source change.
    fade_latched: bool,

    /// Last anti-stall correction, for rate limiting.
    last_stall_assert: Option<tokio::time::Instant>,
}

impl DualPlayerEngine {
    /// Selects the audio device without opening it.
    ///
    /// # Errors
    ///
    /// Returns error if the device specification is invalid or the device
    /// is not available.
    pub fn new(device: &str) -> Result<Self> {
        Ok(Self {
            output: AudioOutput::new(device)?,
            players: None,
            active: 0,
            crossfading: false,
            fade_latched: false,
            last_stall_assert: None,
        })
    }

    /// Opens the audio device and creates both playback slots.
    ///
    /// # Errors
    ///
    /// Returns error if the device or the sinks cannot be opened.
    pub fn start(&mut self) -> Result<()> {
        self.output.start()?;
        self.players = Some([
            PlayerHandle::new("primary", &self.output)?,
            PlayerHandle::new("secondary", &self.output)?,
        ]);
        self.active = 0;
        Ok(())
    }

    /// Stops both slots and closes the audio device.
    pub fn shutdown(&mut self) {
        if let Some(players) = self.players.as_mut() {
            for player in players {
                player.stop();
            }
        }
        self.players = None;
        self.output.stop();
    }

    /// Returns whether the engine is started.
    #[must_use]
    pub fn is_started(&self) -> bool {
        self.players.is_some()
    }

    /// The active slot.
    ///
    /// # Panics
    ///
    /// Panics if the engine is not started; the controller only touches
    /// slots after `start()`.
    #[must_use]
    pub fn active(&self) -> &PlayerHandle {
        let players = self.players.as_ref().expect("engine not started");
        &players[self.active]
    }

    /// The active slot, mutably.
    #[must_use]
    pub fn active_mut(&mut self) -> &mut PlayerHandle {
        let players = self.players.as_mut().expect("engine not started");
        &mut players[self.active]
    }

    /// The standby slot, mutably.
    #[must_use]
    pub fn standby_mut(&mut self) -> &mut PlayerHandle {
        let players = self.players.as_mut().expect("engine not started");
        &mut players[1 - self.active]
    }

    /// Both slots, mutably.
    fn both_mut(&mut self) -> (&mut PlayerHandle, &mut PlayerHandle) {
        let active = self.active;
        let players = self.players.as_mut().expect("engine not started");
        let [a, b] = players;
        if active == 0 {
            (a, b)
        } else {
            (b, a)
        }
    }

    /// Whether a crossfade ramp is running.
    #[must_use]
    pub fn is_crossfading(&self) -> bool {
        self.crossfading
    }

    /// Arms the crossfade trigger for the current track.
    ///
    /// Returns `false` when the trigger already fired for this track, so
    /// position ticks start at most one fade per source.
    pub fn latch_fade(&mut self) -> bool {
        if self.fade_latched {
            return false;
        }
        self.fade_latched = true;
        true
    }

    /// Attaches a source to the active slot (hard switch).
    ///
    /// Stops the standby slot first so a half-prepared crossfade cannot
    /// leak audio.
    ///
    /// # Errors
    ///
    /// Returns error if the stream cannot be decoded.
    pub fn hard_switch(&mut self, reader: AudioSourceReader) -> Result<()> {
        self.standby_mut().stop();
        self.fade_latched = false;
        let result = self.active_mut().set_source(reader);
        self.active_mut().set_volume_raw(1.0);
        result
    }

    /// Phase one of a crossfade: preload and swap.
    ///
    /// Attaches the source to the standby slot at warm-up gain, matches
    /// loop mode and speed, then swaps the active marker. Surrounding
    /// code sees the new active slot from here on; the old one keeps
    /// playing until the ramp finishes.
    ///
    /// # Errors
    ///
    /// Returns error if the stream cannot be decoded; the slots are left
    /// as they were.
    pub fn begin_crossfade(&mut self, reader: AudioSourceReader) -> Result<()> {
        let (active, standby) = self.both_mut();

        standby.stop();
        standby.set_loop_mode(active.loop_mode());
        standby.set_speed(active.speed());
        standby.set_source(reader)?;
        standby.set_volume_raw(WARMUP_GAIN);

        self.active = 1 - self.active;
        self.fade_latched = false;
        self.crossfading = true;
        Ok(())
    }

    /// Starts the incoming slot of a running crossfade.
    ///
    /// Phase two begins here; the fade task then walks
    /// [`DualPlayerEngine::apply_fade_step`] through the ramp, calls
    /// [`DualPlayerEngine::settle_outgoing`] once, and re-asserts with
    /// [`DualPlayerEngine::reassert_incoming`] until it reports settled.
    /// Split into steps so the fade task never holds the engine lock
    /// across a sleep.
    pub fn play_incoming(&mut self) {
        self.active_mut().play();
    }

    /// Applies the equal-power gains of ramp step `step`.
    pub fn apply_fade_step(&mut self, step: u32) {
        let (out_gain, in_gain) = equal_power_gains(step, RAMP_STEPS);
        let (incoming, outgoing) = self.both_mut();
        outgoing.set_volume_raw(out_gain);
        incoming.set_volume_raw(in_gain);
    }

    /// Ends the overlap: stops the outgoing slot and resets its gain.
    ///
    /// Between two crossfade events this always precedes the incoming
    /// slot's final volume assertion.
    pub fn settle_outgoing(&mut self) {
        let (_, outgoing) = self.both_mut();
        outgoing.stop();
        outgoing.set_volume_raw(1.0);
    }

    /// One settlement re-assertion of the incoming gain.
    ///
    /// Some backends transiently re-emit a stale volume after a source
    /// handoff; returns `true` once the gain reads settled at unity.
    pub fn reassert_incoming(&mut self) -> bool {
        let incoming = self.active_mut();
        if incoming.volume() >= SETTLED_GAIN {
            return true;
        }
        incoming.set_volume_raw(1.0);
        false
    }

    /// Marks the crossfade finished and asserts unity gain.
    pub fn end_crossfade(&mut self) {
        self.active_mut().set_volume_raw(1.0);
        self.crossfading = false;
        debug!("crossfade settled on {}", self.active().label());
    }

    /// Runtime anti-stall check, called on every position tick.
    ///
    /// Outside a crossfade the active gain must be unity; if a backend
    /// left it low, re-assert at most once per 800 ms.
    pub fn assert_active_volume(&mut self) {
        if self.crossfading {
            return;
        }
        if self.active().volume() >= STALL_GAIN {
            return;
        }

        let now = tokio::time::Instant::now();
        if self
            .last_stall_assert
            .is_some_and(|last| now.duration_since(last) < STALL_REASSERT_INTERVAL)
        {
            return;
        }

        warn!(
            "active gain sagged to {:.2}, re-asserting unity",
            self.active().volume()
        );
        self.active_mut().set_volume_raw(1.0);
        self.last_stall_assert = Some(now);
    }

    /// Stops both slots and resets their gains to unity.
    pub fn stop_all(&mut self) {
        let (active, standby) = self.both_mut();
        active.stop();
        standby.stop();
        active.set_volume_raw(1.0);
        standby.set_volume_raw(1.0);
        self.crossfading = false;
        self.fade_latched = false;
    }

    /// Mirrors a setting to both slots.
    pub fn for_both(&mut self, mut f: impl FnMut(&mut PlayerHandle)) {
        let (active, standby) = self.both_mut();
        f(active);
        f(standby);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ramp_is_equal_power() {
        for step in 0..=RAMP_STEPS {
            let (out_gain, in_gain) = equal_power_gains(step, RAMP_STEPS);
            let power = out_gain * out_gain + in_gain * in_gain;
            assert!((power - 1.0).abs() < 1e-5, "power {power} at step {step}");
        }
    }

    #[test]
    fn ramp_endpoints() {
        let (out_start, in_start) = equal_power_gains(0, RAMP_STEPS);
        assert!((out_start - 1.0).abs() < 1e-6);
        assert!(in_start.abs() < 1e-6);

        let (out_end, in_end) = equal_power_gains(RAMP_STEPS, RAMP_STEPS);
        assert!(out_end.abs() < 1e-6);
        assert!((in_end - 1.0).abs() < 1e-6);
    }

    #[test]
    fn step_duration_clamps() {
        // 2 s fade: 83 ms steps, inside the bounds.
        assert_eq!(ramp_step_duration(2000), Duration::from_millis(83));
        // 100 ms fade: clamped up to 10 ms steps.
        assert_eq!(ramp_step_duration(100), RAMP_STEP_MIN);
        // 60 s fade would exceed the cap: clamped down to 500 ms steps.
        assert_eq!(ramp_step_duration(60_000), RAMP_STEP_MAX);
    }
}
