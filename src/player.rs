//! Audio output and per-player playback handles.
//!
//! This module provides:
//! * [`AudioOutput`] - device selection and the shared output stream
//! * [`PlayerHandle`] - one of the two playback slots driven by the
//!   [`engine`](crate::engine)
//!
//! # Device Management
//!
//! The audio device is handled in three phases:
//! 1. Selection during construction (`new()`)
//! 2. Opening on demand (`start()`)
//! 3. Closing when done (`stop()`)
//!
//! This design prevents ALSA from acquiring the device until it's
//! actually needed.
//!
//! # Playback Slots
//!
//! Each [`PlayerHandle`] owns a rodio sink fed by a source queue. Sources
//! are appended with a completion signal, so the engine can observe the
//! end of a track without polling the decoder. Exactly one handle is
//! active at a time; the other preloads the next track for crossfades.

use std::{
    sync::{Arc, Mutex, PoisonError},
    time::Duration,
};

use cpal::traits::{DeviceTrait, HostTrait};
use rodio::Source;

use crate::{
    error::{Error, ErrorKind, Result},
    source::{AudioSourceReader, SourceError},
    track::{LoopMode, TrackId},
};

/// Audio sample type used by the decoder.
///
/// This is the native format that rodio's decoder produces,
/// used for internal audio processing.
type SampleFormat = <rodio::decoder::Decoder<std::fs::File> as Iterator>::Item;

/// Selected audio device and its opened output stream.
///
/// Both playback slots share one output stream; each slot owns its own
/// sink on it.
pub struct AudioOutput {
    /// Selected audio output device.
    ///
    /// Device is chosen during construction but not opened until `start()`.
    device: rodio::Device,

    /// Audio output configuration.
    ///
    /// Contains sample rate, format, and buffer size settings
    /// selected during construction.
    device_config: rodio::SupportedStreamConfig,

    /// Handle to the open output stream.
    ///
    /// Only available when device is open (between `start()` and `stop()`).
    handle: Option<rodio::OutputStreamHandle>,

    /// Keep-alive channel of the stream thread.
    ///
    /// The output stream itself is not `Send`, so it lives on a
    /// dedicated thread that holds it until this sender drops.
    stream_keepalive: Option<std::sync::mpsc::Sender<()>>,
}

impl AudioOutput {
    /// Selects an audio output device without opening it.
    ///
    /// # Arguments
    ///
    /// * `device` - Device specification string:
    ///   ```text
    ///   [<host>][|<device>][|<sample rate>][|<sample format>]
    ///   ```
    ///   All parts are optional. Use empty string for system default.
    ///
    /// # Errors
    ///
    /// Returns error if:
    /// * Host is not found
    /// * Device is not found
    /// * Sample rate is invalid
    /// * Sample format is not supported
    pub fn new(device: &str) -> Result<Self> {
        let (device, device_config) = Self::get_device(device)?;
        Ok(Self {
            device,
            device_config,
            handle: None,
            stream_keepalive: None,
        })
    }

    /// Selects and configures an audio output device.
    fn get_device(device: &str) -> Result<(rodio::Device, rodio::SupportedStreamConfig)> {
        // The device string has the following format:
        // "[<host>][|<device>][|<sample rate>][|<sample format>]" (case-insensitive)
        // From left to right, the fields are optional, but each field
        // depends on the preceding fields being specified.
        let mut components = device.split('|');

        // The host is the first field.
        let host = match components.next() {
            Some("") | None => cpal::default_host(),
            Some(name) => {
                let host_ids = cpal::available_hosts();
                host_ids
                    .into_iter()
                    .find_map(|host_id| {
                        let host = cpal::host_from_id(host_id).ok()?;
                        if host.id().name().eq_ignore_ascii_case(name) {
                            Some(host)
                        } else {
                            None
                        }
                    })
                    .ok_or_else(|| Error::not_found(format!("audio host {name} not found")))?
            }
        };

        // The device is the second field.
        let device = match components.next() {
            Some("") | None => host.default_output_device().ok_or_else(|| {
                Error::not_found(format!(
                    "default audio output device not found on {}",
                    host.id().name()
                ))
            })?,
            Some(name) => {
                let mut devices = host.output_devices()?;
                devices
                    .find(|device| device.name().is_ok_and(|n| n.eq_ignore_ascii_case(name)))
                    .ok_or_else(|| {
                        Error::not_found(format!(
                            "audio output device {name} not found on {}",
                            host.id().name()
                        ))
                    })?
            }
        };

        let config = match components.next() {
            Some("") | None => device.default_output_config().map_err(|e| {
                Error::unavailable(format!("default output configuration unavailable: {e}"))
            })?,
            Some(rate) => {
                let rate = rate
                    .parse()
                    .map_err(|_| Error::invalid_argument(format!("invalid sample rate {rate}")))?;
                let rate = cpal::SampleRate(rate);

                let format = match components.next() {
                    Some("") | None => None,
                    other => other,
                };

                device
                    .supported_output_configs()?
                    .find_map(|config| {
                        if format.is_none_or(|format| {
                            config
                                .sample_format()
                                .to_string()
                                .eq_ignore_ascii_case(format)
                        }) {
                            config.try_with_sample_rate(rate)
                        } else {
                            None
                        }
                    })
                    .ok_or_else(|| {
                        Error::unavailable(format!(
                            "audio output device {} does not support sample rate {} with {} sample format",
                            device.name().as_deref().unwrap_or("UNKNOWN"),
                            rate.0,
                            format.unwrap_or("default")
                        ))
                    })?
            }
        };

        info!(
            "audio output device: {} on {}",
            device.name().as_deref().unwrap_or("UNKNOWN"),
            host.id().name()
        );

        #[expect(clippy::cast_precision_loss)]
        let sample_rate = config.sample_rate().0 as f32 / 1000.0;
        info!(
            "audio output configuration: {sample_rate:.1} kHz in {}",
            config.sample_format()
        );

        Ok((device, config))
    }

    /// Opens the audio output device.
    ///
    /// Must be called before playback slots are created. The device
    /// remains open until `stop()` is called or the output is dropped.
    ///
    /// The output stream is not `Send`, so it is opened and parked on a
    /// dedicated thread; only its handle is kept here.
    ///
    /// # Errors
    ///
    /// Returns error if the output stream cannot be created.
    pub fn start(&mut self) -> Result<()> {
        debug!("opening output device");

        let (result_tx, result_rx) = std::sync::mpsc::channel();
        let (keepalive_tx, keepalive_rx) = std::sync::mpsc::channel::<()>();
        let device = self.device.clone();
        let config = self.device_config.clone();

        std::thread::Builder::new()
            .name("audio-output".to_string())
            .spawn(move || {
                match rodio::OutputStream::try_from_device_config(&device, config) {
                    Ok((stream, handle)) => {
                        if result_tx.send(Ok(handle)).is_err() {
                            return;
                        }
                        // Hold the stream until every keep-alive sender
                        // is dropped.
                        let _stream = stream;
                        let _ = keepalive_rx.recv();
                    }
                    Err(e) => {
                        let _ = result_tx.send(Err(e));
                    }
                }
            })
            .map_err(Error::from)?;

        let handle = result_rx
            .recv()
            .map_err(|_| Error::unavailable("audio output thread died"))??;

        self.handle = Some(handle);
        self.stream_keepalive = Some(keepalive_tx);
        Ok(())
    }

    /// Closes the audio output device.
    pub fn stop(&mut self) {
        if self.handle.is_some() {
            debug!("closing output device");
        }
        self.handle = None;
        self.stream_keepalive = None;
    }

    /// Returns the open stream handle.
    ///
    /// # Errors
    ///
    /// Returns error if the device is not open.
    pub fn handle(&self) -> Result<&rodio::OutputStreamHandle> {
        self.handle
            .as_ref()
            .ok_or(Error::unavailable("audio output not open"))
    }

    /// The list of supported sample rates.
    ///
    /// This list is used to filter out unreasonable sample rates.
    const SAMPLE_RATES: [u32; 4] = [44_100, 48_000, 88_200, 96_000];

    /// Lists available audio output devices.
    ///
    /// Returns a sorted list of device specifications in the format:
    /// ```text
    /// <host>|<device>|<sample rate>|<sample format>
    /// ```
    ///
    /// Default device is marked with "(default)" suffix.
    #[must_use]
    pub fn enumerate_devices() -> Vec<String> {
        let hosts = cpal::available_hosts();

        // Create a set to store the unique device names.
        // On Alsa hosts, the same device may otherwise be enumerated multiple times.
        let mut result = std::collections::HashSet::new();

        let default_host = cpal::default_host();
        let default_device = default_host.default_output_device();
        let default_config = default_device
            .as_ref()
            .and_then(|device| device.default_output_config().ok());

        for host in hosts
            .into_iter()
            .filter_map(|id| cpal::host_from_id(id).ok())
        {
            if let Ok(devices) = host.output_devices() {
                for device in devices {
                    if let Ok(configs) = device.supported_output_configs() {
                        for config in configs {
                            if let Ok(device_name) = device.name() {
                                for sample_rate in &Self::SAMPLE_RATES {
                                    if let Some(config) =
                                        config.try_with_sample_rate(cpal::SampleRate(*sample_rate))
                                    {
                                        let mut line = format!(
                                            "{}|{}|{}|{}",
                                            host.id().name(),
                                            device_name,
                                            config.sample_rate().0,
                                            config.sample_format(),
                                        );

                                        if default_host.id() == host.id()
                                            && default_device.as_ref().is_some_and(
                                                |default_device| {
                                                    default_device.name().is_ok_and(
                                                        |default_name| default_name == device_name,
                                                    )
                                                },
                                            )
                                            && default_config.as_ref().is_some_and(
                                                |default_config| *default_config == config,
                                            )
                                        {
                                            line.push_str(" (default)");
                                        }

                                        result.insert(line);
                                    }
                                }
                            }
                        }
                    }
                }
            }
        }

        let mut result: Vec<_> = result.into_iter().collect();
        result.sort();
        result
    }
}

impl Drop for AudioOutput {
    /// Ensures the audio device is properly closed when dropped.
    fn drop(&mut self) {
        self.stop();
    }
}

/// One of the two playback slots.
///
/// Wraps a rodio sink and a source queue. The slot reports position,
/// buffered position and completion of the attached source; everything
/// above that (queue policy, crossfades, state emission) lives in the
/// engine and controller.
pub struct PlayerHandle {
    /// Slot label for logging ("primary" / "secondary").
    label: &'static str,

    /// Audio output sink. Handles final output and volume control.
    sink: rodio::Sink,

    /// Queue of audio sources feeding the sink.
    sources: Arc<rodio::queue::SourcesQueueInput<SampleFormat>>,

    /// Completion signal for the attached source.
    current_rx: Option<std::sync::mpsc::Receiver<()>>,

    /// Sink position when the attached source started playing.
    ///
    /// The sink accumulates play time across sources; the difference is
    /// this source's position.
    playing_since: Duration,

    /// Position to seek to once the source can seek.
    deferred_seek: Option<Duration>,

    /// Raw gain currently applied to the sink.
    volume: f32,

    /// User volume before logarithmic scaling.
    user_volume: f32,

    /// Playback speed multiplier.
    speed: f32,

    /// Loop mode mirror; progression is decided by the controller.
    loop_mode: LoopMode,

    /// Duration of the attached source, once known.
    duration: Option<Duration>,

    /// Downloaded-ahead duration of the attached source.
    buffered: Arc<Mutex<Duration>>,

    /// Identity of the attached track.
    track_id: Option<TrackId>,
}

impl PlayerHandle {
    /// Logarithmic volume scale factor for a dynamic range of 60 dB.
    ///
    /// Equal to 10^(60/20) = 1000.0
    const LOG_VOLUME_SCALE_FACTOR: f32 = 1000.0;

    /// Logarithmic volume growth rate for a dynamic range of 60 dB.
    ///
    /// Equal to ln(1000)
    const LOG_VOLUME_GROWTH_RATE: f32 = 6.907_755_4;

    /// Creates a playback slot on the open output.
    ///
    /// The slot starts paused with an empty source queue.
    ///
    /// # Errors
    ///
    /// Returns error if the sink cannot be created.
    pub fn new(label: &'static str, output: &AudioOutput) -> Result<Self> {
        let sink = rodio::Sink::try_new(output.handle()?)?;

        // The output source will output silence when the queue is empty.
        // That will cause the sink to report as "playing", so pause it.
        let (sources, output_source) = rodio::queue::queue(true);
        sink.append(output_source);
        sink.pause();
        sink.set_volume(1.0);

        Ok(Self {
            label,
            sink,
            sources,
            current_rx: None,
            playing_since: Duration::ZERO,
            deferred_seek: None,
            volume: 1.0,
            user_volume: 1.0,
            speed: 1.0,
            loop_mode: LoopMode::default(),
            duration: None,
            buffered: Arc::new(Mutex::new(Duration::ZERO)),
            track_id: None,
        })
    }

    /// Attaches a source, replacing whatever was attached before.
    ///
    /// The previous source queue is swapped out so its downloads drop.
    /// Playback does not start; call [`PlayerHandle::play`].
    ///
    /// # Errors
    ///
    /// Returns error if the stream cannot be decoded.
    pub fn set_source(&mut self, reader: AudioSourceReader) -> Result<()> {
        self.stop();

        let track_id = reader.track_id().to_string();
        let duration = reader.duration();
        let buffered = reader.buffered_handle();

        let decoder = rodio::Decoder::new(reader.into_reader())
            .map_err(|e| Error::from(SourceError::BackendRefused(e.to_string())))?;

        // Prefer the decoder's own duration over provider metadata.
        let decoded_duration = decoder.total_duration();
        self.duration = decoded_duration.or(duration);

        if let Some(progress) = self.deferred_seek.take() {
            trace!("{}: ignoring stale deferred seek {progress:?}", self.label);
        }

        let rx = self.sources.append_with_signal(decoder);
        self.current_rx = Some(rx);
        self.playing_since = self.sink.get_pos();
        self.track_id = Some(track_id);
        self.buffered = buffered;

        debug!("{}: source attached", self.label);
        Ok(())
    }

    /// Starts or resumes playback.
    pub fn play(&mut self) {
        if self.sink.is_paused() {
            debug!("{}: starting playback", self.label);
            self.sink.play();
        }
    }

    /// Pauses playback.
    pub fn pause(&mut self) {
        if !self.sink.is_paused() {
            debug!("{}: pausing playback", self.label);
            self.sink.pause();
        }
    }

    /// Stops playback and drops the attached source.
    ///
    /// The slot remains usable; attach a new source to continue.
    pub fn stop(&mut self) {
        // Don't just clear the sink, because that makes rodio stop
        // playback entirely. Swap in a fresh, empty source queue instead.
        let (sources, output) = rodio::queue::queue(true);
        self.sink.append(output);
        self.sink.skip_one();
        self.sources = sources;

        self.current_rx = None;
        self.deferred_seek = None;
        self.duration = None;
        self.track_id = None;
        self.playing_since = self.sink.get_pos();
        *self
            .buffered
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Duration::ZERO;
    }

    /// Returns whether the slot has a source and is not paused.
    #[must_use]
    pub fn is_playing(&self) -> bool {
        self.current_rx.is_some() && !self.sink.is_paused()
    }

    /// Returns whether a source is attached.
    #[must_use]
    pub fn has_source(&self) -> bool {
        self.current_rx.is_some()
    }

    /// Identity of the attached track.
    #[must_use]
    pub fn track_id(&self) -> Option<&str> {
        self.track_id.as_deref()
    }

    /// Position within the attached source.
    #[must_use]
    pub fn position(&self) -> Duration {
        self.sink.get_pos().saturating_sub(self.playing_since)
    }

    /// Downloaded-ahead position of the attached source.
    ///
    /// Equals [`PlayerHandle::duration`] for file sources.
    #[must_use]
    pub fn buffered_position(&self) -> Duration {
        *self
            .buffered
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    /// Duration of the attached source, once known.
    #[must_use]
    pub fn duration(&self) -> Option<Duration> {
        self.duration
    }

    /// Seeks within the attached source.
    ///
    /// If the source cannot seek yet (still buffering), the seek is
    /// deferred and retried by the engine tick once possible.
    ///
    /// # Errors
    ///
    /// Returns error for seek failures other than "not ready yet".
    pub fn seek(&mut self, position: Duration) -> Result<()> {
        match self.sink.try_seek(position) {
            Ok(()) => {
                self.playing_since = self.sink.get_pos().saturating_sub(position);
                self.deferred_seek = None;
                Ok(())
            }
            Err(e) => {
                let e = Error::from(e);
                if matches!(e.kind, ErrorKind::Unavailable | ErrorKind::Unimplemented) {
                    // Not buffered far enough: defer until it is.
                    self.deferred_seek = Some(position);
                    Ok(())
                } else {
                    Err(e)
                }
            }
        }
    }

    /// Retries a deferred seek, if one is pending.
    pub fn retry_deferred_seek(&mut self) {
        if let Some(position) = self.deferred_seek.take() {
            if let Err(e) = self.seek(position) {
                error!("{}: deferred seek failed: {e}", self.label);
            }
        }
    }

    /// Returns whether the attached source finished playing.
    ///
    /// Consumes the completion signal: after this returns `true`, the
    /// slot reports no source until a new one is attached.
    pub fn poll_completed(&mut self) -> bool {
        let completed = self
            .current_rx
            .as_mut()
            .is_some_and(|rx| rx.try_recv().is_ok());

        if completed {
            debug!("{}: source completed", self.label);
            self.current_rx = None;
            self.playing_since = self.sink.get_pos();
        }
        completed
    }

    /// Sets the raw sink gain.
    ///
    /// Used by the crossfade ramp, bypassing the logarithmic user curve.
    pub fn set_volume_raw(&mut self, gain: f32) {
        let gain = gain.clamp(0.0, 1.0);
        self.volume = gain;
        self.sink.set_volume(gain * Self::scaled_amplitude(self.user_volume));
    }

    /// Raw gain currently applied.
    #[must_use]
    pub fn volume(&self) -> f32 {
        self.volume
    }

    /// Sets the user volume with logarithmic scaling.
    ///
    /// The volume control uses a logarithmic scale that matches human
    /// perception:
    /// * Logarithmic scaling across a 60 dB dynamic range
    /// * Linear fade to zero for very low volumes (< 10%)
    pub fn set_user_volume(&mut self, volume: f32) {
        let volume = volume.clamp(0.0, 1.0);
        self.user_volume = volume;
        self.sink
            .set_volume(self.volume * Self::scaled_amplitude(volume));
    }

    /// Applies the logarithmic curve to a user volume.
    ///
    /// Source: <https://www.dr-lex.be/info-stuff/volumecontrols.html>
    fn scaled_amplitude(volume: f32) -> f32 {
        let mut amplitude = volume;
        if amplitude > 0.0 && amplitude < 1.0 {
            amplitude =
                f32::exp(Self::LOG_VOLUME_GROWTH_RATE * volume) / Self::LOG_VOLUME_SCALE_FACTOR;
            if volume < 0.1 {
                amplitude *= volume * 10.0;
            }
        }
        amplitude
    }

    /// Sets the playback speed multiplier.
    pub fn set_speed(&mut self, speed: f32) {
        self.speed = speed;
        self.sink.set_speed(speed);
    }

    /// Playback speed multiplier.
    #[must_use]
    pub fn speed(&self) -> f32 {
        self.speed
    }

    /// Mirrors the loop mode onto the slot.
    ///
    /// Progression is decided by the controller; the mirror lets the
    /// crossfade match the standby slot to the active one.
    pub fn set_loop_mode(&mut self, loop_mode: LoopMode) {
        self.loop_mode = loop_mode;
    }

    /// Mirrored loop mode.
    #[must_use]
    pub fn loop_mode(&self) -> LoopMode {
        self.loop_mode
    }

    /// Slot label for logging.
    #[must_use]
    pub fn label(&self) -> &'static str {
        self.label
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn volume_curve_is_monotonic() {
        let mut last = -1.0f32;
        for step in 0..=100 {
            #[expect(clippy::cast_precision_loss)]
            let volume = step as f32 / 100.0;
            let amplitude = PlayerHandle::scaled_amplitude(volume);
            assert!(amplitude >= last, "curve dipped at {volume}");
            last = amplitude;
        }
    }

    #[test]
    fn volume_curve_endpoints() {
        assert_eq!(PlayerHandle::scaled_amplitude(0.0), 0.0);
        assert_eq!(PlayerHandle::scaled_amplitude(1.0), 1.0);
    }
}
