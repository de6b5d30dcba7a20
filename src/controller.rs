//! Playback controller: the public facade over the whole engine.
//!
//! The controller owns the queue, the dual-player engine, the resolver,
//! the byte cache, the precache scheduler, the radio extender and the
//! queue persistor, and exposes three observation points:
//!
//! * [`PlaybackController::state_stream`] - coarse state snapshots,
//!   emitted only when the position-excluded equality of
//!   [`PlaybackState`] changes
//! * [`PlaybackController::position_stream`] - the raw playhead at tick
//!   rate
//! * [`PlaybackController::events`] - discrete notifications, including
//!   the completion events an external controller consumes in Jams mode
//!
//! # Concurrency
//!
//! Single writer, many readers. Commands and the tick loop serialize all
//! state mutations through two mutexes, always taken in the order
//! `core -> engine`. The crossfade ramp runs as a short-lived task that
//! locks the engine only between sleeps, so commands stay responsive
//! while a fade is in flight.
//!
//! # Lifecycle
//!
//! Construct with [`PlaybackController::new`], then [`start`] after the
//! settings are loaded; [`shutdown`] stops both players, flushes
//! persistence and drains the precache workers. There is no global
//! instance: the embedding application owns the controller and passes it
//! where needed.
//!
//! [`start`]: PlaybackController::start
//! [`shutdown`]: PlaybackController::shutdown

use std::{sync::Arc, time::Duration};

use tokio::sync::{broadcast, watch, Mutex};
use tokio_util::sync::CancellationToken;

use crate::{
    cache::ByteCache,
    config::{Config, Settings},
    downloader::Downloader,
    engine::{self, DualPlayerEngine},
    error::{Error, ErrorKind, Result},
    events::Event,
    http,
    library::DownloadManager,
    persist::{PeriodicGate, QueuePersistor, StateStore},
    precache::{NetworkMonitor, PrecacheScheduler},
    queue::{PreviousAction, QueueModel},
    radio::{RadioExtender, RelatedSource},
    resolver::{FormatSource, StreamResolver},
    source::SourceBuilder,
    state::{PlayPhase, PlaybackState},
    track::{AudioQuality, LoopMode, PlaybackData, Track, TrackId},
};

/// Tick interval of the controller loop.
const TICK_INTERVAL: Duration = Duration::from_millis(100);

/// Minimum interval between state-level position refreshes.
const POSITION_STATE_INTERVAL: Duration = Duration::from_millis(500);

/// Floor of the crossfade trigger window.
const FADE_TRIGGER_FLOOR: Duration = Duration::from_millis(300);

/// Slack added to the crossfade length for the trigger window.
const FADE_TRIGGER_SLACK: Duration = Duration::from_millis(120);

/// Delay before the post-install warm-up (precache + radio pre-warm).
const WARMUP_DELAY: Duration = Duration::from_millis(500);

/// Interval of the cache limit janitor.
const JANITOR_INTERVAL: Duration = Duration::from_secs(3 * 60);

/// Mutable controller state guarded by the core mutex.
struct Core {
    queue: QueueModel,
    radio: RadioExtender,
    settings: Settings,
    phase: PlayPhase,
    speed: f32,
    jams_mode: bool,
    radio_mode: bool,
    fetching_radio: bool,
    pending_seek: Option<(TrackId, Duration)>,
    current_data: Option<PlaybackData>,
    error: Option<String>,
    periodic_gate: PeriodicGate,
    position_state_at: Option<tokio::time::Instant>,

    /// Track whose duration was already fixed from the decoder, so the
    /// fix-up runs once per track.
    duration_fixed_for: Option<TrackId>,

    /// Playhead sample of the previous tick, for starvation detection.
    last_tick_position: Option<Duration>,
}

/// The public playback facade.
///
/// Cheap to share as an [`Arc`]; every method takes `&self`.
pub struct PlaybackController {
    config: Config,
    core: Mutex<Core>,
    engine: Arc<Mutex<DualPlayerEngine>>,
    resolver: Arc<StreamResolver>,
    cache: Arc<ByteCache>,
    precache: Arc<PrecacheScheduler>,
    sources: Arc<SourceBuilder>,
    persistor: Arc<QueuePersistor>,
    downloads: Arc<DownloadManager>,
    network: Arc<dyn NetworkMonitor>,

    state_tx: watch::Sender<PlaybackState>,
    position_tx: watch::Sender<Duration>,
    events_tx: broadcast::Sender<Event>,

    shutdown: CancellationToken,
}

impl PlaybackController {
    /// Constructs the controller and its collaborators.
    ///
    /// `format_source`, `related_source`, `network` and `store` are the
    /// external contracts the embedding application provides.
    ///
    /// # Errors
    ///
    /// Returns error if the HTTP client, the cache directory or the audio
    /// device cannot be set up.
    pub async fn new(
        config: Config,
        settings: Settings,
        format_source: Arc<dyn FormatSource>,
        related_source: Arc<dyn RelatedSource>,
        network: Arc<dyn NetworkMonitor>,
        store: Arc<dyn StateStore>,
    ) -> Result<Arc<Self>> {
        let settings = settings.clamped();

        let client = Arc::new(http::Client::new()?);
        let resolver = Arc::new(StreamResolver::new(format_source));
        let cache = Arc::new(ByteCache::open(&config.cache_dir).await?);
        let downloader = Downloader::new(Arc::clone(&client));
        let precache = Arc::new(PrecacheScheduler::new(
            Arc::clone(&resolver),
            Arc::clone(&cache),
            downloader.clone(),
            Arc::clone(&network),
            settings.stream_cache_max_concurrent,
        ));
        let sources = Arc::new(SourceBuilder::new(
            Arc::clone(&resolver),
            Arc::clone(&cache),
            Arc::clone(&client),
        ));
        let persistor = Arc::new(QueuePersistor::new(Arc::clone(&store)));
        let downloads = Arc::new(DownloadManager::new(
            Arc::clone(&resolver),
            downloader,
            Arc::clone(&client),
            store,
            config.library_dir.clone(),
        ));

        let engine = Arc::new(Mutex::new(DualPlayerEngine::new(&config.device)?));

        let (state_tx, _) = watch::channel(PlaybackState::initial(&settings));
        let (position_tx, _) = watch::channel(Duration::ZERO);
        let (events_tx, _) = broadcast::channel(32);

        Ok(Arc::new(Self {
            config,
            core: Mutex::new(Core {
                queue: QueueModel::default(),
                radio: RadioExtender::new(related_source),
                settings,
                phase: PlayPhase::Idle,
                speed: 1.0,
                jams_mode: false,
                radio_mode: false,
                fetching_radio: false,
                pending_seek: None,
                current_data: None,
                error: None,
                periodic_gate: PeriodicGate::default(),
                position_state_at: None,
                duration_fixed_for: None,
                last_tick_position: None,
            }),
            engine,
            resolver,
            cache,
            precache,
            sources,
            persistor,
            downloads,
            network,
            state_tx,
            position_tx,
            events_tx,
            shutdown: CancellationToken::new(),
        }))
    }

    /// Opens the audio device, restores persisted state and starts the
    /// tick loop.
    ///
    /// # Errors
    ///
    /// Returns error if the audio device cannot be opened.
    pub async fn start(self: &Arc<Self>) -> Result<()> {
        self.engine.lock().await.start()?;

        if let Err(e) = self.downloads.restore().await {
            warn!("download index restore failed: {e}");
        }

        // Restore the queue within its TTL; the seek applies once the
        // restored track reports ready.
        match self.persistor.load().await {
            Ok(Some(restored)) => {
                let mut core = self.core.lock().await;
                core.queue
                    .install(restored.queue, restored.current_index, None);
                if let Some(track) = core.queue.current_track() {
                    info!("restored queue at {track}, position {:?}", restored.position);
                    let track_id = track.id.clone();
                    let duration_is_zero = track.duration.is_zero();
                    core.pending_seek = Some((track_id, restored.position));

                    // One-shot duration fix-up for legacy snapshots that
                    // predate authoritative durations.
                    if duration_is_zero {
                        self.spawn_duration_migration();
                    }
                }
                self.position_tx.send_replace(restored.position);
                self.emit_state(&mut core, restored.position, Duration::ZERO, None)
                    .await;
            }
            Ok(None) => {}
            Err(e) => warn!("queue restore failed: {e}"),
        }

        self.spawn_tick_loop();
        self.spawn_janitor();
        Ok(())
    }

    /// Stops both players, flushes persistence and drains workers.
    pub async fn shutdown(self: &Arc<Self>) {
        self.shutdown.cancel();
        self.precache.shutdown();
        self.persistor.cancel_pending();

        let (queue, index, position) = {
            let core = self.core.lock().await;
            let position = *self.position_tx.borrow();
            (
                core.queue.tracks().to_vec(),
                core.queue.current_index(),
                position,
            )
        };
        if let Err(e) = self.persistor.save(&queue, index, position).await {
            error!("final queue save failed: {e}");
        }

        let mut engine = self.engine.lock().await;
        engine.stop_all();
        engine.shutdown();
        info!("playback controller shut down");
    }

    /// Coarse state snapshots; see [`PlaybackState`] for the equality
    /// semantics.
    #[must_use]
    pub fn state_stream(&self) -> watch::Receiver<PlaybackState> {
        self.state_tx.subscribe()
    }

    /// Raw playhead position at tick rate.
    #[must_use]
    pub fn position_stream(&self) -> watch::Receiver<Duration> {
        self.position_tx.subscribe()
    }

    /// Discrete notifications, including track completions.
    #[must_use]
    pub fn events(&self) -> broadcast::Receiver<Event> {
        self.events_tx.subscribe()
    }

    /// Offline library downloads.
    #[must_use]
    pub fn downloads(&self) -> &Arc<DownloadManager> {
        &self.downloads
    }

    /// Current settings snapshot.
    pub async fn settings(&self) -> Settings {
        self.core.lock().await.settings.clone()
    }

    // ----- queue commands ---------------------------------------------

    /// Plays a single track, starting a radio session when `radio` is on.
    ///
    /// # Errors
    ///
    /// Returns error for backend failures; resolve failures surface on
    /// `state.error` instead.
    pub async fn play_track(self: &Arc<Self>, track: Track, radio: bool) -> Result<()> {
        {
            let mut core = self.core.lock().await;
            core.queue.install(vec![track.clone()], 0, None);
            core.radio_mode = radio;
            core.radio.reset(&track);
            core.error = None;
            self.load_and_play_current(&mut core).await?;
        }

        self.spawn_warmup();
        Ok(())
    }

    /// Installs a queue and starts playback at `start_index`.
    ///
    /// Radio mode engages only for a singleton queue that is not itself a
    /// radio batch.
    ///
    /// # Errors
    ///
    /// Returns error for backend failures.
    pub async fn play_queue(
        self: &Arc<Self>,
        tracks: Vec<Track>,
        start_index: usize,
        source_id: Option<String>,
        is_radio_queue: bool,
    ) -> Result<()> {
        {
            let mut core = self.core.lock().await;
            core.radio_mode = tracks.len() == 1 && !is_radio_queue;
            core.queue.install(tracks, start_index, source_id);
            if let Some(track) = core.queue.current_track().cloned() {
                if core.radio_mode {
                    core.radio.reset(&track);
                }
            }
            core.error = None;
            self.load_and_play_current(&mut core).await?;
        }

        self.spawn_warmup();
        Ok(())
    }

    /// Appends tracks to the queue.
    pub async fn add_to_queue(self: &Arc<Self>, tracks: Vec<Track>) {
        let mut core = self.core.lock().await;
        core.queue.append(tracks);
        self.after_queue_mutation(&mut core).await;
    }

    /// Inserts a track right after the current one.
    pub async fn play_next(self: &Arc<Self>, track: Track) {
        let mut core = self.core.lock().await;
        core.queue.insert_next(track);
        self.after_queue_mutation(&mut core).await;
    }

    /// Removes the track at `index`.
    pub async fn remove_from_queue(self: &Arc<Self>, index: usize) {
        let mut core = self.core.lock().await;
        core.queue.remove_at(index);
        self.after_queue_mutation(&mut core).await;
    }

    /// Moves a track to a new position.
    pub async fn reorder_queue(self: &Arc<Self>, old_index: usize, new_index: usize) {
        let mut core = self.core.lock().await;
        core.queue.reorder(old_index, new_index);
        self.after_queue_mutation(&mut core).await;
    }

    /// Jumps to a queue index and plays it.
    ///
    /// # Errors
    ///
    /// Returns error for backend failures.
    pub async fn skip_to_index(self: &Arc<Self>, index: usize) -> Result<()> {
        let mut core = self.core.lock().await;
        if !core.queue.skip_to(index) {
            return Ok(());
        }
        core.error = None;
        self.load_and_play_current(&mut core).await
    }

    /// Clears the queue and stops playback.
    pub async fn clear_queue(self: &Arc<Self>) {
        let mut core = self.core.lock().await;
        core.queue.clear();
        core.current_data = None;
        core.phase = PlayPhase::Idle;
        self.engine.lock().await.stop_all();
        self.after_queue_mutation(&mut core).await;
    }

    // ----- transport commands -----------------------------------------

    /// Starts or resumes playback.
    ///
    /// With no source attached, loads the current track first. With
    /// expired stream data, re-resolves and reloads before playing.
    ///
    /// # Errors
    ///
    /// Returns error for backend failures.
    pub async fn play(self: &Arc<Self>) -> Result<()> {
        let mut core = self.core.lock().await;

        let needs_load = {
            let engine = self.engine.lock().await;
            !engine.active().has_source()
        };
        let expired = core
            .current_data
            .as_ref()
            .is_some_and(|data| !data.is_fresh());

        if needs_load || expired {
            if expired {
                debug!("stream data expired, re-resolving before play");
                if let Some(track) = core.queue.current_track() {
                    self.resolver.clear(&track.id);
                }
            }
            return self.load_and_play_current(&mut core).await;
        }

        {
            let mut engine = self.engine.lock().await;
            engine.active_mut().play();
        }
        core.phase = PlayPhase::Playing;
        core.error = None;
        self.notify(Event::Play);
        self.emit_current_state(&mut core).await;
        Ok(())
    }

    /// Pauses playback and saves the queue synchronously.
    pub async fn pause(self: &Arc<Self>) {
        let mut core = self.core.lock().await;
        {
            let mut engine = self.engine.lock().await;
            engine.active_mut().pause();
        }
        if core.phase == PlayPhase::Playing {
            core.phase = PlayPhase::Paused;
        }
        self.notify(Event::Pause);

        let position = *self.position_tx.borrow();
        if let Err(e) = self
            .persistor
            .save(core.queue.tracks(), core.queue.current_index(), position)
            .await
        {
            error!("pause-time queue save failed: {e}");
        }
        self.emit_current_state(&mut core).await;
    }

    /// Stops both players and saves the queue synchronously.
    pub async fn stop(self: &Arc<Self>) {
        let mut core = self.core.lock().await;
        self.engine.lock().await.stop_all();
        core.phase = PlayPhase::Idle;
        core.current_data = None;
        self.notify(Event::Pause);

        let position = *self.position_tx.borrow();
        if let Err(e) = self
            .persistor
            .save(core.queue.tracks(), core.queue.current_index(), position)
            .await
        {
            error!("stop-time queue save failed: {e}");
        }
        self.position_tx.send_replace(Duration::ZERO);
        self.emit_state(&mut core, Duration::ZERO, Duration::ZERO, None)
            .await;
    }

    /// Seeks within the current track.
    ///
    /// While loading, the seek is stored and applied once the matching
    /// track reports ready.
    ///
    /// # Errors
    ///
    /// Returns error for backend seek failures.
    pub async fn seek(self: &Arc<Self>, position: Duration) -> Result<()> {
        let mut core = self.core.lock().await;

        if core.phase == PlayPhase::Loading {
            if let Some(track) = core.queue.current_track() {
                core.pending_seek = Some((track.id.clone(), position));
            }
            return Ok(());
        }

        let mut engine = self.engine.lock().await;
        if !engine.active().has_source() {
            debug!("seek skipped: {}", StateError::NoSource);
            return Ok(());
        }
        engine.active_mut().seek(position)?;
        drop(engine);

        self.position_tx.send_replace(position);
        Ok(())
    }

    /// Seeks relative to the current position.
    ///
    /// # Errors
    ///
    /// Returns error for backend seek failures.
    pub async fn seek_by(self: &Arc<Self>, delta_ms: i64) -> Result<()> {
        let position = *self.position_tx.borrow();
        let target = if delta_ms >= 0 {
            position + Duration::from_millis(delta_ms.unsigned_abs())
        } else {
            position.saturating_sub(Duration::from_millis(delta_ms.unsigned_abs()))
        };
        self.seek(target).await
    }

    /// Advances to the next track.
    ///
    /// In Jams mode only a completion event is emitted; the external
    /// controller decides what happens. In radio mode a near-empty queue
    /// is extended before the skip target is computed.
    ///
    /// # Errors
    ///
    /// Returns error for backend failures.
    pub async fn skip_to_next(self: &Arc<Self>) -> Result<()> {
        let mut core = self.core.lock().await;

        if core.jams_mode {
            self.notify(Event::TrackComplete);
            return Ok(());
        }

        if core.queue.next_index().is_none() && core.radio_mode {
            self.extend_radio(&mut core).await;
        }

        let Some(target) = core.queue.next_index() else {
            return Ok(());
        };

        let crossfade_ms = core.settings.crossfade_duration_ms;
        if crossfade_ms > 0 && core.queue.loop_mode() != LoopMode::One {
            self.crossfade_to(&mut core, target, crossfade_ms).await
        } else {
            core.queue.skip_to(target);
            self.load_and_play_current(&mut core).await
        }
    }

    /// Goes back to the previous track, or restarts the current one when
    /// more than three seconds have played.
    ///
    /// # Errors
    ///
    /// Returns error for backend failures.
    pub async fn skip_to_previous(self: &Arc<Self>) -> Result<()> {
        let mut core = self.core.lock().await;

        if core.jams_mode {
            self.notify(Event::TrackComplete);
            return Ok(());
        }

        let position = *self.position_tx.borrow();
        match core.queue.previous_action(position) {
            PreviousAction::RestartCurrent => {
                let mut engine = self.engine.lock().await;
                if engine.active().has_source() {
                    engine.active_mut().seek(Duration::ZERO)?;
                }
                drop(engine);
                self.position_tx.send_replace(Duration::ZERO);
                Ok(())
            }
            PreviousAction::SkipTo(index) => {
                core.queue.skip_to(index);
                self.load_and_play_current(&mut core).await
            }
            PreviousAction::None => Ok(()),
        }
    }

    // ----- mode and setting commands ----------------------------------

    /// Sets the loop mode, mirrored to both player slots.
    pub async fn set_loop_mode(self: &Arc<Self>, loop_mode: LoopMode) {
        let mut core = self.core.lock().await;
        core.queue.set_loop_mode(loop_mode);
        self.engine
            .lock()
            .await
            .for_both(|player| player.set_loop_mode(loop_mode));
        self.after_queue_mutation(&mut core).await;
    }

    /// Toggles shuffle, keeping the current track playing.
    pub async fn toggle_shuffle(self: &Arc<Self>) {
        let mut core = self.core.lock().await;
        if core.queue.shuffle_enabled() {
            core.queue.disable_shuffle();
        } else {
            core.queue.enable_shuffle();
        }
        self.after_queue_mutation(&mut core).await;
    }

    /// Sets the playback speed on both player slots.
    pub async fn set_speed(self: &Arc<Self>, speed: f32) {
        let speed = speed.clamp(0.25, 3.0);
        let mut core = self.core.lock().await;
        core.speed = speed;
        self.engine
            .lock()
            .await
            .for_both(|player| player.set_speed(speed));
        self.emit_current_state(&mut core).await;
    }

    /// Switches the streaming quality.
    ///
    /// Invalidates both the URL cache and the byte cache - cached
    /// entries describe the previous quality - and reschedules the
    /// precache.
    pub async fn set_audio_quality(self: &Arc<Self>, quality: AudioQuality) {
        let mut core = self.core.lock().await;
        core.settings.streaming_quality = quality;
        if let Err(e) = core.settings.save(&self.config.state_dir) {
            error!("settings save failed: {e}");
        }

        self.resolver.clear_all();
        if let Err(e) = self.cache.enforce_limit(0).await {
            error!("cache clear failed: {e}");
        }

        self.schedule_precache(&core);
        self.emit_current_state(&mut core).await;
    }

    /// Applies a new settings snapshot.
    pub async fn update_settings(self: &Arc<Self>, settings: Settings) {
        let settings = settings.clamped();
        let mut core = self.core.lock().await;
        let quality_changed = core.settings.streaming_quality != settings.streaming_quality;
        core.settings = settings;

        if let Err(e) = core.settings.save(&self.config.state_dir) {
            error!("settings save failed: {e}");
        }
        self.precache
            .set_max_concurrent(core.settings.stream_cache_max_concurrent);

        if quality_changed {
            self.resolver.clear_all();
            if let Err(e) = self.cache.enforce_limit(0).await {
                error!("cache clear failed: {e}");
            }
        }

        self.schedule_precache(&core);
        self.emit_current_state(&mut core).await;
    }

    /// Enables or disables Jams mode.
    ///
    /// While enabled the controller never auto-advances: completions only
    /// emit [`Event::TrackComplete`]. Crossfades are disabled and the
    /// standby slot is cleared so completion events fire reliably.
    pub async fn set_jams_mode(self: &Arc<Self>, enabled: bool) {
        let mut core = self.core.lock().await;
        core.jams_mode = enabled;
        if enabled {
            self.engine.lock().await.standby_mut().stop();
        }
        self.emit_current_state(&mut core).await;
    }

    // ----- internals --------------------------------------------------

    /// Loads the current queue track into the active slot and plays it.
    ///
    /// Resolve and decode failures surface on `state.error` and leave the
    /// controller recoverable; only backend failures propagate.
    async fn load_and_play_current(self: &Arc<Self>, core: &mut Core) -> Result<()> {
        let Some(track) = core.queue.current_track().cloned() else {
            // Silent no-op, like an out-of-range skip.
            debug!("load skipped: {}", StateError::QueueEmpty);
            core.phase = PlayPhase::Idle;
            self.emit_current_state(core).await;
            return Ok(());
        };

        core.phase = PlayPhase::Loading;
        core.duration_fixed_for = None;
        self.emit_current_state(core).await;

        let metered = !self.network.is_unmetered();
        let built = match self
            .sources
            .build(&track, core.settings.streaming_quality, metered)
            .await
        {
            Ok(built) => built,
            Err(e) => {
                error!("failed to build source for {track}: {e}");
                core.phase = PlayPhase::Error;
                core.error = Some(e.to_string());
                self.emit_current_state(core).await;
                return Ok(());
            }
        };

        self.resolver.reset_client_failures();
        core.current_data = built.playback_data.clone();
        let precache_wanted = built.precache_wanted;

        {
            let mut engine = self.engine.lock().await;
            if let Err(e) = engine.hard_switch(built.reader) {
                error!("failed to attach source for {track}: {e}");
                core.phase = PlayPhase::Error;
                core.error = Some(e.to_string());
                self.emit_current_state(core).await;
                return Ok(());
            }

            if let Some((id, position)) = core.pending_seek.clone() {
                if id == track.id {
                    engine.active_mut().seek(position)?;
                    core.pending_seek = None;
                }
            }

            engine.active_mut().set_speed(core.speed);
            engine.active_mut().play();
        }

        core.phase = PlayPhase::Playing;
        core.error = None;
        self.notify(Event::TrackChanged);
        self.notify(Event::Play);
        self.emit_current_state(core).await;

        if precache_wanted {
            self.schedule_precache(core);
        }
        self.prefetch_upcoming(core);
        self.schedule_debounced_save(core);
        Ok(())
    }

    /// Crossfades to a queue index.
    ///
    /// Phase one (preload, swap, queue update) happens here under both
    /// locks; the ramp runs as a detached task so commands stay
    /// responsive during the overlap.
    async fn crossfade_to(
        self: &Arc<Self>,
        core: &mut Core,
        target: usize,
        crossfade_ms: u32,
    ) -> Result<()> {
        let Some(track) = core.queue.track_at(target).cloned() else {
            return Ok(());
        };

        let metered = !self.network.is_unmetered();
        let built = match self
            .sources
            .build(&track, core.settings.streaming_quality, metered)
            .await
        {
            Ok(built) => built,
            Err(e) => {
                warn!("crossfade source build failed for {track}, hard switching: {e}");
                core.queue.skip_to(target);
                return self.load_and_play_current(core).await;
            }
        };

        core.current_data = built.playback_data.clone();
        {
            let mut engine = self.engine.lock().await;
            if let Err(e) = engine.begin_crossfade(built.reader) {
                error!("crossfade preload failed for {track}: {e}");
                core.queue.skip_to(target);
                return self.load_and_play_current(core).await;
            }
        }

        // The queue index and the emitted state refer to the same
        // revision: both happen before the emit below.
        core.queue.skip_to(target);
        core.phase = PlayPhase::Playing;
        core.duration_fixed_for = None;
        self.notify(Event::TrackChanged);
        self.emit_current_state(core).await;

        self.spawn_fade_task(crossfade_ms);
        self.schedule_precache(core);
        self.prefetch_upcoming(core);
        self.schedule_debounced_save(core);
        Ok(())
    }

    /// Detached crossfade ramp task.
    ///
    /// Locks the engine only between sleeps; the swap already happened in
    /// phase one.
    fn spawn_fade_task(self: &Arc<Self>, crossfade_ms: u32) {
        let engine = Arc::clone(&self.engine);
        let shutdown = self.shutdown.clone();

        tokio::spawn(async move {
            engine.lock().await.play_incoming();
            tokio::time::sleep(engine::WARMUP_PAUSE).await;

            let step_duration = engine::ramp_step_duration(crossfade_ms);
            for step in 1..=engine::RAMP_STEPS {
                if shutdown.is_cancelled() {
                    return;
                }
                engine.lock().await.apply_fade_step(step);
                tokio::time::sleep(step_duration).await;
            }

            engine.lock().await.settle_outgoing();

            let mut last = Duration::ZERO;
            for at in engine::SETTLE_SCHEDULE {
                tokio::time::sleep(at.saturating_sub(last)).await;
                last = at;
                if engine.lock().await.reassert_incoming() {
                    break;
                }
            }
            engine.lock().await.end_crossfade();
        });
    }

    /// Controller tick loop: positions, completions, fade triggers,
    /// radio checks and periodic persistence.
    fn spawn_tick_loop(self: &Arc<Self>) {
        let controller = Arc::clone(self);
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(TICK_INTERVAL);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    () = controller.shutdown.cancelled() => break,
                    _ = interval.tick() => {}
                }
                controller.tick().await;
            }
        });
    }

    /// One controller tick.
    async fn tick(self: &Arc<Self>) {
        let mut core = self.core.lock().await;

        let (completed, position, buffered, duration, crossfading, has_source) = {
            let mut engine = self.engine.lock().await;
            if !engine.is_started() {
                return;
            }

            engine.active_mut().retry_deferred_seek();

            // Apply a pending seek once the matching track is attached.
            if let Some((id, position)) = core.pending_seek.clone() {
                if engine.active().track_id() == Some(id.as_str())
                    && engine.active().has_source()
                {
                    if engine.active_mut().seek(position).is_ok() {
                        core.pending_seek = None;
                    }
                }
            }

            engine.assert_active_volume();

            let completed = engine.active_mut().poll_completed();
            (
                completed,
                engine.active().position(),
                engine.active().buffered_position(),
                engine.active().duration(),
                engine.is_crossfading(),
                engine.active().has_source(),
            )
        };

        // Raw position stream at tick rate. Ticks from the non-active
        // slot never reach here: only the active slot was sampled.
        if has_source || completed {
            self.position_tx.send_replace(position);
        }

        self.fixup_duration(&mut core, duration);

        // Starvation detection: a playing source whose playhead stopped
        // moving is buffering, not playing.
        if has_source
            && !completed
            && !crossfading
            && matches!(core.phase, PlayPhase::Playing | PlayPhase::Buffering)
        {
            core.phase = if core.last_tick_position == Some(position) {
                PlayPhase::Buffering
            } else {
                PlayPhase::Playing
            };
        }
        core.last_tick_position = Some(position);

        if completed {
            self.on_completed(&mut core).await;
        } else if has_source && core.phase == PlayPhase::Playing {
            self.maybe_trigger_fade(&mut core, position, duration, crossfading)
                .await;
        }

        // Radio keeps the tail topped up while ticking through the queue.
        if core.radio_mode && !core.fetching_radio && core.radio.should_extend(&core.queue) {
            self.extend_radio(&mut core).await;
        }

        // Periodic persistence while playing.
        if core.phase == PlayPhase::Playing && core.periodic_gate.should_save(position) {
            let queue = core.queue.tracks().to_vec();
            let index = core.queue.current_index();
            let persistor = Arc::clone(&self.persistor);
            tokio::spawn(async move {
                if let Err(e) = persistor.save(&queue, index, position).await {
                    error!("periodic queue save failed: {e}");
                }
            });
        }

        // State-level position refresh, throttled; the watch value is
        // updated in place without notifying (equality excludes it).
        let now = tokio::time::Instant::now();
        let refresh_due = core
            .position_state_at
            .is_none_or(|last| now.duration_since(last) >= POSITION_STATE_INTERVAL);
        if refresh_due {
            core.position_state_at = Some(now);
            self.emit_state(&mut core, position, buffered, duration).await;
        }
    }

    /// Applies the decoder's authoritative duration to the queue, once
    /// per track.
    fn fixup_duration(&self, core: &mut Core, duration: Option<Duration>) {
        let Some(duration) = duration else { return };
        let Some(track) = core.queue.current_track() else {
            return;
        };

        if core.duration_fixed_for.as_deref() == Some(track.id.as_str()) {
            return;
        }
        if track.duration == duration {
            core.duration_fixed_for = Some(track.id.clone());
            return;
        }

        debug!(
            "updating duration of {track} from {:?} to {duration:?}",
            track.duration
        );
        let fixed = track.with_duration(duration);
        core.duration_fixed_for = Some(fixed.id.clone());
        core.queue.update_track(&fixed);
        self.schedule_debounced_save(core);
    }

    /// Handles a completion of the active slot.
    async fn on_completed(self: &Arc<Self>, core: &mut Core) {
        self.notify(Event::TrackComplete);

        if core.jams_mode {
            // The external controller decides what plays next.
            core.phase = PlayPhase::Completed;
            self.emit_current_state(core).await;
            return;
        }

        if core.queue.loop_mode() == LoopMode::One {
            if let Err(e) = self.load_and_play_current(core).await {
                error!("loop-one reload failed: {e}");
            }
            return;
        }

        if core.queue.next_index().is_none() && core.radio_mode {
            self.extend_radio(core).await;
        }

        match core.queue.next_index() {
            Some(next) => {
                core.queue.skip_to(next);
                if let Err(e) = self.load_and_play_current(core).await {
                    error!("auto-advance failed: {e}");
                }
            }
            None => {
                core.phase = PlayPhase::Completed;
                self.emit_current_state(core).await;
            }
        }
    }

    /// Fires the crossfade when the trigger window opens.
    async fn maybe_trigger_fade(
        self: &Arc<Self>,
        core: &mut Core,
        position: Duration,
        duration: Option<Duration>,
        crossfading: bool,
    ) {
        let crossfade_ms = core.settings.crossfade_duration_ms;
        if crossfade_ms == 0
            || crossfading
            || core.jams_mode
            || core.queue.loop_mode() == LoopMode::One
        {
            return;
        }
        let Some(duration) = duration else { return };
        let Some(target) = core.queue.next_index() else {
            return;
        };

        let window = FADE_TRIGGER_FLOOR
            .max(Duration::from_millis(u64::from(crossfade_ms)) + FADE_TRIGGER_SLACK);
        let remaining = duration.saturating_sub(position);
        if remaining > window {
            return;
        }

        // One fade per track: the latch resets on each source change.
        if !self.engine.lock().await.latch_fade() {
            return;
        }

        debug!("crossfade window open ({remaining:?} remaining)");
        if let Err(e) = self.crossfade_to(core, target, crossfade_ms).await {
            error!("crossfade failed: {e}");
        }
    }

    /// Runs a radio extension, updating the fetching flag around it.
    async fn extend_radio(self: &Arc<Self>, core: &mut Core) {
        core.fetching_radio = true;
        self.emit_current_state(core).await;

        let appended = {
            let Core { radio, queue, .. } = core;
            radio.extend(queue).await
        };
        match appended {
            Ok(0) => {}
            Ok(_) => {
                self.notify(Event::RadioExtended);
                self.schedule_precache(core);
                self.prefetch_upcoming(core);
                self.schedule_debounced_save(core);
            }
            Err(e) => warn!("radio extension failed: {e}"),
        }

        core.fetching_radio = false;
        self.emit_current_state(core).await;
    }

    /// Common tail of every queue mutation: persistence, precache and a
    /// state emission.
    async fn after_queue_mutation(self: &Arc<Self>, core: &mut Core) {
        self.schedule_debounced_save(core);
        self.schedule_precache(core);
        self.prefetch_upcoming(core);
        self.emit_current_state(core).await;
    }

    /// Hands the upcoming queue slice to the precache scheduler.
    fn schedule_precache(&self, core: &Core) {
        let Some(current) = core.queue.current_index() else {
            return;
        };
        let upcoming: Vec<Track> = core
            .queue
            .tracks()
            .iter()
            .skip(current + 1)
            .cloned()
            .collect();
        self.precache.schedule_ahead(&upcoming, &core.settings);
    }

    /// Warms the resolver's URL cache for the next few tracks.
    fn prefetch_upcoming(&self, core: &Core) {
        let Some(current) = core.queue.current_index() else {
            return;
        };
        let ids: Vec<TrackId> = core
            .queue
            .tracks()
            .iter()
            .skip(current + 1)
            .take(3)
            .map(|track| track.id.clone())
            .collect();
        if !ids.is_empty() {
            self.resolver.prefetch(
                ids,
                core.settings.streaming_quality,
                !self.network.is_unmetered(),
            );
        }
    }

    /// Schedules the debounced queue save.
    fn schedule_debounced_save(&self, core: &Core) {
        self.persistor.schedule_debounced(
            core.queue.tracks().to_vec(),
            core.queue.current_index(),
            *self.position_tx.borrow(),
        );
    }

    /// Post-install warm-up: precache and radio pre-warm after 500 ms.
    fn spawn_warmup(self: &Arc<Self>) {
        let controller = Arc::clone(self);
        tokio::spawn(async move {
            tokio::time::sleep(WARMUP_DELAY).await;
            if controller.shutdown.is_cancelled() {
                return;
            }

            let mut core = controller.core.lock().await;
            controller.schedule_precache(&core);
            controller.prefetch_upcoming(&core);

            // A freshly started radio with one or two tracks should not
            // wait for the tail threshold.
            if core.radio_mode && !core.fetching_radio && core.queue.len() <= 2 {
                controller.extend_radio(&mut core).await;
            }
        });
    }

    /// One-shot duration migration for restored legacy snapshots.
    ///
    /// Waits until the player reports the real duration of the restored
    /// track, persists the corrected queue and flips the guard flag so
    /// the migration runs at most once per install.
    fn spawn_duration_migration(self: &Arc<Self>) {
        let controller = Arc::clone(self);
        tokio::spawn(async move {
            match controller.persistor.needs_duration_migration().await {
                Ok(true) => {}
                _ => return,
            }

            let mut state = controller.state_stream();
            loop {
                tokio::select! {
                    () = controller.shutdown.cancelled() => return,
                    changed = state.changed() => {
                        if changed.is_err() {
                            return;
                        }
                    }
                }

                let has_duration = state
                    .borrow()
                    .current_track
                    .as_ref()
                    .is_some_and(|track| !track.duration.is_zero());
                if has_duration {
                    break;
                }
            }

            let core = controller.core.lock().await;
            let queue = core.queue.tracks().to_vec();
            let index = core.queue.current_index();
            drop(core);

            let position = *controller.position_tx.borrow();
            if let Err(e) = controller.persistor.save(&queue, index, position).await {
                error!("duration migration save failed: {e}");
                return;
            }
            if let Err(e) = controller.persistor.mark_duration_migrated().await {
                error!("duration migration flag failed: {e}");
            } else {
                info!("duration migration completed");
            }
        });
    }

    /// Cache janitor: periodic limit enforcement.
    fn spawn_janitor(self: &Arc<Self>) {
        let controller = Arc::clone(self);
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(JANITOR_INTERVAL);
            interval.tick().await;
            loop {
                tokio::select! {
                    () = controller.shutdown.cancelled() => break,
                    _ = interval.tick() => {}
                }

                let limit = {
                    let core = controller.core.lock().await;
                    core.settings.stream_cache_limit_bytes()
                };
                if let Err(e) = controller.cache.enforce_limit(limit).await {
                    warn!("cache limit enforcement failed: {e}");
                }
            }
        });
    }

    /// Emits the current state using the engine's live playhead.
    async fn emit_current_state(&self, core: &mut Core) {
        let (position, buffered, duration) = {
            let engine = self.engine.lock().await;
            if engine.is_started() {
                (
                    engine.active().position(),
                    engine.active().buffered_position(),
                    engine.active().duration(),
                )
            } else {
                (Duration::ZERO, Duration::ZERO, None)
            }
        };
        self.emit_state(core, position, buffered, duration).await;
    }

    /// Builds and publishes a state snapshot.
    ///
    /// The watch only notifies when the position-excluded equality
    /// changed; the playhead fields are refreshed in place either way.
    async fn emit_state(
        &self,
        core: &mut Core,
        position: Duration,
        buffered: Duration,
        duration: Option<Duration>,
    ) {
        let state = PlaybackState {
            current_track: core.queue.current_track().cloned(),
            queue: core.queue.tracks().to_vec(),
            queue_revision: core.queue.revision(),
            current_index: core.queue.current_index(),
            is_playing: core.phase == PlayPhase::Playing,
            is_buffering: core.phase == PlayPhase::Buffering,
            is_loading: core.phase == PlayPhase::Loading,
            position,
            buffered_position: buffered,
            duration: duration.or_else(|| {
                core.queue
                    .current_track()
                    .map(|track| track.duration)
                    .filter(|duration| !duration.is_zero())
            }),
            speed: core.speed,
            loop_mode: core.queue.loop_mode(),
            shuffle_enabled: core.queue.shuffle_enabled(),
            error: core.error.clone(),
            audio_quality: core.settings.streaming_quality,
            current_playback_data: core.current_data.clone(),
            source_id: core.queue.source_id().map(ToOwned::to_owned),
            is_radio_mode: core.radio_mode,
            is_fetching_radio: core.fetching_radio,
            stream_cache_wifi_only: core.settings.stream_cache_wifi_only,
            stream_cache_size_limit_mb: core.settings.stream_cache_size_limit_mb,
            stream_cache_max_concurrent: core.settings.stream_cache_max_concurrent,
            crossfade_duration_ms: core.settings.crossfade_duration_ms,
        };

        self.state_tx.send_if_modified(|current| {
            let changed = *current != state;
            *current = state;
            changed
        });
    }

    /// Sends a notification event; lagging receivers are dropped by the
    /// broadcast channel, never blocking playback.
    fn notify(&self, event: Event) {
        let _ = self.events_tx.send(event);
    }
}

/// Silent no-op errors of the controller surface.
///
/// Commands hitting these conditions return `Ok` and change nothing; the
/// kinds exist so embedders can classify logged failures.
#[derive(Debug, thiserror::Error)]
pub enum StateError {
    /// A transport command arrived with no source attached.
    #[error("no source attached")]
    NoSource,

    /// A queue command arrived while the queue was empty.
    #[error("queue is empty")]
    QueueEmpty,
}

impl From<StateError> for Error {
    fn from(e: StateError) -> Self {
        Self::new(ErrorKind::FailedPrecondition, e)
    }
}
