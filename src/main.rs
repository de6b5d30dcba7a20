//! Main application entry point and runtime management.
//!
//! This module handles:
//! * Command line argument parsing
//! * Logging configuration
//! * Configuration and settings loading
//! * Application lifecycle and system signals
//!
//! The binary drives the playback core headlessly: it accepts direct
//! audio URLs on the command line, queues them and plays them through
//! the default (or a selected) output device. It is the smallest useful
//! embedding of the library - real clients plug in a provider resolver
//! and recommender instead of the direct-URL stand-ins used here.
//!
//! # Runtime Behavior
//!
//! The application:
//! 1. Loads and validates configuration and settings
//! 2. Constructs and starts the playback controller
//! 3. Installs the command-line queue
//! 4. Runs until a signal decides otherwise:
//!    * Ctrl-C / SIGTERM shut down gracefully
//!    * SIGHUP re-reads the settings file and applies it to the live
//!      controller - playback keeps running through a reload

use std::{process, sync::Arc, time::Duration};

use clap::{command, Parser, ValueHint};
use log::{debug, error, info, warn, LevelFilter};

use cadenza::{
    config::{Config, Settings},
    controller::PlaybackController,
    error::{Error, Result},
    events::Event,
    persist::JsonFileStore,
    player::AudioOutput,
    precache::AssumeUnmetered,
    radio::RelatedSource,
    resolver::DirectUrlSource,
    track::Track,
};

/// Build profile indicator for logging.
///
/// Shows "debug" when built without optimizations.
#[cfg(debug_assertions)]
const BUILD_PROFILE: &str = "debug";

/// Build profile indicator for logging.
///
/// Shows "release" when built with optimizations.
#[cfg(not(debug_assertions))]
const BUILD_PROFILE: &str = "release";

/// Group name for mutually exclusive logging options.
///
/// Used by clap to ensure -q (quiet) and -v (verbose) flags
/// cannot be used together.
const ARGS_GROUP_LOGGING: &str = "logging";

/// Command line arguments as parsed by `clap`.
///
/// All options can be set via environment variables with
/// the `CADENZA_` prefix.
#[derive(Clone, Debug, Default, PartialEq, Parser)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Direct audio URLs to queue and play
    #[arg(value_name = "URL", value_hint = ValueHint::Url)]
    tracks: Vec<String>,

    /// Base directory for the cache, state and library
    #[arg(short, long, value_name = "DIR", value_hint = ValueHint::DirPath, default_value_t = String::from("./cadenza-data"), env = "CADENZA_BASE_DIR")]
    base_dir: String,

    /// Select the audio output device
    ///
    /// Format: [<host>][|<device>][|<sample rate>][|<sample format>]
    /// Use "?" to list available output devices.
    /// If omitted, uses the system default output device.
    #[arg(short, long, default_value = None, env = "CADENZA_DEVICE")]
    device: Option<String>,

    /// Streaming quality (auto, low, medium, high, max)
    #[arg(long, env = "CADENZA_QUALITY")]
    quality: Option<String>,

    /// Crossfade duration in milliseconds (0 disables crossfading)
    #[arg(long, value_parser = clap::value_parser!(u32).range(0..=12_000), env = "CADENZA_CROSSFADE")]
    crossfade: Option<u32>,

    /// Suppress all output except warnings and errors
    #[arg(short, long, default_value_t = false, group = ARGS_GROUP_LOGGING, env = "CADENZA_QUIET")]
    quiet: bool,

    /// Enable verbose logging
    ///
    /// Use -v for debug logging
    /// Use -vv for trace logging
    #[arg(short, long, action = clap::ArgAction::Count, group = ARGS_GROUP_LOGGING, env = "CADENZA_VERBOSE")]
    verbose: u8,
}

/// Recommender stand-in for the headless binary.
///
/// Direct URLs carry no relations; radio mode simply never extends.
struct NoRecommendations;

#[async_trait::async_trait]
impl RelatedSource for NoRecommendations {
    async fn related(&self, _seed_id: &str, _limit: usize) -> Result<Vec<Track>> {
        Ok(Vec::new())
    }
}

/// Lifecycle decision driven by a system signal.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
enum LifecycleEvent {
    /// Stop playback, flush state and exit.
    Shutdown(&'static str),

    /// Re-read the settings file and apply it to the live controller.
    ReloadSettings,
}

/// System signal streams feeding the main loop.
///
/// On Unix: Ctrl-C and SIGTERM shut down, SIGHUP reloads settings in
/// place. On Windows only Ctrl-C is delivered.
struct LifecycleSignals {
    #[cfg(unix)]
    sigterm: tokio::signal::unix::Signal,
    #[cfg(unix)]
    sighup: tokio::signal::unix::Signal,
}

impl LifecycleSignals {
    /// Registers the signal handlers.
    ///
    /// # Errors
    ///
    /// Returns error if signal handlers cannot be registered.
    fn new() -> Result<Self> {
        #[cfg(unix)]
        {
            use tokio::signal::unix::{signal, SignalKind};
            Ok(Self {
                sigterm: signal(SignalKind::terminate())?,
                sighup: signal(SignalKind::hangup())?,
            })
        }

        #[cfg(not(unix))]
        Ok(Self {})
    }

    /// Waits for the next lifecycle event.
    async fn next(&mut self) -> LifecycleEvent {
        #[cfg(unix)]
        {
            tokio::select! {
                _ = tokio::signal::ctrl_c() => LifecycleEvent::Shutdown("Ctrl+C"),
                _ = self.sigterm.recv() => LifecycleEvent::Shutdown("SIGTERM"),
                _ = self.sighup.recv() => LifecycleEvent::ReloadSettings,
            }
        }

        #[cfg(not(unix))]
        {
            let _ = tokio::signal::ctrl_c().await;
            LifecycleEvent::Shutdown("Ctrl+C")
        }
    }
}

/// Initialize logging system.
///
/// Configures logging based on command line arguments and environment:
/// * `-q` sets Warning level
/// * `-v` sets Debug level
/// * `-vv` sets Trace level
/// * `RUST_LOG` environment variable provides defaults
/// * External crates are limited to Warning level
///
/// # Panics
///
/// Panics if logger is already initialized.
fn init_logger(config: &Args) {
    let mut logger = env_logger::Builder::from_env(
        // Note: if you change the default logging level here, then you should
        // probably also change the verbosity levels below.
        env_logger::Env::default().filter_or(env_logger::DEFAULT_FILTER_ENV, "info"),
    );

    let mut external_level = LevelFilter::Error;
    if config.quiet || config.verbose > 0 {
        let level = match config.verbose {
            0 => {
                // Quiet and verbose are mutually exclusive, and `verbose` is 0
                // by default. So this arm means: quiet mode.
                LevelFilter::Warn
            }
            1 => LevelFilter::Debug,
            _ => LevelFilter::max(),
        };

        logger.filter_module(module_path!(), level);
        logger.filter_module("cadenza", level);

        if level == LevelFilter::Trace {
            external_level = LevelFilter::max();
        }
    };

    // Filter log messages of external crates.
    for external_module in [
        "cpal",
        "reqwest",
        "rodio",
        "stream_download",
        "symphonia",
        "symphonia_bundle_mp3",
        "symphonia_codec_aac",
        "symphonia_codec_pcm",
        "symphonia_codec_vorbis",
        "symphonia_core",
        "symphonia_format_isomp4",
        "symphonia_format_riff",
        "symphonia_metadata",
        "symphonia_utils_xiph",
    ] {
        logger.filter_module(external_module, external_level);
    }

    logger.init();
}

/// Builds a queue entry from a direct audio URL.
///
/// The URL doubles as the track id; title falls back to the last path
/// segment.
fn track_from_url(url: &str) -> Track {
    let title = url
        .rsplit('/')
        .next()
        .filter(|segment| !segment.is_empty())
        .map_or_else(|| url.to_string(), |segment| segment.to_string());

    Track::new(url, title, "Direct stream", Duration::ZERO)
}

/// Main application loop.
///
/// Runs until Ctrl-C or SIGTERM arrives; SIGHUP re-reads the settings
/// file and applies it to the running controller without interrupting
/// playback.
///
/// # Errors
///
/// Returns error if:
/// * Configuration is invalid
/// * The audio device cannot be opened
/// * The cache directory cannot be created
async fn run(args: Args) -> Result<()> {
    if args.device.as_ref().is_some_and(|device| device == "?") {
        // List available devices and exit.
        let devices = AudioOutput::enumerate_devices();
        if devices.is_empty() {
            return Err(Error::not_found("no audio output devices found"));
        }

        info!("available audio output devices:");
        for device in devices {
            info!("- {device}");
        }
        return Ok(());
    }

    let config = {
        let mut config = Config::with_base_dir(&args.base_dir);
        if let Some(device) = args.device.clone() {
            config.device = device;
        }
        config
    };
    let state_dir = config.state_dir.clone();

    let mut settings = Settings::load(&state_dir)?;
    if let Some(quality) = args.quality.as_deref() {
        settings.streaming_quality = quality.parse()?;
    }
    if let Some(crossfade) = args.crossfade {
        settings.crossfade_duration_ms = crossfade;
    }
    let settings = settings.clamped();
    settings.save(&state_dir)?;

    let store = Arc::new(JsonFileStore::new(state_dir.clone()));
    let client = Arc::new(cadenza::http::Client::new()?);

    let controller = PlaybackController::new(
        config,
        settings,
        Arc::new(DirectUrlSource::new(client)),
        Arc::new(NoRecommendations),
        Arc::new(AssumeUnmetered),
        store,
    )
    .await?;

    controller.start().await?;

    if !args.tracks.is_empty() {
        let queue: Vec<Track> = args.tracks.iter().map(|url| track_from_url(url)).collect();
        info!("queueing {} tracks", queue.len());
        controller.play_queue(queue, 0, None, false).await?;
    }

    // Narrate coarse events until a shutdown signal arrives.
    let mut events = controller.events();
    let mut state = controller.state_stream();
    let mut signals = LifecycleSignals::new()?;

    loop {
        tokio::select! {
            // Prioritize lifecycle signals.
            biased;

            event = signals.next() => {
                match event {
                    LifecycleEvent::Shutdown(reason) => {
                        info!("received {reason}, shutting down");
                        break;
                    }
                    LifecycleEvent::ReloadSettings => {
                        // Settings apply in place: the controller keeps
                        // playing through a reload.
                        match Settings::load(&state_dir) {
                            Ok(fresh) => {
                                info!("received SIGHUP, reloading settings");
                                controller.update_settings(fresh).await;
                            }
                            Err(e) => warn!("settings reload failed: {e}"),
                        }
                    }
                }
            }

            event = events.recv() => {
                if let Ok(Event::TrackChanged) = event {
                    if let Some(track) = state.borrow_and_update().current_track.as_ref() {
                        info!("now playing {track}");
                    }
                }
            }

            changed = state.changed() => {
                if changed.is_ok() {
                    let snapshot = state.borrow_and_update();
                    if let Some(error) = snapshot.error.as_deref() {
                        warn!("playback error: {error}");
                    }
                }
            }
        }
    }

    controller.shutdown().await;
    Ok(())
}

/// Application entry point.
///
/// Sets up the environment and manages the application lifecycle:
/// 1. Parses command line arguments
/// 2. Initializes logging
/// 3. Runs the main loop until shutdown
///
/// Exits with status code:
/// - 0 for clean shutdown
/// - 1 if an error occurs
#[tokio::main]
async fn main() {
    // `clap` handles our command line arguments and help text.
    let args = Args::parse();
    init_logger(&args);

    // Dump command line arguments before we do anything more.
    // This aids in debugging of whatever comes next.
    debug!("Command {:#?}", args);

    let cmd = command!();
    let name = cmd.get_name().to_string();
    let version = cmd.get_version().unwrap_or("UNKNOWN").to_string();

    info!("starting {name}/{version}; {BUILD_PROFILE}");

    match run(args).await {
        Ok(()) => {
            info!("shut down gracefully");
            process::exit(0);
        }
        Err(e) => {
            error!("{e}");
            process::exit(1);
        }
    }
}
