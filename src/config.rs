//! Configuration for cadenza.
//!
//! This module handles:
//! * Application-level configuration (directories, device, user agent)
//! * User settings that affect playback and caching behavior
//! * Settings persistence as a TOML file
//!
//! Settings map one-to-one to the persisted keys of the client they came
//! from, with defaults and clamped ranges applied on load so that an edited
//! or corrupted settings file can never put the engine outside its
//! operating envelope.

use std::{
    fs,
    path::{Path, PathBuf},
};

use serde::{Deserialize, Serialize};

use crate::{
    error::Result,
    track::AudioQuality,
};

/// Application-level configuration.
///
/// Fixed for the lifetime of the process; assembled by the binary (or the
/// embedding application) before the controller is constructed.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Config {
    /// The name of the application.
    ///
    /// By default this is retrieved from `Cargo.toml` and used in the
    /// `User-Agent` string.
    pub app_name: String,

    /// The version of the application.
    ///
    /// By default this is retrieved from `Cargo.toml` and used in the
    /// `User-Agent` string.
    pub app_version: String,

    /// Root of the temporary stream cache; `stream_audio_cache/` is
    /// created underneath.
    pub cache_dir: PathBuf,

    /// Directory for persisted state (queue snapshot, settings, download
    /// index).
    pub state_dir: PathBuf,

    /// Directory of the offline library (`audio/`).
    pub library_dir: PathBuf,

    /// Audio output device specification string:
    /// ```text
    /// [<host>][|<device>][|<sample rate>][|<sample format>]
    /// ```
    /// All parts are optional. Empty string selects the system default.
    pub device: String,
}

impl Config {
    /// Creates a configuration rooted at the given base directory.
    ///
    /// Uses `<base>/cache`, `<base>/state` and `<base>/audio` for the
    /// cache, state and library directories respectively.
    #[must_use]
    pub fn with_base_dir(base: impl AsRef<Path>) -> Self {
        let base = base.as_ref();
        Self {
            app_name: env!("CARGO_PKG_NAME").to_owned(),
            app_version: env!("CARGO_PKG_VERSION").to_owned(),
            cache_dir: base.join("cache"),
            state_dir: base.join("state"),
            library_dir: base.join("audio"),
            device: String::new(),
        }
    }
}

/// User settings affecting playback, caching and downloads.
///
/// All fields have defaults and are clamped to their valid ranges on load,
/// so a hand-edited file degrades gracefully instead of failing.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    /// Preferred quality for streaming playback.
    pub streaming_quality: AudioQuality,

    /// Restrict background precaching to unmetered networks.
    pub stream_cache_wifi_only: bool,

    /// On-disk stream cache budget in MiB.
    pub stream_cache_size_limit_mb: u32,

    /// Maximum simultaneous precache downloads.
    pub stream_cache_max_concurrent: u8,

    /// Crossfade overlap between tracks in milliseconds. Zero disables
    /// crossfading and selects hard switches.
    pub crossfade_duration_ms: u32,

    /// Preferred quality for offline library downloads.
    pub download_quality: AudioQuality,

    /// Number of parallel byte-range parts for large downloads.
    pub download_parallel_part_count: u8,

    /// Minimum body size in MiB before a download is split into parts.
    pub download_parallel_min_size_mb: u8,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            streaming_quality: AudioQuality::Auto,
            stream_cache_wifi_only: false,
            stream_cache_size_limit_mb: 1024,
            stream_cache_max_concurrent: 2,
            crossfade_duration_ms: 0,
            download_quality: AudioQuality::High,
            download_parallel_part_count: 4,
            download_parallel_min_size_mb: 1,
        }
    }
}

impl Settings {
    /// File name of the persisted settings inside the state directory.
    pub const FILE_NAME: &'static str = "settings.toml";

    /// Clamps every field to its valid range.
    ///
    /// Ranges follow the settings surface of the client:
    /// * cache size limit: 128..=4096 MiB
    /// * cache concurrency: 1..=4
    /// * crossfade: 0..=12000 ms
    /// * parallel parts: 2..=8
    /// * parallel threshold: 1..=32 MiB
    #[must_use]
    pub fn clamped(mut self) -> Self {
        self.stream_cache_size_limit_mb = self.stream_cache_size_limit_mb.clamp(128, 4096);
        self.stream_cache_max_concurrent = self.stream_cache_max_concurrent.clamp(1, 4);
        self.crossfade_duration_ms = self.crossfade_duration_ms.min(12_000);
        self.download_parallel_part_count = self.download_parallel_part_count.clamp(2, 8);
        self.download_parallel_min_size_mb = self.download_parallel_min_size_mb.clamp(1, 32);
        self
    }

    /// Loads settings from `<state_dir>/settings.toml`.
    ///
    /// A missing file yields the defaults. Values outside their valid
    /// ranges are clamped.
    ///
    /// # Errors
    ///
    /// Returns error if the file exists but cannot be read or parsed.
    pub fn load(state_dir: impl AsRef<Path>) -> Result<Self> {
        let path = state_dir.as_ref().join(Self::FILE_NAME);
        if !path.exists() {
            return Ok(Self::default());
        }

        let contents = fs::read_to_string(&path)?;
        let settings: Self = toml::from_str(&contents)?;
        Ok(settings.clamped())
    }

    /// Saves settings to `<state_dir>/settings.toml`.
    ///
    /// # Errors
    ///
    /// Returns error if the state directory cannot be created or the file
    /// cannot be written.
    pub fn save(&self, state_dir: impl AsRef<Path>) -> Result<()> {
        let state_dir = state_dir.as_ref();
        fs::create_dir_all(state_dir)?;

        let contents = toml::to_string_pretty(self)?;
        fs::write(state_dir.join(Self::FILE_NAME), contents)?;
        Ok(())
    }

    /// Stream cache budget in bytes.
    #[must_use]
    pub fn stream_cache_limit_bytes(&self) -> u64 {
        u64::from(self.stream_cache_size_limit_mb) * 1024 * 1024
    }

    /// Parallel-download threshold in bytes.
    #[must_use]
    pub fn download_parallel_min_size_bytes(&self) -> u64 {
        u64::from(self.download_parallel_min_size_mb) * 1024 * 1024
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_settings_surface() {
        let settings = Settings::default();
        assert_eq!(settings.streaming_quality, AudioQuality::Auto);
        assert!(!settings.stream_cache_wifi_only);
        assert_eq!(settings.stream_cache_size_limit_mb, 1024);
        assert_eq!(settings.stream_cache_max_concurrent, 2);
        assert_eq!(settings.crossfade_duration_ms, 0);
        assert_eq!(settings.download_quality, AudioQuality::High);
        assert_eq!(settings.download_parallel_part_count, 4);
        assert_eq!(settings.download_parallel_min_size_mb, 1);
    }

    #[test]
    fn clamp_restores_operating_envelope() {
        let settings = Settings {
            stream_cache_size_limit_mb: 16,
            stream_cache_max_concurrent: 9,
            crossfade_duration_ms: 60_000,
            download_parallel_part_count: 1,
            download_parallel_min_size_mb: 250,
            ..Settings::default()
        }
        .clamped();

        assert_eq!(settings.stream_cache_size_limit_mb, 128);
        assert_eq!(settings.stream_cache_max_concurrent, 4);
        assert_eq!(settings.crossfade_duration_ms, 12_000);
        assert_eq!(settings.download_parallel_part_count, 2);
        assert_eq!(settings.download_parallel_min_size_mb, 32);
    }

    #[test]
    fn save_and_load_round_trip() {
        let dir = std::env::temp_dir().join(format!("cadenza-settings-{}", std::process::id()));
        let settings = Settings {
            streaming_quality: AudioQuality::High,
            crossfade_duration_ms: 3000,
            ..Settings::default()
        };

        settings.save(&dir).unwrap();
        let loaded = Settings::load(&dir).unwrap();
        assert_eq!(loaded, settings);

        std::fs::remove_dir_all(&dir).ok();
    }

    #[test]
    fn missing_file_yields_defaults() {
        let dir = std::env::temp_dir().join("cadenza-settings-missing");
        assert_eq!(Settings::load(dir).unwrap(), Settings::default());
    }
}
