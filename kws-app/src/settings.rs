//! Persistent host settings (JSON file in the app data directory).

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use kws_core::engine::pipeline::Trigger;
use kws_core::{EngineConfig, FeatureStrategy};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum TriggerMode {
    /// Classify after every delivered chunk.
    PerChunk,
    /// Classify every `intervalMs`, independent of chunk arrival.
    Interval,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
#[serde(default)]
pub struct AppSettings {
    /// `KWSM` artifact. `None` runs the built-in reference model.
    pub model_path: Option<PathBuf>,
    /// WAV file played into the pipeline. `None` plays one second of silence.
    pub input_wav: Option<PathBuf>,
    pub chunk_ms: u32,
    pub trigger: TriggerMode,
    pub interval_ms: u64,
    /// Pace chunks at wall-clock speed instead of as fast as possible.
    pub realtime: bool,
    pub feature_strategy: FeatureStrategy,
    pub arena_bytes: usize,
    /// Log `silence` results at info level too.
    pub log_silence: bool,
}

impl Default for AppSettings {
    fn default() -> Self {
        Self {
            model_path: None,
            input_wav: None,
            chunk_ms: 100,
            trigger: TriggerMode::PerChunk,
            interval_ms: 250,
            realtime: false,
            feature_strategy: FeatureStrategy::Energy,
            arena_bytes: kws_core::constants::TENSOR_ARENA_SIZE,
            log_silence: false,
        }
    }
}

impl AppSettings {
    pub fn normalize(&mut self) {
        self.chunk_ms = self.chunk_ms.clamp(10, 1_000);
        self.interval_ms = self.interval_ms.clamp(20, 10_000);
        self.arena_bytes = self.arena_bytes.clamp(1_024, 1 << 20);
        self.model_path = normalize_path(self.model_path.take());
        self.input_wav = normalize_path(self.input_wav.take());
    }

    /// `KWS_MODEL_PATH` and `KWS_INPUT_WAV` win over the file.
    pub fn apply_env_overrides(&mut self) {
        if let Some(path) = std::env::var_os("KWS_MODEL_PATH") {
            self.model_path = normalize_path(Some(PathBuf::from(path)));
        }
        if let Some(path) = std::env::var_os("KWS_INPUT_WAV") {
            self.input_wav = normalize_path(Some(PathBuf::from(path)));
        }
    }

    pub fn engine_config(&self) -> EngineConfig {
        EngineConfig {
            arena_size: self.arena_bytes,
            feature_strategy: self.feature_strategy,
            ..EngineConfig::default()
        }
    }

    pub fn pipeline_trigger(&self) -> Trigger {
        match self.trigger {
            TriggerMode::PerChunk => Trigger::PerChunk,
            TriggerMode::Interval => Trigger::Interval(Duration::from_millis(self.interval_ms)),
        }
    }

    /// Samples per chunk at the pipeline rate.
    pub fn chunk_samples(&self) -> usize {
        (kws_core::constants::SAMPLE_RATE as usize * self.chunk_ms as usize) / 1_000
    }
}

fn normalize_path(path: Option<PathBuf>) -> Option<PathBuf> {
    path.filter(|p| !p.as_os_str().to_string_lossy().trim().is_empty())
}

/// `KWS_SETTINGS` if set, otherwise the platform data directory.
pub fn settings_path() -> PathBuf {
    std::env::var_os("KWS_SETTINGS")
        .map(PathBuf::from)
        .unwrap_or_else(default_settings_path)
}

pub fn default_settings_path() -> PathBuf {
    #[cfg(target_os = "windows")]
    {
        std::env::var_os("APPDATA")
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from("."))
            .join("Lattice Labs")
            .join("kws")
            .join("settings.json")
    }
    #[cfg(not(target_os = "windows"))]
    {
        std::env::var_os("XDG_DATA_HOME")
            .map(PathBuf::from)
            .unwrap_or_else(|| {
                std::env::var_os("HOME")
                    .map(PathBuf::from)
                    .unwrap_or_else(|| PathBuf::from("/tmp"))
                    .join(".local")
                    .join("share")
            })
            .join("kws")
            .join("settings.json")
    }
}

/// Missing or unreadable files fall back to defaults.
pub fn load_settings(path: &Path) -> AppSettings {
    let mut settings = fs::read_to_string(path)
        .ok()
        .and_then(|raw| serde_json::from_str::<AppSettings>(&raw).ok())
        .unwrap_or_default();
    settings.normalize();
    settings
}

pub fn save_settings(path: &Path, settings: &AppSettings) -> std::io::Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    let json = serde_json::to_string_pretty(settings).map_err(std::io::Error::other)?;
    fs::write(path, json)
}
