//! Detector configuration
//!
//! Configuration is captured once when a detector is built. Values come from
//! an optional JSON file in the user's config directory, with CLI flags
//! layered on top by the binary.

use crate::audio::MAX_DECIBELS;
use crate::error::{DetectorError, DetectorResult};
use directories::ProjectDirs;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::debug;

const CONFIG_FILE_NAME: &str = "config.json";

/// Device hints passed to the audio source at acquisition time
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "snake_case")]
pub struct CaptureConstraints {
    /// Input device name, `None` for the system default
    pub device: Option<String>,
    #[serde(alias = "echoCancellation")]
    pub echo_cancellation: bool,
    #[serde(alias = "noiseSuppression")]
    pub noise_suppression: bool,
    #[serde(alias = "autoGainControl")]
    pub auto_gain_control: bool,
}

impl Default for CaptureConstraints {
    fn default() -> Self {
        Self {
            device: None,
            echo_cancellation: true,
            noise_suppression: true,
            auto_gain_control: true,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DetectorConfig {
    /// Analyzer noise floor in dB
    #[serde(alias = "minDecibels")]
    pub min_decibels: f32,
    /// Raw average byte energy a tick must exceed to count as speech
    #[serde(alias = "speechThreshold")]
    pub speech_threshold: f32,
    /// How long energy must stay below the threshold before speech ends
    #[serde(alias = "time_threshold", alias = "timeThreshold")]
    pub silence_timeout_ms: u64,
    #[serde(alias = "tickIntervalMs")]
    pub tick_interval_ms: u64,
    pub capture: CaptureConstraints,
}

impl Default for DetectorConfig {
    fn default() -> Self {
        Self {
            min_decibels: -45.0,
            speech_threshold: 30.0,
            silence_timeout_ms: 300,
            tick_interval_ms: 100,
            capture: CaptureConstraints::default(),
        }
    }
}

impl DetectorConfig {
    pub fn silence_timeout(&self) -> Duration {
        Duration::from_millis(self.silence_timeout_ms)
    }

    pub fn tick_interval(&self) -> Duration {
        Duration::from_millis(self.tick_interval_ms)
    }

    /// Check the invariants the detector relies on
    pub fn validate(&self) -> DetectorResult<()> {
        if !self.min_decibels.is_finite() || self.min_decibels >= MAX_DECIBELS {
            return Err(DetectorError::InvalidConfig(format!(
                "min_decibels must be a finite value below {} dB, got {}",
                MAX_DECIBELS, self.min_decibels
            )));
        }
        if !self.speech_threshold.is_finite()
            || self.speech_threshold <= 0.0
            || self.speech_threshold >= 255.0
        {
            return Err(DetectorError::InvalidConfig(format!(
                "speech_threshold must be between 0 and 255, got {}",
                self.speech_threshold
            )));
        }
        if self.tick_interval_ms == 0 {
            return Err(DetectorError::InvalidConfig(
                "tick_interval_ms must be greater than zero".to_string(),
            ));
        }
        Ok(())
    }

    /// Parse and validate a JSON config document
    pub fn from_json(json: &str) -> DetectorResult<Self> {
        let config: DetectorConfig = serde_json::from_str(json)
            .map_err(|e| DetectorError::InvalidConfig(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Load config from `path`, falling back to defaults when the file is absent
    pub fn load<P: AsRef<Path>>(path: P) -> DetectorResult<Self> {
        let path = path.as_ref();
        match std::fs::read_to_string(path) {
            Ok(contents) => {
                debug!(path = %path.display(), "Loading detector config");
                Self::from_json(&contents).map_err(|e| match e {
                    DetectorError::InvalidConfig(msg) => {
                        DetectorError::InvalidConfig(format!("{}: {}", path.display(), msg))
                    }
                    other => other,
                })
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!(path = %path.display(), "No config file, using defaults");
                Ok(Self::default())
            }
            Err(e) => Err(DetectorError::InvalidConfig(format!(
                "Failed to read {}: {}",
                path.display(),
                e
            ))),
        }
    }

    /// Load config from the default location, if one can be determined
    pub fn load_default() -> DetectorResult<Self> {
        match default_config_path() {
            Some(path) => Self::load(path),
            None => Ok(Self::default()),
        }
    }
}

/// Default config file location, e.g. `~/.config/voice-activity/config.json`
pub fn default_config_path() -> Option<PathBuf> {
    ProjectDirs::from("", "", "voice-activity").map(|dirs| dirs.config_dir().join(CONFIG_FILE_NAME))
}
