//! Real-time voice activity detection
//!
//! Audio is polled at a fixed cadence, reduced to a per-tick energy level and
//! fed through a hysteresis state machine that reports when a speaker starts
//! and stops talking.

pub mod analysis;
pub mod audio;
pub mod config;
pub mod controller;
pub mod detection;
pub mod error;
pub mod level;
pub mod logging;

pub use audio::{AnalysisWindow, AudioSource, FrequencyAnalyzer, MicrophoneSource, WavFileSource};
pub use config::{CaptureConstraints, DetectorConfig};
pub use controller::{DetectorCallbacks, DetectorController, DetectorHandle};
pub use detection::{ActivityState, ActivityStateMachine, Transition};
pub use error::{DetectorError, DetectorResult};
pub use level::{Level, LevelAggregator};
