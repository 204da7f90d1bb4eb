//! Audio input and frequency analysis
//!
//! - `source`: capability traits the detector consumes
//! - `spectrum`: FFT-based byte magnitude analyzer
//! - `capture`: live microphone binding (CPAL)
//! - `file`: WAV file binding (hound)

mod capture;
mod file;
mod ring_buffer;
mod source;
mod spectrum;

pub use capture::{InputDeviceInfo, MicrophoneAnalyzer, MicrophoneSource, list_devices};
pub use file::{WavFileAnalyzer, WavFileSource};
pub use source::{AnalysisWindow, AudioSource, FrequencyAnalyzer};
pub use spectrum::{
    FFT_SIZE, FREQUENCY_BIN_COUNT, MAX_DECIBELS, SMOOTHING_TIME_CONSTANT, SpectrumAnalyzer,
    SpectrumConfig,
};
