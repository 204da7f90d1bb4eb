//! WAV file playback as an audio source
//!
//! Each `sample()` advances the read position by one tick interval, so a
//! file replays at the cadence a live microphone would be polled.

use super::source::{AnalysisWindow, AudioSource, FrequencyAnalyzer};
use super::spectrum::{SpectrumAnalyzer, SpectrumConfig};
use crate::config::DetectorConfig;
use crate::error::{DetectorError, DetectorResult};
use hound::{SampleFormat, WavReader};
use std::future::Future;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::debug;

/// Audio source that reads a WAV file from disk
#[derive(Debug, Clone)]
pub struct WavFileSource {
    path: PathBuf,
}

impl WavFileSource {
    pub fn new<P: AsRef<Path>>(path: P) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl AudioSource for WavFileSource {
    type Analyzer = WavFileAnalyzer;

    fn acquire(
        &self,
        config: &DetectorConfig,
    ) -> impl Future<Output = DetectorResult<Self::Analyzer>> + Send {
        let path = self.path.clone();
        let config = config.clone();
        async move {
            tokio::task::spawn_blocking(move || WavFileAnalyzer::open(&path, &config))
                .await
                .map_err(|e| DetectorError::DeviceUnavailable(format!("WAV reader failed: {}", e)))?
        }
    }
}

/// Frequency analyzer stepping through decoded WAV samples
pub struct WavFileAnalyzer {
    samples: Vec<f32>,
    sample_rate: u32,
    hop: usize,
    position: usize,
    spectrum: SpectrumAnalyzer,
}

impl WavFileAnalyzer {
    /// Decode `path` to mono f32 samples
    pub fn open<P: AsRef<Path>>(path: P, config: &DetectorConfig) -> DetectorResult<Self> {
        let path = path.as_ref();
        let reader = WavReader::open(path).map_err(|e| {
            DetectorError::DeviceUnavailable(format!("Failed to open {}: {}", path.display(), e))
        })?;
        let spec = reader.spec();
        let channels = usize::from(spec.channels.max(1));

        let interleaved: Vec<f32> = match spec.sample_format {
            SampleFormat::Float => reader
                .into_samples::<f32>()
                .collect::<Result<_, _>>()
                .map_err(|e| decode_error(path, e))?,
            SampleFormat::Int => {
                let scale = (1_i64 << (spec.bits_per_sample.saturating_sub(1))) as f32;
                reader
                    .into_samples::<i32>()
                    .map(|s| s.map(|s| s as f32 / scale))
                    .collect::<Result<_, _>>()
                    .map_err(|e| decode_error(path, e))?
            }
        };

        let samples = interleaved
            .chunks(channels)
            .map(|frame| frame.iter().sum::<f32>() / frame.len() as f32)
            .collect::<Vec<_>>();

        debug!(
            path = %path.display(),
            sample_rate = spec.sample_rate,
            channels = spec.channels,
            frames = samples.len(),
            "Decoded WAV file"
        );

        Ok(Self::from_samples(samples, spec.sample_rate, config))
    }

    /// Build an analyzer over already-decoded mono samples
    pub fn from_samples(samples: Vec<f32>, sample_rate: u32, config: &DetectorConfig) -> Self {
        let hop = hop_size(sample_rate, config.tick_interval());
        Self {
            samples,
            sample_rate,
            hop,
            position: 0,
            spectrum: SpectrumAnalyzer::new(SpectrumConfig::with_min_decibels(
                config.min_decibels,
            )),
        }
    }

    pub fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    /// Playback position of the most recent window
    pub fn elapsed(&self) -> Duration {
        Duration::from_secs_f64(self.position as f64 / f64::from(self.sample_rate.max(1)))
    }
}

impl FrequencyAnalyzer for WavFileAnalyzer {
    fn sample(&mut self) -> DetectorResult<AnalysisWindow> {
        if self.position >= self.samples.len() {
            return Err(DetectorError::SourceClosed("End of file".to_string()));
        }
        self.position = (self.position + self.hop).min(self.samples.len());
        Ok(self.spectrum.analyze(&self.samples[..self.position]))
    }

    fn release(&mut self) -> DetectorResult<()> {
        self.samples = Vec::new();
        self.position = 0;
        Ok(())
    }
}

fn hop_size(sample_rate: u32, tick: Duration) -> usize {
    ((f64::from(sample_rate) * tick.as_secs_f64()).round() as usize).max(1)
}

fn decode_error(path: &Path, err: hound::Error) -> DetectorError {
    DetectorError::DeviceUnavailable(format!("Failed to decode {}: {}", path.display(), err))
}
