//! Frequency spectrum analyzer for voice activity detection
//!
//! Turns the most recent window of time-domain samples into byte frequency
//! magnitudes. Features:
//! - 1024-point FFT with a Blackman window
//! - Per-bin temporal smoothing across calls
//! - Decibel mapping between a configurable floor and a fixed ceiling

use super::source::AnalysisWindow;
use rustfft::{Fft, FftPlanner, num_complex::Complex};
use std::sync::Arc;

/// FFT window size in samples
pub const FFT_SIZE: usize = 1024;

/// Number of magnitude bins produced per window
pub const FREQUENCY_BIN_COUNT: usize = FFT_SIZE / 2;

/// Upper end of the decibel range mapped onto [0, 255]
pub const MAX_DECIBELS: f32 = -10.0;

/// Weight of the previous window's magnitudes when smoothing
pub const SMOOTHING_TIME_CONSTANT: f32 = 0.5;

/// Configuration for spectrum analyzer behavior
#[derive(Debug, Clone)]
pub struct SpectrumConfig {
    pub fft_size: usize,
    /// Temporal smoothing factor (0.0-1.0, higher = more smoothing)
    pub smoothing_time_constant: f32,
    /// Magnitudes at or below this level map to 0
    pub min_decibels: f32,
    /// Magnitudes at or above this level map to 255
    pub max_decibels: f32,
}

impl SpectrumConfig {
    pub fn with_min_decibels(min_decibels: f32) -> Self {
        Self {
            min_decibels,
            ..Self::default()
        }
    }
}

impl Default for SpectrumConfig {
    fn default() -> Self {
        Self {
            fft_size: FFT_SIZE,
            smoothing_time_constant: SMOOTHING_TIME_CONSTANT,
            min_decibels: -100.0,
            max_decibels: MAX_DECIBELS,
        }
    }
}

/// FFT-based spectrum analyzer producing byte magnitudes per bin
pub struct SpectrumAnalyzer {
    config: SpectrumConfig,
    fft: Arc<dyn Fft<f32>>,
    window: Vec<f32>,
    smoothed: Vec<f32>,
    scratch: Vec<Complex<f32>>,
}

impl SpectrumAnalyzer {
    pub fn new(config: SpectrumConfig) -> Self {
        let n = config.fft_size;

        // Blackman window
        let window = (0..n)
            .map(|i| {
                let x = 2.0 * std::f32::consts::PI * i as f32 / n as f32;
                0.42 - 0.5 * x.cos() + 0.08 * (2.0 * x).cos()
            })
            .collect();

        Self {
            fft: FftPlanner::new().plan_fft_forward(n),
            window,
            smoothed: vec![0.0; n / 2],
            scratch: vec![Complex::new(0.0, 0.0); n],
            config,
        }
    }

    pub fn fft_size(&self) -> usize {
        self.config.fft_size
    }

    pub fn bin_count(&self) -> usize {
        self.config.fft_size / 2
    }

    /// Analyze the last `fft_size` samples of `samples`
    ///
    /// Shorter input is zero-padded at the front, as if the stream had been
    /// silent before it started.
    pub fn analyze(&mut self, samples: &[f32]) -> AnalysisWindow {
        let n = self.config.fft_size;
        let recent = &samples[samples.len().saturating_sub(n)..];
        let pad = n - recent.len();

        for (i, slot) in self.scratch.iter_mut().enumerate() {
            let sample = if i < pad { 0.0 } else { recent[i - pad] };
            *slot = Complex::new(sample * self.window[i], 0.0);
        }

        self.fft.process(&mut self.scratch);

        let tau = self.config.smoothing_time_constant;
        let range = self.config.max_decibels - self.config.min_decibels;
        let bins = self
            .scratch
            .iter()
            .take(n / 2)
            .zip(self.smoothed.iter_mut())
            .map(|(value, smoothed)| {
                let magnitude = value.norm() / n as f32;
                *smoothed = tau * *smoothed + (1.0 - tau) * magnitude;
                to_byte(*smoothed, self.config.min_decibels, range)
            })
            .collect();

        AnalysisWindow::new(bins)
    }

    /// Forget smoothing history
    pub fn reset(&mut self) {
        self.smoothed.iter_mut().for_each(|m| *m = 0.0);
    }
}

fn to_byte(magnitude: f32, min_decibels: f32, range: f32) -> u8 {
    if magnitude <= 0.0 {
        return 0;
    }
    let db = 20.0 * magnitude.log10();
    let scaled = 255.0 / range * (db - min_decibels);
    scaled.clamp(0.0, 255.0).floor() as u8
}
