//! Capability traits between the detector and the audio platform

use crate::config::DetectorConfig;
use crate::error::DetectorResult;
use std::future::Future;

/// One tick's per-bin energy magnitudes, each in [0, 255]
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct AnalysisWindow(Vec<u8>);

impl AnalysisWindow {
    pub fn new(bins: Vec<u8>) -> Self {
        Self(bins)
    }

    /// A window of `len` bins all set to `value`
    pub fn filled(len: usize, value: u8) -> Self {
        Self(vec![value; len])
    }

    pub fn bins(&self) -> &[u8] {
        &self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl From<Vec<u8>> for AnalysisWindow {
    fn from(bins: Vec<u8>) -> Self {
        Self(bins)
    }
}

/// Produces frequency-domain energy for the live stream it wraps
pub trait FrequencyAnalyzer: Send + 'static {
    /// Current analysis window
    ///
    /// Fails with `SourceClosed` once the underlying stream is gone, or
    /// `Glitch` when only this sample could not be taken.
    fn sample(&mut self) -> DetectorResult<AnalysisWindow>;

    /// Release the underlying device; must leave no lingering lock behind
    fn release(&mut self) -> DetectorResult<()>;
}

/// Grants access to a live audio stream
pub trait AudioSource: Send + Sync + 'static {
    type Analyzer: FrequencyAnalyzer;

    /// Acquire the device and wrap it in an analyzer
    ///
    /// `config.capture` carries the device hints and `config.min_decibels`
    /// the analyzer floor. Fails with `PermissionDenied` or
    /// `DeviceUnavailable`.
    fn acquire(
        &self,
        config: &DetectorConfig,
    ) -> impl Future<Output = DetectorResult<Self::Analyzer>> + Send;
}
