//! Offline voice activity analysis
//!
//! Runs the same aggregate-then-detect pipeline as the live controller, but
//! on a virtual clock so a recording is processed as fast as it decodes.

use crate::audio::FrequencyAnalyzer;
use crate::config::DetectorConfig;
use crate::detection::{ActivityStateMachine, Transition};
use crate::error::{DetectorError, DetectorResult};
use crate::level::LevelAggregator;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

/// A span of detected speech, as offsets from the start of the input
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SpeechSegment {
    pub start: Duration,
    /// When the detector declared speech over (includes the silence timeout)
    pub end: Duration,
}

impl SpeechSegment {
    pub fn duration(&self) -> Duration {
        self.end.saturating_sub(self.start)
    }
}

#[derive(Debug, Clone, Default)]
pub struct AnalysisReport {
    pub segments: Vec<SpeechSegment>,
    pub ticks: usize,
    pub skipped_ticks: usize,
    pub duration: Duration,
    pub peak_noise_level: f32,
    pub mean_noise_level: f32,
}

/// Tick `analyzer` until it reports end of input
///
/// Tick `i` is stamped at `(i + 1) * tick_interval`, the end of the audio it
/// covers. A segment still open when input ends is closed at the final
/// offset.
pub fn analyze<A: FrequencyAnalyzer + ?Sized>(
    analyzer: &mut A,
    config: &DetectorConfig,
) -> DetectorResult<AnalysisReport> {
    config.validate()?;

    let tick = config.tick_interval();
    let base = Instant::now();
    let mut machine = ActivityStateMachine::new(config.speech_threshold, config.silence_timeout());
    let mut report = AnalysisReport::default();
    let mut open: Option<Duration> = None;
    let mut level_sum = 0.0_f64;
    let mut index: u32 = 0;

    loop {
        index += 1;
        let offset = tick * index;

        let window = match analyzer.sample() {
            Ok(window) => window,
            Err(DetectorError::SourceClosed(reason)) => {
                debug!("Input finished: {}", reason);
                break;
            }
            Err(e @ DetectorError::Glitch(_)) => {
                debug!("Skipping tick: {}", e);
                report.skipped_ticks += 1;
                continue;
            }
            Err(e) => {
                release(analyzer);
                return Err(e);
            }
        };

        let level = LevelAggregator::aggregate(&window);
        report.ticks += 1;
        report.duration = offset;
        report.peak_noise_level = report.peak_noise_level.max(level.noise_level);
        level_sum += f64::from(level.noise_level);

        match machine.update(level.average, base + offset) {
            Some(Transition::SpeechStart) => open = Some(offset),
            Some(Transition::SpeechEnd) => {
                if let Some(start) = open.take() {
                    report.segments.push(SpeechSegment { start, end: offset });
                }
            }
            None => {}
        }
    }

    if let Some(start) = open {
        report.segments.push(SpeechSegment {
            start,
            end: report.duration,
        });
    }
    if report.ticks > 0 {
        report.mean_noise_level = (level_sum / report.ticks as f64) as f32;
    }

    release(analyzer);
    Ok(report)
}

fn release<A: FrequencyAnalyzer + ?Sized>(analyzer: &mut A) {
    if let Err(e) = analyzer.release() {
        warn!("Failed to release audio source: {}", e);
    }
}
