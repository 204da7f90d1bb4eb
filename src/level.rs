use crate::audio::AnalysisWindow;

/// Gain applied to the average bin energy to get a display level
pub const NOISE_LEVEL_GAIN: f32 = 1.5;

/// Upper bound of the normalized noise level
pub const MAX_NOISE_LEVEL: f32 = 100.0;

/// Aggregate energy for one analysis window
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Level {
    /// Arithmetic mean of the bin magnitudes, unclamped
    pub average: f32,
    /// `average * 1.5` clamped to [0, 100]
    pub noise_level: f32,
}

impl Level {
    pub const SILENT: Level = Level {
        average: 0.0,
        noise_level: 0.0,
    };
}

/// Reduces an analysis window to a single energy level
pub struct LevelAggregator;

impl LevelAggregator {
    pub fn aggregate(window: &AnalysisWindow) -> Level {
        let bins = window.bins();
        if bins.is_empty() {
            return Level::SILENT;
        }

        let sum: u32 = bins.iter().map(|&b| u32::from(b)).sum();
        let average = sum as f32 / bins.len() as f32;

        Level {
            average,
            noise_level: normalize(average),
        }
    }
}

/// Scale a raw average into the [0, 100] noise level range
pub fn normalize(average: f32) -> f32 {
    let level = average * NOISE_LEVEL_GAIN;
    if level.is_nan() {
        return 0.0;
    }
    level.clamp(0.0, MAX_NOISE_LEVEL)
}
