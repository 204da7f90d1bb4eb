//! Speech onset/offset detection with asymmetric hysteresis
//!
//! Speech starts on the first tick whose raw average energy exceeds the
//! threshold. It ends only once energy has stayed at or below the threshold
//! for longer than the silence timeout, so short pauses between words keep
//! the speaker active.

use std::time::{Duration, Instant};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ActivityState {
    #[default]
    Idle,
    Speaking,
}

impl ActivityState {
    pub fn as_str(&self) -> &'static str {
        match self {
            ActivityState::Idle => "idle",
            ActivityState::Speaking => "speaking",
        }
    }
}

impl std::fmt::Display for ActivityState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// State change produced by a single update
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
    SpeechStart,
    SpeechEnd,
}

/// Binary speaking/idle state machine fed once per tick
#[derive(Debug, Clone)]
pub struct ActivityStateMachine {
    threshold: f32,
    silence_timeout: Duration,
    state: ActivityState,
    last_above_threshold_at: Option<Instant>,
}

impl ActivityStateMachine {
    /// Create a detector in the `Idle` state
    ///
    /// # Arguments
    /// * `threshold` - Raw average bin energy above which a tick counts as speech
    /// * `silence_timeout` - How long energy must stay low before speech ends
    pub fn new(threshold: f32, silence_timeout: Duration) -> Self {
        Self {
            threshold,
            silence_timeout,
            state: ActivityState::Idle,
            last_above_threshold_at: None,
        }
    }

    pub fn state(&self) -> ActivityState {
        self.state
    }

    pub fn is_speaking(&self) -> bool {
        self.state == ActivityState::Speaking
    }

    /// Apply one tick's raw average energy observed at `now`
    ///
    /// Returns the transition taken, if any. At most one transition happens
    /// per call.
    pub fn update(&mut self, average: f32, now: Instant) -> Option<Transition> {
        if average > self.threshold {
            self.last_above_threshold_at = Some(now);
            if self.state == ActivityState::Idle {
                self.state = ActivityState::Speaking;
                return Some(Transition::SpeechStart);
            }
            return None;
        }

        if self.state != ActivityState::Speaking {
            return None;
        }

        let silent_for = self
            .last_above_threshold_at
            .map(|at| now.saturating_duration_since(at))
            .unwrap_or(Duration::MAX);

        if silent_for > self.silence_timeout {
            self.state = ActivityState::Idle;
            Some(Transition::SpeechEnd)
        } else {
            None
        }
    }

    /// Return to `Idle` and forget the last speech timestamp
    pub fn reset(&mut self) {
        self.state = ActivityState::Idle;
        self.last_above_threshold_at = None;
    }
}
