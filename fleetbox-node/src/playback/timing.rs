//! Adaptive crossfade timing

use std::collections::VecDeque;
use std::time::Duration;

use fleetbox_common::time::secs_f64_to_duration;

pub const MIN_FADE_SECS: f64 = 1.8;
pub const MAX_FADE_SECS: f64 = 2.5;
pub const MIN_OFFSET_SECS: f64 = 4.0;
pub const MAX_OFFSET_SECS: f64 = 6.0;

/// Level difference above which transitions are stretched
const LOUD_DIFF: f32 = 0.3;
/// Level difference below which fades are shortened
const QUIET_DIFF: f32 = 0.1;

/// Ticks of level history kept for the loudness comparison
pub const LOUDNESS_WINDOW_TICKS: usize = 10;

/// Fade length and the time-remaining threshold that triggers a crossfade
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TransitionTiming {
    pub fade_secs: f64,
    pub offset_secs: f64,
}

impl TransitionTiming {
    /// Base timing for a track of `duration` seconds
    pub fn for_duration(duration: f64) -> Self {
        let duration = duration.max(0.0);
        Self {
            fade_secs: (duration * 0.10).clamp(MIN_FADE_SECS, MAX_FADE_SECS),
            offset_secs: (duration * 0.05).clamp(MIN_OFFSET_SECS, MAX_OFFSET_SECS),
        }
    }

    /// Adjust for the level difference between the outgoing and incoming track
    pub fn with_loudness_diff(self, diff: f32) -> Self {
        let diff = diff.abs();
        let (fade, offset) = if diff > LOUD_DIFF {
            (self.fade_secs * 1.2, self.offset_secs * 1.3)
        } else if diff < QUIET_DIFF {
            (self.fade_secs * 0.8, self.offset_secs)
        } else {
            (self.fade_secs, self.offset_secs)
        };
        Self {
            fade_secs: fade.clamp(MIN_FADE_SECS, MAX_FADE_SECS),
            offset_secs: offset.clamp(MIN_OFFSET_SECS, MAX_OFFSET_SECS),
        }
    }

    /// Timing for `duration`, adjusted when both levels are known
    pub fn adaptive(duration: f64, current_level: Option<f32>, next_level: Option<f32>) -> Self {
        let base = Self::for_duration(duration);
        match (current_level, next_level) {
            (Some(current), Some(next)) => base.with_loudness_diff(current - next),
            _ => base,
        }
    }

    pub fn fade(&self) -> Duration {
        secs_f64_to_duration(self.fade_secs)
    }
}

/// Rolling level history of the playing track
#[derive(Debug, Clone, Default)]
pub struct LoudnessWindow {
    samples: VecDeque<f32>,
}

impl LoudnessWindow {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, level: f32) {
        if self.samples.len() == LOUDNESS_WINDOW_TICKS {
            self.samples.pop_front();
        }
        self.samples.push_back(level);
    }

    pub fn average(&self) -> Option<f32> {
        if self.samples.is_empty() {
            None
        } else {
            Some(self.samples.iter().sum::<f32>() / self.samples.len() as f32)
        }
    }

    pub fn clear(&mut self) {
        self.samples.clear();
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }
}
