//! Linear gain ramps for fades and crossfades
//!
//! A ramp is evaluated against the clock on each tick rather than stepped,
//! so a late tick lands on the right gain instead of falling behind. Two
//! ramps built from the same start instant move in lockstep.

use std::time::Duration;
use tokio::time::Instant;

/// Gain moving linearly from `from` to `to` over `duration`
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct GainRamp {
    from: f32,
    to: f32,
    start: Instant,
    duration: Duration,
}

impl GainRamp {
    /// Ramp starting now
    pub fn new(from: f32, to: f32, duration: Duration) -> Self {
        Self::starting_at(Instant::now(), from, to, duration)
    }

    pub fn starting_at(start: Instant, from: f32, to: f32, duration: Duration) -> Self {
        Self {
            from: from.clamp(0.0, 1.0),
            to: to.clamp(0.0, 1.0),
            start,
            duration,
        }
    }

    /// Progress 0.0-1.0 at `now`
    pub fn progress_at(&self, now: Instant) -> f32 {
        if self.duration.is_zero() {
            return 1.0;
        }
        let elapsed = now.saturating_duration_since(self.start);
        (elapsed.as_secs_f64() / self.duration.as_secs_f64()).min(1.0) as f32
    }

    pub fn gain_at(&self, now: Instant) -> f32 {
        self.from + (self.to - self.from) * self.progress_at(now)
    }

    pub fn gain(&self) -> f32 {
        self.gain_at(Instant::now())
    }

    pub fn is_complete_at(&self, now: Instant) -> bool {
        self.progress_at(now) >= 1.0
    }

    pub fn is_complete(&self) -> bool {
        self.is_complete_at(Instant::now())
    }

    pub fn target(&self) -> f32 {
        self.to
    }

    /// Same ramp retargeted to a new end gain, continuing from where it is now
    ///
    /// Used when the volume changes mid-fade.
    pub fn retarget(&self, to: f32) -> Self {
        let now = Instant::now();
        let remaining = self
            .duration
            .saturating_sub(now.saturating_duration_since(self.start));
        Self::starting_at(now, self.gain_at(now), to, remaining)
    }

    /// Whether this ramp fades toward silence
    pub fn is_fade_out(&self) -> bool {
        self.to < self.from
    }
}
