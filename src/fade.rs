//! Timed linear volume ramps, advanced once per tick by the control thread.

use crate::engine::SourceId;
use std::time::{Duration, Instant};

/// A linear interpolation of a source's relative volume over a fixed span.
/// The resulting gain writes bypass the command queue; they are applied
/// directly by the control thread each tick.
#[derive(Debug, Clone)]
pub struct FadeJob {
    pub source_id: SourceId,
    pub base: f32,
    pub end: f32,
    pub duration: Duration,
    started: Instant,
}

impl FadeJob {
    pub fn new(source_id: SourceId, base: f32, end: f32, duration: Duration) -> Self {
        Self {
            source_id,
            base,
            end,
            duration,
            started: Instant::now(),
        }
    }

    /// Volume at `now`, clamped to the endpoint once the span has elapsed.
    pub fn value_at(&self, now: Instant) -> f32 {
        if self.duration.is_zero() {
            return self.end;
        }
        let elapsed = now.saturating_duration_since(self.started);
        if elapsed >= self.duration {
            return self.end;
        }
        let t = elapsed.as_secs_f32() / self.duration.as_secs_f32();
        self.base + (self.end - self.base) * t
    }

    pub fn finished(&self, now: Instant) -> bool {
        now.saturating_duration_since(self.started) >= self.duration
    }
}
