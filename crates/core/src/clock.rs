//! Frame timing for the driver loop.

use std::time::{Duration, Instant};

/// How often [`FrameClock::tick`] reports a frame rate.
const REPORT_INTERVAL: Duration = Duration::from_secs(1);

/// Per-tick timing with a once-per-interval frame-rate report.
#[derive(Debug)]
pub struct FrameClock {
    start: Instant,
    last_tick: Instant,
    last_report: Instant,
    frames_since_report: u32,
    total_frames: u64,
}

impl FrameClock {
    /// Create a new clock, starting from now.
    pub fn new() -> Self {
        let now = Instant::now();
        Self {
            start: now,
            last_tick: now,
            last_report: now,
            frames_since_report: 0,
            total_frames: 0,
        }
    }

    /// Marks the end of a frame.
    ///
    /// Returns the time since the previous tick, and the average frames per
    /// second once a full report interval has elapsed.
    pub fn tick(&mut self) -> (Duration, Option<f32>) {
        let now = Instant::now();
        let delta = now - self.last_tick;
        self.last_tick = now;
        self.frames_since_report += 1;
        self.total_frames += 1;

        let window = now - self.last_report;
        if window < REPORT_INTERVAL {
            return (delta, None);
        }

        let fps = self.frames_since_report as f32 / window.as_secs_f32();
        self.frames_since_report = 0;
        self.last_report = now;
        (delta, Some(fps))
    }

    /// Total time since the clock was created.
    pub fn elapsed(&self) -> Duration {
        self.start.elapsed()
    }

    /// Number of ticks recorded so far.
    pub fn total_frames(&self) -> u64 {
        self.total_frames
    }
}

impl Default for FrameClock {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tick_counts_frames() {
        let mut clock = FrameClock::new();
        for _ in 0..5 {
            clock.tick();
        }
        assert_eq!(clock.total_frames(), 5);
    }

    #[test]
    fn test_no_report_within_interval() {
        let mut clock = FrameClock::new();
        let (_, fps) = clock.tick();
        assert!(fps.is_none());
    }

    #[test]
    fn test_report_after_interval() {
        let mut clock = FrameClock::new();
        let Some(earlier) = clock.last_report.checked_sub(REPORT_INTERVAL) else {
            return;
        };
        clock.last_report = earlier;
        let (_, fps) = clock.tick();
        assert!(fps.is_some_and(|fps| fps > 0.0));
        assert_eq!(clock.frames_since_report, 0);
    }
}
