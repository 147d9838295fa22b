//! Frame timing.

use std::time::{Duration, Instant};

/// Measures per-frame deltas and periodic frame-rate samples.
#[derive(Debug)]
pub struct Timer {
    start: Instant,
    last_tick: Instant,
    window_start: Instant,
    window_frames: u32,
    total_frames: u64,
}

impl Timer {
    /// Create a new timer, starting from now.
    pub fn new() -> Self {
        let now = Instant::now();
        Self {
            start: now,
            last_tick: now,
            window_start: now,
            window_frames: 0,
            total_frames: 0,
        }
    }

    /// Total elapsed time since the timer was created.
    pub fn elapsed(&self) -> Duration {
        self.start.elapsed()
    }

    /// Total frames counted by [`Timer::tick`].
    pub fn total_frames(&self) -> u64 {
        self.total_frames
    }

    /// Mark the end of a frame and return the time since the previous one.
    pub fn tick(&mut self) -> Duration {
        self.tick_at(Instant::now())
    }

    /// Average frames per second since the last sample, once at least
    /// `interval` has passed. Resets the sampling window when it returns.
    pub fn sample_fps(&mut self, interval: Duration) -> Option<f32> {
        self.sample_fps_at(Instant::now(), interval)
    }

    /// Reset the timer to the current time.
    pub fn reset(&mut self) {
        *self = Self::new();
    }

    fn tick_at(&mut self, now: Instant) -> Duration {
        let delta = now.saturating_duration_since(self.last_tick);
        self.last_tick = now;
        self.window_frames += 1;
        self.total_frames += 1;
        delta
    }

    fn sample_fps_at(&mut self, now: Instant, interval: Duration) -> Option<f32> {
        let span = now.saturating_duration_since(self.window_start);
        if span < interval || span.is_zero() {
            return None;
        }
        let fps = self.window_frames as f32 / span.as_secs_f32();
        self.window_start = now;
        self.window_frames = 0;
        Some(fps)
    }
}

impl Default for Timer {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tick_counts_frames() {
        let mut timer = Timer::new();
        let base = timer.last_tick;
        let delta = timer.tick_at(base + Duration::from_millis(16));
        assert_eq!(delta, Duration::from_millis(16));
        timer.tick_at(base + Duration::from_millis(32));
        assert_eq!(timer.total_frames(), 2);
    }

    #[test]
    fn test_fps_sample_waits_for_interval() {
        let mut timer = Timer::new();
        let base = timer.window_start;
        for i in 1..=30 {
            timer.tick_at(base + Duration::from_millis(i * 10));
        }
        assert!(timer.sample_fps_at(base + Duration::from_millis(300), Duration::from_secs(1)).is_none());

        for i in 31..=100 {
            timer.tick_at(base + Duration::from_millis(i * 10));
        }
        let fps = timer
            .sample_fps_at(base + Duration::from_secs(1), Duration::from_secs(1))
            .unwrap();
        assert!((fps - 100.0).abs() < 0.01);

        // Window restarts after a sample.
        assert!(timer.sample_fps_at(base + Duration::from_secs(1), Duration::from_secs(1)).is_none());
        assert_eq!(timer.total_frames(), 100);
    }
}
