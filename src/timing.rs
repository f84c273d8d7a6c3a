//! Phase timing.

use std::time::{Duration, Instant};

/// A simple timer for measuring run phase durations.
pub struct Timer {
    name: &'static str,
    start: Instant,
}

impl Timer {
    /// Start a new timer with the given phase name.
    pub fn start(name: &'static str) -> Self {
        tracing::trace!(phase = name, "phase started");
        Self {
            name,
            start: Instant::now(),
        }
    }

    /// Finish the timer and log the elapsed time.
    pub fn finish(self) -> Duration {
        let elapsed = self.start.elapsed();
        let secs = elapsed.as_secs_f64();
        if secs >= 60.0 {
            tracing::info!(phase = self.name, "[{:.1}m] {}", secs / 60.0, self.name);
        } else {
            tracing::debug!(phase = self.name, "[{:.1}s] {}", secs, self.name);
        }
        elapsed
    }
}
