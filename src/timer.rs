use std::time::{Duration, Instant};

/// Wall-clock timer for run-loop progress reporting.
pub struct Timer {
    accumulated: Duration,
    running_since: Option<Instant>,
}

impl Timer {
    pub fn started() -> Self {
        Timer {
            accumulated: Duration::ZERO,
            running_since: Some(Instant::now()),
        }
    }

    /// Starts the timer. If it is already running, this is a no-op.
    pub fn start(&mut self) {
        if self.running_since.is_none() {
            self.running_since = Some(Instant::now());
        }
    }

    /// Pauses the timer. If it is not running, this is a no-op.
    pub fn pause(&mut self) {
        if let Some(since) = self.running_since.take() {
            self.accumulated += since.elapsed();
        }
    }

    /// Total time the timer has been running.
    pub fn elapsed(&self) -> Duration {
        match self.running_since {
            Some(since) => self.accumulated + since.elapsed(),
            None => self.accumulated,
        }
    }

    pub fn elapsed_secs(&self) -> u64 {
        self.elapsed().as_secs()
    }
}
