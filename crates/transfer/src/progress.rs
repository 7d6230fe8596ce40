use std::time::Duration;

use tokio::time::Instant;

/// Decides which byte counts are worth a progress event.
///
/// Emits on a change of at least `step_percent`, after `interval` has
/// passed since the last emission, or on reaching 100%. Never emits the
/// same or a lower percentage twice.
#[derive(Debug)]
pub struct ProgressThrottle {
    step_percent: f64,
    interval: Duration,
    last_percent: Option<f64>,
    last_emit: Instant,
}

impl ProgressThrottle {
    pub fn new(step_percent: f64, interval: Duration) -> Self {
        Self {
            step_percent,
            interval,
            last_percent: None,
            last_emit: Instant::now(),
        }
    }

    /// Percentage of `declared_size` covered by `bytes`, clamped to 100.
    /// An empty declared size counts as complete.
    pub fn percent(bytes: u64, declared_size: u64) -> f64 {
        if declared_size == 0 {
            return 100.0;
        }
        (bytes as f64 * 100.0 / declared_size as f64).min(100.0)
    }

    /// Records `bytes` received and returns the percentage to report, if any.
    pub fn observe(&mut self, bytes: u64, declared_size: u64) -> Option<f64> {
        let pct = Self::percent(bytes, declared_size);
        let last = self.last_percent.unwrap_or(0.0);
        if self.last_percent.is_some() && pct <= last {
            return None;
        }

        let due = pct >= 100.0
            || pct - last >= self.step_percent
            || self.last_emit.elapsed() >= self.interval;
        if !due {
            return None;
        }
        self.last_percent = Some(pct);
        self.last_emit = Instant::now();
        Some(pct)
    }

    /// Returns 100 unless it was already reported.
    pub fn complete(&mut self) -> Option<f64> {
        if self.last_percent.is_some_and(|p| p >= 100.0) {
            return None;
        }
        self.last_percent = Some(100.0);
        self.last_emit = Instant::now();
        Some(100.0)
    }

    pub fn last_percent(&self) -> Option<f64> {
        self.last_percent
    }
}
