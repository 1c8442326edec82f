//! Wall-clock start/end bookkeeping.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Start and end time of some piece of work
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Stopwatch {
    /// When the work started
    pub start: Option<DateTime<Utc>>,
    /// When the work ended
    pub end: Option<DateTime<Utc>>,
}

impl Stopwatch {
    /// Create an unstarted stopwatch
    #[must_use]
    pub const fn new() -> Self {
        Self {
            start: None,
            end: None,
        }
    }

    /// Create a stopwatch started now
    #[must_use]
    pub fn started() -> Self {
        Self {
            start: Some(Utc::now()),
            end: None,
        }
    }

    /// Record the start time; a second call keeps the first value
    pub fn start(&mut self) {
        if self.start.is_none() {
            self.start = Some(Utc::now());
        }
    }

    /// Record the end time, starting the watch first if needed
    pub fn stop(&mut self) {
        self.start();
        self.end = Some(Utc::now());
    }

    /// Whether the watch was started
    #[must_use]
    pub const fn has_started(&self) -> bool {
        self.start.is_some()
    }

    /// Whether the watch was stopped
    #[must_use]
    pub const fn has_ended(&self) -> bool {
        self.end.is_some()
    }

    /// Elapsed time, if both ends are known
    #[must_use]
    pub fn elapsed(&self) -> Option<chrono::Duration> {
        Some(self.end? - self.start?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_is_blank() {
        let sw = Stopwatch::new();
        assert!(!sw.has_started());
        assert!(!sw.has_ended());
        assert!(sw.elapsed().is_none());
    }

    #[test]
    fn test_start_is_sticky() {
        let mut sw = Stopwatch::started();
        let first = sw.start;
        sw.start();
        assert_eq!(sw.start, first);
    }

    #[test]
    fn test_stop_implies_start() {
        let mut sw = Stopwatch::new();
        sw.stop();
        assert!(sw.has_started());
        assert!(sw.elapsed().unwrap() >= chrono::Duration::zero());
    }
}
