use std::sync::Mutex;
use std::sync::PoisonError;
use std::time::Duration;
use std::time::Instant;

/// Lets one log line through per interval.
#[derive(Debug)]
pub struct LogEvery {
    interval: Duration,
    last_logged: Mutex<Option<Instant>>,
}

impl LogEvery {
    pub fn new(interval: Duration) -> Self {
        Self {
            interval,
            last_logged: Mutex::new(None),
        }
    }

    /// Returns true if nothing was logged within the last interval, and
    /// records the current time if so.
    pub fn should_log(&self) -> bool {
        let now = Instant::now();
        let mut last = self
            .last_logged
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        match *last {
            Some(at) if now.duration_since(at) < self.interval => false,
            _ => {
                *last = Some(now);
                true
            }
        }
    }
}
