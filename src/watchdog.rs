//! Session idle timeout.

use crate::scheduler::ScheduleHandle;

/// Tracks the last player activity against a fixed timeout, in elapsed seconds.
#[derive(Debug, Clone)]
pub struct IdleWatchdog {
    timeout: f64,
    last_activity: f64,
    pub check_task: Option<ScheduleHandle>,
}

impl IdleWatchdog {
    pub fn new(timeout: f64) -> Self {
        Self {
            timeout,
            last_activity: 0.0,
            check_task: None,
        }
    }

    pub fn touch(&mut self, elapsed: f64) {
        self.last_activity = elapsed;
    }

    pub fn idle_for(&self, elapsed: f64) -> f64 {
        (elapsed - self.last_activity).max(0.0)
    }

    pub fn is_expired(&self, elapsed: f64) -> bool {
        self.idle_for(elapsed) > self.timeout
    }
}
