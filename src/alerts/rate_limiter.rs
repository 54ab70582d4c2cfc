use chrono::{DateTime, Duration, Utc};
use std::collections::VecDeque;

/// Global cap on alert dispatches over a sliding one-minute window
#[derive(Debug)]
pub struct RateLimiter {
    /// Maximum number of dispatches allowed per window
    max_per_window: usize,
    window: Duration,
    /// Times of the dispatches still inside the window
    recent: VecDeque<DateTime<Utc>>,
}

impl Default for RateLimiter {
    fn default() -> Self {
        Self::new(30)
    }
}

impl RateLimiter {
    /// # Arguments
    ///
    /// * `max_per_minute` - Maximum number of dispatches allowed per minute
    pub fn new(max_per_minute: usize) -> Self {
        Self {
            max_per_window: max_per_minute,
            window: Duration::minutes(1),
            recent: VecDeque::new(),
        }
    }

    /// Claim a slot at `now`; returns `false` when the window is full
    pub fn try_acquire_at(&mut self, now: DateTime<Utc>) -> bool {
        self.expire(now);
        if self.recent.len() >= self.max_per_window {
            return false;
        }
        self.recent.push_back(now);
        true
    }

    pub fn try_acquire(&mut self) -> bool {
        self.try_acquire_at(Utc::now())
    }

    /// Dispatches counted in the window ending at `now`
    pub fn current_count_at(&mut self, now: DateTime<Utc>) -> usize {
        self.expire(now);
        self.recent.len()
    }

    fn expire(&mut self, now: DateTime<Utc>) {
        let cutoff = now - self.window;
        self.recent.retain(|&time| time > cutoff);
    }
}
