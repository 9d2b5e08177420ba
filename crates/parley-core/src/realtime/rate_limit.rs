//! Per-user sliding-window rate limiting for inbound chat messages.
//!
//! Each user keeps a log of admission instants. A message is admitted if
//! fewer than `max_messages` admissions fall within the trailing window,
//! so no 60-second span ever holds more than the limit.

use std::collections::VecDeque;
use std::time::Duration;

use dashmap::DashMap;
use parley_types::config::RateLimitConfig;
use tokio::time::Instant;

/// Default admissions per window.
const DEFAULT_MAX_MESSAGES: u32 = 60;

/// Default window length.
const DEFAULT_WINDOW: Duration = Duration::from_secs(60);

/// Sliding-window admission control keyed by user id.
pub struct RateLimiter {
    max_messages: u32,
    window: Duration,
    /// Admission instants per user, oldest first.
    windows: DashMap<String, VecDeque<Instant>>,
}

impl RateLimiter {
    pub fn new(max_messages: u32, window: Duration) -> Self {
        Self {
            max_messages,
            window,
            windows: DashMap::new(),
        }
    }

    pub fn from_config(config: &RateLimitConfig) -> Self {
        Self::new(config.max_messages, config.window())
    }

    fn evict(log: &mut VecDeque<Instant>, now: Instant, window: Duration) {
        while log
            .front()
            .is_some_and(|t| now.saturating_duration_since(*t) >= window)
        {
            log.pop_front();
        }
    }

    /// Admit one message from `user_id` if the window has room.
    ///
    /// A rejected attempt is not recorded, so it does not extend the
    /// user's penalty.
    pub fn allow(&self, user_id: &str) -> bool {
        let now = Instant::now();
        let mut entry = self.windows.entry(user_id.to_string()).or_default();
        let log = entry.value_mut();
        Self::evict(log, now, self.window);

        if log.len() >= self.max_messages as usize {
            return false;
        }
        log.push_back(now);
        true
    }

    /// Admissions `user_id` has left in the current window.
    pub fn remaining(&self, user_id: &str) -> u32 {
        let now = Instant::now();
        let used = self
            .windows
            .get_mut(user_id)
            .map(|mut log| {
                Self::evict(&mut log, now, self.window);
                log.len()
            })
            .unwrap_or(0);
        self.max_messages
            .saturating_sub(u32::try_from(used).unwrap_or(u32::MAX))
    }

    /// Forget a user's history.
    pub fn reset(&self, user_id: &str) {
        self.windows.remove(user_id);
    }

    /// Reset all counters (useful for testing).
    pub fn reset_all(&self) {
        self.windows.clear();
    }

    /// Drop users whose logs have fully aged out. Returns how many were removed.
    pub fn prune(&self) -> usize {
        let now = Instant::now();
        let before = self.windows.len();
        self.windows.retain(|_, log| {
            Self::evict(log, now, self.window);
            !log.is_empty()
        });
        before.saturating_sub(self.windows.len())
    }

    /// Users currently holding at least one admission record.
    pub fn tracked_users(&self) -> usize {
        self.windows.len()
    }

    pub fn max_messages(&self) -> u32 {
        self.max_messages
    }

    pub fn window(&self) -> Duration {
        self.window
    }
}

impl Default for RateLimiter {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_MESSAGES, DEFAULT_WINDOW)
    }
}

impl std::fmt::Debug for RateLimiter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RateLimiter")
            .field("max_messages", &self.max_messages)
            .field("window", &self.window)
            .field("tracked_users", &self.windows.len())
            .finish()
    }
}
