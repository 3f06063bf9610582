//! Sliding-window request limiter, keyed by user.

use std::collections::{HashMap, VecDeque};
use std::time::{Duration, Instant};

use tokio::sync::Mutex;
use tracing::debug;

/// Quota left after a check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Quota {
    /// Privileged caller, never counted.
    Unlimited,
    Remaining(u32),
}

impl Quota {
    /// Numeric form, with `-1` standing for unlimited.
    pub fn as_i64(self) -> i64 {
        match self {
            Quota::Unlimited => -1,
            Quota::Remaining(n) => n as i64,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Decision {
    pub allowed: bool,
    pub quota: Quota,
}

pub struct RateLimiter {
    max_requests: u32,
    window: Duration,
    records: Mutex<HashMap<u64, VecDeque<Instant>>>,
}

impl RateLimiter {
    pub fn new(max_requests: u32, window: Duration) -> Self {
        Self {
            max_requests,
            window,
            records: Mutex::new(HashMap::new()),
        }
    }

    pub fn max_requests(&self) -> u32 {
        self.max_requests
    }

    pub fn window(&self) -> Duration {
        self.window
    }

    pub async fn check(&self, user_id: u64, is_privileged: bool) -> Decision {
        self.check_at(user_id, is_privileged, Instant::now()).await
    }

    /// Check and, when allowed, record a request made at `now`.
    ///
    /// Stale timestamps are purged before the ceiling is compared, so a
    /// rejected call still cleans the record. Rejected calls are not recorded.
    pub async fn check_at(&self, user_id: u64, is_privileged: bool, now: Instant) -> Decision {
        if is_privileged {
            return Decision {
                allowed: true,
                quota: Quota::Unlimited,
            };
        }

        let mut records = self.records.lock().await;
        let stamps = records.entry(user_id).or_default();
        purge(stamps, now, self.window);

        let count = stamps.len() as u32;
        if count >= self.max_requests {
            debug!("User {user_id} over limit ({count}/{})", self.max_requests);
            return Decision {
                allowed: false,
                quota: Quota::Remaining(0),
            };
        }

        stamps.push_back(now);
        Decision {
            allowed: true,
            quota: Quota::Remaining(self.max_requests - count - 1),
        }
    }

    /// Requests currently counted against a user, without recording one.
    #[cfg(test)]
    pub async fn usage_at(&self, user_id: u64, now: Instant) -> u32 {
        let mut records = self.records.lock().await;
        match records.get_mut(&user_id) {
            Some(stamps) => {
                purge(stamps, now, self.window);
                stamps.len() as u32
            }
            None => 0,
        }
    }

    /// Drop users whose whole history has aged out. Returns how many were removed.
    pub async fn sweep(&self) -> usize {
        self.sweep_at(Instant::now()).await
    }

    pub async fn sweep_at(&self, now: Instant) -> usize {
        let mut records = self.records.lock().await;
        let before = records.len();
        records.retain(|_, stamps| {
            purge(stamps, now, self.window);
            !stamps.is_empty()
        });
        before - records.len()
    }

    pub async fn tracked_users(&self) -> usize {
        self.records.lock().await.len()
    }
}

/// Remove timestamps that are not strictly inside `(now - window, now]`.
fn purge(stamps: &mut VecDeque<Instant>, now: Instant, window: Duration) {
    let Some(cutoff) = now.checked_sub(window) else {
        return;
    };
    while stamps.front().is_some_and(|t| *t <= cutoff) {
        stamps.pop_front();
    }
}
