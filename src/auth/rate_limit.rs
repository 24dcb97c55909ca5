use std::collections::VecDeque;
use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};
use tracing::debug;

use crate::config::AppConfig;

/// Rejection carrying how long the caller has to wait.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateLimited {
    pub retry_after: Duration,
}

impl RateLimited {
    pub fn message(&self) -> String {
        let minutes = self.retry_after.as_secs().div_ceil(60).max(1);
        if minutes == 1 {
            "Too many attempts. Please try again in 1 minute.".to_string()
        } else {
            format!("Too many attempts. Please try again in {minutes} minutes.")
        }
    }
}

/// Counts attempts per key over a sliding window.
pub struct SlidingWindowLimiter {
    max_attempts: usize,
    window: Duration,
    attempts: DashMap<String, VecDeque<Instant>>,
}

impl SlidingWindowLimiter {
    pub fn new(max_attempts: usize, window: Duration) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            window,
            attempts: DashMap::new(),
        }
    }

    /// Records an attempt for `key` unless the window is already full.
    pub fn check(&self, key: &str) -> Result<(), RateLimited> {
        self.check_at(key, Instant::now())
    }

    fn check_at(&self, key: &str, now: Instant) -> Result<(), RateLimited> {
        let mut entry = self.attempts.entry(key.to_string()).or_default();
        let history = entry.value_mut();

        while let Some(oldest) = history.front() {
            if now.saturating_duration_since(*oldest) >= self.window {
                history.pop_front();
            } else {
                break;
            }
        }

        if history.len() >= self.max_attempts {
            let oldest = history.front().copied().unwrap_or(now);
            let retry_after = self
                .window
                .saturating_sub(now.saturating_duration_since(oldest));
            debug!(key, attempts = history.len(), "rate limit exceeded");
            return Err(RateLimited { retry_after });
        }

        history.push_back(now);
        Ok(())
    }

    pub fn reset(&self, key: &str) {
        self.attempts.remove(key);
    }

    /// Drops keys whose attempts have all left the window.
    pub fn prune(&self) {
        let now = Instant::now();
        self.attempts.retain(|_, history| {
            history
                .back()
                .map(|latest| now.saturating_duration_since(*latest) < self.window)
                .unwrap_or(false)
        });
    }

    pub fn tracked_keys(&self) -> usize {
        self.attempts.len()
    }
}

pub struct AuthRateLimits {
    pub signup_by_ip: SlidingWindowLimiter,
    pub login_by_ip: SlidingWindowLimiter,
    pub login_by_ip_email: SlidingWindowLimiter,
}

impl AuthRateLimits {
    pub fn from_config(config: &AppConfig) -> Self {
        let window = Duration::from_secs(config.rate_limit_window_seconds.max(1));
        Self {
            signup_by_ip: SlidingWindowLimiter::new(config.signup_rate_limit, window),
            login_by_ip: SlidingWindowLimiter::new(config.login_rate_limit, window),
            login_by_ip_email: SlidingWindowLimiter::new(config.login_email_rate_limit, window),
        }
    }

    pub fn login_key(ip: &str, email: &str) -> String {
        format!("{ip}|{email}")
    }

    pub fn prune(&self) {
        self.signup_by_ip.prune();
        self.login_by_ip.prune();
        self.login_by_ip_email.prune();
    }

    pub fn tracked_keys(&self) -> usize {
        self.signup_by_ip.tracked_keys()
            + self.login_by_ip.tracked_keys()
            + self.login_by_ip_email.tracked_keys()
    }

    /// Prunes idle keys every `every` until the runtime shuts down.
    pub fn spawn_pruner(self: Arc<Self>, every: Duration) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = interval(every);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                let before = self.tracked_keys();
                self.prune();
                debug!(before, after = self.tracked_keys(), "pruned rate limiter keys");
            }
        })
    }
}
