//! Sliding-window admission control.
//!
//! The limiter keeps the instants of recently admitted calls. Each check
//! prunes entries older than the window, then admits only while fewer than
//! `limit` remain. Rejection is immediate; callers own any retry.
//!
//! State is process-local. Multiple instances of the pipeline each enforce
//! their own window.

use crate::error::{Result, XrError};
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::time::{Duration, Instant};

/// Sliding-window limiter over admitted-call instants.
#[derive(Debug)]
pub struct RateLimiter {
    limit: usize,
    window: Duration,
    admitted: Mutex<VecDeque<Instant>>,
}

impl RateLimiter {
    #[must_use]
    pub fn new(limit: usize, window: Duration) -> Self {
        Self {
            limit,
            window,
            admitted: Mutex::new(VecDeque::with_capacity(limit)),
        }
    }

    /// Admit a call now or fail with `RateLimitExceeded`.
    ///
    /// # Errors
    ///
    /// Returns `XrError::RateLimitExceeded` when the window is full.
    pub fn check(&self) -> Result<()> {
        self.check_at(Instant::now())
    }

    /// Admit a call at `now`.
    ///
    /// # Errors
    ///
    /// Returns `XrError::RateLimitExceeded` when the window is full.
    pub fn check_at(&self, now: Instant) -> Result<()> {
        let mut admitted = self.admitted.lock();
        while let Some(&oldest) = admitted.front() {
            if now.saturating_duration_since(oldest) >= self.window {
                admitted.pop_front();
            } else {
                break;
            }
        }

        if admitted.len() >= self.limit {
            tracing::debug!(
                limit = self.limit,
                window_ms = self.window.as_millis(),
                "rate limit reached"
            );
            return Err(XrError::RateLimitExceeded {
                limit: self.limit,
                window: self.window,
            });
        }

        admitted.push_back(now);
        Ok(())
    }

    /// Calls admitted within the current window as of `now`.
    #[must_use]
    pub fn in_window_at(&self, now: Instant) -> usize {
        self.admitted
            .lock()
            .iter()
            .filter(|&&t| now.saturating_duration_since(t) < self.window)
            .count()
    }

    #[must_use]
    pub const fn limit(&self) -> usize {
        self.limit
    }

    #[must_use]
    pub const fn window(&self) -> Duration {
        self.window
    }
}
