// Copyright 2025 rrlink Authors
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Rate Limiting for Cloud Calls
//!
//! Provider quotas are expressed as a stack of windows per operation
//! category (for example "1 per second, 3 per minute, 10 per hour, 20 per
//! day" for logins). This module enforces such stacks locally so that calls
//! are rejected before they reach the network.
//!
//! # Architecture
//!
//! - Each category owns an ordered list of [`Rate`] rules, smallest window first
//! - Windows are rolling: a window counts the admissions made during the
//!   last `interval`, not since a calendar boundary
//! - Acquisition is all-or-nothing: the operation is recorded only if every
//!   window has room
//! - Categories never share counters
//!
//! # Example
//!
//! ```
//! use rrlink_common::rate_limit::{RateLimiter, LOGIN_RATES};
//!
//! let limiter = RateLimiter::new().with_category("login", &LOGIN_RATES);
//!
//! assert!(limiter.try_acquire("login").is_ok());
//! // A second login within the same second is rejected
//! assert!(limiter.try_acquire("login").is_err());
//! ```

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};

use crate::protocol::error::{Result, RrError};

/// One quota window: at most `limit` operations per rolling `interval`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Rate {
    /// Maximum admissions inside one window
    pub limit: u32,
    /// Window length
    pub interval: Duration,
}

impl Rate {
    pub const fn new(limit: u32, interval: Duration) -> Self {
        Self { limit, interval }
    }

    pub const fn per_second(limit: u32) -> Self {
        Self::new(limit, Duration::from_secs(1))
    }

    pub const fn per_minute(limit: u32) -> Self {
        Self::new(limit, Duration::from_secs(60))
    }

    pub const fn per_hour(limit: u32) -> Self {
        Self::new(limit, Duration::from_secs(60 * 60))
    }

    pub const fn per_day(limit: u32) -> Self {
        Self::new(limit, Duration::from_secs(24 * 60 * 60))
    }
}

/// Quota for login and verification-code requests.
pub const LOGIN_RATES: [Rate; 4] = [
    Rate::per_second(1),
    Rate::per_minute(3),
    Rate::per_hour(10),
    Rate::per_day(20),
];

/// Quota for home data requests.
pub const HOME_DATA_RATES: [Rate; 4] = [
    Rate::per_second(1),
    Rate::per_minute(5),
    Rate::per_hour(15),
    Rate::per_day(40),
];

/// Result of a rate limit check.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum RateLimitResult {
    /// Operation admitted and recorded
    Allowed,
    /// Operation rejected; nothing was recorded
    RateLimited {
        /// Time until the blocking window has room again
        retry_after: Duration,
    },
}

impl RateLimitResult {
    /// Returns whether the operation is allowed.
    pub fn is_allowed(&self) -> bool {
        matches!(self, Self::Allowed)
    }

    /// Returns the retry-after duration if rate limited.
    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            Self::Allowed => None,
            Self::RateLimited { retry_after } => Some(*retry_after),
        }
    }
}

/// Rolling windows of one category.
///
/// A single log of admission instants serves every rule: a window's count
/// is the number of entries younger than its interval.
#[derive(Debug)]
struct CategoryWindows {
    rules: Vec<Rate>,
    admitted: VecDeque<Instant>,
}

impl CategoryWindows {
    fn new(rules: &[Rate]) -> Self {
        let mut rules = rules.to_vec();
        rules.sort_by_key(|r| r.interval);
        Self {
            rules,
            admitted: VecDeque::new(),
        }
    }

    fn longest_interval(&self) -> Duration {
        self.rules.last().map(|r| r.interval).unwrap_or_default()
    }

    fn try_admit(&mut self, now: Instant) -> RateLimitResult {
        let horizon = self.longest_interval();
        while let Some(&oldest) = self.admitted.front() {
            if now.saturating_duration_since(oldest) >= horizon {
                self.admitted.pop_front();
            } else {
                break;
            }
        }

        let mut retry_after = Duration::ZERO;
        for rule in &self.rules {
            let in_window: Vec<&Instant> = self
                .admitted
                .iter()
                .filter(|&&t| now.saturating_duration_since(t) < rule.interval)
                .collect();

            if in_window.len() as u64 >= u64::from(rule.limit) {
                // Room appears once the oldest admission that keeps the
                // window full has aged out
                let idx = in_window.len() - rule.limit as usize;
                let wait = match in_window.get(idx) {
                    Some(&&t) => (t + rule.interval).saturating_duration_since(now),
                    None => rule.interval,
                };
                retry_after = retry_after.max(wait);
            }
        }

        if retry_after > Duration::ZERO {
            return RateLimitResult::RateLimited { retry_after };
        }

        self.admitted.push_back(now);
        RateLimitResult::Allowed
    }

    fn len(&self) -> usize {
        self.admitted.len()
    }
}

/// Multi-window rate limiter keyed by operation category.
///
/// # Thread Safety
///
/// All category state lives behind one mutex, so the check and the
/// recording of an admission happen as one step. Cloning is cheap and
/// shares the counters.
#[derive(Clone, Debug, Default)]
pub struct RateLimiter {
    categories: Arc<Mutex<HashMap<String, CategoryWindows>>>,
}

impl RateLimiter {
    /// Creates a limiter with no categories configured.
    pub fn new() -> Self {
        Self::default()
    }

    /// Configures (or replaces) the rules of a category.
    pub fn with_category(self, category: impl Into<String>, rules: &[Rate]) -> Self {
        self.set_category(category, rules);
        self
    }

    pub fn set_category(&self, category: impl Into<String>, rules: &[Rate]) {
        let mut categories = self.categories.lock().unwrap_or_else(PoisonError::into_inner);
        categories.insert(category.into(), CategoryWindows::new(rules));
    }

    /// Tries to admit one operation of `category`.
    ///
    /// Categories without rules are always admitted.
    pub fn check(&self, category: &str) -> RateLimitResult {
        self.check_at(category, Instant::now())
    }

    /// Same as [`check`](Self::check) with an explicit clock reading.
    pub fn check_at(&self, category: &str, now: Instant) -> RateLimitResult {
        let mut categories = self.categories.lock().unwrap_or_else(PoisonError::into_inner);
        match categories.get_mut(category) {
            Some(windows) => windows.try_admit(now),
            None => {
                tracing::debug!("no rate limit configured for category '{}'", category);
                RateLimitResult::Allowed
            }
        }
    }

    /// Admits one operation or fails with [`RrError::RateLimitExceeded`].
    pub fn try_acquire(&self, category: &str) -> Result<()> {
        self.acquire_at(category, Instant::now())
    }

    pub fn acquire_at(&self, category: &str, now: Instant) -> Result<()> {
        match self.check_at(category, now) {
            RateLimitResult::Allowed => Ok(()),
            RateLimitResult::RateLimited { retry_after } => {
                tracing::info!(
                    "rate limit reached for '{}', retry after {:?}",
                    category,
                    retry_after
                );
                Err(RrError::RateLimitExceeded {
                    category: category.to_string(),
                    retry_after,
                })
            }
        }
    }

    /// Number of admissions currently remembered for `category`.
    pub fn recorded(&self, category: &str) -> usize {
        let categories = self.categories.lock().unwrap_or_else(PoisonError::into_inner);
        categories.get(category).map(CategoryWindows::len).unwrap_or(0)
    }
}
