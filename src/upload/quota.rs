//! Per-day upload attempt quota.
//!
//! Only kept in memory: a restart resets the count, which at worst allows one
//! extra day's worth of attempts.

use chrono::{DateTime, Utc};

const SECONDS_PER_DAY: i64 = 24 * 60 * 60;

/// Attempts made on the current UTC day
#[derive(Debug, Clone)]
pub struct UploadQuota {
    max_attempts: u32,
    day_since_epoch: i64,
    attempts: u32,
}

impl UploadQuota {
    pub fn new(max_attempts: u32) -> Self {
        Self {
            max_attempts,
            day_since_epoch: i64::MIN,
            attempts: 0,
        }
    }

    /// Count one attempt at `now`
    ///
    /// Resets the count when `now` falls on a later day than the previous
    /// attempt.
    ///
    /// # Returns
    ///
    /// * `true` - The attempt is within the quota and may proceed
    /// * `false` - The quota for today is exhausted
    pub fn try_consume(&mut self, now: DateTime<Utc>) -> bool {
        let day = day_since_epoch(now);
        if day > self.day_since_epoch {
            self.day_since_epoch = day;
            self.attempts = 0;
        }
        self.attempts = self.attempts.saturating_add(1);
        self.attempts <= self.max_attempts
    }

    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }
}

fn day_since_epoch(now: DateTime<Utc>) -> i64 {
    now.timestamp().div_euclid(SECONDS_PER_DAY)
}
