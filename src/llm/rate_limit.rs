use std::collections::HashMap;

use chrono::{DateTime, Duration, DurationRound, Utc};
use serde::Serialize;

/// Wall-clock hour bucket key, `YYYY-MM-DDTHH` in UTC.
pub fn hour_key(now: DateTime<Utc>) -> String {
    now.format("%Y-%m-%dT%H").to_string()
}

fn hour_start(now: DateTime<Utc>) -> DateTime<Utc> {
    now.duration_trunc(Duration::hours(1)).unwrap_or(now)
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RateLimitStatus {
    pub used: u32,
    pub limit: u32,
    pub remaining: u32,
    pub resets_at: DateTime<Utc>,
}

struct Bucket {
    count: u32,
    expires_at: DateTime<Utc>,
}

/// Hard per-hour ceiling on provider calls. No queueing: once full, calls fail
/// until the hour rolls over.
pub struct HourlyRateLimiter {
    limit: u32,
    buckets: HashMap<String, Bucket>,
}

impl HourlyRateLimiter {
    pub fn new(limit: u32) -> Self {
        Self {
            limit,
            buckets: HashMap::new(),
        }
    }

    pub fn limit(&self) -> u32 {
        self.limit
    }

    /// Count a call against the current bucket. Returns false if the bucket is full.
    pub fn try_acquire(&mut self, now: DateTime<Utc>) -> bool {
        self.purge_expired(now);
        let bucket = self.buckets.entry(hour_key(now)).or_insert(Bucket {
            count: 0,
            expires_at: now,
        });
        if bucket.count >= self.limit {
            return false;
        }
        bucket.count += 1;
        bucket.expires_at = now + Duration::hours(1);
        true
    }

    pub fn status(&self, now: DateTime<Utc>) -> RateLimitStatus {
        let used = self.buckets.get(&hour_key(now)).map_or(0, |b| b.count);
        RateLimitStatus {
            used,
            limit: self.limit,
            remaining: self.limit.saturating_sub(used),
            resets_at: hour_start(now) + Duration::hours(1),
        }
    }

    /// Drop buckets that have not been written for an hour. Returns the number removed.
    pub fn purge_expired(&mut self, now: DateTime<Utc>) -> usize {
        let before = self.buckets.len();
        self.buckets.retain(|_, bucket| bucket.expires_at > now);
        before - self.buckets.len()
    }
}
