//! Run history and per-day counters.

use std::collections::{BTreeMap, VecDeque};
use std::fmt;
use std::str::FromStr;

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Duration, NaiveDate, Utc};
use parking_lot::Mutex;
use serde::Serialize;

/// Run records kept before the oldest is dropped.
pub const RUN_HISTORY_CAPACITY: usize = 100;
/// Days of daily counters kept, counted back from the newest write.
pub const DAILY_RETENTION_DAYS: i64 = 30;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum RunTrigger {
    Scheduled,
    Manual,
    Test,
}

impl RunTrigger {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunTrigger::Scheduled => "scheduled",
            RunTrigger::Manual => "manual",
            RunTrigger::Test => "test",
        }
    }

    pub fn is_test(&self) -> bool {
        matches!(self, RunTrigger::Test)
    }
}

impl fmt::Display for RunTrigger {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RunTrigger {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "scheduled" => Ok(RunTrigger::Scheduled),
            "manual" => Ok(RunTrigger::Manual),
            "test" => Ok(RunTrigger::Test),
            other => Err(format!("unknown run trigger '{other}'")),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum RunEvent {
    Attempt,
    Success,
    Error,
}

impl RunEvent {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunEvent::Attempt => "attempt",
            RunEvent::Success => "success",
            RunEvent::Error => "error",
        }
    }
}

impl FromStr for RunEvent {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "attempt" => Ok(RunEvent::Attempt),
            "success" => Ok(RunEvent::Success),
            "error" => Ok(RunEvent::Error),
            other => Err(format!("unknown run event '{other}'")),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct RunCounts {
    pub posts_created: u32,
    pub replies_created: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RunRecord {
    pub trigger: RunTrigger,
    pub event: RunEvent,
    pub timestamp: DateTime<Utc>,
    pub counts: RunCounts,
    pub error: Option<String>,
}

impl RunRecord {
    pub fn attempt(trigger: RunTrigger, timestamp: DateTime<Utc>) -> Self {
        Self {
            trigger,
            event: RunEvent::Attempt,
            timestamp,
            counts: RunCounts::default(),
            error: None,
        }
    }

    pub fn success(trigger: RunTrigger, timestamp: DateTime<Utc>, counts: RunCounts) -> Self {
        Self {
            trigger,
            event: RunEvent::Success,
            timestamp,
            counts,
            error: None,
        }
    }

    pub fn error(trigger: RunTrigger, timestamp: DateTime<Utc>, counts: RunCounts, message: String) -> Self {
        Self {
            trigger,
            event: RunEvent::Error,
            timestamp,
            counts,
            error: Some(message),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct DailyStat {
    pub posts: u32,
    pub replies: u32,
    pub runs: u32,
    pub errors: u32,
}

/// Increment applied to a day's counters. Counters only grow.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DailyDelta {
    pub posts: u32,
    pub replies: u32,
    pub runs: u32,
    pub errors: u32,
}

impl DailyDelta {
    pub fn run() -> Self {
        Self {
            runs: 1,
            ..Self::default()
        }
    }

    pub fn error() -> Self {
        Self {
            errors: 1,
            ..Self::default()
        }
    }

    pub fn output(posts: u32, replies: u32) -> Self {
        Self {
            posts,
            replies,
            ..Self::default()
        }
    }
}

impl DailyStat {
    fn apply(&mut self, delta: DailyDelta) {
        self.posts += delta.posts;
        self.replies += delta.replies;
        self.runs += delta.runs;
        self.errors += delta.errors;
    }
}

/// Where the orchestrator reports runs and day counters.
#[async_trait]
pub trait TelemetrySink: Send + Sync {
    /// Append a record, evicting beyond [`RUN_HISTORY_CAPACITY`].
    async fn record_run(&self, record: RunRecord) -> Result<()>;
    /// Add to `day`'s counters and purge days older than the retention window.
    async fn add_daily(&self, day: NaiveDate, delta: DailyDelta) -> Result<()>;
    /// Newest first.
    async fn recent_runs(&self, limit: usize) -> Result<Vec<RunRecord>>;
    /// Error records only, newest first.
    async fn recent_errors(&self, limit: usize) -> Result<Vec<RunRecord>>;
    /// Retained days, newest first.
    async fn daily_stats(&self) -> Result<Vec<(NaiveDate, DailyStat)>>;
    /// Timestamp of the newest non-test attempt.
    async fn last_run_at(&self) -> Result<Option<DateTime<Utc>>>;

    /// Sums across retained days.
    async fn totals(&self) -> Result<DailyStat> {
        let mut totals = DailyStat::default();
        for (_, stat) in self.daily_stats().await? {
            totals.apply(DailyDelta {
                posts: stat.posts,
                replies: stat.replies,
                runs: stat.runs,
                errors: stat.errors,
            });
        }
        Ok(totals)
    }
}

#[derive(Default)]
struct MemoryState {
    runs: VecDeque<RunRecord>,
    days: BTreeMap<NaiveDate, DailyStat>,
}

/// Bounded in-memory sink for ephemeral runs and tests.
#[derive(Default)]
pub struct MemoryTelemetry {
    state: Mutex<MemoryState>,
}

impl MemoryTelemetry {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl TelemetrySink for MemoryTelemetry {
    async fn record_run(&self, record: RunRecord) -> Result<()> {
        let mut state = self.state.lock();
        if state.runs.len() == RUN_HISTORY_CAPACITY {
            state.runs.pop_front();
        }
        state.runs.push_back(record);
        Ok(())
    }

    async fn add_daily(&self, day: NaiveDate, delta: DailyDelta) -> Result<()> {
        let mut state = self.state.lock();
        state.days.entry(day).or_default().apply(delta);
        let cutoff = day - Duration::days(DAILY_RETENTION_DAYS);
        state.days.retain(|d, _| *d > cutoff);
        Ok(())
    }

    async fn recent_runs(&self, limit: usize) -> Result<Vec<RunRecord>> {
        Ok(self.state.lock().runs.iter().rev().take(limit).cloned().collect())
    }

    async fn recent_errors(&self, limit: usize) -> Result<Vec<RunRecord>> {
        Ok(self
            .state
            .lock()
            .runs
            .iter()
            .rev()
            .filter(|r| r.event == RunEvent::Error)
            .take(limit)
            .cloned()
            .collect())
    }

    async fn daily_stats(&self) -> Result<Vec<(NaiveDate, DailyStat)>> {
        Ok(self.state.lock().days.iter().rev().map(|(d, s)| (*d, *s)).collect())
    }

    async fn last_run_at(&self) -> Result<Option<DateTime<Utc>>> {
        Ok(self
            .state
            .lock()
            .runs
            .iter()
            .rev()
            .find(|r| r.event == RunEvent::Attempt && !r.trigger.is_test())
            .map(|r| r.timestamp))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn at(hour: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, 1, hour, 0, 0).unwrap()
    }

    #[tokio::test]
    async fn run_history_is_a_ring_buffer() {
        let sink = MemoryTelemetry::new();
        for i in 0..(RUN_HISTORY_CAPACITY + 5) {
            let ts = at(0) + Duration::minutes(i as i64);
            sink.record_run(RunRecord::attempt(RunTrigger::Manual, ts)).await.unwrap();
        }

        let runs = sink.recent_runs(usize::MAX).await.unwrap();
        assert_eq!(runs.len(), RUN_HISTORY_CAPACITY);
        assert_eq!(runs[0].timestamp, at(0) + Duration::minutes(104));
        assert_eq!(runs.last().unwrap().timestamp, at(0) + Duration::minutes(5));
    }

    #[tokio::test]
    async fn last_run_ignores_test_runs_and_outcomes() {
        let sink = MemoryTelemetry::new();
        assert_eq!(sink.last_run_at().await.unwrap(), None);

        sink.record_run(RunRecord::attempt(RunTrigger::Scheduled, at(1))).await.unwrap();
        sink.record_run(RunRecord::success(RunTrigger::Scheduled, at(2), RunCounts::default()))
            .await
            .unwrap();
        sink.record_run(RunRecord::attempt(RunTrigger::Test, at(3))).await.unwrap();

        assert_eq!(sink.last_run_at().await.unwrap(), Some(at(1)));
    }

    #[tokio::test]
    async fn recent_errors_filters_newest_first() {
        let sink = MemoryTelemetry::new();
        sink.record_run(RunRecord::error(RunTrigger::Manual, at(1), RunCounts::default(), "a".into()))
            .await
            .unwrap();
        sink.record_run(RunRecord::attempt(RunTrigger::Manual, at(2))).await.unwrap();
        sink.record_run(RunRecord::error(RunTrigger::Manual, at(3), RunCounts::default(), "b".into()))
            .await
            .unwrap();

        let errors = sink.recent_errors(10).await.unwrap();
        let messages: Vec<_> = errors.iter().map(|r| r.error.as_deref().unwrap()).collect();
        assert_eq!(messages, vec!["b", "a"]);
    }

    #[tokio::test]
    async fn daily_counters_accumulate_and_expire() {
        let sink = MemoryTelemetry::new();
        let day = NaiveDate::from_ymd_opt(2026, 3, 1).unwrap();

        sink.add_daily(day, DailyDelta::run()).await.unwrap();
        sink.add_daily(day, DailyDelta::output(2, 5)).await.unwrap();
        sink.add_daily(day, DailyDelta::error()).await.unwrap();

        let later = day + Duration::days(DAILY_RETENTION_DAYS - 1);
        sink.add_daily(later, DailyDelta::run()).await.unwrap();

        let stats = sink.daily_stats().await.unwrap();
        assert_eq!(stats.len(), 2);
        assert_eq!(
            stats[1].1,
            DailyStat {
                posts: 2,
                replies: 5,
                runs: 1,
                errors: 1
            }
        );
        assert_eq!(sink.totals().await.unwrap().runs, 2);

        sink.add_daily(day + Duration::days(DAILY_RETENTION_DAYS), DailyDelta::run())
            .await
            .unwrap();
        let stats = sink.daily_stats().await.unwrap();
        assert_eq!(stats.len(), 2);
        assert!(stats.iter().all(|(d, _)| *d > day));
    }
}
