use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use chrono::Duration;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use crate::pipeline::Orchestrator;

/// How often the scheduler checks whether a run is due.
const TICK_INTERVAL: std::time::Duration = std::time::Duration::from_secs(60);

/// Generation cadence.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum Schedule {
    Hourly,
    #[default]
    TwiceDaily,
    Daily,
    /// Never fires on its own; runs only via the manual entry points.
    Manual,
}

impl Schedule {
    /// Minimum spacing between scheduled runs. `None` for manual.
    pub fn interval(&self) -> Option<Duration> {
        match self {
            Schedule::Hourly => Some(Duration::hours(1)),
            Schedule::TwiceDaily => Some(Duration::hours(12)),
            Schedule::Daily => Some(Duration::hours(24)),
            Schedule::Manual => None,
        }
    }

    /// Assumed runs per day when splitting the daily quota.
    pub fn runs_per_day(&self) -> u32 {
        match self {
            Schedule::Hourly => 24,
            Schedule::TwiceDaily => 2,
            Schedule::Daily | Schedule::Manual => 1,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Schedule::Hourly => "hourly",
            Schedule::TwiceDaily => "twicedaily",
            Schedule::Daily => "daily",
            Schedule::Manual => "manual",
        }
    }
}

impl fmt::Display for Schedule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Schedule {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "hourly" => Ok(Schedule::Hourly),
            "twicedaily" => Ok(Schedule::TwiceDaily),
            "daily" => Ok(Schedule::Daily),
            "manual" => Ok(Schedule::Manual),
            other => Err(format!(
                "schedule '{other}': must be one of hourly, twicedaily, daily, manual"
            )),
        }
    }
}

/// Lock guaranteeing at most one in-flight batch across the scheduler and the server.
pub type RunLock = Arc<Mutex<()>>;

/// Main scheduler loop. Wakes every minute and runs a scheduled batch when one is due.
pub async fn scheduler_loop(orchestrator: Arc<Orchestrator>, run_lock: RunLock, cancel: CancellationToken) {
    info!(schedule = %orchestrator.schedule(), "scheduler started");

    loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                info!("scheduler shutting down");
                return;
            }
            _ = tokio::time::sleep(TICK_INTERVAL) => {}
        }

        tick(&orchestrator, &run_lock).await;
    }
}

async fn tick(orchestrator: &Orchestrator, run_lock: &RunLock) {
    // Due check runs under the lock as well
    let Ok(_guard) = run_lock.try_lock() else {
        debug!("run already in progress, skipping tick");
        return;
    };

    match orchestrator.run_scheduled().await {
        Ok(Some(summary)) => {
            info!(
                posts = summary.posts_created,
                replies = summary.replies_created,
                "scheduled run complete"
            );
        }
        Ok(None) => {}
        Err(e) => {
            error!(kind = e.kind(), error = %e, "scheduled run failed");
        }
    }
}
