use std::collections::BTreeMap;

use chrono::{Duration, NaiveDate};
use serde::Serialize;

use super::TokenUsage;

/// Days of usage history kept in memory.
pub const USAGE_RETENTION_DAYS: i64 = 90;

/// USD per 1000 tokens, matched by model-name prefix. More specific prefixes first.
const PRICE_TABLE: &[(&str, f64)] = &[
    ("gpt-4o-mini", 0.0006),
    ("gpt-4o", 0.01),
    ("gpt-4-turbo", 0.03),
    ("gpt-4", 0.06),
    ("gpt-3.5-turbo", 0.002),
];
const DEFAULT_PRICE_PER_1K: f64 = 0.002;

pub fn price_per_1k(model: &str) -> f64 {
    PRICE_TABLE
        .iter()
        .find(|(prefix, _)| model.starts_with(prefix))
        .map_or(DEFAULT_PRICE_PER_1K, |(_, price)| *price)
}

pub fn estimate_cost(model: &str, usage: &TokenUsage) -> f64 {
    let tokens = u64::from(usage.prompt_tokens) + u64::from(usage.completion_tokens);
    tokens as f64 / 1000.0 * price_per_1k(model)
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct UsageStat {
    pub requests: u64,
    pub tokens_used: u64,
    pub tokens_generated: u64,
    pub cost_estimate: f64,
}

/// Per-day (UTC) usage totals with a rolling retention window.
#[derive(Default)]
pub struct UsageLedger {
    days: BTreeMap<NaiveDate, UsageStat>,
}

impl UsageLedger {
    pub fn record(&mut self, day: NaiveDate, model: &str, usage: &TokenUsage) {
        let stat = self.days.entry(day).or_default();
        stat.requests += 1;
        stat.tokens_used += u64::from(usage.prompt_tokens);
        stat.tokens_generated += u64::from(usage.completion_tokens);
        stat.cost_estimate += estimate_cost(model, usage);

        let cutoff = day - Duration::days(USAGE_RETENTION_DAYS);
        self.days.retain(|d, _| *d > cutoff);
    }

    /// Newest day first.
    pub fn stats(&self) -> Vec<(NaiveDate, UsageStat)> {
        self.days.iter().rev().map(|(d, s)| (*d, s.clone())).collect()
    }

    /// Trailing 7-day cost averaged per day, projected over 30 days.
    pub fn estimated_monthly_cost(&self, today: NaiveDate) -> f64 {
        let start = today - Duration::days(6);
        let week: f64 = self.days.range(start..=today).map(|(_, s)| s.cost_estimate).sum();
        week / 7.0 * 30.0
    }
}
