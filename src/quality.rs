//! Heuristic quality scoring for generated text.
//!
//! The score feeds analytics and the orchestrator's post filter. The LLM client's
//! pass/fail gate (`llm::validate`) reuses the helpers here but applies its own rules.

use std::collections::HashSet;

use serde::Serialize;

/// Phrases that indicate a refusal-style or boilerplate model reply.
pub const DISCLAIMER_PHRASES: &[&str] = &[
    "as an ai",
    "as a language model",
    "i cannot",
    "i can't",
    "i apologize",
    "i'm sorry, but",
    "i am unable to",
    "i'm unable to",
];

pub const HIGH_QUALITY_THRESHOLD: f64 = 0.8;
pub const LOW_QUALITY_THRESHOLD: f64 = 0.5;

pub fn find_disclaimer(text: &str) -> Option<&'static str> {
    let lower = text.to_lowercase().replace('\u{2019}', "'");
    DISCLAIMER_PHRASES.iter().copied().find(|phrase| lower.contains(phrase))
}

/// Number of sentence-like segments (split on terminal punctuation, must contain a letter).
pub fn sentence_count(text: &str) -> usize {
    text.split(['.', '!', '?'])
        .filter(|segment| segment.chars().any(char::is_alphabetic))
        .count()
}

/// Lowercased tokens with surrounding punctuation removed.
pub fn words(text: &str) -> Vec<String> {
    text.split_whitespace()
        .map(|token| {
            token
                .trim_matches(|c: char| !c.is_alphanumeric())
                .to_lowercase()
        })
        .filter(|word| !word.is_empty())
        .collect()
}

pub fn unique_word_ratio(text: &str) -> f64 {
    let words = words(text);
    if words.is_empty() {
        return 0.0;
    }
    let unique: HashSet<&str> = words.iter().map(String::as_str).collect();
    unique.len() as f64 / words.len() as f64
}

/// Deterministic 0.0–1.0 score.
pub fn score(text: &str) -> f64 {
    let text = text.trim();
    let length = text.chars().count();
    let mut score: f64 = 1.0;

    if length < 50 {
        score -= 0.3;
    } else if length < 100 {
        score -= 0.1;
    }

    if sentence_count(text) < 2 {
        score -= 0.2;
    }

    if unique_word_ratio(text) < 0.3 {
        score -= 0.2;
    }

    if find_disclaimer(text).is_some() {
        score -= 0.4;
    }

    // Round away float drift so threshold comparisons stay exact.
    f64::clamp((score * 100.0).round() / 100.0, 0.0, 1.0)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum QualityBucket {
    High,
    Medium,
    Low,
}

impl QualityBucket {
    pub fn for_score(score: f64) -> Self {
        if score >= HIGH_QUALITY_THRESHOLD {
            QualityBucket::High
        } else if score < LOW_QUALITY_THRESHOLD {
            QualityBucket::Low
        } else {
            QualityBucket::Medium
        }
    }
}

/// Running aggregate of scores for reporting.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct QualityReport {
    pub count: usize,
    pub mean: f64,
    pub high: usize,
    pub medium: usize,
    pub low: usize,
}

impl QualityReport {
    pub fn push(&mut self, score: f64) {
        self.mean = (self.mean * self.count as f64 + score) / (self.count + 1) as f64;
        self.count += 1;
        match QualityBucket::for_score(score) {
            QualityBucket::High => self.high += 1,
            QualityBucket::Medium => self.medium += 1,
            QualityBucket::Low => self.low += 1,
        }
    }
}
