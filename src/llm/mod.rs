//! Client for the provider's chat-completion API.
//!
//! Caching, the hourly request ceiling, usage accounting and the error log live
//! inside [`LlmClient`] and are shared by every caller in the process.

pub mod cache;
pub mod client;
pub mod rate_limit;
pub mod usage;
pub mod validate;

use serde::{Deserialize, Serialize};

use crate::config::ProviderConfig;

pub use client::{ClientSettings, HealthReport, LlmClient};
pub use usage::UsageStat;

/// Parameters sent with a prompt. Part of the cache key, so every field that
/// changes the provider's answer belongs here.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct GenerationOptions {
    pub model: String,
    pub max_tokens: u32,
    pub temperature: f64,
    pub top_p: f64,
    pub frequency_penalty: f64,
    pub presence_penalty: f64,
    pub system: Option<String>,
}

impl From<&ProviderConfig> for GenerationOptions {
    fn from(provider: &ProviderConfig) -> Self {
        Self {
            model: provider.model.clone(),
            max_tokens: provider.max_tokens,
            temperature: provider.temperature,
            top_p: provider.top_p,
            frequency_penalty: provider.frequency_penalty,
            presence_penalty: provider.presence_penalty,
            system: None,
        }
    }
}

impl Default for GenerationOptions {
    fn default() -> Self {
        Self::from(&ProviderConfig::default())
    }
}

impl GenerationOptions {
    pub fn with_system(mut self, system: impl Into<String>) -> Self {
        self.system = Some(system.into());
        self
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenUsage {
    #[serde(default)]
    pub prompt_tokens: u32,
    #[serde(default)]
    pub completion_tokens: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct GenerationResult {
    pub content: String,
    pub model: String,
    pub usage: TokenUsage,
    pub finish_reason: Option<String>,
}
