use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::Deserialize;

use crate::error::ConfigError;
use crate::scheduler::Schedule;

#[derive(Debug, Default, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub agora: AgoraConfig,
    #[serde(default)]
    pub database: DatabaseConfig,
    #[serde(default)]
    pub provider: ProviderConfig,
    #[serde(default)]
    pub quality: QualityConfig,
    #[serde(default)]
    pub generation: GenerationConfig,
    #[serde(default)]
    pub fetch: FetchConfig,
    #[serde(default)]
    pub source: Vec<SourceConfig>,
}

#[derive(Debug, Deserialize)]
pub struct AgoraConfig {
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,
    #[serde(default = "default_timezone")]
    pub timezone: String,
    #[serde(default = "default_log_level")]
    pub log_level: String,
    #[serde(default = "default_listen")]
    pub listen: String,
    #[serde(default)]
    pub status_token: Option<String>,
    /// Forces debug logging for the crate's own targets.
    #[serde(default)]
    pub debug: bool,
}

impl Default for AgoraConfig {
    fn default() -> Self {
        Self {
            data_dir: default_data_dir(),
            timezone: default_timezone(),
            log_level: default_log_level(),
            listen: default_listen(),
            status_token: None,
            debug: false,
        }
    }
}

fn default_data_dir() -> PathBuf {
    PathBuf::from("./data")
}
fn default_timezone() -> String {
    "UTC".to_string()
}
fn default_log_level() -> String {
    "info".to_string()
}
fn default_listen() -> String {
    "127.0.0.1:8080".to_string()
}

#[derive(Debug, Deserialize)]
pub struct DatabaseConfig {
    #[serde(default = "default_db_path")]
    pub path: String,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            path: default_db_path(),
        }
    }
}

fn default_db_path() -> String {
    "agora.db".to_string()
}

#[derive(Debug, Clone, Deserialize)]
pub struct ProviderConfig {
    #[serde(default)]
    pub api_key: Option<String>,
    #[serde(default = "default_api_key_env")]
    pub api_key_env: String,
    #[serde(default = "default_base_url")]
    pub base_url: String,
    #[serde(default = "default_model")]
    pub model: String,
    #[serde(default = "default_max_tokens")]
    pub max_tokens: u32,
    #[serde(default = "default_temperature")]
    pub temperature: f64,
    #[serde(default = "default_top_p")]
    pub top_p: f64,
    #[serde(default)]
    pub frequency_penalty: f64,
    #[serde(default)]
    pub presence_penalty: f64,
    #[serde(default = "default_provider_timeout")]
    pub timeout: String,
    #[serde(default = "default_max_requests_per_hour")]
    pub max_requests_per_hour: u32,
    #[serde(default = "default_true")]
    pub cache_enabled: bool,
    #[serde(default = "default_cache_duration")]
    pub cache_duration: String,
    #[serde(default = "default_max_response_bytes")]
    pub max_response_bytes: usize,
}

impl Default for ProviderConfig {
    fn default() -> Self {
        Self {
            api_key: None,
            api_key_env: default_api_key_env(),
            base_url: default_base_url(),
            model: default_model(),
            max_tokens: default_max_tokens(),
            temperature: default_temperature(),
            top_p: default_top_p(),
            frequency_penalty: 0.0,
            presence_penalty: 0.0,
            timeout: default_provider_timeout(),
            max_requests_per_hour: default_max_requests_per_hour(),
            cache_enabled: true,
            cache_duration: default_cache_duration(),
            max_response_bytes: default_max_response_bytes(),
        }
    }
}

fn default_api_key_env() -> String {
    "OPENAI_API_KEY".to_string()
}
fn default_base_url() -> String {
    "https://api.openai.com/v1".to_string()
}
fn default_model() -> String {
    "gpt-4o-mini".to_string()
}
fn default_max_tokens() -> u32 {
    1500
}
fn default_temperature() -> f64 {
    0.8
}
fn default_top_p() -> f64 {
    1.0
}
fn default_provider_timeout() -> String {
    "60s".to_string()
}
fn default_max_requests_per_hour() -> u32 {
    100
}
fn default_true() -> bool {
    true
}
fn default_cache_duration() -> String {
    "1h".to_string()
}
fn default_max_response_bytes() -> usize {
    2 * 1024 * 1024
}

impl ProviderConfig {
    /// Explicit key first, then the environment variable named by `api_key_env`.
    pub fn resolve_api_key(&self) -> Option<String> {
        if let Some(key) = self.api_key.as_deref().map(str::trim)
            && !key.is_empty()
        {
            return Some(key.to_string());
        }
        std::env::var(&self.api_key_env)
            .ok()
            .map(|key| key.trim().to_string())
            .filter(|key| !key.is_empty())
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct QualityConfig {
    #[serde(default = "default_min_length")]
    pub min_length: usize,
}

impl Default for QualityConfig {
    fn default() -> Self {
        Self {
            min_length: default_min_length(),
        }
    }
}

fn default_min_length() -> usize {
    50
}

#[derive(Debug, Clone, Deserialize)]
pub struct GenerationConfig {
    #[serde(default = "default_schedule")]
    pub schedule: String,
    #[serde(default = "default_daily_quota")]
    pub daily_quota: u32,
    /// Replies requested per target post. Read through [`GenerationConfig::replies_per_post`].
    #[serde(default, rename = "replies_per_post")]
    pub replies_per_post_raw: Option<i64>,
    #[serde(default)]
    pub topics: Vec<String>,
    #[serde(default = "default_communities")]
    pub communities: Vec<String>,
    #[serde(default = "default_min_quality_score")]
    pub min_quality_score: f64,
    #[serde(default)]
    pub moderate_posts: bool,
    #[serde(default = "default_reply_window_days")]
    pub reply_window_days: u32,
    #[serde(default = "default_reply_max_comments")]
    pub reply_max_comments: u32,
}

impl Default for GenerationConfig {
    fn default() -> Self {
        Self {
            schedule: default_schedule(),
            daily_quota: default_daily_quota(),
            replies_per_post_raw: None,
            topics: Vec::new(),
            communities: default_communities(),
            min_quality_score: default_min_quality_score(),
            moderate_posts: false,
            reply_window_days: default_reply_window_days(),
            reply_max_comments: default_reply_max_comments(),
        }
    }
}

pub const DEFAULT_REPLIES_PER_POST: u32 = 3;

fn default_schedule() -> String {
    "twicedaily".to_string()
}
fn default_daily_quota() -> u32 {
    6
}
fn default_communities() -> Vec<String> {
    vec!["general".to_string()]
}
fn default_min_quality_score() -> f64 {
    0.5
}
fn default_reply_window_days() -> u32 {
    7
}
fn default_reply_max_comments() -> u32 {
    3
}

impl GenerationConfig {
    /// `0` disables replies; a missing or negative value means the default.
    pub fn replies_per_post(&self) -> u32 {
        match self.replies_per_post_raw {
            Some(n) if n >= 0 => u32::try_from(n).unwrap_or(u32::MAX),
            _ => DEFAULT_REPLIES_PER_POST,
        }
    }

    pub fn schedule(&self) -> Schedule {
        self.schedule.parse().unwrap_or_default()
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct FetchConfig {
    #[serde(default = "default_fetch_timeout")]
    pub timeout: String,
    #[serde(default = "default_fetch_max_body_bytes")]
    pub max_body_bytes: usize,
}

impl Default for FetchConfig {
    fn default() -> Self {
        Self {
            timeout: default_fetch_timeout(),
            max_body_bytes: default_fetch_max_body_bytes(),
        }
    }
}

fn default_fetch_timeout() -> String {
    "15s".to_string()
}
fn default_fetch_max_body_bytes() -> usize {
    5 * 1024 * 1024
}

#[derive(Debug, Clone, Deserialize)]
pub struct SourceConfig {
    pub url: String,
    #[serde(default)]
    pub name: Option<String>,
    pub auth: Option<SourceAuthConfig>,
}

impl SourceConfig {
    pub fn label(&self) -> &str {
        self.name.as_deref().unwrap_or(&self.url)
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct SourceAuthConfig {
    #[serde(rename = "type")]
    pub auth_type: String,
    pub username: Option<String>,
    pub password: Option<String>,
    pub token: Option<String>,
    pub header_name: Option<String>,
    pub header_value: Option<String>,
}

impl Config {
    /// Resolve the database path (relative to data_dir if not absolute).
    pub fn db_path(&self) -> PathBuf {
        let db_path = Path::new(&self.database.path);
        if db_path.is_absolute() {
            db_path.to_path_buf()
        } else {
            self.agora.data_dir.join(db_path)
        }
    }

    /// Configured timezone; UTC when the value does not parse (rejected by validation).
    pub fn timezone(&self) -> chrono_tz::Tz {
        self.agora.timezone.parse().unwrap_or(chrono_tz::UTC)
    }
}

pub fn load_config(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path)
        .map_err(ConfigError::ReadFile)
        .context("reading config file")?;
    parse_config(&content)
}

pub fn parse_config(content: &str) -> Result<Config> {
    let config: Config = toml::from_str(content).map_err(ConfigError::Parse)?;
    Ok(config)
}

/// Parse a humantime duration field, naming the field on failure.
pub fn parse_duration(field: &str, value: &str) -> Result<Duration, ConfigError> {
    humantime::parse_duration(value).map_err(|e| ConfigError::Validation(format!("{field} '{value}': {e}")))
}

pub fn validate_config(config: &Config) -> Result<()> {
    // Validate timezone
    config
        .agora
        .timezone
        .parse::<chrono_tz::Tz>()
        .map_err(|_| ConfigError::Validation(format!("unknown timezone '{}'", config.agora.timezone)))?;

    // Validate provider
    let provider = &config.provider;
    let base_url = url::Url::parse(&provider.base_url)
        .map_err(|e| ConfigError::Validation(format!("provider base_url '{}': {}", provider.base_url, e)))?;
    if !matches!(base_url.scheme(), "http" | "https") {
        return Err(ConfigError::Validation(format!(
            "provider base_url '{}': scheme must be http or https",
            provider.base_url
        ))
        .into());
    }
    if provider.model.trim().is_empty() {
        return Err(ConfigError::Validation("provider model must not be empty".to_string()).into());
    }
    if provider.max_tokens == 0 {
        return Err(ConfigError::Validation("provider max_tokens must be greater than 0".to_string()).into());
    }
    if !(0.0..=2.0).contains(&provider.temperature) {
        return Err(ConfigError::Validation(format!(
            "provider temperature {} out of range (0.0-2.0)",
            provider.temperature
        ))
        .into());
    }
    if !(0.0..=1.0).contains(&provider.top_p) {
        return Err(ConfigError::Validation(format!("provider top_p {} out of range (0.0-1.0)", provider.top_p)).into());
    }
    if provider.max_requests_per_hour == 0 {
        return Err(
            ConfigError::Validation("provider max_requests_per_hour must be greater than 0".to_string()).into(),
        );
    }
    parse_duration("provider timeout", &provider.timeout)?;
    parse_duration("provider cache_duration", &provider.cache_duration)?;

    // Validate generation
    let generation = &config.generation;
    generation
        .schedule
        .parse::<Schedule>()
        .map_err(|e| ConfigError::Validation(format!("generation {e}")))?;
    if generation.communities.is_empty() {
        return Err(ConfigError::Validation("generation communities must not be empty".to_string()).into());
    }
    if !(0.0..=1.0).contains(&generation.min_quality_score) {
        return Err(ConfigError::Validation(format!(
            "generation min_quality_score {} out of range (0.0-1.0)",
            generation.min_quality_score
        ))
        .into());
    }

    parse_duration("fetch timeout", &config.fetch.timeout)?;

    // Validate sources
    let mut source_urls = HashSet::new();
    for source in &config.source {
        let parsed = url::Url::parse(&source.url)
            .map_err(|e| ConfigError::Validation(format!("source '{}': invalid url: {}", source.label(), e)))?;
        if !matches!(parsed.scheme(), "http" | "https") {
            return Err(ConfigError::Validation(format!(
                "source '{}': url scheme must be http or https",
                source.label()
            ))
            .into());
        }
        if !source_urls.insert(&source.url) {
            return Err(ConfigError::Validation(format!("duplicate source url: '{}'", source.url)).into());
        }

        if let Some(auth) = &source.auth {
            validate_auth(source.label(), auth)?;
        }
    }

    Ok(())
}

fn validate_auth(label: &str, auth: &SourceAuthConfig) -> Result<(), ConfigError> {
    match auth.auth_type.as_str() {
        "basic" => {
            if auth.username.is_none() || auth.password.is_none() {
                return Err(ConfigError::Validation(format!(
                    "source '{label}': basic auth requires 'username' and 'password'"
                )));
            }
        }
        "bearer" => {
            if auth.token.is_none() {
                return Err(ConfigError::Validation(format!(
                    "source '{label}': bearer auth requires 'token'"
                )));
            }
        }
        "header" => {
            if auth.header_name.is_none() || auth.header_value.is_none() {
                return Err(ConfigError::Validation(format!(
                    "source '{label}': header auth requires 'header_name' and 'header_value'"
                )));
            }
        }
        other => {
            return Err(ConfigError::Validation(format!(
                "source '{label}': unknown auth type '{other}'"
            )));
        }
    }
    Ok(())
}
