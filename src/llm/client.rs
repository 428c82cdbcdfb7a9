use std::collections::VecDeque;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::Result;
use chrono::{DateTime, NaiveDate, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use super::cache::{ResponseCache, cache_key};
use super::rate_limit::{HourlyRateLimiter, RateLimitStatus};
use super::usage::{UsageLedger, UsageStat};
use super::validate::validate_content;
use super::{GenerationOptions, GenerationResult, TokenUsage};
use crate::clock::Clock;
use crate::config::{Config, parse_duration};
use crate::error::LlmError;
use crate::http::{HttpRequest, Transport};
use crate::parse::extract_json;

pub const CONNECTION_TEST_PROMPT: &str = "Respond with exactly: CONNECTION_OK";
pub const CONNECTION_TEST_MARKER: &str = "CONNECTION_OK";

const MODERATION_PROMPT: &str = r#"You are moderating posts for an online discussion community. Decide whether the content below is appropriate to publish: no harassment, hate, spam, explicit material or dangerous instructions.

Context: {context}

Content:
{content}

Respond with ONLY a JSON object: {"appropriate": true or false, "reason": "short explanation", "confidence": number between 0 and 1}"#;

/// Errors remembered for health reporting.
const ERROR_LOG_CAPACITY: usize = 50;

/// Resolved client settings. Built once from [`Config`] at startup.
#[derive(Debug, Clone)]
pub struct ClientSettings {
    pub api_key: Option<String>,
    pub base_url: String,
    pub defaults: GenerationOptions,
    pub timeout: Duration,
    pub max_requests_per_hour: u32,
    /// `None` disables caching.
    pub cache_ttl: Option<chrono::Duration>,
    pub min_length: usize,
    pub max_response_bytes: usize,
}

impl ClientSettings {
    pub fn from_config(config: &Config) -> Result<Self> {
        let provider = &config.provider;
        let timeout = parse_duration("provider timeout", &provider.timeout)?;
        let cache_ttl = if provider.cache_enabled {
            let ttl = parse_duration("provider cache_duration", &provider.cache_duration)?;
            Some(chrono::Duration::from_std(ttl)?)
        } else {
            None
        };

        Ok(Self {
            api_key: provider.resolve_api_key(),
            base_url: provider.base_url.trim_end_matches('/').to_string(),
            defaults: GenerationOptions::from(provider),
            timeout,
            max_requests_per_hour: provider.max_requests_per_hour,
            cache_ttl,
            min_length: config.quality.min_length,
            max_response_bytes: provider.max_response_bytes,
        })
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ConnectionReport {
    pub model: String,
    pub latency_ms: u64,
    pub reply: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ModerationVerdict {
    pub appropriate: bool,
    pub reason: String,
    pub confidence: f64,
}

impl ModerationVerdict {
    fn fail_open(reason: String) -> Self {
        Self {
            appropriate: true,
            reason,
            confidence: 0.0,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    Healthy,
    Warning,
    Error,
}

#[derive(Debug, Clone, Serialize)]
pub struct ErrorSample {
    pub at: DateTime<Utc>,
    pub kind: &'static str,
    pub message: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct HealthReport {
    pub status: HealthStatus,
    pub model: String,
    pub credential_configured: bool,
    pub recent_errors: usize,
    pub last_error: Option<ErrorSample>,
    pub last_success: Option<DateTime<Utc>>,
    pub rate_limit: RateLimitStatus,
    pub cache_entries: usize,
    pub estimated_monthly_cost: f64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PurgeCounts {
    pub cache_entries: usize,
    pub rate_buckets: usize,
}

struct ClientState {
    cache: Option<ResponseCache>,
    limiter: HourlyRateLimiter,
    usage: UsageLedger,
    errors: VecDeque<ErrorSample>,
    last_success: Option<DateTime<Utc>>,
}

// Provider wire format

#[derive(Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: Vec<ChatMessage<'a>>,
    max_tokens: u32,
    temperature: f64,
    top_p: f64,
    frequency_penalty: f64,
    presence_penalty: f64,
}

#[derive(Serialize)]
struct ChatMessage<'a> {
    role: &'static str,
    content: &'a str,
}

#[derive(Deserialize)]
struct ChatResponse {
    #[serde(default)]
    choices: Vec<Choice>,
    model: Option<String>,
    usage: Option<TokenUsage>,
}

#[derive(Deserialize)]
struct Choice {
    message: ResponseMessage,
    finish_reason: Option<String>,
}

#[derive(Deserialize)]
struct ResponseMessage {
    content: Option<String>,
}

#[derive(Deserialize)]
struct ErrorBody {
    error: Option<ErrorDetail>,
}

#[derive(Deserialize)]
struct ErrorDetail {
    message: Option<String>,
}

impl<'a> ChatRequest<'a> {
    fn new(prompt: &'a str, options: &'a GenerationOptions) -> Self {
        let mut messages = Vec::with_capacity(2);
        if let Some(system) = options.system.as_deref() {
            messages.push(ChatMessage {
                role: "system",
                content: system,
            });
        }
        messages.push(ChatMessage {
            role: "user",
            content: prompt,
        });

        Self {
            model: &options.model,
            messages,
            max_tokens: options.max_tokens,
            temperature: options.temperature,
            top_p: options.top_p,
            frequency_penalty: options.frequency_penalty,
            presence_penalty: options.presence_penalty,
        }
    }
}

pub struct LlmClient {
    settings: ClientSettings,
    transport: Arc<dyn Transport>,
    clock: Arc<dyn Clock>,
    state: Mutex<ClientState>,
}

impl LlmClient {
    pub fn new(settings: ClientSettings, transport: Arc<dyn Transport>, clock: Arc<dyn Clock>) -> Self {
        let state = ClientState {
            cache: settings.cache_ttl.map(ResponseCache::new),
            limiter: HourlyRateLimiter::new(settings.max_requests_per_hour),
            usage: UsageLedger::default(),
            errors: VecDeque::with_capacity(ERROR_LOG_CAPACITY),
            last_success: None,
        };
        Self {
            settings,
            transport,
            clock,
            state: Mutex::new(state),
        }
    }

    pub fn default_options(&self) -> GenerationOptions {
        self.settings.defaults.clone()
    }

    /// Generate a completion for `prompt`.
    ///
    /// Every call takes a slot from the hourly budget, cache hits included. A
    /// live cache hit is returned as-is without the quality gate. Fresh
    /// responses are cached before the gate runs, so a rejected response is
    /// replayed as a success for the identical call.
    pub async fn generate(&self, prompt: &str, options: &GenerationOptions) -> Result<GenerationResult, LlmError> {
        let outcome = self.try_generate(prompt, options).await;
        if let Err(err) = &outcome {
            self.record_error(err);
        }
        outcome
    }

    async fn try_generate(&self, prompt: &str, options: &GenerationOptions) -> Result<GenerationResult, LlmError> {
        let api_key = self.api_key()?;
        self.acquire_request_slot()?;

        let key = self.settings.cache_ttl.map(|_| cache_key(prompt, options));
        if let Some(key) = &key {
            let now = self.clock.now();
            let hit = self.state.lock().cache.as_mut().and_then(|cache| cache.get(key, now));
            if let Some(hit) = hit {
                debug!(key = %&key[..12], "LLM cache hit");
                return Ok(hit);
            }
        }

        let result = self.call(api_key, prompt, options).await?;

        if let Some(key) = key {
            let now = self.clock.now();
            if let Some(cache) = self.state.lock().cache.as_mut() {
                cache.insert(key, result.clone(), now);
            }
        }

        validate_content(&result.content, self.settings.min_length).map_err(|rejection| {
            warn!(reason = %rejection, model = %result.model, "generated content rejected");
            LlmError::LowQuality {
                reason: rejection.to_string(),
            }
        })?;

        Ok(result)
    }

    /// Send the canned connection-test prompt. Bypasses the cache and the quality gate.
    pub async fn test_connection(&self) -> Result<ConnectionReport, LlmError> {
        let outcome = self.try_test_connection().await;
        if let Err(err) = &outcome {
            self.record_error(err);
        }
        outcome
    }

    async fn try_test_connection(&self) -> Result<ConnectionReport, LlmError> {
        let api_key = self.api_key()?;
        let options = GenerationOptions {
            max_tokens: 10,
            temperature: 0.0,
            system: None,
            ..self.default_options()
        };

        self.acquire_request_slot()?;
        let started = Instant::now();
        let result = self.call(api_key, CONNECTION_TEST_PROMPT, &options).await?;
        let latency_ms = u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX);

        if !result.content.contains(CONNECTION_TEST_MARKER) {
            return Err(LlmError::Unknown {
                status: None,
                message: format!("unexpected connection test reply: {}", result.content.trim()),
            });
        }

        info!(model = %result.model, latency_ms, "provider connection OK");
        Ok(ConnectionReport {
            model: result.model,
            latency_ms,
            reply: result.content,
        })
    }

    /// Ask the provider whether `text` is fit to publish. Fails open.
    pub async fn moderate(&self, text: &str, context: Option<&str>) -> ModerationVerdict {
        let prompt = MODERATION_PROMPT
            .replace("{context}", context.unwrap_or("community discussion post"))
            .replace("{content}", text);
        let options = GenerationOptions {
            temperature: 0.0,
            max_tokens: 200,
            system: None,
            ..self.default_options()
        };

        let outcome = match self.api_key() {
            Ok(api_key) => match self.acquire_request_slot() {
                Ok(()) => self.call(api_key, &prompt, &options).await,
                Err(err) => Err(err),
            },
            Err(err) => Err(err),
        };

        let result = match outcome {
            Ok(result) => result,
            Err(err) => {
                self.record_error(&err);
                warn!(error = %err, "moderation call failed, allowing content");
                return ModerationVerdict::fail_open(format!("moderation unavailable: {err}"));
            }
        };

        let Some(value) = extract_json(&result.content) else {
            warn!("moderation reply was not JSON, allowing content");
            return ModerationVerdict::fail_open("moderation reply could not be parsed".to_string());
        };
        let Some(appropriate) = value.get("appropriate").and_then(serde_json::Value::as_bool) else {
            warn!("moderation reply missing 'appropriate', allowing content");
            return ModerationVerdict::fail_open("moderation reply missing verdict".to_string());
        };

        ModerationVerdict {
            appropriate,
            reason: value
                .get("reason")
                .and_then(serde_json::Value::as_str)
                .unwrap_or_default()
                .to_string(),
            confidence: value
                .get("confidence")
                .and_then(serde_json::Value::as_f64)
                .unwrap_or(0.0)
                .clamp(0.0, 1.0),
        }
    }

    pub fn health(&self) -> HealthReport {
        let now = self.clock.now();
        let state = self.state.lock();

        let day_ago = now - chrono::Duration::hours(24);
        let recent_errors = state.errors.iter().filter(|e| e.at > day_ago).count();
        let success_within = |hours: i64| {
            state
                .last_success
                .is_some_and(|at| at > now - chrono::Duration::hours(hours))
        };

        let status = if recent_errors == 0 && success_within(24) {
            HealthStatus::Healthy
        } else if recent_errors < 3 && success_within(48) {
            HealthStatus::Warning
        } else {
            HealthStatus::Error
        };

        HealthReport {
            status,
            model: self.settings.defaults.model.clone(),
            credential_configured: self.settings.api_key.is_some(),
            recent_errors,
            last_error: state.errors.back().cloned(),
            last_success: state.last_success,
            rate_limit: state.limiter.status(now),
            cache_entries: state.cache.as_ref().map_or(0, ResponseCache::len),
            estimated_monthly_cost: state.usage.estimated_monthly_cost(now.date_naive()),
        }
    }

    /// Per-day usage, newest first.
    pub fn usage_stats(&self) -> Vec<(NaiveDate, UsageStat)> {
        self.state.lock().usage.stats()
    }

    pub fn purge_expired(&self) -> PurgeCounts {
        let now = self.clock.now();
        let mut state = self.state.lock();
        PurgeCounts {
            cache_entries: state.cache.as_mut().map_or(0, |cache| cache.purge_expired(now)),
            rate_buckets: state.limiter.purge_expired(now),
        }
    }

    fn api_key(&self) -> Result<&str, LlmError> {
        self.settings.api_key.as_deref().ok_or(LlmError::MissingCredential)
    }

    fn record_error(&self, err: &LlmError) {
        let sample = ErrorSample {
            at: self.clock.now(),
            kind: err.kind(),
            message: err.to_string(),
        };
        let mut state = self.state.lock();
        if state.errors.len() == ERROR_LOG_CAPACITY {
            state.errors.pop_front();
        }
        state.errors.push_back(sample);
    }

    /// Take one slot from the current hour's request budget.
    fn acquire_request_slot(&self) -> Result<(), LlmError> {
        let now = self.clock.now();
        let mut state = self.state.lock();
        if !state.limiter.try_acquire(now) {
            let limit = state.limiter.limit();
            warn!(limit, "hourly provider request limit reached");
            return Err(LlmError::RateLimitExceeded { limit });
        }
        Ok(())
    }

    /// Provider call with status classification and usage accounting. Callers take a request slot first.
    async fn call(&self, api_key: &str, prompt: &str, options: &GenerationOptions) -> Result<GenerationResult, LlmError> {
        let url = format!("{}/chat/completions", self.settings.base_url);
        let request = HttpRequest::post_json(url, &ChatRequest::new(prompt, options))
            .map_err(|e| LlmError::Unknown {
                status: None,
                message: e.to_string(),
            })?
            .header("Authorization", format!("Bearer {api_key}"))
            .timeout(self.settings.timeout)
            .max_body_bytes(self.settings.max_response_bytes);

        debug!(model = %options.model, prompt_chars = prompt.len(), "calling provider");

        let response = self.transport.send(request).await.map_err(|e| LlmError::Unknown {
            status: None,
            message: e.to_string(),
        })?;

        if !response.is_success() {
            let message = provider_error_message(response.status, &response.body);
            let err = LlmError::from_status(response.status, message);
            warn!(status = response.status, kind = err.kind(), "provider returned error");
            return Err(err);
        }

        let parsed: ChatResponse = serde_json::from_slice(&response.body).map_err(|e| LlmError::Unknown {
            status: Some(response.status),
            message: format!("invalid response body: {e}"),
        })?;

        let choice = parsed.choices.into_iter().next().ok_or_else(|| LlmError::Unknown {
            status: Some(response.status),
            message: "response contained no choices".to_string(),
        })?;

        let model = parsed.model.unwrap_or_else(|| options.model.clone());
        let usage = parsed.usage.unwrap_or_default();

        {
            let now = self.clock.now();
            let mut state = self.state.lock();
            state.usage.record(now.date_naive(), &model, &usage);
            state.last_success = Some(now);
        }

        debug!(
            model = %model,
            prompt_tokens = usage.prompt_tokens,
            completion_tokens = usage.completion_tokens,
            "provider call succeeded"
        );

        Ok(GenerationResult {
            content: choice.message.content.unwrap_or_default(),
            model,
            usage,
            finish_reason: choice.finish_reason,
        })
    }
}

/// `error.message` from the body when present, else a trimmed body excerpt.
fn provider_error_message(status: u16, body: &[u8]) -> String {
    if let Ok(parsed) = serde_json::from_slice::<ErrorBody>(body)
        && let Some(message) = parsed.error.and_then(|e| e.message)
    {
        return message;
    }
    let text = String::from_utf8_lossy(body);
    let text = text.trim();
    if text.is_empty() {
        format!("HTTP {status}")
    } else {
        text.chars().take(200).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::http::ReqwestTransport;
    use crate::testing::{FixedClock, client_settings};
    use serde_json::json;
    use wiremock::matchers::{body_partial_json, header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    const GOOD: &str = "Running a home server taught me more about networking than any course. \
        Start small with a single service and grow from there.";

    fn completion(content: &str) -> serde_json::Value {
        json!({
            "choices": [{"message": {"role": "assistant", "content": content}, "finish_reason": "stop"}],
            "model": "gpt-4o-mini",
            "usage": {"prompt_tokens": 120, "completion_tokens": 80}
        })
    }

    fn client(server: &MockServer, clock: Arc<FixedClock>) -> LlmClient {
        client_with(client_settings(&server.uri()), clock)
    }

    fn client_with(settings: ClientSettings, clock: Arc<FixedClock>) -> LlmClient {
        LlmClient::new(settings, Arc::new(ReqwestTransport::new().unwrap()), clock)
    }

    #[tokio::test]
    async fn sends_wire_request_and_caches_identical_calls() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/chat/completions"))
            .and(header("authorization", "Bearer test-key"))
            .and(body_partial_json(json!({
                "model": "gpt-4o-mini",
                "messages": [{"role": "system", "content": "be nice"}, {"role": "user", "content": "hello"}]
            })))
            .respond_with(ResponseTemplate::new(200).set_body_json(completion(GOOD)))
            .expect(1)
            .mount(&server)
            .await;

        let client = client(&server, FixedClock::arc());
        let options = client.default_options().with_system("be nice");

        let first = client.generate("hello", &options).await.unwrap();
        let second = client.generate("hello", &options).await.unwrap();

        assert_eq!(first, second);
        assert_eq!(first.content, GOOD);
        assert_eq!(first.usage.prompt_tokens, 120);
        assert_eq!(client.usage_stats()[0].1.requests, 1);
    }

    #[tokio::test]
    async fn expired_cache_entry_triggers_fresh_call() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200).set_body_json(completion(GOOD)))
            .expect(2)
            .mount(&server)
            .await;

        let clock = FixedClock::arc();
        let client = client(&server, clock.clone());
        let options = client.default_options();

        client.generate("hello", &options).await.unwrap();
        clock.advance(chrono::Duration::minutes(61));
        client.generate("hello", &options).await.unwrap();
    }

    #[tokio::test]
    async fn hourly_limit_blocks_without_network_call() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200).set_body_json(completion(GOOD)))
            .expect(3)
            .mount(&server)
            .await;

        let clock = FixedClock::arc();
        let settings = ClientSettings {
            max_requests_per_hour: 2,
            cache_ttl: None,
            ..client_settings(&server.uri())
        };
        let client = client_with(settings, clock.clone());
        let options = client.default_options();

        client.generate("one", &options).await.unwrap();
        client.generate("two", &options).await.unwrap();
        let err = client.generate("three", &options).await.unwrap_err();
        assert_eq!(err, LlmError::RateLimitExceeded { limit: 2 });
        assert_eq!(client.health().rate_limit.remaining, 0);

        clock.advance(chrono::Duration::hours(1));
        client.generate("three", &options).await.unwrap();
    }

    #[tokio::test]
    async fn cache_hits_count_against_hourly_limit() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200).set_body_json(completion(GOOD)))
            .expect(1)
            .mount(&server)
            .await;

        let settings = ClientSettings {
            max_requests_per_hour: 1,
            ..client_settings(&server.uri())
        };
        let client = client_with(settings, FixedClock::arc());
        let options = client.default_options();

        client.generate("same", &options).await.unwrap();
        let err = client.generate("same", &options).await.unwrap_err();
        assert_eq!(err, LlmError::RateLimitExceeded { limit: 1 });
        assert_eq!(client.health().rate_limit.used, 1);
    }

    #[tokio::test]
    async fn provider_rate_limit_is_classified_and_not_cached() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(
                ResponseTemplate::new(429).set_body_json(json!({"error": {"message": "slow down"}})),
            )
            .expect(2)
            .mount(&server)
            .await;

        let client = client(&server, FixedClock::arc());
        let options = client.default_options();

        for _ in 0..2 {
            let err = client.generate("hello", &options).await.unwrap_err();
            assert_eq!(
                err,
                LlmError::RateLimited {
                    message: "slow down".to_string()
                }
            );
        }
    }

    #[tokio::test]
    async fn status_classes_map_to_error_kinds() {
        for (status, kind) in [
            (401, "auth_error"),
            (403, "auth_error"),
            (400, "bad_request"),
            (422, "bad_request"),
            (404, "not_found"),
            (500, "server_error"),
            (503, "server_error"),
            (418, "unknown"),
        ] {
            let server = MockServer::start().await;
            Mock::given(method("POST"))
                .respond_with(ResponseTemplate::new(status).set_body_string("nope"))
                .mount(&server)
                .await;

            let client = client(&server, FixedClock::arc());
            let err = client.generate("hello", &client.default_options()).await.unwrap_err();
            assert_eq!(err.kind(), kind, "status {status}");
        }
    }

    #[tokio::test]
    async fn missing_credential_fails_before_network() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200).set_body_json(completion(GOOD)))
            .expect(0)
            .mount(&server)
            .await;

        let settings = ClientSettings {
            api_key: None,
            ..client_settings(&server.uri())
        };
        let client = client_with(settings, FixedClock::arc());
        let err = client.generate("hello", &client.default_options()).await.unwrap_err();
        assert_eq!(err, LlmError::MissingCredential);
        assert_eq!(client.health().recent_errors, 1);
    }

    #[tokio::test]
    async fn low_quality_result_is_cached_then_replayed() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200).set_body_json(completion("Too short.")))
            .expect(1)
            .mount(&server)
            .await;

        let client = client(&server, FixedClock::arc());
        let options = client.default_options();

        let err = client.generate("hello", &options).await.unwrap_err();
        assert_eq!(err.kind(), "low_quality");

        let replay = client.generate("hello", &options).await.unwrap();
        assert_eq!(replay.content, "Too short.");
    }

    #[tokio::test]
    async fn empty_choices_is_unknown() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"choices": [], "model": "gpt-4o-mini"})))
            .mount(&server)
            .await;

        let client = client(&server, FixedClock::arc());
        let err = client.generate("hello", &client.default_options()).await.unwrap_err();
        assert!(matches!(err, LlmError::Unknown { status: Some(200), .. }));
    }

    #[tokio::test]
    async fn connection_test_checks_marker() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200).set_body_json(completion("CONNECTION_OK")))
            .up_to_n_times(1)
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200).set_body_json(completion("Hello there")))
            .mount(&server)
            .await;

        let client = client(&server, FixedClock::arc());

        let report = client.test_connection().await.unwrap();
        assert_eq!(report.model, "gpt-4o-mini");
        assert_eq!(report.reply, "CONNECTION_OK");

        let err = client.test_connection().await.unwrap_err();
        assert!(matches!(err, LlmError::Unknown { status: None, .. }));
    }

    #[tokio::test]
    async fn moderation_parses_verdict_and_clamps_confidence() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200).set_body_json(completion(
                "Here you go: {\"appropriate\": false, \"reason\": \"spam\", \"confidence\": 1.4}",
            )))
            .mount(&server)
            .await;

        let client = client(&server, FixedClock::arc());
        let verdict = client.moderate("buy now", None).await;

        assert!(!verdict.appropriate);
        assert_eq!(verdict.reason, "spam");
        assert_eq!(verdict.confidence, 1.0);
    }

    #[tokio::test]
    async fn moderation_fails_open() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(500))
            .up_to_n_times(1)
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200).set_body_json(completion("Looks fine to me")))
            .mount(&server)
            .await;

        let client = client(&server, FixedClock::arc());

        let verdict = client.moderate("hello", Some("reply")).await;
        assert!(verdict.appropriate);
        assert_eq!(verdict.confidence, 0.0);

        let verdict = client.moderate("hello", Some("reply")).await;
        assert!(verdict.appropriate);
        assert_eq!(verdict.confidence, 0.0);
    }

    #[tokio::test]
    async fn health_moves_between_states() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200).set_body_json(completion(GOOD)))
            .up_to_n_times(1)
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(503))
            .mount(&server)
            .await;

        let clock = FixedClock::arc();
        let settings = ClientSettings {
            cache_ttl: None,
            ..client_settings(&server.uri())
        };
        let client = client_with(settings, clock.clone());
        let options = client.default_options();

        assert_eq!(client.health().status, HealthStatus::Error);

        client.generate("a", &options).await.unwrap();
        let health = client.health();
        assert_eq!(health.status, HealthStatus::Healthy);
        assert!(health.estimated_monthly_cost > 0.0);

        client.generate("b", &options).await.unwrap_err();
        assert_eq!(client.health().status, HealthStatus::Warning);

        client.generate("c", &options).await.unwrap_err();
        client.generate("d", &options).await.unwrap_err();
        let health = client.health();
        assert_eq!(health.status, HealthStatus::Error);
        assert_eq!(health.recent_errors, 3);
        assert_eq!(health.last_error.unwrap().kind, "server_error");

        // errors age out of the 24h window, the success is still within 48h
        clock.advance(chrono::Duration::hours(25));
        assert_eq!(client.health().status, HealthStatus::Warning);
    }

    #[tokio::test]
    async fn purge_drops_expired_state() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200).set_body_json(completion(GOOD)))
            .mount(&server)
            .await;

        let clock = FixedClock::arc();
        let client = client(&server, clock.clone());
        client.generate("hello", &client.default_options()).await.unwrap();

        clock.advance(chrono::Duration::hours(2));
        let purged = client.purge_expired();
        assert_eq!(purged.cache_entries, 1);
        assert_eq!(purged.rate_buckets, 1);
    }
}
