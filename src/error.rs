use serde::Serialize;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file: {0}")]
    ReadFile(#[from] std::io::Error),
    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("validation error: {0}")]
    Validation(String),
}

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("invalid request for {url}: {message}")]
    InvalidRequest { url: String, message: String },
    #[error("request to {url} timed out")]
    Timeout { url: String },
    #[error("request to {url} failed: {source}")]
    Send { url: String, source: reqwest::Error },
    #[error("response from {url} exceeds {limit} bytes")]
    BodyTooLarge { url: String, limit: usize },
}

#[derive(Debug, Error)]
pub enum FetchError {
    #[error(transparent)]
    Transport(#[from] TransportError),
    #[error("{url} returned HTTP {status}")]
    Status { url: String, status: u16 },
    #[error("failed to parse content from {url}: {message}")]
    Parse { url: String, message: String },
    #[error("{url} yielded no usable items")]
    Empty { url: String },
    #[error("all strategies failed for {url}: {}", failures.join("; "))]
    Exhausted { url: String, failures: Vec<String> },
}

/// Errors surfaced by the LLM client.
///
/// The HTTP-derived variants mirror the provider's status classes; `LowQuality`
/// is raised after a successful call whose content failed validation.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum LlmError {
    #[error("no provider API key configured")]
    MissingCredential,
    #[error("hourly request limit of {limit} reached")]
    RateLimitExceeded { limit: u32 },
    #[error("provider rejected credentials (HTTP {status}): {message}")]
    AuthError { status: u16, message: String },
    #[error("provider rejected request (HTTP {status}): {message}")]
    BadRequest { status: u16, message: String },
    #[error("model or endpoint not found: {message}")]
    NotFound { message: String },
    #[error("provider rate limit hit: {message}")]
    RateLimited { message: String },
    #[error("provider server error (HTTP {status}): {message}")]
    ServerError { status: u16, message: String },
    #[error("unexpected provider failure: {message}")]
    Unknown { status: Option<u16>, message: String },
    #[error("generated content failed quality validation: {reason}")]
    LowQuality { reason: String },
}

impl LlmError {
    /// Classify a non-2xx provider response.
    pub fn from_status(status: u16, message: String) -> Self {
        match status {
            401 | 403 => LlmError::AuthError { status, message },
            400 | 422 => LlmError::BadRequest { status, message },
            404 => LlmError::NotFound { message },
            429 => LlmError::RateLimited { message },
            500..=599 => LlmError::ServerError { status, message },
            _ => LlmError::Unknown {
                status: Some(status),
                message,
            },
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            LlmError::MissingCredential => "missing_credential",
            LlmError::RateLimitExceeded { .. } => "rate_limit_exceeded",
            LlmError::AuthError { .. } => "auth_error",
            LlmError::BadRequest { .. } => "bad_request",
            LlmError::NotFound { .. } => "not_found",
            LlmError::RateLimited { .. } => "rate_limited",
            LlmError::ServerError { .. } => "server_error",
            LlmError::Unknown { .. } => "unknown",
            LlmError::LowQuality { .. } => "low_quality",
        }
    }
}

#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("no source content could be fetched from {sources} configured source(s)")]
    NoSourceContent { sources: usize },
    #[error(transparent)]
    Llm(#[from] LlmError),
    #[error("storage failure: {0}")]
    Storage(String),
}

impl PipelineError {
    pub fn storage(err: anyhow::Error) -> Self {
        PipelineError::Storage(format!("{err:#}"))
    }

    pub fn kind(&self) -> &'static str {
        match self {
            PipelineError::NoSourceContent { .. } => "no_source_content",
            PipelineError::Llm(e) => e.kind(),
            PipelineError::Storage(_) => "storage",
        }
    }

    /// User-facing error object for the manual and test entry points.
    pub fn report(&self) -> ErrorReport {
        ErrorReport {
            kind: self.kind().to_string(),
            message: self.to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ErrorReport {
    pub kind: String,
    pub message: String,
}
