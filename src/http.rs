//! HTTP transport abstraction shared by the LLM client and the content fetcher.
//!
//! Both callers need custom headers, a per-request timeout and a cap on how much
//! of the response body is read into memory.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::Method;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue, USER_AGENT};
use serde::Serialize;
use tracing::debug;

use crate::error::TransportError;

/// Default cap on response bodies when the caller does not set one.
pub const DEFAULT_MAX_BODY_BYTES: usize = 5 * 1024 * 1024;

#[derive(Debug, Clone)]
pub struct HttpRequest {
    pub method: Method,
    pub url: String,
    pub headers: Vec<(String, String)>,
    pub body: Option<Vec<u8>>,
    pub timeout: Duration,
    pub max_body_bytes: usize,
}

impl HttpRequest {
    pub fn get(url: impl Into<String>) -> Self {
        Self {
            method: Method::GET,
            url: url.into(),
            headers: Vec::new(),
            body: None,
            timeout: Duration::from_secs(30),
            max_body_bytes: DEFAULT_MAX_BODY_BYTES,
        }
    }

    pub fn post_json<T: Serialize>(url: impl Into<String>, payload: &T) -> Result<Self, TransportError> {
        let url = url.into();
        let body = serde_json::to_vec(payload).map_err(|e| TransportError::InvalidRequest {
            url: url.clone(),
            message: format!("serializing body: {e}"),
        })?;
        Ok(Self {
            method: Method::POST,
            headers: vec![("Content-Type".to_string(), "application/json".to_string())],
            body: Some(body),
            ..Self::get(url)
        })
    }

    pub fn header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }

    pub fn headers(mut self, headers: impl IntoIterator<Item = (String, String)>) -> Self {
        self.headers.extend(headers);
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn max_body_bytes(mut self, limit: usize) -> Self {
        self.max_body_bytes = limit;
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HttpResponse {
    pub status: u16,
    pub body: Vec<u8>,
}

impl HttpResponse {
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }

    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.body).into_owned()
    }
}

/// Executes HTTP requests. Swappable so the pipeline can run against fakes.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn send(&self, request: HttpRequest) -> Result<HttpResponse, TransportError>;
}

/// Production transport backed by a shared reqwest client.
#[derive(Clone)]
pub struct ReqwestTransport {
    client: reqwest::Client,
}

impl ReqwestTransport {
    pub fn new() -> Result<Self, TransportError> {
        let mut headers = HeaderMap::new();
        headers.insert(
            USER_AGENT,
            HeaderValue::from_static(concat!("agora/", env!("CARGO_PKG_VERSION"))),
        );

        let client = reqwest::Client::builder()
            .default_headers(headers)
            .build()
            .map_err(|e| TransportError::Send {
                url: String::new(),
                source: e,
            })?;

        Ok(Self { client })
    }
}

#[async_trait]
impl Transport for ReqwestTransport {
    async fn send(&self, request: HttpRequest) -> Result<HttpResponse, TransportError> {
        let url = request.url;

        let mut headers = HeaderMap::new();
        for (name, value) in &request.headers {
            let header_name: HeaderName = name.parse().map_err(|_| TransportError::InvalidRequest {
                url: url.clone(),
                message: format!("invalid header name: {name}"),
            })?;
            let header_value = HeaderValue::from_str(value).map_err(|_| TransportError::InvalidRequest {
                url: url.clone(),
                message: format!("invalid header value for {name}"),
            })?;
            headers.insert(header_name, header_value);
        }

        let mut builder = self
            .client
            .request(request.method.clone(), &url)
            .headers(headers)
            .timeout(request.timeout);
        if let Some(body) = request.body {
            builder = builder.body(body);
        }

        debug!(method = %request.method, url = %url, "sending HTTP request");

        let mut response = builder.send().await.map_err(|e| classify_send_error(&url, e))?;
        let status = response.status().as_u16();

        let limit = request.max_body_bytes;
        if response.content_length().is_some_and(|len| len as usize > limit) {
            return Err(TransportError::BodyTooLarge { url, limit });
        }

        let mut body = Vec::new();
        while let Some(chunk) = response.chunk().await.map_err(|e| classify_send_error(&url, e))? {
            if body.len() + chunk.len() > limit {
                return Err(TransportError::BodyTooLarge { url, limit });
            }
            body.extend_from_slice(&chunk);
        }

        debug!(url = %url, status, bytes = body.len(), "HTTP request completed");

        Ok(HttpResponse { status, body })
    }
}

fn classify_send_error(url: &str, e: reqwest::Error) -> TransportError {
    if e.is_timeout() {
        TransportError::Timeout { url: url.to_string() }
    } else {
        TransportError::Send {
            url: url.to_string(),
            source: e,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    #[tokio::test]
    async fn sends_headers_and_reads_body() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/echo"))
            .and(header("X-Test", "yes"))
            .respond_with(ResponseTemplate::new(201).set_body_string("created"))
            .expect(1)
            .mount(&server)
            .await;

        let transport = ReqwestTransport::new().unwrap();
        let request = HttpRequest::post_json(format!("{}/echo", server.uri()), &serde_json::json!({"a": 1}))
            .unwrap()
            .header("X-Test", "yes");
        let response = transport.send(request).await.unwrap();

        assert_eq!(response.status, 201);
        assert!(response.is_success());
        assert_eq!(response.text(), "created");
    }

    #[tokio::test]
    async fn rejects_oversized_body() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(200).set_body_string("x".repeat(2048)))
            .mount(&server)
            .await;

        let transport = ReqwestTransport::new().unwrap();
        let request = HttpRequest::get(server.uri()).max_body_bytes(1024);
        let err = transport.send(request).await.unwrap_err();

        assert!(matches!(err, TransportError::BodyTooLarge { limit: 1024, .. }));
    }

    #[tokio::test]
    async fn times_out_slow_responses() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(200).set_delay(Duration::from_millis(500)))
            .mount(&server)
            .await;

        let transport = ReqwestTransport::new().unwrap();
        let request = HttpRequest::get(server.uri()).timeout(Duration::from_millis(50));
        let err = transport.send(request).await.unwrap_err();

        assert!(matches!(err, TransportError::Timeout { .. }));
    }
}
