//! Outbound HTTP port used for every call to an upstream model server.
//!
//! Upstream 4xx/5xx answers are not errors at this layer: the `Response` is
//! returned verbatim and classification is left to the caller.

use std::collections::HashMap;
use std::collections::VecDeque;
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use http::{header, HeaderMap, Method, StatusCode};
use thiserror::Error;

/// Errors raised by the HTTP client port. Only transport-level failures end
/// up here; upstream status codes travel inside [`Response`].
#[derive(Error, Debug, Clone)]
pub enum ClientError {
    #[error("connection to {url} failed: {message}")]
    Transport { url: String, message: String },
    #[error("request to {url} timed out after {timeout:?}")]
    Timeout { url: String, timeout: Duration },
    #[error("{url} returned a non-JSON body where a JSON document was required")]
    BadGateway { url: String },
    #[error("invalid request url: {0}")]
    InvalidUrl(String),
}

/// An upstream HTTP response, body kept as raw bytes until a caller decides
/// whether JSON is mandatory for it.
#[derive(Debug, Clone)]
pub struct Response {
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub body: Bytes,
}

impl Response {
    pub fn of_json(status: u16, value: &serde_json::Value) -> Self {
        let mut headers = HeaderMap::new();
        headers.insert(
            header::CONTENT_TYPE,
            header::HeaderValue::from_static("application/json"),
        );
        Self {
            status: StatusCode::from_u16(status).expect("invalid status code"),
            headers,
            body: Bytes::from(serde_json::to_vec(value).expect("failed to encode json body")),
        }
    }

    pub fn empty(status: u16) -> Self {
        Self {
            status: StatusCode::from_u16(status).expect("invalid status code"),
            headers: HeaderMap::new(),
            body: Bytes::new(),
        }
    }

    pub fn with_header(mut self, name: &'static str, value: &str) -> Self {
        self.headers.insert(
            header::HeaderName::from_static(name),
            value.parse().expect("invalid header value"),
        );
        self
    }

    pub fn is_success(&self) -> bool {
        self.status.is_success()
    }

    /// Parse the body as JSON, `None` when it is empty or not valid JSON.
    pub fn json(&self) -> Option<serde_json::Value> {
        if self.body.is_empty() {
            return None;
        }
        serde_json::from_slice(&self.body).ok()
    }

    /// Parse the body as JSON where the caller cannot proceed without one.
    pub fn require_json(&self, url: &str) -> Result<serde_json::Value, ClientError> {
        self.json().ok_or_else(|| ClientError::BadGateway {
            url: url.to_owned(),
        })
    }

    /// The `Location` header, if present and readable.
    pub fn location(&self) -> Option<String> {
        self.headers
            .get(header::LOCATION)
            .and_then(|value| value.to_str().ok())
            .map(str::to_owned)
    }

    /// A lossy, truncated body excerpt for diagnostics.
    pub fn excerpt(&self, max: usize) -> String {
        let text = String::from_utf8_lossy(&self.body);
        let mut excerpt: String = text.chars().take(max).collect();
        if text.chars().count() > max {
            excerpt.push('…');
        }
        excerpt
    }
}

#[async_trait]
pub trait HttpClient: Send + Sync {
    async fn get(
        &self,
        url: &str,
        timeout: Duration,
        headers: &HeaderMap,
    ) -> Result<Response, ClientError>;

    async fn head(
        &self,
        url: &str,
        timeout: Duration,
        headers: &HeaderMap,
    ) -> Result<Response, ClientError>;

    async fn post(
        &self,
        url: &str,
        body: &serde_json::Value,
        timeout: Duration,
        headers: &HeaderMap,
    ) -> Result<Response, ClientError>;

    async fn delete(
        &self,
        url: &str,
        timeout: Duration,
        headers: &HeaderMap,
    ) -> Result<Response, ClientError>;
}

/// The production client. One shared connection pool; dropping the value on
/// shutdown releases it.
pub struct ReqwestClient {
    client: reqwest::Client,
}

impl ReqwestClient {
    pub fn new(user_agent: &str) -> Self {
        let mut headers = HeaderMap::new();
        headers.insert(
            header::ACCEPT,
            header::HeaderValue::from_static("application/json"),
        );

        let client = reqwest::Client::builder()
            .default_headers(headers)
            .user_agent(user_agent.to_owned())
            .build()
            .expect("failed to construct reqwest client");

        Self { client }
    }

    async fn execute(
        &self,
        method: Method,
        url: &str,
        body: Option<&serde_json::Value>,
        timeout: Duration,
        headers: &HeaderMap,
    ) -> Result<Response, ClientError> {
        let parsed: reqwest::Url = url
            .parse()
            .map_err(|_| ClientError::InvalidUrl(url.to_owned()))?;

        let mut request = self
            .client
            .request(method, parsed)
            .timeout(timeout)
            .headers(headers.clone());
        if let Some(body) = body {
            request = request.json(body);
        }

        let response = request
            .send()
            .await
            .map_err(|error| map_send_error(url, timeout, error))?;

        let status = response.status();
        let headers = response.headers().clone();
        let body = response
            .bytes()
            .await
            .map_err(|error| map_send_error(url, timeout, error))?;

        Ok(Response {
            status,
            headers,
            body,
        })
    }
}

fn map_send_error(url: &str, timeout: Duration, error: reqwest::Error) -> ClientError {
    if error.is_timeout() {
        ClientError::Timeout {
            url: url.to_owned(),
            timeout,
        }
    } else {
        ClientError::Transport {
            url: url.to_owned(),
            message: error.to_string(),
        }
    }
}

#[async_trait]
impl HttpClient for ReqwestClient {
    async fn get(
        &self,
        url: &str,
        timeout: Duration,
        headers: &HeaderMap,
    ) -> Result<Response, ClientError> {
        self.execute(Method::GET, url, None, timeout, headers).await
    }

    async fn head(
        &self,
        url: &str,
        timeout: Duration,
        headers: &HeaderMap,
    ) -> Result<Response, ClientError> {
        self.execute(Method::HEAD, url, None, timeout, headers)
            .await
    }

    async fn post(
        &self,
        url: &str,
        body: &serde_json::Value,
        timeout: Duration,
        headers: &HeaderMap,
    ) -> Result<Response, ClientError> {
        self.execute(Method::POST, url, Some(body), timeout, headers)
            .await
    }

    async fn delete(
        &self,
        url: &str,
        timeout: Duration,
        headers: &HeaderMap,
    ) -> Result<Response, ClientError> {
        self.execute(Method::DELETE, url, None, timeout, headers)
            .await
    }
}

/// A request observed by [`MockHttpClient`], kept for test assertions.
#[derive(Debug, Clone)]
pub struct RecordedRequest {
    pub method: String,
    pub url: String,
    pub body: Option<serde_json::Value>,
}

/// Scripted client for tests. Responses are registered per `"METHOD url"`
/// key; each call pops the next scripted outcome, and the last one repeats
/// once the queue is down to a single entry.
#[derive(Default)]
pub struct MockHttpClient {
    scripted: Mutex<HashMap<String, VecDeque<Result<Response, ClientError>>>>,
    requests: Mutex<Vec<RecordedRequest>>,
}

impl MockHttpClient {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn script(&self, method: &str, url: &str, outcome: Result<Response, ClientError>) {
        self.scripted
            .lock()
            .expect("poisoned mock client mutex")
            .entry(key(method, url))
            .or_default()
            .push_back(outcome);
    }

    pub fn requests(&self) -> Vec<RecordedRequest> {
        self.requests
            .lock()
            .expect("poisoned mock client mutex")
            .clone()
    }

    pub fn request_count(&self, method: &str, url: &str) -> usize {
        let wanted = key(method, url);
        self.requests()
            .iter()
            .filter(|request| key(&request.method, &request.url) == wanted)
            .count()
    }

    fn take(
        &self,
        method: &str,
        url: &str,
        body: Option<serde_json::Value>,
    ) -> Result<Response, ClientError> {
        self.requests
            .lock()
            .expect("poisoned mock client mutex")
            .push(RecordedRequest {
                method: method.to_owned(),
                url: url.to_owned(),
                body,
            });

        let mut scripted = self.scripted.lock().expect("poisoned mock client mutex");
        match scripted.get_mut(&key(method, url)) {
            Some(queue) if queue.len() > 1 => queue.pop_front().expect("queue checked non-empty"),
            Some(queue) => queue
                .front()
                .cloned()
                .unwrap_or_else(|| unscripted(method, url)),
            None => unscripted(method, url),
        }
    }
}

fn unscripted(method: &str, url: &str) -> Result<Response, ClientError> {
    Err(ClientError::Transport {
        url: url.to_owned(),
        message: format!("no scripted response for {method} {url}"),
    })
}

fn key(method: &str, url: &str) -> String {
    format!("{} {}", method.to_ascii_uppercase(), url)
}

#[async_trait]
impl HttpClient for MockHttpClient {
    async fn get(
        &self,
        url: &str,
        _timeout: Duration,
        _headers: &HeaderMap,
    ) -> Result<Response, ClientError> {
        self.take("GET", url, None)
    }

    async fn head(
        &self,
        url: &str,
        _timeout: Duration,
        _headers: &HeaderMap,
    ) -> Result<Response, ClientError> {
        self.take("HEAD", url, None)
    }

    async fn post(
        &self,
        url: &str,
        body: &serde_json::Value,
        _timeout: Duration,
        _headers: &HeaderMap,
    ) -> Result<Response, ClientError> {
        self.take("POST", url, Some(body.clone()))
    }

    async fn delete(
        &self,
        url: &str,
        _timeout: Duration,
        _headers: &HeaderMap,
    ) -> Result<Response, ClientError> {
        self.take("DELETE", url, None)
    }
}
