use std::error::Error;
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;

/// HTTP methods the relying party needs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HttpMethod {
    GET,
    POST,
}

impl fmt::Display for HttpMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::GET => write!(f, "GET"),
            Self::POST => write!(f, "POST"),
        }
    }
}

/// HTTP request for executing a call.
#[derive(Clone)]
pub struct HttpRequest {
    /// HTTP method (GET, POST).
    pub method: HttpMethod,
    /// Target URL.
    pub url: String,
    /// Request headers.
    pub headers: Vec<(String, String)>,
    /// Optional request body.
    pub body: Option<Vec<u8>>,
    /// Optional transport-level timeout.
    pub timeout: Option<Duration>,
}

impl HttpRequest {
    pub fn get(url: impl Into<String>) -> Self {
        HttpRequest { method: HttpMethod::GET, url: url.into(), headers: Vec::new(), body: None, timeout: None }
    }

    pub fn post_form(url: impl Into<String>, body: Vec<u8>) -> Self {
        HttpRequest {
            method: HttpMethod::POST,
            url: url.into(),
            headers: vec![("Content-Type".to_string(), "application/x-www-form-urlencoded".to_string())],
            body: Some(body),
            timeout: None,
        }
    }

    pub fn header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Case-insensitive header lookup.
    pub fn header_value(&self, name: &str) -> Option<&str> {
        self.headers.iter().find(|(k, _)| k.eq_ignore_ascii_case(name)).map(|(_, v)| v.as_str())
    }

    /// Decoded `application/x-www-form-urlencoded` body pairs.
    pub fn form_pairs(&self) -> Vec<(String, String)> {
        self.body
            .as_deref()
            .map(|b| url::form_urlencoded::parse(b).into_owned().collect())
            .unwrap_or_default()
    }
}

// Requests carry credentials in headers and bodies; only the target is printable.
impl fmt::Debug for HttpRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HttpRequest")
            .field("method", &self.method)
            .field("url", &self.url)
            .field("timeout", &self.timeout)
            .finish_non_exhaustive()
    }
}

/// HTTP response from executing a call.
#[derive(Debug, Clone)]
pub struct HttpResponse {
    /// HTTP status code.
    pub status: u16,
    /// Response headers.
    pub headers: Vec<(String, String)>,
    /// Response body.
    pub body: Vec<u8>,
}

impl HttpResponse {
    pub fn new(status: u16, body: impl Into<Vec<u8>>) -> Self {
        HttpResponse { status, headers: Vec::new(), body: body.into() }
    }

    pub fn json(status: u16, value: &serde_json::Value) -> Self {
        HttpResponse {
            status,
            headers: vec![("Content-Type".to_string(), "application/json".to_string())],
            body: serde_json::to_vec(value).unwrap_or_default(),
        }
    }

    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }
}

/// Error type for HTTP client operations.
pub type HttpClientError = Box<dyn Error + Send + Sync>;

/// Transport used to reach the provider's endpoints.
pub trait OidcHttpClient: Send + Sync + Clone + 'static {
    /// Execute an HTTP request asynchronously.
    fn execute(
        &self,
        request: HttpRequest,
    ) -> Pin<Box<dyn Future<Output = Result<HttpResponse, HttpClientError>> + Send + 'static>>;
}

/// In-memory HTTP client stub for testing. Records every request it serves.
#[derive(Clone, Default)]
pub struct InMemoryHttpClient {
    responses: Arc<DashMap<String, HttpResponse>>,
    default_response: Option<HttpResponse>,
    requests: Arc<DashMap<String, Vec<HttpRequest>>>,
}

impl InMemoryHttpClient {
    /// Creates a new in-memory HTTP client with no default response.
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a new in-memory HTTP client with a default response on miss.
    pub fn with_default(response: HttpResponse) -> Self {
        Self { default_response: Some(response), ..Self::default() }
    }

    /// Register a mock response for a specific URL.
    pub fn insert_response(&self, url: impl Into<String>, response: HttpResponse) {
        self.responses.insert(url.into(), response);
    }

    /// Requests served for `url`, oldest first.
    pub fn requests_to(&self, url: &str) -> Vec<HttpRequest> {
        self.requests.get(url).map(|r| r.value().clone()).unwrap_or_default()
    }

    pub fn call_count(&self, url: &str) -> usize {
        self.requests.get(url).map(|r| r.len()).unwrap_or(0)
    }
}

impl OidcHttpClient for InMemoryHttpClient {
    fn execute(
        &self,
        request: HttpRequest,
    ) -> Pin<Box<dyn Future<Output = Result<HttpResponse, HttpClientError>> + Send + 'static>> {
        let responses = self.responses.clone();
        let default = self.default_response.clone();
        let requests = self.requests.clone();
        Box::pin(async move {
            let url = request.url.clone();
            requests.entry(url.clone()).or_default().push(request);
            if let Some(entry) = responses.get(&url) {
                Ok(entry.value().clone())
            } else if let Some(resp) = default {
                Ok(resp)
            } else {
                Err(format!("no mock response for {}", url).into())
            }
        })
    }
}

/// Production transport backed by a shared `reqwest` connection pool.
#[cfg(feature = "reqwest-client")]
#[derive(Clone)]
pub struct ReqwestHttpClient {
    inner: reqwest::Client,
}

#[cfg(feature = "reqwest-client")]
impl ReqwestHttpClient {
    /// Builds a client that never follows redirects and bounds every call by `timeout`.
    pub fn new(timeout: Duration) -> Result<Self, HttpClientError> {
        let inner = reqwest::Client::builder()
            .redirect(reqwest::redirect::Policy::none())
            .timeout(timeout)
            .build()?;
        Ok(ReqwestHttpClient { inner })
    }

    /// Reuse an existing pool.
    pub fn from_client(inner: reqwest::Client) -> Self {
        ReqwestHttpClient { inner }
    }
}

#[cfg(feature = "reqwest-client")]
impl OidcHttpClient for ReqwestHttpClient {
    fn execute(
        &self,
        request: HttpRequest,
    ) -> Pin<Box<dyn Future<Output = Result<HttpResponse, HttpClientError>> + Send + 'static>> {
        let client = self.inner.clone();
        Box::pin(async move {
            let method = match request.method {
                HttpMethod::GET => reqwest::Method::GET,
                HttpMethod::POST => reqwest::Method::POST,
            };
            let mut builder = client.request(method, &request.url);
            for (name, value) in &request.headers {
                builder = builder.header(name.as_str(), value.as_str());
            }
            if let Some(body) = request.body {
                builder = builder.body(body);
            }
            if let Some(timeout) = request.timeout {
                builder = builder.timeout(timeout);
            }
            let resp = builder.send().await?;
            let status = resp.status().as_u16();
            let headers = resp
                .headers()
                .iter()
                .filter_map(|(k, v)| v.to_str().ok().map(|v| (k.as_str().to_string(), v.to_string())))
                .collect();
            let body = resp.bytes().await?.to_vec();
            Ok(HttpResponse { status, headers, body })
        })
    }
}
