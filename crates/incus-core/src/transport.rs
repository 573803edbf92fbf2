//! Transport abstraction and the reqwest-backed HTTP transport.
//!
//! The transport performs one request against the server and hands back the
//! raw status and body. It never interprets status codes; decoding and error
//! translation happen in [`ApiResponse::decode`] and
//! [`Error::from_response`].

use async_trait::async_trait;
use bytes::Bytes;
use reqwest::header::{HeaderValue, ACCEPT};
use reqwest::{Client, ClientBuilder, Method, StatusCode};
use serde::de::DeserializeOwned;
use serde_json::Value;
use std::fmt;
use std::time::Duration;
use tokio::time::sleep;
use tracing::{debug, info, warn};
use url::Url;

use crate::client::{ClientConfig, RetryPolicy};
use crate::config::IncusClientConfig;
use crate::error::{Error, Result};
use crate::types::ApiResponse;

const USER_AGENT: &str = concat!("incus-rs/", env!("CARGO_PKG_VERSION"));

/// Representation the caller expects in the response body.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ResponseFormat {
    /// A JSON response envelope.
    #[default]
    Json,
    /// Raw bytes (file contents, image exports, exec logs).
    Raw,
}

impl ResponseFormat {
    const fn accept(self) -> &'static str {
        match self {
            Self::Json => "application/json",
            Self::Raw => "application/octet-stream",
        }
    }
}

/// A single request against the Incus API.
#[derive(Debug, Clone, PartialEq)]
pub struct ApiRequest {
    /// HTTP method.
    pub method: Method,
    /// Absolute API path such as `/1.0/instances`.
    pub path: String,
    /// Query parameters.
    pub query: Vec<(&'static str, String)>,
    /// Optional JSON body.
    pub body: Option<Value>,
    /// Expected response representation.
    pub format: ResponseFormat,
    /// Per-request timeout override (long-poll requests).
    pub timeout: Option<Duration>,
    /// Whether transient failures may be retried.
    pub retry: bool,
}

impl ApiRequest {
    /// Create a request with no body or parameters.
    #[must_use]
    pub fn new(method: Method, path: impl Into<String>) -> Self {
        Self {
            method,
            path: path.into(),
            query: Vec::new(),
            body: None,
            format: ResponseFormat::Json,
            timeout: None,
            retry: true,
        }
    }

    /// `GET` request.
    #[must_use]
    pub fn get(path: impl Into<String>) -> Self {
        Self::new(Method::GET, path)
    }

    /// `POST` request with a JSON body.
    #[must_use]
    pub fn post(path: impl Into<String>, body: Value) -> Self {
        Self::new(Method::POST, path).with_body(body)
    }

    /// `PUT` request with a JSON body.
    #[must_use]
    pub fn put(path: impl Into<String>, body: Value) -> Self {
        Self::new(Method::PUT, path).with_body(body)
    }

    /// `PATCH` request with a JSON body.
    #[must_use]
    pub fn patch(path: impl Into<String>, body: Value) -> Self {
        Self::new(Method::PATCH, path).with_body(body)
    }

    /// `DELETE` request.
    #[must_use]
    pub fn delete(path: impl Into<String>) -> Self {
        Self::new(Method::DELETE, path)
    }

    /// Attach a JSON body.
    #[must_use]
    pub fn with_body(mut self, body: Value) -> Self {
        self.body = Some(body);
        self
    }

    /// Append query parameters.
    #[must_use]
    pub fn with_query(mut self, pairs: impl IntoIterator<Item = (&'static str, String)>) -> Self {
        self.query.extend(pairs);
        self
    }

    /// Expect a raw byte response.
    #[must_use]
    pub fn raw(mut self) -> Self {
        self.format = ResponseFormat::Raw;
        self
    }

    /// Override the request timeout.
    #[must_use]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Never retry this request.
    #[must_use]
    pub fn without_retry(mut self) -> Self {
        self.retry = false;
        self
    }

    /// Value of a query parameter, if present.
    #[must_use]
    pub fn query_value(&self, key: &str) -> Option<&str> {
        self.query
            .iter()
            .find(|(k, _)| *k == key)
            .map(|(_, v)| v.as_str())
    }

    fn is_idempotent(&self) -> bool {
        matches!(
            self.method,
            Method::GET | Method::HEAD | Method::PUT | Method::DELETE | Method::OPTIONS
        )
    }
}

/// Status and body returned by the transport.
#[derive(Debug, Clone, PartialEq)]
pub struct RawResponse {
    /// HTTP status code.
    pub status: StatusCode,
    /// Response body.
    pub body: Bytes,
}

impl RawResponse {
    /// Create a response from parts.
    #[must_use]
    pub fn new(status: StatusCode, body: impl Into<Bytes>) -> Self {
        Self {
            status,
            body: body.into(),
        }
    }

    /// Create a JSON response.
    #[must_use]
    pub fn json(status: StatusCode, value: &Value) -> Self {
        Self::new(status, value.to_string())
    }

    /// Decode the body as an Incus response envelope.
    ///
    /// # Errors
    ///
    /// Returns the translated error for non-2xx statuses or a decode error
    /// for malformed envelopes.
    pub fn into_api_response(self) -> Result<ApiResponse> {
        ApiResponse::decode(self.status, &self.body)
    }

    /// Decode a synchronous response and deserialize its metadata.
    ///
    /// # Errors
    ///
    /// See [`RawResponse::into_api_response`] and [`ApiResponse::into_metadata`].
    pub fn into_metadata<T>(self) -> Result<T>
    where
        T: DeserializeOwned,
    {
        self.into_api_response()?.into_metadata()
    }

    /// Return the raw body, translating non-2xx statuses.
    ///
    /// # Errors
    ///
    /// Returns the translated error for non-2xx statuses.
    pub fn into_bytes(self) -> Result<Bytes> {
        if self.status.is_success() {
            Ok(self.body)
        } else {
            Err(Error::from_response(self.status, &self.body))
        }
    }
}

/// Capability to send requests to an Incus server.
///
/// Implementations must be safe to share between concurrently running tasks;
/// connection pooling and socket reuse are the implementation's concern.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Perform a request and return the raw status and body.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Connection`] when the server cannot be reached.
    /// Non-2xx responses are returned, not raised.
    async fn send(&self, request: ApiRequest) -> Result<RawResponse>;

    /// Whether `/1.0/operations/{id}/wait` long-polling may be used.
    fn supports_long_poll(&self) -> bool {
        true
    }
}

/// Builder for [`HttpTransport`].
///
/// The request timeout and retry count of [`IncusClientConfig`] apply unless
/// an explicit [`ClientConfig`] or [`RetryPolicy`] is given.
#[derive(Debug, Clone)]
pub struct HttpTransportBuilder {
    config: IncusClientConfig,
    http_config: Option<ClientConfig>,
    retry_policy: Option<RetryPolicy>,
}

impl HttpTransportBuilder {
    /// Create a new builder from an [`IncusClientConfig`].
    #[must_use]
    pub fn new(config: IncusClientConfig) -> Self {
        Self {
            config,
            http_config: None,
            retry_policy: None,
        }
    }

    /// Override the HTTP client configuration, including its timeout and
    /// retry policy.
    #[must_use]
    pub fn with_http_config(mut self, http_config: ClientConfig) -> Self {
        self.http_config = Some(http_config);
        self
    }

    /// Override the retry policy.
    #[must_use]
    pub fn with_retry_policy(mut self, policy: RetryPolicy) -> Self {
        self.retry_policy = Some(policy);
        self
    }

    /// Finalise the builder and create the transport.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] for invalid endpoints, unreadable CA
    /// certificates or HTTP client construction failures.
    pub fn build(self) -> Result<HttpTransport> {
        let base_url = self.config.parse_endpoint()?;

        let mut http_config = self.http_config.unwrap_or_else(|| {
            ClientConfig::new()
                .with_timeout(self.config.timeout())
                .with_retry_policy(RetryPolicy::new().with_max_retries(self.config.max_retries))
        });
        if let Some(policy) = self.retry_policy {
            http_config.retry_policy = policy;
        }

        let mut builder = ClientBuilder::new()
            .user_agent(USER_AGENT)
            .timeout(http_config.timeout)
            .connect_timeout(http_config.connect_timeout)
            .pool_idle_timeout(http_config.pool_idle_timeout)
            .pool_max_idle_per_host(http_config.pool_max_idle_per_host)
            .gzip(http_config.enable_compression);

        if !self.config.tls_verify {
            warn!(endpoint = %base_url, "TLS verification disabled for Incus client");
            builder = builder.danger_accept_invalid_certs(true);
        }

        if let Some(ca_cert) = &self.config.tls_ca_cert {
            debug!("loading Incus CA certificate from {}", ca_cert.display());
            let bytes = std::fs::read(ca_cert).map_err(|err| {
                Error::Config(format!(
                    "Failed to read CA certificate {}: {err}",
                    ca_cert.display()
                ))
            })?;
            let cert = reqwest::Certificate::from_pem(&bytes)
                .map_err(|err| Error::Config(format!("Invalid CA certificate: {err}")))?;
            builder = builder.add_root_certificate(cert);
        }

        let http = builder
            .build()
            .map_err(|err| Error::Config(format!("Failed to build HTTP client: {err}")))?;

        Ok(HttpTransport {
            http,
            base_url,
            retry_policy: http_config.retry_policy,
        })
    }
}

/// HTTP(S) transport backed by a pooled [`reqwest::Client`].
#[derive(Clone)]
pub struct HttpTransport {
    http: Client,
    base_url: Url,
    retry_policy: RetryPolicy,
}

impl fmt::Debug for HttpTransport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HttpTransport")
            .field("base_url", &self.base_url.as_str())
            .field("retry_policy", &self.retry_policy)
            .finish_non_exhaustive()
    }
}

impl HttpTransport {
    /// Build a transport directly from the configuration.
    ///
    /// # Errors
    ///
    /// See [`HttpTransportBuilder::build`].
    pub fn from_config(config: &IncusClientConfig) -> Result<Self> {
        HttpTransportBuilder::new(config.clone()).build()
    }

    /// Start a builder pre-populated with the provided configuration.
    #[must_use]
    pub fn builder(config: IncusClientConfig) -> HttpTransportBuilder {
        HttpTransportBuilder::new(config)
    }

    /// Return the base URL.
    #[must_use]
    pub fn base_url(&self) -> &Url {
        &self.base_url
    }

    fn build_url(&self, path: &str) -> Result<Url> {
        let normalized = path.trim_start_matches('/');
        self.base_url
            .join(normalized)
            .map_err(|err| Error::InvalidEndpoint(format!("Invalid API path `{path}`: {err}")))
    }

    async fn send_once(&self, request: &ApiRequest, attempt: u32) -> Result<RawResponse> {
        let url = self.build_url(&request.path)?;
        let mut builder = self
            .http
            .request(request.method.clone(), url)
            .query(&request.query)
            .header(ACCEPT, HeaderValue::from_static(request.format.accept()));

        if let Some(body) = &request.body {
            builder = builder.json(body);
        }
        if let Some(timeout) = request.timeout {
            builder = builder.timeout(timeout);
        }

        info!(method = %request.method, path = %request.path, attempt, "Incus request");

        let response = builder.send().await?;
        let status = response.status();
        let body = response.bytes().await?;
        debug!(path = %request.path, status = status.as_u16(), "Incus response");

        Ok(RawResponse { status, body })
    }
}

fn is_retryable_status(status: StatusCode) -> bool {
    matches!(
        status,
        StatusCode::TOO_MANY_REQUESTS
            | StatusCode::BAD_GATEWAY
            | StatusCode::SERVICE_UNAVAILABLE
            | StatusCode::GATEWAY_TIMEOUT
    )
}

#[async_trait]
impl Transport for HttpTransport {
    async fn send(&self, request: ApiRequest) -> Result<RawResponse> {
        let mut attempt = 0;

        loop {
            let result = self.send_once(&request, attempt).await;
            let retryable = match &result {
                Ok(response) => is_retryable_status(response.status),
                Err(err) => err.is_connection(),
            };

            attempt += 1;
            if !retryable
                || !request.retry
                || !request.is_idempotent()
                || attempt > self.retry_policy.max_retries
            {
                return result;
            }

            let delay = self.retry_policy.delay_for_attempt(attempt);
            if delay > Duration::from_millis(0) {
                debug!("Retrying Incus request after {:?}", delay);
                sleep(delay).await;
            }
        }
    }
}
