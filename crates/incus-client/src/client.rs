//! Client facade owning the transport and handing out collection endpoints.

use bytes::Bytes;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Weak};
use std::time::Duration;
use tracing::debug;
use url::Url;

use incus_core::client::{ClientConfig, PollPolicy, RetryPolicy};
use incus_core::config::IncusClientConfig;
use incus_core::transport::{ApiRequest, HttpTransport, RawResponse, Transport};
use incus_core::types::API_PREFIX;
use incus_core::{ApiResponse, Error};

use crate::cluster::ClusterEndpoint;
use crate::models::{Certificate, Image, Instance, Network, Profile, Project, StoragePool};
use crate::operation::{OperationTracker, Operations, Outcome};
use crate::resource::Collection;
use crate::Result;

/// Server description returned by `GET /1.0`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ServerInfo {
    /// API extensions supported by the server.
    #[serde(default, deserialize_with = "crate::models::null_as_default")]
    pub api_extensions: Vec<String>,
    /// API status (stable, development, ...).
    #[serde(default)]
    pub api_status: String,
    /// API version.
    #[serde(default)]
    pub api_version: String,
    /// Whether the client is trusted.
    #[serde(default)]
    pub auth: String,
    /// Supported authentication methods.
    #[serde(default, deserialize_with = "crate::models::null_as_default")]
    pub auth_methods: Vec<String>,
    /// Whether the server is public.
    #[serde(default)]
    pub public: bool,
    /// Host environment (kernel, storage drivers, server name, ...).
    #[serde(default, deserialize_with = "crate::models::null_as_default")]
    pub environment: Map<String, Value>,
    /// Server configuration.
    #[serde(default, deserialize_with = "crate::models::null_as_default")]
    pub config: HashMap<String, Value>,
    /// Fields not modelled above.
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl ServerInfo {
    /// Returns true when the client certificate is trusted.
    #[must_use]
    pub fn is_trusted(&self) -> bool {
        self.auth == "trusted"
    }

    /// Returns true if the server advertises the named API extension.
    #[must_use]
    pub fn has_extension(&self, extension: &str) -> bool {
        self.api_extensions.iter().any(|ext| ext == extension)
    }

    /// Server name reported in the environment.
    #[must_use]
    pub fn server_name(&self) -> Option<&str> {
        self.environment.get("server_name").and_then(Value::as_str)
    }
}

pub(crate) struct ClientInner {
    transport: Arc<dyn Transport>,
    endpoint: Option<Url>,
    poll_policy: PollPolicy,
    operation_timeout: Option<Duration>,
}

/// Builder for [`Client`].
#[derive(Clone)]
pub struct ClientBuilder {
    config: IncusClientConfig,
    http_config: Option<ClientConfig>,
    retry_policy: Option<RetryPolicy>,
    poll_policy: PollPolicy,
    operation_timeout: Option<Duration>,
    transport: Option<Arc<dyn Transport>>,
}

impl fmt::Debug for ClientBuilder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClientBuilder")
            .field("config", &self.config)
            .field("http_config", &self.http_config)
            .field("retry_policy", &self.retry_policy)
            .field("poll_policy", &self.poll_policy)
            .field("operation_timeout", &self.operation_timeout)
            .field("custom_transport", &self.transport.is_some())
            .finish()
    }
}

impl ClientBuilder {
    /// Create a builder for the specified endpoint.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] if the endpoint is not a valid URL.
    pub fn new(endpoint: impl Into<String>) -> Result<Self> {
        Ok(Self::from_config(IncusClientConfig::new(endpoint)?))
    }

    /// Create a builder from an existing configuration.
    #[must_use]
    pub fn from_config(config: IncusClientConfig) -> Self {
        Self {
            operation_timeout: config.operation_timeout(),
            config,
            http_config: None,
            retry_policy: None,
            poll_policy: PollPolicy::new(),
            transport: None,
        }
    }

    /// Scope project-aware requests to the given project.
    #[must_use]
    pub fn with_project(mut self, project: impl Into<String>) -> Self {
        self.config = self.config.with_project(project);
        self
    }

    /// Override the retry policy, including any set through
    /// [`ClientBuilder::with_http_config`].
    #[must_use]
    pub fn with_retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.retry_policy = Some(retry);
        self
    }

    /// Override the HTTP client configuration. Its timeout and retry policy
    /// replace the values derived from [`IncusClientConfig`].
    #[must_use]
    pub fn with_http_config(mut self, config: ClientConfig) -> Self {
        self.http_config = Some(config);
        self
    }

    /// Override the polling policy used when long-polling is unavailable.
    #[must_use]
    pub fn with_poll_policy(mut self, policy: PollPolicy) -> Self {
        self.poll_policy = policy;
        self
    }

    /// Default bound applied by [`OperationTracker::wait`] when the caller
    /// passes none.
    #[must_use]
    pub fn with_operation_timeout(mut self, timeout: Duration) -> Self {
        self.operation_timeout = Some(timeout);
        self
    }

    /// Use a custom transport instead of HTTPS, e.g. a Unix socket dialer.
    #[must_use]
    pub fn with_transport<T>(mut self, transport: T) -> Self
    where
        T: Transport + 'static,
    {
        self.transport = Some(Arc::new(transport));
        self
    }

    /// Use a shared custom transport.
    #[must_use]
    pub fn with_shared_transport(mut self, transport: Arc<dyn Transport>) -> Self {
        self.transport = Some(transport);
        self
    }

    /// Build the client.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] when the HTTP transport cannot be created.
    pub fn build(self) -> Result<Client> {
        let (transport, endpoint) = match self.transport {
            Some(transport) => (transport, None),
            None => {
                let mut builder = HttpTransport::builder(self.config.clone());
                if let Some(http_config) = self.http_config {
                    builder = builder.with_http_config(http_config);
                }
                if let Some(retry) = self.retry_policy {
                    builder = builder.with_retry_policy(retry);
                }
                let http = builder.build()?;
                let endpoint = http.base_url().clone();
                (Arc::new(http) as Arc<dyn Transport>, Some(endpoint))
            }
        };

        Ok(Client {
            inner: Arc::new(ClientInner {
                transport,
                endpoint,
                poll_policy: self.poll_policy,
                operation_timeout: self.operation_timeout,
            }),
            project: self.config.project.clone(),
        })
    }
}

/// Entry point for talking to an Incus server.
///
/// Cloning is cheap and every clone shares the same transport, as do
/// clients obtained through [`Client::in_project`]. Resource models and
/// operation trackers only hold a [`WeakClient`]; once the last `Client`
/// sharing the transport is dropped it is released and they fail with
/// [`Error::ClientClosed`].
#[derive(Clone)]
pub struct Client {
    inner: Arc<ClientInner>,
    project: Option<String>,
}

impl fmt::Debug for Client {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Client")
            .field("endpoint", &self.inner.endpoint.as_ref().map(Url::as_str))
            .field("project", &self.project)
            .finish_non_exhaustive()
    }
}

impl Client {
    /// Connect to the given HTTPS endpoint with default settings.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] for invalid endpoints.
    pub fn new(endpoint: impl Into<String>) -> Result<Self> {
        ClientBuilder::new(endpoint)?.build()
    }

    /// Connect using a full configuration.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] when the transport cannot be created.
    pub fn from_config(config: IncusClientConfig) -> Result<Self> {
        ClientBuilder::from_config(config).build()
    }

    /// Start a builder for the given endpoint.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] for invalid endpoints.
    pub fn builder(endpoint: impl Into<String>) -> Result<ClientBuilder> {
        ClientBuilder::new(endpoint)
    }

    /// Base URL of the HTTPS transport, `None` for custom transports.
    #[must_use]
    pub fn endpoint(&self) -> Option<&Url> {
        self.inner.endpoint.as_ref()
    }

    /// Project used for project-scoped requests.
    #[must_use]
    pub fn project(&self) -> Option<&str> {
        self.project.as_deref()
    }

    /// A client sharing this transport but scoped to another project.
    #[must_use]
    pub fn in_project(&self, project: impl Into<String>) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
            project: Some(project.into()),
        }
    }

    /// Instances endpoint.
    #[must_use]
    pub fn instances(&self) -> Collection<'_, Instance> {
        Collection::new(self)
    }

    /// Images endpoint.
    #[must_use]
    pub fn images(&self) -> Collection<'_, Image> {
        Collection::new(self)
    }

    /// Networks endpoint.
    #[must_use]
    pub fn networks(&self) -> Collection<'_, Network> {
        Collection::new(self)
    }

    /// Profiles endpoint.
    #[must_use]
    pub fn profiles(&self) -> Collection<'_, Profile> {
        Collection::new(self)
    }

    /// Storage pools endpoint.
    #[must_use]
    pub fn storage_pools(&self) -> Collection<'_, StoragePool> {
        Collection::new(self)
    }

    /// Projects endpoint.
    #[must_use]
    pub fn projects(&self) -> Collection<'_, Project> {
        Collection::new(self)
    }

    /// Trusted certificates endpoint.
    #[must_use]
    pub fn certificates(&self) -> Collection<'_, Certificate> {
        Collection::new(self)
    }

    /// Cluster endpoint.
    #[must_use]
    pub fn cluster(&self) -> ClusterEndpoint<'_> {
        ClusterEndpoint::new(self)
    }

    /// Background operations endpoint.
    #[must_use]
    pub fn operations(&self) -> Operations<'_> {
        Operations::new(self)
    }

    /// Fetch the server description.
    ///
    /// # Errors
    ///
    /// Returns transport or API errors.
    pub async fn server_info(&self) -> Result<ServerInfo> {
        self.get_metadata(ApiRequest::get(API_PREFIX)).await
    }

    /// Fetch the host hardware inventory (`GET /1.0/resources`).
    ///
    /// # Errors
    ///
    /// Returns transport or API errors.
    pub async fn resources(&self) -> Result<Map<String, Value>> {
        self.get_metadata(ApiRequest::get(format!("{API_PREFIX}/resources")))
            .await
    }

    /// Issue an arbitrary request and interpret the response envelope.
    ///
    /// This covers endpoints without a typed wrapper. Asynchronous responses
    /// are waited on when `wait` is set.
    ///
    /// # Errors
    ///
    /// Returns transport, API or wait errors.
    pub async fn execute(&self, request: ApiRequest, wait: bool) -> Result<Outcome> {
        self.dispatch(request, wait).await
    }

    pub(crate) fn downgrade(&self) -> WeakClient {
        WeakClient {
            inner: Arc::downgrade(&self.inner),
            project: self.project.clone(),
        }
    }

    pub(crate) fn poll_policy(&self) -> PollPolicy {
        self.inner.poll_policy
    }

    pub(crate) fn operation_timeout(&self) -> Option<Duration> {
        self.inner.operation_timeout
    }

    pub(crate) fn supports_long_poll(&self) -> bool {
        self.inner.transport.supports_long_poll()
    }

    /// Add `project=` to requests against project-scoped collections.
    pub(crate) fn scoped(&self, request: ApiRequest, project_scoped: bool) -> ApiRequest {
        match (&self.project, project_scoped) {
            (Some(project), true) if request.query_value("project").is_none() => {
                request.with_query([("project", project.clone())])
            }
            _ => request,
        }
    }

    pub(crate) async fn send(&self, request: ApiRequest) -> Result<RawResponse> {
        self.inner.transport.send(request).await
    }

    pub(crate) async fn call(&self, request: ApiRequest) -> Result<ApiResponse> {
        self.send(request).await?.into_api_response()
    }

    pub(crate) async fn get_metadata<T>(&self, request: ApiRequest) -> Result<T>
    where
        T: DeserializeOwned,
    {
        let path = request.path.clone();
        self.call(request).await?.into_metadata().map_err(|err| match err {
            Error::Decode(message) => Error::Decode(format!("{path}: {message}")),
            other => other,
        })
    }

    pub(crate) async fn get_bytes(&self, request: ApiRequest) -> Result<Bytes> {
        self.send(request.raw()).await?.into_bytes()
    }

    /// Send a mutating request and resolve the response into an [`Outcome`].
    pub(crate) async fn dispatch(&self, request: ApiRequest, wait: bool) -> Result<Outcome> {
        debug!(method = %request.method, path = %request.path, wait, "Dispatching Incus action");
        let response = self.call(request).await?;
        if !response.is_async() {
            return Ok(Outcome::Sync(response.metadata));
        }

        let mut tracker = OperationTracker::from_response(self, &response)?;
        if wait {
            let operation = tracker.wait(None).await?;
            Ok(Outcome::Completed(operation))
        } else {
            Ok(Outcome::Pending(tracker))
        }
    }
}

/// Non-owning handle to a [`Client`].
#[derive(Clone, Default)]
pub struct WeakClient {
    inner: Weak<ClientInner>,
    project: Option<String>,
}

impl fmt::Debug for WeakClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WeakClient")
            .field("alive", &(self.inner.strong_count() > 0))
            .field("project", &self.project)
            .finish()
    }
}

impl WeakClient {
    /// Obtain the client if it is still alive.
    ///
    /// # Errors
    ///
    /// Returns [`Error::ClientClosed`] once every [`Client`] has been dropped.
    pub fn upgrade(&self) -> Result<Client> {
        self.inner
            .upgrade()
            .map(|inner| Client {
                inner,
                project: self.project.clone(),
            })
            .ok_or(Error::ClientClosed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{sync_response, MockTransport};
    use serde_json::json;

    #[test]
    fn scoped_adds_project_once() {
        let client = ClientBuilder::from_config(IncusClientConfig::default())
            .with_project("web")
            .with_transport(MockTransport::new())
            .build()
            .unwrap();

        let request = client.scoped(ApiRequest::get("/1.0/instances"), true);
        assert_eq!(request.query_value("project"), Some("web"));

        let request = client.scoped(request, true);
        assert_eq!(request.query.len(), 1);

        let unscoped = client.scoped(ApiRequest::get("/1.0/storage-pools"), false);
        assert!(unscoped.query.is_empty());
    }

    #[test]
    fn weak_client_fails_after_drop() {
        let client = ClientBuilder::from_config(IncusClientConfig::default())
            .with_transport(MockTransport::new())
            .build()
            .unwrap();
        let weak = client.downgrade();
        assert!(weak.upgrade().is_ok());

        drop(client);
        assert!(matches!(weak.upgrade(), Err(Error::ClientClosed)));
    }

    #[test]
    fn in_project_shares_transport() {
        let client = ClientBuilder::from_config(IncusClientConfig::default())
            .with_transport(MockTransport::new())
            .build()
            .unwrap();
        let scoped = client.in_project("dev");

        assert_eq!(client.project(), None);
        assert_eq!(scoped.project(), Some("dev"));
        assert!(Arc::ptr_eq(&client.inner.transport, &scoped.inner.transport));
    }

    #[tokio::test]
    async fn resource_from_scoped_client_outlives_the_scoped_handle() {
        let mut transport = MockTransport::new();
        transport
            .expect_send()
            .withf(|request| request.path == "/1.0/profiles/web")
            .times(2)
            .returning(|request| {
                assert_eq!(request.query_value("project"), Some("dev"));
                Ok(sync_response(json!({"name": "web", "config": {}})))
            });
        let client = ClientBuilder::from_config(IncusClientConfig::default())
            .with_transport(transport)
            .build()
            .unwrap();

        let mut profile = client.in_project("dev").profiles().get("web").await.unwrap();
        profile.refresh().await.unwrap();

        drop(client);
        assert!(matches!(profile.refresh().await, Err(Error::ClientClosed)));
    }

    #[tokio::test]
    async fn server_info_decodes_metadata() {
        let mut transport = MockTransport::new();
        transport
            .expect_send()
            .withf(|request| request.path == "/1.0")
            .times(1)
            .returning(|_| {
                Ok(sync_response(json!({
                    "api_version": "1.0",
                    "api_status": "stable",
                    "auth": "trusted",
                    "api_extensions": ["instances", "projects"],
                    "environment": {"server_name": "node1", "server_version": "6.0.0"},
                    "config": {"core.https_address": ":8443"}
                })))
            });

        let client = ClientBuilder::from_config(IncusClientConfig::default())
            .with_transport(transport)
            .build()
            .unwrap();
        let info = client.server_info().await.unwrap();

        assert!(info.is_trusted());
        assert!(info.has_extension("projects"));
        assert_eq!(info.server_name(), Some("node1"));
        assert_eq!(info.environment["server_version"], "6.0.0");
    }
}
