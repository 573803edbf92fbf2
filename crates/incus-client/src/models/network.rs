//! Networks.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use incus_core::transport::ApiRequest;
use incus_core::Operation;

use super::Config;
use crate::resource::{Renamable, Resource, ResourceKind};
use crate::Result;

/// A network as returned by `/1.0/networks/{name}`.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct Network {
    /// Network name.
    pub name: String,
    /// Description.
    #[serde(default)]
    pub description: String,
    /// Network type (bridge, macvlan, ovn, physical, ...).
    #[serde(rename = "type", default)]
    pub network_type: String,
    /// Whether the network is managed by Incus.
    #[serde(default)]
    pub managed: bool,
    /// Network status (Created, Pending, Errored, ...).
    #[serde(default)]
    pub status: String,
    /// Network configuration.
    #[serde(default, deserialize_with = "crate::models::null_as_default")]
    pub config: Config,
    /// URLs of objects using the network.
    #[serde(default, deserialize_with = "crate::models::null_as_default")]
    pub used_by: Vec<String>,
    /// Cluster members the network is defined on.
    #[serde(default, deserialize_with = "crate::models::null_as_default")]
    pub locations: Vec<String>,
    /// Fields not modelled above.
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl ResourceKind for Network {
    type Create = NetworkCreate;

    const PATH: &'static str = "/1.0/networks";
    const KIND: &'static str = "network";
    const PROJECT_SCOPED: bool = true;

    fn key(&self) -> &str {
        &self.name
    }

    fn created_key(request: &NetworkCreate, _operation: Option<&Operation>) -> Option<String> {
        Some(request.name.clone())
    }
}

impl Renamable for Network {}

/// Body of `POST /1.0/networks`.
#[derive(Debug, Clone, Default, Serialize, PartialEq, Eq)]
pub struct NetworkCreate {
    /// Network name.
    pub name: String,
    /// Description.
    #[serde(skip_serializing_if = "String::is_empty")]
    pub description: String,
    /// Network type; the server defaults to `bridge`.
    #[serde(rename = "type", skip_serializing_if = "Option::is_none")]
    pub network_type: Option<String>,
    /// Network configuration.
    #[serde(skip_serializing_if = "std::collections::HashMap::is_empty")]
    pub config: Config,
}

impl NetworkCreate {
    /// Create a request for the given name.
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Self::default()
        }
    }

    /// Set the description.
    #[must_use]
    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    /// Set the network type.
    #[must_use]
    pub fn with_type(mut self, network_type: impl Into<String>) -> Self {
        self.network_type = Some(network_type.into());
        self
    }

    /// Set a configuration key.
    #[must_use]
    pub fn with_config(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.config.insert(key.into(), value.into());
        self
    }
}

impl Resource<Network> {
    /// Runtime state of the network (addresses, counters, bond/bridge info).
    ///
    /// # Errors
    ///
    /// Returns transport or API errors.
    pub async fn state(&self) -> Result<Map<String, Value>> {
        let client = self.client()?;
        let request = client.scoped(ApiRequest::get(format!("{}/state", self.path())), true);
        client.get_metadata(request).await
    }
}
