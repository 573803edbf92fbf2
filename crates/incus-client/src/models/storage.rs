//! Storage pools and the volumes inside them.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::info;

use incus_core::query::encode_segment;
use incus_core::transport::ApiRequest;
use incus_core::Operation;

use super::Config;
use crate::operation::Outcome;
use crate::resource::{Resource, ResourceKind};
use crate::Result;

/// A storage pool as returned by `/1.0/storage-pools/{name}`.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct StoragePool {
    /// Pool name.
    pub name: String,
    /// Storage driver (dir, zfs, btrfs, lvm, ceph, ...).
    #[serde(default)]
    pub driver: String,
    /// Description.
    #[serde(default)]
    pub description: String,
    /// Pool configuration.
    #[serde(default, deserialize_with = "crate::models::null_as_default")]
    pub config: Config,
    /// Pool status.
    #[serde(default)]
    pub status: String,
    /// Cluster members the pool is defined on.
    #[serde(default, deserialize_with = "crate::models::null_as_default")]
    pub locations: Vec<String>,
    /// URLs of objects using the pool.
    #[serde(default, deserialize_with = "crate::models::null_as_default")]
    pub used_by: Vec<String>,
    /// Fields not modelled above.
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl ResourceKind for StoragePool {
    type Create = StoragePoolCreate;

    const PATH: &'static str = "/1.0/storage-pools";
    const KIND: &'static str = "storage pool";
    const PROJECT_SCOPED: bool = false;

    fn key(&self) -> &str {
        &self.name
    }

    fn created_key(request: &StoragePoolCreate, _operation: Option<&Operation>) -> Option<String> {
        Some(request.name.clone())
    }
}

/// Body of `POST /1.0/storage-pools`.
#[derive(Debug, Clone, Default, Serialize, PartialEq, Eq)]
pub struct StoragePoolCreate {
    /// Pool name.
    pub name: String,
    /// Storage driver.
    pub driver: String,
    /// Description.
    #[serde(skip_serializing_if = "String::is_empty")]
    pub description: String,
    /// Pool configuration (`source`, `size`, ...).
    #[serde(skip_serializing_if = "std::collections::HashMap::is_empty")]
    pub config: Config,
}

impl StoragePoolCreate {
    /// Create a request for a pool using `driver`.
    #[must_use]
    pub fn new(name: impl Into<String>, driver: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            driver: driver.into(),
            ..Self::default()
        }
    }

    /// Set the description.
    #[must_use]
    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    /// Set a configuration key.
    #[must_use]
    pub fn with_config(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.config.insert(key.into(), value.into());
        self
    }
}

/// A volume inside a storage pool.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct StorageVolume {
    /// Volume name.
    pub name: String,
    /// Volume type (custom, container, virtual-machine, image).
    #[serde(rename = "type", default)]
    pub volume_type: String,
    /// Content type (filesystem, block, iso).
    #[serde(default)]
    pub content_type: String,
    /// Description.
    #[serde(default)]
    pub description: String,
    /// Volume configuration.
    #[serde(default, deserialize_with = "crate::models::null_as_default")]
    pub config: Config,
    /// Cluster member holding the volume.
    #[serde(default)]
    pub location: String,
    /// URLs of objects using the volume.
    #[serde(default, deserialize_with = "crate::models::null_as_default")]
    pub used_by: Vec<String>,
    /// Fields not modelled above.
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// Body of `POST /1.0/storage-pools/{pool}/volumes`.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct StorageVolumeCreate {
    /// Volume name.
    pub name: String,
    /// Volume type, `custom` unless set otherwise.
    #[serde(rename = "type")]
    pub volume_type: String,
    /// Content type.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub content_type: Option<String>,
    /// Description.
    #[serde(skip_serializing_if = "String::is_empty")]
    pub description: String,
    /// Volume configuration.
    #[serde(skip_serializing_if = "std::collections::HashMap::is_empty")]
    pub config: Config,
}

impl StorageVolumeCreate {
    /// Create a custom filesystem volume.
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            volume_type: "custom".to_string(),
            content_type: None,
            description: String::new(),
            config: Config::new(),
        }
    }

    /// Create a block volume instead of a filesystem.
    #[must_use]
    pub fn block(mut self) -> Self {
        self.content_type = Some("block".to_string());
        self
    }

    /// Set the description.
    #[must_use]
    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    /// Set a configuration key.
    #[must_use]
    pub fn with_config(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.config.insert(key.into(), value.into());
        self
    }
}

impl Resource<StoragePool> {
    fn volume_path(&self, volume_type: &str, name: &str) -> String {
        format!(
            "{}/volumes/{}/{}",
            self.path(),
            encode_segment(volume_type),
            encode_segment(name)
        )
    }

    /// List volumes in the pool for the client's project.
    ///
    /// # Errors
    ///
    /// Returns transport or API errors.
    pub async fn volumes(&self) -> Result<Vec<StorageVolume>> {
        let client = self.client()?;
        let request = client.scoped(
            ApiRequest::get(format!("{}/volumes", self.path()))
                .with_query([("recursion", "1".to_string())]),
            true,
        );
        let volumes: Option<Vec<StorageVolume>> = client.get_metadata(request).await?;
        Ok(volumes.unwrap_or_default())
    }

    /// Fetch one volume.
    ///
    /// # Errors
    ///
    /// Returns [`incus_core::Error::NotFound`] for unknown volumes.
    pub async fn get_volume(&self, volume_type: &str, name: &str) -> Result<StorageVolume> {
        let client = self.client()?;
        let request = client.scoped(ApiRequest::get(self.volume_path(volume_type, name)), true);
        client.get_metadata(request).await
    }

    /// Create a volume.
    ///
    /// # Errors
    ///
    /// Returns transport, API or wait errors.
    pub async fn create_volume(&self, volume: &StorageVolumeCreate, wait: bool) -> Result<Outcome> {
        let client = self.client()?;
        info!(pool = %self.name, volume = %volume.name, "Creating storage volume");
        let request = client.scoped(
            ApiRequest::post(format!("{}/volumes", self.path()), serde_json::to_value(volume)?),
            true,
        );
        client.dispatch(request, wait).await
    }

    /// Delete a volume.
    ///
    /// # Errors
    ///
    /// Returns [`incus_core::Error::NotFound`] for unknown volumes.
    pub async fn delete_volume(&self, volume_type: &str, name: &str, wait: bool) -> Result<Outcome> {
        let client = self.client()?;
        info!(pool = %self.name, volume = name, "Deleting storage volume");
        let request = client.scoped(ApiRequest::delete(self.volume_path(volume_type, name)), true);
        client.dispatch(request, wait).await
    }
}
