//! Profiles.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::HashMap;

use incus_core::Operation;

use super::{Config, Devices};
use crate::resource::{Renamable, ResourceKind};

/// A profile as returned by `/1.0/profiles/{name}`.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct Profile {
    /// Profile name.
    pub name: String,
    /// Description.
    #[serde(default)]
    pub description: String,
    /// Configuration applied to instances.
    #[serde(default, deserialize_with = "crate::models::null_as_default")]
    pub config: Config,
    /// Devices applied to instances.
    #[serde(default, deserialize_with = "crate::models::null_as_default")]
    pub devices: Devices,
    /// URLs of instances using the profile.
    #[serde(default, deserialize_with = "crate::models::null_as_default")]
    pub used_by: Vec<String>,
    /// Fields not modelled above.
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl ResourceKind for Profile {
    type Create = ProfileCreate;

    const PATH: &'static str = "/1.0/profiles";
    const KIND: &'static str = "profile";
    const PROJECT_SCOPED: bool = true;

    fn key(&self) -> &str {
        &self.name
    }

    fn created_key(request: &ProfileCreate, _operation: Option<&Operation>) -> Option<String> {
        Some(request.name.clone())
    }
}

impl Renamable for Profile {}

/// Body of `POST /1.0/profiles`.
#[derive(Debug, Clone, Default, Serialize, PartialEq, Eq)]
pub struct ProfileCreate {
    /// Profile name.
    pub name: String,
    /// Description.
    #[serde(skip_serializing_if = "String::is_empty")]
    pub description: String,
    /// Configuration.
    #[serde(skip_serializing_if = "HashMap::is_empty")]
    pub config: Config,
    /// Devices.
    #[serde(skip_serializing_if = "HashMap::is_empty")]
    pub devices: Devices,
}

impl ProfileCreate {
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

    /// Set a configuration key.
    #[must_use]
    pub fn with_config(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.config.insert(key.into(), value.into());
        self
    }

    /// Add a device.
    #[must_use]
    pub fn with_device(mut self, name: impl Into<String>, device: HashMap<String, String>) -> Self {
        self.devices.insert(name.into(), device);
        self
    }
}
