//! Projects.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use incus_core::transport::ApiRequest;
use incus_core::Operation;

use super::Config;
use crate::resource::{Renamable, Resource, ResourceKind};
use crate::Result;

/// A project as returned by `/1.0/projects/{name}`.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct Project {
    /// Project name.
    pub name: String,
    /// Description.
    #[serde(default)]
    pub description: String,
    /// Project configuration (`features.*`, `limits.*`, ...).
    #[serde(default, deserialize_with = "crate::models::null_as_default")]
    pub config: Config,
    /// URLs of objects in the project.
    #[serde(default, deserialize_with = "crate::models::null_as_default")]
    pub used_by: Vec<String>,
    /// Fields not modelled above.
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl ResourceKind for Project {
    type Create = ProjectCreate;

    const PATH: &'static str = "/1.0/projects";
    const KIND: &'static str = "project";
    const PROJECT_SCOPED: bool = false;

    fn key(&self) -> &str {
        &self.name
    }

    fn created_key(request: &ProjectCreate, _operation: Option<&Operation>) -> Option<String> {
        Some(request.name.clone())
    }
}

impl Renamable for Project {}

/// Body of `POST /1.0/projects`.
#[derive(Debug, Clone, Default, Serialize, PartialEq, Eq)]
pub struct ProjectCreate {
    /// Project name.
    pub name: String,
    /// Description.
    #[serde(skip_serializing_if = "String::is_empty")]
    pub description: String,
    /// Project configuration.
    #[serde(skip_serializing_if = "std::collections::HashMap::is_empty")]
    pub config: Config,
}

impl ProjectCreate {
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
}

impl Resource<Project> {
    /// Resource usage and limits of the project.
    ///
    /// # Errors
    ///
    /// Returns transport or API errors.
    pub async fn state(&self) -> Result<Map<String, Value>> {
        let client = self.client()?;
        client
            .get_metadata(ApiRequest::get(format!("{}/state", self.path())))
            .await
    }
}
