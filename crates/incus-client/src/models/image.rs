//! Images and image aliases.

use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use std::collections::HashMap;
use tracing::info;

use incus_core::query::encode_segment;
use incus_core::transport::ApiRequest;
use incus_core::Operation;

use crate::resource::{Collection, Resource, ResourceKind};
use crate::Result;

const ALIASES_PATH: &str = "/1.0/images/aliases";

/// An image as returned by `/1.0/images/{fingerprint}`.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct Image {
    /// SHA-256 fingerprint.
    pub fingerprint: String,
    /// Aliases pointing at this image.
    #[serde(default, deserialize_with = "crate::models::null_as_default")]
    pub aliases: Vec<ImageAlias>,
    /// Architecture name.
    #[serde(default)]
    pub architecture: String,
    /// Size in bytes.
    #[serde(default)]
    pub size: u64,
    /// `container` or `virtual-machine`.
    #[serde(rename = "type", default)]
    pub image_type: String,
    /// Image properties (os, release, description, ...).
    #[serde(default, deserialize_with = "crate::models::null_as_default")]
    pub properties: HashMap<String, String>,
    /// Whether the image is visible to untrusted clients.
    #[serde(default)]
    pub public: bool,
    /// Whether the image is refreshed from its source.
    #[serde(default)]
    pub auto_update: bool,
    /// Whether the image was cached from a remote.
    #[serde(default)]
    pub cached: bool,
    /// Original filename.
    #[serde(default)]
    pub filename: String,
    /// Build timestamp.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created_at: Option<DateTime<Utc>>,
    /// Upload timestamp.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub uploaded_at: Option<DateTime<Utc>>,
    /// Expiry timestamp.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expires_at: Option<DateTime<Utc>>,
    /// Fields not modelled above.
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl Image {
    /// The `description` property, if present.
    #[must_use]
    pub fn description(&self) -> Option<&str> {
        self.properties.get("description").map(String::as_str)
    }

    /// Returns true if an alias with this name points at the image.
    #[must_use]
    pub fn has_alias(&self, name: &str) -> bool {
        self.aliases.iter().any(|alias| alias.name == name)
    }
}

impl ResourceKind for Image {
    type Create = ImageCreate;

    const PATH: &'static str = "/1.0/images";
    const KIND: &'static str = "image";
    const PROJECT_SCOPED: bool = true;

    fn key(&self) -> &str {
        &self.fingerprint
    }

    fn created_key(_request: &ImageCreate, operation: Option<&Operation>) -> Option<String> {
        operation?
            .metadata
            .get("fingerprint")
            .and_then(Value::as_str)
            .map(str::to_string)
    }
}

/// A named pointer to an image.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct ImageAlias {
    /// Alias name.
    pub name: String,
    /// Target fingerprint (empty when embedded in an [`Image`]).
    #[serde(default)]
    pub target: String,
    /// Description.
    #[serde(default)]
    pub description: String,
}

/// Where an imported image comes from.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct ImageSource {
    /// `image` (copy from a server) or `url`.
    #[serde(rename = "type")]
    pub source_type: String,
    /// Transfer mode.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub mode: Option<String>,
    /// Remote server URL.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub server: Option<String>,
    /// Remote server protocol.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub protocol: Option<String>,
    /// Alias on the remote server.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub alias: Option<String>,
    /// Fingerprint on the remote server.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub fingerprint: Option<String>,
    /// Direct download URL.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
}

impl ImageSource {
    /// Copy an image by alias from a simplestreams server.
    #[must_use]
    pub fn remote_alias(server: impl Into<String>, alias: impl Into<String>) -> Self {
        Self {
            source_type: "image".to_string(),
            mode: Some("pull".to_string()),
            server: Some(server.into()),
            protocol: Some("simplestreams".to_string()),
            alias: Some(alias.into()),
            fingerprint: None,
            url: None,
        }
    }

    /// Download an image from a URL.
    #[must_use]
    pub fn url(url: impl Into<String>) -> Self {
        Self {
            source_type: "url".to_string(),
            mode: None,
            server: None,
            protocol: None,
            alias: None,
            fingerprint: None,
            url: Some(url.into()),
        }
    }

    /// Use a different protocol (`incus` for another Incus server).
    #[must_use]
    pub fn with_protocol(mut self, protocol: impl Into<String>) -> Self {
        self.protocol = Some(protocol.into());
        self
    }
}

/// Body of `POST /1.0/images` for imports.
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct ImageCreate {
    /// Import source.
    pub source: ImageSource,
    /// Aliases to create once imported.
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub aliases: Vec<ImageAlias>,
    /// Make the image public.
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    pub public: bool,
    /// Keep the image refreshed from its source.
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    pub auto_update: bool,
    /// Image properties.
    #[serde(skip_serializing_if = "HashMap::is_empty")]
    pub properties: HashMap<String, String>,
}

impl ImageCreate {
    /// Import from `source`.
    #[must_use]
    pub fn new(source: ImageSource) -> Self {
        Self {
            source,
            aliases: Vec::new(),
            public: false,
            auto_update: false,
            properties: HashMap::new(),
        }
    }

    /// Create a local alias for the imported image.
    #[must_use]
    pub fn with_alias(mut self, name: impl Into<String>) -> Self {
        self.aliases.push(ImageAlias {
            name: name.into(),
            ..ImageAlias::default()
        });
        self
    }

    /// Make the image public.
    #[must_use]
    pub fn public(mut self) -> Self {
        self.public = true;
        self
    }

    /// Keep the image refreshed.
    #[must_use]
    pub fn auto_update(mut self) -> Self {
        self.auto_update = true;
        self
    }
}

impl Collection<'_, Image> {
    /// List every alias.
    ///
    /// # Errors
    ///
    /// Returns transport or API errors.
    pub async fn list_aliases(&self) -> Result<Vec<ImageAlias>> {
        let request = self.request(
            ApiRequest::get(ALIASES_PATH).with_query([("recursion", "1".to_string())]),
        );
        let aliases: Option<Vec<ImageAlias>> = self.client().get_metadata(request).await?;
        Ok(aliases.unwrap_or_default())
    }

    /// Fetch one alias.
    ///
    /// # Errors
    ///
    /// Returns [`incus_core::Error::NotFound`] for unknown aliases.
    pub async fn get_alias(&self, name: &str) -> Result<ImageAlias> {
        let request = self.request(ApiRequest::get(alias_path(name)));
        self.client().get_metadata(request).await
    }

    /// Fetch the image an alias points at.
    ///
    /// # Errors
    ///
    /// Returns [`incus_core::Error::NotFound`] for unknown aliases.
    pub async fn get_by_alias(&self, name: &str) -> Result<Resource<Image>> {
        let alias = self.get_alias(name).await?;
        self.get(&alias.target).await
    }

    /// Point a new alias at an image.
    ///
    /// # Errors
    ///
    /// Returns API errors when the alias already exists.
    pub async fn create_alias(&self, name: &str, target: &str, description: &str) -> Result<()> {
        info!(alias = name, target, "Creating image alias");
        let body = json!({"name": name, "target": target, "description": description});
        self.client()
            .call(self.request(ApiRequest::post(ALIASES_PATH, body)))
            .await?;
        Ok(())
    }

    /// Delete an alias. The image is kept.
    ///
    /// # Errors
    ///
    /// Returns [`incus_core::Error::NotFound`] for unknown aliases.
    pub async fn delete_alias(&self, name: &str) -> Result<()> {
        info!(alias = name, "Deleting image alias");
        self.client()
            .call(self.request(ApiRequest::delete(alias_path(name))))
            .await?;
        Ok(())
    }
}

impl Resource<Image> {
    /// Download the image file.
    ///
    /// # Errors
    ///
    /// Returns transport or API errors.
    pub async fn export(&self) -> Result<Bytes> {
        let client = self.client()?;
        let request = client.scoped(ApiRequest::get(format!("{}/export", self.path())), true);
        client.get_bytes(request).await
    }
}

fn alias_path(name: &str) -> String {
    format!("{ALIASES_PATH}/{}", encode_segment(name))
}
