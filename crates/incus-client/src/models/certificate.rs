//! Trusted client certificates.

use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize, Serializer};
use serde_json::{Map, Value};

use incus_core::Operation;

use crate::resource::ResourceKind;

/// A trusted certificate as returned by `/1.0/certificates/{fingerprint}`.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct Certificate {
    /// SHA-256 fingerprint.
    pub fingerprint: String,
    /// Display name.
    #[serde(default)]
    pub name: String,
    /// `client` or `metrics`.
    #[serde(rename = "type", default)]
    pub certificate_type: String,
    /// PEM-encoded certificate.
    #[serde(default)]
    pub certificate: String,
    /// Whether access is limited to [`Certificate::projects`].
    #[serde(default)]
    pub restricted: bool,
    /// Projects reachable by a restricted certificate.
    #[serde(default, deserialize_with = "crate::models::null_as_default")]
    pub projects: Vec<String>,
    /// Description.
    #[serde(default)]
    pub description: String,
    /// Fields not modelled above.
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl ResourceKind for Certificate {
    type Create = CertificateCreate;

    const PATH: &'static str = "/1.0/certificates";
    const KIND: &'static str = "certificate";
    const PROJECT_SCOPED: bool = false;

    fn key(&self) -> &str {
        &self.fingerprint
    }

    // The fingerprint is computed server-side and not echoed back.
    fn created_key(_request: &CertificateCreate, _operation: Option<&Operation>) -> Option<String> {
        None
    }

    fn is_created(request: &CertificateCreate, candidate: &Self) -> bool {
        match &request.certificate {
            Some(pem) => candidate.certificate.trim() == pem.trim(),
            None => candidate.name == request.name,
        }
    }
}

fn expose_token<S>(token: &Option<SecretString>, serializer: S) -> Result<S::Ok, S::Error>
where
    S: Serializer,
{
    match token {
        Some(token) => serializer.serialize_some(token.expose_secret()),
        None => serializer.serialize_none(),
    }
}

/// Body of `POST /1.0/certificates`.
///
/// Either a PEM certificate is uploaded, or a trust token issued by the
/// server is presented together with the client's own TLS certificate.
#[derive(Debug, Serialize)]
pub struct CertificateCreate {
    /// Display name.
    pub name: String,
    /// PEM-encoded certificate.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub certificate: Option<String>,
    /// Trust token.
    #[serde(
        skip_serializing_if = "Option::is_none",
        serialize_with = "expose_token"
    )]
    pub trust_token: Option<SecretString>,
    /// `client` or `metrics`.
    #[serde(rename = "type")]
    pub certificate_type: String,
    /// Restrict access to [`CertificateCreate::projects`].
    pub restricted: bool,
    /// Projects reachable when restricted.
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub projects: Vec<String>,
    /// Description.
    #[serde(skip_serializing_if = "String::is_empty")]
    pub description: String,
}

impl CertificateCreate {
    fn empty(name: String) -> Self {
        Self {
            name,
            certificate: None,
            trust_token: None,
            certificate_type: "client".to_string(),
            restricted: false,
            projects: Vec::new(),
            description: String::new(),
        }
    }

    /// Trust an uploaded PEM certificate.
    #[must_use]
    pub fn from_pem(name: impl Into<String>, pem: impl Into<String>) -> Self {
        Self {
            certificate: Some(pem.into()),
            ..Self::empty(name.into())
        }
    }

    /// Trust the connecting client by presenting a token.
    #[must_use]
    pub fn from_token(name: impl Into<String>, token: SecretString) -> Self {
        Self {
            trust_token: Some(token),
            ..Self::empty(name.into())
        }
    }

    /// Restrict the certificate to the listed projects.
    #[must_use]
    pub fn restricted_to<I, S>(mut self, projects: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.restricted = true;
        self.projects = projects.into_iter().map(Into::into).collect();
        self
    }

    /// Register a metrics-only certificate.
    #[must_use]
    pub fn metrics(mut self) -> Self {
        self.certificate_type = "metrics".to_string();
        self
    }

    /// Set the description.
    #[must_use]
    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }
}
