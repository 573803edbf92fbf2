//! Cluster membership.

use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use std::fmt;
use tracing::info;

use incus_core::query::encode_segment;
use incus_core::transport::ApiRequest;

use crate::client::Client;
use crate::models::Config;
use crate::operation::Outcome;
use crate::Result;

const CLUSTER_PATH: &str = "/1.0/cluster";
const MEMBERS_PATH: &str = "/1.0/cluster/members";

/// Health of a cluster member.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ClusterMemberStatus {
    /// Member is reachable.
    Online,
    /// Member has stopped answering heartbeats.
    Offline,
    /// Workloads were moved off the member.
    Evacuated,
    /// Member is blocked from joining (version mismatch).
    Blocked,
    /// Any status this client does not know about.
    #[default]
    #[serde(other)]
    Unknown,
}

impl fmt::Display for ClusterMemberStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Online => "Online",
            Self::Offline => "Offline",
            Self::Evacuated => "Evacuated",
            Self::Blocked => "Blocked",
            Self::Unknown => "Unknown",
        };
        f.write_str(name)
    }
}

/// One member of a cluster.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct ClusterMember {
    /// Member name.
    pub server_name: String,
    /// API URL of the member.
    #[serde(default)]
    pub url: String,
    /// Whether the member is a database node.
    #[serde(default)]
    pub database: bool,
    /// Health status.
    #[serde(default)]
    pub status: ClusterMemberStatus,
    /// Human-readable detail for the status.
    #[serde(default)]
    pub message: String,
    /// Architecture name.
    #[serde(default)]
    pub architecture: String,
    /// Assigned roles (database, event-hub, ...).
    #[serde(default, deserialize_with = "crate::models::null_as_default")]
    pub roles: Vec<String>,
    /// Failure domain.
    #[serde(default)]
    pub failure_domain: String,
    /// Description.
    #[serde(default)]
    pub description: String,
    /// Member configuration.
    #[serde(default, deserialize_with = "crate::models::null_as_default")]
    pub config: Config,
    /// Fields not modelled above.
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl ClusterMember {
    /// Returns true if the member is online.
    #[must_use]
    pub fn is_online(&self) -> bool {
        self.status == ClusterMemberStatus::Online
    }
}

/// Cluster description with its members.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Cluster {
    /// Name of the member that answered.
    pub server_name: String,
    /// Whether clustering is enabled.
    pub enabled: bool,
    /// Members, empty on standalone servers.
    pub members: Vec<ClusterMember>,
}

#[derive(Deserialize)]
struct ClusterInfo {
    #[serde(default)]
    server_name: String,
    #[serde(default)]
    enabled: bool,
}

/// Endpoint for `/1.0/cluster`.
#[derive(Debug, Clone, Copy)]
pub struct ClusterEndpoint<'a> {
    client: &'a Client,
}

impl<'a> ClusterEndpoint<'a> {
    pub(crate) fn new(client: &'a Client) -> Self {
        Self { client }
    }

    /// Fetch the cluster description, including members when enabled.
    ///
    /// # Errors
    ///
    /// Returns transport or API errors.
    pub async fn get(&self) -> Result<Cluster> {
        let info: ClusterInfo = self.client.get_metadata(ApiRequest::get(CLUSTER_PATH)).await?;
        let members = if info.enabled {
            self.members().await?
        } else {
            Vec::new()
        };

        Ok(Cluster {
            server_name: info.server_name,
            enabled: info.enabled,
            members,
        })
    }

    /// List cluster members.
    ///
    /// # Errors
    ///
    /// Returns transport or API errors.
    pub async fn members(&self) -> Result<Vec<ClusterMember>> {
        let request = ApiRequest::get(MEMBERS_PATH).with_query([("recursion", "1".to_string())]);
        let members: Option<Vec<ClusterMember>> = self.client.get_metadata(request).await?;
        Ok(members.unwrap_or_default())
    }

    /// Fetch one member.
    ///
    /// # Errors
    ///
    /// Returns [`incus_core::Error::NotFound`] for unknown members.
    pub async fn get_member(&self, name: &str) -> Result<ClusterMember> {
        self.client
            .get_metadata(ApiRequest::get(member_path(name)))
            .await
    }

    /// Move workloads off a member.
    ///
    /// # Errors
    ///
    /// Returns transport, API or wait errors.
    pub async fn evacuate_member(&self, name: &str, wait: bool) -> Result<Outcome> {
        self.change_member_state(name, "evacuate", wait).await
    }

    /// Bring an evacuated member back into service.
    ///
    /// # Errors
    ///
    /// Returns transport, API or wait errors.
    pub async fn restore_member(&self, name: &str, wait: bool) -> Result<Outcome> {
        self.change_member_state(name, "restore", wait).await
    }

    async fn change_member_state(&self, name: &str, action: &str, wait: bool) -> Result<Outcome> {
        info!(member = name, action, "Changing cluster member state");
        let request = ApiRequest::post(
            format!("{}/state", member_path(name)),
            json!({ "action": action }),
        );
        self.client.dispatch(request, wait).await
    }
}

fn member_path(name: &str) -> String {
    format!("{MEMBERS_PATH}/{}", encode_segment(name))
}
