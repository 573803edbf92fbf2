//! Instances (containers and virtual machines) and their actions.

use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use std::collections::HashMap;
use std::fmt;
use tracing::info;

use incus_core::query::encode_segment;
use incus_core::transport::ApiRequest;
use incus_core::Operation;

use super::{Config, Devices};
use crate::operation::Outcome;
use crate::resource::{Renamable, Resource, ResourceKind};
use crate::Result;

/// An instance as returned by `/1.0/instances/{name}`.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct Instance {
    /// Instance name.
    pub name: String,
    /// `container` or `virtual-machine`.
    #[serde(rename = "type", default)]
    pub instance_type: String,
    /// Human readable status (Running, Stopped, Frozen, ...).
    #[serde(default)]
    pub status: String,
    /// Numeric status.
    #[serde(default)]
    pub status_code: u16,
    /// Architecture name.
    #[serde(default)]
    pub architecture: String,
    /// Description.
    #[serde(default)]
    pub description: String,
    /// Local configuration.
    #[serde(default, deserialize_with = "crate::models::null_as_default")]
    pub config: Config,
    /// Local devices.
    #[serde(default, deserialize_with = "crate::models::null_as_default")]
    pub devices: Devices,
    /// Configuration after applying profiles.
    #[serde(default, deserialize_with = "crate::models::null_as_default")]
    pub expanded_config: Config,
    /// Devices after applying profiles.
    #[serde(default, deserialize_with = "crate::models::null_as_default")]
    pub expanded_devices: Devices,
    /// Applied profiles, in order.
    #[serde(default, deserialize_with = "crate::models::null_as_default")]
    pub profiles: Vec<String>,
    /// Whether the instance is destroyed on shutdown.
    #[serde(default)]
    pub ephemeral: bool,
    /// Whether the instance has stateful snapshots.
    #[serde(default)]
    pub stateful: bool,
    /// Cluster member hosting the instance.
    #[serde(default)]
    pub location: String,
    /// Project the instance belongs to.
    #[serde(default)]
    pub project: String,
    /// Creation timestamp.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created_at: Option<DateTime<Utc>>,
    /// Last start timestamp.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_used_at: Option<DateTime<Utc>>,
    /// Fields not modelled above.
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl Instance {
    /// Returns true if the instance is running.
    #[must_use]
    pub fn is_running(&self) -> bool {
        self.status.eq_ignore_ascii_case("running")
    }

    /// Returns true for virtual machines.
    #[must_use]
    pub fn is_virtual_machine(&self) -> bool {
        self.instance_type == InstanceType::VirtualMachine.as_str()
    }
}

impl ResourceKind for Instance {
    type Create = InstanceCreate;

    const PATH: &'static str = "/1.0/instances";
    const KIND: &'static str = "instance";
    const PROJECT_SCOPED: bool = true;

    fn key(&self) -> &str {
        &self.name
    }

    fn created_key(request: &InstanceCreate, _operation: Option<&Operation>) -> Option<String> {
        Some(request.name.clone())
    }
}

impl Renamable for Instance {}

/// Instance flavour.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum InstanceType {
    /// System container.
    Container,
    /// Virtual machine.
    VirtualMachine,
}

impl InstanceType {
    /// Wire name of the type.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Container => "container",
            Self::VirtualMachine => "virtual-machine",
        }
    }
}

/// Where a new instance's root filesystem comes from.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct InstanceSource {
    /// Source type (`image`, `none`, `copy`, ...).
    #[serde(rename = "type")]
    pub source_type: String,
    /// Image alias.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub alias: Option<String>,
    /// Image fingerprint.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub fingerprint: Option<String>,
    /// Remote image server.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub server: Option<String>,
    /// Remote server protocol (`simplestreams`, `incus`).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub protocol: Option<String>,
    /// Source instance for copies.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub source: Option<String>,
}

impl InstanceSource {
    /// An empty instance with no root filesystem.
    #[must_use]
    pub fn none() -> Self {
        Self {
            source_type: "none".to_string(),
            alias: None,
            fingerprint: None,
            server: None,
            protocol: None,
            source: None,
        }
    }

    /// A local or remote image referenced by alias.
    #[must_use]
    pub fn image_alias(alias: impl Into<String>) -> Self {
        Self {
            source_type: "image".to_string(),
            alias: Some(alias.into()),
            ..Self::none()
        }
    }

    /// A local image referenced by fingerprint.
    #[must_use]
    pub fn image_fingerprint(fingerprint: impl Into<String>) -> Self {
        Self {
            source_type: "image".to_string(),
            fingerprint: Some(fingerprint.into()),
            ..Self::none()
        }
    }

    /// A copy of an existing instance.
    #[must_use]
    pub fn copy_of(instance: impl Into<String>) -> Self {
        Self {
            source_type: "copy".to_string(),
            source: Some(instance.into()),
            ..Self::none()
        }
    }

    /// Pull the image from a remote server.
    #[must_use]
    pub fn from_server(mut self, server: impl Into<String>, protocol: impl Into<String>) -> Self {
        self.server = Some(server.into());
        self.protocol = Some(protocol.into());
        self
    }
}

impl Default for InstanceSource {
    fn default() -> Self {
        Self::none()
    }
}

/// Body of `POST /1.0/instances`.
#[derive(Debug, Clone, Default, Serialize, PartialEq)]
pub struct InstanceCreate {
    /// Instance name.
    pub name: String,
    /// Root filesystem source.
    pub source: InstanceSource,
    /// Instance configuration.
    #[serde(skip_serializing_if = "HashMap::is_empty")]
    pub config: Config,
    /// Instance devices.
    #[serde(skip_serializing_if = "HashMap::is_empty")]
    pub devices: Devices,
    /// Profiles to apply; `None` lets the server apply `default`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub profiles: Option<Vec<String>>,
    /// Instance type.
    #[serde(rename = "type", skip_serializing_if = "Option::is_none")]
    pub instance_type: Option<InstanceType>,
    /// Destroy on shutdown.
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    pub ephemeral: bool,
    /// Start the instance once created.
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    pub start: bool,
    /// Description.
    #[serde(skip_serializing_if = "String::is_empty")]
    pub description: String,
}

impl InstanceCreate {
    /// Create a request for the given name and source.
    #[must_use]
    pub fn new(name: impl Into<String>, source: InstanceSource) -> Self {
        Self {
            name: name.into(),
            source,
            ..Self::default()
        }
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

    /// Set the profiles to apply.
    #[must_use]
    pub fn with_profiles<I, S>(mut self, profiles: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.profiles = Some(profiles.into_iter().map(Into::into).collect());
        self
    }

    /// Set the instance type.
    #[must_use]
    pub fn with_type(mut self, instance_type: InstanceType) -> Self {
        self.instance_type = Some(instance_type);
        self
    }

    /// Mark the instance as ephemeral.
    #[must_use]
    pub fn ephemeral(mut self) -> Self {
        self.ephemeral = true;
        self
    }

    /// Start the instance after creation.
    #[must_use]
    pub fn started(mut self) -> Self {
        self.start = true;
        self
    }

    /// Set the description.
    #[must_use]
    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }
}

/// Action accepted by `PUT /1.0/instances/{name}/state`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StateAction {
    /// Start the instance.
    Start,
    /// Stop the instance.
    Stop,
    /// Restart the instance.
    Restart,
    /// Freeze all processes.
    Freeze,
    /// Resume frozen processes.
    Unfreeze,
}

impl StateAction {
    /// Wire name of the action.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Start => "start",
            Self::Stop => "stop",
            Self::Restart => "restart",
            Self::Freeze => "freeze",
            Self::Unfreeze => "unfreeze",
        }
    }
}

impl fmt::Display for StateAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Options for state changes.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StateOptions {
    /// Seconds the server waits for a clean shutdown.
    pub timeout: Option<u32>,
    /// Force the change (kill instead of shutdown).
    pub force: bool,
    /// Save or restore runtime state.
    pub stateful: bool,
}

impl StateOptions {
    /// Default options.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            timeout: None,
            force: false,
            stateful: false,
        }
    }

    /// Set the shutdown timeout in seconds.
    #[must_use]
    pub const fn with_timeout(mut self, seconds: u32) -> Self {
        self.timeout = Some(seconds);
        self
    }

    /// Force the change.
    #[must_use]
    pub const fn forced(mut self) -> Self {
        self.force = true;
        self
    }

    /// Save or restore runtime state.
    #[must_use]
    pub const fn stateful(mut self) -> Self {
        self.stateful = true;
        self
    }

    fn body(self, action: StateAction) -> Value {
        let mut body = json!({
            "action": action.as_str(),
            "force": self.force,
            "stateful": self.stateful,
        });
        if let Some(timeout) = self.timeout {
            body["timeout"] = json!(timeout);
        }
        body
    }
}

/// Runtime state from `GET /1.0/instances/{name}/state`.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct InstanceState {
    /// Human readable status.
    #[serde(default)]
    pub status: String,
    /// Numeric status.
    #[serde(default)]
    pub status_code: u16,
    /// Init process ID.
    #[serde(default)]
    pub pid: i64,
    /// Number of processes.
    #[serde(default)]
    pub processes: i64,
    /// Network interfaces by name.
    #[serde(default)]
    pub network: Option<HashMap<String, InterfaceState>>,
    /// Fields not modelled above (cpu, memory, disk, ...).
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl InstanceState {
    /// Global addresses of every interface except loopback.
    #[must_use]
    pub fn addresses(&self) -> Vec<&str> {
        let mut addresses: Vec<&str> = self
            .network
            .iter()
            .flatten()
            .filter(|(name, _)| name.as_str() != "lo")
            .flat_map(|(_, iface)| iface.addresses.iter())
            .filter(|address| address.scope == "global")
            .map(|address| address.address.as_str())
            .collect();
        addresses.sort_unstable();
        addresses
    }
}

/// State of one network interface.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct InterfaceState {
    /// Configured addresses.
    #[serde(default, deserialize_with = "crate::models::null_as_default")]
    pub addresses: Vec<InterfaceAddress>,
    /// MAC address.
    #[serde(default)]
    pub hwaddr: String,
    /// Link state (up, down).
    #[serde(default)]
    pub state: String,
    /// Fields not modelled above.
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// An address assigned to an interface.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct InterfaceAddress {
    /// `inet` or `inet6`.
    #[serde(default)]
    pub family: String,
    /// Address.
    #[serde(default)]
    pub address: String,
    /// Prefix length.
    #[serde(default)]
    pub netmask: String,
    /// `global`, `link` or `local`.
    #[serde(default)]
    pub scope: String,
}

/// Body of `POST /1.0/instances/{name}/exec`.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct ExecRequest {
    /// Command and arguments.
    pub command: Vec<String>,
    /// Extra environment variables.
    #[serde(skip_serializing_if = "HashMap::is_empty")]
    pub environment: HashMap<String, String>,
    /// Wait for websocket connections before starting.
    #[serde(rename = "wait-for-websocket")]
    pub wait_for_websocket: bool,
    /// Record stdout/stderr to log files.
    #[serde(rename = "record-output")]
    pub record_output: bool,
    /// Allocate a terminal.
    pub interactive: bool,
    /// Working directory.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cwd: Option<String>,
    /// User ID to run as.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user: Option<u32>,
    /// Group ID to run as.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub group: Option<u32>,
}

impl ExecRequest {
    /// Run `command` non-interactively with output recording.
    #[must_use]
    pub fn new<I, S>(command: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            command: command.into_iter().map(Into::into).collect(),
            environment: HashMap::new(),
            wait_for_websocket: false,
            record_output: true,
            interactive: false,
            cwd: None,
            user: None,
            group: None,
        }
    }

    /// Set an environment variable.
    #[must_use]
    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.environment.insert(key.into(), value.into());
        self
    }

    /// Set the working directory.
    #[must_use]
    pub fn with_cwd(mut self, cwd: impl Into<String>) -> Self {
        self.cwd = Some(cwd.into());
        self
    }

    /// Run as the given user and group.
    #[must_use]
    pub fn as_user(mut self, user: u32, group: u32) -> Self {
        self.user = Some(user);
        self.group = Some(group);
        self
    }

    /// Do not record output.
    #[must_use]
    pub fn without_recording(mut self) -> Self {
        self.record_output = false;
        self
    }
}

/// Recorded result of a finished exec operation.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExecOutput {
    /// Exit status of the command.
    pub return_code: Option<i64>,
    /// Recorded stdout.
    pub stdout: Bytes,
    /// Recorded stderr.
    pub stderr: Bytes,
}

impl ExecOutput {
    /// Stdout decoded as UTF-8, replacing invalid sequences.
    #[must_use]
    pub fn stdout_text(&self) -> String {
        String::from_utf8_lossy(&self.stdout).into_owned()
    }

    /// Stderr decoded as UTF-8, replacing invalid sequences.
    #[must_use]
    pub fn stderr_text(&self) -> String {
        String::from_utf8_lossy(&self.stderr).into_owned()
    }
}

/// A snapshot of an instance.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct InstanceSnapshot {
    /// Snapshot name (without the instance prefix).
    pub name: String,
    /// Whether runtime state was saved.
    #[serde(default)]
    pub stateful: bool,
    /// Configuration at snapshot time.
    #[serde(default, deserialize_with = "crate::models::null_as_default")]
    pub config: Config,
    /// Devices at snapshot time.
    #[serde(default, deserialize_with = "crate::models::null_as_default")]
    pub devices: Devices,
    /// Creation timestamp.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created_at: Option<DateTime<Utc>>,
    /// Expiry timestamp.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expires_at: Option<DateTime<Utc>>,
    /// Fields not modelled above.
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl Resource<Instance> {
    /// Change the runtime state.
    ///
    /// # Errors
    ///
    /// Returns transport, API or wait errors.
    pub async fn change_state(
        &self,
        action: StateAction,
        options: StateOptions,
        wait: bool,
    ) -> Result<Outcome> {
        let client = self.client()?;
        info!(instance = %self.name, %action, "Changing instance state");
        let request = client.scoped(
            ApiRequest::put(format!("{}/state", self.path()), options.body(action)),
            true,
        );
        client.dispatch(request, wait).await
    }

    /// Start the instance.
    ///
    /// # Errors
    ///
    /// See [`Resource::change_state`].
    pub async fn start(&self, options: StateOptions, wait: bool) -> Result<Outcome> {
        self.change_state(StateAction::Start, options, wait).await
    }

    /// Stop the instance.
    ///
    /// # Errors
    ///
    /// See [`Resource::change_state`].
    pub async fn stop(&self, options: StateOptions, wait: bool) -> Result<Outcome> {
        self.change_state(StateAction::Stop, options, wait).await
    }

    /// Restart the instance.
    ///
    /// # Errors
    ///
    /// See [`Resource::change_state`].
    pub async fn restart(&self, options: StateOptions, wait: bool) -> Result<Outcome> {
        self.change_state(StateAction::Restart, options, wait).await
    }

    /// Freeze the instance.
    ///
    /// # Errors
    ///
    /// See [`Resource::change_state`].
    pub async fn freeze(&self, wait: bool) -> Result<Outcome> {
        self.change_state(StateAction::Freeze, StateOptions::new(), wait)
            .await
    }

    /// Unfreeze the instance.
    ///
    /// # Errors
    ///
    /// See [`Resource::change_state`].
    pub async fn unfreeze(&self, wait: bool) -> Result<Outcome> {
        self.change_state(StateAction::Unfreeze, StateOptions::new(), wait)
            .await
    }

    /// Fetch the runtime state.
    ///
    /// # Errors
    ///
    /// Returns transport or API errors.
    pub async fn state(&self) -> Result<InstanceState> {
        let client = self.client()?;
        let request = client.scoped(ApiRequest::get(format!("{}/state", self.path())), true);
        client.get_metadata(request).await
    }

    /// Run a command inside the instance.
    ///
    /// With `wait` set the returned [`Outcome::Completed`] operation carries
    /// the exit status; pass it to [`Resource::exec_output`] to read recorded
    /// output.
    ///
    /// # Errors
    ///
    /// Returns transport, API or wait errors.
    pub async fn execute(&self, exec: &ExecRequest, wait: bool) -> Result<Outcome> {
        let client = self.client()?;
        info!(instance = %self.name, command = ?exec.command, "Executing command");
        let request = client.scoped(
            ApiRequest::post(format!("{}/exec", self.path()), serde_json::to_value(exec)?),
            true,
        );
        client.dispatch(request, wait).await
    }

    /// Read the output recorded by a finished exec operation.
    ///
    /// # Errors
    ///
    /// Returns transport or API errors while reading the log files.
    pub async fn exec_output(&self, operation: &Operation) -> Result<ExecOutput> {
        let client = self.client()?;
        let log = |fd: &str| {
            operation
                .metadata
                .get("output")
                .and_then(|output| output.get(fd))
                .and_then(Value::as_str)
                .map(str::to_string)
        };

        let mut output = ExecOutput {
            return_code: operation.metadata.get("return").and_then(Value::as_i64),
            ..ExecOutput::default()
        };
        if let Some(path) = log("1") {
            output.stdout = client
                .get_bytes(client.scoped(ApiRequest::get(path), true))
                .await?;
        }
        if let Some(path) = log("2") {
            output.stderr = client
                .get_bytes(client.scoped(ApiRequest::get(path), true))
                .await?;
        }
        Ok(output)
    }

    /// List snapshots.
    ///
    /// # Errors
    ///
    /// Returns transport or API errors.
    pub async fn snapshots(&self) -> Result<Vec<InstanceSnapshot>> {
        let client = self.client()?;
        let request = client.scoped(
            ApiRequest::get(format!("{}/snapshots", self.path()))
                .with_query([("recursion", "1".to_string())]),
            true,
        );
        let snapshots: Option<Vec<InstanceSnapshot>> = client.get_metadata(request).await?;
        Ok(snapshots.unwrap_or_default())
    }

    /// Create a snapshot.
    ///
    /// # Errors
    ///
    /// Returns transport, API or wait errors.
    pub async fn create_snapshot(&self, name: &str, stateful: bool, wait: bool) -> Result<Outcome> {
        let client = self.client()?;
        info!(instance = %self.name, snapshot = name, "Creating snapshot");
        let request = client.scoped(
            ApiRequest::post(
                format!("{}/snapshots", self.path()),
                json!({"name": name, "stateful": stateful}),
            ),
            true,
        );
        client.dispatch(request, wait).await
    }

    /// Delete a snapshot.
    ///
    /// # Errors
    ///
    /// Returns [`incus_core::Error::NotFound`] for unknown snapshots.
    pub async fn delete_snapshot(&self, name: &str, wait: bool) -> Result<Outcome> {
        let client = self.client()?;
        info!(instance = %self.name, snapshot = name, "Deleting snapshot");
        let request = client.scoped(
            ApiRequest::delete(format!("{}/snapshots/{}", self.path(), encode_segment(name))),
            true,
        );
        client.dispatch(request, wait).await
    }

    /// Read a file from the instance.
    ///
    /// # Errors
    ///
    /// Returns [`incus_core::Error::NotFound`] for missing files.
    pub async fn pull_file(&self, path: &str) -> Result<Bytes> {
        let client = self.client()?;
        let request = client.scoped(
            ApiRequest::get(format!("{}/files", self.path()))
                .with_query([("path", path.to_string())]),
            true,
        );
        client.get_bytes(request).await
    }
}
