//! Typed async client for the Incus REST API.
//!
//! [`Client`] hands out one [`Collection`] per resource kind. Collections
//! return [`Resource`] snapshots whose action methods either complete
//! immediately or hand back an [`OperationTracker`] for work the server runs
//! in the background.
//!
//! ```no_run
//! use incus_client::{Client, StateOptions};
//!
//! # async fn run() -> incus_client::Result<()> {
//! let client = Client::new("https://incus.example.com:8443")?;
//! let instance = client.instances().get("web01").await?;
//! instance.start(StateOptions::new(), true).await?.into_success()?;
//! # Ok(())
//! # }
//! ```

#![deny(missing_docs)]
#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

pub mod client;
pub mod cluster;
pub mod models;
pub mod operation;
pub mod resource;

#[cfg(test)]
mod test_support;

pub use client::{Client, ClientBuilder, ServerInfo, WeakClient};
pub use cluster::{Cluster, ClusterEndpoint, ClusterMember, ClusterMemberStatus};
pub use models::{
    Certificate, CertificateCreate, ExecOutput, ExecRequest, Image, ImageAlias, ImageCreate,
    ImageSource, Instance, InstanceCreate, InstanceSnapshot, InstanceSource, InstanceState,
    InstanceType, InterfaceAddress, InterfaceState, Network, NetworkCreate, Profile,
    ProfileCreate, Project, ProjectCreate, StateAction, StateOptions, StoragePool,
    StoragePoolCreate, StorageVolume, StorageVolumeCreate,
};
pub use operation::{OperationTracker, Operations, Outcome};
pub use resource::{Collection, Created, ListOptions, Renamable, Resource, ResourceKind};

pub use incus_core::client::{PollPolicy, RetryPolicy};
pub use incus_core::config::IncusClientConfig;
pub use incus_core::transport::{ApiRequest, RawResponse, Transport};
pub use incus_core::{Error, Operation, OperationStatus};

/// Convenient result alias that reuses the shared Incus error type.
pub type Result<T> = incus_core::Result<T>;
