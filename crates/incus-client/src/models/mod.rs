//! Typed models for each resource kind.
//!
//! Configuration keys and device definitions are relayed verbatim as string
//! maps; fields the models do not name are kept in each type's `extra` map.

use serde::{Deserialize, Deserializer};
use std::collections::HashMap;

pub mod certificate;
pub mod image;
pub mod instance;
pub mod network;
pub mod profile;
pub mod project;
pub mod storage;

/// Configuration map (`limits.cpu` → `"2"`).
pub type Config = HashMap<String, String>;

/// Device map keyed by device name.
pub type Devices = HashMap<String, HashMap<String, String>>;

/// Deserialize an explicit `null` as the type's default.
pub(crate) fn null_as_default<'de, D, T>(deserializer: D) -> Result<T, D::Error>
where
    D: Deserializer<'de>,
    T: Default + Deserialize<'de>,
{
    Ok(Option::<T>::deserialize(deserializer)?.unwrap_or_default())
}

pub use certificate::{Certificate, CertificateCreate};
pub use image::{Image, ImageAlias, ImageCreate, ImageSource};
pub use instance::{
    ExecOutput, ExecRequest, Instance, InstanceCreate, InstanceSnapshot, InstanceSource,
    InstanceState, InstanceType, InterfaceAddress, InterfaceState, StateAction, StateOptions,
};
pub use network::{Network, NetworkCreate};
pub use profile::{Profile, ProfileCreate};
pub use project::{Project, ProjectCreate};
pub use storage::{StoragePool, StoragePoolCreate, StorageVolume, StorageVolumeCreate};
